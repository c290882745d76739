//! Whole-store export and validated import for backups and the dashboard.

use relay_store::{RequestKind, Session, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::HostError;
use crate::identity::short_id;
use crate::metrics::{Health, PerformanceMetrics, Reporter, SessionStats};
use crate::registry::SessionRegistry;
use crate::scheduler::Scheduler;

pub const EXPORT_VERSION: &str = "relay-export/1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub version: String,
    pub exported_at: Timestamp,
    pub total_sessions: usize,
    pub health: Health,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfiguration {
    pub kinds: Vec<RequestKind>,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub min_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub metadata: ExportMetadata,
    pub sessions: Vec<(String, Session)>,
    pub statistics: SessionStats,
    pub performance: PerformanceMetrics,
    pub configuration: ExportConfiguration,
}

pub fn export(registry: &SessionRegistry, scheduler: &Scheduler, reporter: &Reporter) -> ExportDocument {
    let sessions: Vec<(String, Session)> = registry
        .all()
        .into_iter()
        .map(|s| (s.id().to_string(), s))
        .collect();
    let performance = reporter.performance();
    let config = scheduler.config();
    ExportDocument {
        metadata: ExportMetadata {
            version: EXPORT_VERSION.to_string(),
            exported_at: registry.clock().now_ms(),
            total_sessions: sessions.len(),
            health: performance.health,
        },
        sessions,
        statistics: reporter.stats(),
        performance,
        configuration: ExportConfiguration {
            kinds: config.kinds.iter().map(|k| k.kind.clone()).collect(),
            batch_size: config.batch_size,
            max_attempts: config.max_attempts,
            min_interval_secs: config.min_interval.as_secs(),
        },
    }
}

/// Replaces the registry contents with the sessions of an exported document.
///
/// Accepts any JSON value so a partially valid document can still be imported:
/// the `sessions` array must exist, but entries with an invalid identifier or a
/// mismatched embedded id are dropped.
pub fn import(registry: &SessionRegistry, document: &serde_json::Value) -> Result<usize, HostError> {
    let entries = document
        .get("sessions")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| HostError::Import("document has no sessions array".into()))?;

    let mut accepted = Vec::with_capacity(entries.len());
    for entry in entries {
        let (id, session) = match serde_json::from_value::<(String, Session)>(entry.clone()) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "skipping malformed session entry");
                continue;
            }
        };
        if !registry.policy().accepts(&id) || session.id() != id {
            warn!(id = %short_id(&id), "skipping session entry with invalid identifier");
            continue;
        }
        accepted.push(session);
    }

    if accepted.len() != entries.len() {
        warn!(
            dropped = entries.len() - accepted.len(),
            "import filtered invalid session entries"
        );
    }
    let count = accepted.len();
    registry.replace_all(accepted);
    info!(sessions = count, "imported sessions");
    Ok(count)
}
