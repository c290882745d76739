//! Read-side aggregation for the operations dashboard. Nothing here mutates state.

use std::collections::BTreeMap;
use std::sync::Arc;

use relay_store::{AttemptStatus, RequestKind, Session, Timestamp};
use serde::{Deserialize, Serialize};

use crate::config::HealthThresholds;
use crate::registry::SessionRegistry;
use crate::scheduler::Scheduler;

const RECENT_ACTIVITY_MS: u64 = 5 * 60 * 1000;
const DAY_MS: u64 = 24 * 60 * 60 * 1000;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Excellent,
    Good,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub approved_by_kind: BTreeMap<RequestKind, usize>,
    pub total_attempts: usize,
    pub confirmed_attempts: usize,
    pub pending_attempts: usize,
    pub failed_attempts: usize,
    /// Confirmed attempts as a percentage of all attempts.
    pub success_rate: f64,
    pub average_connection_ms: u64,
    /// Sum of declared amounts across confirmed attempts.
    pub total_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_sessions: usize,
    pub batch_size: usize,
    pub memory_mb: f64,
    pub pending_attempts: usize,
    pub active_timers: usize,
    pub run_in_flight: bool,
    pub persistence_degraded: bool,
    pub health: Health,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub online: bool,
    pub total_sessions: usize,
    pub recently_active: usize,
    pub health: Health,
    pub uptime_ms: u64,
    pub attempts_last_day: usize,
}

pub struct Reporter {
    registry: Arc<SessionRegistry>,
    scheduler: Arc<Scheduler>,
    thresholds: HealthThresholds,
}

impl Reporter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        scheduler: Arc<Scheduler>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            registry,
            scheduler,
            thresholds,
        }
    }

    fn now(&self) -> Timestamp {
        self.registry.clock().now_ms()
    }

    pub fn stats(&self) -> SessionStats {
        session_stats(&self.registry.all(), self.now())
    }

    pub fn performance(&self) -> PerformanceMetrics {
        let sessions = self.registry.all();
        let memory_mb = estimated_memory_mb(&sessions);
        let pending = pending_attempts(&sessions);
        let degraded = self.registry.is_degraded();
        PerformanceMetrics {
            total_sessions: sessions.len(),
            batch_size: self.scheduler.config().batch_size,
            memory_mb,
            pending_attempts: pending,
            active_timers: self.scheduler.active_timers(),
            run_in_flight: self.scheduler.any_in_flight(),
            persistence_degraded: degraded,
            health: classify(&self.thresholds, sessions.len(), memory_mb, pending, degraded),
        }
    }

    pub fn status(&self) -> SystemStatus {
        let sessions = self.registry.all();
        let now = self.now();
        let memory_mb = estimated_memory_mb(&sessions);
        let pending = pending_attempts(&sessions);
        let earliest = sessions.iter().map(|s| s.connected_at).min().unwrap_or(now);
        SystemStatus {
            online: true,
            total_sessions: sessions.len(),
            recently_active: sessions
                .iter()
                .filter(|s| now.saturating_sub(s.last_activity) < RECENT_ACTIVITY_MS)
                .count(),
            health: classify(
                &self.thresholds,
                sessions.len(),
                memory_mb,
                pending,
                self.registry.is_degraded(),
            ),
            uptime_ms: now.saturating_sub(earliest),
            attempts_last_day: sessions
                .iter()
                .flat_map(|s| s.ledger.iter())
                .filter(|a| now.saturating_sub(a.created_at) < DAY_MS)
                .count(),
        }
    }

    pub fn health(&self) -> Health {
        self.performance().health
    }
}

pub fn session_stats(sessions: &[Session], now: Timestamp) -> SessionStats {
    let mut approved_by_kind: BTreeMap<RequestKind, usize> = BTreeMap::new();
    let (mut total_attempts, mut confirmed, mut pending, mut failed) = (0, 0, 0, 0);
    let mut total_volume = 0.0;
    for session in sessions {
        for (kind, approved) in &session.approved {
            if *approved {
                *approved_by_kind.entry(kind.clone()).or_default() += 1;
            }
        }
        for attempt in &session.ledger {
            total_attempts += 1;
            match attempt.status {
                AttemptStatus::Confirmed => {
                    confirmed += 1;
                    total_volume += attempt.declared_amount().unwrap_or(0.0);
                }
                AttemptStatus::Pending => pending += 1,
                AttemptStatus::Failed => failed += 1,
            }
        }
    }

    let connection_total: u64 = sessions
        .iter()
        .map(|s| now.saturating_sub(s.connected_at))
        .sum();
    SessionStats {
        total: sessions.len(),
        active: sessions.iter().filter(|s| s.active).count(),
        approved_by_kind,
        total_attempts,
        confirmed_attempts: confirmed,
        pending_attempts: pending,
        failed_attempts: failed,
        success_rate: if total_attempts == 0 {
            0.0
        } else {
            confirmed as f64 / total_attempts as f64 * 100.0
        },
        average_connection_ms: connection_total
            .checked_div(sessions.len() as u64)
            .unwrap_or(0),
        total_volume,
    }
}

fn pending_attempts(sessions: &[Session]) -> usize {
    sessions.iter().map(Session::pending_attempts).sum()
}

/// Size of the serialized session set, in MB.
pub fn estimated_memory_mb(sessions: &[Session]) -> f64 {
    let bytes = serde_json::to_vec(sessions).map(|v| v.len()).unwrap_or(0);
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

pub fn classify(
    thresholds: &HealthThresholds,
    sessions: usize,
    memory_mb: f64,
    pending: usize,
    degraded: bool,
) -> Health {
    if memory_mb > thresholds.critical_memory_mb || pending > thresholds.critical_pending {
        return Health::Critical;
    }
    if degraded || memory_mb > thresholds.warning_memory_mb || pending > thresholds.warning_pending {
        return Health::Warning;
    }
    if sessions > thresholds.good_sessions {
        return Health::Good;
    }
    Health::Excellent
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::Attempt;

    fn kind(name: &str) -> RequestKind {
        RequestKind::new(name)
    }

    #[test]
    fn classify_thresholds() {
        let t = HealthThresholds::default();
        assert_eq!(classify(&t, 10, 1.0, 0, false), Health::Excellent);
        assert_eq!(classify(&t, 100_001, 1.0, 0, false), Health::Good);
        assert_eq!(classify(&t, 10, 501.0, 0, false), Health::Warning);
        assert_eq!(classify(&t, 10, 1.0, 1_001, false), Health::Warning);
        assert_eq!(classify(&t, 10, 1.0, 0, true), Health::Warning);
        assert_eq!(classify(&t, 10, 1_001.0, 0, false), Health::Critical);
        assert_eq!(classify(&t, 10, 1.0, 10_001, true), Health::Critical);
    }

    #[test]
    fn stats_aggregate_ledgers_and_approvals() {
        let mut a = Session::new("a", 1_000);
        let mut b = Session::new("b", 3_000);
        b.active = false;

        let mut confirmed = Attempt::pending(kind("renewal"), "4.5".into(), "r1".into(), 1_000);
        confirmed.confirm(10);
        a.record_success(confirmed, 1_000);
        a.record_failure(Attempt::failed(kind("consent"), String::new(), 1_100), 1_100);
        b.record_success(
            Attempt::pending(kind("consent"), String::new(), "r2".into(), 3_000),
            3_000,
        );

        let stats = session_stats(&[a, b], 5_000);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.approved_by_kind.get(&kind("renewal")), Some(&1));
        assert_eq!(stats.approved_by_kind.get(&kind("consent")), Some(&1));
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.confirmed_attempts, 1);
        assert_eq!(stats.pending_attempts, 1);
        assert_eq!(stats.failed_attempts, 1);
        assert!((stats.success_rate - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.average_connection_ms, 3_000);
        assert_eq!(stats.total_volume, 4.5);
    }

    #[test]
    fn empty_store_has_zeroed_stats() {
        let stats = session_stats(&[], 10);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.average_connection_ms, 0);
        assert_eq!(estimated_memory_mb(&[]), 0.0);
    }
}
