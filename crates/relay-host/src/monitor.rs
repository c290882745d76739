use std::sync::Arc;

use relay_store::Attempt;
use tracing::debug;

use crate::oracle::{ChainOracle, Verdict};
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub confirmed: usize,
    pub failed: usize,
}

/// Resolves pending attempts against a [`ChainOracle`].
pub struct ConfirmationMonitor {
    registry: Arc<SessionRegistry>,
    oracle: Arc<dyn ChainOracle>,
}

impl ConfirmationMonitor {
    pub fn new(registry: Arc<SessionRegistry>, oracle: Arc<dyn ChainOracle>) -> Self {
        Self { registry, oracle }
    }

    pub async fn sweep(&self) -> SweepReport {
        let now = self.registry.clock().now_ms();
        let pending: Vec<(String, Attempt)> = self
            .registry
            .all()
            .into_iter()
            .flat_map(|s| {
                let id = s.id().to_string();
                s.ledger
                    .into_iter()
                    .filter(Attempt::is_pending)
                    .map(move |a| (id.clone(), a))
            })
            .collect();

        let mut report = SweepReport::default();
        for (id, attempt) in pending {
            report.checked += 1;
            let age = now.saturating_sub(attempt.created_at);
            let verdict = self.oracle.check(&attempt, age).await;
            if verdict == Verdict::Pending {
                continue;
            }
            let changed = self
                .registry
                .update(&id, |s| apply(&mut s.ledger, &attempt, verdict))
                .unwrap_or(false);
            match verdict {
                Verdict::Confirmed(_) if changed => report.confirmed += 1,
                Verdict::Failed if changed => report.failed += 1,
                _ => {}
            }
        }

        if report.confirmed + report.failed > 0 {
            debug!(
                checked = report.checked,
                confirmed = report.confirmed,
                failed = report.failed,
                "confirmation sweep applied verdicts"
            );
            self.registry.persist();
        }
        report
    }
}

// The ledger may have been trimmed or appended to since the snapshot, so the
// attempt is located again by identity.
fn apply(ledger: &mut [Attempt], attempt: &Attempt, verdict: Verdict) -> bool {
    let Some(target) = ledger.iter_mut().find(|a| {
        a.kind == attempt.kind
            && a.reference == attempt.reference
            && a.created_at == attempt.created_at
    }) else {
        return false;
    };
    match verdict {
        Verdict::Confirmed(confirmations) => target.confirm(confirmations),
        Verdict::Failed => target.fail(),
        Verdict::Pending => false,
    }
}
