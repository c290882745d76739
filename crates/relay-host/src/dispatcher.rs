use std::sync::Arc;

use relay_store::{Attempt, RequestKind};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::adapters::{ApprovalCapability, ApprovalRequest, PayloadBuilder};
use crate::clock::millis;
use crate::config::DispatchConfig;
use crate::error::HostError;
use crate::identity::short_id;
use crate::registry::SessionRegistry;

#[derive(Debug)]
pub enum DispatchOutcome {
    Approved { reference: String },
    Rejected(HostError),
    /// The session disappeared before it could be dispatched.
    Missing,
}

impl DispatchOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, DispatchOutcome::Approved { .. })
    }
}

/// Sends one approval request and records its outcome on the session.
/// Never retries; the scheduler's next tick is the retry path.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    capability: Arc<dyn ApprovalCapability>,
    payloads: Arc<dyn PayloadBuilder>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        capability: Arc<dyn ApprovalCapability>,
        payloads: Arc<dyn PayloadBuilder>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            capability,
            payloads,
            config,
        }
    }

    pub fn build_request(&self, id: &str, kind: &RequestKind) -> Option<ApprovalRequest> {
        let session = self.registry.get(id)?;
        let now = self.registry.clock().now_ms();
        Some(ApprovalRequest {
            version: self.config.payload_version,
            session_id: id.to_string(),
            valid_until: now.saturating_add(millis(self.config.approval_validity)),
            payload: self.payloads.build(&session, kind),
        })
    }

    pub async fn dispatch(&self, id: &str, kind: &RequestKind) -> DispatchOutcome {
        let Some(request) = self.build_request(id, kind) else {
            return DispatchOutcome::Missing;
        };
        let submitted_at = self.registry.clock().now_ms();
        let amount = request.payload.amount.clone().unwrap_or_default();

        let result = match timeout(
            self.config.approval_validity,
            self.capability.propose(&request),
        )
        .await
        {
            Ok(Ok(receipt)) => Ok(receipt.reference),
            Ok(Err(err)) => Err(HostError::ApprovalRejected(err.to_string())),
            Err(_) => Err(HostError::ApprovalTimeout),
        };

        let outcome = match result {
            Ok(reference) => {
                let attempt =
                    Attempt::pending(kind.clone(), amount, reference.clone(), submitted_at);
                let applied = self
                    .registry
                    .update(id, |s| s.record_success(attempt, submitted_at));
                if applied.is_none() {
                    debug!(id = %short_id(id), "session removed while approval was in flight");
                    return DispatchOutcome::Missing;
                }
                info!(id = %short_id(id), %kind, "request approved");
                DispatchOutcome::Approved { reference }
            }
            Err(err) => {
                let attempt = Attempt::failed(kind.clone(), amount, submitted_at);
                let applied = self
                    .registry
                    .update(id, |s| s.record_failure(attempt, submitted_at));
                if applied.is_none() {
                    return DispatchOutcome::Missing;
                }
                debug!(id = %short_id(id), %kind, error = %err, "request not approved");
                DispatchOutcome::Rejected(err)
            }
        };
        self.registry.persist();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StaticPayloads;
    use crate::adapters::mock::{MockApproval, MockBehavior};
    use crate::clock::ManualClock;
    use crate::config::PersistenceConfig;
    use crate::identity::IdentifierPolicy;
    use relay_store::{AttemptStatus, ChunkedRepository, MemKv};
    use serde_json::json;
    use std::time::Duration;

    const ID: &str = "EQabcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRST";

    fn setup(mock: Arc<MockApproval>) -> (Arc<SessionRegistry>, Dispatcher) {
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(ChunkedRepository::new(MemKv::new())),
            IdentifierPolicy::default(),
            Arc::new(ManualClock::new(5_000)),
            &PersistenceConfig::default(),
        ));
        registry.upsert(ID).expect("valid id");
        let payloads = StaticPayloads::new().with(
            "renewal",
            Some("1.25"),
            json!({"memo": "invoice 17"}),
        );
        let dispatcher = Dispatcher::new(
            registry.clone(),
            mock,
            Arc::new(payloads),
            DispatchConfig::default(),
        );
        (registry, dispatcher)
    }

    #[tokio::test]
    async fn approval_records_pending_attempt() {
        let mock = Arc::new(MockApproval::approving());
        let (registry, dispatcher) = setup(mock.clone());
        let kind = RequestKind::new("renewal");

        let outcome = dispatcher.dispatch(ID, &kind).await;
        assert!(outcome.is_approved());

        let session = registry.get(ID).expect("session");
        assert!(session.is_approved(&kind));
        assert_eq!(session.request_count(&kind), 1);
        assert_eq!(session.last_dispatch(&kind), Some(5_000));
        assert_eq!(session.attempts, 0);
        assert_eq!(session.ledger.len(), 1);
        assert_eq!(session.ledger[0].status, AttemptStatus::Pending);
        assert_eq!(session.ledger[0].reference, "mock-ref-1");
        assert_eq!(session.ledger[0].amount, "1.25");

        let sent = mock.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].valid_until, 5_000 + 600_000);
        assert_eq!(sent[0].payload.body, json!({"memo": "invoice 17"}));
    }

    #[tokio::test]
    async fn rejection_counts_attempt_and_keeps_approval_unset() {
        let mock = Arc::new(MockApproval::rejecting());
        let (registry, dispatcher) = setup(mock);
        let kind = RequestKind::new("consent");

        let outcome = dispatcher.dispatch(ID, &kind).await;
        assert!(matches!(outcome, DispatchOutcome::Rejected(HostError::ApprovalRejected(_))));

        let session = registry.get(ID).expect("session");
        assert!(!session.is_approved(&kind));
        assert_eq!(session.attempts, 1);
        assert_eq!(session.ledger[0].status, AttemptStatus::Failed);
        assert!(session.ledger[0].reference.is_empty());
        assert!(session.ledger[0].amount.is_empty());
    }

    #[tokio::test]
    async fn approval_never_reverts_after_later_rejection() {
        let mock = Arc::new(MockApproval::approving());
        let (registry, dispatcher) = setup(mock.clone());
        let kind = RequestKind::new("renewal");

        dispatcher.dispatch(ID, &kind).await;
        mock.set_behavior(MockBehavior::Reject);
        dispatcher.dispatch(ID, &kind).await;
        dispatcher.dispatch(ID, &kind).await;

        let session = registry.get(ID).expect("session");
        assert!(session.is_approved(&kind));
        assert_eq!(session.attempts, 2);
        assert_eq!(session.ledger.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_approval_times_out() {
        let mock = Arc::new(MockApproval::approving().with_delay(Duration::from_secs(3_600)));
        let (registry, dispatcher) = setup(mock);
        let kind = RequestKind::new("renewal");

        let outcome = dispatcher.dispatch(ID, &kind).await;
        assert!(matches!(outcome, DispatchOutcome::Rejected(HostError::ApprovalTimeout)));
        assert_eq!(registry.get(ID).expect("session").attempts, 1);
    }

    #[tokio::test]
    async fn unknown_session_is_missing() {
        let mock = Arc::new(MockApproval::approving());
        let (_registry, dispatcher) = setup(mock.clone());
        let outcome = dispatcher
            .dispatch("UQ0000000000000000000000000000000000000000000000", &"renewal".into())
            .await;
        assert!(matches!(outcome, DispatchOutcome::Missing));
        assert_eq!(mock.calls(), 0);
    }
}
