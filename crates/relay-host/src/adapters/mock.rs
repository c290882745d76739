//! Scripted approval capability for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use super::traits::{ApprovalCapability, ApprovalReceipt, ApprovalRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    Approve,
    Reject,
}

/// Approves or rejects every proposal, optionally after a delay, and keeps
/// every request it saw.
#[derive(Debug)]
pub struct MockApproval {
    behavior: Mutex<MockBehavior>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<ApprovalRequest>>,
}

impl MockApproval {
    pub fn approving() -> Self {
        Self::with_behavior(MockBehavior::Approve)
    }

    pub fn rejecting() -> Self {
        Self::with_behavior(MockBehavior::Reject)
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of proposals that were awaiting an answer at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApprovalCapability for MockApproval {
    async fn propose(&self, request: &ApprovalRequest) -> anyhow::Result<ApprovalReceipt> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            MockBehavior::Approve => Ok(ApprovalReceipt {
                reference: format!("mock-ref-{n}"),
            }),
            MockBehavior::Reject => Err(anyhow!("user declined request {n}")),
        }
    }
}
