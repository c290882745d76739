//! Session and attempt records shared by the registry, scheduler and persistence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Caller-defined category of outbound request (e.g. `renewal`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKind(String);

impl RequestKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKind {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One recorded try at obtaining approval for a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub kind: RequestKind,
    /// Decimal amount declared by the request payload; empty when none was declared.
    pub amount: String,
    /// Opaque token returned by the approval capability; empty when rejected.
    pub reference: String,
    pub created_at: Timestamp,
    pub status: AttemptStatus,
    pub confirmations: u32,
}

impl Attempt {
    pub fn pending(kind: RequestKind, amount: String, reference: String, now: Timestamp) -> Self {
        Self {
            kind,
            amount,
            reference,
            created_at: now,
            status: AttemptStatus::Pending,
            confirmations: 0,
        }
    }

    pub fn failed(kind: RequestKind, amount: String, now: Timestamp) -> Self {
        Self {
            kind,
            amount,
            reference: String::new(),
            created_at: now,
            status: AttemptStatus::Failed,
            confirmations: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == AttemptStatus::Pending
    }

    /// Moves a pending attempt to `Confirmed`. Returns false if it was already resolved.
    pub fn confirm(&mut self, confirmations: u32) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = AttemptStatus::Confirmed;
        self.confirmations = confirmations;
        true
    }

    /// Moves a pending attempt to `Failed`. Returns false if it was already resolved.
    pub fn fail(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = AttemptStatus::Failed;
        true
    }

    /// Parsed declared amount, if any.
    pub fn declared_amount(&self) -> Option<f64> {
        self.amount.trim().parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

/// Connection and request history of one wallet identifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    id: String,
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
    pub active: bool,
    #[serde(default)]
    pub request_counts: BTreeMap<RequestKind, u32>,
    #[serde(default)]
    pub approved: BTreeMap<RequestKind, bool>,
    #[serde(default)]
    pub last_dispatch: BTreeMap<RequestKind, Timestamp>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub ledger: Vec<Attempt>,
}

impl Session {
    pub fn new(id: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            connected_at: now,
            last_activity: now,
            active: true,
            request_counts: BTreeMap::new(),
            approved: BTreeMap::new(),
            last_dispatch: BTreeMap::new(),
            attempts: 0,
            ledger: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Marks the session live again; `last_activity` never moves backwards.
    pub fn touch(&mut self, now: Timestamp) {
        self.active = true;
        self.last_activity = self.last_activity.max(now);
    }

    pub fn is_approved(&self, kind: &RequestKind) -> bool {
        self.approved.get(kind).copied().unwrap_or(false)
    }

    /// Sets `approved[kind]`; returns true only on the first transition.
    pub fn mark_approved(&mut self, kind: &RequestKind) -> bool {
        let slot = self.approved.entry(kind.clone()).or_insert(false);
        if *slot {
            return false;
        }
        *slot = true;
        true
    }

    pub fn has_any_approval(&self) -> bool {
        self.approved.values().any(|v| *v)
    }

    pub fn request_count(&self, kind: &RequestKind) -> u32 {
        self.request_counts.get(kind).copied().unwrap_or(0)
    }

    pub fn last_dispatch(&self, kind: &RequestKind) -> Option<Timestamp> {
        self.last_dispatch.get(kind).copied()
    }

    pub fn record_success(&mut self, attempt: Attempt, now: Timestamp) {
        let kind = attempt.kind.clone();
        *self.request_counts.entry(kind.clone()).or_insert(0) += 1;
        self.last_dispatch.insert(kind.clone(), now);
        self.ledger.push(attempt);
        self.mark_approved(&kind);
    }

    pub fn record_failure(&mut self, attempt: Attempt, now: Timestamp) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_dispatch.insert(attempt.kind.clone(), now);
        self.ledger.push(attempt);
    }

    pub fn pending_attempts(&self) -> usize {
        self.ledger.iter().filter(|a| a.is_pending()).count()
    }

    /// Keeps the `cap` most recent attempts, newest first.
    pub fn trim_ledger(&mut self, cap: usize) -> usize {
        if self.ledger.len() <= cap {
            return 0;
        }
        self.ledger.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let dropped = self.ledger.len() - cap;
        self.ledger.truncate(cap);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind() -> RequestKind {
        RequestKind::new("renewal")
    }

    #[test]
    fn approval_flips_once() {
        let mut session = Session::new("EQ-demo", 10);
        assert!(!session.is_approved(&kind()));
        assert!(session.mark_approved(&kind()));
        assert!(!session.mark_approved(&kind()));
        assert!(session.is_approved(&kind()));
    }

    #[test]
    fn touch_never_rewinds_activity() {
        let mut session = Session::new("EQ-demo", 100);
        session.active = false;
        session.touch(50);
        assert!(session.active);
        assert_eq!(session.last_activity, 100);
        session.touch(150);
        assert_eq!(session.last_activity, 150);
    }

    #[test]
    fn resolved_attempts_do_not_transition_again() {
        let mut attempt = Attempt::pending(kind(), "1.5".into(), "ref-1".into(), 0);
        assert!(attempt.confirm(10));
        assert!(!attempt.fail());
        assert!(!attempt.confirm(3));
        assert_eq!(attempt.status, AttemptStatus::Confirmed);
        assert_eq!(attempt.confirmations, 10);

        let mut rejected = Attempt::failed(kind(), String::new(), 0);
        assert!(!rejected.confirm(10));
        assert_eq!(rejected.status, AttemptStatus::Failed);
    }

    #[test]
    fn trim_keeps_most_recent() {
        let mut session = Session::new("EQ-demo", 0);
        for ts in 0..25u64 {
            session.record_failure(Attempt::failed(kind(), String::new(), ts), ts);
        }
        assert_eq!(session.trim_ledger(20), 5);
        assert_eq!(session.ledger.len(), 20);
        assert_eq!(session.ledger.first().map(|a| a.created_at), Some(24));
        assert_eq!(session.ledger.last().map(|a| a.created_at), Some(5));
    }

    #[test]
    fn success_and_failure_update_counters() {
        let mut session = Session::new("EQ-demo", 0);
        session.record_failure(Attempt::failed(kind(), String::new(), 5), 5);
        assert_eq!(session.attempts, 1);
        assert!(!session.is_approved(&kind()));

        session.record_success(Attempt::pending(kind(), "2".into(), "ref".into(), 9), 9);
        assert_eq!(session.request_count(&kind()), 1);
        assert_eq!(session.last_dispatch(&kind()), Some(9));
        assert!(session.is_approved(&kind()));
        assert_eq!(session.pending_attempts(), 1);
    }

    #[test]
    fn declared_amount_ignores_garbage() {
        let mut attempt = Attempt::pending(kind(), "0.25".into(), "r".into(), 0);
        assert_eq!(attempt.declared_amount(), Some(0.25));
        attempt.amount = "n/a".into();
        assert_eq!(attempt.declared_amount(), None);
    }
}
