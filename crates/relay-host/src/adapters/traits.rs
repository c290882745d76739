use std::collections::BTreeMap;

use async_trait::async_trait;
use relay_store::{RequestKind, Session, Timestamp};
use serde::{Deserialize, Serialize};

/// Connection-state change reported by the wallet protocol client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(String),
    Disconnected,
}

/// Request contents for one session and kind, produced by the embedding application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub kind: RequestKind,
    /// Decimal amount the request declares, if any. Recorded verbatim on the attempt.
    pub amount: Option<String>,
    pub body: serde_json::Value,
}

/// Payload plus protocol framing handed to the approval capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub version: u32,
    pub session_id: String,
    pub valid_until: Timestamp,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalReceipt {
    pub reference: String,
}

/// Asks the wallet holder to approve a request. An `Err` covers both a
/// protocol failure and the user declining.
#[async_trait]
pub trait ApprovalCapability: Send + Sync {
    async fn propose(&self, request: &ApprovalRequest) -> anyhow::Result<ApprovalReceipt>;
}

/// Builds request contents; the host never invents payloads itself.
pub trait PayloadBuilder: Send + Sync {
    fn build(&self, session: &Session, kind: &RequestKind) -> RequestPayload;
}

/// Fixed payload per kind, configured up front. Unknown kinds get an empty body.
#[derive(Debug, Clone, Default)]
pub struct StaticPayloads {
    payloads: BTreeMap<RequestKind, (Option<String>, serde_json::Value)>,
}

impl StaticPayloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        kind: impl Into<String>,
        amount: Option<&str>,
        body: serde_json::Value,
    ) -> Self {
        self.payloads
            .insert(RequestKind::new(kind), (amount.map(str::to_string), body));
        self
    }
}

impl PayloadBuilder for StaticPayloads {
    fn build(&self, _session: &Session, kind: &RequestKind) -> RequestPayload {
        let (amount, body) = self
            .payloads
            .get(kind)
            .cloned()
            .unwrap_or((None, serde_json::Value::Null));
        RequestPayload {
            kind: kind.clone(),
            amount,
            body,
        }
    }
}
