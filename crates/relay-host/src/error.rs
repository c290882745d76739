use relay_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("approval rejected: {0}")]
    ApprovalRejected(String),
    #[error("approval timed out")]
    ApprovalTimeout,
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("import error: {0}")]
    Import(String),
}
