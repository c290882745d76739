#[cfg(any(test, feature = "test-fixtures"))]
pub mod mock;
pub mod traits;

pub use traits::{
    ApprovalCapability, ApprovalReceipt, ApprovalRequest, ConnectionEvent, PayloadBuilder,
    RequestPayload, StaticPayloads,
};
