//! Session records plus key-value backends and the chunked session repository.

mod fs_kv;
mod kv;
pub mod model;
pub mod repository;

pub use fs_kv::FsKv;
pub use kv::{KvStore, MemKv};
pub use model::{Attempt, AttemptStatus, RequestKind, Session, Timestamp};
pub use repository::{ChunkedRepository, SessionRepository, StoreMeta};

use std::{io, path::PathBuf};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("writing '{key}' would exceed the store capacity of {limit} bytes")]
    CapacityExceeded { key: String, limit: usize },
    #[error("record '{key}' is corrupt: {reason}")]
    CorruptRecord { key: String, reason: String },
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}
