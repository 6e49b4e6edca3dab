#![forbid(unsafe_code)]

//! orm_runtime — persistence around the tracking kernel.
//!
//! Adds an in-memory row store that acts as the kernel's persistence
//! collaborator, a protobuf row log, snapshots, replay, session
//! management and drift detection.
//!
//! Tracking, key resolution and row states stay in the kernel; nothing
//! here decides how objects relate.

use thiserror::Error;

use orm_engine::OrmError;

pub mod proto_types;
pub mod proto_bridge;
pub mod row_log;
pub mod store;
pub mod connection;
pub mod replay;
pub mod snapshot;
pub mod snapshot_codec;
pub mod session;
pub mod drift;

/// Failures outside the kernel's own taxonomy.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Orm(#[from] OrmError),

    #[error("Io: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot: {0}")]
    Snapshot(#[from] snapshot_codec::SnapshotError),

    /// A log frame decoded but carried values the store cannot hold.
    #[error("CorruptLog: {0}")]
    CorruptLog(String),

    /// Two runs over the same input disagreed.
    #[error("Drift: {0}")]
    Drift(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
