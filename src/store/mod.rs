//! Checkpoint storage subsystem.
//!
//! # Data Flow
//! ```text
//! Engine step complete
//!     → SearchState (sequence + 1)
//!     → check_partition (refuse to persist a broken partition)
//!     → file.rs: <dir>/<run_id>.<sequence>.json via temp file + fsync + rename
//!     → prune all but the newest `keep_checkpoints`
//!
//! Resume / report:
//!     → load the highest sequence for the run id
//! ```
//!
//! # Design Decisions
//! - A step is not complete until its checkpoint is durable
//! - Checkpoints are never discarded automatically
//! - Records carry a format tag so stale files are rejected, not misread
//! - A loaded state is checked against the partition before it is resumed

pub mod file;
pub mod memory;

use std::path::PathBuf;

use thiserror::Error;

use crate::search::state::{PartitionError, SearchState};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Format tag written into every checkpoint record.
pub const FORMAT: &str = "mmio-bisect/checkpoint/v1";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {} is not valid JSON: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("checkpoint {} has unsupported format '{found}'", .path.display())]
    Format { path: PathBuf, found: String },

    #[error("refusing to persist a state that breaks the partition: {0}")]
    Partition(#[from] PartitionError),

    #[error("checkpoint {} does not tile its range: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: PartitionError,
    },

    #[error("run id '{0}' must be non-empty and contain no '/' or '.'")]
    InvalidRunId(String),
}

/// Durable home for [`SearchState`] checkpoints.
pub trait CheckpointStore {
    /// Persist `state` under its run id and sequence number.
    fn save(&mut self, state: &SearchState) -> Result<(), StoreError>;

    /// The checkpoint with the highest sequence number for `run_id`.
    fn load_latest(&self, run_id: &str) -> Result<Option<SearchState>, StoreError>;

    /// Delete every checkpoint of `run_id`, returning how many were removed.
    fn discard(&mut self, run_id: &str) -> Result<usize, StoreError>;
}

pub(crate) fn check_run_id(run_id: &str) -> Result<(), StoreError> {
    if run_id.is_empty() || run_id.contains(['/', '.']) {
        return Err(StoreError::InvalidRunId(run_id.to_string()));
    }
    Ok(())
}
