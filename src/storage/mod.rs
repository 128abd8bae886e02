//! On-disk storage for the job queue.
//!
//! This module provides:
//! - [`StateStore`] - one lifecycle state backed by a directory
//! - [`StoreLayout`] - the staging/pending/completed/failed stores under a root
//! - [`StoreError`] - failures of the storage primitives

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::job::JobId;

mod directory;
mod layout;

pub use directory::{PAYLOAD_FILE, StateStore, StoreIds};
pub use layout::{StoreKind, StoreLayout};

/// Errors produced by [`StateStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file or other non-directory entry sits where a store directory belongs.
    #[error("cannot create store directory: {} is occupied by a non-directory entry", .0.display())]
    PathOccupied(PathBuf),

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The job record could not be encoded.
    #[error("failed to serialize job record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The store holds no entry for the job.
    #[error("job {0} is not present in the store")]
    NotFound(JobId),

    /// The store already holds an entry for the job.
    #[error("job {0} is already present in the store")]
    AlreadyExists(JobId),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
