//! Error types for the job queue crate.

use thiserror::Error;

use crate::job::JobId;
use crate::storage::StoreError;
use crate::watcher::WatchError;

/// Errors that can occur when using the job queue.
#[derive(Debug, Error)]
pub enum JobQueueError {
    /// Configuration error (e.g., zero poll interval).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// One of the store directories could not be prepared.
    #[error("failed to set up job store: {0}")]
    Setup(#[source] StoreError),

    /// The pending store could not be watched.
    #[error("failed to watch pending jobs: {0}")]
    Watch(#[source] WatchError),

    /// The queue was built outside of a tokio runtime.
    #[error("no tokio runtime available to run the queue worker")]
    RuntimeUnavailable,

    /// A job with the same id is already pending.
    #[error("a job with id {0} is already pending")]
    AlreadyExists(JobId),

    /// Serializing or persisting a new job failed.
    #[error("failed adding job: {0}")]
    AddFailed(#[source] StoreError),

    /// The worker panicked.
    #[error("Worker panicked: {reason}")]
    WorkerPanicked { reason: String },
}
