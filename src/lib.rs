//! A durable, directory-backed job queue with single-flight execution.
//!
//! Jobs are serialized to JSON and stored one directory per job under a queue
//! root. A background worker executes them one at a time, earliest
//! `next_execution_time` first, and files each job as completed or failed once
//! it is done. Failed attempts are retried with exponential backoff.
//!
//! - [`JobQueue`] - the queue and its worker
//! - [`Job`] - implement for your work items
//! - [`StateStore`] / [`StoreLayout`] - the on-disk stores, usable on their own
//! - [`Diagnostics`] - where the queue reports problems it recovers from
//!
//! # Architecture
//!
//! ```text
//!               add()                        rename                rename
//! ┌──────────┐  ───►  ┌──────────┐  ───►  ┌──────────┐  ───►  ┌───────────┐
//! │ JobQueue │        │ staging/ │        │ pending/ │        │ completed/│
//! └──────────┘        └──────────┘        └────┬─────┘  ───►  │ failed/   │
//!                                               │              └───────────┘
//!                          watcher ──wake──► worker ──► Job::execute
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use file_job_queue::{Attempt, Job, JobFailure, JobQueue, JobRecord};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct PrintJob {
//!     text: String,
//! }
//!
//! impl Job for PrintJob {
//!     async fn execute(&self, _attempt: Attempt) -> Result<(), JobFailure> {
//!         println!("{}", self.text);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), file_job_queue::JobQueueError> {
//!     let queue = JobQueue::<PrintJob>::open("/tmp/print-jobs")?;
//!
//!     queue.add(&JobRecord::new(PrintJob { text: "hello".into() }).with_max_retries(3))?;
//!
//!     tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!
//!     queue.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod diagnostics;
mod error;
mod job;
mod queue;
mod storage;
mod watcher;

pub use diagnostics::{Diagnostics, Severity, TracingDiagnostics};
pub use error::JobQueueError;
pub use job::{
    Attempt, DEFAULT_MAX_RETRIES, Job, JobFailure, JobId, JobRecord, backoff_delay, is_eligible,
};
pub use queue::{JobQueue, JobQueueBuilder, JobQueueConfig};
pub use storage::{PAYLOAD_FILE, StateStore, StoreError, StoreIds, StoreKind, StoreLayout};
pub use watcher::{
    ChangeSource, NativeWatcher, PollingWatcher, WatchError, WatchHandle, WatchMode, Wakeup,
};
