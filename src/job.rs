//! Job trait, persisted job record and the default retry policy.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Retry ceiling applied by [`JobRecord::new`].
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Unique identifier for a job, used as its on-disk key.
///
/// Renders as a hyphenated UUID, which is also the name of the job's
/// directory inside every store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    /// Create a new time-ordered job id (UUID v7).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Metadata describing the attempt a job is being executed for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Attempt {
    /// Id of the job being executed.
    pub job_id: JobId,
    /// Number of attempts that already failed before this one.
    pub retry_count: u32,
    /// Retry ceiling configured for the job.
    pub max_retries: u32,
}

impl Attempt {
    /// Whether a failure of this attempt moves the job to the failed store.
    pub fn is_last(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Reason reported by a job whose attempt did not succeed.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobFailure {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl JobFailure {
    /// Create a failure with a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a failure wrapping an underlying error.
    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }

    /// Human readable reason.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for JobFailure {
    fn from(error: std::io::Error) -> Self {
        Self::from_error(error)
    }
}

/// Trait implemented by the work items a [`JobQueue`](crate::JobQueue) runs.
///
/// The job is persisted as JSON inside a [`JobRecord`], so it must be
/// serializable. Each call to [`execute`](Job::execute) is one attempt; the
/// queue decides what happens next from the returned result.
///
/// # Example
///
/// ```rust
/// use file_job_queue::{Attempt, Job, JobFailure};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl Job for SendEmail {
///     async fn execute(&self, attempt: Attempt) -> Result<(), JobFailure> {
///         if self.to.is_empty() {
///             return Err(JobFailure::new("missing recipient"));
///         }
///         println!("sending to {} (attempt {})", self.to, attempt.retry_count + 1);
///         Ok(())
///     }
/// }
/// ```
pub trait Job: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Execute one attempt of this job.
    fn execute(&self, attempt: Attempt) -> impl Future<Output = Result<(), JobFailure>> + Send;

    /// Delay before the attempt following `retry_count` failures.
    ///
    /// Defaults to [`backoff_delay`].
    fn retry_delay(&self, retry_count: u32) -> Duration {
        backoff_delay(retry_count)
    }
}

/// Exponential backoff with jitter: `n^4 + 15 + rand(0..30) * (n + 1)` seconds.
///
/// Spreads 25 retries over roughly three weeks. Every call draws fresh
/// randomness so jobs that failed together do not retry in lockstep.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let n = f64::from(retry_count);
    let jitter: f64 = rand::rng().random_range(0.0..30.0);
    let secs = n.powi(4) + 15.0 + jitter * (n + 1.0);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Whether something scheduled for `next_execution_time` may run at `now`.
pub fn is_eligible(next_execution_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    next_execution_time <= now
}

/// A job together with the scheduling state the queue persists for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord<J> {
    /// Storage key, stable for the job's lifetime.
    pub id: JobId,
    /// Attempts that have failed so far.
    pub retry_count: u32,
    /// Failed attempts tolerated before the job is filed as failed.
    pub max_retries: u32,
    /// Earliest time the job may be executed.
    pub next_execution_time: DateTime<Utc>,
    /// Caller-defined job state.
    pub job: J,
}

impl<J> JobRecord<J> {
    /// Wrap `job` in a record that is eligible immediately.
    pub fn new(job: J) -> Self {
        Self {
            id: JobId::new(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_execution_time: Utc::now(),
            job,
        }
    }

    /// Use a caller-assigned id.
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Defer the first attempt until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_execution_time = at;
        self
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        is_eligible(self.next_execution_time, now)
    }

    /// No retries remain, so a failure is terminal.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn attempt(&self) -> Attempt {
        Attempt {
            job_id: self.id,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
        }
    }
}

impl<J: Job> JobRecord<J> {
    /// Reschedule after a failed attempt.
    ///
    /// The delay is computed from the retry count *before* it is incremented.
    pub fn advance_for_retry(&mut self, now: DateTime<Utc>) {
        let delay = self.job.retry_delay(self.retry_count);
        let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        self.next_execution_time = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.retry_count = self.retry_count.saturating_add(1);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
