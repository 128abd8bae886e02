//! Directory-backed job queue with a single-flight worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::diagnostics::{Diagnostics, Severity, TracingDiagnostics};
use crate::error::JobQueueError;
use crate::job::{Job, JobFailure, JobId, JobRecord};
use crate::storage::{StoreError, StoreKind, StoreLayout};
use crate::watcher::{
    AbortOnDrop, ChangeSource, NativeWatcher, PollingWatcher, WatchHandle, WatchMode, Wakeup,
};

/// Configuration for the job queue.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use file_job_queue::{JobQueueConfig, WatchMode};
///
/// // Use defaults
/// let config = JobQueueConfig::default();
///
/// // Or customize
/// let config = JobQueueConfig {
///     watch_mode: WatchMode::Polling,
///     poll_interval: Duration::from_millis(100),
///     ..JobQueueConfig::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct JobQueueConfig {
    /// How changes to the pending store are detected.
    pub watch_mode: WatchMode,

    /// Period of the polling watcher, used by [`WatchMode::Polling`] and as
    /// the [`WatchMode::Auto`] fallback.
    pub poll_interval: Duration,

    /// Longest time the idle worker waits before rescanning on its own.
    ///
    /// Covers notifications the watcher may have missed.
    pub idle_rescan_interval: Duration,

    /// Delete staging entries left behind by a crash when the queue opens.
    pub purge_staging_on_open: bool,
}

impl Default for JobQueueConfig {
    /// Returns a configuration with sensible defaults.
    ///
    /// - `watch_mode`: [`WatchMode::Auto`]
    /// - `poll_interval`: 250 milliseconds
    /// - `idle_rescan_interval`: 30 seconds
    /// - `purge_staging_on_open`: true
    fn default() -> Self {
        Self {
            watch_mode: WatchMode::Auto,
            poll_interval: Duration::from_millis(250),
            idle_rescan_interval: Duration::from_secs(30),
            purge_staging_on_open: true,
        }
    }
}

type BeforeExecute<J> = Arc<dyn Fn(&mut J) + Send + Sync>;

/// Builder for [`JobQueue`].
pub struct JobQueueBuilder<J: Job> {
    root: PathBuf,
    config: JobQueueConfig,
    diagnostics: Option<Arc<dyn Diagnostics>>,
    change_source: Option<Arc<dyn ChangeSource>>,
    before_execute: Option<BeforeExecute<J>>,
}

impl<J: Job> JobQueueBuilder<J> {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            config: JobQueueConfig::default(),
            diagnostics: None,
            change_source: None,
            before_execute: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: JobQueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn watch_mode(mut self, mode: WatchMode) -> Self {
        self.config.watch_mode = mode;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn idle_rescan_interval(mut self, interval: Duration) -> Self {
        self.config.idle_rescan_interval = interval;
        self
    }

    pub fn purge_staging_on_open(mut self, purge: bool) -> Self {
        self.config.purge_staging_on_open = purge;
        self
    }

    /// Where internal failures are reported. Defaults to [`TracingDiagnostics`].
    pub fn diagnostics(mut self, diagnostics: impl Diagnostics) -> Self {
        self.diagnostics = Some(Arc::new(diagnostics));
        self
    }

    /// Use a custom change source instead of the one chosen by the watch mode.
    pub fn change_source(mut self, source: impl ChangeSource) -> Self {
        self.change_source = Some(Arc::new(source));
        self
    }

    /// Run `hook` on the in-memory job right before every attempt.
    ///
    /// Changes are seen by that attempt and are persisted if the attempt
    /// fails and the job is rescheduled.
    pub fn before_execute<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut J) + Send + Sync + 'static,
    {
        self.before_execute = Some(Arc::new(hook));
        self
    }

    /// Prepare the store directories, start watching and spawn the worker.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`JobQueueError::InvalidConfig`] if an interval is zero
    /// - [`JobQueueError::RuntimeUnavailable`] outside of a tokio runtime
    /// - [`JobQueueError::Setup`] if a store directory cannot be created
    /// - [`JobQueueError::Watch`] if no change source can be started
    pub fn build(self) -> Result<JobQueue<J>, JobQueueError> {
        let config = self.config;
        if config.poll_interval.is_zero() {
            return Err(JobQueueError::InvalidConfig(
                "poll_interval must be greater than 0".into(),
            ));
        }
        if config.idle_rescan_interval.is_zero() {
            return Err(JobQueueError::InvalidConfig(
                "idle_rescan_interval must be greater than 0".into(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| JobQueueError::RuntimeUnavailable)?;

        let layout = StoreLayout::new(self.root);
        layout.setup().map_err(JobQueueError::Setup)?;

        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(TracingDiagnostics::new(layout.root())));

        if config.purge_staging_on_open {
            let purged = layout.purge_staging();
            if !purged.is_empty() {
                diagnostics.emit(
                    Severity::Info,
                    &format!("removed {} orphaned staging entries", purged.len()),
                );
            }
        }

        let wakeup = Wakeup::new();
        let watch = subscribe(
            &config,
            self.change_source.as_deref(),
            layout.pending.dir(),
            &wakeup,
            diagnostics.as_ref(),
        )?;

        let shared = Arc::new(Shared {
            layout,
            wakeup,
            diagnostics,
            before_execute: self.before_execute,
            idle_rescan_interval: config.idle_rescan_interval,
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = runtime.spawn(run_worker(Arc::clone(&shared), shutdown_rx));

        Ok(JobQueue {
            shared,
            worker: Some(worker),
            shutdown_tx,
            _watch: watch,
        })
    }
}

fn subscribe(
    config: &JobQueueConfig,
    custom: Option<&dyn ChangeSource>,
    dir: &Path,
    wakeup: &Wakeup,
    diagnostics: &dyn Diagnostics,
) -> Result<WatchHandle, JobQueueError> {
    if let Some(source) = custom {
        return source
            .watch(dir, wakeup.clone())
            .map_err(JobQueueError::Watch);
    }

    let polling = PollingWatcher::new(config.poll_interval);
    match config.watch_mode {
        WatchMode::Native => NativeWatcher.watch(dir, wakeup.clone()),
        WatchMode::Polling => polling.watch(dir, wakeup.clone()),
        WatchMode::Auto => NativeWatcher.watch(dir, wakeup.clone()).or_else(|e| {
            diagnostics.emit(
                Severity::Error,
                &format!(
                    "{e}; falling back to polling every {:?}",
                    config.poll_interval
                ),
            );
            polling.watch(dir, wakeup.clone())
        }),
    }
    .map_err(JobQueueError::Watch)
}

/// A durable job queue rooted at a directory.
///
/// Jobs are persisted under `<root>/pending` when added and executed one at a
/// time, earliest `next_execution_time` first, by a background worker task.
/// A successful job is moved to `<root>/completed`; a failed one is
/// rescheduled with backoff until its retries run out, then moved to
/// `<root>/failed`. Pending jobs survive restarts: a new queue opened on the
/// same root picks them up.
///
/// # Lifecycle
///
/// 1. Create with [`JobQueue::open`] or [`JobQueue::builder`]
/// 2. The worker starts immediately and processes jobs in the background
/// 3. Call [`JobQueue::shutdown`] to stop after the current job, or drop the
///    queue to stop at once
///
/// # Example
///
/// ```rust,ignore
/// use file_job_queue::{JobQueue, JobRecord};
///
/// let queue = JobQueue::<MyJob>::open("/var/lib/myapp/jobs")?;
/// queue.add(&JobRecord::new(MyJob::new()).with_max_retries(5))?;
///
/// // Queue processes jobs in the background...
///
/// queue.shutdown().await?;
/// ```
pub struct JobQueue<J: Job> {
    shared: Arc<Shared<J>>,
    worker: Option<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    _watch: WatchHandle,
}

impl<J: Job> JobQueue<J> {
    pub fn builder(root: impl Into<PathBuf>) -> JobQueueBuilder<J> {
        JobQueueBuilder::new(root.into())
    }

    /// Open a queue at `root` with the default configuration.
    #[must_use = "job queue must be stored to keep the worker running"]
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, JobQueueError> {
        Self::builder(root).build()
    }

    pub fn root(&self) -> &Path {
        self.shared.layout.root()
    }

    /// Persist `record` as a pending job.
    ///
    /// The record is written to staging and then moved into the pending store
    /// in one rename, so the worker never sees a partial record.
    ///
    /// # Errors
    ///
    /// - [`JobQueueError::AlreadyExists`] if a job with the same id is pending
    ///
    /// The id of a job that already completed or failed may be added again;
    /// when it finishes, its old record in that store is replaced.
    /// - [`JobQueueError::AddFailed`] if serialization or the filesystem fails
    pub fn add(&self, record: &JobRecord<J>) -> Result<(), JobQueueError> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| JobQueueError::AddFailed(StoreError::from(e)))?;

        let layout = &self.shared.layout;
        match layout.pending.admit(&layout.staging, record.id, &bytes) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(id)) => return Err(JobQueueError::AlreadyExists(id)),
            Err(e) => return Err(JobQueueError::AddFailed(e)),
        }

        self.shared
            .report(Severity::Debug, format!("added job {}", record.id));
        self.shared.wakeup.wake();
        Ok(())
    }

    /// Add `job` with default scheduling and return its new id.
    pub fn enqueue(&self, job: J) -> Result<JobId, JobQueueError> {
        let record = JobRecord::new(job);
        self.add(&record)?;
        Ok(record.id)
    }

    /// Jobs waiting to run or to be retried.
    pub fn pending_jobs(&self) -> Vec<JobRecord<J>> {
        self.shared.layout.pending.records()
    }

    pub fn completed_jobs(&self) -> Vec<JobRecord<J>> {
        self.shared.layout.completed.records()
    }

    pub fn failed_jobs(&self) -> Vec<JobRecord<J>> {
        self.shared.layout.failed.records()
    }

    /// Number of pending jobs that decode; corrupt entries are not counted.
    pub fn pending_count(&self) -> usize {
        self.pending_jobs().len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed_jobs().len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed_jobs().len()
    }

    /// Gracefully shutdown the queue.
    ///
    /// The worker finishes the job it is executing, if any, and exits.
    ///
    /// # Errors
    ///
    /// Returns [`JobQueueError::WorkerPanicked`] if the worker panicked.
    pub async fn shutdown(mut self) -> Result<(), JobQueueError> {
        let _ = self.shutdown_tx.send(());

        if let Some(worker) = self.worker.take() {
            worker.await.map_err(|e| JobQueueError::WorkerPanicked {
                reason: e.to_string(),
            })?;
        }

        self.shared.report(Severity::Info, "Job queue shut down");
        Ok(())
    }
}

impl<J: Job> Drop for JobQueue<J> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

struct Shared<J: Job> {
    layout: StoreLayout,
    wakeup: Wakeup,
    diagnostics: Arc<dyn Diagnostics>,
    before_execute: Option<BeforeExecute<J>>,
    idle_rescan_interval: Duration,
}

enum Selection<J> {
    Ready(JobRecord<J>),
    Idle { next_due: Option<DateTime<Utc>> },
}

/// Execution order: earliest `next_execution_time`, then lowest id.
fn runs_before<J>(a: &JobRecord<J>, b: &JobRecord<J>) -> bool {
    (a.next_execution_time, a.id) < (b.next_execution_time, b.id)
}

impl<J: Job> Shared<J> {
    fn report(&self, severity: Severity, message: impl AsRef<str>) {
        self.diagnostics.emit(severity, message.as_ref());
    }

    fn select_next(&self, now: DateTime<Utc>) -> Selection<J> {
        let pending = &self.layout.pending;
        let mut ready: Option<JobRecord<J>> = None;
        let mut next_due: Option<DateTime<Utc>> = None;

        for record in pending.list_ids().filter_map(|id| pending.read_record::<J>(id)) {
            if record.is_eligible(now) {
                if ready.as_ref().is_none_or(|best| runs_before(&record, best)) {
                    ready = Some(record);
                }
            } else {
                let due = record.next_execution_time;
                next_due = Some(next_due.map_or(due, |current| current.min(due)));
            }
        }

        match ready {
            Some(record) => Selection::Ready(record),
            None => Selection::Idle { next_due },
        }
    }

    fn idle_wait(&self, next_due: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        next_due
            .and_then(|due| (due - now).to_std().ok())
            .map_or(self.idle_rescan_interval, |until_due| {
                until_due.min(self.idle_rescan_interval)
            })
    }

    async fn process(&self, mut record: JobRecord<J>) {
        if let Some(hook) = &self.before_execute {
            hook(&mut record.job);
        }

        let id = record.id;
        let attempt = record.attempt();
        self.report(
            Severity::Debug,
            format!(
                "executing job {id} (attempt {} of {})",
                u64::from(attempt.retry_count) + 1,
                u64::from(attempt.max_retries) + 1
            ),
        );

        // Dropping the worker mid-attempt must abort the attempt as well.
        let job = record.job.clone();
        let mut execution = AbortOnDrop(tokio::spawn(async move { job.execute(attempt).await }));
        let outcome = match (&mut execution.0).await {
            Ok(outcome) => outcome,
            Err(e) => Err(JobFailure::new(format!("job execution panicked: {e}"))),
        };

        match outcome {
            Ok(()) => self.file_as(id, StoreKind::Completed),
            Err(failure) if record.retries_exhausted() => {
                self.report(
                    Severity::Info,
                    format!(
                        "job {id} failed after {} retries: {failure}",
                        record.retry_count
                    ),
                );
                self.file_as(id, StoreKind::Failed);
            }
            Err(failure) => self.schedule_retry(record, &failure),
        }
    }

    /// Move a finished job out of pending.
    ///
    /// A record already filed under `kind` with the same id, left by an
    /// earlier run of a re-added job, is replaced.
    fn file_as(&self, id: JobId, kind: StoreKind) {
        let pending = &self.layout.pending;
        let destination = self.layout.store(kind);

        let moved = match pending.transfer_into(destination, id) {
            Err(StoreError::AlreadyExists(_)) => {
                self.report(
                    Severity::Error,
                    format!("replacing stale {kind} entry for job {id}"),
                );
                destination
                    .remove(id)
                    .and_then(|()| pending.transfer_into(destination, id))
            }
            other => other,
        };

        match moved {
            Ok(()) => self.report(Severity::Debug, format!("job {id} moved to {kind}")),
            Err(StoreError::NotFound(_)) => {
                self.report(Severity::Debug, format!("job {id} already left pending"));
            }
            Err(e) => self.report(
                Severity::Fault,
                format!("failed to move job {id} from pending to {kind}: {e}"),
            ),
        }
    }

    /// Persist the next retry of a failed job, or give up on it if that fails.
    fn schedule_retry(&self, mut record: JobRecord<J>, failure: &JobFailure) {
        record.advance_for_retry(Utc::now());
        let id = record.id;

        let persisted = serde_json::to_vec_pretty(&record)
            .map_err(StoreError::from)
            .and_then(|bytes| self.layout.pending.rewrite(id, &bytes));

        match persisted {
            Ok(()) => self.report(
                Severity::Debug,
                format!(
                    "job {id} failed ({failure}); retry {}/{} scheduled for {}",
                    record.retry_count, record.max_retries, record.next_execution_time
                ),
            ),
            Err(StoreError::NotFound(_)) => {
                self.report(Severity::Debug, format!("job {id} already left pending"));
            }
            Err(e) => {
                // The on-disk retry count is stale; retrying would never end.
                self.report(
                    Severity::Fault,
                    format!("failed to persist retry state for job {id}: {e}; filing it as failed"),
                );
                self.file_as(id, StoreKind::Failed);
            }
        }
    }
}

async fn run_worker<J: Job>(shared: Arc<Shared<J>>, mut shutdown_rx: broadcast::Receiver<()>) {
    shared.report(Severity::Debug, "Worker starting");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Empty | TryRecvError::Lagged(_)) => {}
        }

        let now = Utc::now();
        match shared.select_next(now) {
            Selection::Ready(record) => shared.process(record).await,
            Selection::Idle { next_due } => {
                let wait = shared.idle_wait(next_due, now);
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    () = shared.wakeup.woken() => {}
                    () = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    shared.report(Severity::Debug, "Worker shutting down");
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Attempt;
    use chrono::TimeDelta;
    use serde::{Deserialize, Serialize};
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Appends its label to a file; fails while `retry_count < fail_first`.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Mark {
        log: PathBuf,
        label: String,
        fail_first: u32,
    }

    impl Mark {
        fn new(log: &Path, label: &str) -> Self {
            Self {
                log: log.to_path_buf(),
                label: label.into(),
                fail_first: 0,
            }
        }
    }

    impl Job for Mark {
        async fn execute(&self, attempt: Attempt) -> Result<(), JobFailure> {
            let mut file = OpenOptions::new().create(true).append(true).open(&self.log)?;
            writeln!(file, "{}", self.label)?;
            if attempt.retry_count < self.fail_first {
                return Err(JobFailure::new("forced failure"));
            }
            Ok(())
        }

        fn retry_delay(&self, _retry_count: u32) -> Duration {
            Duration::ZERO
        }
    }

    // Writes "start", sleeps, then writes "done".
    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Slow {
        log: PathBuf,
        millis: u64,
    }

    impl Job for Slow {
        async fn execute(&self, _attempt: Attempt) -> Result<(), JobFailure> {
            let append = |line: &str| -> std::io::Result<()> {
                let mut file = OpenOptions::new().create(true).append(true).open(&self.log)?;
                writeln!(file, "{line}")
            };
            append("start")?;
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            append("done")?;
            Ok(())
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Explode;

    impl Job for Explode {
        async fn execute(&self, _attempt: Attempt) -> Result<(), JobFailure> {
            panic!("boom");
        }

        fn retry_delay(&self, _retry_count: u32) -> Duration {
            Duration::ZERO
        }
    }

    #[derive(Clone, Default)]
    struct Recorded(Arc<Mutex<Vec<(Severity, String)>>>);

    impl Diagnostics for Recorded {
        fn emit(&self, severity: Severity, message: &str) {
            self.0.lock().unwrap().push((severity, message.to_string()));
        }
    }

    impl Recorded {
        fn any(&self, severity: Severity, needle: &str) -> bool {
            self.0
                .lock()
                .unwrap()
                .iter()
                .any(|(s, m)| *s == severity && m.contains(needle))
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    // =========================================================================
    // Config Tests
    // =========================================================================

    #[test]
    fn config_default_has_sensible_values() {
        let config = JobQueueConfig::default();
        assert_eq!(config.watch_mode, WatchMode::Auto);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.idle_rescan_interval, Duration::from_secs(30));
        assert!(config.purge_staging_on_open);
    }

    #[tokio::test]
    async fn build_rejects_zero_poll_interval() {
        let tmp = TempDir::new().unwrap();
        let result = JobQueue::<Mark>::builder(tmp.path())
            .poll_interval(Duration::ZERO)
            .build();
        match result {
            Err(e) => assert!(e.to_string().contains("poll_interval must be greater than 0")),
            Ok(_) => panic!("Expected error for zero poll_interval"),
        }
    }

    #[tokio::test]
    async fn build_rejects_zero_idle_rescan_interval() {
        let tmp = TempDir::new().unwrap();
        let result = JobQueue::<Mark>::builder(tmp.path())
            .idle_rescan_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(JobQueueError::InvalidConfig(_))));
    }

    #[test]
    fn build_requires_runtime() {
        let tmp = TempDir::new().unwrap();
        let result = JobQueue::<Mark>::open(tmp.path());
        assert!(matches!(result, Err(JobQueueError::RuntimeUnavailable)));
    }

    #[tokio::test]
    async fn build_fails_when_store_path_is_a_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("pending"), b"in the way").unwrap();

        let result = JobQueue::<Mark>::open(tmp.path());
        assert!(matches!(
            result,
            Err(JobQueueError::Setup(StoreError::PathOccupied(_)))
        ));
    }

    #[tokio::test]
    async fn build_purges_orphaned_staging_entries() {
        let tmp = TempDir::new().unwrap();
        let orphan = JobId::new();
        let staged = tmp.path().join("staging").join(orphan.to_string());
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("payload"), b"partial").unwrap();

        let diagnostics = Recorded::default();
        let _queue = JobQueue::<Mark>::builder(tmp.path())
            .diagnostics(diagnostics.clone())
            .build()
            .unwrap();

        assert!(!staged.exists());
        assert!(diagnostics.any(Severity::Info, "orphaned staging"));
    }

    #[tokio::test]
    async fn build_can_keep_staging_entries() {
        let tmp = TempDir::new().unwrap();
        let staged = tmp.path().join("staging").join(JobId::new().to_string());
        fs::create_dir_all(&staged).unwrap();

        let _queue = JobQueue::<Mark>::builder(tmp.path())
            .purge_staging_on_open(false)
            .build()
            .unwrap();

        assert!(staged.exists());
    }

    // =========================================================================
    // Selection Tests
    // =========================================================================

    fn shared(root: &Path) -> Shared<Mark> {
        shared_reporting_to(root, &Recorded::default())
    }

    fn shared_reporting_to(root: &Path, diagnostics: &Recorded) -> Shared<Mark> {
        let layout = StoreLayout::new(root);
        layout.setup().unwrap();
        Shared {
            layout,
            wakeup: Wakeup::new(),
            diagnostics: Arc::new(diagnostics.clone()),
            before_execute: None,
            idle_rescan_interval: Duration::from_secs(30),
        }
    }

    fn admit(shared: &Shared<Mark>, record: &JobRecord<Mark>) {
        let bytes = serde_json::to_vec(record).unwrap();
        shared
            .layout
            .pending
            .admit(&shared.layout.staging, record.id, &bytes)
            .unwrap();
    }

    #[test]
    fn selection_picks_earliest_eligible() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(tmp.path());
        let now = Utc::now();
        let log = tmp.path().join("log");

        let older = JobRecord::new(Mark::new(&log, "older")).scheduled_at(now - TimeDelta::seconds(10));
        let newer = JobRecord::new(Mark::new(&log, "newer")).scheduled_at(now - TimeDelta::seconds(1));
        let future = JobRecord::new(Mark::new(&log, "future")).scheduled_at(now - TimeDelta::seconds(60) + TimeDelta::hours(1));
        for record in [&newer, &future, &older] {
            admit(&shared, record);
        }

        match shared.select_next(now) {
            Selection::Ready(record) => assert_eq!(record.id, older.id),
            Selection::Idle { .. } => panic!("expected an eligible job"),
        }
    }

    #[test]
    fn selection_breaks_ties_by_id() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(tmp.path());
        let now = Utc::now();
        let log = tmp.path().join("log");

        let records: Vec<_> = (0..5)
            .map(|i| JobRecord::new(Mark::new(&log, &i.to_string())).scheduled_at(now))
            .collect();
        for record in records.iter().rev() {
            admit(&shared, record);
        }
        let lowest = records.iter().map(|r| r.id).min().unwrap();

        match shared.select_next(now) {
            Selection::Ready(record) => assert_eq!(record.id, lowest),
            Selection::Idle { .. } => panic!("expected an eligible job"),
        }
    }

    #[test]
    fn selection_reports_next_due_when_idle() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(tmp.path());
        let now = Utc::now();
        let log = tmp.path().join("log");
        let soon = now + TimeDelta::seconds(5);

        admit(&shared, &JobRecord::new(Mark::new(&log, "later")).scheduled_at(now + TimeDelta::hours(1)));
        admit(&shared, &JobRecord::new(Mark::new(&log, "soon")).scheduled_at(soon));

        match shared.select_next(now) {
            Selection::Idle { next_due } => assert_eq!(next_due, Some(soon)),
            Selection::Ready(_) => panic!("nothing should be eligible yet"),
        }
        assert_eq!(shared.idle_wait(Some(soon), now), Duration::from_secs(5));
        assert_eq!(shared.idle_wait(None, now), Duration::from_secs(30));
        assert_eq!(
            shared.idle_wait(Some(now + TimeDelta::days(1)), now),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn selection_ignores_corrupt_entries() {
        let tmp = TempDir::new().unwrap();
        let shared = shared(tmp.path());
        let broken = shared.layout.pending.locate(JobId::new());
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("payload"), b"garbage").unwrap();

        assert!(matches!(
            shared.select_next(Utc::now()),
            Selection::Idle { next_due: None }
        ));
    }

    #[test]
    fn failed_move_is_a_fault_and_job_stays_pending() {
        let tmp = TempDir::new().unwrap();
        let diagnostics = Recorded::default();
        let shared = shared_reporting_to(tmp.path(), &diagnostics);
        let record = JobRecord::new(Mark::new(&tmp.path().join("log"), "stuck"));
        admit(&shared, &record);

        let completed = shared.layout.completed.dir().to_path_buf();
        fs::remove_dir(&completed).unwrap();
        fs::write(&completed, b"not a directory").unwrap();

        shared.file_as(record.id, StoreKind::Completed);

        assert!(diagnostics.any(Severity::Fault, "failed to move job"));
        assert!(shared.layout.pending.contains(record.id));
    }

    // =========================================================================
    // JobQueue Behavior Tests
    // =========================================================================

    #[tokio::test]
    async fn add_rejects_duplicate_pending_id() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("log");
        let queue = JobQueue::<Mark>::open(tmp.path().join("q")).unwrap();
        let record = JobRecord::new(Mark::new(&log, "once"))
            .scheduled_at(Utc::now() + TimeDelta::hours(1));

        queue.add(&record).unwrap();
        let err = queue.add(&record).unwrap_err();

        assert!(matches!(err, JobQueueError::AlreadyExists(id) if id == record.id));
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn processes_single_job() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("log");
        let queue = JobQueue::<Mark>::open(tmp.path().join("q")).unwrap();

        let id = queue.enqueue(Mark::new(&log, "hello")).unwrap();

        assert!(eventually(|| queue.completed_count() == 1).await);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.failed_count(), 0);
        assert_eq!(queue.completed_jobs()[0].id, id);
        assert_eq!(lines(&log), vec!["hello"]);
    }

    #[tokio::test]
    async fn before_execute_hook_changes_the_attempt() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("log");
        let queue = JobQueue::<Mark>::builder(tmp.path().join("q"))
            .before_execute(|job: &mut Mark| job.label = "rewritten".into())
            .build()
            .unwrap();

        queue.enqueue(Mark::new(&log, "original")).unwrap();

        assert!(eventually(|| queue.completed_count() == 1).await);
        assert_eq!(lines(&log), vec!["rewritten"]);
    }

    #[tokio::test]
    async fn panicking_job_counts_as_failed_attempt() {
        let tmp = TempDir::new().unwrap();
        let diagnostics = Recorded::default();
        let queue = JobQueue::<Explode>::builder(tmp.path())
            .diagnostics(diagnostics.clone())
            .build()
            .unwrap();

        queue.add(&JobRecord::new(Explode).with_max_retries(1)).unwrap();

        assert!(eventually(|| queue.failed_count() == 1).await);
        assert_eq!(queue.failed_jobs()[0].retry_count, 1);
        assert!(diagnostics.any(Severity::Info, "panicked"));
    }

    #[tokio::test]
    async fn stale_terminal_entry_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("log");
        let diagnostics = Recorded::default();
        let queue = JobQueue::<Mark>::builder(tmp.path().join("q"))
            .diagnostics(diagnostics.clone())
            .build()
            .unwrap();

        let record = JobRecord::new(Mark::new(&log, "again"));
        queue.add(&record).unwrap();
        assert!(eventually(|| queue.completed_count() == 1).await);

        queue.add(&record).unwrap();
        assert!(eventually(|| lines(&log).len() == 2 && queue.pending_count() == 0).await);
        assert_eq!(queue.completed_count(), 1);
        assert!(diagnostics.any(Severity::Error, "replacing stale completed entry"));
    }

    #[tokio::test]
    async fn shutdown_is_graceful() {
        let tmp = TempDir::new().unwrap();
        let diagnostics = Recorded::default();
        let queue = JobQueue::<Mark>::builder(tmp.path())
            .diagnostics(diagnostics.clone())
            .build()
            .unwrap();

        let result = queue.shutdown().await;
        assert!(result.is_ok());
        assert!(diagnostics.any(Severity::Info, "shut down"));
    }

    #[tokio::test]
    async fn dropping_queue_aborts_running_attempt() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("log");
        let root = tmp.path().join("q");
        let queue = JobQueue::<Slow>::open(&root).unwrap();
        let id = queue
            .enqueue(Slow {
                log: log.clone(),
                millis: 300,
            })
            .unwrap();

        assert!(eventually(|| lines(&log) == vec!["start"]).await);
        drop(queue);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(lines(&log), vec!["start"]);

        let layout = StoreLayout::new(&root);
        assert!(layout.pending.contains(id));
        assert!(!layout.completed.contains(id));
    }

    #[tokio::test]
    async fn dropped_queue_stops_processing() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("log");
        let root = tmp.path().join("q");
        let queue = JobQueue::<Mark>::open(&root).unwrap();
        drop(queue);

        let layout = StoreLayout::new(&root);
        let record = JobRecord::new(Mark::new(&log, "orphan"));
        let bytes = serde_json::to_vec(&record).unwrap();
        layout.pending.admit(&layout.staging, record.id, &bytes).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(layout.pending.contains(record.id));
        assert!(lines(&log).is_empty());
    }
}
