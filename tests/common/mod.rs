#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use file_job_queue::{Attempt, Diagnostics, Job, JobFailure, Severity};
use serde::{Deserialize, Serialize};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("file_job_queue=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Appends a line to a log file on every attempt.
///
/// Fails while `retry_count < fail_first`, writing `<label>-fail-<n>`;
/// on success writes `<label>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendLine {
    pub log: PathBuf,
    pub label: String,
    pub fail_first: u32,
}

impl AppendLine {
    pub fn new(log: &Path, label: impl Into<String>) -> Self {
        Self {
            log: log.to_path_buf(),
            label: label.into(),
            fail_first: 0,
        }
    }

    pub fn failing(mut self, times: u32) -> Self {
        self.fail_first = times;
        self
    }
}

impl Job for AppendLine {
    async fn execute(&self, attempt: Attempt) -> Result<(), JobFailure> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.log)?;
        if attempt.retry_count < self.fail_first {
            writeln!(file, "{}-fail-{}", self.label, attempt.retry_count)?;
            return Err(JobFailure::new(format!("{} not ready yet", self.label)));
        }
        writeln!(file, "{}", self.label)?;
        Ok(())
    }

    fn retry_delay(&self, _retry_count: u32) -> Duration {
        Duration::ZERO
    }
}

/// Always fails, and first plants a directory where the queue writes the
/// rescheduled record, so persisting the retry cannot succeed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockRetryState {
    pub pending: PathBuf,
}

impl Job for BlockRetryState {
    async fn execute(&self, attempt: Attempt) -> Result<(), JobFailure> {
        let scratch = self
            .pending
            .join(attempt.job_id.to_string())
            .join("payload.tmp");
        fs::create_dir_all(scratch)?;
        Err(JobFailure::new("always failing"))
    }

    fn retry_delay(&self, _retry_count: u32) -> Duration {
        Duration::ZERO
    }
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[derive(Clone, Default)]
pub struct RecordingDiagnostics {
    events: Arc<Mutex<Vec<(Severity, String)>>>,
}

impl RecordingDiagnostics {
    pub fn count(&self, severity: Severity) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == severity)
            .count()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn emit(&self, severity: Severity, message: &str) {
        self.events.lock().unwrap().push((severity, message.to_string()));
    }
}
