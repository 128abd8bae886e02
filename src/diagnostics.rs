//! Diagnostics sink for failures the queue recovers from on its own.
//!
//! The queue never logs through a global; it reports to the [`Diagnostics`]
//! handed to its builder. [`TracingDiagnostics`] is the default and forwards
//! everything to `tracing`.

use std::fmt;
use std::path::Path;

use tracing::{debug, error, info};

/// Severity of a diagnostics message, from least to most severe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Severity {
    Debug,
    Info,
    Error,
    /// A failure that may leave a job somewhere an operator has to look at.
    Fault,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Error => "error",
            Self::Fault => "fault",
        })
    }
}

/// Receiver of leveled messages about the queue's internal progress.
///
/// Implementations must not block for long; they are called from the worker.
pub trait Diagnostics: Send + Sync + 'static {
    fn emit(&self, severity: Severity, message: &str);
}

/// Forwards diagnostics to `tracing`, tagged with the queue root.
///
/// Faults are logged at `ERROR` with `fault = true`.
#[derive(Clone, Debug)]
pub struct TracingDiagnostics {
    queue: String,
    min_severity: Severity,
}

impl TracingDiagnostics {
    pub fn new(root: &Path) -> Self {
        Self {
            queue: root.display().to_string(),
            min_severity: Severity::Debug,
        }
    }

    /// Drop messages below `severity` before they reach `tracing`.
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }
}

impl Diagnostics for TracingDiagnostics {
    fn emit(&self, severity: Severity, message: &str) {
        if severity < self.min_severity {
            return;
        }
        match severity {
            Severity::Debug => debug!(queue = %self.queue, "{message}"),
            Severity::Info => info!(queue = %self.queue, "{message}"),
            Severity::Error => error!(queue = %self.queue, "{message}"),
            Severity::Fault => error!(queue = %self.queue, fault = true, "{message}"),
        }
    }
}
