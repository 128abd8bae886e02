//! The four stores that make up a queue root.

use std::fmt;
use std::path::{Path, PathBuf};

use super::{StateStore, StoreError};
use crate::job::JobId;

/// Lifecycle state a job can be filed under.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StoreKind {
    /// Transient home of a record while it is being admitted.
    Staging,
    /// Waiting to run, or waiting for its next retry.
    Pending,
    /// Ran successfully.
    Completed,
    /// Ran out of retries.
    Failed,
}

impl StoreKind {
    /// Name of the store's directory under the queue root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Stores rooted at one queue directory.
///
/// ```text
/// <root>/staging/<job-id>/payload
/// <root>/pending/<job-id>/payload
/// <root>/completed/<job-id>/payload
/// <root>/failed/<job-id>/payload
/// ```
#[derive(Clone, Debug)]
pub struct StoreLayout {
    root: PathBuf,
    pub staging: StateStore,
    pub pending: StateStore,
    pub completed: StateStore,
    pub failed: StateStore,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let store = |kind: StoreKind| StateStore::new(root.join(kind.dir_name()));
        Self {
            staging: store(StoreKind::Staging),
            pending: store(StoreKind::Pending),
            completed: store(StoreKind::Completed),
            failed: store(StoreKind::Failed),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self, kind: StoreKind) -> &StateStore {
        match kind {
            StoreKind::Staging => &self.staging,
            StoreKind::Pending => &self.pending,
            StoreKind::Completed => &self.completed,
            StoreKind::Failed => &self.failed,
        }
    }

    /// Make sure every store directory exists.
    pub fn setup(&self) -> Result<(), StoreError> {
        [
            StoreKind::Pending,
            StoreKind::Completed,
            StoreKind::Failed,
            StoreKind::Staging,
        ]
        .into_iter()
        .try_for_each(|kind| self.store(kind).setup())
    }

    /// Delete entries a crash left behind in staging.
    ///
    /// Returns the ids that were removed. Entries that cannot be removed are
    /// skipped.
    pub fn purge_staging(&self) -> Vec<JobId> {
        self.staging
            .list_ids()
            .filter(|id| self.staging.remove(*id).is_ok())
            .collect()
    }
}
