//! Change notification for the pending store.
//!
//! A watcher only wakes the worker; the worker always re-reads the store to
//! decide what to do. Two sources are provided:
//!
//! - [`NativeWatcher`] - OS notifications through the `notify` crate
//! - [`PollingWatcher`] - periodic directory snapshots on a tokio interval

use std::any::Any;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use notify::{EventKind, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::storage::PAYLOAD_FILE;

/// Errors raised while subscribing to a directory.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The OS watcher could not be created or attached.
    #[error("native watcher unavailable for {}: {source}", .path.display())]
    Native {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// Polling needs a tokio runtime to schedule its task on.
    #[error("polling watcher requires a running tokio runtime")]
    NoRuntime,
}

/// How the queue learns that the pending store changed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WatchMode {
    /// Native notifications, falling back to polling if they are unavailable.
    #[default]
    Auto,
    /// Native notifications only; building the queue fails without them.
    Native,
    /// Poll the directory every `poll_interval`.
    Polling,
}

/// Wake-up signal shared between the worker and everything that can wake it.
///
/// Wakes are never lost: a wake delivered while the worker is busy is kept
/// and consumed by the worker's next wait.
#[derive(Clone, Debug, Default)]
pub struct Wakeup {
    notify: Arc<Notify>,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait until [`wake`](Self::wake) is called, or return at once if a wake
    /// is already pending.
    pub async fn woken(&self) {
        self.notify.notified().await;
    }
}

/// Keeps a subscription alive; dropping it stops the notifications.
pub struct WatchHandle {
    _guard: Mutex<Box<dyn Any + Send>>,
}

impl WatchHandle {
    pub fn new<G: Send + 'static>(guard: G) -> Self {
        Self {
            _guard: Mutex::new(Box::new(guard)),
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").finish_non_exhaustive()
    }
}

/// A source of change notifications for a directory.
pub trait ChangeSource: Send + Sync + 'static {
    /// Call `wakeup.wake()` whenever entries in `dir` are added or modified,
    /// until the returned handle is dropped.
    fn watch(&self, dir: &Path, wakeup: Wakeup) -> Result<WatchHandle, WatchError>;
}

/// OS-level directory notifications (inotify, FSEvents, ReadDirectoryChanges).
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeWatcher;

impl ChangeSource for NativeWatcher {
    fn watch(&self, dir: &Path, wakeup: Wakeup) -> Result<WatchHandle, WatchError> {
        let native = |source| WatchError::Native {
            path: dir.to_path_buf(),
            source,
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if !matches!(event.kind, EventKind::Access(_)) {
                    wakeup.wake();
                }
            }
        })
        .map_err(native)?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(native)?;
        Ok(WatchHandle::new(watcher))
    }
}

/// Portable fallback that compares directory snapshots on an interval.
///
/// A snapshot records each entry's name and the modification time of its
/// payload, so both new jobs and rewritten ones are noticed.
#[derive(Clone, Copy, Debug)]
pub struct PollingWatcher {
    interval: Duration,
}

impl PollingWatcher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

type Snapshot = BTreeMap<OsString, Option<SystemTime>>;

fn snapshot(dir: &Path) -> Snapshot {
    let Ok(entries) = fs::read_dir(dir) else {
        return Snapshot::new();
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| {
            let modified = fs::metadata(entry.path().join(PAYLOAD_FILE))
                .and_then(|meta| meta.modified())
                .ok();
            (entry.file_name(), modified)
        })
        .collect()
}

/// Aborts the task when dropped, so it cannot outlive its owner.
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ChangeSource for PollingWatcher {
    fn watch(&self, dir: &Path, wakeup: Wakeup) -> Result<WatchHandle, WatchError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatchError::NoRuntime)?;
        let dir = dir.to_path_buf();
        let interval = self.interval;

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut last = snapshot(&dir);
            loop {
                ticker.tick().await;
                let current = snapshot(&dir);
                if current != last {
                    last = current;
                    wakeup.wake();
                }
            }
        });

        Ok(WatchHandle::new(AbortOnDrop(task)))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
