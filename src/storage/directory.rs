//! A single lifecycle state backed by one directory.

use std::fs::{self, File, ReadDir};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use super::StoreError;
use crate::job::{JobId, JobRecord};

/// File holding the serialized record inside a job's directory.
pub const PAYLOAD_FILE: &str = "payload";

const REWRITE_FILE: &str = "payload.tmp";

/// Directory holding the jobs that are in one lifecycle state.
///
/// Every job is a sub-directory named after its [`JobId`] that contains a
/// single [`PAYLOAD_FILE`]. Moving a job between states is a rename of that
/// sub-directory, so a reader never observes a half-written record.
///
/// # Cloning
///
/// A `StateStore` is only a path; clones address the same directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PathOccupied`] if something other than a
    /// directory already lives at the store's path.
    pub fn setup(&self) -> Result<(), StoreError> {
        match fs::metadata(&self.dir) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::PathOccupied(self.dir.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))
            }
            Err(e) => Err(StoreError::io(&self.dir, e)),
        }
    }

    /// Directory of the entry for `id`.
    pub fn locate(&self, id: JobId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Path of the serialized record for `id`.
    pub fn payload_path(&self, id: JobId) -> PathBuf {
        self.locate(id).join(PAYLOAD_FILE)
    }

    pub fn contains(&self, id: JobId) -> bool {
        fs::symlink_metadata(self.locate(id)).is_ok()
    }

    /// Ids currently present, read lazily from a fresh directory listing.
    ///
    /// Entries whose name is not a job id are skipped. No ordering is implied.
    pub fn list_ids(&self) -> StoreIds {
        StoreIds {
            entries: fs::read_dir(&self.dir).ok(),
        }
    }

    /// Decode the record stored for `id`.
    ///
    /// Missing, unreadable or corrupt entries yield `None`, as does a payload
    /// whose embedded id disagrees with its directory name.
    pub fn read_record<J: DeserializeOwned>(&self, id: JobId) -> Option<JobRecord<J>> {
        let bytes = fs::read(self.payload_path(id)).ok()?;
        let record: JobRecord<J> = serde_json::from_slice(&bytes).ok()?;
        (record.id == id).then_some(record)
    }

    /// Every record that currently decodes.
    pub fn records<J: DeserializeOwned>(&self) -> Vec<JobRecord<J>> {
        self.list_ids().filter_map(|id| self.read_record(id)).collect()
    }

    /// Atomically add a new entry for `id` holding `bytes`.
    ///
    /// The payload is written and synced under `staging` first; the finished
    /// directory is then renamed into this store in a single step.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if this store already holds `id`
    /// or `id` is already being staged, or [`StoreError::Io`] if staging or the
    /// final rename fails. A staged copy created by this call is removed on
    /// every error path.
    pub fn admit(&self, staging: &StateStore, id: JobId, bytes: &[u8]) -> Result<(), StoreError> {
        let staged = staging.locate(id);
        // An existing staged entry is another admit of this id in flight.
        fs::create_dir(&staged).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                StoreError::AlreadyExists(id)
            } else {
                StoreError::io(&staged, e)
            }
        })?;
        let payload = staged.join(PAYLOAD_FILE);
        if let Err(e) = write_synced(&payload, bytes) {
            let _ = fs::remove_dir_all(&staged);
            return Err(StoreError::io(&payload, e));
        }

        if self.contains(id) {
            let _ = fs::remove_dir_all(&staged);
            return Err(StoreError::AlreadyExists(id));
        }

        let target = self.locate(id);
        if let Err(e) = fs::rename(&staged, &target) {
            let _ = fs::remove_dir_all(&staged);
            // Lost a race against another admit of the same id.
            if self.contains(id) {
                return Err(StoreError::AlreadyExists(id));
            }
            return Err(StoreError::io(&target, e));
        }
        Ok(())
    }

    /// Move the entry for `id` into `other`, keeping its bytes untouched.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if this store no longer holds `id`
    /// - [`StoreError::AlreadyExists`] if `other` already holds `id`
    /// - [`StoreError::Io`] if the rename fails
    pub fn transfer_into(&self, other: &StateStore, id: JobId) -> Result<(), StoreError> {
        if !self.contains(id) {
            return Err(StoreError::NotFound(id));
        }
        if other.contains(id) {
            return Err(StoreError::AlreadyExists(id));
        }

        let source = self.locate(id);
        fs::rename(&source, other.locate(id)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(id)
            } else {
                StoreError::io(&source, e)
            }
        })
    }

    /// Replace the payload of an existing entry.
    ///
    /// The new bytes go to a sibling file that is renamed over the payload, so
    /// readers see either the old record or the new one.
    pub fn rewrite(&self, id: JobId, bytes: &[u8]) -> Result<(), StoreError> {
        let entry = self.locate(id);
        if !entry.is_dir() {
            return Err(StoreError::NotFound(id));
        }

        let scratch = entry.join(REWRITE_FILE);
        write_synced(&scratch, bytes).map_err(|e| StoreError::io(&scratch, e))?;

        let payload = entry.join(PAYLOAD_FILE);
        fs::rename(&scratch, &payload).map_err(|e| {
            let _ = fs::remove_file(&scratch);
            StoreError::io(&payload, e)
        })
    }

    /// Delete the entry for `id` and everything inside it.
    ///
    /// The queue uses this on the completed and failed stores when a re-added
    /// id finishes again: the old terminal record is replaced by the new one.
    pub fn remove(&self, id: JobId) -> Result<(), StoreError> {
        let entry = self.locate(id);
        match fs::remove_dir_all(&entry) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(StoreError::io(&entry, e)),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Iterator over the ids found in a [`StateStore`] listing.
///
/// Produced by [`StateStore::list_ids`]; call that again for a fresh listing.
#[derive(Debug)]
pub struct StoreIds {
    entries: Option<ReadDir>,
}

impl Iterator for StoreIds {
    type Item = JobId;

    fn next(&mut self) -> Option<JobId> {
        let entries = self.entries.as_mut()?;
        for entry in entries.by_ref() {
            let Ok(entry) = entry else { continue };
            if let Some(id) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
                return Some(id);
            }
        }
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
