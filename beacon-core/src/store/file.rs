//! JSON file backend
//!
//! Each record kind lives in its own file under the storage directory
//! (`sessions.json`, `events.json`, `exceptions.json`, `user_details.json`),
//! next to `settings.json`. Every file has a `.backup` sibling holding the
//! previous generation.
//!
//! Writes go to a temporary file that is synced, then the current file is
//! renamed to `.backup` and the temporary file renamed into place. A crash at
//! any point leaves either the new file or the previous generation readable.
//!
//! Reads try the primary file, then the `.backup`; if neither parses the
//! collection is treated as empty.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Change, QueueBackend};
use crate::error::{Error, Result};
use crate::types::{QueueEntry, RecordKind};

const SETTINGS_FILE: &str = "settings";

/// Queue backend storing JSON files in one directory.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Use `dir` for queue files, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Primary path of a named record
    pub fn primary_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Backup path of a named record
    pub fn backup_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json.backup", name))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json.tmp", name))
    }

    /// Load a named record, falling back to its backup.
    fn read_record<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        for path in [self.primary_path(name), self.backup_path(name)] {
            match read_json::<T>(&path) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Unreadable queue file, trying backup"
                    );
                }
            }
        }
        None
    }

    /// Atomically replace a named record, keeping the previous generation as backup.
    fn write_record<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let primary = self.primary_path(name);
        let backup = self.backup_path(name);
        let temp = self.temp_path(name);

        let json = serde_json::to_vec(value)?;
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }

        match fs::rename(&primary, &backup) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::rename(&temp, &primary)?;
        Ok(())
    }

    fn write_kind(&self, kind: RecordKind, entries: &[QueueEntry]) -> Result<()> {
        let of_kind: Vec<&QueueEntry> = entries.iter().filter(|e| e.kind() == kind).collect();
        self.write_record(kind.as_str(), &of_kind)
    }
}

/// Read and parse a JSON file. `Ok(None)` when it does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::Serialization(format!("{}: {}", path.display(), e)))
}

impl QueueBackend for FileBackend {
    fn load_all(&mut self) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for kind in RecordKind::ALL {
            let loaded: Vec<QueueEntry> = self.read_record(kind.as_str()).unwrap_or_default();
            let (matching, misplaced): (Vec<_>, Vec<_>) =
                loaded.into_iter().partition(|e| e.kind() == kind);
            if !misplaced.is_empty() {
                tracing::warn!(
                    file = kind.as_str(),
                    count = misplaced.len(),
                    "Skipping records stored under the wrong kind"
                );
            }
            entries.extend(matching);
        }
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    fn commit(&mut self, change: Change<'_>, entries: &[QueueEntry]) -> Result<()> {
        for kind in change.kinds() {
            self.write_kind(kind, entries)?;
        }
        Ok(())
    }

    fn load_settings(&mut self) -> Result<BTreeMap<String, String>> {
        Ok(self.read_record(SETTINGS_FILE).unwrap_or_default())
    }

    fn save_settings(&mut self, settings: &BTreeMap<String, String>) -> Result<()> {
        self.write_record(SETTINGS_FILE, settings)
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}
