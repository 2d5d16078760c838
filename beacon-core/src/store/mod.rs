//! Durable upload queue
//!
//! [`PersistentQueue`] owns every record that has not been acknowledged by the
//! collector. It keeps an in-memory copy of the entries and mirrors each
//! mutation to a [`QueueBackend`] before returning, so a record that has been
//! appended survives the process being killed right after.
//!
//! ## Concurrency
//!
//! All mutations go through one mutex. The upload pipeline never holds it
//! across network I/O: it takes a [`PersistentQueue::snapshot`], sends, and
//! then calls [`PersistentQueue::remove_confirmed`] with the sequence numbers
//! it delivered. Entries appended in the meantime carry higher sequence
//! numbers and are left alone.
//!
//! ## Failure policy
//!
//! Telemetry is lossy by nature. A backend that cannot be read is treated as
//! empty, and a backend write that fails is logged while the in-memory queue
//! keeps the record for this process's lifetime. Nothing here panics or
//! returns storage errors to recording calls.

pub mod file;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;
use crate::types::{PendingCounts, QueueEntry, Record, RecordKind, UserDetailsDelta};

/// A mutation applied to the queue, handed to the backend together with the
/// full post-mutation entry list.
#[derive(Debug, Clone, Copy)]
pub enum Change<'a> {
    Appended(&'a QueueEntry),
    Removed(&'a [QueueEntry]),
    Cleared,
}

impl Change<'_> {
    /// Record kinds whose persisted collections are affected.
    pub fn kinds(&self) -> Vec<RecordKind> {
        match self {
            Change::Appended(entry) => vec![entry.kind()],
            Change::Removed(entries) => {
                let mut kinds: Vec<RecordKind> = entries.iter().map(QueueEntry::kind).collect();
                kinds.sort();
                kinds.dedup();
                kinds
            }
            Change::Cleared => RecordKind::ALL.to_vec(),
        }
    }
}

/// Storage behind a [`PersistentQueue`].
///
/// Implementations are only ever called with the queue lock held, so they do
/// not need their own synchronization.
pub trait QueueBackend: Send {
    /// Read every persisted entry. Unreadable data is skipped, not an error.
    fn load_all(&mut self) -> Result<Vec<QueueEntry>>;

    /// Persist `change`; `entries` is the complete queue after it.
    fn commit(&mut self, change: Change<'_>, entries: &[QueueEntry]) -> Result<()>;

    /// Read the settings record.
    fn load_settings(&mut self) -> Result<BTreeMap<String, String>>;

    /// Replace the settings record.
    fn save_settings(&mut self, settings: &BTreeMap<String, String>) -> Result<()>;

    /// Short description for logs (e.g. the directory or database path).
    fn describe(&self) -> String;
}

struct QueueInner {
    entries: Vec<QueueEntry>,
    next_seq: u64,
    settings: BTreeMap<String, String>,
    backend: Box<dyn QueueBackend>,
}

impl QueueInner {
    fn push(&mut self, timestamp: i64, record: Record) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let kind = record.kind();
        self.entries.push(QueueEntry {
            seq,
            timestamp,
            record,
        });

        if let Some(entry) = self.entries.last().cloned() {
            self.commit(Change::Appended(&entry));
        }

        tracing::debug!(seq, %kind, "Queued record");
        seq
    }

    fn commit(&mut self, change: Change<'_>) {
        if let Err(e) = self.backend.commit(change, &self.entries) {
            tracing::warn!(
                backend = %self.backend.describe(),
                error = %e,
                "Failed to persist upload queue; keeping records in memory"
            );
        }
    }
}

/// Durable FIFO of unsent records.
pub struct PersistentQueue {
    inner: Mutex<QueueInner>,
}

impl PersistentQueue {
    /// Open a queue over `backend`, recovering whatever it holds.
    pub fn open(mut backend: Box<dyn QueueBackend>) -> Self {
        let mut entries = backend.load_all().unwrap_or_else(|e| {
            tracing::warn!(
                backend = %backend.describe(),
                error = %e,
                "Failed to load upload queue; starting empty"
            );
            Vec::new()
        });
        entries.sort_by_key(|e| e.seq);
        entries.dedup_by_key(|e| e.seq);

        let settings = backend.load_settings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load settings; starting empty");
            BTreeMap::new()
        });

        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(1);

        if !entries.is_empty() {
            tracing::info!(
                backend = %backend.describe(),
                entries = entries.len(),
                "Recovered unsent records"
            );
        }

        Self {
            inner: Mutex::new(QueueInner {
                entries,
                next_seq,
                settings,
                backend,
            }),
        }
    }

    /// Open the backend selected by `config`.
    pub fn open_config(config: &StorageConfig) -> Result<Self> {
        let backend: Box<dyn QueueBackend> = match config.backend {
            StorageBackend::File => Box::new(FileBackend::open(config.dir())?),
            StorageBackend::Sqlite => Box::new(SqliteBackend::open(&config.dir().join("queue.db"))?),
            StorageBackend::Memory => Box::new(MemoryBackend::new()),
        };
        Ok(Self::open(backend))
    }

    /// Non-durable queue (for testing)
    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryBackend::new()))
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record and persist it. Returns its sequence number.
    pub fn append(&self, timestamp: i64, record: Record) -> u64 {
        self.lock().push(timestamp, record)
    }

    /// Like [`PersistentQueue::append`], but returns `None` instead of
    /// waiting when the queue lock is held, including by this thread.
    pub fn try_append(&self, timestamp: i64, record: Record) -> Option<u64> {
        let mut inner = match self.inner.try_lock() {
            Ok(inner) => inner,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(inner.push(timestamp, record))
    }

    /// Queue a user-details snapshot, superseding any older queued one.
    pub fn replace_user_details(&self, timestamp: i64, delta: UserDetailsDelta) -> u64 {
        {
            let mut inner = self.lock();
            let (stale, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.entries)
                .into_iter()
                .partition(|e| e.kind() == RecordKind::UserDetails);
            inner.entries = keep;
            if !stale.is_empty() {
                inner.commit(Change::Removed(&stale));
            }
        }
        self.append(timestamp, Record::UserDetails(delta))
    }

    /// Copy of all entries in sequence order.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.lock().entries.clone()
    }

    /// Remove exactly the entries whose sequence numbers are listed.
    ///
    /// Unknown sequence numbers are ignored. Returns how many were removed.
    pub fn remove_confirmed(&self, seqs: &[u64]) -> usize {
        if seqs.is_empty() {
            return 0;
        }

        let mut inner = self.lock();
        let (removed, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.entries)
            .into_iter()
            .partition(|e| seqs.contains(&e.seq));
        inner.entries = keep;

        if !removed.is_empty() {
            inner.commit(Change::Removed(&removed));
        }
        removed.len()
    }

    /// Drop every queued entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.commit(Change::Cleared);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Per-kind counts of queued records.
    pub fn pending(&self) -> PendingCounts {
        PendingCounts::from_entries(&self.lock().entries)
    }

    pub fn contains_kind(&self, kind: RecordKind) -> bool {
        self.lock().entries.iter().any(|e| e.kind() == kind)
    }

    /// Latest queued user-details snapshot, if any.
    pub fn latest_user_details(&self) -> Option<UserDetailsDelta> {
        self.lock().entries.iter().rev().find_map(|e| match &e.record {
            Record::UserDetails(delta) => Some(delta.clone()),
            _ => None,
        })
    }

    /// Read a value from the settings record.
    pub fn setting(&self, key: &str) -> Option<String> {
        self.lock().settings.get(key).cloned()
    }

    /// Write a value to the settings record. Returns `true` if it changed.
    pub fn set_setting(&self, key: &str, value: &str) -> bool {
        let mut inner = self.lock();
        if inner.settings.get(key).map(String::as_str) == Some(value) {
            return false;
        }
        inner.settings.insert(key.to_string(), value.to_string());

        let QueueInner {
            settings, backend, ..
        } = &mut *inner;
        if let Err(e) = backend.save_settings(settings) {
            tracing::warn!(key, error = %e, "Failed to persist settings");
        }
        true
    }

    /// Remove a value from the settings record.
    pub fn remove_setting(&self, key: &str) -> bool {
        let mut inner = self.lock();
        if inner.settings.remove(key).is_none() {
            return false;
        }

        let QueueInner {
            settings, backend, ..
        } = &mut *inner;
        if let Err(e) = backend.save_settings(settings) {
            tracing::warn!(key, error = %e, "Failed to persist settings");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, SessionMarker, UserDetails};
    use std::sync::Arc;

    fn event(key: &str) -> Record {
        Record::Events(vec![Event::named(key).unwrap()])
    }

    #[test]
    fn test_append_assigns_increasing_seq() {
        let queue = PersistentQueue::in_memory();
        let a = queue.append(10, event("a"));
        let b = queue.append(11, event("b"));
        assert!(b > a);
        assert_eq!(queue.len(), 2);

        let seqs: Vec<u64> = queue.snapshot().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![a, b]);
    }

    #[test]
    fn test_try_append_gives_up_while_locked() {
        let queue = PersistentQueue::in_memory();
        {
            let _held = queue.lock();
            assert_eq!(queue.try_append(1, event("skipped")), None);
        }
        assert!(queue.is_empty());

        let seq = queue.try_append(2, event("kept")).unwrap();
        assert_eq!(queue.snapshot()[0].seq, seq);
    }

    #[test]
    fn test_remove_confirmed_is_exact() {
        let queue = PersistentQueue::in_memory();
        let a = queue.append(1, event("a"));
        let snapshot = queue.snapshot();

        // Appended while the snapshot is "in flight"
        let b = queue.append(2, event("b"));

        let delivered: Vec<u64> = snapshot.iter().map(|e| e.seq).collect();
        assert_eq!(queue.remove_confirmed(&delivered), 1);

        let remaining: Vec<u64> = queue.snapshot().iter().map(|e| e.seq).collect();
        assert_eq!(remaining, vec![b]);
        assert_eq!(queue.remove_confirmed(&[a]), 0);
    }

    #[test]
    fn test_replace_user_details_keeps_latest() {
        let queue = PersistentQueue::in_memory();
        let mut details = UserDetails::new();
        details.set_name(Some("first"));
        queue.replace_user_details(1, details.delta());
        queue.append(2, event("a"));
        details.set_name(Some("second"));
        queue.replace_user_details(3, details.delta());

        assert_eq!(queue.pending().user_details, 1);
        let latest = queue.latest_user_details().unwrap();
        assert_eq!(latest.details.name(), Some("second"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_pending_counts_and_clear() {
        let queue = PersistentQueue::in_memory();
        queue.append(1, Record::Session(SessionMarker::Heartbeat { duration_secs: 5 }));
        queue.append(2, event("a"));
        assert_eq!(queue.pending().sessions, 1);
        assert!(queue.contains_kind(RecordKind::Events));

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pending().total(), 0);
    }

    #[test]
    fn test_settings() {
        let queue = PersistentQueue::in_memory();
        assert!(queue.setting("device_id").is_none());
        assert!(queue.set_setting("device_id", "abc"));
        assert!(!queue.set_setting("device_id", "abc"));
        assert_eq!(queue.setting("device_id").as_deref(), Some("abc"));
        assert!(queue.remove_setting("device_id"));
        assert!(!queue.remove_setting("device_id"));
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let queue = Arc::new(PersistentQueue::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        queue.append(i, event(&format!("t{}-{}", t, i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let entries = queue.snapshot();
        assert_eq!(entries.len(), 400);
        let mut seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        seqs.dedup();
        assert_eq!(seqs.len(), 400);
    }

    #[test]
    fn test_change_kinds() {
        let entry = QueueEntry {
            seq: 1,
            timestamp: 1,
            record: event("a"),
        };
        assert_eq!(Change::Appended(&entry).kinds(), vec![RecordKind::Events]);
        assert_eq!(Change::Cleared.kinds().len(), 4);
    }
}
