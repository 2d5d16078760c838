//! SQLite backend
//!
//! Stores the queue as one row per entry and applies each [`Change`]
//! incrementally. A database that cannot be opened or migrated is moved aside
//! to `<name>.corrupt` and replaced with an empty one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use super::{schema, Change, QueueBackend};
use crate::error::Result;
use crate::types::{QueueEntry, Record};

/// Queue backend over a single SQLite database file.
pub struct SqliteBackend {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match Self::try_open(path) {
            Ok(conn) => Ok(Self {
                conn,
                path: Some(path.to_path_buf()),
            }),
            Err(e) => {
                let aside = path.with_extension("db.corrupt");
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Queue database unusable, starting a fresh one"
                );
                std::fs::rename(path, &aside)?;
                Ok(Self {
                    conn: Self::try_open(path)?,
                    path: Some(path.to_path_buf()),
                })
            }
        }
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Self { conn, path: None })
    }

    fn try_open(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;

        // WAL keeps committed rows across a killed process
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        schema::run_migrations(&conn)?;
        conn.query_row("SELECT COUNT(*) FROM queue", [], |r| r.get::<_, i64>(0))?;
        Ok(conn)
    }
}

impl QueueBackend for SqliteBackend {
    fn load_all(&mut self) -> Result<Vec<QueueEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, kind, timestamp, record FROM queue ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, kind, timestamp, record) = row?;
            match serde_json::from_str::<Record>(&record) {
                Ok(record) => entries.push(QueueEntry {
                    seq: seq as u64,
                    timestamp,
                    record,
                }),
                Err(e) => {
                    tracing::warn!(seq, kind = %kind, error = %e, "Skipping undecodable queue row");
                }
            }
        }
        Ok(entries)
    }

    fn commit(&mut self, change: Change<'_>, _entries: &[QueueEntry]) -> Result<()> {
        match change {
            Change::Appended(entry) => {
                let record = serde_json::to_string(&entry.record)?;
                self.conn.execute(
                    "INSERT OR REPLACE INTO queue (seq, kind, timestamp, record) VALUES (?1, ?2, ?3, ?4)",
                    params![entry.seq as i64, entry.kind().as_str(), entry.timestamp, record],
                )?;
            }
            Change::Removed(removed) => {
                let tx = self.conn.transaction()?;
                {
                    let mut stmt = tx.prepare("DELETE FROM queue WHERE seq = ?1")?;
                    for entry in removed {
                        stmt.execute(params![entry.seq as i64])?;
                    }
                }
                tx.commit()?;
            }
            Change::Cleared => {
                self.conn.execute("DELETE FROM queue", [])?;
            }
        }
        Ok(())
    }

    fn load_settings(&mut self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut settings = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    fn save_settings(&mut self, settings: &BTreeMap<String, String>) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM settings", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO settings (key, value) VALUES (?1, ?2)")?;
            for (key, value) in settings {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => ":memory:".to_string(),
        }
    }
}
