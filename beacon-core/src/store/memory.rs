//! Non-durable backend
//!
//! Keeps nothing beyond what [`super::PersistentQueue`] already holds in memory.
//! Used in tests and by hosts that opt out of persistence.

use std::collections::BTreeMap;

use super::{Change, QueueBackend};
use crate::error::Result;
use crate::types::QueueEntry;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    settings: BTreeMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueBackend for MemoryBackend {
    fn load_all(&mut self) -> Result<Vec<QueueEntry>> {
        Ok(Vec::new())
    }

    fn commit(&mut self, _change: Change<'_>, _entries: &[QueueEntry]) -> Result<()> {
        Ok(())
    }

    fn load_settings(&mut self) -> Result<BTreeMap<String, String>> {
        Ok(self.settings.clone())
    }

    fn save_settings(&mut self, settings: &BTreeMap<String, String>) -> Result<()> {
        self.settings = settings.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
