//! In-memory progress store
//!
//! A single process-wide map guarded by an `RwLock`. Suitable when the sync
//! runs and its observers live in the same process.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{ProgressRecord, ProgressStore, ProgressUpdate, StoreError};

#[derive(Default)]
pub struct InMemoryProgressStore {
    records: RwLock<HashMap<String, ProgressRecord>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn get(&self, session_id: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(session_id).cloned())
    }

    fn update(&self, session_id: &str, update: ProgressUpdate) -> Result<ProgressRecord, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let record = records
            .entry(session_id.to_string())
            .or_insert_with(|| ProgressRecord::new(session_id));
        record.merge(update);
        Ok(record.clone())
    }

    fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.remove(session_id);
        Ok(())
    }

    fn list_active(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut ids: Vec<String> = records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
