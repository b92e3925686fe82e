//! In-memory [`RecordStore`] implementation for testing.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`. A batch is staged
//! and checked in full before anything is appended, so a failed batch
//! leaves the store exactly as it was. Uniqueness is enforced on
//! `(batch_id, row_index)` like the SQLite schema does.

use std::collections::HashSet;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use super::{PersistBatch, PersistError, PersistedRecord, RecordStore};

/// A record together with the batch it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub batch_id: String,
    pub filename: String,
    pub record: PersistedRecord,
}

/// In-memory store for tests.
pub struct InMemoryRecordStore {
    records: RwLock<Vec<StoredRecord>>,
    next_failure: Mutex<Option<PersistError>>,
    save_calls: Mutex<usize>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_failure: Mutex::new(None),
            save_calls: Mutex::new(0),
        }
    }

    /// Fail the next `save_batch` call with `error`.
    pub fn inject_failure(&self, error: PersistError) {
        *self.next_failure.lock().unwrap() = Some(error);
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.read().unwrap().clone()
    }

    /// Number of `save_batch` calls, successful or not.
    pub fn save_calls(&self) -> usize {
        *self.save_calls.lock().unwrap()
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn save_batch(&self, batch: &PersistBatch) -> Result<usize, PersistError> {
        *self.save_calls.lock().unwrap() += 1;
        if let Some(err) = self.next_failure.lock().unwrap().take() {
            return Err(err);
        }

        let mut records = self.records.write().unwrap();
        let mut keys: HashSet<(&str, usize)> = records
            .iter()
            .filter(|r| r.batch_id == batch.batch_id)
            .map(|r| (r.batch_id.as_str(), r.record.row_index))
            .collect();

        let mut errors = Vec::new();
        for record in &batch.records {
            if !keys.insert((batch.batch_id.as_str(), record.row_index)) {
                errors.push(format!("row {} already stored", record.row_index));
            }
        }
        if !errors.is_empty() {
            return Err(PersistError::Conflict(errors.join("; ")));
        }
        drop(keys);

        records.extend(batch.records.iter().map(|record| StoredRecord {
            batch_id: batch.batch_id.clone(),
            filename: batch.filename.clone(),
            record: record.clone(),
        }));
        Ok(batch.len())
    }

    async fn count(&self) -> Result<usize, PersistError> {
        Ok(self.records.read().unwrap().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalColumn, CanonicalRow, CellValue};
    use futures::executor::block_on;

    fn record(index: usize) -> PersistedRecord {
        let mut row = CanonicalRow::empty(index);
        row.set(CanonicalColumn::MaterialText, CellValue::Text("coke".into()));
        PersistedRecord::from_row(&row, "t")
    }

    #[test]
    fn test_save_batch_all_rows() {
        let store = InMemoryRecordStore::new();
        let batch = PersistBatch::new("a.xlsx", vec![record(0), record(1)]);
        assert_eq!(block_on(store.save_batch(&batch)).unwrap(), 2);
        assert_eq!(block_on(store.count()).unwrap(), 2);
    }

    #[test]
    fn test_conflict_commits_nothing() {
        let store = InMemoryRecordStore::new();
        let batch = PersistBatch::new("a.xlsx", vec![record(0), record(1), record(1)]);
        let err = block_on(store.save_batch(&batch)).unwrap_err();
        assert!(matches!(err, PersistError::Conflict(_)));
        assert!(store.records().is_empty());
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let store = InMemoryRecordStore::new();
        store.inject_failure(PersistError::Transient("database is locked".into()));
        let batch = PersistBatch::new("a.xlsx", vec![record(0)]);
        let err = block_on(store.save_batch(&batch)).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(block_on(store.count()).unwrap(), 0);

        assert_eq!(block_on(store.save_batch(&batch)).unwrap(), 1);
        assert_eq!(store.save_calls(), 2);
    }
}
