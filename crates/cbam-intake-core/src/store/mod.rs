//! Persistence port for normalized records.
//!
//! The [`RecordStore`] trait is the only way processed batches leave the
//! pipeline. Each [`save_batch`](RecordStore::save_batch) call is one
//! transaction: either every record of the batch lands or none does.
//!
//! # Failure kinds
//!
//! | Kind | Meaning | Retry? |
//! |------|---------|--------|
//! | `conflict` | a record collides with stored data (duplicate key) | no, fix the batch |
//! | `transient` | the backend is busy or unreachable | yes |
//! | `fatal` | anything else; operator intervention expected | no |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{CanonicalColumn, CanonicalRow};

/// Wire tag of a [`PersistError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistErrorKind {
    Conflict,
    Transient,
    Fatal,
}

impl PersistErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistErrorKind::Conflict => "conflict",
            PersistErrorKind::Transient => "transient",
            PersistErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PersistError {
    pub fn kind(&self) -> PersistErrorKind {
        match self {
            PersistError::Conflict(_) => PersistErrorKind::Conflict,
            PersistError::Transient(_) => PersistErrorKind::Transient,
            PersistError::Fatal(_) => PersistErrorKind::Fatal,
        }
    }

    /// Only transient failures may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistError::Transient(_))
    }
}

/// One normalized row ready for storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedRecord {
    pub row_index: usize,
    pub lot_no: Option<String>,
    pub product_name: Option<String>,
    pub production_qty: Option<Decimal>,
    pub input_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub process: Option<String>,
    pub material_text: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit: String,
    pub ai_suggestion: Option<String>,
}

impl PersistedRecord {
    /// Build a record from a canonical row. A blank unit is replaced by
    /// `default_unit` regardless of what normalization did.
    pub fn from_row(row: &CanonicalRow, default_unit: &str) -> Self {
        let text = |c: CanonicalColumn| row.text(c).map(str::to_string);
        let unit = row
            .text(CanonicalColumn::Unit)
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(default_unit)
            .to_string();

        Self {
            row_index: row.index,
            lot_no: text(CanonicalColumn::LotNo),
            product_name: text(CanonicalColumn::ProductName),
            production_qty: row.get(CanonicalColumn::ProductionQty).as_decimal(),
            input_date: row.get(CanonicalColumn::InputDate).as_date(),
            end_date: row.get(CanonicalColumn::EndDate).as_date(),
            process: text(CanonicalColumn::Process),
            material_text: text(CanonicalColumn::MaterialText),
            quantity: row.get(CanonicalColumn::Quantity).as_decimal(),
            unit,
            ai_suggestion: text(CanonicalColumn::AiSuggestion),
        }
    }
}

/// A batch of records written in one transaction.
#[derive(Debug, Clone, Serialize)]
pub struct PersistBatch {
    pub batch_id: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub records: Vec<PersistedRecord>,
}

impl PersistBatch {
    pub fn new(filename: &str, records: Vec<PersistedRecord>) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            created_at: Utc::now(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Abstract storage backend for normalized records.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`save_batch`](RecordStore::save_batch) | Write a whole batch atomically |
/// | [`count`](RecordStore::count) | Number of stored records |
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write every record of `batch` in one transaction.
    ///
    /// Returns the number of records written, always `batch.len()` on
    /// success. On failure nothing from the batch is visible.
    async fn save_batch(&self, batch: &PersistBatch) -> Result<usize, PersistError>;

    async fn count(&self) -> Result<usize, PersistError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CellValue;

    #[test]
    fn test_from_row_enforces_unit_default() {
        let mut row = CanonicalRow::empty(3);
        row.set(CanonicalColumn::MaterialText, CellValue::Text("coke".into()));
        row.set(CanonicalColumn::Unit, CellValue::Absent);
        let record = PersistedRecord::from_row(&row, "t");
        assert_eq!(record.unit, "t");
        assert_eq!(record.row_index, 3);
        assert_eq!(record.material_text.as_deref(), Some("coke"));

        row.set(CanonicalColumn::Unit, CellValue::Text("kg".into()));
        assert_eq!(PersistedRecord::from_row(&row, "t").unit, "kg");
    }

    #[test]
    fn test_error_kinds() {
        assert!(PersistError::Transient("busy".into()).is_retryable());
        assert!(!PersistError::Conflict("dup".into()).is_retryable());
        assert!(!PersistError::Fatal("disk".into()).is_retryable());
        assert_eq!(PersistError::Fatal("x".into()).kind().as_str(), "fatal");
    }
}
