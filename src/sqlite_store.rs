//! SQLite-backed [`RecordStore`].
//!
//! Each batch is written inside one transaction; a failure on any row rolls
//! the whole batch back. `sqlx` errors are mapped onto the persistence
//! taxonomy:
//!
//! | sqlx error | Kind |
//! |------------|------|
//! | unique / primary key / check / not-null violation | `conflict` |
//! | `SQLITE_BUSY`, `SQLITE_LOCKED`, pool timeout, I/O | `transient` |
//! | anything else | `fatal` |

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use cbam_intake_core::store::{PersistBatch, PersistError, RecordStore};

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Whether a SQLite result code is `SQLITE_BUSY` (5) or `SQLITE_LOCKED` (6).
/// Extended codes carry the primary code in their low byte.
fn is_busy_or_locked(code: &str) -> bool {
    code.parse::<i32>()
        .map(|code| matches!(code & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// Classify a `sqlx` error as conflict, transient or fatal.
pub fn map_sqlx_error(err: sqlx::Error) -> PersistError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            let message = db_err.message().to_lowercase();
            if db_err.is_unique_violation()
                || db_err.is_check_violation()
                || db_err.is_foreign_key_violation()
                || message.contains("constraint failed")
            {
                PersistError::Conflict(db_err.message().to_string())
            } else if is_busy_or_locked(&code)
                || message.contains("database is locked")
                || message.contains("busy")
            {
                PersistError::Transient(db_err.message().to_string())
            } else {
                PersistError::Fatal(db_err.message().to_string())
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => PersistError::Transient(err.to_string()),
        _ => PersistError::Fatal(err.to_string()),
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn save_batch(&self, batch: &PersistBatch) -> Result<usize, PersistError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let created_at = batch.created_at.timestamp();

        for record in &batch.records {
            sqlx::query(
                r#"
                INSERT INTO normalized_records (
                    id, batch_id, filename, row_index, lot_no, product_name,
                    production_qty, input_date, end_date, process, material_text,
                    quantity, unit, ai_suggestion, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&batch.batch_id)
            .bind(&batch.filename)
            .bind(record.row_index as i64)
            .bind(&record.lot_no)
            .bind(&record.product_name)
            .bind(record.production_qty.map(|d| d.to_string()))
            .bind(record.input_date.map(|d| d.to_string()))
            .bind(record.end_date.map(|d| d.to_string()))
            .bind(&record.process)
            .bind(&record.material_text)
            .bind(record.quantity.map(|d| d.to_string()))
            .bind(&record.unit)
            .bind(&record.ai_suggestion)
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(batch.len())
    }

    async fn count(&self) -> Result<usize, PersistError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM normalized_records")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(n as usize)
    }
}
