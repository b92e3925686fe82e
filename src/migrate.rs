use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema in the configured database. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS normalized_records (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            row_index INTEGER NOT NULL,
            lot_no TEXT,
            product_name TEXT,
            production_qty TEXT,
            input_date TEXT,
            end_date TEXT,
            process TEXT,
            material_text TEXT,
            quantity TEXT,
            unit TEXT NOT NULL DEFAULT 't',
            ai_suggestion TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(batch_id, row_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_normalized_records_filename ON normalized_records(filename)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_normalized_records_created_at ON normalized_records(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
