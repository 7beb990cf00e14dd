//! SQLite dump store
//!
//! One row per undeliverable message in `dumped_jobs`. Rows are inserted in a
//! single statement and deleted only by the replayer after a confirmed publish.
//! Rows that can no longer be decoded are moved to `dumped_jobs_quarantine`
//! so they stop occupying replay batches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info, warn};

use sw_common::{DumpedRecord, JobType};

use crate::{DumpError, DumpRequest, Dumper, RecordFilter, Result};

pub struct SqliteDumpStore {
    pool: SqlitePool,
}

impl SqliteDumpStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool on `database_url` and make sure the schema exists
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dumped_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                payload BLOB NOT NULL,
                job_type TEXT NOT NULL,
                persistent INTEGER NOT NULL DEFAULT 1,
                dumped_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_dumped_jobs_type
            ON dumped_jobs (job_type, queue)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dumped_jobs_quarantine (
                id INTEGER PRIMARY KEY,
                queue TEXT,
                payload BLOB,
                job_type TEXT,
                persistent INTEGER,
                dumped_at INTEGER,
                attempts INTEGER,
                last_error TEXT,
                reason TEXT NOT NULL,
                quarantined_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite dump schema initialized");
        Ok(())
    }

    /// Rows moved aside because they could not be decoded
    pub async fn quarantined(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM dumped_jobs_quarantine")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("total").max(0) as u64)
    }

    /// Move row `id` out of `dumped_jobs`, keeping it with `reason`.
    async fn quarantine(&self, id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dumped_jobs_quarantine
                (id, queue, payload, job_type, persistent, dumped_at, attempts, last_error,
                 reason, quarantined_at)
            SELECT id, queue, payload, job_type, persistent, dumped_at, attempts, last_error, ?, ?
            FROM dumped_jobs WHERE id = ?
            "#,
        )
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM dumped_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn parse_row(row: &SqliteRow) -> Result<DumpedRecord> {
        let id: i64 = row.try_get("id")?;
        let corrupt = |reason: String| DumpError::Corrupt { id, reason };

        let job_type_str: String = row
            .try_get("job_type")
            .map_err(|e| corrupt(format!("unreadable job type: {}", e)))?;
        let job_type = JobType::from_str(&job_type_str)
            .ok_or_else(|| corrupt(format!("unknown job type '{}'", job_type_str)))?;

        let dumped_at_ts: i64 = row
            .try_get("dumped_at")
            .map_err(|e| corrupt(format!("unreadable dumped_at: {}", e)))?;
        let dumped_at = DateTime::from_timestamp_millis(dumped_at_ts)
            .ok_or_else(|| corrupt(format!("invalid dumped_at {}", dumped_at_ts)))?;

        let queue: String = row
            .try_get("queue")
            .map_err(|e| corrupt(format!("unreadable queue: {}", e)))?;
        let payload: Vec<u8> = row
            .try_get("payload")
            .map_err(|e| corrupt(format!("unreadable payload: {}", e)))?;

        Ok(DumpedRecord {
            id,
            queue,
            payload,
            job_type,
            persistent: row.try_get::<i64, _>("persistent").map_or(true, |p| p != 0),
            dumped_at,
            attempts: row.try_get::<i64, _>("attempts").unwrap_or(0).max(0) as u32,
            last_error: row.try_get("last_error").ok().flatten(),
        })
    }
}

#[async_trait]
impl Dumper for SqliteDumpStore {
    async fn output(&self, request: DumpRequest) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO dumped_jobs (queue, payload, job_type, persistent, dumped_at, attempts)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&request.queue)
        .bind(&request.payload)
        .bind(request.job_type.as_str())
        .bind(request.persistent)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, queue = %request.queue, job_type = %request.job_type, "Record dumped");
        Ok(id)
    }

    /// Corrupt rows are quarantined and left out of the result.
    async fn fetch(&self, filter: &RecordFilter) -> Result<Vec<DumpedRecord>> {
        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        let max_attempts = filter.max_attempts.map(i64::from);
        let rows = sqlx::query(
            r#"
            SELECT id, queue, payload, job_type, persistent, dumped_at, attempts, last_error
            FROM dumped_jobs
            WHERE (? IS NULL OR job_type = ?)
              AND (? IS NULL OR queue = ?)
              AND (? IS NULL OR attempts < ?)
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.queue.as_deref())
        .bind(filter.queue.as_deref())
        .bind(max_attempts)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::parse_row(row) {
                Ok(record) => records.push(record),
                Err(DumpError::Corrupt { id, reason }) => {
                    warn!(id, reason = %reason, "Quarantining corrupt dumped record");
                    if let Err(e) = self.quarantine(id, &reason).await {
                        error!(id, error = %e, "Failed to quarantine corrupt dumped record");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn remove(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM dumped_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DumpError::NotFound(id));
        }
        debug!(id, "Dumped record removed");
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dumped_jobs SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DumpError::NotFound(id));
        }
        Ok(())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64> {
        let max_attempts = filter.max_attempts.map(i64::from);
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM dumped_jobs
            WHERE (? IS NULL OR job_type = ?)
              AND (? IS NULL OR queue = ?)
              AND (? IS NULL OR attempts < ?)
            "#,
        )
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.queue.as_deref())
        .bind(filter.queue.as_deref())
        .bind(max_attempts)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("total").max(0) as u64)
    }
}
