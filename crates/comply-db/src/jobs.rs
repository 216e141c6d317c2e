//! Job record store.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use comply_core::{Error, JobRecord, JobStatus, JobStore, Result};

const RECORD_COLUMNS: &str = "id, job_type, queue, status, attempts, max_attempts, \
     error_message, result, replay_of, created_at, updated_at";

/// PostgreSQL implementation of [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: &PgRow) -> Result<JobRecord> {
        let status: String = row.try_get("status")?;
        Ok(JobRecord {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            queue: row.try_get("queue")?,
            status: status.parse()?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            error_message: row.try_get("error_message")?,
            result: row.try_get("result")?,
            replay_of: row.try_get("replay_of")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Terminal records are never rewritten. A guarded update that touched no
    /// row is fine when the record exists (it was already terminal) and
    /// `NotFound` otherwise.
    async fn check_updated(&self, id: Uuid, rows: u64, op: &str) -> Result<()> {
        if rows > 0 {
            return Ok(());
        }
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM job_record WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            debug!(
                subsystem = "db",
                component = "jobs",
                op,
                job_id = %id,
                "Record already terminal, update skipped"
            );
            Ok(())
        } else {
            Err(Error::NotFound(format!("job record {id}")))
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, record: &JobRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO job_record (id, job_type, queue, status, attempts, max_attempts,
                                     error_message, result, replay_of, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(record.id)
        .bind(&record.job_type)
        .bind(&record.queue)
        .bind(record.status.as_str())
        .bind(record.attempts)
        .bind(record.max_attempts)
        .bind(&record.error_message)
        .bind(&record.result)
        .bind(record.replay_of)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM job_record WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_record_row).transpose()
    }

    async fn mark_processing(&self, id: Uuid, attempt: i32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_record
             SET status = 'processing', attempts = $2, updated_at = $3
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(id)
        .bind(attempt)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.check_updated(id, result.rows_affected(), "mark_processing")
            .await
    }

    async fn mark_completed(&self, id: Uuid, result: Option<JsonValue>) -> Result<()> {
        let res = sqlx::query(
            "UPDATE job_record
             SET status = 'completed', result = $2, error_message = NULL, updated_at = $3
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(id)
        .bind(&result)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.check_updated(id, res.rows_affected(), "mark_completed")
            .await
    }

    async fn mark_retrying(&self, id: Uuid, attempts: i32, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_record
             SET status = 'retrying', attempts = $2, error_message = $3, updated_at = $4
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.check_updated(id, result.rows_affected(), "mark_retrying")
            .await
    }

    async fn mark_failed(&self, id: Uuid, attempts: i32, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_record
             SET status = 'failed', attempts = $2, error_message = $3, updated_at = $4
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.check_updated(id, result.rows_affected(), "mark_failed")
            .await
    }

    async fn list_filtered(
        &self,
        status: Option<JobStatus>,
        job_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM job_record
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR job_type = $2)
             ORDER BY created_at DESC
             LIMIT $3 OFFSET $4"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(job_type)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_record_row).collect()
    }
}
