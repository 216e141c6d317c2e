//! Dead-letter store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use comply_core::{DeadLetterEntry, DeadLetterOrigin, DeadLetterStore, Result};

const DEAD_LETTER_COLUMNS: &str = "id, origin, origin_id, origin_type, queue, payload, error, \
     retry_count, created_at, replayed_at";

/// PostgreSQL implementation of [`DeadLetterStore`].
///
/// The `(origin, origin_id)` unique constraint makes `insert_once` safe under
/// concurrent retry races.
#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: Pool<Postgres>,
}

impl PgDeadLetterStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<DeadLetterEntry> {
        let origin: String = row.try_get("origin")?;
        Ok(DeadLetterEntry {
            id: row.try_get("id")?,
            origin: origin.parse()?,
            origin_id: row.try_get("origin_id")?,
            origin_type: row.try_get("origin_type")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            replayed_at: row.try_get("replayed_at")?,
        })
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn insert_once(&self, entry: &DeadLetterEntry) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO dead_letter (id, origin, origin_id, origin_type, queue, payload, error,
                                      retry_count, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (origin, origin_id) DO NOTHING",
        )
        .bind(entry.id)
        .bind(entry.origin.as_str())
        .bind(entry.origin_id)
        .bind(&entry.origin_type)
        .bind(&entry.queue)
        .bind(&entry.payload)
        .bind(&entry.error)
        .bind(entry.retry_count)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_by_origin(
        &self,
        origin: DeadLetterOrigin,
        origin_id: Uuid,
    ) -> Result<Option<DeadLetterEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter WHERE origin = $1 AND origin_id = $2"
        ))
        .bind(origin.as_str())
        .bind(origin_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list(
        &self,
        origin: Option<DeadLetterOrigin>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter
             WHERE ($1::text IS NULL OR origin = $1)
             ORDER BY created_at DESC
             LIMIT $2"
        ))
        .bind(origin.map(|o| o.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn mark_replayed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dead_letter SET replayed_at = $2 WHERE id = $1 AND replayed_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
