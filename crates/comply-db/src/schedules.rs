//! Recurring trigger store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use comply_core::{RecurringTrigger, Result, ScheduleStore};

const TRIGGER_COLUMNS: &str =
    "id, job_type, queue, cron, payload, next_run_at, last_run_at, enabled, updated_at";

/// PostgreSQL implementation of [`ScheduleStore`].
#[derive(Clone)]
pub struct PgScheduleStore {
    pool: Pool<Postgres>,
}

impl PgScheduleStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: &PgRow) -> Result<RecurringTrigger> {
        Ok(RecurringTrigger {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            queue: row.try_get("queue")?,
            cron: row.try_get("cron")?,
            payload: row.try_get("payload")?,
            next_run_at: row.try_get("next_run_at")?,
            last_run_at: row.try_get("last_run_at")?,
            enabled: row.try_get("enabled")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn upsert(&self, trigger: &RecurringTrigger) -> Result<RecurringTrigger> {
        // SET expressions see the pre-update row, so the CASE compares against
        // the stored cron even though cron is assigned in the same statement.
        let row = sqlx::query(&format!(
            "INSERT INTO recurring_trigger (id, job_type, queue, cron, payload, next_run_at,
                                            last_run_at, enabled, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                 queue = EXCLUDED.queue,
                 payload = EXCLUDED.payload,
                 enabled = EXCLUDED.enabled,
                 updated_at = EXCLUDED.updated_at,
                 next_run_at = CASE
                     WHEN recurring_trigger.cron = EXCLUDED.cron THEN recurring_trigger.next_run_at
                     ELSE EXCLUDED.next_run_at
                 END,
                 cron = EXCLUDED.cron
             RETURNING {TRIGGER_COLUMNS}"
        ))
        .bind(trigger.id)
        .bind(&trigger.job_type)
        .bind(&trigger.queue)
        .bind(&trigger.cron)
        .bind(&trigger.payload)
        .bind(trigger.next_run_at)
        .bind(trigger.enabled)
        .bind(trigger.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Self::parse_row(&row)
    }

    async fn get(&self, job_type: &str) -> Result<Option<RecurringTrigger>> {
        let row = sqlx::query(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM recurring_trigger WHERE job_type = $1"
        ))
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list(&self) -> Result<Vec<RecurringTrigger>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM recurring_trigger ORDER BY job_type"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<RecurringTrigger>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM recurring_trigger
             WHERE enabled AND next_run_at <= $1
             ORDER BY next_run_at"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn advance(
        &self,
        id: Uuid,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE recurring_trigger
             SET next_run_at = $3, last_run_at = $4, updated_at = $4
             WHERE id = $1 AND next_run_at = $2 AND enabled",
        )
        .bind(id)
        .bind(expected_next)
        .bind(next)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, job_type: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM recurring_trigger WHERE job_type = $1")
            .bind(job_type)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
