//! Durable envelope queue on Postgres.
//!
//! Envelopes are claimed with `FOR UPDATE SKIP LOCKED`, so any number of
//! worker processes can poll the same queue without double-claiming. Ordering
//! is priority tier first, then enqueue order (`created_at`, `seq`).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{info, trace};
use uuid::Uuid;

use comply_core::{
    EnvelopeState, Error, JobEnvelope, JobQueue, Priority, QueueStats, Result, RetentionPolicy,
};

const ENVELOPE_COLUMNS: &str = "id, queue, job_type, payload, priority, created_at, run_at, \
     attempts, max_attempts, backoff, recurrence_key, state, locked_at, finished_at";

/// PostgreSQL implementation of [`JobQueue`].
#[derive(Clone)]
pub struct PgJobQueue {
    pool: Pool<Postgres>,
}

impl PgJobQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_envelope_row(row: &PgRow) -> Result<JobEnvelope> {
        let priority: i16 = row.try_get("priority")?;
        let state: String = row.try_get("state")?;
        let backoff: serde_json::Value = row.try_get("backoff")?;
        Ok(JobEnvelope {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: Priority::from_i16(priority)?,
            created_at: row.try_get("created_at")?,
            run_at: row.try_get("run_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            backoff: serde_json::from_value(backoff)?,
            recurrence_key: row.try_get("recurrence_key")?,
            state: state.parse()?,
            locked_at: row.try_get("locked_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    async fn archive(&self, id: Uuid, state: EnvelopeState, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_envelope
             SET state = $2, locked_at = NULL, finished_at = $3
             WHERE id = $1 AND state IN ('pending', 'active')",
        )
        .bind(id)
        .bind(state.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Job(format!(
                "envelope {id} is not pending or active, cannot archive as {}",
                state.as_str()
            )));
        }
        Ok(())
    }

    async fn prune_state(
        &self,
        state: EnvelopeState,
        max_age_secs: i64,
        keep: i64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let cutoff = now - Duration::seconds(max_age_secs);
        let result = sqlx::query(
            "DELETE FROM job_envelope
             WHERE state = $1
               AND (finished_at < $2
                    OR id NOT IN (
                        SELECT id FROM job_envelope
                        WHERE state = $1
                        ORDER BY finished_at DESC
                        LIMIT $3
                    ))",
        )
        .bind(state.as_str())
        .bind(cutoff)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn push(&self, envelope: &JobEnvelope) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO job_envelope (id, queue, job_type, payload, priority, created_at, run_at,
                                       attempts, max_attempts, backoff, recurrence_key, state)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'pending')
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(envelope.id)
        .bind(&envelope.queue)
        .bind(&envelope.job_type)
        .bind(&envelope.payload)
        .bind(envelope.priority.as_i16())
        .bind(envelope.created_at)
        .bind(envelope.run_at)
        .bind(envelope.attempts)
        .bind(envelope.max_attempts)
        .bind(serde_json::to_value(&envelope.backoff)?)
        .bind(&envelope.recurrence_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<JobEnvelope>> {
        let row = sqlx::query(&format!(
            "UPDATE job_envelope
             SET state = 'active', locked_at = $2
             WHERE id = (
                 SELECT id FROM job_envelope
                 WHERE queue = $1 AND state = 'pending' AND run_at <= $2
                 ORDER BY priority ASC, created_at ASC, seq ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {ENVELOPE_COLUMNS}"
        ))
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let envelope = row.as_ref().map(Self::parse_envelope_row).transpose()?;
        if let Some(env) = &envelope {
            trace!(
                subsystem = "db",
                component = "queue",
                op = "claim",
                queue,
                job_id = %env.id,
                "Claimed envelope"
            );
        }
        Ok(envelope)
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.archive(id, EnvelopeState::Completed, now).await
    }

    async fn fail(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.archive(id, EnvelopeState::Failed, now).await
    }

    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>, attempts: i32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_envelope
             SET state = 'pending', run_at = $2, attempts = $3, locked_at = NULL
             WHERE id = $1 AND state = 'active'",
        )
        .bind(id)
        .bind(run_at)
        .bind(attempts)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Job(format!("envelope {id} is not active")));
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job_envelope WHERE id = $1 AND state = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobEnvelope>> {
        let row = sqlx::query(&format!(
            "SELECT {ENVELOPE_COLUMNS} FROM job_envelope WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_envelope_row).transpose()
    }

    async fn pending_count(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_envelope WHERE queue = $1 AND state = 'pending'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn stats(&self, queue: Option<&str>, now: DateTime<Utc>) -> Result<QueueStats> {
        let hour_ago = now - Duration::hours(1);
        let row = sqlx::query(
            "SELECT
                 COUNT(*) FILTER (WHERE state = 'pending') AS pending,
                 COUNT(*) FILTER (WHERE state = 'active') AS active,
                 COUNT(*) FILTER (WHERE state = 'completed' AND finished_at > $2) AS completed_last_hour,
                 COUNT(*) FILTER (WHERE state = 'failed' AND finished_at > $2) AS failed_last_hour,
                 COUNT(*) AS total
             FROM job_envelope
             WHERE ($1::text IS NULL OR queue = $1)",
        )
        .bind(queue)
        .bind(hour_ago)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            active: row.try_get("active")?,
            completed_last_hour: row.try_get("completed_last_hour")?,
            failed_last_hour: row.try_get("failed_last_hour")?,
            total: row.try_get("total")?,
        })
    }

    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE job_envelope
             SET state = 'pending', attempts = attempts + 1, locked_at = NULL
             WHERE state = 'active' AND locked_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(
                subsystem = "db",
                component = "queue",
                op = "recover_stale",
                recovered,
                "Requeued envelopes abandoned by a lost worker"
            );
        }
        Ok(recovered)
    }

    async fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<u64> {
        let completed = self
            .prune_state(
                EnvelopeState::Completed,
                policy.completed_max_age_secs,
                policy.completed_max_count,
                now,
            )
            .await?;
        let failed = self
            .prune_state(
                EnvelopeState::Failed,
                policy.failed_max_age_secs,
                policy.failed_max_count,
                now,
            )
            .await?;
        Ok(completed + failed)
    }
}
