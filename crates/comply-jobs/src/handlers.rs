//! Job bodies owned by the orchestration core itself.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument};

use comply_core::defaults::{JOB_STALE_AFTER_SECS, JOB_TIMEOUT_SECS};
use comply_core::{DigestType, JobError, JobPayload, JobQueue, JobType, RetentionPolicy};

use crate::escalation::EscalationEngine;
use crate::handler::{JobContext, JobHandler, JobResult};
use crate::notifications::{DigestBatcher, NotificationPipeline};

fn unexpected(expected: JobType, ctx: &JobContext) -> JobError {
    JobError::InvalidPayload(format!(
        "{expected} handler received {} payload",
        ctx.payload.job_type()
    ))
}

fn to_json<T: serde::Serialize>(value: &T) -> JobResult {
    Ok(Some(serde_json::to_value(value)?))
}

/// Drains due notification records through the delivery pipeline.
pub struct ProcessNotificationsHandler {
    pipeline: NotificationPipeline,
}

impl ProcessNotificationsHandler {
    pub fn new(pipeline: NotificationPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for ProcessNotificationsHandler {
    fn job_type(&self) -> JobType {
        JobType::ProcessNotifications
    }

    #[instrument(
        skip(self, ctx),
        fields(subsystem = "jobs", component = "notifications", op = "execute")
    )]
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let JobPayload::ProcessNotifications { batch_size } = ctx.payload else {
            return Err(unexpected(self.job_type(), &ctx));
        };
        let summary = self.pipeline.process_batch(batch_size).await?;
        to_json(&summary)
    }
}

/// Compiles one digest cadence.
pub struct DigestHandler {
    batcher: DigestBatcher,
    digest: DigestType,
}

impl DigestHandler {
    pub fn daily(batcher: DigestBatcher) -> Self {
        Self {
            batcher,
            digest: DigestType::Daily,
        }
    }

    pub fn weekly(batcher: DigestBatcher) -> Self {
        Self {
            batcher,
            digest: DigestType::Weekly,
        }
    }
}

#[async_trait]
impl JobHandler for DigestHandler {
    fn job_type(&self) -> JobType {
        match self.digest {
            DigestType::Daily => JobType::DailyDigest,
            DigestType::Weekly => JobType::WeeklyDigest,
        }
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        if ctx.payload.digest_type() != Some(self.digest) {
            return Err(unexpected(self.job_type(), &ctx));
        }
        let summary = self.batcher.run(self.digest, Utc::now()).await?;
        to_json(&summary)
    }
}

/// Periodic overdue scan feeding the escalation engine.
pub struct CheckDeadlinesHandler {
    engine: EscalationEngine,
}

impl CheckDeadlinesHandler {
    pub fn new(engine: EscalationEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for CheckDeadlinesHandler {
    fn job_type(&self) -> JobType {
        JobType::CheckDeadlines
    }

    #[instrument(
        skip(self, ctx),
        fields(subsystem = "jobs", component = "escalation", op = "execute")
    )]
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let JobPayload::CheckDeadlines { company_id } = ctx.payload else {
            return Err(unexpected(self.job_type(), &ctx));
        };
        let summary = self.engine.run(company_id, Utc::now()).await?;
        to_json(&summary)
    }
}

/// Requeues envelopes orphaned by a crashed worker and prunes archives.
///
/// A claim only counts as orphaned once it is older than both the configured
/// stale age and twice the job timeout, so a job that is still running
/// inside its timeout is never handed to a second worker.
pub struct CleanupJobsHandler {
    queue: Arc<dyn JobQueue>,
    retention: RetentionPolicy,
    stale_after: chrono::Duration,
    job_timeout: chrono::Duration,
}

impl CleanupJobsHandler {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            retention: RetentionPolicy::default(),
            stale_after: chrono::Duration::seconds(JOB_STALE_AFTER_SECS),
            job_timeout: chrono::Duration::seconds(JOB_TIMEOUT_SECS as i64),
        }
    }

    /// The per-job timeout the workers enforce. Capped at a week.
    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout = chrono::Duration::seconds(secs.min(7 * 24 * 3600) as i64);
        self
    }

    /// Age past which an active claim is treated as orphaned.
    pub fn stale_after(&self) -> chrono::Duration {
        self.stale_after.max(self.job_timeout * 2)
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

#[async_trait]
impl JobHandler for CleanupJobsHandler {
    fn job_type(&self) -> JobType {
        JobType::CleanupJobs
    }

    #[instrument(
        skip(self, ctx),
        fields(subsystem = "jobs", component = "cleanup", op = "execute")
    )]
    async fn execute(&self, ctx: JobContext) -> JobResult {
        if ctx.payload.job_type() != JobType::CleanupJobs {
            return Err(unexpected(self.job_type(), &ctx));
        }
        let start = Instant::now();
        let now = Utc::now();

        ctx.report_progress(10, Some("Recovering stale claims"));
        let recovered = self.queue.recover_stale(now - self.stale_after()).await?;

        ctx.report_progress(60, Some("Pruning archived envelopes"));
        let pruned = self.queue.prune(&self.retention, now).await?;

        ctx.report_progress(100, None);
        info!(
            recovered,
            pruned,
            duration_ms = start.elapsed().as_millis() as u64,
            "Job cleanup finished"
        );
        Ok(Some(serde_json::json!({
            "recovered": recovered,
            "pruned": pruned,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comply_core::{JobEnvelope, Priority};
    use comply_db::MemoryStore;
    use uuid::Uuid;

    fn ctx(payload: JobPayload) -> JobContext {
        let envelope = JobEnvelope::new(
            Uuid::new_v4(),
            payload.job_type().default_queue(),
            &payload,
            Priority::Normal,
            Utc::now(),
        )
        .unwrap();
        JobContext::new(envelope, payload, 1)
    }

    #[tokio::test]
    async fn test_cleanup_recovers_stale_envelopes() {
        let store = MemoryStore::new();
        let payload = JobPayload::CleanupJobs {};
        let envelope = JobEnvelope::new(
            Uuid::new_v4(),
            "maintenance",
            &payload,
            Priority::Bulk,
            Utc::now() - chrono::Duration::hours(2),
        )
        .unwrap();
        store.push(&envelope).await.unwrap();
        store
            .claim_next("maintenance", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap()
            .unwrap();

        let handler = CleanupJobsHandler::new(Arc::new(store.clone()))
            .with_stale_after(chrono::Duration::minutes(30));
        let result = handler.execute(ctx(payload)).await.unwrap().unwrap();
        assert_eq!(result["recovered"], 1);
        assert_eq!(store.pending_count("maintenance").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_leaves_claims_inside_job_timeout() {
        let store = MemoryStore::new();
        let payload = JobPayload::CleanupJobs {};
        let envelope = JobEnvelope::new(
            Uuid::new_v4(),
            "maintenance",
            &payload,
            Priority::Bulk,
            Utc::now() - chrono::Duration::hours(2),
        )
        .unwrap();
        store.push(&envelope).await.unwrap();
        store
            .claim_next("maintenance", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap()
            .unwrap();

        // A 45 minute job claimed an hour ago may still be running.
        let handler = CleanupJobsHandler::new(Arc::new(store.clone()))
            .with_stale_after(chrono::Duration::minutes(30))
            .with_job_timeout(45 * 60);
        assert_eq!(handler.stale_after(), chrono::Duration::minutes(90));
        let result = handler.execute(ctx(payload)).await.unwrap().unwrap();
        assert_eq!(result["recovered"], 0);
        assert_eq!(store.pending_count("maintenance").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wrong_payload_is_invalid() {
        let handler = CleanupJobsHandler::new(Arc::new(MemoryStore::new()));
        let err = handler
            .execute(ctx(JobPayload::DailyDigest {}))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));
    }

    #[test]
    fn test_digest_handler_job_types() {
        let store = MemoryStore::new();
        let batcher = DigestBatcher::new(
            Arc::new(store),
            crate::rate_limiter::RateLimiter::new(Arc::new(
                comply_db::MemoryRateLimitStore::new(),
            )),
            crate::notifications::ProviderSet::standard(None),
        );
        assert_eq!(DigestHandler::daily(batcher.clone()).job_type(), JobType::DailyDigest);
        assert_eq!(DigestHandler::weekly(batcher).job_type(), JobType::WeeklyDigest);
    }
}
