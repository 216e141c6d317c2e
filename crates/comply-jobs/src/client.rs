//! Enqueue side of the queue: validates payloads, writes the job record and
//! pushes the envelope.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use comply_core::{
    new_v7, Backoff, EnqueueOptions, JobEnvelope, JobPayload, JobQueue, JobRecord, JobStore,
    Result,
};

/// Attempt and backoff policy applied when `EnqueueOptions` leave them unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefaults {
    pub attempts: i32,
    pub backoff: Backoff,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            attempts: comply_core::defaults::JOB_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}

/// Cheap, cloneable enqueue handle.
#[derive(Clone)]
pub struct JobClient {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    defaults: JobDefaults,
    wake: Arc<Notify>,
}

impl JobClient {
    pub fn new(jobs: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, defaults: JobDefaults) -> Self {
        Self {
            jobs,
            queue,
            defaults,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever a new envelope lands, so idle workers claim it
    /// without waiting for their next poll.
    pub fn wake_signal(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Validate `payload`, record it and push it onto `queue`.
    ///
    /// Returns the job id immediately. With an explicit `job_id` the call is
    /// idempotent: an id that already exists is left alone and returned.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        payload.validate()?;

        let job_type = payload.job_type();
        let id = options.job_id.unwrap_or_else(new_v7);
        let now = Utc::now();

        let mut envelope = JobEnvelope::new(
            id,
            queue,
            &payload,
            options.priority.unwrap_or_else(|| job_type.default_priority()),
            now,
        )?;
        if let Some(delay) = options.delay {
            envelope.run_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        }
        envelope.max_attempts = options.attempts.unwrap_or(self.defaults.attempts).max(1);
        envelope.backoff = options.backoff.unwrap_or_else(|| self.defaults.backoff.clone());
        envelope.recurrence_key = options.recurrence_key;

        let mut record = JobRecord::for_envelope(&envelope);
        record.replay_of = options.replay_of;

        if !self.jobs.create(&record).await? {
            // Known id. Finished jobs are never pushed again, even after
            // their envelope has been pruned.
            let finished = self
                .jobs
                .get(id)
                .await?
                .map(|r| r.status.is_terminal())
                .unwrap_or(false);
            if finished {
                debug!(
                    subsystem = "jobs",
                    component = "client",
                    job_id = %id,
                    "Enqueue of finished job ignored"
                );
                return Ok(id);
            }
        }

        if self.queue.push(&envelope).await? {
            self.wake.notify_waiters();
            info!(
                subsystem = "jobs",
                component = "client",
                op = "enqueue",
                job_id = %id,
                job_type = %job_type,
                queue = %queue,
                priority = ?envelope.priority,
                "Job enqueued"
            );
        } else {
            debug!(
                subsystem = "jobs",
                component = "client",
                job_id = %id,
                "Envelope already queued, enqueue is a no-op"
            );
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comply_core::{JobStatus, Priority};
    use comply_db::MemoryStore;
    use std::time::Duration;

    fn client(store: &MemoryStore) -> JobClient {
        JobClient::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            JobDefaults::default(),
        )
    }

    #[tokio::test]
    async fn test_enqueue_applies_job_type_defaults() {
        let store = MemoryStore::new();
        let id = client(&store)
            .enqueue("maintenance", JobPayload::CleanupJobs {}, EnqueueOptions::new())
            .await
            .unwrap();

        let env = JobQueue::get(&store, id).await.unwrap().unwrap();
        assert_eq!(env.priority, Priority::Bulk);
        assert_eq!(env.max_attempts, 3);
        assert_eq!(env.backoff, Backoff::default());

        let record = JobStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let store = MemoryStore::new();
        let err = client(&store)
            .enqueue(
                "notifications",
                JobPayload::ProcessNotifications { batch_size: 0 },
                EnqueueOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, comply_core::Error::InvalidInput(_)));
        assert_eq!(store.pending_count("notifications").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_with_delay_sets_run_at() {
        let store = MemoryStore::new();
        let id = client(&store)
            .enqueue(
                "maintenance",
                JobPayload::CleanupJobs {},
                EnqueueOptions::new().with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        let env = JobQueue::get(&store, id).await.unwrap().unwrap();
        assert!(env.run_at >= env.created_at + chrono::Duration::seconds(60));
        assert!(store
            .claim_next("maintenance", Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_enqueue_of_finished_id_is_not_pushed_again() {
        let store = MemoryStore::new();
        let c = client(&store);
        let id = Uuid::new_v4();
        let opts = || EnqueueOptions::new().with_job_id(id);

        c.enqueue("maintenance", JobPayload::CleanupJobs {}, opts())
            .await
            .unwrap();
        store.claim_next("maintenance", Utc::now()).await.unwrap();
        store.complete(id, Utc::now()).await.unwrap();
        JobStore::mark_completed(&store, id, None).await.unwrap();
        store
            .prune(
                &comply_core::RetentionPolicy {
                    completed_max_count: 0,
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();

        c.enqueue("maintenance", JobPayload::CleanupJobs {}, opts())
            .await
            .unwrap();
        assert_eq!(store.pending_count("maintenance").await.unwrap(), 0);
    }
}
