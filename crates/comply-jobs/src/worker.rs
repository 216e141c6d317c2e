//! Worker groups: one claim loop per queue.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use governor::{Quota, RateLimiter};
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use comply_core::defaults;
use comply_core::{JobEnvelope, JobError, JobPayload, JobQueue, JobStore, JobType};

use crate::client::JobClient;
use crate::handler::{JobContext, JobHandler, JobResult};
use crate::retry::{RetryEngine, RetryOutcome};
use crate::stores::Stores;

type Throttle = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Process-wide worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether worker groups are started at all.
    pub enabled: bool,
    /// Idle poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Per-job execution timeout in seconds.
    pub job_timeout_secs: u64,
    /// Attempts for jobs enqueued without an explicit count.
    pub default_attempts: i32,
    /// Base delay of the default exponential backoff.
    pub backoff_base_ms: u64,
    /// Scheduler tick in milliseconds.
    pub scheduler_tick_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            default_attempts: defaults::JOB_MAX_ATTEMPTS,
            backoff_base_ms: defaults::JOB_BACKOFF_BASE_MS,
            scheduler_tick_ms: defaults::SCHEDULER_TICK_MS,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval when a queue is empty |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job execution timeout |
    /// | `JOB_DEFAULT_ATTEMPTS` | `3` | Attempts when the caller does not say |
    /// | `JOB_BACKOFF_BASE_MS` | `2000` | Base of the exponential backoff |
    /// | `SCHEDULER_TICK_MS` | `1000` | Recurring trigger scan interval |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            enabled,
            poll_interval_ms: env_parse("JOB_POLL_INTERVAL_MS", defaults::JOB_POLL_INTERVAL_MS),
            job_timeout_secs: env_parse("JOB_TIMEOUT_SECS", defaults::JOB_TIMEOUT_SECS).max(1),
            default_attempts: env_parse("JOB_DEFAULT_ATTEMPTS", defaults::JOB_MAX_ATTEMPTS).max(1),
            backoff_base_ms: env_parse("JOB_BACKOFF_BASE_MS", defaults::JOB_BACKOFF_BASE_MS),
            scheduler_tick_ms: env_parse("SCHEDULER_TICK_MS", defaults::SCHEDULER_TICK_MS).max(1),
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_default_attempts(mut self, attempts: i32) -> Self {
        self.default_attempts = attempts;
        self
    }

    pub fn with_backoff_base(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    pub fn with_scheduler_tick(mut self, ms: u64) -> Self {
        self.scheduler_tick_ms = ms;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Concurrency and throughput of one queue's worker group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    /// Jobs running at once.
    pub concurrency: usize,
    /// Jobs started per second.
    pub throughput_per_sec: u32,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, concurrency: usize, throughput_per_sec: u32) -> Self {
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
            throughput_per_sec: throughput_per_sec.max(1),
        }
    }

    /// Built-in settings for the known queues.
    pub fn defaults() -> Vec<QueueConfig> {
        [
            defaults::QUEUE_DOCUMENTS,
            defaults::QUEUE_REPORTS,
            defaults::QUEUE_NOTIFICATIONS,
            defaults::QUEUE_REMINDERS,
            defaults::QUEUE_ESCALATIONS,
            defaults::QUEUE_MAINTENANCE,
        ]
        .into_iter()
        .map(Self::for_queue)
        .collect()
    }

    /// Built-in settings for `name`; unknown queues get one slot.
    pub fn for_queue(name: &str) -> QueueConfig {
        let concurrency = match name {
            defaults::QUEUE_DOCUMENTS => defaults::CONCURRENCY_DOCUMENTS,
            defaults::QUEUE_REPORTS => defaults::CONCURRENCY_REPORTS,
            defaults::QUEUE_NOTIFICATIONS => defaults::CONCURRENCY_NOTIFICATIONS,
            defaults::QUEUE_REMINDERS => defaults::CONCURRENCY_REMINDERS,
            defaults::QUEUE_ESCALATIONS => defaults::CONCURRENCY_ESCALATIONS,
            _ => defaults::CONCURRENCY_MAINTENANCE,
        };
        let throughput = match name {
            defaults::QUEUE_NOTIFICATIONS => defaults::THROUGHPUT_NOTIFICATIONS_PER_SEC,
            _ => defaults::THROUGHPUT_PER_SEC,
        };
        QueueConfig::new(name, concurrency, throughput)
    }

    /// Built-in settings overridden by `QUEUE_CONCURRENCY_<QUEUE>` and
    /// `QUEUE_THROUGHPUT_<QUEUE>`.
    pub fn from_env(name: &str) -> QueueConfig {
        let base = Self::for_queue(name);
        let suffix = name.to_uppercase().replace('-', "_");
        QueueConfig::new(
            name,
            env_parse(&format!("QUEUE_CONCURRENCY_{suffix}"), base.concurrency),
            env_parse(&format!("QUEUE_THROUGHPUT_{suffix}"), base.throughput_per_sec),
        )
    }
}

/// Event emitted by worker groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    JobStarted {
        job_id: Uuid,
        job_type: String,
        attempt: i32,
    },
    /// Best-effort progress report from a handler.
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    JobCompleted {
        job_id: Uuid,
        job_type: String,
    },
    JobRetrying {
        job_id: Uuid,
        job_type: String,
        attempt: i32,
        error: String,
    },
    JobDeadLettered {
        job_id: Uuid,
        job_type: String,
        dead_letter_id: Uuid,
        error: String,
    },
    WorkerStarted {
        queue: String,
    },
    WorkerStopped {
        queue: String,
    },
}

/// Claim loop for one queue.
pub struct WorkerGroup {
    config: QueueConfig,
    inner: Arc<GroupInner>,
}

/// State shared with every job task of a group.
struct GroupInner {
    queue_name: String,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    retry: RetryEngine,
    client: JobClient,
    events: broadcast::Sender<WorkerEvent>,
    poll_interval: Duration,
    job_timeout: Duration,
}

impl WorkerGroup {
    pub fn new(
        config: QueueConfig,
        handlers: HashMap<JobType, Arc<dyn JobHandler>>,
        stores: &Stores,
        retry: RetryEngine,
        client: JobClient,
        events: broadcast::Sender<WorkerEvent>,
        worker: &WorkerConfig,
    ) -> Self {
        let inner = GroupInner {
            queue_name: config.name.clone(),
            handlers,
            jobs: stores.jobs.clone(),
            queue: stores.queue.clone(),
            retry,
            client,
            events,
            poll_interval: Duration::from_millis(worker.poll_interval_ms.max(1)),
            job_timeout: Duration::from_secs(worker.job_timeout_secs.max(1)),
        };
        Self {
            config,
            inner: Arc::new(inner),
        }
    }

    /// Spawn the claim loop; it exits once `shutdown` turns true and every
    /// in-flight job has finished.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    #[instrument(skip(self, shutdown), fields(queue = %self.config.name))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let inner = self.inner;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let per_second =
            NonZeroU32::new(self.config.throughput_per_sec).unwrap_or(NonZeroU32::MIN);
        let throttle: Throttle = RateLimiter::direct(Quota::per_second(per_second));
        let wake: Arc<Notify> = inner.client.wake_signal();
        let mut tasks = JoinSet::new();

        info!(
            subsystem = "worker",
            component = "group",
            concurrency = self.config.concurrency,
            throughput_per_sec = self.config.throughput_per_sec,
            handlers = inner.handlers.len(),
            "Worker group started"
        );
        let _ = inner.events.send(WorkerEvent::WorkerStarted {
            queue: inner.queue_name.clone(),
        });

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            while let Some(finished) = tasks.try_join_next() {
                log_join_error(finished);
            }

            match inner.queue.claim_next(&inner.queue_name, Utc::now()).await {
                Ok(Some(envelope)) => {
                    throttle.until_ready().await;
                    let job_inner = inner.clone();
                    tasks.spawn(async move {
                        job_inner.process(envelope).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    error!(
                        subsystem = "worker",
                        component = "group",
                        error = %e,
                        "Failed to claim job"
                    );
                }
            }

            // Queue empty (or unreachable): wait for an enqueue or the poll interval.
            tokio::select! {
                _ = wake.notified() => {}
                _ = sleep(inner.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        if !tasks.is_empty() {
            info!(
                subsystem = "worker",
                component = "group",
                in_flight = tasks.len(),
                "Draining in-flight jobs"
            );
        }
        while let Some(finished) = tasks.join_next().await {
            log_join_error(finished);
        }

        let _ = inner.events.send(WorkerEvent::WorkerStopped {
            queue: inner.queue_name.clone(),
        });
        info!(subsystem = "worker", component = "group", "Worker group stopped");
    }
}

fn log_join_error(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(subsystem = "worker", error = ?e, "Job task failed");
    }
}

impl GroupInner {
    /// Run one claimed envelope to a terminal or retry decision.
    async fn process(&self, envelope: JobEnvelope) {
        let start = Instant::now();
        let job_id = envelope.id;
        let attempt = envelope.attempts + 1;

        if envelope.attempts >= envelope.max_attempts {
            // Attempts were spent by runs that never reported back.
            let err = JobError::Other(format!(
                "attempts exhausted ({}/{}) before completion",
                envelope.attempts, envelope.max_attempts
            ));
            self.fail(&envelope, envelope.attempts, err).await;
            return;
        }

        if let Err(e) = self.jobs.mark_processing(job_id, attempt).await {
            warn!(
                subsystem = "worker",
                job_id = %job_id,
                error = %e,
                "Failed to mark job as processing"
            );
        }
        info!(
            subsystem = "worker",
            job_id = %job_id,
            job_type = %envelope.job_type,
            attempt,
            "Processing job"
        );
        let _ = self.events.send(WorkerEvent::JobStarted {
            job_id,
            job_type: envelope.job_type.clone(),
            attempt,
        });

        let result = self.execute(&envelope, attempt).await;

        match result {
            Ok(result_data) => {
                if let Err(e) = self.jobs.mark_completed(job_id, result_data).await {
                    error!(error = %e, job_id = %job_id, "Failed to mark job as completed");
                }
                if let Err(e) = self.queue.complete(job_id, Utc::now()).await {
                    error!(error = %e, job_id = %job_id, "Failed to archive completed envelope");
                }
                info!(
                    subsystem = "worker",
                    job_id = %job_id,
                    job_type = %envelope.job_type,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );
                let _ = self.events.send(WorkerEvent::JobCompleted {
                    job_id,
                    job_type: envelope.job_type.clone(),
                });
            }
            Err(err) => self.fail(&envelope, attempt, err).await,
        }
    }

    async fn execute(&self, envelope: &JobEnvelope, attempt: i32) -> JobResult {
        let payload = JobPayload::decode(&envelope.job_type, &envelope.payload)?;
        let handler = envelope
            .job_type
            .parse::<JobType>()
            .ok()
            .and_then(|jt| self.handlers.get(&jt).cloned())
            .ok_or_else(|| {
                warn!(
                    job_type = %envelope.job_type,
                    queue = %self.queue_name,
                    "No handler registered for job type"
                );
                JobError::UnsupportedJobType(envelope.job_type.clone())
            })?;

        let job_id = envelope.id;
        let events = self.events.clone();
        let ctx = JobContext::new(envelope.clone(), payload, attempt)
            .with_client(self.client.clone())
            .with_progress_callback(move |percent, message| {
                let _ = events.send(WorkerEvent::JobProgress {
                    job_id,
                    percent,
                    message: message.map(String::from),
                });
            });

        let task = tokio::spawn(async move { handler.execute(ctx).await });
        let abort = task.abort_handle();
        match tokio::time::timeout(self.job_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => {
                let panic = join_error.into_panic();
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(job_id = %job_id, panic = %message, "Job handler panicked");
                Err(JobError::Panicked(message))
            }
            Ok(Err(join_error)) => Err(JobError::Other(join_error.to_string())),
            Err(_) => {
                abort.abort();
                warn!(
                    job_id = %job_id,
                    job_type = %envelope.job_type,
                    "Job exceeded timeout of {}s",
                    self.job_timeout.as_secs()
                );
                Err(JobError::Timeout(format!(
                    "job exceeded timeout of {}s",
                    self.job_timeout.as_secs()
                )))
            }
        }
    }

    async fn fail(&self, envelope: &JobEnvelope, attempt: i32, err: JobError) {
        let job_type = envelope.job_type.clone();
        match self.retry.handle_job_failure(envelope, attempt, &err).await {
            Ok(RetryOutcome::Retrying { attempts, .. }) => {
                let _ = self.events.send(WorkerEvent::JobRetrying {
                    job_id: envelope.id,
                    job_type,
                    attempt: attempts,
                    error: err.to_string(),
                });
            }
            Ok(RetryOutcome::DeadLettered { dead_letter_id, .. }) => {
                let _ = self.events.send(WorkerEvent::JobDeadLettered {
                    job_id: envelope.id,
                    job_type,
                    dead_letter_id,
                    error: err.to_string(),
                });
            }
            Err(e) => {
                // The envelope stays active; stale-claim recovery requeues it.
                error!(
                    subsystem = "worker",
                    job_id = %envelope.id,
                    error = %e,
                    "Failed to record job failure"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.job_timeout_secs, 300);
        assert_eq!(config.default_attempts, 3);
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(50)
            .with_job_timeout(5)
            .with_default_attempts(5)
            .with_enabled(false);

        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.job_timeout_secs, 5);
        assert_eq!(config.default_attempts, 5);
        assert!(!config.enabled);
    }

    #[test]
    fn test_queue_defaults() {
        let configs = QueueConfig::defaults();
        let get = |name: &str| configs.iter().find(|c| c.name == name).cloned().unwrap();
        assert_eq!(configs.len(), 6);
        assert_eq!(get("documents").concurrency, 2);
        assert_eq!(get("reports").concurrency, 2);
        assert_eq!(get("notifications").concurrency, 10);
        assert_eq!(get("notifications").throughput_per_sec, 20);
        assert_eq!(get("reminders").concurrency, 10);
        assert_eq!(get("escalations").concurrency, 5);
        assert_eq!(get("maintenance").concurrency, 1);
    }

    #[test]
    fn test_queue_config_clamps_to_one() {
        let config = QueueConfig::new("custom", 0, 0);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.throughput_per_sec, 1);
    }

    #[test]
    fn test_queue_config_from_env_override() {
        std::env::set_var("QUEUE_CONCURRENCY_WORKER_UNIT_TEST_QUEUE", "7");
        let config = QueueConfig::from_env("worker-unit-test-queue");
        assert_eq!(config.concurrency, 7);
        assert_eq!(config.throughput_per_sec, defaults::THROUGHPUT_PER_SEC);
        std::env::remove_var("QUEUE_CONCURRENCY_WORKER_UNIT_TEST_QUEUE");
    }
}
