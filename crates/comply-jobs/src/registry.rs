//! The process-owned queue registry.
//!
//! Holds the stores, queue configs and handler maps, and owns the lifecycle
//! of the worker groups and the scheduler. Handlers are registered before
//! [`QueueRegistry::start`]; the typed handler map of every queue is fixed
//! from that point until [`QueueRegistry::shutdown`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use comply_core::defaults::EVENT_BUS_CAPACITY;
use comply_core::{
    Backoff, DeadLetterEntry, DeadLetterOrigin, EnqueueOptions, Error, JobPayload, JobType,
    NotificationRecord, QueueStats, RecurringTrigger, Result,
};

use crate::client::{JobClient, JobDefaults};
use crate::handler::JobHandler;
use crate::retry::RetryEngine;
use crate::scheduler::Scheduler;
use crate::stores::Stores;
use crate::worker::{QueueConfig, WorkerConfig, WorkerEvent, WorkerGroup};

/// Id given to the replay of a dead-letter entry. Replaying twice collapses
/// onto the same job or notification.
pub fn replay_id(dead_letter_id: Uuid) -> Uuid {
    Uuid::new_v5(&dead_letter_id, b"replay")
}

struct QueueSlot {
    config: QueueConfig,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct QueueRegistry {
    stores: Stores,
    worker: WorkerConfig,
    client: JobClient,
    retry: RetryEngine,
    scheduler: Scheduler,
    events: broadcast::Sender<WorkerEvent>,
    queues: HashMap<String, QueueSlot>,
    running: Mutex<Option<Running>>,
}

impl QueueRegistry {
    pub fn new(stores: Stores, worker: WorkerConfig) -> Self {
        let client = JobClient::new(
            stores.jobs.clone(),
            stores.queue.clone(),
            JobDefaults {
                attempts: worker.default_attempts.max(1),
                backoff: Backoff::Exponential {
                    base_ms: worker.backoff_base_ms,
                },
            },
        );
        let retry = RetryEngine::new(
            stores.jobs.clone(),
            stores.queue.clone(),
            stores.dead_letters.clone(),
            stores.notifications.clone(),
        );
        let scheduler = Scheduler::new(
            stores.schedules.clone(),
            client.clone(),
            Duration::from_millis(worker.scheduler_tick_ms.max(1)),
        );
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        Self {
            stores,
            worker,
            client,
            retry,
            scheduler,
            events,
            queues: HashMap::new(),
            running: Mutex::new(None),
        }
    }

    /// Route `handler`'s job type to a worker group on `queue` with the given
    /// limits. A later registration for the same queue replaces its limits.
    pub fn register_handler(
        &mut self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        throughput_per_sec: u32,
    ) -> &mut Self {
        let config = QueueConfig::new(queue, concurrency, throughput_per_sec);
        let slot = self.queues.entry(queue.to_string()).or_insert_with(|| QueueSlot {
            config: config.clone(),
            handlers: HashMap::new(),
        });
        slot.config = config;
        slot.handlers.insert(handler.job_type(), handler);
        self
    }

    /// Register on the job type's default queue with that queue's configured
    /// limits (`QUEUE_CONCURRENCY_*` / `QUEUE_THROUGHPUT_*`).
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        let queue = handler.job_type().default_queue();
        let config = QueueConfig::from_env(queue);
        self.register_handler(queue, handler, config.concurrency, config.throughput_per_sec)
    }

    /// Queues with at least one handler.
    pub fn queues(&self) -> Vec<QueueConfig> {
        let mut configs: Vec<QueueConfig> = self.queues.values().map(|s| s.config.clone()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn client(&self) -> JobClient {
        self.client.clone()
    }

    pub fn retry(&self) -> RetryEngine {
        self.retry.clone()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Subscribe to worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Spawn one worker group per registered queue plus the scheduler loop.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Internal("queue registry already started".into()));
        }
        if !self.worker.enabled {
            info!(subsystem = "worker", "Job workers disabled, not starting");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.queues.len() + 1);
        for slot in self.queues.values() {
            let group = WorkerGroup::new(
                slot.config.clone(),
                slot.handlers.clone(),
                &self.stores,
                self.retry.clone(),
                self.client.clone(),
                self.events.clone(),
                &self.worker,
            );
            handles.push(group.spawn(shutdown_rx.clone()));
        }
        handles.push(self.scheduler.clone().spawn(shutdown_rx));

        info!(
            subsystem = "worker",
            queues = self.queues.len(),
            "Queue registry started"
        );
        *running = Some(Running {
            shutdown_tx,
            handles,
        });
        Ok(())
    }

    /// Stop claiming, let in-flight jobs finish and wait for every loop.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        running
            .shutdown_tx
            .send(true)
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        for handle in running.handles {
            if let Err(e) = handle.await {
                warn!(subsystem = "worker", error = %e, "Worker task ended abnormally");
            }
        }
        info!(subsystem = "worker", "Queue registry stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn enqueue(
        &self,
        queue: &str,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        self.client.enqueue(queue, payload, options).await
    }

    /// Run `job_type` once now, outside its recurring schedule.
    pub async fn trigger_job(
        &self,
        job_type: JobType,
        queue: &str,
        payload: JobPayload,
    ) -> Result<Uuid> {
        if payload.job_type() != job_type {
            return Err(Error::InvalidInput(format!(
                "payload for {} triggered as {job_type}",
                payload.job_type()
            )));
        }
        self.client
            .enqueue(queue, payload, EnqueueOptions::new())
            .await
    }

    pub async fn schedule_recurring(
        &self,
        job_type: JobType,
        queue: &str,
        cron: &str,
        payload: JobPayload,
    ) -> Result<RecurringTrigger> {
        self.scheduler
            .schedule_recurring(job_type, queue, cron, payload)
            .await
    }

    pub async fn unschedule(&self, job_type: JobType) -> Result<bool> {
        self.scheduler.unschedule(job_type).await
    }

    pub async fn list_recurring(&self) -> Result<Vec<RecurringTrigger>> {
        self.scheduler.list_recurring().await
    }

    /// Remove a job that has not started yet. Active jobs are left alone.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        if !self.stores.queue.cancel(job_id).await? {
            return Ok(false);
        }
        let attempts = self
            .stores
            .jobs
            .get(job_id)
            .await?
            .map(|r| r.attempts)
            .unwrap_or(0);
        self.stores
            .jobs
            .mark_failed(job_id, attempts, "cancelled")
            .await?;
        info!(subsystem = "jobs", op = "cancel", job_id = %job_id, "Job cancelled");
        Ok(true)
    }

    /// Re-run the work behind a dead-letter entry with a fresh attempt count.
    ///
    /// Jobs are re-enqueued on their original queue; notifications are
    /// re-inserted as PENDING. Returns the id of the new job or notification.
    pub async fn replay(&self, dead_letter_id: Uuid) -> Result<Uuid> {
        let entry = self
            .stores
            .dead_letters
            .get(dead_letter_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("dead letter {dead_letter_id}")))?;

        let id = match entry.origin {
            DeadLetterOrigin::Job => self.replay_job(&entry).await?,
            DeadLetterOrigin::Notification => self.replay_notification(&entry).await?,
        };
        self.stores
            .dead_letters
            .mark_replayed(entry.id, Utc::now())
            .await?;
        info!(
            subsystem = "jobs",
            op = "replay",
            dead_letter_id = %entry.id,
            origin = entry.origin.as_str(),
            replay_id = %id,
            "Dead letter replayed"
        );
        Ok(id)
    }

    async fn replay_job(&self, entry: &DeadLetterEntry) -> Result<Uuid> {
        let payload = JobPayload::decode(&entry.origin_type, &entry.payload)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let queue = entry
            .queue
            .clone()
            .unwrap_or_else(|| payload.job_type().default_queue().to_string());
        let options = EnqueueOptions::new()
            .with_job_id(replay_id(entry.id))
            .with_replay_of(entry.id);
        self.client.enqueue(&queue, payload, options).await
    }

    async fn replay_notification(&self, entry: &DeadLetterEntry) -> Result<Uuid> {
        let original: NotificationRecord = serde_json::from_value(entry.payload.clone())?;
        let mut fresh = NotificationRecord::new(
            original.recipient,
            original.notification_type,
            original.channel,
            original.subject,
            original.body,
        )
        .with_id(replay_id(entry.id))
        .with_priority(original.priority)
        .with_escalation_level(original.escalation_level);
        if let (Some(kind), Some(id)) = (original.entity_type, original.entity_id) {
            fresh = fresh.with_entity(kind, id);
        }
        self.stores.notifications.insert(&fresh).await?;
        Ok(fresh.id)
    }

    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        self.stores.dead_letters.list(None, limit).await
    }

    pub async fn pending_count(&self, queue: &str) -> Result<i64> {
        self.stores.queue.pending_count(queue).await
    }

    pub async fn stats(&self, queue: Option<&str>) -> Result<QueueStats> {
        self.stores.queue.stats(queue, Utc::now()).await
    }
}
