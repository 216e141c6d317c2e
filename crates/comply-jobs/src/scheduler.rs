//! Recurring triggers.
//!
//! A trigger is keyed by its job type, so registering the same job type on
//! every process start updates one row. Each firing enqueues an envelope
//! whose id is derived from the job type and the scheduled instant; any
//! number of schedulers racing on the same trigger produce one envelope.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use comply_core::{
    recurring_firing_id, recurring_trigger_id, EnqueueOptions, Error, JobPayload, JobType,
    RecurringTrigger, Result, ScheduleStore,
};

use crate::client::JobClient;

/// Parse a cron expression. Five-field expressions get a leading seconds
/// field of `0`.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::Schedule(format!("invalid cron expression '{expr}': {e}")))
}

/// First fire time strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

#[derive(Clone)]
pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    client: JobClient,
    tick: Duration,
}

impl Scheduler {
    pub fn new(schedules: Arc<dyn ScheduleStore>, client: JobClient, tick: Duration) -> Self {
        Self {
            schedules,
            client,
            tick,
        }
    }

    /// Register or update the recurring trigger for `job_type`.
    pub async fn schedule_recurring(
        &self,
        job_type: JobType,
        queue: &str,
        cron: &str,
        payload: JobPayload,
    ) -> Result<RecurringTrigger> {
        if payload.job_type() != job_type {
            return Err(Error::InvalidInput(format!(
                "payload for {} registered under {job_type}",
                payload.job_type()
            )));
        }
        payload.validate()?;

        let schedule = parse_cron(cron)?;
        let now = Utc::now();
        let next_run_at = next_fire(&schedule, now)
            .ok_or_else(|| Error::Schedule(format!("cron expression '{cron}' never fires")))?;

        let trigger = RecurringTrigger {
            id: recurring_trigger_id(job_type.as_str()),
            job_type: job_type.as_str().to_string(),
            queue: queue.to_string(),
            cron: cron.to_string(),
            payload: serde_json::to_value(&payload)?,
            next_run_at,
            last_run_at: None,
            enabled: true,
            updated_at: now,
        };
        let stored = self.schedules.upsert(&trigger).await?;

        info!(
            subsystem = "scheduler",
            op = "schedule_recurring",
            job_type = %job_type,
            queue = %queue,
            cron = %cron,
            next_run_at = %stored.next_run_at,
            "Recurring trigger registered"
        );
        Ok(stored)
    }

    pub async fn unschedule(&self, job_type: JobType) -> Result<bool> {
        let removed = self.schedules.remove(job_type.as_str()).await?;
        if removed {
            info!(subsystem = "scheduler", job_type = %job_type, "Recurring trigger removed");
        }
        Ok(removed)
    }

    pub async fn list_recurring(&self) -> Result<Vec<RecurringTrigger>> {
        self.schedules.list().await
    }

    /// Fire every trigger due at `now`. Returns the number of firings this
    /// call advanced.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;
        for trigger in self.schedules.due(now).await? {
            match self.fire(&trigger, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    subsystem = "scheduler",
                    job_type = %trigger.job_type,
                    error = %e,
                    "Recurring trigger failed to fire"
                ),
            }
        }
        Ok(fired)
    }

    async fn fire(&self, trigger: &RecurringTrigger, now: DateTime<Utc>) -> Result<bool> {
        let payload = JobPayload::decode(&trigger.job_type, &trigger.payload)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let schedule = parse_cron(&trigger.cron)?;
        let fire_at = trigger.next_run_at;
        // Missed firings collapse into this one.
        let next = next_fire(&schedule, now)
            .ok_or_else(|| Error::Schedule(format!("trigger {} never fires again", trigger.job_type)))?;

        // Enqueue before advancing: a crash in between re-fires the same id,
        // which the queue ignores.
        let job_id = recurring_firing_id(&trigger.job_type, fire_at);
        self.client
            .enqueue(
                &trigger.queue,
                payload,
                EnqueueOptions::new()
                    .with_job_id(job_id)
                    .with_recurrence_key(trigger.job_type.clone()),
            )
            .await?;

        let won = self
            .schedules
            .advance(trigger.id, fire_at, next, now)
            .await?;
        if won {
            debug!(
                subsystem = "scheduler",
                job_type = %trigger.job_type,
                job_id = %job_id,
                fire_at = %fire_at,
                next_run_at = %next,
                "Recurring trigger fired"
            );
        }
        Ok(won)
    }

    /// Run the tick loop until `shutdown` turns true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    #[instrument(skip(self, shutdown))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            subsystem = "scheduler",
            tick_ms = self.tick.as_millis() as u64,
            "Scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(subsystem = "scheduler", error = %e, "Scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!(subsystem = "scheduler", "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::JobDefaults;
    use comply_core::JobQueue;
    use comply_db::MemoryStore;

    fn scheduler(store: &MemoryStore) -> Scheduler {
        let client = JobClient::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            JobDefaults::default(),
        );
        Scheduler::new(Arc::new(store.clone()), client, Duration::from_millis(10))
    }

    #[test]
    fn test_parse_cron_accepts_five_and_six_fields() {
        assert!(parse_cron("*/15 * * * *").is_ok());
        assert!(parse_cron("0 0 8 * * *").is_ok());
    }

    #[test]
    fn test_parse_cron_rejects_garbage() {
        assert!(matches!(parse_cron("every day"), Err(Error::Schedule(_))));
        assert!(matches!(parse_cron("* * * * * * * *"), Err(Error::Schedule(_))));
    }

    #[test]
    fn test_next_fire_is_strictly_after() {
        let schedule = parse_cron("0 * * * *").unwrap();
        let at = "2026-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = next_fire(&schedule, at).unwrap();
        assert_eq!(next, "2026-03-01T11:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[tokio::test]
    async fn test_registering_twice_keeps_one_trigger() {
        let store = MemoryStore::new();
        let s = scheduler(&store);
        let payload = JobPayload::CheckDeadlines { company_id: None };

        let first = s
            .schedule_recurring(JobType::CheckDeadlines, "escalations", "0 * * * *", payload.clone())
            .await
            .unwrap();
        let second = s
            .schedule_recurring(JobType::CheckDeadlines, "escalations", "0 * * * *", payload)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(s.list_recurring().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_rejects_mismatched_payload() {
        let store = MemoryStore::new();
        let err = scheduler(&store)
            .schedule_recurring(
                JobType::DailyDigest,
                "notifications",
                "0 8 * * *",
                JobPayload::WeeklyDigest {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_tick_fires_once_per_instant() {
        let store = MemoryStore::new();
        let s = scheduler(&store);
        s.schedule_recurring(
            JobType::CleanupJobs,
            "maintenance",
            "* * * * *",
            JobPayload::CleanupJobs {},
        )
        .await
        .unwrap();

        let later = Utc::now() + chrono::Duration::minutes(2);
        assert_eq!(s.tick(later).await.unwrap(), 1);
        assert_eq!(s.tick(later).await.unwrap(), 0);
        assert_eq!(store.pending_count("maintenance").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_racing_schedulers_produce_one_envelope() {
        let store = MemoryStore::new();
        let a = scheduler(&store);
        let b = scheduler(&store);
        a.schedule_recurring(
            JobType::CleanupJobs,
            "maintenance",
            "* * * * *",
            JobPayload::CleanupJobs {},
        )
        .await
        .unwrap();

        let later = Utc::now() + chrono::Duration::minutes(2);
        let (fa, fb) = tokio::join!(a.tick(later), b.tick(later));
        assert_eq!(fa.unwrap() + fb.unwrap(), 1);
        assert_eq!(store.pending_count("maintenance").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unschedule_stops_firing() {
        let store = MemoryStore::new();
        let s = scheduler(&store);
        s.schedule_recurring(
            JobType::CleanupJobs,
            "maintenance",
            "* * * * *",
            JobPayload::CleanupJobs {},
        )
        .await
        .unwrap();
        assert!(s.unschedule(JobType::CleanupJobs).await.unwrap());
        assert!(!s.unschedule(JobType::CleanupJobs).await.unwrap());

        let later = Utc::now() + chrono::Duration::minutes(2);
        assert_eq!(s.tick(later).await.unwrap(), 0);
    }
}
