//! In-process backend implementing every store trait.
//!
//! All state sits behind one async mutex, so each trait method is atomic the
//! same way a single SQL statement or transaction is in the Postgres stores.
//! Used by tests and by single-process development setups without Postgres.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use comply_core::{
    Channel, CounterState, DeadLetterEntry, DeadLetterOrigin, DeadLetterStore, DigestType,
    EntityRef, EnvelopeState, Error, EscalationRecord, EscalationStore, EscalationTransition,
    EscalationWorkflow, Frequency, JobEnvelope, JobQueue, JobRecord, JobStatus, JobStore,
    NotificationPreference, NotificationRecord, NotificationStatus, NotificationStore,
    PreferenceStore, QueueStats, RateLimitStore, RecurringTrigger, Result, RetentionPolicy,
    ScheduleStore,
};

#[derive(Default)]
struct MemoryState {
    records: HashMap<Uuid, JobRecord>,
    /// Envelope plus its enqueue sequence number.
    envelopes: HashMap<Uuid, (u64, JobEnvelope)>,
    next_seq: u64,
    dead_letters: Vec<DeadLetterEntry>,
    triggers: HashMap<Uuid, RecurringTrigger>,
    notifications: HashMap<Uuid, NotificationRecord>,
    preferences: HashMap<(Uuid, String, Channel), Frequency>,
    escalations: HashMap<EntityRef, EscalationRecord>,
    workflows: HashMap<Uuid, EscalationWorkflow>,
}

impl MemoryState {
    fn record_mut(&mut self, id: Uuid) -> Result<&mut JobRecord> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job record {id}")))
    }

    /// Apply a record update unless the record is already terminal.
    fn update_record(&mut self, id: Uuid, f: impl FnOnce(&mut JobRecord)) -> Result<()> {
        let record = self.record_mut(id)?;
        if !record.status.is_terminal() {
            f(record);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    fn transition(
        &mut self,
        id: Uuid,
        to: NotificationStatus,
        f: impl FnOnce(&mut NotificationRecord),
    ) -> Result<()> {
        let n = self
            .notifications
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("notification {id}")))?;
        if !n.status.can_transition_to(to) {
            return Err(Error::Job(format!(
                "notification {id}: illegal transition {} -> {}",
                n.status.as_str(),
                to.as_str()
            )));
        }
        n.status = to;
        f(n);
        n.updated_at = Utc::now();
        Ok(())
    }

    fn archive(&mut self, id: Uuid, state: EnvelopeState, now: DateTime<Utc>) -> Result<()> {
        match self.envelopes.get_mut(&id) {
            Some((_, env))
                if matches!(env.state, EnvelopeState::Pending | EnvelopeState::Active) =>
            {
                env.state = state;
                env.locked_at = None;
                env.finished_at = Some(now);
                Ok(())
            }
            _ => Err(Error::Job(format!(
                "envelope {id} is not pending or active, cannot archive as {}",
                state.as_str()
            ))),
        }
    }

    fn prune_state(&mut self, state: EnvelopeState, max_age_secs: i64, keep: i64, now: DateTime<Utc>) -> u64 {
        let cutoff = now - chrono::Duration::seconds(max_age_secs);
        let mut archived: Vec<(Uuid, Option<DateTime<Utc>>)> = self
            .envelopes
            .values()
            .filter(|(_, e)| e.state == state)
            .map(|(_, e)| (e.id, e.finished_at))
            .collect();
        archived.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0;
        for (idx, (id, finished_at)) in archived.into_iter().enumerate() {
            let too_old = finished_at.map(|f| f < cutoff).unwrap_or(false);
            if too_old || idx as i64 >= keep {
                self.envelopes.remove(&id);
                removed += 1;
            }
        }
        removed
    }
}

/// In-memory implementation of all store traits.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, record: &JobRecord) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&record.id) {
            return Ok(false);
        }
        state.records.insert(record.id, record.clone());
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.state.lock().await.records.get(&id).cloned())
    }

    async fn mark_processing(&self, id: Uuid, attempt: i32) -> Result<()> {
        self.state.lock().await.update_record(id, |r| {
            r.status = JobStatus::Processing;
            r.attempts = attempt;
        })
    }

    async fn mark_completed(&self, id: Uuid, result: Option<JsonValue>) -> Result<()> {
        self.state.lock().await.update_record(id, |r| {
            r.status = JobStatus::Completed;
            r.result = result;
            r.error_message = None;
        })
    }

    async fn mark_retrying(&self, id: Uuid, attempts: i32, error: &str) -> Result<()> {
        self.state.lock().await.update_record(id, |r| {
            r.status = JobStatus::Retrying;
            r.attempts = attempts;
            r.error_message = Some(error.to_string());
        })
    }

    async fn mark_failed(&self, id: Uuid, attempts: i32, error: &str) -> Result<()> {
        self.state.lock().await.update_record(id, |r| {
            r.status = JobStatus::Failed;
            r.attempts = attempts;
            r.error_message = Some(error.to_string());
        })
    }

    async fn list_filtered(
        &self,
        status: Option<JobStatus>,
        job_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<JobRecord> = state
            .records
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .filter(|r| job_type.map_or(true, |t| r.job_type == t))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn push(&self, envelope: &JobEnvelope) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.envelopes.contains_key(&envelope.id) {
            return Ok(false);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let mut env = envelope.clone();
        env.state = EnvelopeState::Pending;
        env.locked_at = None;
        env.finished_at = None;
        state.envelopes.insert(env.id, (seq, env));
        Ok(true)
    }

    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<JobEnvelope>> {
        let mut state = self.state.lock().await;
        let next = state
            .envelopes
            .values()
            .filter(|(_, e)| e.queue == queue && e.state == EnvelopeState::Pending && e.run_at <= now)
            .min_by(|(sa, a), (sb, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(sa.cmp(sb))
            })
            .map(|(_, e)| e.id);

        Ok(next.and_then(|id| {
            state.envelopes.get_mut(&id).map(|(_, env)| {
                env.state = EnvelopeState::Active;
                env.locked_at = Some(now);
                env.clone()
            })
        }))
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.state
            .lock()
            .await
            .archive(id, EnvelopeState::Completed, now)
    }

    async fn fail(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.state.lock().await.archive(id, EnvelopeState::Failed, now)
    }

    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>, attempts: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.envelopes.get_mut(&id) {
            Some((_, env)) if env.state == EnvelopeState::Active => {
                env.state = EnvelopeState::Pending;
                env.run_at = run_at;
                env.attempts = attempts;
                env.locked_at = None;
                Ok(())
            }
            _ => Err(Error::Job(format!("envelope {id} is not active"))),
        }
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let pending = matches!(
            state.envelopes.get(&id),
            Some((_, env)) if env.state == EnvelopeState::Pending
        );
        if pending {
            state.envelopes.remove(&id);
        }
        Ok(pending)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobEnvelope>> {
        Ok(self
            .state
            .lock()
            .await
            .envelopes
            .get(&id)
            .map(|(_, e)| e.clone()))
    }

    async fn pending_count(&self, queue: &str) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .envelopes
            .values()
            .filter(|(_, e)| e.queue == queue && e.state == EnvelopeState::Pending)
            .count() as i64)
    }

    async fn stats(&self, queue: Option<&str>, now: DateTime<Utc>) -> Result<QueueStats> {
        let hour_ago = now - chrono::Duration::hours(1);
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for (_, e) in state.envelopes.values() {
            if queue.map_or(false, |q| e.queue != q) {
                continue;
            }
            stats.total += 1;
            let recent = e.finished_at.map_or(false, |f| f > hour_ago);
            match e.state {
                EnvelopeState::Pending => stats.pending += 1,
                EnvelopeState::Active => stats.active += 1,
                EnvelopeState::Completed if recent => stats.completed_last_hour += 1,
                EnvelopeState::Failed if recent => stats.failed_last_hour += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for (_, env) in state.envelopes.values_mut() {
            let stale = env.state == EnvelopeState::Active
                && env.locked_at.map_or(false, |l| l < older_than);
            if stale {
                env.state = EnvelopeState::Pending;
                env.attempts += 1;
                env.locked_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let completed = state.prune_state(
            EnvelopeState::Completed,
            policy.completed_max_age_secs,
            policy.completed_max_count,
            now,
        );
        let failed = state.prune_state(
            EnvelopeState::Failed,
            policy.failed_max_age_secs,
            policy.failed_max_count,
            now,
        );
        Ok(completed + failed)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn insert_once(&self, entry: &DeadLetterEntry) -> Result<bool> {
        let mut state = self.state.lock().await;
        let exists = state
            .dead_letters
            .iter()
            .any(|d| d.origin == entry.origin && d.origin_id == entry.origin_id);
        if exists {
            return Ok(false);
        }
        state.dead_letters.push(entry.clone());
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.iter().find(|d| d.id == id).cloned())
    }

    async fn find_by_origin(
        &self,
        origin: DeadLetterOrigin,
        origin_id: Uuid,
    ) -> Result<Option<DeadLetterEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .dead_letters
            .iter()
            .find(|d| d.origin == origin && d.origin_id == origin_id)
            .cloned())
    }

    async fn list(
        &self,
        origin: Option<DeadLetterOrigin>,
        limit: i64,
    ) -> Result<Vec<DeadLetterEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<DeadLetterEntry> = state
            .dead_letters
            .iter()
            .filter(|d| origin.map_or(true, |o| d.origin == o))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn mark_replayed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state
            .dead_letters
            .iter_mut()
            .find(|d| d.id == id && d.replayed_at.is_none())
        {
            Some(entry) => {
                entry.replayed_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn upsert(&self, trigger: &RecurringTrigger) -> Result<RecurringTrigger> {
        let mut state = self.state.lock().await;
        let stored = match state.triggers.get(&trigger.id) {
            Some(existing) => {
                let next_run_at = if existing.cron == trigger.cron {
                    existing.next_run_at
                } else {
                    trigger.next_run_at
                };
                RecurringTrigger {
                    next_run_at,
                    last_run_at: existing.last_run_at,
                    ..trigger.clone()
                }
            }
            None => trigger.clone(),
        };
        state.triggers.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, job_type: &str) -> Result<Option<RecurringTrigger>> {
        let state = self.state.lock().await;
        Ok(state
            .triggers
            .values()
            .find(|t| t.job_type == job_type)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<RecurringTrigger>> {
        let state = self.state.lock().await;
        let mut triggers: Vec<RecurringTrigger> = state.triggers.values().cloned().collect();
        triggers.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        Ok(triggers)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<RecurringTrigger>> {
        let state = self.state.lock().await;
        let mut due: Vec<RecurringTrigger> = state
            .triggers
            .values()
            .filter(|t| t.enabled && t.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        Ok(due)
    }

    async fn advance(
        &self,
        id: Uuid,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.triggers.get_mut(&id) {
            Some(t) if t.enabled && t.next_run_at == expected_next => {
                t.next_run_at = next;
                t.last_run_at = Some(now);
                t.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, job_type: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.triggers.len();
        state.triggers.retain(|_, t| t.job_type != job_type);
        Ok(state.triggers.len() < before)
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, record: &NotificationRecord) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.notifications.contains_key(&record.id) {
            return Ok(false);
        }
        state.notifications.insert(record.id, record.clone());
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<NotificationRecord>> {
        Ok(self.state.lock().await.notifications.get(&id).cloned())
    }

    async fn claim_due(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<&mut NotificationRecord> = state
            .notifications
            .values_mut()
            .filter(|n| {
                n.status.is_deliverable()
                    && n.scheduled_for <= now
                    && n.locked_until.map_or(true, |l| l < now)
            })
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|n| {
                n.locked_until = Some(lease_until);
                n.clone()
            })
            .collect())
    }

    async fn mark_cancelled(&self, id: Uuid, reason: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .transition(id, NotificationStatus::Cancelled, |n| {
                n.delivery.last_error = Some(reason.to_string());
                n.locked_until = None;
            })
    }

    async fn mark_queued(&self, id: Uuid, digest: DigestType) -> Result<()> {
        self.state
            .lock()
            .await
            .transition(id, NotificationStatus::Queued, |n| {
                n.digest_type = Some(digest);
                n.locked_until = None;
            })
    }

    async fn defer(&self, id: Uuid, until: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.notifications.get_mut(&id) {
            Some(n) if n.status.is_deliverable() => {
                n.scheduled_for = until;
                n.locked_until = None;
                n.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(Error::Job(format!(
                "notification {id} is not deliverable, cannot defer"
            ))),
        }
    }

    async fn mark_sending(&self, id: Uuid) -> Result<()> {
        self.state
            .lock()
            .await
            .transition(id, NotificationStatus::Sending, |_| {})
    }

    async fn recover_sending(&self, now: DateTime<Utc>, reason: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for n in state.notifications.values_mut() {
            if n.status == NotificationStatus::Sending && n.locked_until.map_or(true, |l| l < now) {
                n.status = NotificationStatus::Retrying;
                n.delivery.last_error = Some(reason.to_string());
                n.scheduled_for = now;
                n.locked_until = None;
                n.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn mark_sent(&self, id: Uuid, provider_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.state
            .lock()
            .await
            .transition(id, NotificationStatus::Sent, |n| {
                n.delivery.provider_id = Some(provider_id.to_string());
                n.delivery.sent_at = Some(at);
                n.delivery.last_error = None;
                n.locked_until = None;
            })
    }

    async fn mark_retrying(
        &self,
        id: Uuid,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.state
            .lock()
            .await
            .transition(id, NotificationStatus::Retrying, |n| {
                n.delivery.retry_count = retry_count;
                n.delivery.last_error = Some(error.to_string());
                n.scheduled_for = next_attempt_at;
                n.locked_until = None;
            })
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        retry_count: i32,
        error: &str,
        dead_letter_id: Option<Uuid>,
    ) -> Result<()> {
        self.state
            .lock()
            .await
            .transition(id, NotificationStatus::Failed, |n| {
                n.delivery.retry_count = retry_count;
                n.delivery.last_error = Some(error.to_string());
                n.delivery.dead_letter_id = dead_letter_id;
                n.locked_until = None;
            })
    }

    async fn list_queued(
        &self,
        digest: DigestType,
        since: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>> {
        let state = self.state.lock().await;
        let mut queued: Vec<NotificationRecord> = state
            .notifications
            .values()
            .filter(|n| {
                n.status == NotificationStatus::Queued
                    && n.digest_type == Some(digest)
                    && n.scheduled_for >= since
            })
            .cloned()
            .collect();
        queued.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(queued)
    }

    async fn mark_digest_sent(
        &self,
        ids: &[Uuid],
        provider_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut marked = 0;
        for id in ids {
            if let Some(n) = state.notifications.get_mut(id) {
                if n.status == NotificationStatus::Queued {
                    n.status = NotificationStatus::Sent;
                    n.delivery.provider_id = Some(provider_id.to_string());
                    n.delivery.sent_at = Some(at);
                    n.updated_at = at;
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    async fn hold_queued(&self, ids: &[Uuid], until: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut held = 0;
        for id in ids {
            if let Some(n) = state.notifications.get_mut(id) {
                if n.status == NotificationStatus::Queued {
                    n.scheduled_for = until;
                    n.updated_at = Utc::now();
                    held += 1;
                }
            }
        }
        Ok(held)
    }

    async fn expire_queued(
        &self,
        digest: DigestType,
        before: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for n in state.notifications.values_mut() {
            if n.status == NotificationStatus::Queued
                && n.digest_type == Some(digest)
                && n.scheduled_for < before
            {
                n.status = NotificationStatus::Cancelled;
                n.delivery.last_error = Some(reason.to_string());
                n.updated_at = Utc::now();
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Vec<NotificationRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<NotificationRecord> = state
            .notifications
            .values()
            .filter(|n| {
                n.entity_type.as_deref() == Some(entity_type) && n.entity_id == Some(entity_id)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

#[async_trait]
impl PreferenceStore for MemoryStore {
    async fn for_user(&self, user_id: Uuid) -> Result<Vec<NotificationPreference>> {
        let state = self.state.lock().await;
        Ok(state
            .preferences
            .iter()
            .filter(|((user, _, _), _)| *user == user_id)
            .map(|((user, notification_type, channel), frequency)| NotificationPreference {
                user_id: *user,
                notification_type: notification_type.clone(),
                channel: *channel,
                frequency: *frequency,
            })
            .collect())
    }

    async fn set(&self, preference: &NotificationPreference) -> Result<()> {
        let mut state = self.state.lock().await;
        state.preferences.insert(
            (
                preference.user_id,
                preference.notification_type.clone(),
                preference.channel,
            ),
            preference.frequency,
        );
        Ok(())
    }
}

#[async_trait]
impl EscalationStore for MemoryStore {
    async fn get(&self, entity: &EntityRef) -> Result<Option<EscalationRecord>> {
        Ok(self.state.lock().await.escalations.get(entity).cloned())
    }

    async fn advance(
        &self,
        transition: &EscalationTransition,
        notifications: &[NotificationRecord],
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let previous = state.escalations.get(&transition.entity);
        let matches = match previous {
            Some(r) => r.current_level == transition.from_level && r.cycle == transition.cycle,
            None => transition.from_level == 0 && transition.cycle == 0,
        };
        if !matches {
            return Ok(false);
        }

        let record = transition.apply(previous);
        state.escalations.insert(transition.entity.clone(), record);
        for n in notifications {
            state.notifications.entry(n.id).or_insert_with(|| n.clone());
        }
        Ok(true)
    }

    async fn reset(&self, entity: &EntityRef) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.escalations.get_mut(entity) {
            Some(r) if r.current_level > 0 => {
                r.current_level = 0;
                r.cycle += 1;
                r.notified_recipient_ids.clear();
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn workflow_for_company(&self, company_id: Uuid) -> Result<Option<EscalationWorkflow>> {
        let state = self.state.lock().await;
        Ok(state
            .workflows
            .values()
            .find(|w| w.company_id == Some(company_id))
            .cloned())
    }

    async fn save_workflow(&self, workflow: &EscalationWorkflow) -> Result<()> {
        self.state
            .lock()
            .await
            .workflows
            .insert(workflow.id, workflow.clone());
        Ok(())
    }
}

// =============================================================================
// RATE LIMIT COUNTERS
// =============================================================================

/// In-process windowed counters on the tokio clock, so paused-time tests can
/// advance past a window.
#[derive(Clone, Default)]
pub struct MemoryRateLimitStore {
    counters: Arc<Mutex<HashMap<String, (u64, Instant)>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn read(&self, key: &str) -> Result<Option<CounterState>> {
        let now = Instant::now();
        let counters = self.counters.lock().await;
        Ok(counters
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(count, expires)| CounterState {
                count: *count,
                ttl: expires.saturating_duration_since(now),
            }))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let entry = counters
            .entry(key.to_string())
            .or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comply_core::{JobPayload, Priority, Recipient};

    fn envelope(queue: &str, priority: Priority, at: DateTime<Utc>) -> JobEnvelope {
        JobEnvelope::new(Uuid::now_v7(), queue, &JobPayload::CleanupJobs {}, priority, at).unwrap()
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_fifo() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let normal_a = envelope("q", Priority::Normal, t0);
        let normal_b = envelope("q", Priority::Normal, t0);
        let critical = envelope("q", Priority::Critical, t0 + chrono::Duration::seconds(1));
        JobQueue::push(&store, &normal_a).await.unwrap();
        JobQueue::push(&store, &normal_b).await.unwrap();
        JobQueue::push(&store, &critical).await.unwrap();

        let now = t0 + chrono::Duration::seconds(5);
        let order: Vec<Uuid> = vec![
            store.claim_next("q", now).await.unwrap().unwrap().id,
            store.claim_next("q", now).await.unwrap().unwrap().id,
            store.claim_next("q", now).await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![critical.id, normal_a.id, normal_b.id]);
        assert!(store.claim_next("q", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_delayed_and_other_queues() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut delayed = envelope("q", Priority::Critical, now);
        delayed.run_at = now + chrono::Duration::minutes(5);
        JobQueue::push(&store, &delayed).await.unwrap();
        JobQueue::push(&store, &envelope("other", Priority::Normal, now))
            .await
            .unwrap();

        assert!(store.claim_next("q", now).await.unwrap().is_none());
        let later = now + chrono::Duration::minutes(6);
        assert_eq!(store.claim_next("q", later).await.unwrap().unwrap().id, delayed.id);
    }

    #[tokio::test]
    async fn test_push_same_id_is_noop() {
        let store = MemoryStore::new();
        let env = envelope("q", Priority::Normal, Utc::now());
        assert!(JobQueue::push(&store, &env).await.unwrap());
        assert!(!JobQueue::push(&store, &env).await.unwrap());
        assert_eq!(store.pending_count("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = envelope("q", Priority::Normal, now);
        let b = envelope("q", Priority::Low, now);
        JobQueue::push(&store, &a).await.unwrap();
        JobQueue::push(&store, &b).await.unwrap();
        let claimed = store.claim_next("q", now).await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);

        assert!(!store.cancel(a.id).await.unwrap());
        assert!(store.cancel(b.id).await.unwrap());
        assert!(JobQueue::get(&store, b.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_stale_counts_lost_attempt() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let env = envelope("q", Priority::Normal, now);
        JobQueue::push(&store, &env).await.unwrap();
        store.claim_next("q", now).await.unwrap();

        let recovered = store
            .recover_stale(now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(recovered, 1);
        let env = JobQueue::get(&store, env.id).await.unwrap().unwrap();
        assert_eq!(env.state, EnvelopeState::Pending);
        assert_eq!(env.attempts, 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_within_count() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            let env = envelope("q", Priority::Normal, now);
            JobQueue::push(&store, &env).await.unwrap();
            store.claim_next("q", now).await.unwrap();
            store.complete(env.id, now).await.unwrap();
        }
        let policy = RetentionPolicy {
            completed_max_count: 2,
            ..RetentionPolicy::default()
        };
        assert_eq!(store.prune(&policy, now).await.unwrap(), 1);
        assert_eq!(store.stats(Some("q"), now).await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_terminal_record_is_not_rewritten() {
        let store = MemoryStore::new();
        let env = envelope("q", Priority::Normal, Utc::now());
        let record = JobRecord::for_envelope(&env);
        JobStore::create(&store, &record).await.unwrap();
        JobStore::mark_failed(&store, record.id, 3, "boom").await.unwrap();
        JobStore::mark_retrying(&store, record.id, 4, "late").await.unwrap();

        let record = JobStore::get(&store, record.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_dead_letter_insert_once_per_origin() {
        let store = MemoryStore::new();
        let origin_id = Uuid::new_v4();
        let entry = |id| DeadLetterEntry {
            id,
            origin: DeadLetterOrigin::Job,
            origin_id,
            origin_type: "CLEANUP_JOBS".into(),
            queue: Some("maintenance".into()),
            payload: serde_json::json!({}),
            error: "boom".into(),
            retry_count: 3,
            created_at: Utc::now(),
            replayed_at: None,
        };
        assert!(store.insert_once(&entry(Uuid::new_v4())).await.unwrap());
        assert!(!store.insert_once(&entry(Uuid::new_v4())).await.unwrap());
        assert_eq!(DeadLetterStore::list(&store, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_illegal_transition_is_rejected() {
        let store = MemoryStore::new();
        let n = NotificationRecord::new(
            Recipient::user(Uuid::new_v4()),
            "deadline_reminder",
            Channel::InApp,
            "s",
            "b",
        );
        NotificationStore::insert(&store, &n).await.unwrap();
        let err = store.mark_sent(n.id, "p", Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Job(_)));
        store.mark_sending(n.id).await.unwrap();
        store.mark_sent(n.id, "p", Utc::now()).await.unwrap();
        assert!(store.mark_sending(n.id).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_due_respects_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let n = NotificationRecord::new(
            Recipient::user(Uuid::new_v4()),
            "t",
            Channel::InApp,
            "s",
            "b",
        )
        .with_created_at(now);
        NotificationStore::insert(&store, &n).await.unwrap();

        let lease = now + chrono::Duration::minutes(5);
        assert_eq!(store.claim_due(10, now, lease).await.unwrap().len(), 1);
        assert!(store.claim_due(10, now, lease).await.unwrap().is_empty());
        let after_lease = lease + chrono::Duration::seconds(1);
        assert_eq!(
            store
                .claim_due(10, after_lease, after_lease + chrono::Duration::minutes(5))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_recover_sending_waits_for_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let n = NotificationRecord::new(
            Recipient::user(Uuid::new_v4()),
            "t",
            Channel::Email,
            "s",
            "b",
        )
        .with_created_at(now);
        NotificationStore::insert(&store, &n).await.unwrap();
        let lease = now + chrono::Duration::minutes(5);
        store.claim_due(10, now, lease).await.unwrap();
        store.mark_sending(n.id).await.unwrap();

        assert_eq!(store.recover_sending(now, "lease expired").await.unwrap(), 0);
        let later = lease + chrono::Duration::seconds(1);
        assert_eq!(store.recover_sending(later, "lease expired").await.unwrap(), 1);

        let stored = NotificationStore::get(&store, n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Retrying);
        assert_eq!(stored.delivery.retry_count, 0);
        assert_eq!(stored.delivery.last_error.as_deref(), Some("lease expired"));
        assert_eq!(stored.locked_until, None);
        assert_eq!(stored.scheduled_for, later);
        assert_eq!(store.claim_due(10, later, later + chrono::Duration::minutes(5)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hold_queued_moves_digest_anchor() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let n = NotificationRecord::new(
            Recipient::user(Uuid::new_v4()),
            "t",
            Channel::Email,
            "s",
            "b",
        )
        .with_created_at(now - chrono::Duration::hours(23));
        NotificationStore::insert(&store, &n).await.unwrap();
        store.mark_queued(n.id, DigestType::Daily).await.unwrap();

        let until = now + chrono::Duration::hours(1);
        assert_eq!(store.hold_queued(&[n.id], until).await.unwrap(), 1);

        // Anchored on the hold, not on creation.
        let cutoff = now + chrono::Duration::hours(2) - chrono::Duration::hours(24);
        assert_eq!(
            store.expire_queued(DigestType::Daily, cutoff, "elapsed").await.unwrap(),
            0
        );
        let queued = store.list_queued(DigestType::Daily, cutoff).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].scheduled_for, until);

        store.mark_digest_sent(&[n.id], "p", now).await.unwrap();
        assert_eq!(store.hold_queued(&[n.id], until).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_counter_window_expires() {
        let store = MemoryRateLimitStore::new();
        let window = Duration::from_secs(3600);
        assert_eq!(store.increment("k", window).await.unwrap(), 1);
        assert_eq!(store.increment("k", window).await.unwrap(), 2);
        let state = store.read("k").await.unwrap().unwrap();
        assert_eq!(state.count, 2);
        assert_eq!(state.ttl, window);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(store.read("k").await.unwrap().is_none());
        assert_eq!(store.increment("k", window).await.unwrap(), 1);
    }
}
