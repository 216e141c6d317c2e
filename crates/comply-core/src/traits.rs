//! Store and collaborator traits.
//!
//! Every persistent concern of the orchestration core sits behind one of
//! these traits so that the Postgres/Redis backends in `comply-db` and the
//! in-memory backend used by tests are interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::models::*;

// =============================================================================
// JOB RECORDS
// =============================================================================

/// Persistent, audit-only job lifecycle records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a record unless one with the same id exists.
    ///
    /// Returns `true` when the record was created.
    async fn create(&self, record: &JobRecord) -> Result<bool>;

    /// Get a record by id.
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>>;

    /// Worker picked the job up; `attempt` is 1-based.
    async fn mark_processing(&self, id: Uuid, attempt: i32) -> Result<()>;

    /// Handler succeeded.
    async fn mark_completed(&self, id: Uuid, result: Option<JsonValue>) -> Result<()>;

    /// Handler failed and another attempt is scheduled.
    async fn mark_retrying(&self, id: Uuid, attempts: i32, error: &str) -> Result<()>;

    /// Terminal failure.
    async fn mark_failed(&self, id: Uuid, attempts: i32, error: &str) -> Result<()>;

    /// List records, newest first.
    async fn list_filtered(
        &self,
        status: Option<JobStatus>,
        job_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<JobRecord>>;
}

// =============================================================================
// QUEUE
// =============================================================================

/// Durable priority queue of job envelopes.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add an envelope unless one with the same id exists.
    ///
    /// Returns `true` when the envelope was added.
    async fn push(&self, envelope: &JobEnvelope) -> Result<bool>;

    /// Claim the next runnable envelope of `queue`: lowest priority tier
    /// first, then oldest. The envelope becomes active.
    async fn claim_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<JobEnvelope>>;

    /// Archive an active envelope as completed.
    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Archive an active envelope as failed.
    async fn fail(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Return an active envelope to pending with a new `run_at`.
    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>, attempts: i32) -> Result<()>;

    /// Remove a pending envelope. Active or archived envelopes are untouched.
    async fn cancel(&self, id: Uuid) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<JobEnvelope>>;

    /// Pending envelopes in `queue`, runnable or delayed.
    async fn pending_count(&self, queue: &str) -> Result<i64>;

    /// Counts for one queue, or all queues when `queue` is `None`.
    async fn stats(&self, queue: Option<&str>, now: DateTime<Utc>) -> Result<QueueStats>;

    /// Requeue active envelopes locked before `older_than`, counting the
    /// lost attempt. Returns how many were requeued.
    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Delete archived envelopes outside the retention policy.
    async fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<u64>;
}

// =============================================================================
// DEAD LETTERS
// =============================================================================

/// Write-once store of terminal failures.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert unless an entry for the same origin id exists.
    ///
    /// Returns `true` when this call created the entry.
    async fn insert_once(&self, entry: &DeadLetterEntry) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>>;

    async fn find_by_origin(
        &self,
        origin: DeadLetterOrigin,
        origin_id: Uuid,
    ) -> Result<Option<DeadLetterEntry>>;

    /// Newest first.
    async fn list(&self, origin: Option<DeadLetterOrigin>, limit: i64)
        -> Result<Vec<DeadLetterEntry>>;

    /// Stamp `replayed_at` if the entry was never replayed.
    async fn mark_replayed(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;
}

// =============================================================================
// RECURRING TRIGGERS
// =============================================================================

/// Recurring trigger registrations.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or update by id. An existing trigger keeps its `next_run_at`
    /// unless the cron expression changed. Returns the stored trigger.
    async fn upsert(&self, trigger: &RecurringTrigger) -> Result<RecurringTrigger>;

    async fn get(&self, job_type: &str) -> Result<Option<RecurringTrigger>>;

    async fn list(&self) -> Result<Vec<RecurringTrigger>>;

    /// Enabled triggers with `next_run_at <= now`.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<RecurringTrigger>>;

    /// Compare-and-set `next_run_at` from `expected_next` to `next`.
    ///
    /// Returns `true` for exactly one caller per firing.
    async fn advance(
        &self,
        id: Uuid,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn remove(&self, job_type: &str) -> Result<bool>;
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Notification records. Every status change is checked against
/// [`NotificationStatus::can_transition_to`]; an illegal change is an
/// [`crate::Error::Job`].
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert unless a record with the same id exists.
    async fn insert(&self, record: &NotificationRecord) -> Result<bool>;

    async fn get(&self, id: Uuid) -> Result<Option<NotificationRecord>>;

    /// Lease up to `limit` deliverable records (PENDING or RETRYING,
    /// `scheduled_for <= now`, no live lease), ordered by priority
    /// descending then creation time. Status is not changed.
    async fn claim_due(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>>;

    async fn mark_cancelled(&self, id: Uuid, reason: &str) -> Result<()>;

    /// Hold for a digest.
    async fn mark_queued(&self, id: Uuid, digest: DigestType) -> Result<()>;

    /// Move `scheduled_for` and release the lease. Status is unchanged.
    async fn defer(&self, id: Uuid, until: DateTime<Utc>) -> Result<()>;

    /// Keeps the lease taken by [`NotificationStore::claim_due`].
    async fn mark_sending(&self, id: Uuid) -> Result<()>;

    /// Return SENDING records whose lease is missing or expired at `now` to
    /// RETRYING, due at `now`, with `reason` as the last error. The retry
    /// count is unchanged. Returns the number recovered.
    async fn recover_sending(&self, now: DateTime<Utc>, reason: &str) -> Result<u64>;

    async fn mark_sent(&self, id: Uuid, provider_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn mark_retrying(
        &self,
        id: Uuid,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    async fn mark_failed(
        &self,
        id: Uuid,
        retry_count: i32,
        error: &str,
        dead_letter_id: Option<Uuid>,
    ) -> Result<()>;

    /// QUEUED records of a digest type with `scheduled_for` at or after
    /// `since`.
    async fn list_queued(
        &self,
        digest: DigestType,
        since: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>>;

    /// Mark digest constituents SENT in a single transaction. Only rows still
    /// QUEUED are touched. Returns the number marked.
    async fn mark_digest_sent(
        &self,
        ids: &[Uuid],
        provider_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Push `scheduled_for` of records still QUEUED to `until`, holding them
    /// back from digest runs before then. Returns the number held.
    async fn hold_queued(&self, ids: &[Uuid], until: DateTime<Utc>) -> Result<u64>;

    /// Cancel QUEUED records of a digest type with `scheduled_for` before
    /// `before`.
    async fn expire_queued(
        &self,
        digest: DigestType,
        before: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64>;

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Vec<NotificationRecord>>;
}

/// Per-user delivery preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn for_user(&self, user_id: Uuid) -> Result<Vec<NotificationPreference>>;

    /// Insert or replace the row for (user, notification type, channel).
    async fn set(&self, preference: &NotificationPreference) -> Result<()>;
}

// =============================================================================
// ESCALATIONS
// =============================================================================

/// Escalation records and workflows.
#[async_trait]
pub trait EscalationStore: Send + Sync {
    async fn get(&self, entity: &EntityRef) -> Result<Option<EscalationRecord>>;

    /// Apply a level increase if the stored level and cycle still match the
    /// transition's expectation, inserting `notifications` in the same
    /// transaction. Returns `false` when another run got there first.
    async fn advance(
        &self,
        transition: &EscalationTransition,
        notifications: &[NotificationRecord],
    ) -> Result<bool>;

    /// Explicit de-escalation: level back to 0, new cycle.
    async fn reset(&self, entity: &EntityRef) -> Result<bool>;

    /// Company-specific workflow, if one is configured.
    async fn workflow_for_company(&self, company_id: Uuid) -> Result<Option<EscalationWorkflow>>;

    async fn save_workflow(&self, workflow: &EscalationWorkflow) -> Result<()>;
}

// =============================================================================
// RATE LIMIT COUNTERS
// =============================================================================

/// Snapshot of one windowed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    pub count: u64,
    /// Remaining time until the window resets; zero when the backend has none.
    pub ttl: Duration,
}

/// Backend for windowed counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Current counter, `None` when no window is open.
    async fn read(&self, key: &str) -> Result<Option<CounterState>>;

    /// Atomically increment, opening a `window`-long TTL if none is set.
    /// Returns the new count.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64>;
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Email/SMS/in-app transport.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &RenderedMessage) -> std::result::Result<DeliveryReceipt, JobError>;
}

/// Domain query for entities past their deadline.
#[async_trait]
pub trait OverdueSource: Send + Sync {
    async fn overdue_entities(
        &self,
        company_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OverdueEntity>>;
}

/// Resolves the people behind an escalation level's roles.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn resolve(
        &self,
        entity: &OverdueEntity,
        level: &EscalationLevel,
    ) -> Result<Vec<Recipient>>;
}
