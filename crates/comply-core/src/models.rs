//! Data model for the orchestration core.
//!
//! Job-side types live here; notification, escalation and payload types live
//! in the submodules and are re-exported at the crate root.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

pub mod escalation;
pub mod notification;
pub mod payload;

pub use escalation::*;
pub use notification::*;
pub use payload::JobPayload;

// =============================================================================
// PRIORITY
// =============================================================================

/// Queue priority tier. Lower numeral is served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
    Bulk = 5,
}

impl Priority {
    /// Numeric tier as stored in the queue table.
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// Parse a stored numeric tier.
    pub fn from_i16(value: i16) -> Result<Self> {
        match value {
            1 => Ok(Priority::Critical),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Normal),
            4 => Ok(Priority::Low),
            5 => Ok(Priority::Bulk),
            other => Err(Error::InvalidInput(format!("unknown priority tier {other}"))),
        }
    }
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Every job type the orchestration core knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Periodic overdue scan feeding the escalation engine.
    CheckDeadlines,
    /// Drain pending notification records.
    ProcessNotifications,
    /// Compile and flush daily digests.
    DailyDigest,
    /// Compile and flush weekly digests.
    WeeklyDigest,
    /// Retention pruning and stale-claim recovery.
    CleanupJobs,
    /// OCR/LLM extraction of an uploaded document.
    DocumentExtraction,
    /// PDF/report rendering.
    GenerateReport,
    /// Excel/CSV import.
    ParseSpreadsheet,
    /// Follow-up analysis after extraction.
    PatternDiscovery,
    /// Single deadline reminder.
    SendReminder,
}

impl JobType {
    /// All job types, in declaration order.
    pub const ALL: [JobType; 10] = [
        JobType::CheckDeadlines,
        JobType::ProcessNotifications,
        JobType::DailyDigest,
        JobType::WeeklyDigest,
        JobType::CleanupJobs,
        JobType::DocumentExtraction,
        JobType::GenerateReport,
        JobType::ParseSpreadsheet,
        JobType::PatternDiscovery,
        JobType::SendReminder,
    ];

    /// Wire name, as stored in envelopes and records.
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::CheckDeadlines => "CHECK_DEADLINES",
            JobType::ProcessNotifications => "PROCESS_NOTIFICATIONS",
            JobType::DailyDigest => "DAILY_DIGEST",
            JobType::WeeklyDigest => "WEEKLY_DIGEST",
            JobType::CleanupJobs => "CLEANUP_JOBS",
            JobType::DocumentExtraction => "DOCUMENT_EXTRACTION",
            JobType::GenerateReport => "GENERATE_REPORT",
            JobType::ParseSpreadsheet => "PARSE_SPREADSHEET",
            JobType::PatternDiscovery => "PATTERN_DISCOVERY",
            JobType::SendReminder => "SEND_REMINDER",
        }
    }

    /// Queue this job type is routed to when the caller does not say.
    pub fn default_queue(self) -> &'static str {
        match self {
            JobType::CheckDeadlines => defaults::QUEUE_ESCALATIONS,
            JobType::ProcessNotifications | JobType::DailyDigest | JobType::WeeklyDigest => {
                defaults::QUEUE_NOTIFICATIONS
            }
            JobType::CleanupJobs => defaults::QUEUE_MAINTENANCE,
            JobType::DocumentExtraction
            | JobType::ParseSpreadsheet
            | JobType::PatternDiscovery => defaults::QUEUE_DOCUMENTS,
            JobType::GenerateReport => defaults::QUEUE_REPORTS,
            JobType::SendReminder => defaults::QUEUE_REMINDERS,
        }
    }

    /// Default priority tier for this job type.
    pub fn default_priority(self) -> Priority {
        match self {
            JobType::CheckDeadlines => Priority::High,
            JobType::ProcessNotifications | JobType::SendReminder => Priority::High,
            JobType::DocumentExtraction | JobType::GenerateReport => Priority::Normal,
            JobType::ParseSpreadsheet => Priority::Normal,
            JobType::DailyDigest | JobType::WeeklyDigest => Priority::Low,
            JobType::PatternDiscovery => Priority::Low,
            JobType::CleanupJobs => Priority::Bulk,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|jt| jt.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job type: {s}")))
    }
}

// =============================================================================
// JOB STATUS
// =============================================================================

/// Lifecycle status of a persistent job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    /// Completed and failed records never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

// =============================================================================
// BACKOFF
// =============================================================================

/// Delay policy between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `base_ms * 2^(attempt - 1)`, capped at [`defaults::JOB_BACKOFF_MAX_MS`].
    Exponential { base_ms: u64 },
    /// Same delay every time.
    Fixed { delay_ms: u64 },
    /// Explicit per-attempt delays; the last entry repeats.
    Schedule { delays_ms: Vec<u64> },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base_ms: defaults::JOB_BACKOFF_BASE_MS,
        }
    }
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts have been made.
    pub fn delay_for(&self, attempts_made: i32) -> Duration {
        let n = attempts_made.max(1) as u32;
        let ms = match self {
            Backoff::Exponential { base_ms } => {
                let factor = 2u64.saturating_pow(n - 1);
                base_ms
                    .saturating_mul(factor)
                    .min(defaults::JOB_BACKOFF_MAX_MS)
            }
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Schedule { delays_ms } => {
                let idx = (n as usize - 1).min(delays_ms.len().saturating_sub(1));
                delays_ms.get(idx).copied().unwrap_or(0)
            }
        };
        Duration::from_millis(ms)
    }

    /// Notification retry schedule: 5 minutes, then 30 minutes.
    pub fn notification() -> Self {
        Backoff::Schedule {
            delays_ms: defaults::NOTIFICATION_RETRY_DELAYS_SECS
                .iter()
                .map(|s| s * 1000)
                .collect(),
        }
    }
}

// =============================================================================
// ENVELOPES AND RECORDS
// =============================================================================

/// Where an envelope is in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeState {
    /// Waiting for `run_at` and a free worker slot.
    Pending,
    /// Claimed by a worker.
    Active,
    /// Archived after success.
    Completed,
    /// Archived after terminal failure.
    Failed,
}

impl EnvelopeState {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeState::Pending => "pending",
            EnvelopeState::Active => "active",
            EnvelopeState::Completed => "completed",
            EnvelopeState::Failed => "failed",
        }
    }
}

impl FromStr for EnvelopeState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EnvelopeState::Pending),
            "active" => Ok(EnvelopeState::Active),
            "completed" => Ok(EnvelopeState::Completed),
            "failed" => Ok(EnvelopeState::Failed),
            other => Err(Error::InvalidInput(format!("unknown envelope state: {other}"))),
        }
    }
}

/// Queue-resident unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: Uuid,
    pub queue: String,
    /// Wire name of the job type; parsed at dispatch so an unknown type can be
    /// dead-lettered instead of poisoning the claim.
    pub job_type: String,
    pub payload: JsonValue,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Not claimable before this instant.
    pub run_at: DateTime<Utc>,
    /// Attempts already made.
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff: Backoff,
    pub recurrence_key: Option<String>,
    pub state: EnvelopeState,
    pub locked_at: Option<DateTime<Utc>>,
    /// When the envelope was archived.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    /// Build a pending envelope for a validated payload.
    pub fn new(
        id: Uuid,
        queue: impl Into<String>,
        payload: &JobPayload,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id,
            queue: queue.into(),
            job_type: payload.job_type().as_str().to_string(),
            payload: serde_json::to_value(payload)?,
            priority,
            created_at: now,
            run_at: now,
            attempts: 0,
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            recurrence_key: None,
            state: EnvelopeState::Pending,
            locked_at: None,
            finished_at: None,
        })
    }
}

/// Persistent audit record of a job, independent of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: String,
    pub queue: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub result: Option<JsonValue>,
    /// Dead-letter entry this job was replayed from.
    pub replay_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Fresh PENDING record mirroring an envelope.
    pub fn for_envelope(envelope: &JobEnvelope) -> Self {
        Self {
            id: envelope.id,
            job_type: envelope.job_type.clone(),
            queue: envelope.queue.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: envelope.max_attempts,
            error_message: None,
            result: None,
            replay_of: None,
            created_at: envelope.created_at,
            updated_at: envelope.created_at,
        }
    }
}

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Option<Priority>,
    /// Explicit deterministic id; re-enqueuing the same id is a no-op.
    pub job_id: Option<Uuid>,
    pub delay: Option<Duration>,
    pub attempts: Option<i32>,
    pub backoff: Option<Backoff>,
    pub recurrence_key: Option<String>,
    pub replay_of: Option<Uuid>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_job_id(mut self, id: Uuid) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_recurrence_key(mut self, key: impl Into<String>) -> Self {
        self.recurrence_key = Some(key.into());
        self
    }

    pub fn with_replay_of(mut self, dead_letter_id: Uuid) -> Self {
        self.replay_of = Some(dead_letter_id);
        self
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub active: i64,
    pub completed_last_hour: i64,
    pub failed_last_hour: i64,
    pub total: i64,
}

/// How long archived envelopes are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_max_age_secs: i64,
    pub completed_max_count: i64,
    pub failed_max_age_secs: i64,
    pub failed_max_count: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_max_age_secs: defaults::RETAIN_COMPLETED_SECS,
            completed_max_count: defaults::RETAIN_COMPLETED_COUNT,
            failed_max_age_secs: defaults::RETAIN_FAILED_SECS,
            failed_max_count: defaults::RETAIN_FAILED_COUNT,
        }
    }
}

// =============================================================================
// DEAD LETTERS
// =============================================================================

/// What kind of work a dead-letter entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterOrigin {
    Job,
    Notification,
}

impl DeadLetterOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterOrigin::Job => "job",
            DeadLetterOrigin::Notification => "notification",
        }
    }
}

impl FromStr for DeadLetterOrigin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "job" => Ok(DeadLetterOrigin::Job),
            "notification" => Ok(DeadLetterOrigin::Notification),
            other => Err(Error::InvalidInput(format!("unknown dead-letter origin: {other}"))),
        }
    }
}

/// Terminal failure awaiting manual triage. Write-once per origin id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub origin: DeadLetterOrigin,
    pub origin_id: Uuid,
    /// Job type or notification type.
    pub origin_type: String,
    pub queue: Option<String>,
    pub payload: JsonValue,
    pub error: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// RECURRING TRIGGERS
// =============================================================================

/// Cron-driven registration that injects an envelope each time it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringTrigger {
    /// `recurring_trigger_id(job_type)`.
    pub id: Uuid,
    pub job_type: String,
    pub queue: String,
    pub cron: String,
    pub payload: JsonValue,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering_critical_first() {
        let mut tiers = vec![
            Priority::Bulk,
            Priority::Normal,
            Priority::Critical,
            Priority::Low,
            Priority::High,
        ];
        tiers.sort();
        assert_eq!(
            tiers,
            vec![
                Priority::Critical,
                Priority::High,
                Priority::Normal,
                Priority::Low,
                Priority::Bulk
            ]
        );
    }

    #[test]
    fn test_priority_i16_round_trip_and_reject() {
        assert_eq!(Priority::from_i16(1).unwrap(), Priority::Critical);
        assert_eq!(Priority::Bulk.as_i16(), 5);
        assert!(Priority::from_i16(9).is_err());
    }

    #[test]
    fn test_job_type_parse_wire_name() {
        assert_eq!(
            "CHECK_DEADLINES".parse::<JobType>().unwrap(),
            JobType::CheckDeadlines
        );
        assert!("check_deadlines".parse::<JobType>().is_err());
    }

    #[test]
    fn test_job_type_serde_matches_as_str() {
        for jt in JobType::ALL {
            let json = serde_json::to_value(jt).unwrap();
            assert_eq!(json, JsonValue::String(jt.as_str().to_string()));
        }
    }

    #[test]
    fn test_job_type_default_queues() {
        assert_eq!(JobType::DocumentExtraction.default_queue(), "documents");
        assert_eq!(JobType::DailyDigest.default_queue(), "notifications");
        assert_eq!(JobType::CheckDeadlines.default_queue(), "escalations");
    }

    #[test]
    fn test_exponential_backoff_doubles_from_two_seconds() {
        let b = Backoff::default();
        assert_eq!(b.delay_for(1), Duration::from_secs(2));
        assert_eq!(b.delay_for(2), Duration::from_secs(4));
        assert_eq!(b.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let b = Backoff::Exponential { base_ms: 1_000 };
        assert_eq!(
            b.delay_for(40),
            Duration::from_millis(defaults::JOB_BACKOFF_MAX_MS)
        );
    }

    #[test]
    fn test_notification_backoff_schedule_repeats_last() {
        let b = Backoff::notification();
        assert_eq!(b.delay_for(1), Duration::from_secs(300));
        assert_eq!(b.delay_for(2), Duration::from_secs(1800));
        assert_eq!(b.delay_for(3), Duration::from_secs(1800));
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert_eq!("retrying".parse::<JobStatus>().unwrap(), JobStatus::Retrying);
    }

    #[test]
    fn test_record_for_envelope_starts_pending() {
        let payload = JobPayload::CleanupJobs {};
        let env = JobEnvelope::new(
            Uuid::new_v4(),
            "maintenance",
            &payload,
            Priority::Bulk,
            Utc::now(),
        )
        .unwrap();
        let record = JobRecord::for_envelope(&env);
        assert_eq!(record.id, env.id);
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.job_type, "CLEANUP_JOBS");
        assert_eq!(record.attempts, 0);
    }
}
