//! Centralized default constants for the comply orchestration core.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates and the worker binary reference these constants instead of defining
//! their own magic numbers.

// =============================================================================
// QUEUE NAMES
// =============================================================================

/// Document OCR/LLM extraction and spreadsheet parsing (CPU heavy).
pub const QUEUE_DOCUMENTS: &str = "documents";

/// PDF/report rendering (CPU heavy).
pub const QUEUE_REPORTS: &str = "reports";

/// Notification delivery and digests.
pub const QUEUE_NOTIFICATIONS: &str = "notifications";

/// Deadline reminders.
pub const QUEUE_REMINDERS: &str = "reminders";

/// Overdue checks and escalation runs.
pub const QUEUE_ESCALATIONS: &str = "escalations";

/// Housekeeping (retention pruning, stale-claim recovery).
pub const QUEUE_MAINTENANCE: &str = "maintenance";

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default total attempts per job (first run included).
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Default base delay for exponential job backoff (2s, 4s, 8s, ...).
pub const JOB_BACKOFF_BASE_MS: u64 = 2_000;

/// Upper bound on any single computed backoff delay (1 hour).
pub const JOB_BACKOFF_MAX_MS: u64 = 3_600_000;

/// Default poll interval for an idle worker group in milliseconds.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Default job execution timeout in seconds (5 minutes).
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Active envelopes older than this are considered abandoned by a crashed worker.
pub const JOB_STALE_AFTER_SECS: i64 = 1_800;

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// RETENTION
// =============================================================================

/// Completed envelopes are kept for 24 hours ...
pub const RETAIN_COMPLETED_SECS: i64 = 24 * 3600;

/// ... or the newest 1000, whichever keeps fewer.
pub const RETAIN_COMPLETED_COUNT: i64 = 1_000;

/// Failed envelopes are kept for 30 days (compliance audit tail) ...
pub const RETAIN_FAILED_SECS: i64 = 30 * 24 * 3600;

/// ... or the newest 10000.
pub const RETAIN_FAILED_COUNT: i64 = 10_000;

// =============================================================================
// WORKER GROUPS (concurrency, throughput per second)
// =============================================================================

/// Concurrency for CPU-heavy document processing.
pub const CONCURRENCY_DOCUMENTS: usize = 2;

/// Concurrency for PDF/report rendering.
pub const CONCURRENCY_REPORTS: usize = 2;

/// Concurrency for notification delivery.
pub const CONCURRENCY_NOTIFICATIONS: usize = 10;

/// Concurrency for reminders.
pub const CONCURRENCY_REMINDERS: usize = 10;

/// Concurrency for escalation runs.
pub const CONCURRENCY_ESCALATIONS: usize = 5;

/// Concurrency for maintenance jobs.
pub const CONCURRENCY_MAINTENANCE: usize = 1;

/// Default jobs-per-second ceiling for a worker group.
pub const THROUGHPUT_PER_SEC: u32 = 50;

/// Throughput ceiling for the notification group (protects the email provider).
pub const THROUGHPUT_NOTIFICATIONS_PER_SEC: u32 = 20;

// =============================================================================
// SCHEDULER
// =============================================================================

/// Scheduler tick in milliseconds.
pub const SCHEDULER_TICK_MS: u64 = 1_000;

/// Namespace for deterministic (UUIDv5) recurring trigger and firing ids.
pub const RECURRING_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6a1f_3c2e_9b4d_4e58_a0c7_51d2_8f03_b9e4);

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Maximum delivery retries before a notification is dead-lettered.
pub const NOTIFICATION_MAX_RETRIES: i32 = 3;

/// Retry delays for notifications: 5 minutes, then 30 minutes.
pub const NOTIFICATION_RETRY_DELAYS_SECS: [u64; 2] = [5 * 60, 30 * 60];

/// Records claimed per pipeline batch.
pub const NOTIFICATION_BATCH_SIZE: i64 = 100;

/// Claim lease so a crashed pipeline run does not strand records.
pub const NOTIFICATION_LEASE_SECS: i64 = 300;

/// SMS body limit in characters.
pub const SMS_MAX_CHARS: usize = 160;

/// Daily digest window.
pub const DIGEST_DAILY_WINDOW_SECS: i64 = 24 * 3600;

/// Weekly digest window.
pub const DIGEST_WEEKLY_WINDOW_SECS: i64 = 7 * 24 * 3600;

/// Namespace for deterministic escalation notification ids.
pub const ESCALATION_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x0d4e_7a91_5c36_4b2f_8e10_c3a9_47f6_2d85);

// =============================================================================
// RATE LIMITS (per hour)
// =============================================================================

/// Rate-limit window length in seconds.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 3_600;

/// Wait applied to a denied send when the backend reports no reset time.
pub const RATE_LIMIT_DEFER_SECS: u64 = 60;

/// Email sends per user per hour.
pub const EMAIL_LIMIT_USER: u64 = 100;

/// Email sends per company per hour.
pub const EMAIL_LIMIT_COMPANY: u64 = 500;

/// Email sends globally per hour.
pub const EMAIL_LIMIT_GLOBAL: u64 = 10_000;

/// SMS sends per user per hour.
pub const SMS_LIMIT_USER: u64 = 10;

/// SMS sends per company per hour.
pub const SMS_LIMIT_COMPANY: u64 = 50;

/// SMS sends globally per hour.
pub const SMS_LIMIT_GLOBAL: u64 = 1_000;

// =============================================================================
// INFRASTRUCTURE
// =============================================================================

/// Default database URL.
pub const DATABASE_URL: &str = "postgres://localhost/comply";

/// Default Redis URL.
pub const REDIS_URL: &str = "redis://localhost:6379";

/// Redis key prefix for rate-limit counters.
pub const RATE_LIMIT_KEY_PREFIX: &str = "comply:ratelimit:";

/// Notification gateway request timeout in seconds.
pub const GATEWAY_TIMEOUT_SECS: u64 = 10;
