//! Structured logging schema and field name constants for comply.
//!
//! All crates use these constants for consistent structured logging fields
//! so log aggregation can query by the same names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention (dead letters) |
//! | WARN  | Recoverable issue, automatic fallback applied (retry, fail-open) |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points (preference, rate-limit deferral, escalation target) |
//! | TRACE | Per-item iteration (claim polls, digest members) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "jobs", "scheduler", "notifications", "escalation", "worker"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "queue", "retry", "rate_limiter", "digest"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim", "enqueue", "dead_letter", "advance"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job type wire name.
pub const JOB_TYPE: &str = "job_type";

/// Queue name.
pub const QUEUE: &str = "queue";

/// Notification UUID.
pub const NOTIFICATION_ID: &str = "notification_id";

/// Escalated entity id.
pub const ENTITY_ID: &str = "entity_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempt number (1-based).
pub const ATTEMPT: &str = "attempt";

/// Retry delay in milliseconds.
pub const DELAY_MS: &str = "delay_ms";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
