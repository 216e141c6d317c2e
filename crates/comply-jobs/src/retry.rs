//! Failure classification, backoff and dead-lettering.
//!
//! Both job envelopes and notification records go through the same
//! classifier. A failure is retried while it is retryable and the attempt
//! budget lasts; otherwise exactly one dead-letter entry is written per
//! origin id, however many times the failure path is re-entered.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::RegexSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

use comply_core::defaults::NOTIFICATION_MAX_RETRIES;
use comply_core::{
    new_v7, Backoff, DeadLetterEntry, DeadLetterOrigin, DeadLetterStore, JobEnvelope, JobError,
    JobQueue, JobStore, NotificationRecord, NotificationStore, Result,
};

/// What to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Terminal,
}

/// Message patterns of `JobError::Other` that are known to be permanent.
static TERMINAL_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\binvalid\b",
        r"(?i)\bmalformed\b",
        r"(?i)\bnot found\b",
        r"(?i)\bunauthori[sz]ed\b",
        r"(?i)\bforbidden\b",
        r"(?i)permission denied",
        r"(?i)\bunsupported\b",
    ])
    .expect("terminal patterns compile")
});

/// Message patterns of `JobError::Other` that are known to be transient.
/// Checked before the terminal set.
static RETRYABLE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)timed? ?out",
        r"(?i)connection (refused|reset|closed|aborted)",
        r"(?i)temporar(y|ily)",
        r"(?i)unavailable",
        r"(?i)too many requests",
        r"(?i)deadlock",
        r"(?i)try again",
        r"(?i)pool (timed out|exhausted)",
    ])
    .expect("retryable patterns compile")
});

/// Explicit allow/deny classification of [`JobError`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, err: &JobError) -> Disposition {
        match err {
            JobError::Timeout(_)
            | JobError::Network(_)
            | JobError::RateLimited(_)
            | JobError::Panicked(_) => Disposition::Retry,
            JobError::InvalidPayload(_)
            | JobError::InvalidRecipient(_)
            | JobError::UnsupportedJobType(_)
            | JobError::Rejected(_) => Disposition::Terminal,
            JobError::Http { status, .. } => match status {
                408 | 429 | 500 | 502 | 503 | 504 => Disposition::Retry,
                400..=499 => Disposition::Terminal,
                _ => Disposition::Retry,
            },
            JobError::Other(message) => {
                if RETRYABLE_PATTERNS.is_match(message) {
                    Disposition::Retry
                } else if TERMINAL_PATTERNS.is_match(message) {
                    Disposition::Terminal
                } else {
                    // Unknown messages are retried.
                    Disposition::Retry
                }
            }
        }
    }

    pub fn is_retryable(&self, err: &JobError) -> bool {
        self.classify(err) == Disposition::Retry
    }
}

/// Result of handling one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Another attempt is scheduled.
    Retrying {
        /// Attempts made so far.
        attempts: i32,
        delay: Duration,
        run_at: DateTime<Utc>,
    },
    /// Terminal. `created` is false when another caller wrote the entry.
    DeadLettered { dead_letter_id: Uuid, created: bool },
}

/// Applies the retry policy to failed jobs and notifications.
#[derive(Clone)]
pub struct RetryEngine {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    dead_letters: Arc<dyn DeadLetterStore>,
    notifications: Arc<dyn NotificationStore>,
    classifier: ErrorClassifier,
}

impl RetryEngine {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        dead_letters: Arc<dyn DeadLetterStore>,
        notifications: Arc<dyn NotificationStore>,
    ) -> Self {
        Self {
            jobs,
            queue,
            dead_letters,
            notifications,
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Handle a failed run of an active envelope.
    ///
    /// `attempt` is the 1-based number of the run that just failed.
    pub async fn handle_job_failure(
        &self,
        envelope: &JobEnvelope,
        attempt: i32,
        err: &JobError,
    ) -> Result<RetryOutcome> {
        let message = err.to_string();
        if self.classifier.is_retryable(err) && attempt < envelope.max_attempts {
            let delay = envelope.backoff.delay_for(attempt);
            let run_at = Utc::now() + to_chrono(delay);
            self.queue.reschedule(envelope.id, run_at, attempt).await?;
            self.jobs.mark_retrying(envelope.id, attempt, &message).await?;
            warn!(
                subsystem = "jobs",
                component = "retry",
                job_id = %envelope.id,
                job_type = %envelope.job_type,
                attempt,
                max_attempts = envelope.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Job failed, retry scheduled"
            );
            return Ok(RetryOutcome::Retrying {
                attempts: attempt,
                delay,
                run_at,
            });
        }

        self.dead_letter_job(envelope, attempt, err).await
    }

    /// Dead-letter an envelope, mark its record FAILED and archive it.
    ///
    /// Safe to call more than once for the same envelope.
    pub async fn dead_letter_job(
        &self,
        envelope: &JobEnvelope,
        attempts: i32,
        err: &JobError,
    ) -> Result<RetryOutcome> {
        let message = err.to_string();
        let now = Utc::now();
        let entry = DeadLetterEntry {
            id: new_v7(),
            origin: DeadLetterOrigin::Job,
            origin_id: envelope.id,
            origin_type: envelope.job_type.clone(),
            queue: Some(envelope.queue.clone()),
            payload: envelope.payload.clone(),
            error: message.clone(),
            retry_count: attempts,
            created_at: now,
            replayed_at: None,
        };
        let (dead_letter_id, created) = self.insert_once(&entry).await?;

        self.jobs.mark_failed(envelope.id, attempts, &message).await?;
        if let Err(e) = self.queue.fail(envelope.id, now).await {
            debug!(
                subsystem = "jobs",
                component = "retry",
                job_id = %envelope.id,
                error = %e,
                "Envelope already archived"
            );
        }

        if created {
            error!(
                subsystem = "jobs",
                component = "retry",
                op = "dead_letter",
                job_id = %envelope.id,
                job_type = %envelope.job_type,
                queue = %envelope.queue,
                attempts,
                dead_letter_id = %dead_letter_id,
                error = %message,
                "Job dead-lettered"
            );
        }
        Ok(RetryOutcome::DeadLettered {
            dead_letter_id,
            created,
        })
    }

    /// Handle a failed send of a notification that is currently SENDING.
    pub async fn handle_notification_failure(
        &self,
        record: &NotificationRecord,
        err: &JobError,
    ) -> Result<RetryOutcome> {
        let message = err.to_string();
        let retries = record.delivery.retry_count;

        if self.classifier.is_retryable(err) && retries < NOTIFICATION_MAX_RETRIES {
            let next = retries + 1;
            let delay = Backoff::notification().delay_for(next);
            let run_at = Utc::now() + to_chrono(delay);
            self.notifications
                .mark_retrying(record.id, next, run_at, &message)
                .await?;
            warn!(
                subsystem = "notifications",
                component = "retry",
                notification_id = %record.id,
                channel = %record.channel,
                retry = next,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Notification send failed, retry scheduled"
            );
            return Ok(RetryOutcome::Retrying {
                attempts: next,
                delay,
                run_at,
            });
        }

        let entry = DeadLetterEntry {
            id: new_v7(),
            origin: DeadLetterOrigin::Notification,
            origin_id: record.id,
            origin_type: record.notification_type.clone(),
            queue: None,
            payload: serde_json::to_value(record)?,
            error: message.clone(),
            retry_count: retries,
            created_at: Utc::now(),
            replayed_at: None,
        };
        let (dead_letter_id, created) = self.insert_once(&entry).await?;
        self.notifications
            .mark_failed(record.id, retries, &message, Some(dead_letter_id))
            .await?;

        error!(
            subsystem = "notifications",
            component = "retry",
            op = "dead_letter",
            notification_id = %record.id,
            channel = %record.channel,
            retries,
            dead_letter_id = %dead_letter_id,
            error = %message,
            "Notification dead-lettered"
        );
        Ok(RetryOutcome::DeadLettered {
            dead_letter_id,
            created,
        })
    }

    /// Insert the entry unless its origin already has one; returns the id of
    /// the entry that is stored.
    async fn insert_once(&self, entry: &DeadLetterEntry) -> Result<(Uuid, bool)> {
        if self.dead_letters.insert_once(entry).await? {
            return Ok((entry.id, true));
        }
        let existing = self
            .dead_letters
            .find_by_origin(entry.origin, entry.origin_id)
            .await?
            .map(|e| e.id)
            .unwrap_or(entry.id);
        Ok((existing, false))
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use comply_core::{
        Channel, DeadLetterStore, JobPayload, JobRecord, JobStatus, NotificationStatus, Priority,
        Recipient,
    };
    use comply_db::MemoryStore;

    fn engine(store: &MemoryStore) -> RetryEngine {
        RetryEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        )
    }

    async fn claimed_envelope(store: &MemoryStore, max_attempts: i32) -> JobEnvelope {
        let mut env = JobEnvelope::new(
            new_v7(),
            "maintenance",
            &JobPayload::CleanupJobs {},
            Priority::Normal,
            Utc::now(),
        )
        .unwrap();
        env.max_attempts = max_attempts;
        env.backoff = Backoff::Fixed { delay_ms: 10 };
        JobStore::create(store, &JobRecord::for_envelope(&env))
            .await
            .unwrap();
        store.push(&env).await.unwrap();
        store
            .claim_next("maintenance", Utc::now())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_classify_explicit_variants() {
        let c = ErrorClassifier::new();
        assert_eq!(c.classify(&JobError::Timeout("t".into())), Disposition::Retry);
        assert_eq!(c.classify(&JobError::Network("n".into())), Disposition::Retry);
        assert_eq!(c.classify(&JobError::Panicked("p".into())), Disposition::Retry);
        assert_eq!(
            c.classify(&JobError::InvalidRecipient("r".into())),
            Disposition::Terminal
        );
        assert_eq!(
            c.classify(&JobError::UnsupportedJobType("X".into())),
            Disposition::Terminal
        );
    }

    #[test]
    fn test_classify_http_status() {
        let c = ErrorClassifier::new();
        let http = |status| JobError::Http {
            status,
            message: String::new(),
        };
        for status in [408, 429, 500, 502, 503, 504, 507] {
            assert!(c.is_retryable(&http(status)), "{status} should retry");
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!c.is_retryable(&http(status)), "{status} should be terminal");
        }
    }

    #[test]
    fn test_classify_other_by_message() {
        let c = ErrorClassifier::new();
        assert!(!c.is_retryable(&JobError::Other("Invalid document header".into())));
        assert!(!c.is_retryable(&JobError::Other("report template not found".into())));
        assert!(c.is_retryable(&JobError::Other("connection reset by peer".into())));
        // A transient cause outranks a permanent-sounding detail.
        assert!(c.is_retryable(&JobError::Other(
            "upstream temporarily unavailable: invalid response".into()
        )));
        assert!(!c.is_retryable(&JobError::Other("permission denied for relation report".into())));
        // Unknown messages default to retryable.
        assert!(c.is_retryable(&JobError::Other("something odd".into())));
    }

    #[tokio::test]
    async fn test_retryable_failure_reschedules() {
        let store = MemoryStore::new();
        let env = claimed_envelope(&store, 3).await;

        let outcome = engine(&store)
            .handle_job_failure(&env, 1, &JobError::Network("refused".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, RetryOutcome::Retrying { attempts: 1, .. }));

        let stored = JobQueue::get(&store, env.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.state, comply_core::EnvelopeState::Pending);
        let record = JobStore::get(&store, env.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Retrying);
        assert!(DeadLetterStore::list(&store, None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_failure_dead_letters_immediately() {
        let store = MemoryStore::new();
        let env = claimed_envelope(&store, 3).await;

        let outcome = engine(&store)
            .handle_job_failure(&env, 1, &JobError::InvalidPayload("bad".into()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RetryOutcome::DeadLettered { created: true, .. }
        ));
        let record = JobStore::get(&store, env.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter_once_under_reentry() {
        let store = MemoryStore::new();
        let env = claimed_envelope(&store, 1).await;
        let engine = engine(&store);
        let err = JobError::Timeout("slow".into());

        let (a, b) = tokio::join!(
            engine.handle_job_failure(&env, 1, &err),
            engine.handle_job_failure(&env, 1, &err)
        );
        let ids: Vec<Uuid> = [a.unwrap(), b.unwrap()]
            .into_iter()
            .map(|o| match o {
                RetryOutcome::DeadLettered { dead_letter_id, .. } => dead_letter_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(DeadLetterStore::list(&store, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notification_retries_then_dead_letters_with_count() {
        let store = MemoryStore::new();
        let engine = engine(&store);
        let n = NotificationRecord::new(
            Recipient::user(new_v7()).with_address("ops@example.com"),
            "deadline_reminder",
            Channel::Email,
            "s",
            "b",
        );
        NotificationStore::insert(&store, &n).await.unwrap();
        let err = JobError::Http {
            status: 503,
            message: "down".into(),
        };

        for expected in 1..=3 {
            store.mark_sending(n.id).await.unwrap();
            let current = NotificationStore::get(&store, n.id).await.unwrap().unwrap();
            let outcome = engine
                .handle_notification_failure(&current, &err)
                .await
                .unwrap();
            assert!(matches!(outcome, RetryOutcome::Retrying { attempts, .. } if attempts == expected));
        }

        store.mark_sending(n.id).await.unwrap();
        let current = NotificationStore::get(&store, n.id).await.unwrap().unwrap();
        let outcome = engine
            .handle_notification_failure(&current, &err)
            .await
            .unwrap();
        assert!(matches!(outcome, RetryOutcome::DeadLettered { .. }));

        let stored = NotificationStore::get(&store, n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        let entry = DeadLetterStore::find_by_origin(&store, DeadLetterOrigin::Notification, n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.retry_count, 3);
        assert_eq!(stored.delivery.dead_letter_id, Some(entry.id));
    }

    #[tokio::test]
    async fn test_notification_retry_delays_follow_schedule() {
        let store = MemoryStore::new();
        let n = NotificationRecord::new(Recipient::user(new_v7()), "t", Channel::InApp, "s", "b");
        NotificationStore::insert(&store, &n).await.unwrap();
        store.mark_sending(n.id).await.unwrap();

        let outcome = engine(&store)
            .handle_notification_failure(&n, &JobError::Timeout("t".into()))
            .await
            .unwrap();
        match outcome {
            RetryOutcome::Retrying { delay, .. } => assert_eq!(delay, Duration::from_secs(300)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
