//! Delivery of pending notification records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use comply_core::defaults::{NOTIFICATION_LEASE_SECS, RATE_LIMIT_DEFER_SECS};
use comply_core::{
    DigestType, Frequency, JobError, NotificationPriority, NotificationRecord,
    NotificationStatus, NotificationStore, PreferenceStore, Result,
};

use super::preferences::resolve_frequency;
use super::provider::ProviderSet;
use super::render::render;
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryEngine, RetryOutcome};

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Held for a digest.
    Queued(DigestType),
    Cancelled,
    /// Rate limited; will be picked up again at this time.
    Deferred(DateTime<Utc>),
    Retrying,
    Failed,
}

/// Per-batch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// SENDING records whose lease had expired, returned to RETRYING.
    pub recovered: u64,
    pub claimed: usize,
    pub sent: usize,
    pub queued: usize,
    pub cancelled: usize,
    pub deferred: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Records whose processing hit a store error.
    pub errors: usize,
}

impl BatchSummary {
    fn count(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::Queued(_) => self.queued += 1,
            DeliveryOutcome::Cancelled => self.cancelled += 1,
            DeliveryOutcome::Deferred(_) => self.deferred += 1,
            DeliveryOutcome::Retrying => self.retrying += 1,
            DeliveryOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Clone)]
pub struct NotificationPipeline {
    notifications: Arc<dyn NotificationStore>,
    preferences: Arc<dyn PreferenceStore>,
    rate_limiter: RateLimiter,
    providers: ProviderSet,
    retry: RetryEngine,
}

impl NotificationPipeline {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        preferences: Arc<dyn PreferenceStore>,
        rate_limiter: RateLimiter,
        providers: ProviderSet,
        retry: RetryEngine,
    ) -> Self {
        Self {
            notifications,
            preferences,
            rate_limiter,
            providers,
            retry,
        }
    }

    /// Claim up to `limit` due records and push each one forward.
    ///
    /// Records left SENDING by a run that died mid-send are first returned
    /// to RETRYING once their lease has expired, so delivery is at least
    /// once. A failing record is counted and skipped; it never aborts the
    /// batch. Records not started before the lease ends are left for the
    /// next run.
    #[instrument(skip(self))]
    pub async fn process_batch(&self, limit: i64) -> Result<BatchSummary> {
        let now = Utc::now();
        let recovered = self
            .notifications
            .recover_sending(now, "delivery lease expired while sending")
            .await?;
        if recovered > 0 {
            warn!(
                subsystem = "notifications",
                component = "pipeline",
                recovered,
                "Recovered notifications stuck in SENDING"
            );
        }

        let lease_until = now + chrono::Duration::seconds(NOTIFICATION_LEASE_SECS);
        let batch = self
            .notifications
            .claim_due(limit, now, lease_until)
            .await?;

        let mut summary = BatchSummary {
            recovered,
            claimed: batch.len(),
            ..Default::default()
        };
        for record in batch {
            if Utc::now() >= lease_until {
                debug!(
                    subsystem = "notifications",
                    component = "pipeline",
                    notification_id = %record.id,
                    "Lease ended before processing, left for the next run"
                );
                continue;
            }
            match self.process_one(&record).await {
                Ok(outcome) => summary.count(&outcome),
                Err(e) => {
                    summary.errors += 1;
                    warn!(
                        subsystem = "notifications",
                        component = "pipeline",
                        notification_id = %record.id,
                        error = %e,
                        "Notification processing failed"
                    );
                }
            }
        }

        if summary.claimed > 0 {
            info!(
                subsystem = "notifications",
                component = "pipeline",
                recovered = summary.recovered,
                claimed = summary.claimed,
                sent = summary.sent,
                queued = summary.queued,
                deferred = summary.deferred,
                retrying = summary.retrying,
                failed = summary.failed,
                errors = summary.errors,
                "Notification batch processed"
            );
        }
        Ok(summary)
    }

    /// Run one deliverable record through preferences, limits and its provider.
    pub async fn process_one(&self, record: &NotificationRecord) -> Result<DeliveryOutcome> {
        let user_id = record.recipient.user_id;
        let preferences = self.preferences.for_user(user_id).await?;
        let frequency = resolve_frequency(&preferences, &record.notification_type, record.channel);

        let digest = match frequency {
            Frequency::Disabled => {
                self.notifications
                    .mark_cancelled(record.id, "disabled by user preference")
                    .await?;
                debug!(notification_id = %record.id, "Notification disabled by preference");
                return Ok(DeliveryOutcome::Cancelled);
            }
            Frequency::DailyDigest => Some(DigestType::Daily),
            Frequency::WeeklyDigest => Some(DigestType::Weekly),
            Frequency::Immediate => None,
        };
        // Urgent records and retries are never held back for a digest.
        if let Some(digest) = digest {
            if record.priority < NotificationPriority::Urgent
                && record.status == NotificationStatus::Pending
            {
                self.notifications.mark_queued(record.id, digest).await?;
                debug!(
                    notification_id = %record.id,
                    digest = digest.as_str(),
                    "Notification held for digest"
                );
                return Ok(DeliveryOutcome::Queued(digest));
            }
        }

        let company_id = record.recipient.company_id;
        let decision = self
            .rate_limiter
            .check_all(user_id, company_id, record.channel)
            .await;
        if !decision.allowed {
            let wait = decision
                .retry_after
                .unwrap_or(std::time::Duration::from_secs(RATE_LIMIT_DEFER_SECS));
            let until = Utc::now() + chrono::Duration::milliseconds(wait.as_millis() as i64);
            self.notifications.defer(record.id, until).await?;
            debug!(
                notification_id = %record.id,
                channel = %record.channel,
                until = %until,
                "Notification rate limited, deferred"
            );
            return Ok(DeliveryOutcome::Deferred(until));
        }

        self.notifications.mark_sending(record.id).await?;
        let sending = NotificationRecord {
            status: NotificationStatus::Sending,
            ..record.clone()
        };

        let delivery = match render(&sending) {
            Ok(message) => self.providers.send(&message).await,
            Err(e) => Err(e),
        };

        match delivery {
            Ok(receipt) => {
                self.notifications
                    .mark_sent(record.id, &receipt.provider_id, Utc::now())
                    .await?;
                self.rate_limiter
                    .record_all(user_id, company_id, record.channel)
                    .await;
                debug!(
                    notification_id = %record.id,
                    channel = %record.channel,
                    provider_id = %receipt.provider_id,
                    "Notification sent"
                );
                Ok(DeliveryOutcome::Sent)
            }
            Err(err) => self.fail(&sending, &err).await,
        }
    }

    async fn fail(&self, record: &NotificationRecord, err: &JobError) -> Result<DeliveryOutcome> {
        match self.retry.handle_notification_failure(record, err).await? {
            RetryOutcome::Retrying { .. } => Ok(DeliveryOutcome::Retrying),
            RetryOutcome::DeadLettered { .. } => Ok(DeliveryOutcome::Failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::provider::InAppProvider;
    use crate::stores::Stores;
    use async_trait::async_trait;
    use comply_core::{
        Channel, DeliveryReceipt, NotificationPreference, NotificationProvider, Recipient,
        RenderedMessage,
    };
    use comply_db::{MemoryRateLimitStore, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Fails with a 503 until `fail_times` calls have been made.
    struct FlakyProvider {
        calls: AtomicUsize,
        fail_times: usize,
    }

    #[async_trait]
    impl NotificationProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _m: &RenderedMessage) -> std::result::Result<DeliveryReceipt, JobError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(JobError::Http {
                    status: 503,
                    message: "unavailable".into(),
                })
            } else {
                Ok(DeliveryReceipt {
                    provider_id: format!("msg-{n}"),
                })
            }
        }
    }

    fn pipeline(store: &MemoryStore, email: Arc<dyn NotificationProvider>) -> NotificationPipeline {
        let stores = Stores::from_memory(store.clone(), MemoryRateLimitStore::new());
        NotificationPipeline::new(
            stores.notifications.clone(),
            stores.preferences.clone(),
            RateLimiter::new(stores.rate_limits.clone()),
            ProviderSet::new()
                .with(Channel::Email, email)
                .with(Channel::InApp, Arc::new(InAppProvider)),
            RetryEngine::new(
                stores.jobs.clone(),
                stores.queue.clone(),
                stores.dead_letters.clone(),
                stores.notifications.clone(),
            ),
        )
    }

    fn email(user: Uuid) -> NotificationRecord {
        NotificationRecord::new(
            Recipient::user(user).with_address("ops@example.com"),
            "deadline_reminder",
            Channel::Email,
            "Due soon",
            "Permit renewal is due",
        )
    }

    #[tokio::test]
    async fn test_immediate_send_marks_sent() {
        let store = MemoryStore::new();
        let p = pipeline(
            &store,
            Arc::new(FlakyProvider {
                calls: AtomicUsize::new(0),
                fail_times: 0,
            }),
        );
        let n = email(Uuid::new_v4());
        NotificationStore::insert(&store, &n).await.unwrap();

        let summary = p.process_batch(10).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.sent, 1);

        let stored = NotificationStore::get(&store, n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert_eq!(stored.delivery.provider_id.as_deref(), Some("msg-0"));
    }

    #[tokio::test]
    async fn test_disabled_preference_cancels() {
        let store = MemoryStore::new();
        let p = pipeline(&store, Arc::new(InAppProvider));
        let user = Uuid::new_v4();
        store
            .set(&NotificationPreference {
                user_id: user,
                notification_type: "*".into(),
                channel: Channel::Email,
                frequency: Frequency::Disabled,
            })
            .await
            .unwrap();
        let n = email(user);
        NotificationStore::insert(&store, &n).await.unwrap();

        assert_eq!(p.process_one(&n).await.unwrap(), DeliveryOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_digest_preference_queues_unless_urgent() {
        let store = MemoryStore::new();
        let p = pipeline(&store, Arc::new(InAppProvider));
        let user = Uuid::new_v4();
        store
            .set(&NotificationPreference {
                user_id: user,
                notification_type: "deadline_reminder".into(),
                channel: Channel::Email,
                frequency: Frequency::DailyDigest,
            })
            .await
            .unwrap();

        let normal = email(user);
        let urgent = email(user).with_priority(NotificationPriority::Urgent);
        NotificationStore::insert(&store, &normal).await.unwrap();
        NotificationStore::insert(&store, &urgent).await.unwrap();

        assert_eq!(
            p.process_one(&normal).await.unwrap(),
            DeliveryOutcome::Queued(DigestType::Daily)
        );
        assert_eq!(p.process_one(&urgent).await.unwrap(), DeliveryOutcome::Sent);
    }

    #[tokio::test]
    async fn test_invalid_recipient_dead_letters_without_retry() {
        let store = MemoryStore::new();
        let p = pipeline(&store, Arc::new(InAppProvider));
        let n = NotificationRecord::new(
            Recipient::user(Uuid::new_v4()).with_address("nobody"),
            "deadline_reminder",
            Channel::Email,
            "s",
            "b",
        );
        NotificationStore::insert(&store, &n).await.unwrap();

        assert_eq!(p.process_one(&n).await.unwrap(), DeliveryOutcome::Failed);
        let stored = NotificationStore::get(&store, n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.delivery.retry_count, 0);
        assert!(stored.delivery.dead_letter_id.is_some());
    }

    #[tokio::test]
    async fn test_bad_record_does_not_abort_batch() {
        let store = MemoryStore::new();
        let p = pipeline(
            &store,
            Arc::new(FlakyProvider {
                calls: AtomicUsize::new(0),
                fail_times: 1,
            }),
        );
        let first = email(Uuid::new_v4());
        let second = email(Uuid::new_v4());
        NotificationStore::insert(&store, &first).await.unwrap();
        NotificationStore::insert(&store, &second).await.unwrap();

        let summary = p.process_batch(10).await.unwrap();
        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.retrying, 1);
        assert_eq!(summary.sent, 1);
    }

    #[tokio::test]
    async fn test_record_stuck_sending_without_lease_is_resent() {
        let store = MemoryStore::new();
        let p = pipeline(
            &store,
            Arc::new(FlakyProvider {
                calls: AtomicUsize::new(0),
                fail_times: 0,
            }),
        );
        let n = email(Uuid::new_v4());
        NotificationStore::insert(&store, &n).await.unwrap();
        store.mark_sending(n.id).await.unwrap();

        let summary = p.process_batch(10).await.unwrap();
        assert_eq!(summary.recovered, 1);
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.sent, 1);
        let stored = NotificationStore::get(&store, n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
    }
}
