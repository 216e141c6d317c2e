//! Digest compilation.
//!
//! Every QUEUED record of a digest type inside the window is grouped by
//! (recipient, channel) and sent as one compiled message. Constituents are
//! marked SENT in one transaction after the send succeeds; if the send fails
//! they stay QUEUED for the next run.
//!
//! The window is anchored on `scheduled_for`. A rate-limited group is held by
//! moving its members' `scheduled_for` to when the limit resets, so later
//! runs skip it until then and the window restarts from the hold.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use comply_core::defaults::RATE_LIMIT_DEFER_SECS;
use comply_core::{Channel, DigestType, NotificationRecord, NotificationStore, Result};

use super::provider::ProviderSet;
use super::render::render_digest;
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DigestSummary {
    /// (recipient, channel) groups found.
    pub groups: usize,
    pub groups_sent: usize,
    /// Groups held until their rate limit resets.
    pub groups_held: usize,
    /// Groups left QUEUED because rendering or the send failed.
    pub groups_failed: usize,
    pub notifications_sent: u64,
    /// QUEUED records cancelled for falling out of the window.
    pub expired: u64,
}

#[derive(Clone)]
pub struct DigestBatcher {
    notifications: Arc<dyn NotificationStore>,
    rate_limiter: RateLimiter,
    providers: ProviderSet,
}

impl DigestBatcher {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        rate_limiter: RateLimiter,
        providers: ProviderSet,
    ) -> Self {
        Self {
            notifications,
            rate_limiter,
            providers,
        }
    }

    #[instrument(skip(self), fields(digest = digest.as_str()))]
    pub async fn run(&self, digest: DigestType, now: DateTime<Utc>) -> Result<DigestSummary> {
        let since = now - digest.window();
        let mut summary = DigestSummary {
            expired: self
                .notifications
                .expire_queued(digest, since, "digest window elapsed")
                .await?,
            ..Default::default()
        };

        let mut groups: HashMap<(Uuid, Channel), Vec<NotificationRecord>> = HashMap::new();
        for record in self.notifications.list_queued(digest, since).await? {
            if record.scheduled_for > now {
                continue;
            }
            groups
                .entry((record.recipient.user_id, record.channel))
                .or_default()
                .push(record);
        }
        summary.groups = groups.len();

        for ((user_id, channel), members) in groups {
            let Some(recipient) = members.first().map(|m| m.recipient.clone()) else {
                continue;
            };

            let decision = self
                .rate_limiter
                .check_all(user_id, recipient.company_id, channel)
                .await;
            if !decision.allowed {
                let wait = decision
                    .retry_after
                    .unwrap_or(std::time::Duration::from_secs(RATE_LIMIT_DEFER_SECS));
                let until = now + chrono::Duration::milliseconds(wait.as_millis() as i64);
                let ids: Vec<Uuid> = members.iter().map(|m| m.id).collect();
                self.notifications.hold_queued(&ids, until).await?;
                summary.groups_held += 1;
                debug!(
                    subsystem = "notifications",
                    component = "digest",
                    user_id = %user_id,
                    channel = %channel,
                    members = members.len(),
                    until = %until,
                    "Digest rate limited, held"
                );
                continue;
            }

            let sent = match render_digest(digest, channel, &recipient, &members) {
                Ok(message) => self.providers.send(&message).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(receipt) => {
                    let ids: Vec<Uuid> = members.iter().map(|m| m.id).collect();
                    let marked = self
                        .notifications
                        .mark_digest_sent(&ids, &receipt.provider_id, Utc::now())
                        .await?;
                    self.rate_limiter
                        .record_all(user_id, recipient.company_id, channel)
                        .await;
                    summary.groups_sent += 1;
                    summary.notifications_sent += marked;
                }
                Err(e) => {
                    summary.groups_failed += 1;
                    warn!(
                        subsystem = "notifications",
                        component = "digest",
                        user_id = %user_id,
                        channel = %channel,
                        members = members.len(),
                        error = %e,
                        "Digest send failed, members stay queued"
                    );
                }
            }
        }

        info!(
            subsystem = "notifications",
            component = "digest",
            groups = summary.groups,
            sent = summary.groups_sent,
            held = summary.groups_held,
            failed = summary.groups_failed,
            expired = summary.expired,
            "Digest run finished"
        );
        Ok(summary)
    }
}
