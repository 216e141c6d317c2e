//! Notification records, preferences and rendered messages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    InApp,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::InApp => "IN_APP",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EMAIL" => Ok(Channel::Email),
            "SMS" => Ok(Channel::Sms),
            "IN_APP" => Ok(Channel::InApp),
            other => Err(Error::InvalidInput(format!("unknown channel: {other}"))),
        }
    }
}

/// Notification urgency. Batches drain the highest rank first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
    Critical = 5,
}

impl NotificationPriority {
    pub fn rank(self) -> i16 {
        self as i16
    }

    pub fn from_rank(rank: i16) -> Result<Self> {
        match rank {
            1 => Ok(NotificationPriority::Low),
            2 => Ok(NotificationPriority::Normal),
            3 => Ok(NotificationPriority::High),
            4 => Ok(NotificationPriority::Urgent),
            5 => Ok(NotificationPriority::Critical),
            other => Err(Error::InvalidInput(format!(
                "unknown notification priority {other}"
            ))),
        }
    }
}

/// Delivery status of a notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    /// Held for a digest.
    Queued,
    Sending,
    Sent,
    Retrying,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 7] = [
        NotificationStatus::Pending,
        NotificationStatus::Queued,
        NotificationStatus::Sending,
        NotificationStatus::Sent,
        NotificationStatus::Retrying,
        NotificationStatus::Failed,
        NotificationStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Queued => "QUEUED",
            NotificationStatus::Sending => "SENDING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Retrying => "RETRYING",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::Cancelled => "CANCELLED",
        }
    }

    /// Allowed status edges. Everything moves forward except the
    /// RETRYING → SENDING loop.
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Sending)
                | (Pending, Cancelled)
                | (Queued, Sent)
                | (Queued, Cancelled)
                | (Sending, Sent)
                | (Sending, Retrying)
                | (Sending, Failed)
                | (Retrying, Sending)
                | (Retrying, Cancelled)
        )
    }

    /// Statuses from which `self` may be entered.
    pub fn predecessors(self) -> Vec<NotificationStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(self))
            .collect()
    }

    /// Statuses the pipeline picks up.
    pub fn is_deliverable(self) -> bool {
        matches!(self, NotificationStatus::Pending | NotificationStatus::Retrying)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotificationStatus::Sent | NotificationStatus::Failed | NotificationStatus::Cancelled
        )
    }
}

impl FromStr for NotificationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(NotificationStatus::Pending),
            "QUEUED" => Ok(NotificationStatus::Queued),
            "SENDING" => Ok(NotificationStatus::Sending),
            "SENT" => Ok(NotificationStatus::Sent),
            "RETRYING" => Ok(NotificationStatus::Retrying),
            "FAILED" => Ok(NotificationStatus::Failed),
            "CANCELLED" => Ok(NotificationStatus::Cancelled),
            other => Err(Error::InvalidInput(format!(
                "unknown notification status: {other}"
            ))),
        }
    }
}

/// Digest cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DigestType {
    Daily,
    Weekly,
}

impl DigestType {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestType::Daily => "DAILY",
            DigestType::Weekly => "WEEKLY",
        }
    }

    /// How far back a digest run collects records.
    pub fn window(self) -> Duration {
        match self {
            DigestType::Daily => Duration::seconds(defaults::DIGEST_DAILY_WINDOW_SECS),
            DigestType::Weekly => Duration::seconds(defaults::DIGEST_WEEKLY_WINDOW_SECS),
        }
    }
}

impl FromStr for DigestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DAILY" => Ok(DigestType::Daily),
            "WEEKLY" => Ok(DigestType::Weekly),
            other => Err(Error::InvalidInput(format!("unknown digest type: {other}"))),
        }
    }
}

/// User delivery preference for a (notification type, channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Immediate,
    DailyDigest,
    WeeklyDigest,
    Disabled,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Immediate => "IMMEDIATE",
            Frequency::DailyDigest => "DAILY_DIGEST",
            Frequency::WeeklyDigest => "WEEKLY_DIGEST",
            Frequency::Disabled => "DISABLED",
        }
    }
}

impl FromStr for Frequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IMMEDIATE" => Ok(Frequency::Immediate),
            "DAILY_DIGEST" => Ok(Frequency::DailyDigest),
            "WEEKLY_DIGEST" => Ok(Frequency::WeeklyDigest),
            "DISABLED" => Ok(Frequency::Disabled),
            other => Err(Error::InvalidInput(format!("unknown frequency: {other}"))),
        }
    }
}

/// Wildcard notification type in a preference row.
pub const ANY_NOTIFICATION_TYPE: &str = "*";

/// One row of a user's preference table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub user_id: Uuid,
    /// Notification type, or [`ANY_NOTIFICATION_TYPE`].
    pub notification_type: String,
    pub channel: Channel,
    pub frequency: Frequency,
}

/// Who a notification goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: Uuid,
    pub company_id: Option<Uuid>,
    /// Email address or phone number, depending on channel.
    pub address: Option<String>,
    pub display_name: Option<String>,
}

impl Recipient {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            company_id: None,
            address: None,
            display_name: None,
        }
    }

    pub fn with_company(mut self, company_id: Uuid) -> Self {
        self.company_id = Some(company_id);
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Provider-side delivery bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub provider_id: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub dead_letter_id: Option<Uuid>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Persistent notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient: Recipient,
    pub notification_type: String,
    pub channel: Channel,
    pub priority: NotificationPriority,
    pub subject: String,
    pub body: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
    /// 0 when not produced by an escalation.
    pub escalation_level: i32,
    pub status: NotificationStatus,
    pub digest_type: Option<DigestType>,
    pub scheduled_for: DateTime<Utc>,
    pub delivery: DeliveryMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Claim lease held by a pipeline run.
    pub locked_until: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    /// New PENDING notification, deliverable immediately.
    pub fn new(
        recipient: Recipient,
        notification_type: impl Into<String>,
        channel: Channel,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: crate::new_v7(),
            recipient,
            notification_type: notification_type.into(),
            channel,
            priority: NotificationPriority::Normal,
            subject: subject.into(),
            body: body.into(),
            entity_type: None,
            entity_id: None,
            escalation_level: 0,
            status: NotificationStatus::Pending,
            digest_type: None,
            scheduled_for: now,
            delivery: DeliveryMetadata::default(),
            created_at: now,
            updated_at: now,
            locked_until: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: Uuid) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id);
        self
    }

    pub fn with_escalation_level(mut self, level: i32) -> Self {
        self.escalation_level = level;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self.scheduled_for = at;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }
}

/// Provider acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_id: String,
}

/// Channel-specific payload handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderedMessage {
    Email {
        to: String,
        subject: String,
        text: String,
        html: String,
    },
    Sms {
        to: String,
        text: String,
    },
    InApp {
        user_id: Uuid,
        title: String,
        body: String,
        link: Option<String>,
    },
}

impl RenderedMessage {
    pub fn channel(&self) -> Channel {
        match self {
            RenderedMessage::Email { .. } => Channel::Email,
            RenderedMessage::Sms { .. } => Channel::Sms,
            RenderedMessage::InApp { .. } => Channel::InApp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_forward_transitions() {
        use NotificationStatus::*;
        assert!(Pending.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Sending));
        assert!(Queued.can_transition_to(Sent));
    }

    #[test]
    fn test_status_rejects_backward_transitions() {
        use NotificationStatus::*;
        assert!(!Sent.can_transition_to(Sending));
        assert!(!Failed.can_transition_to(Retrying));
        assert!(!Sending.can_transition_to(Pending));
        assert!(!Queued.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Sending));
    }

    #[test]
    fn test_predecessors() {
        use NotificationStatus::*;
        assert_eq!(Sending.predecessors(), vec![Pending, Retrying]);
        assert_eq!(Sent.predecessors(), vec![Queued, Sending]);
        assert!(Pending.predecessors().is_empty());
    }

    #[test]
    fn test_priority_rank_orders_critical_highest() {
        assert!(NotificationPriority::Critical > NotificationPriority::Urgent);
        assert!(NotificationPriority::Urgent > NotificationPriority::Normal);
        assert_eq!(
            NotificationPriority::from_rank(5).unwrap(),
            NotificationPriority::Critical
        );
        assert!(NotificationPriority::from_rank(0).is_err());
    }

    #[test]
    fn test_digest_windows() {
        assert_eq!(DigestType::Daily.window(), Duration::hours(24));
        assert_eq!(DigestType::Weekly.window(), Duration::days(7));
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!("IN_APP".parse::<Channel>().unwrap(), Channel::InApp);
        assert!("FAX".parse::<Channel>().is_err());
    }

    #[test]
    fn test_new_record_defaults() {
        let n = NotificationRecord::new(
            Recipient::user(Uuid::new_v4()),
            "deadline_reminder",
            Channel::Email,
            "Due soon",
            "Your obligation is due",
        );
        assert_eq!(n.status, NotificationStatus::Pending);
        assert_eq!(n.escalation_level, 0);
        assert_eq!(n.delivery.retry_count, 0);
        assert!(n.locked_until.is_none());
    }
}
