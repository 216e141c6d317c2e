//! Identifier helpers.
//!
//! Random ids are UUIDv7 so that they sort by creation time. Ids that must be
//! identical across processes and restarts (recurring triggers, recurring
//! firings, escalation notifications) are UUIDv5 over a fixed namespace.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::defaults::{ESCALATION_NAMESPACE, RECURRING_NAMESPACE};

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use comply_core::uuid_utils::new_v7;
///
/// let a = new_v7();
/// let b = new_v7();
/// assert_ne!(a, b);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Fixed id of the recurring trigger for a job type.
///
/// Derived from the job type alone so that registering the same job type on
/// every process start updates a single trigger.
pub fn recurring_trigger_id(job_type: &str) -> Uuid {
    Uuid::new_v5(
        &RECURRING_NAMESPACE,
        format!("recurring:{job_type}").as_bytes(),
    )
}

/// Id of the envelope produced when a recurring trigger fires at `fire_at`.
///
/// Two schedulers firing the same trigger for the same instant produce the
/// same id, and the queue collapses them.
pub fn recurring_firing_id(job_type: &str, fire_at: DateTime<Utc>) -> Uuid {
    Uuid::new_v5(
        &RECURRING_NAMESPACE,
        format!("{job_type}@{}", fire_at.timestamp_millis()).as_bytes(),
    )
}

/// Id of one escalation notification (entity, cycle, level, recipient, channel).
pub fn escalation_notification_id(
    entity_type: &str,
    entity_id: Uuid,
    cycle: i32,
    level: i32,
    recipient_id: Uuid,
    channel: &str,
) -> Uuid {
    Uuid::new_v5(
        &ESCALATION_NAMESPACE,
        format!("{entity_type}:{entity_id}:{cycle}:{level}:{recipient_id}:{channel}").as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_v7_is_version_7() {
        assert_eq!(new_v7().get_version_num(), 7);
    }

    #[test]
    fn test_recurring_trigger_id_is_stable() {
        let a = recurring_trigger_id("CHECK_DEADLINES");
        let b = recurring_trigger_id("CHECK_DEADLINES");
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn test_recurring_trigger_id_differs_by_job_type() {
        assert_ne!(
            recurring_trigger_id("CHECK_DEADLINES"),
            recurring_trigger_id("DAILY_DIGEST")
        );
    }

    #[test]
    fn test_recurring_firing_id_depends_on_instant() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        assert_eq!(
            recurring_firing_id("CHECK_DEADLINES", t1),
            recurring_firing_id("CHECK_DEADLINES", t1)
        );
        assert_ne!(
            recurring_firing_id("CHECK_DEADLINES", t1),
            recurring_firing_id("CHECK_DEADLINES", t2)
        );
    }

    #[test]
    fn test_escalation_notification_id_includes_level() {
        let entity = Uuid::new_v4();
        let user = Uuid::new_v4();
        let l1 = escalation_notification_id("obligation", entity, 0, 1, user, "EMAIL");
        let l2 = escalation_notification_id("obligation", entity, 0, 2, user, "EMAIL");
        assert_ne!(l1, l2);
        assert_eq!(
            l1,
            escalation_notification_id("obligation", entity, 0, 1, user, "EMAIL")
        );
        assert_ne!(
            l1,
            escalation_notification_id("obligation", entity, 1, 1, user, "EMAIL")
        );
    }
}
