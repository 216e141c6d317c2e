//! Escalation workflows and per-entity escalation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::notification::{Channel, NotificationPriority};

/// Domain entity being escalated (an obligation, a corrective action, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: Uuid) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Overdue signal supplied by the domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdueEntity {
    pub entity: EntityRef,
    pub company_id: Uuid,
    pub site_id: Option<Uuid>,
    pub title: String,
    pub days_overdue: i64,
}

/// One rung of an escalation workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationLevel {
    pub level: i32,
    /// Reached once the entity is at least this many days overdue.
    pub days_overdue: i64,
    pub recipient_roles: Vec<String>,
    pub channels: Vec<Channel>,
    pub priority: NotificationPriority,
}

/// Ordered threshold table. `company_id = None` is the system default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationWorkflow {
    pub id: Uuid,
    pub company_id: Option<Uuid>,
    pub name: String,
    pub levels: Vec<EscalationLevel>,
}

/// Fixed id of the built-in workflow.
pub const SYSTEM_WORKFLOW_ID: Uuid = Uuid::from_u128(0x5b0c_19e2_7d44_4f0a_9c61_e8a3_20d7_1f56);

impl EscalationWorkflow {
    /// Day 1 site manager, day 7 compliance manager, day 14 admin by SMS.
    pub fn system_default() -> Self {
        Self {
            id: SYSTEM_WORKFLOW_ID,
            company_id: None,
            name: "System default".to_string(),
            levels: vec![
                EscalationLevel {
                    level: 1,
                    days_overdue: 1,
                    recipient_roles: vec!["site_manager".to_string()],
                    channels: vec![Channel::Email, Channel::InApp],
                    priority: NotificationPriority::High,
                },
                EscalationLevel {
                    level: 2,
                    days_overdue: 7,
                    recipient_roles: vec!["compliance_manager".to_string()],
                    channels: vec![Channel::Email, Channel::InApp],
                    priority: NotificationPriority::Urgent,
                },
                EscalationLevel {
                    level: 3,
                    days_overdue: 14,
                    recipient_roles: vec!["admin".to_string()],
                    channels: vec![Channel::Email, Channel::Sms],
                    priority: NotificationPriority::Critical,
                },
            ],
        }
    }

    /// Highest level whose threshold has been reached, or 0.
    pub fn target_level(&self, days_overdue: i64) -> i32 {
        self.levels
            .iter()
            .filter(|l| days_overdue >= l.days_overdue)
            .map(|l| l.level)
            .max()
            .unwrap_or(0)
    }

    pub fn level(&self, level: i32) -> Option<&EscalationLevel> {
        self.levels.iter().find(|l| l.level == level)
    }
}

/// Stored escalation state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub entity: EntityRef,
    pub company_id: Uuid,
    pub site_id: Option<Uuid>,
    /// Never decreases except through an explicit reset.
    pub current_level: i32,
    /// Incremented by every reset so a re-escalation notifies again.
    pub cycle: i32,
    pub workflow_id: Uuid,
    pub last_escalated_at: Option<DateTime<Utc>>,
    pub notified_recipient_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A level increase to apply with compare-and-set on `from_level`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationTransition {
    pub entity: EntityRef,
    pub company_id: Uuid,
    pub site_id: Option<Uuid>,
    pub workflow_id: Uuid,
    pub cycle: i32,
    pub from_level: i32,
    pub to_level: i32,
    pub recipients: Vec<Uuid>,
    pub at: DateTime<Utc>,
}

impl EscalationTransition {
    /// Record state after the transition is applied on top of `previous`.
    pub fn apply(&self, previous: Option<&EscalationRecord>) -> EscalationRecord {
        let mut notified = previous
            .map(|r| r.notified_recipient_ids.clone())
            .unwrap_or_default();
        for id in &self.recipients {
            if !notified.contains(id) {
                notified.push(*id);
            }
        }
        EscalationRecord {
            entity: self.entity.clone(),
            company_id: self.company_id,
            site_id: self.site_id,
            current_level: self.to_level,
            cycle: self.cycle,
            workflow_id: self.workflow_id,
            last_escalated_at: Some(self.at),
            notified_recipient_ids: notified,
            created_at: previous.map(|r| r.created_at).unwrap_or(self.at),
            updated_at: self.at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_level_thresholds() {
        let wf = EscalationWorkflow::system_default();
        assert_eq!(wf.target_level(0), 0);
        assert_eq!(wf.target_level(1), 1);
        assert_eq!(wf.target_level(6), 1);
        assert_eq!(wf.target_level(7), 2);
        assert_eq!(wf.target_level(30), 3);
    }

    #[test]
    fn test_level_lookup() {
        let wf = EscalationWorkflow::system_default();
        assert_eq!(wf.level(3).unwrap().channels, vec![Channel::Email, Channel::Sms]);
        assert!(wf.level(4).is_none());
    }

    #[test]
    fn test_apply_merges_recipients() {
        let entity = EntityRef::new("obligation", Uuid::new_v4());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let now = Utc::now();
        let first = EscalationTransition {
            entity: entity.clone(),
            company_id: Uuid::new_v4(),
            site_id: None,
            workflow_id: SYSTEM_WORKFLOW_ID,
            cycle: 0,
            from_level: 0,
            to_level: 1,
            recipients: vec![a],
            at: now,
        };
        let rec = first.apply(None);
        assert_eq!(rec.current_level, 1);
        assert_eq!(rec.created_at, now);

        let second = EscalationTransition {
            from_level: 1,
            to_level: 2,
            recipients: vec![a, b],
            ..first
        };
        let rec2 = second.apply(Some(&rec));
        assert_eq!(rec2.current_level, 2);
        assert_eq!(rec2.notified_recipient_ids, vec![a, b]);
    }
}
