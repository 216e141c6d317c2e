//! Leveled escalation of overdue entities.
//!
//! Each run computes the level an entity should be at from how long it has
//! been overdue. When that is above the stored level the record is advanced
//! with compare-and-set and the level's notifications are inserted in the
//! same write, so concurrent runs produce exactly one batch per transition.
//! Levels never go down on their own; [`EscalationEngine::reset`] starts a
//! new cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use comply_core::{
    escalation_notification_id, EntityRef, Error, EscalationStore, EscalationTransition,
    EscalationWorkflow, NotificationRecord, OverdueEntity, OverdueSource, RecipientResolver,
    Result,
};

/// Notification type of every escalation notice.
pub const ESCALATION_NOTIFICATION_TYPE: &str = "escalation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// Already at or above the target level.
    Unchanged { level: i32 },
    Advanced {
        from: i32,
        to: i32,
        notifications: usize,
    },
    /// Another run advanced the record between our read and write.
    LostRace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscalationSummary {
    pub scanned: usize,
    pub advanced: usize,
    pub unchanged: usize,
    pub lost_races: usize,
    pub notifications: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct EscalationEngine {
    escalations: Arc<dyn EscalationStore>,
    overdue: Arc<dyn OverdueSource>,
    recipients: Arc<dyn RecipientResolver>,
}

impl EscalationEngine {
    pub fn new(
        escalations: Arc<dyn EscalationStore>,
        overdue: Arc<dyn OverdueSource>,
        recipients: Arc<dyn RecipientResolver>,
    ) -> Self {
        Self {
            escalations,
            overdue,
            recipients,
        }
    }

    /// Escalate every overdue entity, optionally for one company only.
    #[instrument(skip(self))]
    pub async fn run(&self, company_id: Option<Uuid>, now: DateTime<Utc>) -> Result<EscalationSummary> {
        let entities = self.overdue.overdue_entities(company_id, now).await?;
        let mut summary = EscalationSummary {
            scanned: entities.len(),
            ..Default::default()
        };

        for entity in &entities {
            match self.escalate(entity, now).await {
                Ok(EscalationOutcome::Advanced { notifications, .. }) => {
                    summary.advanced += 1;
                    summary.notifications += notifications;
                }
                Ok(EscalationOutcome::Unchanged { .. }) => summary.unchanged += 1,
                Ok(EscalationOutcome::LostRace) => summary.lost_races += 1,
                Err(e) => {
                    summary.errors += 1;
                    warn!(
                        subsystem = "escalation",
                        entity_type = %entity.entity.entity_type,
                        entity_id = %entity.entity.entity_id,
                        error = %e,
                        "Escalation failed for entity"
                    );
                }
            }
        }

        info!(
            subsystem = "escalation",
            scanned = summary.scanned,
            advanced = summary.advanced,
            notifications = summary.notifications,
            errors = summary.errors,
            "Escalation run finished"
        );
        Ok(summary)
    }

    pub async fn escalate(&self, entity: &OverdueEntity, now: DateTime<Utc>) -> Result<EscalationOutcome> {
        let workflow = self.workflow_for(entity.company_id).await?;
        let target = workflow.target_level(entity.days_overdue);

        let (current, cycle) = match self.escalations.get(&entity.entity).await? {
            Some(record) => (record.current_level, record.cycle),
            None => (0, 0),
        };
        if target <= current {
            return Ok(EscalationOutcome::Unchanged { level: current });
        }

        let level = workflow.level(target).ok_or_else(|| {
            Error::Config(format!("workflow {} has no level {target}", workflow.id))
        })?;
        let recipients = self.recipients.resolve(entity, level).await?;

        let title = format!("Escalation level {target}: {}", entity.title);
        let body = format!(
            "{} is {} day{} overdue.",
            entity.title,
            entity.days_overdue,
            if entity.days_overdue == 1 { "" } else { "s" }
        );
        let mut notifications = Vec::with_capacity(recipients.len() * level.channels.len());
        for recipient in &recipients {
            for channel in &level.channels {
                let id = escalation_notification_id(
                    &entity.entity.entity_type,
                    entity.entity.entity_id,
                    cycle,
                    target,
                    recipient.user_id,
                    channel.as_str(),
                );
                notifications.push(
                    NotificationRecord::new(
                        recipient.clone(),
                        ESCALATION_NOTIFICATION_TYPE,
                        *channel,
                        title.clone(),
                        body.clone(),
                    )
                    .with_id(id)
                    .with_priority(level.priority)
                    .with_entity(entity.entity.entity_type.clone(), entity.entity.entity_id)
                    .with_escalation_level(target),
                );
            }
        }

        let transition = EscalationTransition {
            entity: entity.entity.clone(),
            company_id: entity.company_id,
            site_id: entity.site_id,
            workflow_id: workflow.id,
            cycle,
            from_level: current,
            to_level: target,
            recipients: recipients.iter().map(|r| r.user_id).collect(),
            at: now,
        };

        if !self.escalations.advance(&transition, &notifications).await? {
            debug!(
                entity_id = %entity.entity.entity_id,
                from = current,
                to = target,
                "Escalation already advanced by another run"
            );
            return Ok(EscalationOutcome::LostRace);
        }

        info!(
            subsystem = "escalation",
            entity_type = %entity.entity.entity_type,
            entity_id = %entity.entity.entity_id,
            from = current,
            to = target,
            notifications = notifications.len(),
            "Entity escalated"
        );
        Ok(EscalationOutcome::Advanced {
            from: current,
            to: target,
            notifications: notifications.len(),
        })
    }

    /// De-escalate to level 0. The next escalation notifies again.
    pub async fn reset(&self, entity: &EntityRef) -> Result<bool> {
        let reset = self.escalations.reset(entity).await?;
        if reset {
            info!(
                subsystem = "escalation",
                entity_type = %entity.entity_type,
                entity_id = %entity.entity_id,
                "Escalation reset"
            );
        }
        Ok(reset)
    }

    async fn workflow_for(&self, company_id: Uuid) -> Result<EscalationWorkflow> {
        Ok(self
            .escalations
            .workflow_for_company(company_id)
            .await?
            .unwrap_or_else(EscalationWorkflow::system_default))
    }
}
