//! Escalation records and workflows.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use comply_core::{
    EntityRef, EscalationRecord, EscalationStore, EscalationTransition, EscalationWorkflow,
    NotificationRecord, Result,
};

use crate::notifications::insert_notification;

const RECORD_COLUMNS: &str = "entity_type, entity_id, company_id, site_id, current_level, cycle, \
     workflow_id, last_escalated_at, notified_recipient_ids, created_at, updated_at";

/// PostgreSQL implementation of [`EscalationStore`].
#[derive(Clone)]
pub struct PgEscalationStore {
    pool: Pool<Postgres>,
}

impl PgEscalationStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: &PgRow) -> Result<EscalationRecord> {
        Ok(EscalationRecord {
            entity: EntityRef {
                entity_type: row.try_get("entity_type")?,
                entity_id: row.try_get("entity_id")?,
            },
            company_id: row.try_get("company_id")?,
            site_id: row.try_get("site_id")?,
            current_level: row.try_get("current_level")?,
            cycle: row.try_get("cycle")?,
            workflow_id: row.try_get("workflow_id")?,
            last_escalated_at: row.try_get("last_escalated_at")?,
            notified_recipient_ids: row.try_get("notified_recipient_ids")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn parse_workflow_row(row: &PgRow) -> Result<EscalationWorkflow> {
        let levels: serde_json::Value = row.try_get("levels")?;
        Ok(EscalationWorkflow {
            id: row.try_get("id")?,
            company_id: row.try_get("company_id")?,
            name: row.try_get("name")?,
            levels: serde_json::from_value(levels)?,
        })
    }
}

#[async_trait]
impl EscalationStore for PgEscalationStore {
    async fn get(&self, entity: &EntityRef) -> Result<Option<EscalationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM escalation_record
             WHERE entity_type = $1 AND entity_id = $2"
        ))
        .bind(&entity.entity_type)
        .bind(entity.entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_record_row).transpose()
    }

    async fn advance(
        &self,
        transition: &EscalationTransition,
        notifications: &[NotificationRecord],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE escalation_record
             SET current_level = $4,
                 workflow_id = $5,
                 last_escalated_at = $6,
                 notified_recipient_ids = ARRAY(
                     SELECT DISTINCT r FROM unnest(notified_recipient_ids || $7::uuid[]) AS r
                 ),
                 updated_at = $6
             WHERE entity_type = $1 AND entity_id = $2
               AND cycle = $3 AND current_level = $8",
        )
        .bind(&transition.entity.entity_type)
        .bind(transition.entity.entity_id)
        .bind(transition.cycle)
        .bind(transition.to_level)
        .bind(transition.workflow_id)
        .bind(transition.at)
        .bind(&transition.recipients)
        .bind(transition.from_level)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let applied = if updated == 1 {
            true
        } else if transition.from_level == 0 && transition.cycle == 0 {
            // First escalation of this entity.
            let inserted = sqlx::query(
                "INSERT INTO escalation_record (entity_type, entity_id, company_id, site_id,
                                                current_level, cycle, workflow_id,
                                                last_escalated_at, notified_recipient_ids,
                                                created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $7, $7)
                 ON CONFLICT (entity_type, entity_id) DO NOTHING",
            )
            .bind(&transition.entity.entity_type)
            .bind(transition.entity.entity_id)
            .bind(transition.company_id)
            .bind(transition.site_id)
            .bind(transition.to_level)
            .bind(transition.workflow_id)
            .bind(transition.at)
            .bind(&transition.recipients)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            inserted == 1
        } else {
            false
        };

        if !applied {
            tx.rollback().await?;
            debug!(
                subsystem = "db",
                component = "escalations",
                op = "advance",
                entity_id = %transition.entity.entity_id,
                from_level = transition.from_level,
                to_level = transition.to_level,
                "Escalation CAS lost, record moved concurrently"
            );
            return Ok(false);
        }

        for notification in notifications {
            insert_notification(&mut *tx, notification).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn reset(&self, entity: &EntityRef) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE escalation_record
             SET current_level = 0, cycle = cycle + 1, notified_recipient_ids = '{}',
                 updated_at = NOW()
             WHERE entity_type = $1 AND entity_id = $2 AND current_level > 0",
        )
        .bind(&entity.entity_type)
        .bind(entity.entity_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn workflow_for_company(&self, company_id: Uuid) -> Result<Option<EscalationWorkflow>> {
        let row = sqlx::query(
            "SELECT id, company_id, name, levels FROM escalation_workflow WHERE company_id = $1",
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_workflow_row).transpose()
    }

    async fn save_workflow(&self, workflow: &EscalationWorkflow) -> Result<()> {
        sqlx::query(
            "INSERT INTO escalation_workflow (id, company_id, name, levels)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET
                 company_id = EXCLUDED.company_id,
                 name = EXCLUDED.name,
                 levels = EXCLUDED.levels,
                 updated_at = NOW()",
        )
        .bind(workflow.id)
        .bind(workflow.company_id)
        .bind(&workflow.name)
        .bind(serde_json::to_value(&workflow.levels)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
