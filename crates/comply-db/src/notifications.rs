//! Notification record store.
//!
//! Every status write is guarded with `status = ANY(<allowed predecessors>)`
//! so concurrent pipeline runs cannot move a record backwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Executor, Pool, Postgres, Row};
use uuid::Uuid;

use comply_core::{
    DeliveryMetadata, DigestType, Error, NotificationPriority, NotificationRecord,
    NotificationStatus, NotificationStore, Recipient, Result,
};

pub(crate) const NOTIFICATION_COLUMNS: &str = "id, user_id, company_id, address, display_name, \
     notification_type, channel, priority, subject, body, entity_type, entity_id, \
     escalation_level, status, digest_type, scheduled_for, provider_id, retry_count, last_error, \
     dead_letter_id, sent_at, created_at, updated_at, locked_until";

/// Insert a record unless its id exists. Shared with the escalation store,
/// which inserts notifications inside its own transaction.
pub(crate) async fn insert_notification<'e, E>(executor: E, n: &NotificationRecord) -> Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        "INSERT INTO notification (id, user_id, company_id, address, display_name,
                                   notification_type, channel, priority, subject, body,
                                   entity_type, entity_id, escalation_level, status, digest_type,
                                   scheduled_for, provider_id, retry_count, last_error,
                                   dead_letter_id, sent_at, created_at, updated_at, locked_until)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                 $19, $20, $21, $22, $23, $24)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(n.id)
    .bind(n.recipient.user_id)
    .bind(n.recipient.company_id)
    .bind(&n.recipient.address)
    .bind(&n.recipient.display_name)
    .bind(&n.notification_type)
    .bind(n.channel.as_str())
    .bind(n.priority.rank())
    .bind(&n.subject)
    .bind(&n.body)
    .bind(&n.entity_type)
    .bind(n.entity_id)
    .bind(n.escalation_level)
    .bind(n.status.as_str())
    .bind(n.digest_type.map(|d| d.as_str()))
    .bind(n.scheduled_for)
    .bind(&n.delivery.provider_id)
    .bind(n.delivery.retry_count)
    .bind(&n.delivery.last_error)
    .bind(n.delivery.dead_letter_id)
    .bind(n.delivery.sent_at)
    .bind(n.created_at)
    .bind(n.updated_at)
    .bind(n.locked_until)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub(crate) fn parse_notification_row(row: &PgRow) -> Result<NotificationRecord> {
    let channel: String = row.try_get("channel")?;
    let priority: i16 = row.try_get("priority")?;
    let status: String = row.try_get("status")?;
    let digest_type: Option<String> = row.try_get("digest_type")?;
    Ok(NotificationRecord {
        id: row.try_get("id")?,
        recipient: Recipient {
            user_id: row.try_get("user_id")?,
            company_id: row.try_get("company_id")?,
            address: row.try_get("address")?,
            display_name: row.try_get("display_name")?,
        },
        notification_type: row.try_get("notification_type")?,
        channel: channel.parse()?,
        priority: NotificationPriority::from_rank(priority)?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        escalation_level: row.try_get("escalation_level")?,
        status: status.parse()?,
        digest_type: digest_type.map(|d| d.parse()).transpose()?,
        scheduled_for: row.try_get("scheduled_for")?,
        delivery: DeliveryMetadata {
            provider_id: row.try_get("provider_id")?,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            dead_letter_id: row.try_get("dead_letter_id")?,
            sent_at: row.try_get("sent_at")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        locked_until: row.try_get("locked_until")?,
    })
}

fn predecessor_names(to: NotificationStatus) -> Vec<String> {
    to.predecessors()
        .into_iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

/// PostgreSQL implementation of [`NotificationStore`].
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: Pool<Postgres>,
}

impl PgNotificationStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Turn a guarded update that touched nothing into the right error.
    async fn check_transition(&self, id: Uuid, to: NotificationStatus, rows: u64) -> Result<()> {
        if rows > 0 {
            return Ok(());
        }
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM notification WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            None => Err(Error::NotFound(format!("notification {id}"))),
            Some(status) => Err(Error::Job(format!(
                "notification {id}: illegal transition {status} -> {}",
                to.as_str()
            ))),
        }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, record: &NotificationRecord) -> Result<bool> {
        insert_notification(&self.pool, record).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<NotificationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notification WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_notification_row).transpose()
    }

    async fn claim_due(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query(&format!(
            "UPDATE notification
             SET locked_until = $3
             WHERE id IN (
                 SELECT id FROM notification
                 WHERE status IN ('PENDING', 'RETRYING')
                   AND scheduled_for <= $2
                   AND (locked_until IS NULL OR locked_until < $2)
                 ORDER BY priority DESC, created_at ASC
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {NOTIFICATION_COLUMNS}"
        ))
        .bind(limit)
        .bind(now)
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await?;

        let mut batch = rows
            .iter()
            .map(parse_notification_row)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified.
        batch.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(batch)
    }

    async fn mark_cancelled(&self, id: Uuid, reason: &str) -> Result<()> {
        let to = NotificationStatus::Cancelled;
        let result = sqlx::query(
            "UPDATE notification
             SET status = 'CANCELLED', last_error = $2, locked_until = NULL, updated_at = NOW()
             WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(reason)
        .bind(predecessor_names(to))
        .execute(&self.pool)
        .await?;
        self.check_transition(id, to, result.rows_affected()).await
    }

    async fn mark_queued(&self, id: Uuid, digest: DigestType) -> Result<()> {
        let to = NotificationStatus::Queued;
        let result = sqlx::query(
            "UPDATE notification
             SET status = 'QUEUED', digest_type = $2, locked_until = NULL, updated_at = NOW()
             WHERE id = $1 AND status = ANY($3)",
        )
        .bind(id)
        .bind(digest.as_str())
        .bind(predecessor_names(to))
        .execute(&self.pool)
        .await?;
        self.check_transition(id, to, result.rows_affected()).await
    }

    async fn defer(&self, id: Uuid, until: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notification
             SET scheduled_for = $2, locked_until = NULL, updated_at = NOW()
             WHERE id = $1 AND status IN ('PENDING', 'RETRYING')",
        )
        .bind(id)
        .bind(until)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Job(format!(
                "notification {id} is not deliverable, cannot defer"
            )));
        }
        Ok(())
    }

    async fn mark_sending(&self, id: Uuid) -> Result<()> {
        let to = NotificationStatus::Sending;
        let result = sqlx::query(
            "UPDATE notification
             SET status = 'SENDING', updated_at = NOW()
             WHERE id = $1 AND status = ANY($2)",
        )
        .bind(id)
        .bind(predecessor_names(to))
        .execute(&self.pool)
        .await?;
        self.check_transition(id, to, result.rows_affected()).await
    }

    async fn recover_sending(&self, now: DateTime<Utc>, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notification
             SET status = 'RETRYING', last_error = $2, scheduled_for = $1,
                 locked_until = NULL, updated_at = $1
             WHERE status = 'SENDING' AND (locked_until IS NULL OR locked_until < $1)",
        )
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_sent(&self, id: Uuid, provider_id: &str, at: DateTime<Utc>) -> Result<()> {
        let to = NotificationStatus::Sent;
        let result = sqlx::query(
            "UPDATE notification
             SET status = 'SENT', provider_id = $2, sent_at = $3, last_error = NULL,
                 locked_until = NULL, updated_at = $3
             WHERE id = $1 AND status = ANY($4)",
        )
        .bind(id)
        .bind(provider_id)
        .bind(at)
        .bind(predecessor_names(to))
        .execute(&self.pool)
        .await?;
        self.check_transition(id, to, result.rows_affected()).await
    }

    async fn mark_retrying(
        &self,
        id: Uuid,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let to = NotificationStatus::Retrying;
        let result = sqlx::query(
            "UPDATE notification
             SET status = 'RETRYING', retry_count = $2, scheduled_for = $3, last_error = $4,
                 locked_until = NULL, updated_at = NOW()
             WHERE id = $1 AND status = ANY($5)",
        )
        .bind(id)
        .bind(retry_count)
        .bind(next_attempt_at)
        .bind(error)
        .bind(predecessor_names(to))
        .execute(&self.pool)
        .await?;
        self.check_transition(id, to, result.rows_affected()).await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        retry_count: i32,
        error: &str,
        dead_letter_id: Option<Uuid>,
    ) -> Result<()> {
        let to = NotificationStatus::Failed;
        let result = sqlx::query(
            "UPDATE notification
             SET status = 'FAILED', retry_count = $2, last_error = $3, dead_letter_id = $4,
                 locked_until = NULL, updated_at = NOW()
             WHERE id = $1 AND status = ANY($5)",
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .bind(dead_letter_id)
        .bind(predecessor_names(to))
        .execute(&self.pool)
        .await?;
        self.check_transition(id, to, result.rows_affected()).await
    }

    async fn list_queued(
        &self,
        digest: DigestType,
        since: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notification
             WHERE status = 'QUEUED' AND digest_type = $1 AND scheduled_for >= $2
             ORDER BY user_id, channel, priority DESC, created_at ASC"
        ))
        .bind(digest.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_notification_row).collect()
    }

    async fn mark_digest_sent(
        &self,
        ids: &[Uuid],
        provider_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE notification
             SET status = 'SENT', provider_id = $2, sent_at = $3, updated_at = $3
             WHERE id = ANY($1) AND status = 'QUEUED'",
        )
        .bind(ids)
        .bind(provider_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn hold_queued(&self, ids: &[Uuid], until: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notification
             SET scheduled_for = $2, updated_at = NOW()
             WHERE id = ANY($1) AND status = 'QUEUED'",
        )
        .bind(ids)
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn expire_queued(
        &self,
        digest: DigestType,
        before: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notification
             SET status = 'CANCELLED', last_error = $3, updated_at = NOW()
             WHERE status = 'QUEUED' AND digest_type = $1 AND scheduled_for < $2",
        )
        .bind(digest.as_str())
        .bind(before)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notification
             WHERE entity_type = $1 AND entity_id = $2
             ORDER BY created_at ASC"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_notification_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predecessor_names_for_sending() {
        assert_eq!(predecessor_names(NotificationStatus::Sending), vec!["PENDING", "RETRYING"]);
    }

    #[test]
    fn test_predecessor_names_for_failed() {
        assert_eq!(predecessor_names(NotificationStatus::Failed), vec!["SENDING"]);
    }
}
