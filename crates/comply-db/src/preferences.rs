//! Notification preference store.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use comply_core::{NotificationPreference, PreferenceStore, Result};

/// PostgreSQL implementation of [`PreferenceStore`].
#[derive(Clone)]
pub struct PgPreferenceStore {
    pool: Pool<Postgres>,
}

impl PgPreferenceStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceStore for PgPreferenceStore {
    async fn for_user(&self, user_id: Uuid) -> Result<Vec<NotificationPreference>> {
        let rows = sqlx::query(
            "SELECT user_id, notification_type, channel, frequency
             FROM notification_preference
             WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<NotificationPreference> {
                let channel: String = row.try_get("channel")?;
                let frequency: String = row.try_get("frequency")?;
                Ok(NotificationPreference {
                    user_id: row.try_get("user_id")?,
                    notification_type: row.try_get("notification_type")?,
                    channel: channel.parse()?,
                    frequency: frequency.parse()?,
                })
            })
            .collect()
    }

    async fn set(&self, preference: &NotificationPreference) -> Result<()> {
        sqlx::query(
            "INSERT INTO notification_preference (user_id, notification_type, channel, frequency)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id, notification_type, channel)
             DO UPDATE SET frequency = EXCLUDED.frequency, updated_at = NOW()",
        )
        .bind(preference.user_id)
        .bind(&preference.notification_type)
        .bind(preference.channel.as_str())
        .bind(preference.frequency.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
