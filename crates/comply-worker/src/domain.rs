//! Escalation collaborators backed by views the compliance schema provides.
//!
//! The worker does not own the obligation tables. It reads two views:
//!
//! - `ESCALATION_OVERDUE_VIEW` (default `overdue_entities`): one row per
//!   overdue entity with `entity_type, entity_id, company_id, site_id, title,
//!   days_overdue`.
//! - `ESCALATION_RECIPIENTS_VIEW` (default `escalation_recipients`): one row
//!   per role holder with `company_id, site_id, role, user_id, email, phone,
//!   display_name`. A row with a null `site_id` applies to every site.
//!
//! A missing view is logged and treated as "nothing overdue", so the worker
//! can run against a database where the domain schema is not installed yet.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use comply_core::{
    Channel, EntityRef, Error, EscalationLevel, OverdueEntity, OverdueSource, Recipient,
    RecipientResolver, Result,
};

const UNDEFINED_TABLE: &str = "42P01";

/// Reject anything that is not a plain (optionally schema-qualified) name.
pub fn view_name(raw: &str) -> Result<String> {
    let valid = !raw.is_empty()
        && raw.split('.').count() <= 2
        && raw.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !part.starts_with(|c: char| c.is_ascii_digit())
        });
    if valid {
        Ok(raw.to_string())
    } else {
        Err(Error::Config(format!("invalid view name: {raw:?}")))
    }
}

/// Parse every row, logging and skipping the ones that do not fit.
pub fn parse_rows<R, T>(
    rows: impl IntoIterator<Item = R>,
    view: &str,
    parse: impl Fn(R) -> Result<T>,
) -> Vec<T> {
    let mut parsed = Vec::new();
    let mut skipped = 0usize;
    for row in rows {
        match parse(row) {
            Ok(item) => parsed.push(item),
            Err(e) => {
                skipped += 1;
                warn!(subsystem = "escalation", view = %view, error = %e, "Skipping malformed view row");
            }
        }
    }
    if skipped > 0 {
        debug!(view = %view, kept = parsed.len(), skipped, "View rows parsed");
    }
    parsed
}

fn is_missing_relation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_TABLE))
}

/// Overdue entities read from a domain view.
pub struct ViewOverdueSource {
    pool: Pool<Postgres>,
    view: String,
    warned: AtomicBool,
}

impl ViewOverdueSource {
    pub fn new(pool: Pool<Postgres>, view: &str) -> Result<Self> {
        Ok(Self {
            pool,
            view: view_name(view)?,
            warned: AtomicBool::new(false),
        })
    }

    pub fn from_env(pool: Pool<Postgres>) -> Result<Self> {
        let view = std::env::var("ESCALATION_OVERDUE_VIEW")
            .unwrap_or_else(|_| "overdue_entities".to_string());
        Self::new(pool, &view)
    }

    fn parse_row(row: &PgRow) -> Result<OverdueEntity> {
        Ok(OverdueEntity {
            entity: EntityRef {
                entity_type: row.try_get("entity_type")?,
                entity_id: row.try_get("entity_id")?,
            },
            company_id: row.try_get("company_id")?,
            site_id: row.try_get("site_id")?,
            title: row.try_get("title")?,
            days_overdue: row.try_get("days_overdue")?,
        })
    }
}

#[async_trait]
impl OverdueSource for ViewOverdueSource {
    async fn overdue_entities(
        &self,
        company_id: Option<Uuid>,
        _now: DateTime<Utc>,
    ) -> Result<Vec<OverdueEntity>> {
        let rows = sqlx::query(&format!(
            "SELECT entity_type, entity_id, company_id, site_id, title, days_overdue::bigint AS days_overdue
             FROM {}
             WHERE days_overdue > 0 AND ($1::uuid IS NULL OR company_id = $1)
             ORDER BY days_overdue DESC",
            self.view
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => {
                debug!(view = %self.view, count = rows.len(), "Loaded overdue entities");
                Ok(parse_rows(rows.iter(), &self.view, Self::parse_row))
            }
            Err(e) if is_missing_relation(&e) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        subsystem = "escalation",
                        view = %self.view,
                        "Overdue view not found, escalation runs will find nothing"
                    );
                }
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Role holders read from a domain view.
pub struct ViewRecipientResolver {
    pool: Pool<Postgres>,
    view: String,
}

impl ViewRecipientResolver {
    pub fn new(pool: Pool<Postgres>, view: &str) -> Result<Self> {
        Ok(Self {
            pool,
            view: view_name(view)?,
        })
    }

    pub fn from_env(pool: Pool<Postgres>) -> Result<Self> {
        let view = std::env::var("ESCALATION_RECIPIENTS_VIEW")
            .unwrap_or_else(|_| "escalation_recipients".to_string());
        Self::new(pool, &view)
    }
}

/// Address to carry for a level: SMS-only levels get the phone number,
/// anything that includes email gets the email address.
pub fn address_for(level: &EscalationLevel, email: Option<String>, phone: Option<String>) -> Option<String> {
    let wants_email = level.channels.contains(&Channel::Email);
    let wants_sms = level.channels.contains(&Channel::Sms);
    match (wants_email, wants_sms) {
        (false, true) => phone.or(email),
        _ => email.or(phone),
    }
}

#[async_trait]
impl RecipientResolver for ViewRecipientResolver {
    async fn resolve(
        &self,
        entity: &OverdueEntity,
        level: &EscalationLevel,
    ) -> Result<Vec<Recipient>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (user_id) user_id, email, phone, display_name
             FROM {}
             WHERE company_id = $1
               AND role = ANY($2)
               AND (site_id IS NULL OR site_id = $3)
             ORDER BY user_id",
            self.view
        ))
        .bind(entity.company_id)
        .bind(&level.recipient_roles)
        .bind(entity.site_id)
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) if is_missing_relation(&e) => {
                warn!(view = %self.view, "Recipient view not found");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(parse_rows(rows.iter(), &self.view, |row| -> Result<Recipient> {
            let mut recipient =
                Recipient::user(row.try_get("user_id")?).with_company(entity.company_id);
            recipient.address = address_for(level, row.try_get("email")?, row.try_get("phone")?);
            recipient.display_name = row.try_get("display_name")?;
            Ok(recipient)
        }))
    }
}
