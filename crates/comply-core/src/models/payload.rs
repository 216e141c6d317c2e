//! Tagged job payloads.
//!
//! One variant per [`JobType`]. Payloads are validated when they are enqueued
//! so a malformed payload never reaches a worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{DigestType, JobType};
use crate::defaults;
use crate::error::{Error, JobError, Result};

const REPORT_FORMATS: [&str; 3] = ["pdf", "xlsx", "csv"];

fn default_batch_size() -> i64 {
    defaults::NOTIFICATION_BATCH_SIZE
}

/// Typed payload for every job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPayload {
    CheckDeadlines {
        /// Restrict the scan to one company.
        #[serde(default)]
        company_id: Option<Uuid>,
    },
    ProcessNotifications {
        #[serde(default = "default_batch_size")]
        batch_size: i64,
    },
    DailyDigest {},
    WeeklyDigest {},
    CleanupJobs {},
    DocumentExtraction {
        document_id: Uuid,
        company_id: Uuid,
        #[serde(default)]
        document_type: Option<String>,
    },
    GenerateReport {
        report_id: Uuid,
        company_id: Uuid,
        format: String,
    },
    ParseSpreadsheet {
        upload_id: Uuid,
        company_id: Uuid,
        #[serde(default)]
        sheet: Option<String>,
    },
    PatternDiscovery {
        company_id: Uuid,
        #[serde(default)]
        document_id: Option<Uuid>,
    },
    SendReminder {
        obligation_id: Uuid,
        user_id: Uuid,
        due_at: DateTime<Utc>,
    },
}

impl JobPayload {
    /// Job type this payload belongs to.
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::CheckDeadlines { .. } => JobType::CheckDeadlines,
            JobPayload::ProcessNotifications { .. } => JobType::ProcessNotifications,
            JobPayload::DailyDigest {} => JobType::DailyDigest,
            JobPayload::WeeklyDigest {} => JobType::WeeklyDigest,
            JobPayload::CleanupJobs {} => JobType::CleanupJobs,
            JobPayload::DocumentExtraction { .. } => JobType::DocumentExtraction,
            JobPayload::GenerateReport { .. } => JobType::GenerateReport,
            JobPayload::ParseSpreadsheet { .. } => JobType::ParseSpreadsheet,
            JobPayload::PatternDiscovery { .. } => JobType::PatternDiscovery,
            JobPayload::SendReminder { .. } => JobType::SendReminder,
        }
    }

    /// Digest type for digest payloads.
    pub fn digest_type(&self) -> Option<DigestType> {
        match self {
            JobPayload::DailyDigest {} => Some(DigestType::Daily),
            JobPayload::WeeklyDigest {} => Some(DigestType::Weekly),
            _ => None,
        }
    }

    /// Reject payloads that would only fail later inside a worker.
    pub fn validate(&self) -> Result<()> {
        fn non_nil(field: &str, id: &Uuid) -> Result<()> {
            if id.is_nil() {
                return Err(Error::InvalidInput(format!("{field} must not be nil")));
            }
            Ok(())
        }

        match self {
            JobPayload::CheckDeadlines { company_id } => {
                if let Some(id) = company_id {
                    non_nil("company_id", id)?;
                }
            }
            JobPayload::ProcessNotifications { batch_size } => {
                if !(1..=1000).contains(batch_size) {
                    return Err(Error::InvalidInput(format!(
                        "batch_size must be between 1 and 1000, got {batch_size}"
                    )));
                }
            }
            JobPayload::DailyDigest {} | JobPayload::WeeklyDigest {} | JobPayload::CleanupJobs {} => {}
            JobPayload::DocumentExtraction {
                document_id,
                company_id,
                ..
            } => {
                non_nil("document_id", document_id)?;
                non_nil("company_id", company_id)?;
            }
            JobPayload::GenerateReport {
                report_id,
                company_id,
                format,
            } => {
                non_nil("report_id", report_id)?;
                non_nil("company_id", company_id)?;
                if !REPORT_FORMATS.contains(&format.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "unsupported report format: {format}"
                    )));
                }
            }
            JobPayload::ParseSpreadsheet {
                upload_id,
                company_id,
                ..
            } => {
                non_nil("upload_id", upload_id)?;
                non_nil("company_id", company_id)?;
            }
            JobPayload::PatternDiscovery { company_id, .. } => {
                non_nil("company_id", company_id)?;
            }
            JobPayload::SendReminder {
                obligation_id,
                user_id,
                ..
            } => {
                non_nil("obligation_id", obligation_id)?;
                non_nil("user_id", user_id)?;
            }
        }
        Ok(())
    }

    /// Decode a stored payload and check it matches the envelope's job type.
    pub fn decode(job_type: &str, value: &JsonValue) -> std::result::Result<Self, JobError> {
        let payload: JobPayload = serde_json::from_value(value.clone())?;
        if payload.job_type().as_str() != job_type {
            return Err(JobError::InvalidPayload(format!(
                "payload tagged {} does not match job type {job_type}",
                payload.job_type()
            )));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_tag_is_job_type_wire_name() {
        let payload = JobPayload::CheckDeadlines { company_id: None };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "CHECK_DEADLINES");
    }

    #[test]
    fn test_unit_like_variant_decodes_from_tag_only() {
        let payload = JobPayload::decode("DAILY_DIGEST", &json!({"type": "DAILY_DIGEST"})).unwrap();
        assert_eq!(payload, JobPayload::DailyDigest {});
        assert_eq!(payload.digest_type(), Some(DigestType::Daily));
    }

    #[test]
    fn test_process_notifications_default_batch_size() {
        let payload =
            JobPayload::decode("PROCESS_NOTIFICATIONS", &json!({"type": "PROCESS_NOTIFICATIONS"}))
                .unwrap();
        assert_eq!(
            payload,
            JobPayload::ProcessNotifications {
                batch_size: defaults::NOTIFICATION_BATCH_SIZE
            }
        );
    }

    #[test]
    fn test_decode_rejects_mismatched_type() {
        let err = JobPayload::decode("DAILY_DIGEST", &json!({"type": "WEEKLY_DIGEST"})).unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let err = JobPayload::decode(
            "DOCUMENT_EXTRACTION",
            &json!({"type": "DOCUMENT_EXTRACTION", "company_id": Uuid::new_v4()}),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));
    }

    #[test]
    fn test_validate_rejects_nil_ids() {
        let payload = JobPayload::DocumentExtraction {
            document_id: Uuid::nil(),
            company_id: Uuid::new_v4(),
            document_type: None,
        };
        assert!(matches!(payload.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_validate_report_format() {
        let ok = JobPayload::GenerateReport {
            report_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            format: "pdf".into(),
        };
        assert!(ok.validate().is_ok());

        let bad = JobPayload::GenerateReport {
            report_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            format: "docx".into(),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_validate_batch_size_bounds() {
        assert!(JobPayload::ProcessNotifications { batch_size: 0 }
            .validate()
            .is_err());
        assert!(JobPayload::ProcessNotifications { batch_size: 50 }
            .validate()
            .is_ok());
    }
}
