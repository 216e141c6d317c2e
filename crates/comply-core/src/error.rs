//! Error types for comply.

use thiserror::Error;

/// Result type alias using comply's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for store, scheduler, and registry operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Redis error: {0}")]
    Redis(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Recurring schedule error (bad cron expression, unknown trigger)
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Redis(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

/// Failure raised by a job handler or a notification provider.
///
/// The variant carries the information the retry engine needs to decide
/// between another attempt and the dead-letter store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection refused/reset, DNS failure and similar.
    #[error("network error: {0}")]
    Network(String),

    /// Downstream HTTP service answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Downstream asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Payload failed validation or could not be decoded.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Recipient address is malformed for the channel.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// No handler is registered for the job type on this queue.
    #[error("unsupported job type: {0}")]
    UnsupportedJobType(String),

    /// Downstream permanently rejected the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Handler task panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Anything else; classified by message.
    #[error("{0}")]
    Other(String),
}

impl JobError {
    /// Build an `Other` error from anything displayable.
    pub fn other(e: impl std::fmt::Display) -> Self {
        JobError::Other(e.to_string())
    }
}

impl From<Error> for JobError {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidInput(msg) | Error::Serialization(msg) => JobError::InvalidPayload(msg),
            Error::Request(msg) => JobError::Network(msg),
            other => JobError::Other(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        JobError::InvalidPayload(e.to_string())
    }
}

impl From<reqwest::Error> for JobError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            JobError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            JobError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            JobError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("job 42".to_string());
        assert_eq!(err.to_string(), "Not found: job 42");
    }

    #[test]
    fn test_error_display_schedule() {
        let err = Error::Schedule("bad cron".to_string());
        assert_eq!(err.to_string(), "Schedule error: bad cron");
    }

    #[test]
    fn test_error_display_redis() {
        let err = Error::Redis("connection refused".to_string());
        assert_eq!(err.to_string(), "Redis error: connection refused");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_job_error_display_http() {
        let err = JobError::Http {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503: unavailable");
    }

    #[test]
    fn test_job_error_from_invalid_input() {
        let err: JobError = Error::InvalidInput("missing id".into()).into();
        assert_eq!(err, JobError::InvalidPayload("missing id".into()));
    }

    #[test]
    fn test_job_error_from_database_is_other() {
        let err: JobError = Error::Internal("boom".into()).into();
        assert!(matches!(err, JobError::Other(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
        assert_send::<JobError>();
        assert_sync::<JobError>();
    }
}
