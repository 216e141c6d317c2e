//! Job handlers and the context they run with.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use comply_core::{EnqueueOptions, Error, JobEnvelope, JobError, JobPayload, JobType, Result};

use crate::client::JobClient;

/// Receives (percent, message) progress reports from a running handler.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Outcome of a handler: optional result data, or a classified failure.
pub type JobResult = std::result::Result<Option<JsonValue>, JobError>;

/// Everything a handler sees about the job it is running.
pub struct JobContext {
    /// The claimed envelope.
    pub envelope: JobEnvelope,
    /// Decoded, typed payload.
    pub payload: JobPayload,
    /// 1-based attempt number of this run.
    pub attempt: i32,
    progress_callback: Option<ProgressCallback>,
    client: Option<JobClient>,
}

impl JobContext {
    pub fn new(envelope: JobEnvelope, payload: JobPayload, attempt: i32) -> Self {
        Self {
            envelope,
            payload,
            attempt,
            progress_callback: None,
            client: None,
        }
    }

    /// Forward progress reports to `callback`.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Allow the handler to enqueue follow-up jobs.
    pub fn with_client(mut self, client: JobClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.envelope.id
    }

    /// Best-effort progress, clamped to 0..=100. Never persisted.
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(callback) = &self.progress_callback {
            callback(percent.clamp(0, 100), message);
        }
    }

    /// Enqueue follow-up work on the payload's default queue.
    ///
    /// Unless `options` names an id, the follow-up id is derived from this
    /// job's id and the follow-up type, so a retried parent does not enqueue
    /// the same follow-up twice.
    pub async fn enqueue_followup(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::Internal("job context has no job client".into()))?;
        let job_type = payload.job_type();
        let options = match options.job_id {
            Some(_) => options,
            None => options.with_job_id(followup_id(self.envelope.id, job_type)),
        };
        client
            .enqueue(job_type.default_queue(), payload, options)
            .await
    }
}

/// Deterministic id of the `job_type` follow-up of `parent`.
pub fn followup_id(parent: Uuid, job_type: JobType) -> Uuid {
    Uuid::new_v5(&parent, job_type.as_str().as_bytes())
}

/// Body of one job type. Registered on a queue through the registry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Run one attempt. `Err` is classified by the retry engine.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// Completes immediately. Useful for wiring checks and tests.
pub struct NoOpHandler {
    job_type: JobType,
}

impl NoOpHandler {
    pub fn new(job_type: JobType) -> Self {
        Self { job_type }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        ctx.report_progress(50, None);
        ctx.report_progress(100, Some("no-op"));
        Ok(None)
    }
}
