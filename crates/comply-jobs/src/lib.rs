//! # comply-jobs
//!
//! Background job orchestration for comply.
//!
//! This crate provides:
//! - Priority-ordered queues with per-queue worker groups
//! - Cron-driven recurring triggers that collapse across processes
//! - Failure classification, backoff and idempotent dead-lettering
//! - Windowed rate limits per user, company and channel
//! - Notification delivery with preferences, digests and retries
//! - A leveled escalation engine for overdue entities
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use comply_jobs::{
//!     EnqueueOptions, JobPayload, JobType, NoOpHandler, QueueRegistry, Stores, WorkerConfig,
//! };
//!
//! let mut registry = QueueRegistry::new(Stores::memory(), WorkerConfig::default());
//! registry.register(Arc::new(NoOpHandler::new(JobType::CleanupJobs)));
//! registry.start().await?;
//!
//! registry
//!     .enqueue("maintenance", JobPayload::CleanupJobs {}, EnqueueOptions::new())
//!     .await?;
//!
//! let mut events = registry.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! registry.shutdown().await?;
//! ```

pub mod client;
pub mod escalation;
pub mod handler;
pub mod handlers;
pub mod notifications;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod stores;
pub mod worker;

// Re-export core types
pub use comply_core::*;

pub use client::{JobClient, JobDefaults};
pub use escalation::{EscalationEngine, EscalationOutcome, EscalationSummary};
pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler};
pub use handlers::{
    CheckDeadlinesHandler, CleanupJobsHandler, DigestHandler, ProcessNotificationsHandler,
};
pub use notifications::{
    BatchSummary, DeliveryOutcome, DigestBatcher, DigestSummary, HttpNotificationProvider,
    InAppProvider, NotificationPipeline, ProviderSet,
};
pub use rate_limiter::{RateLimitDecision, RateLimitScope, RateLimiter};
pub use registry::QueueRegistry;
pub use retry::{Disposition, ErrorClassifier, RetryEngine, RetryOutcome};
pub use scheduler::Scheduler;
pub use stores::Stores;
pub use worker::{QueueConfig, WorkerConfig, WorkerEvent};
