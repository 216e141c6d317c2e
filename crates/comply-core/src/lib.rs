//! # comply-core
//!
//! Core types, traits, and defaults for the comply job orchestration core.
//!
//! Every other comply crate depends on this one. It carries no I/O: stores
//! and transports are expressed as traits in [`traits`] and implemented in
//! `comply-db` and `comply-jobs`.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;
pub mod uuid_utils;

pub use error::{Error, JobError, Result};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{escalation_notification_id, new_v7, recurring_firing_id, recurring_trigger_id};
