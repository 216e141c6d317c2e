//! Notification delivery: preferences, rate limits, rendering, providers
//! and digests.

pub mod digest;
pub mod pipeline;
pub mod preferences;
pub mod provider;
pub mod render;

pub use digest::{DigestBatcher, DigestSummary};
pub use pipeline::{BatchSummary, DeliveryOutcome, NotificationPipeline};
pub use preferences::resolve_frequency;
pub use provider::{HttpNotificationProvider, InAppProvider, ProviderSet, SIGNATURE_HEADER};
pub use render::{render, render_digest, validate_recipient};
