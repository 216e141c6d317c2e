//! Per-channel send limits over hourly windows.
//!
//! Counters live behind [`RateLimitStore`] (Redis in production). The limiter
//! fails open: if the counter backend is unreachable the send is allowed and
//! the failure is logged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use comply_core::defaults;
use comply_core::{Channel, RateLimitStore};

/// Who a counter is kept for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    User,
    Company,
    Global,
}

impl RateLimitScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitScope::User => "user",
            RateLimitScope::Company => "company",
            RateLimitScope::Global => "global",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Sends left in the current window; `None` when unlimited or unknown.
    pub remaining: Option<u64>,
    /// When denied, how long until the window resets.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: None,
            retry_after: None,
        }
    }
}

/// Hourly limit for a (channel, scope) pair. `None` means unlimited.
pub fn limit_for(channel: Channel, scope: RateLimitScope) -> Option<u64> {
    match (channel, scope) {
        (Channel::Email, RateLimitScope::User) => Some(defaults::EMAIL_LIMIT_USER),
        (Channel::Email, RateLimitScope::Company) => Some(defaults::EMAIL_LIMIT_COMPANY),
        (Channel::Email, RateLimitScope::Global) => Some(defaults::EMAIL_LIMIT_GLOBAL),
        (Channel::Sms, RateLimitScope::User) => Some(defaults::SMS_LIMIT_USER),
        (Channel::Sms, RateLimitScope::Company) => Some(defaults::SMS_LIMIT_COMPANY),
        (Channel::Sms, RateLimitScope::Global) => Some(defaults::SMS_LIMIT_GLOBAL),
        (Channel::InApp, _) => None,
    }
}

/// Windowed send limiter keyed by (channel, scope, subject).
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            window: Duration::from_secs(defaults::RATE_LIMIT_WINDOW_SECS),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    fn key(channel: Channel, scope: RateLimitScope, subject: &str) -> String {
        format!("{}:{}:{}", channel.as_str().to_lowercase(), scope, subject)
    }

    /// Whether one more send is permitted now.
    pub async fn check(
        &self,
        scope: RateLimitScope,
        subject: &str,
        channel: Channel,
    ) -> RateLimitDecision {
        let Some(limit) = limit_for(channel, scope) else {
            return RateLimitDecision::unlimited();
        };
        let key = Self::key(channel, scope, subject);

        match self.store.read(&key).await {
            Ok(None) => RateLimitDecision {
                allowed: true,
                remaining: Some(limit),
                retry_after: None,
            },
            Ok(Some(state)) if state.count < limit => RateLimitDecision {
                allowed: true,
                remaining: Some(limit - state.count),
                retry_after: None,
            },
            Ok(Some(state)) => {
                debug!(
                    subsystem = "notifications",
                    component = "rate_limiter",
                    key = %key,
                    count = state.count,
                    limit,
                    ttl_ms = state.ttl.as_millis() as u64,
                    "Rate limit reached"
                );
                // A counter with no TTL left is held for a whole window.
                let retry_after = if state.ttl.is_zero() {
                    self.window
                } else {
                    state.ttl
                };
                RateLimitDecision {
                    allowed: false,
                    remaining: Some(0),
                    retry_after: Some(retry_after),
                }
            }
            Err(e) => {
                warn!(
                    subsystem = "notifications",
                    component = "rate_limiter",
                    key = %key,
                    error = %e,
                    "Rate limit backend unavailable, allowing send"
                );
                RateLimitDecision::unlimited()
            }
        }
    }

    /// Count one send against the window.
    pub async fn record_usage(&self, scope: RateLimitScope, subject: &str, channel: Channel) {
        if limit_for(channel, scope).is_none() {
            return;
        }
        let key = Self::key(channel, scope, subject);
        if let Err(e) = self.store.increment(&key, self.window).await {
            warn!(
                subsystem = "notifications",
                component = "rate_limiter",
                key = %key,
                error = %e,
                "Failed to record rate limit usage"
            );
        }
    }

    /// Check user, company (when known) and global scopes together.
    ///
    /// Denied if any scope denies; `retry_after` is the longest wait.
    pub async fn check_all(
        &self,
        user_id: Uuid,
        company_id: Option<Uuid>,
        channel: Channel,
    ) -> RateLimitDecision {
        let mut combined = RateLimitDecision::unlimited();
        for (scope, subject) in scopes(user_id, company_id) {
            let decision = self.check(scope, &subject, channel).await;
            combined.remaining = match (combined.remaining, decision.remaining) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if !decision.allowed {
                combined.allowed = false;
                combined.retry_after = combined.retry_after.max(decision.retry_after);
            }
        }
        if combined.allowed {
            combined.retry_after = None;
        }
        combined
    }

    /// Count one send against every scope of `check_all`.
    pub async fn record_all(&self, user_id: Uuid, company_id: Option<Uuid>, channel: Channel) {
        for (scope, subject) in scopes(user_id, company_id) {
            self.record_usage(scope, &subject, channel).await;
        }
    }
}

fn scopes(user_id: Uuid, company_id: Option<Uuid>) -> Vec<(RateLimitScope, String)> {
    let mut scopes = vec![(RateLimitScope::User, user_id.to_string())];
    if let Some(company_id) = company_id {
        scopes.push((RateLimitScope::Company, company_id.to_string()));
    }
    scopes.push((RateLimitScope::Global, "all".to_string()));
    scopes
}
