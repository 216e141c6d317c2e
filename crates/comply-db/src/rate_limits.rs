//! Redis-backed windowed counters.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_ENABLED`: Set to "false" to use in-process counters (default: true)
//! - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use comply_core::defaults;
use comply_core::{CounterState, Error, RateLimitStore, Result};

/// Counters stored as Redis keys with a TTL equal to the window.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisRateLimitStore {
    /// Connect to `redis_url`. Failure here is a startup error.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Config(format!("invalid REDIS_URL: {e}")))?;
        let connection = ConnectionManager::new(client).await?;
        info!(
            subsystem = "db",
            component = "rate_limits",
            url = %redis_url.replace(|c: char| c.is_ascii_alphanumeric(), "*"),
            "Redis rate-limit store connected"
        );
        Ok(Self {
            connection,
            prefix: defaults::RATE_LIMIT_KEY_PREFIX.to_string(),
        })
    }

    /// Override the key prefix (tests use a random prefix per run).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn read(&self, key: &str) -> Result<Option<CounterState>> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        let (count, pttl): (Option<u64>, i64) = redis::pipe()
            .get(&key)
            .pttl(&key)
            .query_async(&mut conn)
            .await?;

        Ok(count.map(|count| CounterState {
            count,
            // -1 (no expiry) and -2 (gone) both read as zero; the limiter
            // then waits a full window.
            ttl: Duration::from_millis(pttl.max(0) as u64),
        }))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        // INCR and EXPIRE NX in one MULTI so the first increment always opens
        // the window and later ones never extend it.
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(window.as_secs().max(1))
            .arg("NX")
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}
