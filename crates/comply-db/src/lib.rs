//! # comply-db
//!
//! Storage backends for the comply job orchestration core.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL implementations of every store trait in `comply-core`
//! - Redis-backed windowed counters for the rate limiter
//! - An in-memory backend ([`MemoryStore`]) for tests and single-process runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use comply_db::{Database, JobQueue};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/comply").await?;
//!     db.migrate().await?;
//!
//!     let pending = db.queue.pending_count("notifications").await?;
//!     println!("{pending} notification jobs waiting");
//!     Ok(())
//! }
//! ```

pub mod dead_letters;
pub mod escalations;
pub mod jobs;
pub mod memory;
pub mod notifications;
pub mod pool;
pub mod preferences;
pub mod queue;
pub mod rate_limits;
pub mod schedules;

// Integration tests (in tests/) build migrated, isolated schemas through this
#[cfg(feature = "migrations")]
pub mod test_fixtures;

// Re-export core types
pub use comply_core::*;

pub use dead_letters::PgDeadLetterStore;
pub use escalations::PgEscalationStore;
pub use jobs::PgJobStore;
pub use memory::{MemoryRateLimitStore, MemoryStore};
pub use notifications::PgNotificationStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use preferences::PgPreferenceStore;
pub use queue::PgJobQueue;
pub use rate_limits::RedisRateLimitStore;
pub use schedules::PgScheduleStore;

/// Combined database context with all Postgres stores.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Audit records of job lifecycles.
    pub jobs: PgJobStore,
    /// Priority queue of job envelopes.
    pub queue: PgJobQueue,
    pub dead_letters: PgDeadLetterStore,
    /// Recurring cron triggers.
    pub schedules: PgScheduleStore,
    pub notifications: PgNotificationStore,
    pub preferences: PgPreferenceStore,
    /// Escalation records and per-company workflows.
    pub escalations: PgEscalationStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobStore::new(pool.clone()),
            queue: PgJobQueue::new(pool.clone()),
            dead_letters: PgDeadLetterStore::new(pool.clone()),
            schedules: PgScheduleStore::new(pool.clone()),
            notifications: PgNotificationStore::new(pool.clone()),
            preferences: PgPreferenceStore::new(pool.clone()),
            escalations: PgEscalationStore::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
