//! Bundle of store handles shared by every component.

use std::sync::Arc;

use comply_core::{
    DeadLetterStore, EscalationStore, JobQueue, JobStore, NotificationStore, PreferenceStore,
    RateLimitStore, ScheduleStore,
};
use comply_db::{Database, MemoryRateLimitStore, MemoryStore};

/// Trait-object handles to every store the orchestration core touches.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub escalations: Arc<dyn EscalationStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
}

impl Stores {
    /// Postgres stores from `db`, counters from `rate_limits`.
    pub fn postgres(db: &Database, rate_limits: Arc<dyn RateLimitStore>) -> Self {
        Self {
            jobs: Arc::new(db.jobs.clone()),
            queue: Arc::new(db.queue.clone()),
            dead_letters: Arc::new(db.dead_letters.clone()),
            schedules: Arc::new(db.schedules.clone()),
            notifications: Arc::new(db.notifications.clone()),
            preferences: Arc::new(db.preferences.clone()),
            escalations: Arc::new(db.escalations.clone()),
            rate_limits,
        }
    }

    /// Everything in process memory.
    pub fn memory() -> Self {
        Self::from_memory(MemoryStore::new(), MemoryRateLimitStore::new())
    }

    /// Wrap an existing in-memory backend, keeping the caller's handle to it.
    pub fn from_memory(store: MemoryStore, rate_limits: MemoryRateLimitStore) -> Self {
        Self {
            jobs: Arc::new(store.clone()),
            queue: Arc::new(store.clone()),
            dead_letters: Arc::new(store.clone()),
            schedules: Arc::new(store.clone()),
            notifications: Arc::new(store.clone()),
            preferences: Arc::new(store.clone()),
            escalations: Arc::new(store),
            rate_limits: Arc::new(rate_limits),
        }
    }
}
