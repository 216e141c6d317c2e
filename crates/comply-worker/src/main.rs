//! comply-worker - background job process for the compliance platform.
//!
//! Connects to Postgres (and Redis for rate-limit counters), registers the
//! built-in handlers and their recurring triggers, then runs worker groups
//! until ctrl-c.

mod domain;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comply_core::{defaults, JobPayload, JobType, NotificationProvider, RateLimitStore};
use comply_db::{log_pool_metrics, Database, MemoryRateLimitStore, PoolConfig, RedisRateLimitStore};
use comply_jobs::{
    CheckDeadlinesHandler, CleanupJobsHandler, DigestBatcher, DigestHandler, EscalationEngine,
    HttpNotificationProvider, NotificationPipeline, ProcessNotificationsHandler, ProviderSet,
    QueueRegistry, RateLimiter, Stores, WorkerConfig, WorkerEvent,
};

use domain::{ViewOverdueSource, ViewRecipientResolver};

/// Recurring triggers: job type, override variable, default cron.
const SCHEDULES: &[(JobType, &str, &str)] = &[
    (JobType::CheckDeadlines, "CRON_CHECK_DEADLINES", "0 * * * *"),
    (JobType::ProcessNotifications, "CRON_PROCESS_NOTIFICATIONS", "* * * * *"),
    (JobType::DailyDigest, "CRON_DAILY_DIGEST", "0 7 * * *"),
    (JobType::WeeklyDigest, "CRON_WEEKLY_DIGEST", "0 7 * * Mon"),
    (JobType::CleanupJobs, "CRON_CLEANUP_JOBS", "30 3 * * *"),
];

/// Initialize tracing.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "comply=info")
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "comply=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("comply-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Redis counters unless `REDIS_ENABLED=false`.
async fn rate_limit_store() -> anyhow::Result<Arc<dyn RateLimitStore>> {
    let enabled = std::env::var("REDIS_ENABLED")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);
    if !enabled {
        warn!("REDIS_ENABLED=false, rate limits are counted per process");
        return Ok(Arc::new(MemoryRateLimitStore::new()));
    }
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| defaults::REDIS_URL.to_string());
    Ok(Arc::new(RedisRateLimitStore::connect(&url).await?))
}

fn payload_for(job_type: JobType, batch_size: i64) -> Option<JobPayload> {
    match job_type {
        JobType::CheckDeadlines => Some(JobPayload::CheckDeadlines { company_id: None }),
        JobType::ProcessNotifications => Some(JobPayload::ProcessNotifications { batch_size }),
        JobType::DailyDigest => Some(JobPayload::DailyDigest {}),
        JobType::WeeklyDigest => Some(JobPayload::WeeklyDigest {}),
        JobType::CleanupJobs => Some(JobPayload::CleanupJobs {}),
        _ => None,
    }
}

/// Log worker events that need operator attention.
fn log_events(registry: &QueueRegistry) {
    let mut events = registry.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::JobDeadLettered {
                    job_id,
                    job_type,
                    dead_letter_id,
                    error,
                }) => {
                    warn!(%job_id, %job_type, %dead_letter_id, %error, "Job dead-lettered");
                }
                Ok(event) => debug!(?event, "Worker event"),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| defaults::DATABASE_URL.to_string());
    let batch_size: i64 = std::env::var("NOTIFICATION_BATCH_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults::NOTIFICATION_BATCH_SIZE);

    info!("Connecting to database...");
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env()).await?;
    info!("Database connected");

    info!("Running database migrations...");
    db.migrate().await?;
    info!("Database migrations complete");

    let stores = Stores::postgres(&db, rate_limit_store().await?);
    let worker_config = WorkerConfig::from_env();
    let job_timeout_secs = worker_config.job_timeout_secs;
    let mut registry = QueueRegistry::new(stores.clone(), worker_config);

    let gateway = HttpNotificationProvider::from_env()?
        .map(|g| Arc::new(g) as Arc<dyn NotificationProvider>);
    if gateway.is_none() {
        warn!("NOTIFICATION_GATEWAY_URL not set, email and SMS notifications will fail");
    }
    let providers = ProviderSet::standard(gateway);
    let rate_limiter = RateLimiter::new(stores.rate_limits.clone());

    let pipeline = NotificationPipeline::new(
        stores.notifications.clone(),
        stores.preferences.clone(),
        rate_limiter.clone(),
        providers.clone(),
        registry.retry(),
    );
    let batcher = DigestBatcher::new(stores.notifications.clone(), rate_limiter, providers);
    let engine = EscalationEngine::new(
        stores.escalations.clone(),
        Arc::new(ViewOverdueSource::from_env(db.pool.clone())?),
        Arc::new(ViewRecipientResolver::from_env(db.pool.clone())?),
    );

    registry
        .register(Arc::new(ProcessNotificationsHandler::new(pipeline)))
        .register(Arc::new(DigestHandler::daily(batcher.clone())))
        .register(Arc::new(DigestHandler::weekly(batcher)))
        .register(Arc::new(CheckDeadlinesHandler::new(engine)))
        .register(Arc::new(
            CleanupJobsHandler::new(stores.queue.clone()).with_job_timeout(job_timeout_secs),
        ));

    for (job_type, var, default_cron) in SCHEDULES {
        let cron = std::env::var(var).unwrap_or_else(|_| default_cron.to_string());
        let Some(payload) = payload_for(*job_type, batch_size) else {
            continue;
        };
        let trigger = registry
            .schedule_recurring(*job_type, job_type.default_queue(), &cron, payload)
            .await?;
        info!(
            job_type = job_type.as_str(),
            cron = %trigger.cron,
            next_run_at = %trigger.next_run_at,
            "Recurring trigger registered"
        );
    }

    log_events(&registry);
    let pool = db.pool.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            log_pool_metrics(&pool);
        }
    });
    registry.start().await?;
    let queues: Vec<String> = registry.queues().into_iter().map(|q| q.name).collect();
    info!(queues = ?queues, "comply-worker running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    registry.shutdown().await?;
    info!("comply-worker stopped");
    Ok(())
}
