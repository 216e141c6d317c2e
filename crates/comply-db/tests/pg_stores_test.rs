//! Integration tests for the PostgreSQL and Redis stores.
//!
//! **IMPORTANT**: These tests require PostgreSQL (and Redis for the counter
//! test). Run with `cargo test -p comply-db -- --ignored`.

use chrono::{Duration, Utc};
use uuid::Uuid;

use comply_db::test_fixtures::{TestDatabase, DEFAULT_TEST_REDIS_URL};
use comply_db::{
    recurring_trigger_id, Channel, DeadLetterEntry, DeadLetterOrigin, DeadLetterStore, DigestType,
    EntityRef, EscalationStore, EscalationTransition, JobEnvelope, JobPayload, JobQueue,
    JobRecord, JobStatus, JobStore, NotificationRecord, NotificationStatus, NotificationStore,
    Priority, RateLimitStore, Recipient, RecurringTrigger, RedisRateLimitStore, ScheduleStore,
    SYSTEM_WORKFLOW_ID,
};

fn envelope(priority: Priority) -> JobEnvelope {
    JobEnvelope::new(
        Uuid::now_v7(),
        "maintenance",
        &JobPayload::CleanupJobs {},
        priority,
        Utc::now(),
    )
    .unwrap()
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_queue_claims_priority_then_fifo() {
    let test_db = TestDatabase::new().await;
    let queue = &test_db.db.queue;

    let bulk = envelope(Priority::Bulk);
    let first = envelope(Priority::Normal);
    let second = envelope(Priority::Normal);
    let critical = envelope(Priority::Critical);
    for env in [&bulk, &first, &second, &critical] {
        assert!(queue.push(env).await.unwrap());
    }
    assert!(!queue.push(&first).await.unwrap());

    let now = Utc::now() + Duration::seconds(1);
    let mut order = Vec::new();
    while let Some(env) = queue.claim_next("maintenance", now).await.unwrap() {
        order.push(env.id);
    }
    assert_eq!(order, vec![critical.id, first.id, second.id, bulk.id]);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_concurrent_claims_never_share_an_envelope() {
    let test_db = TestDatabase::new().await;
    for _ in 0..20 {
        test_db.db.queue.push(&envelope(Priority::Normal)).await.unwrap();
    }

    let now = Utc::now() + Duration::seconds(1);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let queue = test_db.db.queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(env) = queue.claim_next("maintenance", now).await.unwrap() {
                claimed.push(env.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 20);
    assert_eq!(all.len(), 20);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_job_record_terminal_status_is_final() {
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let env = envelope(Priority::Normal);
    let record = JobRecord::for_envelope(&env);

    assert!(jobs.create(&record).await.unwrap());
    jobs.mark_processing(record.id, 1).await.unwrap();
    jobs.mark_completed(record.id, None).await.unwrap();
    jobs.mark_failed(record.id, 1, "late failure").await.unwrap();

    let stored = jobs.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(jobs.mark_failed(Uuid::new_v4(), 1, "x").await.is_err());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_dead_letter_written_once_per_origin() {
    let test_db = TestDatabase::new().await;
    let store = &test_db.db.dead_letters;
    let origin_id = Uuid::new_v4();
    let entry = DeadLetterEntry {
        id: Uuid::now_v7(),
        origin: DeadLetterOrigin::Notification,
        origin_id,
        origin_type: "deadline_reminder".into(),
        queue: None,
        payload: serde_json::json!({"channel": "EMAIL"}),
        error: "HTTP 400: bad address".into(),
        retry_count: 0,
        created_at: Utc::now(),
        replayed_at: None,
    };

    assert!(store.insert_once(&entry).await.unwrap());
    let dup = DeadLetterEntry {
        id: Uuid::now_v7(),
        ..entry.clone()
    };
    assert!(!store.insert_once(&dup).await.unwrap());

    let found = store
        .find_by_origin(DeadLetterOrigin::Notification, origin_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, entry.id);
    assert!(store.mark_replayed(entry.id, Utc::now()).await.unwrap());
    assert!(!store.mark_replayed(entry.id, Utc::now()).await.unwrap());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_schedule_advance_is_compare_and_set() {
    let test_db = TestDatabase::new().await;
    let store = &test_db.db.schedules;
    let now = Utc::now();
    let trigger = RecurringTrigger {
        id: recurring_trigger_id("CHECK_DEADLINES"),
        job_type: "CHECK_DEADLINES".into(),
        queue: "escalations".into(),
        cron: "0 0 * * * *".into(),
        payload: serde_json::json!({"type": "CHECK_DEADLINES"}),
        next_run_at: now,
        last_run_at: None,
        enabled: true,
        updated_at: now,
    };
    store.upsert(&trigger).await.unwrap();

    let next = now + Duration::hours(1);
    assert!(store.advance(trigger.id, now, next, now).await.unwrap());
    assert!(!store.advance(trigger.id, now, next, now).await.unwrap());

    // Re-registering the same cron keeps the advanced next_run_at.
    let stored = store.upsert(&trigger).await.unwrap();
    assert_eq!(stored.next_run_at.timestamp(), next.timestamp());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_notification_transitions_are_guarded() {
    let test_db = TestDatabase::new().await;
    let store = &test_db.db.notifications;
    let n = NotificationRecord::new(
        Recipient::user(Uuid::new_v4()),
        "deadline_reminder",
        Channel::Email,
        "Due soon",
        "Your obligation is due",
    );
    store.insert(&n).await.unwrap();

    assert!(store.mark_sent(n.id, "p-1", Utc::now()).await.is_err());
    store.mark_sending(n.id).await.unwrap();
    store.mark_sent(n.id, "p-1", Utc::now()).await.unwrap();
    assert!(store.mark_sending(n.id).await.is_err());

    let stored = store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Sent);
    assert_eq!(stored.delivery.provider_id.as_deref(), Some("p-1"));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_digest_marks_only_queued_members() {
    let test_db = TestDatabase::new().await;
    let store = &test_db.db.notifications;
    let user = Uuid::new_v4();
    let a = NotificationRecord::new(Recipient::user(user), "t", Channel::Email, "a", "a");
    let b = NotificationRecord::new(Recipient::user(user), "t", Channel::Email, "b", "b");
    for n in [&a, &b] {
        store.insert(n).await.unwrap();
        store.mark_queued(n.id, DigestType::Daily).await.unwrap();
    }
    store.mark_cancelled(b.id, "user opted out").await.unwrap();

    let since = Utc::now() - Duration::days(1);
    let queued = store.list_queued(DigestType::Daily, since).await.unwrap();
    assert_eq!(queued.len(), 1);

    let marked = store
        .mark_digest_sent(&[a.id, b.id], "digest-1", Utc::now())
        .await
        .unwrap();
    assert_eq!(marked, 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_expired_sending_lease_is_recovered() {
    let test_db = TestDatabase::new().await;
    let store = &test_db.db.notifications;
    let now = Utc::now();
    let n = NotificationRecord::new(Recipient::user(Uuid::new_v4()), "t", Channel::Sms, "s", "b")
        .with_created_at(now);
    store.insert(&n).await.unwrap();
    let lease = now + Duration::minutes(5);
    assert_eq!(store.claim_due(10, now, lease).await.unwrap().len(), 1);
    store.mark_sending(n.id).await.unwrap();

    assert_eq!(store.recover_sending(now, "lease expired").await.unwrap(), 0);
    let later = lease + Duration::seconds(1);
    assert_eq!(store.recover_sending(later, "lease expired").await.unwrap(), 1);

    let stored = store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Retrying);
    assert_eq!(stored.locked_until, None);
    assert_eq!(store.claim_due(10, later, later + Duration::minutes(5)).await.unwrap().len(), 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_escalation_advance_loses_stale_cas() {
    let test_db = TestDatabase::new().await;
    let store = &test_db.db.escalations;
    let entity = EntityRef::new("obligation", Uuid::new_v4());
    let user = Uuid::new_v4();
    let transition = EscalationTransition {
        entity: entity.clone(),
        company_id: Uuid::new_v4(),
        site_id: None,
        workflow_id: SYSTEM_WORKFLOW_ID,
        cycle: 0,
        from_level: 0,
        to_level: 1,
        recipients: vec![user],
        at: Utc::now(),
    };
    let n = NotificationRecord::new(Recipient::user(user), "escalation", Channel::InApp, "s", "b")
        .with_entity("obligation", entity.entity_id)
        .with_escalation_level(1);

    assert!(store.advance(&transition, &[n.clone()]).await.unwrap());
    assert!(!store.advance(&transition, &[n]).await.unwrap());

    let record = store.get(&entity).await.unwrap().unwrap();
    assert_eq!(record.current_level, 1);
    assert_eq!(
        test_db
            .db
            .notifications
            .list_for_entity("obligation", entity.entity_id)
            .await
            .unwrap()
            .len(),
        1
    );

    assert!(store.reset(&entity).await.unwrap());
    let record = store.get(&entity).await.unwrap().unwrap();
    assert_eq!((record.current_level, record.cycle), (0, 1));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_counter_opens_window_once() {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_TEST_REDIS_URL.to_string());
    let store = RedisRateLimitStore::connect(&url)
        .await
        .unwrap()
        .with_prefix(format!("comply:test:{}:", Uuid::new_v4().simple()));
    let window = std::time::Duration::from_secs(3600);

    assert!(store.read("email:user:1").await.unwrap().is_none());
    assert_eq!(store.increment("email:user:1", window).await.unwrap(), 1);
    assert_eq!(store.increment("email:user:1", window).await.unwrap(), 2);

    let state = store.read("email:user:1").await.unwrap().unwrap();
    assert_eq!(state.count, 2);
    assert!(state.ttl <= window);
    assert!(state.ttl > std::time::Duration::from_secs(3500));
}
