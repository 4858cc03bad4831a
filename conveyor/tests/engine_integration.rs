//! End-to-end tests of the engine against the in-memory store.
//!
//! Covers the concurrency bound, backoff timing, stall recovery, retention,
//! stats consistency, store outages, dead-letter replay, queue independence,
//! panic isolation and graceful shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conveyor::{
    BackoffPolicy, EngineError, EnqueueOptions, JobEvent, JobEventPayload, JobId, JobRecord,
    JobState, JobStore, MemoryJobStore, ProcessorRegistry, QueueManager, QueueManagerBuilder,
    QueueName, QueueOptions,
};
use conveyor_testkit::{fast_config, payloads, wait_until, OutageStore, Outcome, ScriptedProcessor};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn engine(store: Arc<dyn JobStore>, queue: QueueName, options: QueueOptions) -> QueueManager {
    QueueManagerBuilder::new()
        .with_config(fast_config())
        .with_store(store)
        .with_queue(queue, options)
        .build()
        .expect("engine builds")
}

fn registry(queue: QueueName, processor: &ScriptedProcessor) -> ProcessorRegistry {
    ProcessorRegistry::new().with(queue, processor.clone())
}

async fn enqueue(manager: &QueueManager, queue: QueueName) -> JobId {
    manager
        .enqueue(queue, "test", payloads::for_queue(queue), EnqueueOptions::default())
        .await
        .expect("enqueue succeeds")
}

async fn wait_for_status(manager: &QueueManager, id: JobId, status: JobState) -> JobRecord {
    let reached = wait_until(WAIT, || async move {
        matches!(manager.job(id).await, Ok(Some(job)) if job.status == status)
    })
    .await;
    assert!(reached, "job {id} never reached {status}");
    manager.job(id).await.unwrap().unwrap()
}

fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_bound_is_respected() {
    let processor = ScriptedProcessor::new().with_delay(Duration::from_millis(100));
    let manager = engine(
        Arc::new(MemoryJobStore::new()),
        QueueName::Ai,
        QueueOptions::default().concurrency(2),
    );
    for _ in 0..8 {
        enqueue(&manager, QueueName::Ai).await;
    }

    manager.start(registry(QueueName::Ai, &processor)).await.unwrap();

    let manager_ref = &manager;
    let peak_active = &AtomicU64::new(0);
    let done = wait_until(WAIT, || async move {
        let stats = manager_ref.queue_stats(QueueName::Ai).await.unwrap();
        peak_active.fetch_max(stats.active, Ordering::SeqCst);
        stats.completed == 8
    })
    .await;
    assert!(done, "jobs did not complete");

    let peak_active = peak_active.load(Ordering::SeqCst);
    assert!(peak_active <= 2, "store reported {peak_active} active jobs");
    assert_eq!(processor.max_concurrency(), 2);
    processor.assert_call_count_eq(8);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_exponential_backoff_then_terminal_failure() {
    let processor = ScriptedProcessor::always(Outcome::Retryable("boom".into()));
    let manager = engine(
        Arc::new(MemoryJobStore::new()),
        QueueName::Email,
        QueueOptions::default()
            .max_attempts(3)
            .backoff(BackoffPolicy::exponential(100)),
    );
    let mut events = manager.subscribe();
    let id = enqueue(&manager, QueueName::Email).await;

    manager.start(registry(QueueName::Email, &processor)).await.unwrap();
    let job = wait_for_status(&manager, id, JobState::Failed).await;
    manager.shutdown().await;

    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("boom"));

    let calls = processor.calls_for(id);
    let attempts: Vec<u32> = calls.iter().map(|call| call.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    let first_gap = calls[1].started_at - calls[0].started_at;
    let second_gap = calls[2].started_at - calls[1].started_at;
    assert!(first_gap >= Duration::from_millis(95), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(195), "second gap {second_gap:?}");

    let retries = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event.payload, JobEventPayload::RetryScheduled { .. }))
        .count();
    assert_eq!(retries, 2);

    let dead = manager.dead_letters(QueueName::Email, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id, id);
}

#[tokio::test]
async fn test_permanent_error_skips_remaining_attempts() {
    let processor = ScriptedProcessor::always(Outcome::Permanent("bad payload".into()));
    let manager = engine(
        Arc::new(MemoryJobStore::new()),
        QueueName::Webhook,
        QueueOptions::default().max_attempts(5),
    );
    let mut events = manager.subscribe();
    let id = enqueue(&manager, QueueName::Webhook).await;

    manager.start(registry(QueueName::Webhook, &processor)).await.unwrap();
    let job = wait_for_status(&manager, id, JobState::Failed).await;
    manager.shutdown().await;

    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.last_error.as_deref(), Some("permanent: bad payload"));
    processor.assert_call_count_eq(1);

    let failed = drain(&mut events).into_iter().find_map(|event| match event.payload {
        JobEventPayload::Failed { permanent, attempt, .. } => Some((permanent, attempt)),
        _ => None,
    });
    assert_eq!(failed, Some((true, 1)));
}

#[tokio::test]
async fn test_stalled_job_is_requeued_once_and_completes() {
    let store = Arc::new(MemoryJobStore::new());
    let processor = ScriptedProcessor::new();
    let manager = engine(store.clone(), QueueName::Broadcast, QueueOptions::default());
    let mut events = manager.subscribe();
    let id = enqueue(&manager, QueueName::Broadcast).await;

    // An executor that claims the job and then dies without heartbeating.
    let orphan = store
        .claim(QueueName::Broadcast, "crashed-worker", Duration::ZERO)
        .await
        .unwrap()
        .expect("job claimed");
    assert_eq!(orphan.job_id(), id);

    manager.start(registry(QueueName::Broadcast, &processor)).await.unwrap();
    let job = wait_for_status(&manager, id, JobState::Completed).await;
    manager.shutdown().await;

    assert_eq!(job.attempts_made, 2);
    processor.assert_call_count_eq(1);
    assert_eq!(processor.calls()[0].attempt, 2);

    let stalled = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event.payload, JobEventPayload::Stalled { requeued: true }))
        .count();
    assert_eq!(stalled, 1);

    // The dead executor can no longer settle the job.
    let late = store
        .complete(&orphan, serde_json::Value::Null, &Default::default())
        .await
        .unwrap();
    assert!(!late.is_applied());
}

#[tokio::test]
async fn test_retention_keeps_newest_completed_jobs() {
    let processor = ScriptedProcessor::new();
    let manager = engine(
        Arc::new(MemoryJobStore::new()),
        QueueName::Broadcast,
        QueueOptions::default().keep_completed(3),
    );
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(enqueue(&manager, QueueName::Broadcast).await);
    }

    manager.start(registry(QueueName::Broadcast, &processor)).await.unwrap();
    let manager_ref = &manager;
    let processor_ref = &processor;
    let settled = wait_until(WAIT, || async move {
        let stats = manager_ref.queue_stats(QueueName::Broadcast).await.unwrap();
        processor_ref.call_count() == 8 && stats.waiting == 0 && stats.active == 0
    })
    .await;
    assert!(settled, "jobs did not settle");
    manager.shutdown().await;

    let stats = manager.queue_stats(QueueName::Broadcast).await.unwrap();
    assert_eq!(stats.completed, 3);
    for pruned in &ids[..5] {
        assert!(manager.job(*pruned).await.unwrap().is_none(), "job {pruned} should be pruned");
    }
    for kept in &ids[5..] {
        let job = manager.job(*kept).await.unwrap().expect("newest jobs kept");
        assert_eq!(job.status, JobState::Completed);
    }
}

#[tokio::test]
async fn test_stats_account_for_every_enqueued_job() {
    let processor = ScriptedProcessor::new()
        .with_delay(Duration::from_millis(10))
        .then(Outcome::Permanent("rejected".into()))
        .then(Outcome::Retryable("try later".into()));
    let manager = engine(
        Arc::new(MemoryJobStore::new()),
        QueueName::Analytics,
        QueueOptions::default().backoff(BackoffPolicy::fixed(60_000)),
    );
    for _ in 0..10 {
        enqueue(&manager, QueueName::Analytics).await;
    }
    assert_eq!(manager.queue_stats(QueueName::Analytics).await.unwrap().total(), 10);

    manager.start(registry(QueueName::Analytics, &processor)).await.unwrap();
    let manager_ref = &manager;
    let settled = wait_until(WAIT, || async move {
        let stats = manager_ref.queue_stats(QueueName::Analytics).await.unwrap();
        assert_eq!(stats.total(), 10, "counters drifted: {stats:?}");
        stats.waiting == 0 && stats.active == 0
    })
    .await;
    assert!(settled, "queue did not drain");
    manager.shutdown().await;

    let stats = manager.queue_stats(QueueName::Analytics).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.completed, 8);

    let snapshot = manager.all_stats().await.unwrap();
    assert_eq!(snapshot.get(QueueName::Analytics), Some(&stats));
}

#[tokio::test]
async fn test_store_outage_surfaces_and_recovers() {
    let store = OutageStore::in_memory();
    let processor = ScriptedProcessor::new();
    let manager = engine(Arc::new(store.clone()), QueueName::Email, QueueOptions::default());
    manager.start(registry(QueueName::Email, &processor)).await.unwrap();

    store.set_online(false);
    let err = manager
        .enqueue(QueueName::Email, "welcome", payloads::email("a@example.test"), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StoreUnavailable(_)));
    assert!(matches!(
        manager.queue_stats(QueueName::Email).await,
        Err(EngineError::StoreUnavailable(_))
    ));

    // executors keep polling and backing off while the store is down
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.rejected() > 2);

    store.set_online(true);
    let id = enqueue(&manager, QueueName::Email).await;
    wait_for_status(&manager, id, JobState::Completed).await;
    manager.shutdown().await;
    processor.assert_call_count_eq(1);
}

#[tokio::test]
async fn test_shutdown_releases_every_worker() {
    let store = OutageStore::in_memory();
    let processor = ScriptedProcessor::new();
    let manager = engine(
        Arc::new(store.clone()),
        QueueName::Webhook,
        QueueOptions::default().concurrency(2),
    );

    manager.start(registry(QueueName::Webhook, &processor)).await.unwrap();
    manager.shutdown().await;
    let first_run = store.released_workers();
    assert_eq!(first_run.len(), 2);

    manager.start(registry(QueueName::Webhook, &processor)).await.unwrap();
    manager.shutdown().await;
    let released = store.released_workers();
    assert_eq!(released.len(), 4);

    // each start gets fresh worker ids, and every one is released
    let mut distinct = released.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 4);
    assert!(released.iter().all(|id| id.starts_with("webhook-")));
}

#[tokio::test]
async fn test_dead_letter_replay_runs_job_again() {
    let processor = ScriptedProcessor::new().then(Outcome::Permanent("template missing".into()));
    let manager = engine(Arc::new(MemoryJobStore::new()), QueueName::Email, QueueOptions::default());
    let mut events = manager.subscribe();
    let id = enqueue(&manager, QueueName::Email).await;

    manager.start(registry(QueueName::Email, &processor)).await.unwrap();
    wait_for_status(&manager, id, JobState::Failed).await;

    let dead = manager.dead_letters(QueueName::Email, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error, "permanent: template missing");

    let replayed = manager.replay_dead_letter(QueueName::Email, id).await.unwrap();
    assert_ne!(replayed, id);
    let job = wait_for_status(&manager, replayed, JobState::Completed).await;
    assert_eq!(job.attempts_made, 1);

    assert!(manager.dead_letters(QueueName::Email, 10).await.unwrap().is_empty());
    assert!(matches!(
        manager.replay_dead_letter(QueueName::Email, id).await,
        Err(EngineError::DeadLetterNotFound { .. })
    ));
    // the original stays failed for inspection
    assert_eq!(manager.job(id).await.unwrap().unwrap().status, JobState::Failed);
    manager.shutdown().await;

    let replay_event = drain(&mut events).into_iter().find(|event| {
        matches!(event.payload, JobEventPayload::Replayed { original_job_id } if original_job_id == id)
    });
    assert_eq!(replay_event.map(|event| event.job_id()), Some(replayed));
}

#[tokio::test]
async fn test_queues_progress_independently() {
    let slow = ScriptedProcessor::new().with_delay(Duration::from_millis(800));
    let fast = ScriptedProcessor::new();
    let manager = QueueManagerBuilder::new()
        .with_config(fast_config())
        .with_store(Arc::new(MemoryJobStore::new()))
        .with_queue(QueueName::Email, QueueOptions::default().concurrency(1))
        .with_queue(QueueName::Cleanup, QueueOptions::default())
        .build()
        .unwrap();

    enqueue(&manager, QueueName::Email).await;
    enqueue(&manager, QueueName::Email).await;
    let cleanup = enqueue(&manager, QueueName::Cleanup).await;

    let processors = ProcessorRegistry::new()
        .with(QueueName::Email, slow.clone())
        .with(QueueName::Cleanup, fast.clone());
    manager.start(processors).await.unwrap();

    let started = tokio::time::Instant::now();
    wait_for_status(&manager, cleanup, JobState::Completed).await;
    assert!(started.elapsed() < Duration::from_millis(700));

    let email = manager.queue_stats(QueueName::Email).await.unwrap();
    assert_eq!(email.completed, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_processor_panic_is_retried() {
    let processor = ScriptedProcessor::new().then(Outcome::Panic("processor bug".into()));
    let manager = engine(
        Arc::new(MemoryJobStore::new()),
        QueueName::Cleanup,
        QueueOptions::default().backoff(BackoffPolicy::fixed(10)),
    );
    let first = enqueue(&manager, QueueName::Cleanup).await;

    manager.start(registry(QueueName::Cleanup, &processor)).await.unwrap();
    let job = wait_for_status(&manager, first, JobState::Completed).await;
    assert_eq!(job.attempts_made, 2);

    // the single executor survived the panic
    let second = enqueue(&manager, QueueName::Cleanup).await;
    wait_for_status(&manager, second, JobState::Completed).await;
    manager.shutdown().await;

    processor.assert_call_count_eq(3);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_job() {
    let processor = ScriptedProcessor::new().with_delay(Duration::from_millis(300));
    let manager = engine(Arc::new(MemoryJobStore::new()), QueueName::Ai, QueueOptions::default());
    let id = enqueue(&manager, QueueName::Ai).await;

    manager.start(registry(QueueName::Ai, &processor)).await.unwrap();
    assert!(matches!(
        manager.start(registry(QueueName::Ai, &processor)).await,
        Err(EngineError::AlreadyRunning)
    ));
    wait_for_status(&manager, id, JobState::Active).await;

    manager.shutdown().await;
    assert!(!manager.is_running().await);
    let job = manager.job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobState::Completed);

    // jobs enqueued after shutdown wait for the next start
    let later = enqueue(&manager, QueueName::Ai).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.job(later).await.unwrap().unwrap().status, JobState::Waiting);

    manager.start(registry(QueueName::Ai, &processor)).await.unwrap();
    wait_for_status(&manager, later, JobState::Completed).await;
    manager.shutdown().await;
}
