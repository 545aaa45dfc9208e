//! End-to-end task scheduling scenarios.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tidepool_engine::{start_pool, PoolError, PoolEvent, TaskOptions, TaskStatus};

use common::*;

#[tokio::test(start_paused = true)]
async fn submit_resolves_and_updates_stats() {
    init_tracing();
    let pool = start_pool(test_config(vec![("calc", calc_spec())]));

    pool.register_task_type("sum", "calc").await.unwrap();
    let handle = pool
        .submit_with(
            "sum",
            json!({"a": 2, "b": 3}),
            TaskOptions {
                timeout: Some(Duration::from_millis(1000)),
                ..TaskOptions::default()
            },
        )
        .await
        .unwrap();
    let task_id = handle.id().to_string();

    assert_eq!(handle.result().await.unwrap(), json!(5));
    assert_eq!(pool.status(&task_id).await, Some(TaskStatus::Completed));

    wait_until(|| pool.stats().completed == 1).await;
    let stats = pool.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.total_processed, 1);

    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn unmapped_task_type_falls_back_to_worker_type_name() {
    init_tracing();
    let pool = start_pool(test_config(vec![("calc", calc_spec())]));

    // No register_task_type: "calc" names a known worker type.
    let handle = pool.submit("calc", json!({"a": 4, "b": 1})).await.unwrap();
    assert_eq!(handle.result().await.unwrap(), json!(5));

    let err = pool.submit("weather", json!({})).await.unwrap_err();
    assert!(matches!(err, PoolError::UnknownWorkerType(t) if t == "weather"));

    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn timeout_applies_retry_policy_then_rejects() {
    init_tracing();
    let pool = start_pool(test_config(vec![("sleepy", sleepy_spec())]));
    let mut events = pool.subscribe();

    let handle = pool
        .submit_with(
            "sleepy",
            json!({"ms": 500}),
            TaskOptions {
                timeout: Some(Duration::from_millis(50)),
                max_retries: 1,
                ..TaskOptions::default()
            },
        )
        .await
        .unwrap();

    let err = handle.result().await.unwrap_err();
    assert!(matches!(err, PoolError::Timeout(_)), "got {err:?}");

    wait_until(|| pool.stats().failed == 1).await;
    assert_eq!(pool.stats().failed, 1);
    assert_eq!(pool.stats().completed, 0);

    // The unresponsive worker was terminated and replaced for the retry.
    let seen = collect_events_until(&mut events, |event| {
        matches!(event, PoolEvent::WorkerExited { .. })
    })
    .await;
    assert!(seen
        .iter()
        .any(|event| matches!(event, PoolEvent::WorkerExited { .. })));

    pool.shutdown(true).await;
}

#[tokio::test(start_paused = true)]
async fn cancel_queued_task_never_reaches_a_worker() {
    init_tracing();
    let mut config = test_config(vec![("sleepy", sleepy_spec())]);
    config.max_workers = 1;
    let pool = start_pool(config);

    let slow = pool.submit("sleepy", json!({"ms": 200})).await.unwrap();
    wait_until(|| pool.stats().running_tasks == 1).await;

    let queued = pool.submit("sleepy", json!({"ms": 200})).await.unwrap();
    let queued_id = queued.id().to_string();
    wait_until(|| pool.stats().queued_tasks == 1).await;

    assert!(pool.cancel(&queued_id).await);
    let err = queued.result().await.unwrap_err();
    assert_eq!(err, PoolError::Cancelled);
    assert_eq!(pool.status(&queued_id).await, Some(TaskStatus::Cancelled));

    // The running task is untouched.
    assert_eq!(slow.result().await.unwrap(), json!("slept"));

    let stats = pool.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cancelled, 1);

    // Cancelling a terminal task is a no-op.
    assert!(!pool.cancel(&queued_id).await);

    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn higher_priority_task_is_assigned_first() {
    init_tracing();
    let mut config = test_config(vec![("sleepy", sleepy_spec())]);
    config.max_workers = 1;
    let pool = start_pool(config);
    let mut events = pool.subscribe();

    let a = pool.submit("sleepy", json!({"ms": 100})).await.unwrap();
    wait_until(|| pool.stats().running_tasks == 1).await;

    let b = pool
        .submit_with("sleepy", json!({"ms": 10}), TaskOptions::default())
        .await
        .unwrap();
    let c = pool
        .submit_with(
            "sleepy",
            json!({"ms": 10}),
            TaskOptions {
                priority: 10,
                ..TaskOptions::default()
            },
        )
        .await
        .unwrap();

    let b_id = b.id().to_string();
    let c_id = c.id().to_string();

    a.result().await.unwrap();
    b.result().await.unwrap();
    c.result().await.unwrap();

    let started: Vec<String> = collect_events_until(&mut events, |event| {
        matches!(event, PoolEvent::TaskStarted { task_id, .. } if *task_id == b_id)
    })
    .await
    .into_iter()
    .filter_map(|event| match event {
        PoolEvent::TaskStarted { task_id, .. } => Some(task_id),
        _ => None,
    })
    .collect();

    let b_pos = started.iter().position(|id| *id == b_id).unwrap();
    let c_pos = started.iter().position(|id| *id == c_id).unwrap();
    assert!(c_pos < b_pos, "high priority started after low: {started:?}");

    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn worker_crash_fails_task_and_replaces_worker() {
    init_tracing();
    let mut config = test_config(vec![("crasher", crasher_spec())]);
    config.min_workers = 1;
    let pool = start_pool(config);
    let mut events = pool.subscribe();

    let handle = pool.submit("crasher", json!({})).await.unwrap();
    let err = handle.result().await.unwrap_err();
    assert!(matches!(err, PoolError::WorkerCrashed(_)), "got {err:?}");

    wait_until(|| pool.stats().failed == 1).await;

    // min_workers keeps the pool repopulated after the crash.
    let seen = collect_events_until(&mut events, |event| {
        matches!(event, PoolEvent::WorkerExited { .. })
    })
    .await;
    let created = seen
        .iter()
        .filter(|event| matches!(event, PoolEvent::WorkerCreated { .. }))
        .count();
    assert!(created >= 1);
    wait_until(|| pool.stats().worker_count >= 1).await;

    pool.shutdown(true).await;
}

#[tokio::test(start_paused = true)]
async fn crash_retry_exhausts_budget_and_rejects() {
    init_tracing();
    // First attempt crashes; the retry lands on a fresh worker that
    // crashes again, exhausting the budget.
    let pool = start_pool(test_config(vec![("crasher", crasher_spec())]));
    let handle = pool
        .submit_with(
            "crasher",
            json!({}),
            TaskOptions {
                max_retries: 1,
                ..TaskOptions::default()
            },
        )
        .await
        .unwrap();
    let err = handle.result().await.unwrap_err();
    assert!(matches!(err, PoolError::WorkerCrashed(_)));
    assert_eq!(pool.stats().failed, 1);

    pool.shutdown(true).await;
}

#[tokio::test(start_paused = true)]
async fn progress_reaches_subscriber_and_panics_are_isolated() {
    init_tracing();
    let pool = start_pool(test_config(vec![("progress", progress_spec())]));

    let seen = Arc::new(AtomicU32::new(0));
    let seen_cb = seen.clone();
    let handle = pool
        .submit_with(
            "progress",
            json!({}),
            TaskOptions {
                on_progress: Some(Arc::new(move |progress| {
                    seen_cb.fetch_add(1, Ordering::SeqCst);
                    if progress["pct"] == json!(75) {
                        panic!("subscriber exploded");
                    }
                })),
                ..TaskOptions::default()
            },
        )
        .await
        .unwrap();

    // The panicking subscriber never poisons the task.
    assert_eq!(handle.result().await.unwrap(), json!("done"));
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn queue_overflow_is_rejected() {
    init_tracing();
    let mut config = test_config(vec![("sleepy", sleepy_spec())]);
    config.max_workers = 1;
    config.max_queue_size = 1;
    let pool = start_pool(config);

    let running = pool.submit("sleepy", json!({"ms": 200})).await.unwrap();
    wait_until(|| pool.stats().running_tasks == 1).await;
    let queued = pool.submit("sleepy", json!({"ms": 10})).await.unwrap();

    let err = pool.submit("sleepy", json!({"ms": 10})).await.unwrap_err();
    assert!(matches!(err, PoolError::QueueFull { limit: 1, .. }), "got {err:?}");

    running.result().await.unwrap();
    queued.result().await.unwrap();
    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_live_task_ids_are_rejected() {
    init_tracing();
    let mut config = test_config(vec![("sleepy", sleepy_spec())]);
    config.max_workers = 1;
    let pool = start_pool(config);

    let options = TaskOptions {
        id: Some("job-42".to_string()),
        ..TaskOptions::default()
    };
    let first = pool
        .submit_with("sleepy", json!({"ms": 100}), options.clone())
        .await
        .unwrap();
    let err = pool
        .submit_with("sleepy", json!({"ms": 100}), options)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::DuplicateTaskId(id) if id == "job-42"));

    first.result().await.unwrap();
    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_loses_no_tasks() {
    init_tracing();
    let mut config = test_config(vec![("sleepy", sleepy_spec())]);
    config.max_workers = 2;
    let pool = start_pool(config);

    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(pool.submit("sleepy", json!({"ms": 20})).await.unwrap());
    }
    pool.shutdown(false).await;

    // Every awaiter resolves exactly once: completed, or rejected by the
    // shutdown; nothing hangs and nothing is silently dropped.
    let mut terminal = 0;
    for handle in handles {
        match handle.result().await {
            Ok(_) => terminal += 1,
            Err(PoolError::ShutdownInProgress | PoolError::Cancelled) => terminal += 1,
            Err(other) => panic!("unexpected terminal error: {other:?}"),
        }
    }
    assert_eq!(terminal, 8);

    let stats = pool.stats();
    assert_eq!(stats.total_processed, 8);
    assert_eq!(stats.queued_tasks, 0);
    assert_eq!(stats.running_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn forced_shutdown_rejects_running_tasks_and_kills_workers() {
    init_tracing();
    let mut config = test_config(vec![("sleepy", sleepy_spec())]);
    config.max_workers = 2;
    let pool = start_pool(config);
    let mut events = pool.subscribe();

    let a = pool.submit("sleepy", json!({"ms": 5000})).await.unwrap();
    let b = pool.submit("sleepy", json!({"ms": 5000})).await.unwrap();
    wait_until(|| pool.stats().running_tasks == 2).await;

    pool.shutdown(true).await;

    for handle in [a, b] {
        let err = handle.result().await.unwrap_err();
        assert!(
            matches!(err, PoolError::ShutdownInProgress | PoolError::Cancelled),
            "got {err:?}"
        );
    }
    assert_eq!(pool.stats().worker_count, 0);

    let seen = collect_events_until(&mut events, |event| matches!(event, PoolEvent::Shutdown)).await;
    assert!(matches!(seen.last(), Some(PoolEvent::Shutdown)));

    // Nothing further is emitted after the shutdown event.
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty
            | tokio::sync::broadcast::error::TryRecvError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn thread_backed_workers_serve_tasks() {
    init_tracing();
    let pool = start_pool(test_config(vec![("calc", blocking_calc_spec())]));

    pool.register_task_type("sum", "calc").await.unwrap();
    let handle = pool.submit("sum", json!({"a": 20, "b": 22})).await.unwrap();
    assert_eq!(handle.result().await.unwrap(), json!(42));

    let workers = pool.workers().await;
    assert!(!workers.is_empty());
    assert!(workers.iter().all(|w| w.worker_type == "calc"));

    pool.shutdown(false).await;
}
