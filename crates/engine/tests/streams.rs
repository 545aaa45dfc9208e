//! End-to-end event stream scenarios.

mod common;

use std::time::Duration;

use serde_json::json;
use tidepool_engine::{start_pool, PoolError, StreamEvent, StreamOptions, StreamStatus};

use common::*;

#[tokio::test(start_paused = true)]
async fn stream_echo_preserves_order() {
    init_tracing();
    let pool = start_pool(test_config(vec![("stream", echo_stream_spec())]));

    let stream = pool.create_stream(StreamOptions::default()).await.unwrap();
    let mut events = stream.subscribe();

    // Wait for READY before asserting on message order.
    assert_eq!(events.recv().await.unwrap(), StreamEvent::Ready);

    for payload in ["x", "y", "z"] {
        stream.send(json!(payload)).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        match tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("echo in time")
            .unwrap()
        {
            StreamEvent::Message { data } => received.push(data),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(received, vec![json!("x"), json!("y"), json!("z")]);

    stream.close().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), StreamEvent::Closed);

    // Terminal: nothing further is ever delivered.
    stream.send(json!("after")).await.unwrap_err();
    assert!(matches!(
        tokio::time::timeout(Duration::from_millis(100), events.recv()).await,
        Err(_) | Ok(Err(_))
    ));

    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_follow_the_state_machine() {
    init_tracing();
    let pool = start_pool(test_config(vec![("stream", echo_stream_spec())]));

    let stream = pool.create_stream(StreamOptions::default()).await.unwrap();
    let mut events = stream.subscribe();
    assert_eq!(events.recv().await.unwrap(), StreamEvent::Ready);
    assert_eq!(stream.status().await, Some(StreamStatus::Active));

    // Resume requires paused.
    assert_eq!(stream.resume().await.unwrap_err(), PoolError::StreamNotActive);

    stream.pause().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), StreamEvent::Paused);
    assert_eq!(stream.status().await, Some(StreamStatus::Paused));

    // Sending and pausing again are both illegal while paused.
    assert_eq!(stream.send(json!("x")).await.unwrap_err(), PoolError::StreamNotActive);
    assert_eq!(stream.pause().await.unwrap_err(), PoolError::StreamNotActive);

    stream.resume().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), StreamEvent::Resumed);

    stream.send(json!("back")).await.unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        StreamEvent::Message { data: json!("back") }
    );

    // Close is idempotent.
    stream.close().await.unwrap();
    stream.close().await.unwrap();

    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn inactivity_timeout_errors_the_stream() {
    init_tracing();
    let pool = start_pool(test_config(vec![("stream", echo_stream_spec())]));

    let stream = pool
        .create_stream(StreamOptions {
            inactivity_timeout: Some(Duration::from_millis(100)),
            ..StreamOptions::default()
        })
        .await
        .unwrap();
    let mut events = stream.subscribe();
    assert_eq!(events.recv().await.unwrap(), StreamEvent::Ready);

    // No traffic: the stream errors out, then closes.
    match tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timeout fires")
        .unwrap()
    {
        StreamEvent::Error { error } => assert!(error.contains("timed out"), "got {error}"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(events.recv().await.unwrap(), StreamEvent::Closed);

    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn traffic_restarts_the_inactivity_window() {
    init_tracing();
    let pool = start_pool(test_config(vec![("stream", echo_stream_spec())]));

    let stream = pool
        .create_stream(StreamOptions {
            inactivity_timeout: Some(Duration::from_millis(200)),
            ..StreamOptions::default()
        })
        .await
        .unwrap();
    let mut events = stream.subscribe();
    assert_eq!(events.recv().await.unwrap(), StreamEvent::Ready);

    // Keep the stream warm past several windows.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(120)).await;
        stream.send(json!("keepalive")).await.unwrap();
        match events.recv().await.unwrap() {
            StreamEvent::Message { .. } => {}
            other => panic!("stream died early: {other:?}"),
        }
    }

    stream.close().await.unwrap();
    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn stream_requires_a_known_worker_type() {
    init_tracing();
    let pool = start_pool(test_config(vec![("stream", echo_stream_spec())]));

    let err = pool
        .create_stream(StreamOptions {
            worker_type: Some("weather".to_string()),
            ..StreamOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::UnknownWorkerType(t) if t == "weather"));

    pool.shutdown(false).await;
}

#[tokio::test(start_paused = true)]
async fn worker_exit_fails_bound_streams() {
    init_tracing();
    let pool = start_pool(test_config(vec![("stream", echo_stream_spec())]));

    let stream = pool.create_stream(StreamOptions::default()).await.unwrap();
    let mut events = stream.subscribe();
    assert_eq!(events.recv().await.unwrap(), StreamEvent::Ready);

    // Forced shutdown kills the hosting worker; subscribers observe the
    // failure followed by the close.
    pool.shutdown(true).await;

    let mut saw_terminal = false;
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        match event {
            StreamEvent::Error { .. } | StreamEvent::Closed => {
                saw_terminal = true;
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_terminal);
}
