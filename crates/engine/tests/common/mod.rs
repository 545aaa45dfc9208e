#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};
use tidepool_engine::{
    Frame, PoolConfig, PoolEvent, ScriptLocator, ScriptSpec, StreamEnvelope, WorkerScript,
};
use tokio::sync::broadcast;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Pool config tuned for tests: fast ticks, short grace windows.
pub fn test_config(workers: Vec<(&str, ScriptSpec)>) -> PoolConfig {
    PoolConfig {
        workers: workers
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect(),
        poll_interval: Duration::from_millis(5),
        cancel_grace: Duration::from_millis(25),
        metrics_interval: Duration::from_millis(50),
        health_check_interval: Duration::from_millis(100),
        shutdown_timeout: Duration::from_secs(2),
        ..PoolConfig::default()
    }
}

fn locator(name: &str) -> ScriptLocator {
    ScriptLocator::Url(format!("https://workers.test/{name}.worker.js"))
}

/// Async calculator: answers `sum` tasks with `a + b`.
pub fn calc_spec() -> ScriptSpec {
    ScriptSpec::new(locator("calc"), || {
        WorkerScript::spawned(|mut io| async move {
            io.send(Frame::WorkerReady);
            while let Some(frame) = io.recv().await {
                match frame {
                    Frame::StartTask { task_id, data } => {
                        let a = data.get("a").and_then(Value::as_i64).unwrap_or(0);
                        let b = data.get("b").and_then(Value::as_i64).unwrap_or(0);
                        io.send(Frame::TaskCompleted {
                            task_id,
                            result: json!(a + b),
                        });
                    }
                    Frame::Ping => io.send(Frame::Pong),
                    Frame::Terminate => break,
                    _ => {}
                }
            }
        })
    })
}

/// Sleeps `ms` (from the payload, default 50) per task before completing.
/// Not cancellation-aware: frames arriving mid-sleep wait their turn.
pub fn sleepy_spec() -> ScriptSpec {
    ScriptSpec::new(locator("sleepy"), || {
        WorkerScript::spawned(|mut io| async move {
            io.send(Frame::WorkerReady);
            while let Some(frame) = io.recv().await {
                match frame {
                    Frame::StartTask { task_id, data } => {
                        let ms = data.get("ms").and_then(Value::as_u64).unwrap_or(50);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        io.send(Frame::TaskCompleted {
                            task_id,
                            result: json!("slept"),
                        });
                    }
                    Frame::Terminate => break,
                    _ => {}
                }
            }
        })
    })
}

/// Emits a couple of progress frames, then completes.
pub fn progress_spec() -> ScriptSpec {
    ScriptSpec::new(locator("progress"), || {
        WorkerScript::spawned(|mut io| async move {
            io.send(Frame::WorkerReady);
            while let Some(frame) = io.recv().await {
                match frame {
                    Frame::StartTask { task_id, .. } => {
                        for pct in [25, 75] {
                            io.send(Frame::TaskProgress {
                                task_id: task_id.clone(),
                                progress: json!({ "pct": pct }),
                            });
                        }
                        io.send(Frame::TaskCompleted {
                            task_id,
                            result: json!("done"),
                        });
                    }
                    Frame::Terminate => break,
                    _ => {}
                }
            }
        })
    })
}

/// Panics on the first task it receives.
pub fn crasher_spec() -> ScriptSpec {
    ScriptSpec::new(locator("crasher"), || {
        WorkerScript::spawned(|mut io| async move {
            io.send(Frame::WorkerReady);
            while let Some(frame) = io.recv().await {
                match frame {
                    Frame::StartTask { .. } => panic!("worker script blew up"),
                    Frame::Terminate => break,
                    _ => {}
                }
            }
        })
    })
}

/// Echoes every stream message back on the same stream.
pub fn echo_stream_spec() -> ScriptSpec {
    ScriptSpec::new(locator("echo-stream"), || {
        WorkerScript::spawned(|mut io| async move {
            io.send(Frame::WorkerReady);
            while let Some(frame) = io.recv().await {
                match frame {
                    Frame::StreamInit(env) => {
                        io.send(Frame::StreamReady(StreamEnvelope::new(env.stream_id)));
                    }
                    Frame::StreamMessage(env) => {
                        let data = env.data.unwrap_or(Value::Null);
                        io.send(Frame::StreamMessage(
                            StreamEnvelope::new(env.stream_id).with_data(data),
                        ));
                    }
                    Frame::Terminate => break,
                    _ => {}
                }
            }
        })
    })
}

/// Blocking calculator running on a dedicated thread.
pub fn blocking_calc_spec() -> ScriptSpec {
    ScriptSpec::new(ScriptLocator::Path("workers/calc.worker.js".into()), || {
        WorkerScript::blocking(|mut io| {
            io.send(Frame::WorkerReady);
            while let Some(frame) = io.recv() {
                match frame {
                    Frame::StartTask { task_id, data } => {
                        let a = data.get("a").and_then(Value::as_i64).unwrap_or(0);
                        let b = data.get("b").and_then(Value::as_i64).unwrap_or(0);
                        io.send(Frame::TaskCompleted {
                            task_id,
                            result: json!(a + b),
                        });
                    }
                    Frame::Ping => io.send(Frame::Pong),
                    Frame::Terminate => break,
                    _ => {}
                }
            }
        })
    })
}

/// Polls a condition until it holds; panics after ~5 virtual seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Collects pool events until the predicate marks one as final.
pub async fn collect_events_until(
    rx: &mut broadcast::Receiver<PoolEvent>,
    mut is_last: impl FnMut(&PoolEvent) -> bool,
) -> Vec<PoolEvent> {
    let mut seen = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(30), rx.recv()).await {
            Ok(Ok(event)) => {
                let stop = is_last(&event);
                seen.push(event);
                if stop {
                    return seen;
                }
            }
            Ok(Err(err)) => panic!("event feed ended early ({err}); saw {seen:?}"),
            Err(_) => panic!("timed out waiting for events; saw {seen:?}"),
        }
    }
}
