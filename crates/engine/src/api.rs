//! Public types and handles for the worker pool.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidepool_core::log::{LogEntry, LogLevel};
use tidepool_core::PoolError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::{PoolConfig, StreamOptions};
use crate::pool::{self, PoolCommand};
use crate::stream::EventStreamHandle;
use crate::transport::script::ScriptSpec;

/// Lifecycle state of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Spawned, waiting for `worker-ready`.
    Starting,
    /// Ready for work, nothing assigned.
    Idle,
    /// Executing an assigned task.
    Busy,
    /// Failed; next stop is termination.
    Error,
    /// Asked to exit, waiting for the context to go away.
    Terminating,
    /// Gone. Absorbing.
    Terminated,
    /// Not currently known to the pool.
    Unknown,
}

/// Lifecycle state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in its type's queue.
    Queued,
    /// Assigned to a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error (after exhausting retries).
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// True for the three terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Lifecycle state of one event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// `STREAM_INIT` sent, waiting for `STREAM_READY`.
    Initializing,
    /// Carrying traffic.
    Active,
    /// Suspended; no payloads delivered.
    Paused,
    /// Closed cleanly. Terminal.
    Closed,
    /// Failed. Terminal.
    Error,
}

impl StreamStatus {
    /// True for `Closed` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamStatus::Closed | StreamStatus::Error)
    }
}

/// What a stream delivers to its subscribers, in worker emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// The worker acknowledged the stream.
    Ready,
    /// One payload from the worker.
    Message {
        /// Frame payload.
        data: Value,
    },
    /// The stream was paused.
    Paused,
    /// The stream resumed.
    Resumed,
    /// The stream failed; `Closed` follows.
    Error {
        /// Failure description.
        error: String,
    },
    /// The stream is closed; nothing follows.
    Closed,
}

/// Progress subscriber for one task.
pub type ProgressFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Per-task submission options.
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Scheduling priority; higher runs first. Default 0.
    pub priority: i32,
    /// Per-attempt timeout. `None` uses the pool default; a zero duration
    /// disables the timer.
    pub timeout: Option<std::time::Duration>,
    /// Failed attempts are retried up to this many times. Default 0.
    pub max_retries: u32,
    /// Caller-chosen task id; generated when absent.
    pub id: Option<String>,
    /// Overrides task-type → worker-type resolution.
    pub worker_type: Option<String>,
    /// Receives `task-progress` payloads while the task runs. Panics in
    /// the subscriber are caught and logged; they never affect the task.
    pub on_progress: Option<ProgressFn>,
}

impl fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("id", &self.id)
            .field("worker_type", &self.worker_type)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Observability snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Worker id.
    pub worker_id: String,
    /// Worker type.
    pub worker_type: String,
    /// Current lifecycle state.
    pub status: WorkerStatus,
    /// Tasks currently assigned (0 or 1; workers run serially).
    pub active_tasks: usize,
    /// Tasks this worker completed.
    pub completed_tasks: u64,
    /// Errors attributed to this worker.
    pub errors: u64,
    /// Moving-average task duration, milliseconds.
    pub avg_task_duration_ms: f64,
    /// Milliseconds since the worker was created.
    pub uptime_ms: u64,
    /// Milliseconds since the worker last sent a frame.
    pub last_active_ms: u64,
}

/// Point-in-time pool counters. Recomputed on sampling, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Live workers across all types.
    pub worker_count: usize,
    /// Workers ready for work.
    pub idle: usize,
    /// Workers executing a task.
    pub busy: usize,
    /// Tasks waiting in queues.
    pub queued_tasks: usize,
    /// Tasks currently assigned.
    pub running_tasks: usize,
    /// Terminal counters since the pool started.
    pub completed: u64,
    /// Tasks that exhausted their retries.
    pub failed: u64,
    /// Tasks cancelled before completion.
    pub cancelled: u64,
    /// Sum of the three terminal counters.
    pub total_processed: u64,
    /// Mean task duration in milliseconds across completed tasks.
    pub avg_task_duration_ms: f64,
}

/// Public pool notifications, delivered over a broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PoolEvent {
    /// A task entered its queue.
    TaskQueued {
        /// Task id.
        task_id: String,
        /// Submitted task type.
        task_type: String,
        /// Worker type it resolved to.
        worker_type: String,
    },
    /// A task was assigned to a worker.
    TaskStarted {
        /// Task id.
        task_id: String,
        /// Assigned worker.
        worker_id: String,
    },
    /// A running task reported progress.
    TaskProgress {
        /// Task id.
        task_id: String,
        /// Progress payload.
        progress: Value,
    },
    /// A task completed successfully.
    TaskCompleted {
        /// Task id.
        task_id: String,
        /// Wall-clock duration of the final attempt, milliseconds.
        duration_ms: u64,
    },
    /// A task failed terminally.
    TaskFailed {
        /// Task id.
        task_id: String,
        /// Failure description.
        error: String,
    },
    /// A task was cancelled.
    TaskCancelled {
        /// Task id.
        task_id: String,
    },
    /// A worker was created.
    WorkerCreated {
        /// Worker id.
        worker_id: String,
        /// Worker type.
        worker_type: String,
    },
    /// A worker reported an error.
    WorkerError {
        /// Worker id.
        worker_id: String,
        /// Error description.
        error: String,
    },
    /// A worker's execution context exited.
    WorkerExited {
        /// Worker id.
        worker_id: String,
        /// Exit code.
        code: i32,
    },
    /// Periodic stats sample.
    Stats {
        /// The sample.
        stats: PoolStats,
    },
    /// The pool finished shutting down. Final event.
    Shutdown,
}

/// Awaitable handle for one submitted task.
///
/// Resolves exactly once, when the task reaches a terminal status.
/// Progress is never delivered here; subscribe via
/// [`TaskOptions::on_progress`].
#[derive(Debug)]
pub struct TaskHandle {
    pub(crate) task_id: String,
    pub(crate) rx: oneshot::Receiver<Result<Value, PoolError>>,
}

impl TaskHandle {
    /// Id of the submitted task.
    pub fn id(&self) -> &str {
        &self.task_id
    }

    /// Waits for the terminal status: the result payload on completion,
    /// the structured reason on failure, cancellation or timeout.
    pub async fn result(self) -> Result<Value, PoolError> {
        match self.rx.await {
            Ok(res) => res,
            Err(_) => Err(PoolError::ShutdownInProgress),
        }
    }
}

/// Handle to a running worker pool.
///
/// Cloneable; every clone talks to the same pool. The pool shuts down
/// gracefully when the last handle is dropped, or explicitly via
/// [`PoolHandle::shutdown`].
#[derive(Clone)]
pub struct PoolHandle {
    pub(crate) commands: mpsc::UnboundedSender<PoolCommand>,
    pub(crate) events: broadcast::Sender<PoolEvent>,
    pub(crate) stats: watch::Receiver<PoolStats>,
}

impl PoolHandle {
    /// Submits a task with default options.
    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        data: Value,
    ) -> Result<TaskHandle, PoolError> {
        self.submit_with(task_type, data, TaskOptions::default()).await
    }

    /// Submits a task. The returned handle resolves on terminal status;
    /// queueing errors (unknown type, full queue, shutdown) surface here.
    pub async fn submit_with(
        &self,
        task_type: impl Into<String>,
        data: Value,
        options: TaskOptions,
    ) -> Result<TaskHandle, PoolError> {
        let (awaiter_tx, awaiter_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PoolCommand::Submit {
            task_type: task_type.into(),
            data,
            options,
            awaiter: awaiter_tx,
            reply: reply_tx,
        })?;
        let task_id = reply_rx
            .await
            .map_err(|_| PoolError::ShutdownInProgress)??;
        Ok(TaskHandle {
            task_id,
            rx: awaiter_rx,
        })
    }

    /// Cancels a task. `true` when the cancellation took effect; `false`
    /// for unknown or already-terminal tasks.
    pub async fn cancel(&self, task_id: impl Into<String>) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .send(PoolCommand::Cancel {
                task_id: task_id.into(),
                reply: reply_tx,
            })
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Current status of a task, or `None` when it is unknown (or its
    /// terminal status already aged out of the recent window).
    pub async fn status(&self, task_id: impl Into<String>) -> Option<TaskStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PoolCommand::Status {
            task_id: task_id.into(),
            reply: reply_tx,
        })
        .ok()?;
        reply_rx.await.ok().flatten()
    }

    /// Maps a task type to the worker type that executes it.
    pub async fn register_task_type(
        &self,
        task_type: impl Into<String>,
        worker_type: impl Into<String>,
    ) -> Result<(), PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PoolCommand::RegisterTaskType {
            task_type: task_type.into(),
            worker_type: worker_type.into(),
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| PoolError::ShutdownInProgress)?
    }

    /// Registers a custom worker type. Fails on any name collision with a
    /// built-in or previously registered custom type.
    pub async fn register_custom_worker(
        &self,
        name: impl Into<String>,
        spec: ScriptSpec,
    ) -> Result<(), PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PoolCommand::RegisterWorker {
            name: name.into(),
            spec,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| PoolError::ShutdownInProgress)?
    }

    /// Opens a bidirectional event stream on a worker of the requested
    /// type.
    pub async fn create_stream(
        &self,
        options: StreamOptions,
    ) -> Result<EventStreamHandle, PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PoolCommand::CreateStream {
            options,
            reply: reply_tx,
        })?;
        let parts = reply_rx
            .await
            .map_err(|_| PoolError::ShutdownInProgress)??;
        Ok(EventStreamHandle::from_parts(parts, self.commands.clone()))
    }

    /// Latest stats snapshot.
    pub fn stats(&self) -> PoolStats {
        self.stats.borrow().clone()
    }

    /// Subscribes to the public event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Observability snapshots of every live worker.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .send(PoolCommand::Workers { reply: reply_tx })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Recent diagnostic log entries, newest last, optionally filtered by
    /// minimum level.
    pub async fn logs(&self, min_level: Option<LogLevel>) -> Vec<LogEntry> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .send(PoolCommand::Logs {
                min_level,
                reply: reply_tx,
            })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Shuts the pool down. Graceful shutdown waits for in-flight tasks
    /// (up to the configured window); `force` rejects them immediately
    /// and kills the workers. Always completes.
    pub async fn shutdown(&self, force: bool) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .send(PoolCommand::Shutdown {
                force,
                reply: reply_tx,
            })
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    fn send(&self, command: PoolCommand) -> Result<(), PoolError> {
        self.commands
            .send(command)
            .map_err(|_| PoolError::ShutdownInProgress)
    }
}

/// Starts a worker pool and returns its handle.
pub fn start_pool(config: PoolConfig) -> PoolHandle {
    pool::start(config)
}
