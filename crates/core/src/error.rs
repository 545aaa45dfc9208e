//! Structured error kinds shared across the pool runtime.

use std::time::Duration;

/// Terminal error reasons surfaced by the pool, its adapters and streams.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    /// No script is registered for the requested worker type.
    #[error("unknown worker type: {0}")]
    UnknownWorkerType(String),
    /// A built-in or custom worker type already uses this name.
    #[error("duplicate worker type: {0}")]
    DuplicateWorkerType(String),
    /// The per-type worker limit is already reached.
    #[error("worker limit reached for type {worker_type} (max {max})")]
    MaxWorkersExceeded {
        /// Worker type that is at its limit.
        worker_type: String,
        /// Configured maximum.
        max: usize,
    },
    /// Send attempted on an adapter after termination.
    #[error("worker {0} is terminated")]
    TerminatedWorker(String),
    /// The adapter's bounded priority send queue overflowed.
    #[error("send queue full on worker {0}")]
    SendQueueFull(String),
    /// The per-type task queue is at its bound.
    #[error("task queue full for worker type {worker_type} (limit {limit})")]
    QueueFull {
        /// Worker type whose queue overflowed.
        worker_type: String,
        /// Configured bound.
        limit: usize,
    },
    /// A task with this id is already tracked by the pool.
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),
    /// The task was cancelled before completion.
    #[error("task cancelled")]
    Cancelled,
    /// The task exceeded its timeout on every permitted attempt.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
    /// The worker reported a task failure.
    #[error("task failed: {0}")]
    TaskFailed(String),
    /// The worker crashed (panic or abnormal exit) while a task was assigned.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
    /// Stream operation attempted outside the `active` state.
    #[error("stream is not active")]
    StreamNotActive,
    /// The stream saw no traffic within its inactivity window.
    #[error("stream timed out")]
    StreamTimeout,
    /// The pool is shutting down and no longer accepts the operation.
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

/// Normalizes a panic payload into a printable message.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_handles_common_payloads() {
        let payloads: Vec<(Box<dyn std::any::Any + Send>, &str)> = vec![
            (Box::new("boom"), "boom"),
            (Box::new("boom".to_string()), "boom"),
            (Box::new(42u32), "unknown panic"),
        ];
        for (payload, expected) in payloads {
            assert_eq!(panic_message(payload.as_ref()), expected);
        }
    }
}
