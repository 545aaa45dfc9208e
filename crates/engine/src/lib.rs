#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Cross-environment worker pool runtime: task dispatch with priorities,
//! timeouts and retries, elastic per-type worker management, and
//! bidirectional event streams, over thread-backed or task-backed workers.

/// Public API for the pool runtime.
pub mod api;

mod adapter;
mod config;
mod dispatcher;
mod hub;
mod manager;
mod monitor;
mod pool;
mod queue;
mod registry;
mod stream;
mod stream_manager;
mod transport;

pub use api::{
    start_pool, PoolEvent, PoolHandle, PoolStats, ProgressFn, StreamEvent, StreamStatus,
    TaskHandle, TaskOptions, TaskStatus, WorkerInfo, WorkerStatus,
};
pub use config::{PoolConfig, PriorityAllocation, ScalingConfig, StreamOptions};
pub use registry::{WorkerRegistry, BUILTIN_WORKER_TYPES};
pub use stream::EventStreamHandle;
pub use transport::script::{AsyncScriptIo, ScriptIo, ScriptSpec, WorkerScript};

pub use tidepool_core::env::{RuntimeEnv, ScriptLocator};
pub use tidepool_core::log::{LogEntry, LogLevel};
pub use tidepool_core::{Frame, PoolError, StreamEnvelope, StreamKind};
