//! Pool configuration.

use std::time::Duration;

use serde_json::Value;

use crate::transport::script::ScriptSpec;

/// Configuration for one worker pool.
///
/// Zero durations and zero counts are normalized to the corresponding
/// `DEFAULT_*` values when the pool starts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker scripts available at startup, keyed by worker type. These
    /// entries form the pool's built-in registry; further types can be
    /// added later via `register_custom_worker`.
    pub workers: Vec<(String, ScriptSpec)>,

    /// Minimum workers kept alive per worker type.
    pub min_workers: usize,
    /// Maximum workers per worker type.
    pub max_workers: usize,
    /// How long an extra worker may sit idle before it is reaped.
    pub idle_timeout: Duration,

    /// Scheduler pass interval; also drives deadline sweeps.
    pub poll_interval: Duration,
    /// Bound of each per-type task queue.
    pub max_queue_size: usize,
    /// Default task timeout when the submitter does not set one.
    pub default_task_timeout: Duration,
    /// Window a worker gets to acknowledge a cancel before it is
    /// terminated and replaced.
    pub cancel_grace: Duration,
    /// Bound of each adapter's priority send queue.
    pub send_queue_limit: usize,
    /// Terminal statuses of this many recent tasks stay queryable.
    pub recent_tasks_max: usize,

    /// Stats sampling interval.
    pub metrics_interval: Duration,
    /// Worker health check interval.
    pub health_check_interval: Duration,
    /// A worker busy longer than this is suspected hung and marked errored.
    pub suspected_hang: Duration,
    /// Bound of the in-memory diagnostic log ring.
    pub max_log_entries: usize,
    /// Replace workers that enter the error state.
    pub auto_restart: bool,

    /// Reserve part of each pool for high-priority tasks.
    pub priority_allocation: Option<PriorityAllocation>,
    /// Utilization-driven scaling within `[min_workers, max_workers]`.
    pub scaling: Option<ScalingConfig>,

    /// Capacity of the public event broadcast channel.
    pub event_capacity: usize,
    /// How long a graceful shutdown waits for in-flight tasks before
    /// terminating workers forcibly.
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    /// Default per-type worker maximum.
    pub const DEFAULT_MAX_WORKERS: usize = 4;
    /// Default idle reaping threshold.
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default scheduler pass interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
    /// Default per-type queue bound.
    pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
    /// Default task timeout.
    pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default cancel acknowledgement window.
    pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(2);
    /// Default adapter send queue bound.
    pub const DEFAULT_SEND_QUEUE_LIMIT: usize = 64;
    /// Default retained terminal statuses.
    pub const DEFAULT_RECENT_TASKS_MAX: usize = 256;
    /// Default stats sampling interval.
    pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);
    /// Default health check interval.
    pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
    /// Default suspected-hang threshold.
    pub const DEFAULT_SUSPECTED_HANG: Duration = Duration::from_secs(120);
    /// Default log ring bound.
    pub const DEFAULT_MAX_LOG_ENTRIES: usize = 1000;
    /// Default public event channel capacity.
    pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
    /// Default graceful shutdown window.
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Normalizes zero values to defaults and clamps inconsistent bounds.
    pub(crate) fn normalize(&mut self) {
        if self.max_workers == 0 {
            self.max_workers = Self::DEFAULT_MAX_WORKERS;
        }
        if self.min_workers > self.max_workers {
            self.min_workers = self.max_workers;
        }
        if self.idle_timeout == Duration::ZERO {
            self.idle_timeout = Self::DEFAULT_IDLE_TIMEOUT;
        }
        if self.poll_interval == Duration::ZERO {
            self.poll_interval = Self::DEFAULT_POLL_INTERVAL;
        }
        if self.max_queue_size == 0 {
            self.max_queue_size = Self::DEFAULT_MAX_QUEUE_SIZE;
        }
        if self.default_task_timeout == Duration::ZERO {
            self.default_task_timeout = Self::DEFAULT_TASK_TIMEOUT;
        }
        if self.cancel_grace == Duration::ZERO {
            self.cancel_grace = Self::DEFAULT_CANCEL_GRACE;
        }
        if self.send_queue_limit == 0 {
            self.send_queue_limit = Self::DEFAULT_SEND_QUEUE_LIMIT;
        }
        if self.recent_tasks_max == 0 {
            self.recent_tasks_max = Self::DEFAULT_RECENT_TASKS_MAX;
        }
        if self.metrics_interval == Duration::ZERO {
            self.metrics_interval = Self::DEFAULT_METRICS_INTERVAL;
        }
        if self.health_check_interval == Duration::ZERO {
            self.health_check_interval = Self::DEFAULT_HEALTH_CHECK_INTERVAL;
        }
        if self.suspected_hang == Duration::ZERO {
            self.suspected_hang = Self::DEFAULT_SUSPECTED_HANG;
        }
        if self.max_log_entries == 0 {
            self.max_log_entries = Self::DEFAULT_MAX_LOG_ENTRIES;
        }
        if self.event_capacity == 0 {
            self.event_capacity = Self::DEFAULT_EVENT_CAPACITY;
        }
        if self.shutdown_timeout == Duration::ZERO {
            self.shutdown_timeout = Self::DEFAULT_SHUTDOWN_TIMEOUT;
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            min_workers: 0,
            max_workers: Self::DEFAULT_MAX_WORKERS,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_queue_size: Self::DEFAULT_MAX_QUEUE_SIZE,
            default_task_timeout: Self::DEFAULT_TASK_TIMEOUT,
            cancel_grace: Self::DEFAULT_CANCEL_GRACE,
            send_queue_limit: Self::DEFAULT_SEND_QUEUE_LIMIT,
            recent_tasks_max: Self::DEFAULT_RECENT_TASKS_MAX,
            metrics_interval: Self::DEFAULT_METRICS_INTERVAL,
            health_check_interval: Self::DEFAULT_HEALTH_CHECK_INTERVAL,
            suspected_hang: Self::DEFAULT_SUSPECTED_HANG,
            max_log_entries: Self::DEFAULT_MAX_LOG_ENTRIES,
            auto_restart: true,
            priority_allocation: None,
            scaling: None,
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Reserves a fraction of each worker pool for high-priority tasks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityAllocation {
    /// Fraction of `max_workers` reserved, in `0.0..=1.0`.
    pub reserved_fraction: f64,
    /// Tasks at or above this priority may use reserved workers.
    pub threshold: i32,
}

/// Utilization-driven worker scaling with hysteresis.
///
/// `scale_up_utilization` must sit above `scale_down_utilization`; the gap
/// keeps the pool from oscillating around a single threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingConfig {
    /// Busy fraction above which an extra worker is created (up to max).
    pub scale_up_utilization: f64,
    /// Busy fraction below which an idle worker is released (down to min).
    pub scale_down_utilization: f64,
}

/// Options for opening an event stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Worker type hosting the stream; defaults to the `stream` built-in.
    pub worker_type: Option<String>,
    /// Send priority of the opening `STREAM_INIT` frame.
    pub priority: i32,
    /// Payload attached to `STREAM_INIT`.
    pub initial_data: Option<Value>,
    /// Inactivity window after which the stream errors out; `None`
    /// disables the timer.
    pub inactivity_timeout: Option<Duration>,
    /// Drop the stream record (and its subscribers) once closed.
    /// Defaults to on.
    pub auto_cleanup: Option<bool>,
    /// Opaque metadata carried by the stream record.
    pub metadata: Option<Value>,
}

impl StreamOptions {
    pub(crate) fn auto_cleanup(&self) -> bool {
        self.auto_cleanup.unwrap_or(true)
    }
}
