//! Task dispatcher: queues, assignment, timeouts, retries, cancellation.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde_json::Value;
use tidepool_core::error::panic_message;
use tidepool_core::ids::IdGenerator;
use tidepool_core::log::{LogEntry, LogLevel};
use tidepool_core::{Frame, PoolError};
use tokio::sync::oneshot;

use crate::api::{PoolEvent, ProgressFn, TaskOptions, TaskStatus};
use crate::config::PriorityAllocation;
use crate::hub::EventHub;
use crate::manager::{manager_of, WorkerManager};
use crate::queue::{QueueItem, TaskQueue};
use crate::registry::WorkerRegistry;

#[derive(Debug, Clone)]
pub(crate) struct DispatcherConfig {
    pub(crate) default_timeout: Duration,
    pub(crate) cancel_grace: Duration,
    pub(crate) max_queue_size: usize,
    pub(crate) recent_max: usize,
    pub(crate) priority_allocation: Option<PriorityAllocation>,
}

struct TaskRecord {
    task_id: String,
    task_type: String,
    worker_type: String,
    data: Value,
    status: TaskStatus,
    priority: i32,
    seq: u64,
    started_at: Option<Instant>,
    worker_id: Option<String>,
    /// Resolved per-attempt timeout; `None` disables the timer.
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    max_retries: u32,
    attempts: u32,
    on_progress: Option<ProgressFn>,
    awaiter: Option<oneshot::Sender<Result<Value, PoolError>>>,
}

/// A worker that was sent `cancel-task` and owes the pool an
/// acknowledgement before its grace deadline.
struct PendingRelease {
    deadline: Instant,
    task_id: String,
}

pub(crate) struct TaskDispatcher {
    cfg: DispatcherConfig,
    task_types: HashMap<String, String>,
    /// Worker types in first-registration order; assignment ties between
    /// types break in this order.
    type_order: Vec<String>,
    queues: HashMap<String, TaskQueue>,
    tasks: HashMap<String, TaskRecord>,
    recent: HashMap<String, TaskStatus>,
    recent_order: VecDeque<String>,
    pending_releases: HashMap<String, PendingRelease>,
    seq: u64,
    shutting_down: bool,

    completed: u64,
    failed: u64,
    cancelled: u64,
    duration_total_ms: f64,
}

impl TaskDispatcher {
    pub(crate) fn new(cfg: DispatcherConfig) -> Self {
        Self {
            cfg,
            task_types: HashMap::new(),
            type_order: Vec::new(),
            queues: HashMap::new(),
            tasks: HashMap::new(),
            recent: HashMap::new(),
            recent_order: VecDeque::new(),
            pending_releases: HashMap::new(),
            seq: 0,
            shutting_down: false,
            completed: 0,
            failed: 0,
            cancelled: 0,
            duration_total_ms: 0.0,
        }
    }

    pub(crate) fn register_task_type(&mut self, task_type: String, worker_type: String) {
        self.task_types.insert(task_type, worker_type);
    }

    fn resolve_worker_type(
        &self,
        task_type: &str,
        options: &TaskOptions,
        registry: &WorkerRegistry,
    ) -> Result<String, PoolError> {
        let worker_type = if let Some(explicit) = &options.worker_type {
            explicit.clone()
        } else if let Some(mapped) = self.task_types.get(task_type) {
            mapped.clone()
        } else if registry.contains(task_type) {
            // An unmapped task type naming a known worker type uses that
            // worker type implicitly.
            task_type.to_string()
        } else {
            return Err(PoolError::UnknownWorkerType(task_type.to_string()));
        };
        registry.get(&worker_type)?;
        Ok(worker_type)
    }

    /// Queues one task. Returns its id and the worker type it resolved
    /// to; the awaiter resolves on terminal status.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit(
        &mut self,
        task_type: String,
        data: Value,
        options: TaskOptions,
        awaiter: oneshot::Sender<Result<Value, PoolError>>,
        registry: &WorkerRegistry,
        ids: &IdGenerator,
        hub: &mut EventHub,
    ) -> Result<(String, String), PoolError> {
        if self.shutting_down {
            return Err(PoolError::ShutdownInProgress);
        }
        let worker_type = self.resolve_worker_type(&task_type, &options, registry)?;

        let task_id = options.id.clone().unwrap_or_else(|| ids.next_id());
        if self.tasks.contains_key(&task_id) {
            return Err(PoolError::DuplicateTaskId(task_id));
        }

        let seq = self.seq;
        self.seq += 1;

        let queue = self
            .queues
            .entry(worker_type.clone())
            .or_insert_with(|| TaskQueue::new(worker_type.clone(), self.cfg.max_queue_size));
        queue.enqueue(QueueItem {
            task_id: task_id.clone(),
            priority: options.priority,
            seq,
        })?;
        if !self.type_order.contains(&worker_type) {
            self.type_order.push(worker_type.clone());
        }

        let timeout = match options.timeout {
            Some(Duration::ZERO) => None,
            Some(t) => Some(t),
            None => Some(self.cfg.default_timeout),
        };
        self.tasks.insert(
            task_id.clone(),
            TaskRecord {
                task_id: task_id.clone(),
                task_type: task_type.clone(),
                worker_type: worker_type.clone(),
                data,
                status: TaskStatus::Queued,
                priority: options.priority,
                seq,
                started_at: None,
                worker_id: None,
                timeout,
                deadline: None,
                max_retries: options.max_retries,
                attempts: 0,
                on_progress: options.on_progress,
                awaiter: Some(awaiter),
            },
        );

        hub.public(PoolEvent::TaskQueued {
            task_id: task_id.clone(),
            task_type,
            worker_type: worker_type.clone(),
        });
        hub.log(LogEntry::new(LogLevel::Debug, "task queued").with_task(task_id.clone()));
        Ok((task_id, worker_type))
    }

    /// One assignment pass: hands head-of-queue tasks to idle workers,
    /// creating workers where demand exceeds idle supply.
    pub(crate) fn assign(
        &mut self,
        managers: &mut HashMap<String, WorkerManager>,
        ids: &IdGenerator,
        events: &tokio::sync::mpsc::UnboundedSender<crate::transport::AdapterEvent>,
        hub: &mut EventHub,
    ) {
        if self.shutting_down {
            return;
        }
        for worker_type in self.type_order.clone() {
            let Some(manager) = managers.get_mut(&worker_type) else {
                continue;
            };
            loop {
                let Some(queue) = self.queues.get_mut(&worker_type) else {
                    break;
                };
                let Some(head) = queue.peek() else {
                    break;
                };

                if let Some(pa) = self.cfg.priority_allocation {
                    if head.priority < pa.threshold {
                        let reserved = (pa.reserved_fraction * manager.max_workers() as f64)
                            .ceil()
                            .min(manager.max_workers() as f64)
                            as usize;
                        if manager.idle_count() <= reserved {
                            break;
                        }
                    }
                }

                let Some(worker_id) = manager.acquire_idle() else {
                    let deficit = queue.len().saturating_sub(manager.starting_count());
                    for _ in 0..deficit {
                        if manager.create_worker(ids, events, hub).is_err() {
                            break;
                        }
                    }
                    break;
                };
                let item = match queue.dequeue() {
                    Some(item) => item,
                    None => break,
                };
                self.start_on_worker(item, &worker_id, manager, hub);
            }
        }
    }

    fn start_on_worker(
        &mut self,
        item: QueueItem,
        worker_id: &str,
        manager: &mut WorkerManager,
        hub: &mut EventHub,
    ) {
        let Some(record) = self.tasks.get_mut(&item.task_id) else {
            return;
        };
        let now = Instant::now();
        record.status = TaskStatus::Running;
        record.started_at = Some(now);
        record.worker_id = Some(worker_id.to_string());
        record.attempts += 1;
        record.deadline = record.timeout.map(|t| now + t);

        let frame = Frame::StartTask {
            task_id: record.task_id.clone(),
            data: record.data.clone(),
        };
        manager.assign(worker_id, &record.task_id);

        let posted = manager
            .adapter_mut(worker_id)
            .map(|adapter| adapter.post(frame))
            .unwrap_or(Err(PoolError::TerminatedWorker(worker_id.to_string())));
        if let Err(err) = posted {
            hub.log(
                LogEntry::new(LogLevel::Warn, format!("start-task send failed: {err}"))
                    .with_worker(worker_id.to_string())
                    .with_task(record.task_id.clone()),
            );
            // Put the task back (it keeps its original sequence) and
            // discard the broken worker.
            record.status = TaskStatus::Queued;
            record.started_at = None;
            record.worker_id = None;
            record.deadline = None;
            record.attempts -= 1;
            let worker_type = record.worker_type.clone();
            if let Some(queue) = self.queues.get_mut(&worker_type) {
                let _ = queue.enqueue(item);
            }
            manager.clear_active_task(worker_id);
            manager.release_worker(worker_id, true, hub);
            return;
        }

        hub.public(PoolEvent::TaskStarted {
            task_id: record.task_id.clone(),
            worker_id: worker_id.to_string(),
        });
        hub.log(
            LogEntry::new(LogLevel::Debug, "task started")
                .with_worker(worker_id.to_string())
                .with_task(record.task_id.clone()),
        );
    }

    /// Routes a task frame from a worker.
    pub(crate) fn handle_frame(
        &mut self,
        worker_id: &str,
        frame: Frame,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        match frame {
            Frame::TaskCompleted { task_id, result } => {
                if !self.is_current_assignment(&task_id, worker_id) {
                    self.handle_stale_frame(worker_id, &task_id, managers, hub);
                    return;
                }
                self.complete_task(&task_id, result, managers, hub);
            }
            Frame::TaskFailed { task_id, error } => {
                if !self.is_current_assignment(&task_id, worker_id) {
                    self.handle_stale_frame(worker_id, &task_id, managers, hub);
                    return;
                }
                self.fail_attempt(&task_id, PoolError::TaskFailed(error), true, managers, hub);
            }
            Frame::TaskProgress { task_id, progress } => {
                self.report_progress(&task_id, progress, hub);
            }
            frame => {
                hub.log(
                    LogEntry::new(
                        LogLevel::Warn,
                        format!("unrecognized frame ignored: {}", frame.wire_name()),
                    )
                    .with_worker(worker_id.to_string()),
                );
            }
        }
    }

    fn is_current_assignment(&self, task_id: &str, worker_id: &str) -> bool {
        self.tasks.get(task_id).is_some_and(|record| {
            record.status == TaskStatus::Running
                && record.worker_id.as_deref() == Some(worker_id)
        })
    }

    /// Terminal frames for unknown or already-terminal tasks: either the
    /// acknowledgement of a cancel (frees the worker) or noise.
    fn handle_stale_frame(
        &mut self,
        worker_id: &str,
        task_id: &str,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        if self.pending_releases.remove(worker_id).is_some() {
            if let Some(manager) = manager_of(managers, worker_id) {
                manager.free(worker_id);
            }
            hub.log(
                LogEntry::new(LogLevel::Debug, "worker released after cancel")
                    .with_worker(worker_id.to_string())
                    .with_task(task_id.to_string()),
            );
        } else {
            hub.log(
                LogEntry::new(LogLevel::Warn, "frame for unknown task ignored")
                    .with_worker(worker_id.to_string())
                    .with_task(task_id.to_string()),
            );
        }
    }

    fn complete_task(
        &mut self,
        task_id: &str,
        result: Value,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        let Some(mut record) = self.tasks.remove(task_id) else {
            return;
        };
        let duration = record
            .started_at
            .map(|at| at.elapsed())
            .unwrap_or_default();
        record.status = TaskStatus::Completed;

        if let Some(worker_id) = &record.worker_id {
            if let Some(manager) = manager_of(managers, worker_id) {
                if let Some(adapter) = manager.adapter_mut(worker_id) {
                    adapter.record_completion(duration);
                }
                manager.free(worker_id);
            }
        }

        self.completed += 1;
        self.duration_total_ms += duration.as_secs_f64() * 1000.0;
        if let Some(awaiter) = record.awaiter.take() {
            let _ = awaiter.send(Ok(result));
        }
        hub.public(PoolEvent::TaskCompleted {
            task_id: task_id.to_string(),
            duration_ms: duration.as_millis() as u64,
        });
        hub.log(LogEntry::new(LogLevel::Debug, "task completed").with_task(task_id.to_string()));
        self.retire(task_id.to_string(), TaskStatus::Completed);
    }

    /// One attempt failed. Retries while the budget lasts, otherwise
    /// resolves the task to its terminal failure.
    ///
    /// `free_worker` is false when the worker is already gone (crash) or
    /// deliberately left busy (timeout path).
    fn fail_attempt(
        &mut self,
        task_id: &str,
        reason: PoolError,
        free_worker: bool,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        let worker_id = record.worker_id.take();
        if free_worker {
            if let Some(worker_id) = &worker_id {
                if let Some(manager) = manager_of(managers, worker_id) {
                    manager.free(worker_id);
                }
            }
        }

        if record.attempts <= record.max_retries && !self.shutting_down {
            // Re-enqueue under the original sequence: the retry keeps its
            // place within its priority class. Partial progress is gone.
            record.status = TaskStatus::Queued;
            record.started_at = None;
            record.deadline = None;
            let item = QueueItem {
                task_id: record.task_id.clone(),
                priority: record.priority,
                seq: record.seq,
            };
            let worker_type = record.worker_type.clone();
            let attempts = record.attempts;
            let queue = self
                .queues
                .entry(worker_type.clone())
                .or_insert_with(|| TaskQueue::new(worker_type, self.cfg.max_queue_size));
            if queue.enqueue(item).is_ok() {
                hub.log(
                    LogEntry::new(
                        LogLevel::Info,
                        format!("task retrying after failure (attempt {attempts}): {reason}"),
                    )
                    .with_task(task_id.to_string()),
                );
                return;
            }
        }

        let Some(mut record) = self.tasks.remove(task_id) else {
            return;
        };
        record.status = TaskStatus::Failed;
        self.failed += 1;
        let message = reason.to_string();
        if let Some(awaiter) = record.awaiter.take() {
            let _ = awaiter.send(Err(reason));
        }
        hub.public(PoolEvent::TaskFailed {
            task_id: task_id.to_string(),
            error: message.clone(),
        });
        hub.log(
            LogEntry::new(LogLevel::Error, format!("task failed: {message}"))
                .with_task(task_id.to_string()),
        );
        self.retire(task_id.to_string(), TaskStatus::Failed);
    }

    /// A worker crashed while this task was assigned to it.
    pub(crate) fn handle_worker_crash(
        &mut self,
        task_id: &str,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        self.fail_attempt(
            task_id,
            PoolError::WorkerCrashed("worker exited while task was running".into()),
            false,
            managers,
            hub,
        );
    }

    fn report_progress(&mut self, task_id: &str, progress: Value, hub: &mut EventHub) {
        let Some(record) = self.tasks.get(task_id) else {
            return;
        };
        if record.status != TaskStatus::Running {
            return;
        }
        if let Some(on_progress) = &record.on_progress {
            let cb = on_progress.clone();
            let payload = progress.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(move || cb(payload))) {
                hub.log(
                    LogEntry::new(
                        LogLevel::Warn,
                        format!(
                            "progress subscriber panicked: {}",
                            panic_message(panic.as_ref())
                        ),
                    )
                    .with_task(task_id.to_string()),
                );
            }
        }
        hub.public(PoolEvent::TaskProgress {
            task_id: task_id.to_string(),
            progress,
        });
    }

    /// Cancels a task. Terminal and unknown tasks are a no-op returning
    /// `false`.
    pub(crate) fn cancel(
        &mut self,
        task_id: &str,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) -> bool {
        let Some(record) = self.tasks.get(task_id) else {
            return false;
        };
        match record.status {
            TaskStatus::Queued => {
                let worker_type = record.worker_type.clone();
                if let Some(queue) = self.queues.get_mut(&worker_type) {
                    queue.remove(task_id);
                }
                self.resolve_cancelled(task_id, PoolError::Cancelled, hub);
                true
            }
            TaskStatus::Running => {
                let worker_id = record.worker_id.clone();
                if let Some(worker_id) = worker_id {
                    self.ask_worker_to_stop(&worker_id, task_id, managers, hub);
                }
                self.resolve_cancelled(task_id, PoolError::Cancelled, hub);
                true
            }
            _ => false,
        }
    }

    /// Sends `cancel-task` and starts the grace window; the worker either
    /// acknowledges (and returns to idle) or is terminated at the
    /// deadline.
    fn ask_worker_to_stop(
        &mut self,
        worker_id: &str,
        task_id: &str,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        if let Some(manager) = manager_of(managers, worker_id) {
            if let Some(adapter) = manager.adapter_mut(worker_id) {
                let _ = adapter.post(Frame::CancelTask {
                    task_id: task_id.to_string(),
                });
            }
            manager.clear_active_task(worker_id);
        }
        self.pending_releases.insert(
            worker_id.to_string(),
            PendingRelease {
                deadline: Instant::now() + self.cfg.cancel_grace,
                task_id: task_id.to_string(),
            },
        );
    }

    fn resolve_cancelled(&mut self, task_id: &str, reason: PoolError, hub: &mut EventHub) {
        let Some(mut record) = self.tasks.remove(task_id) else {
            return;
        };
        record.status = TaskStatus::Cancelled;
        self.cancelled += 1;
        if let Some(awaiter) = record.awaiter.take() {
            let _ = awaiter.send(Err(reason));
        }
        hub.public(PoolEvent::TaskCancelled {
            task_id: task_id.to_string(),
        });
        hub.log(LogEntry::new(LogLevel::Info, "task cancelled").with_task(task_id.to_string()));
        self.retire(task_id.to_string(), TaskStatus::Cancelled);
    }

    /// Deadline sweep: expired task timeouts and lapsed cancel windows.
    pub(crate) fn sweep(
        &mut self,
        now: Instant,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        let timed_out: Vec<(String, String, Duration)> = self
            .tasks
            .values()
            .filter(|record| {
                record.status == TaskStatus::Running
                    && record.deadline.is_some_and(|deadline| now >= deadline)
            })
            .filter_map(|record| {
                record.worker_id.clone().map(|worker_id| {
                    (
                        record.task_id.clone(),
                        worker_id,
                        record.timeout.unwrap_or_default(),
                    )
                })
            })
            .collect();

        for (task_id, worker_id, timeout) in timed_out {
            hub.log(
                LogEntry::new(LogLevel::Warn, format!("task timed out after {timeout:?}"))
                    .with_worker(worker_id.clone())
                    .with_task(task_id.clone()),
            );
            self.ask_worker_to_stop(&worker_id, &task_id, managers, hub);
            // The worker stays out of rotation until it acknowledges or
            // the grace window lapses; the task moves on immediately.
            self.fail_attempt(&task_id, PoolError::Timeout(timeout), false, managers, hub);
        }

        let lapsed: Vec<String> = self
            .pending_releases
            .iter()
            .filter(|(_, pending)| now >= pending.deadline)
            .map(|(worker_id, _)| worker_id.clone())
            .collect();
        for worker_id in lapsed {
            if let Some(pending) = self.pending_releases.remove(&worker_id) {
                hub.log(
                    LogEntry::new(
                        LogLevel::Warn,
                        "worker unresponsive after cancel; terminating",
                    )
                    .with_worker(worker_id.clone())
                    .with_task(pending.task_id),
                );
                if let Some(manager) = manager_of(managers, &worker_id) {
                    manager.release_worker(&worker_id, true, hub);
                }
            }
        }
    }

    /// Rejects queued (and, when forced, running) tasks and stops
    /// accepting new ones.
    pub(crate) fn shutdown(
        &mut self,
        force: bool,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        self.shutting_down = true;
        let queued: Vec<String> = self
            .tasks
            .values()
            .filter(|record| record.status == TaskStatus::Queued)
            .map(|record| record.task_id.clone())
            .collect();
        for task_id in queued {
            if let Some(record) = self.tasks.get(&task_id) {
                let worker_type = record.worker_type.clone();
                if let Some(queue) = self.queues.get_mut(&worker_type) {
                    queue.remove(&task_id);
                }
            }
            self.resolve_cancelled(&task_id, PoolError::ShutdownInProgress, hub);
        }

        if force {
            let running: Vec<String> = self
                .tasks
                .values()
                .filter(|record| record.status == TaskStatus::Running)
                .map(|record| record.task_id.clone())
                .collect();
            for task_id in running {
                if let Some(record) = self.tasks.get(&task_id) {
                    if let Some(worker_id) = record.worker_id.clone() {
                        if let Some(manager) = manager_of(managers, &worker_id) {
                            manager.clear_active_task(&worker_id);
                        }
                    }
                }
                self.resolve_cancelled(&task_id, PoolError::ShutdownInProgress, hub);
            }
        }
    }

    pub(crate) fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .get(task_id)
            .map(|record| record.status)
            .or_else(|| self.recent.get(task_id).copied())
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.queues.values().map(|queue| queue.len()).sum()
    }

    pub(crate) fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|record| record.status == TaskStatus::Running)
            .count()
    }

    pub(crate) fn counters(&self) -> (u64, u64, u64, f64) {
        let avg = if self.completed > 0 {
            self.duration_total_ms / self.completed as f64
        } else {
            0.0
        };
        (self.completed, self.failed, self.cancelled, avg)
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.tasks.is_empty()
    }

    fn retire(&mut self, task_id: String, status: TaskStatus) {
        while self.recent_order.len() >= self.cfg.recent_max {
            if let Some(oldest) = self.recent_order.pop_front() {
                self.recent.remove(&oldest);
            }
        }
        self.recent.insert(task_id.clone(), status);
        self.recent_order.push_back(task_id);
    }
}
