//! Per-type worker manager: owns the adapters of one worker type and
//! keeps the pool within its `[min, max]` bounds.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tidepool_core::ids::IdGenerator;
use tidepool_core::log::{LogEntry, LogLevel};
use tidepool_core::{Frame, PoolError};
use tokio::sync::mpsc::UnboundedSender;

use crate::adapter::WorkerAdapter;
use crate::api::{PoolEvent, WorkerStatus};
use crate::config::ScalingConfig;
use crate::hub::EventHub;
use crate::transport::script::ScriptSpec;
use crate::transport::{self, AdapterEvent, TransportEvent, EXIT_KILLED};

#[derive(Debug, Clone)]
pub(crate) struct ManagerConfig {
    pub(crate) min: usize,
    pub(crate) max: usize,
    pub(crate) idle_timeout: Duration,
    pub(crate) send_queue_limit: usize,
    pub(crate) auto_restart: bool,
    pub(crate) scaling: Option<ScalingConfig>,
    /// Window a terminating worker gets to actually exit before its
    /// entry is discarded.
    pub(crate) exit_grace: Duration,
}

struct WorkerEntry {
    adapter: WorkerAdapter,
    exit_deadline: Option<Instant>,
}

/// What the pool should do with a transport event after the manager has
/// applied its own bookkeeping.
pub(crate) enum ManagerOutcome {
    /// Fully handled.
    Ignored,
    /// A frame for dispatcher- or stream-level routing.
    Frame(Frame),
    /// The worker is gone; `crashed_task` was assigned to it.
    WorkerRemoved { crashed_task: Option<String> },
}

pub(crate) struct WorkerManager {
    worker_type: String,
    spec: ScriptSpec,
    cfg: ManagerConfig,
    workers: BTreeMap<String, WorkerEntry>,
    shutting_down: bool,
}

impl WorkerManager {
    pub(crate) fn new(worker_type: String, spec: ScriptSpec, cfg: ManagerConfig) -> Self {
        Self {
            worker_type,
            spec,
            cfg,
            workers: BTreeMap::new(),
            shutting_down: false,
        }
    }

    pub(crate) fn worker_type(&self) -> &str {
        &self.worker_type
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Workers that still count toward the `[min, max]` bounds.
    pub(crate) fn active_count(&self) -> usize {
        self.workers
            .values()
            .filter(|entry| {
                !matches!(
                    entry.adapter.status(),
                    WorkerStatus::Terminating | WorkerStatus::Terminated
                )
            })
            .count()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.workers
            .values()
            .filter(|entry| entry.adapter.status() == WorkerStatus::Idle)
            .count()
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.workers
            .values()
            .filter(|entry| entry.adapter.status() == WorkerStatus::Busy)
            .count()
    }

    pub(crate) fn starting_count(&self) -> usize {
        self.workers
            .values()
            .filter(|entry| entry.adapter.status() == WorkerStatus::Starting)
            .count()
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.cfg.max
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.workers.is_empty()
    }

    pub(crate) fn adapters(&self) -> impl Iterator<Item = &WorkerAdapter> {
        self.workers.values().map(|entry| &entry.adapter)
    }

    /// Observability snapshots for every worker of this type.
    pub(crate) fn worker_infos(&self) -> Vec<crate::api::WorkerInfo> {
        self.adapters()
            .map(|adapter| adapter.info(&self.worker_type))
            .collect()
    }

    pub(crate) fn adapter_mut(&mut self, worker_id: &str) -> Option<&mut WorkerAdapter> {
        self.workers
            .get_mut(worker_id)
            .map(|entry| &mut entry.adapter)
    }

    /// Any idle worker, or `None`.
    pub(crate) fn acquire_idle(&self) -> Option<String> {
        self.workers
            .iter()
            .find(|(_, entry)| entry.adapter.status() == WorkerStatus::Idle)
            .map(|(id, _)| id.clone())
    }

    /// Picks a worker to host a stream: an idle worker when one exists,
    /// a fresh worker while below `max`, otherwise any live worker
    /// (streams multiplex; exclusivity is not required).
    pub(crate) fn acquire_for_stream(
        &mut self,
        ids: &IdGenerator,
        events: &UnboundedSender<AdapterEvent>,
        hub: &mut EventHub,
    ) -> Result<String, PoolError> {
        if let Some(worker_id) = self.acquire_idle() {
            return Ok(worker_id);
        }
        match self.create_worker(ids, events, hub) {
            Ok(worker_id) => Ok(worker_id),
            Err(err) => self
                .workers
                .iter()
                .find(|(_, entry)| {
                    !matches!(
                        entry.adapter.status(),
                        WorkerStatus::Terminating | WorkerStatus::Terminated | WorkerStatus::Error
                    )
                })
                .map(|(id, _)| id.clone())
                .ok_or(err),
        }
    }

    /// Drains every adapter's priority send queue; a send failure marks
    /// the worker errored.
    pub(crate) fn flush_sends(&mut self, hub: &mut EventHub) {
        let mut failed = Vec::new();
        for (id, entry) in self.workers.iter_mut() {
            if !matches!(
                entry.adapter.status(),
                WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy
            ) {
                continue;
            }
            if let Err(err) = entry.adapter.flush_sends() {
                failed.push((id.clone(), err.to_string()));
            }
        }
        for (worker_id, error) in failed {
            if let Some(entry) = self.workers.get_mut(&worker_id) {
                entry.adapter.record_error();
                entry.adapter.set_status(WorkerStatus::Error);
            }
            hub.public(PoolEvent::WorkerError {
                worker_id: worker_id.clone(),
                error: error.clone(),
            });
            hub.log(
                LogEntry::new(LogLevel::Error, format!("send queue flush failed: {error}"))
                    .with_worker_type(self.worker_type.clone())
                    .with_worker(worker_id.clone()),
            );
            if self.cfg.auto_restart && !self.shutting_down {
                hub.needs_restart(self.worker_type.clone(), worker_id);
            }
        }
    }

    /// Spawns one worker. Fails above `max` or during shutdown.
    pub(crate) fn create_worker(
        &mut self,
        ids: &IdGenerator,
        events: &UnboundedSender<AdapterEvent>,
        hub: &mut EventHub,
    ) -> Result<String, PoolError> {
        if self.shutting_down {
            return Err(PoolError::ShutdownInProgress);
        }
        if self.workers.len() >= self.cfg.max {
            return Err(PoolError::MaxWorkersExceeded {
                worker_type: self.worker_type.clone(),
                max: self.cfg.max,
            });
        }

        let worker_id = ids.next_id();
        let script = self.spec.instantiate();
        let transport = transport::spawn(&worker_id, script, events.clone())
            .map_err(|err| PoolError::WorkerCrashed(format!("spawn failed: {err}")))?;

        let adapter = WorkerAdapter::new(worker_id.clone(), transport, self.cfg.send_queue_limit);
        self.workers.insert(
            worker_id.clone(),
            WorkerEntry {
                adapter,
                exit_deadline: None,
            },
        );

        hub.public(PoolEvent::WorkerCreated {
            worker_id: worker_id.clone(),
            worker_type: self.worker_type.clone(),
        });
        hub.log(
            LogEntry::new(LogLevel::Info, "worker created")
                .with_worker_type(self.worker_type.clone())
                .with_worker(worker_id.clone()),
        );
        Ok(worker_id)
    }

    /// Creates workers until `min` is met. Idempotent; stops quietly at
    /// `max` or on spawn failure.
    pub(crate) fn ensure_min_workers(
        &mut self,
        ids: &IdGenerator,
        events: &UnboundedSender<AdapterEvent>,
        hub: &mut EventHub,
    ) {
        while !self.shutting_down && self.active_count() < self.cfg.min {
            if self.create_worker(ids, events, hub).is_err() {
                break;
            }
        }
    }

    /// Marks a worker busy with the given task.
    pub(crate) fn assign(&mut self, worker_id: &str, task_id: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.adapter.active_task = Some(task_id.to_string());
            entry.adapter.set_status(WorkerStatus::Busy);
        }
    }

    /// Returns a worker to idle after its task reached a terminal state.
    pub(crate) fn free(&mut self, worker_id: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.adapter.active_task = None;
            entry.adapter.set_status(WorkerStatus::Idle);
        }
    }

    /// Detaches a task from its worker without changing worker status.
    pub(crate) fn clear_active_task(&mut self, worker_id: &str) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.adapter.active_task = None;
        }
    }

    /// Terminates one worker; the entry is discarded on exit or when the
    /// grace window lapses.
    pub(crate) fn release_worker(&mut self, worker_id: &str, force: bool, hub: &mut EventHub) {
        if let Some(entry) = self.workers.get_mut(worker_id) {
            entry.adapter.terminate(force);
            entry.exit_deadline = Some(Instant::now() + self.cfg.exit_grace);
            hub.log(
                LogEntry::new(LogLevel::Debug, "worker released")
                    .with_worker_type(self.worker_type.clone())
                    .with_worker(worker_id.to_string()),
            );
        }
    }

    /// Applies one transport event.
    pub(crate) fn handle_event(
        &mut self,
        worker_id: &str,
        event: TransportEvent,
        hub: &mut EventHub,
    ) -> ManagerOutcome {
        match event {
            TransportEvent::Message(frame) => {
                let Some(entry) = self.workers.get_mut(worker_id) else {
                    hub.log(
                        LogEntry::new(LogLevel::Warn, "frame from unknown worker")
                            .with_worker(worker_id.to_string())
                            .with_data(serde_json::json!({"frame": frame.wire_name()})),
                    );
                    return ManagerOutcome::Ignored;
                };
                let Some(frame) = entry.adapter.handle_inbound(frame) else {
                    return ManagerOutcome::Ignored;
                };
                match frame {
                    Frame::WorkerReady => {
                        if entry.adapter.status() == WorkerStatus::Starting {
                            entry.adapter.set_status(WorkerStatus::Idle);
                            hub.log(
                                LogEntry::new(LogLevel::Debug, "worker ready")
                                    .with_worker(worker_id.to_string()),
                            );
                        }
                        ManagerOutcome::Ignored
                    }
                    Frame::Pong => ManagerOutcome::Ignored,
                    frame => ManagerOutcome::Frame(frame),
                }
            }
            TransportEvent::Error(message) => {
                let Some(entry) = self.workers.get_mut(worker_id) else {
                    return ManagerOutcome::Ignored;
                };
                entry.adapter.record_error();
                entry.adapter.set_status(WorkerStatus::Error);
                hub.public(PoolEvent::WorkerError {
                    worker_id: worker_id.to_string(),
                    error: message.clone(),
                });
                hub.log(
                    LogEntry::new(LogLevel::Error, message)
                        .with_worker_type(self.worker_type.clone())
                        .with_worker(worker_id.to_string()),
                );
                if self.cfg.auto_restart && !self.shutting_down {
                    hub.needs_restart(self.worker_type.clone(), worker_id.to_string());
                }
                ManagerOutcome::Ignored
            }
            TransportEvent::Exit(code) => {
                let Some(mut entry) = self.workers.remove(worker_id) else {
                    return ManagerOutcome::Ignored;
                };
                let crashed_task = entry.adapter.active_task.take();
                entry.adapter.fail_pending(PoolError::WorkerCrashed(format!(
                    "worker exited with code {code}"
                )));
                entry.adapter.set_status(WorkerStatus::Terminated);
                hub.public(PoolEvent::WorkerExited {
                    worker_id: worker_id.to_string(),
                    code,
                });
                hub.log(
                    LogEntry::new(
                        if code == 0 { LogLevel::Debug } else { LogLevel::Warn },
                        format!("worker exited with code {code}"),
                    )
                    .with_worker_type(self.worker_type.clone())
                    .with_worker(worker_id.to_string()),
                );
                ManagerOutcome::WorkerRemoved { crashed_task }
            }
        }
    }

    /// Health pass: probes live workers with `ping` and marks workers
    /// busy past the suspected-hang threshold as errored.
    pub(crate) fn check_health(
        &mut self,
        now: Instant,
        suspected_hang: Duration,
        hub: &mut EventHub,
    ) {
        for entry in self.workers.values_mut() {
            if matches!(
                entry.adapter.status(),
                WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy
            ) {
                let _ = entry.adapter.post(Frame::Ping);
            }
        }

        let mut hung = Vec::new();
        for (id, entry) in &self.workers {
            if entry.adapter.status() == WorkerStatus::Busy
                && entry
                    .adapter
                    .busy_since
                    .is_some_and(|since| now.duration_since(since) >= suspected_hang)
            {
                hung.push(id.clone());
            }
        }
        for worker_id in hung {
            if let Some(entry) = self.workers.get_mut(&worker_id) {
                entry.adapter.record_error();
                entry.adapter.set_status(WorkerStatus::Error);
            }
            hub.public(PoolEvent::WorkerError {
                worker_id: worker_id.clone(),
                error: "worker suspected hung".to_string(),
            });
            hub.log(
                LogEntry::new(LogLevel::Warn, "worker suspected hung")
                    .with_worker_type(self.worker_type.clone())
                    .with_worker(worker_id.clone()),
            );
            if self.cfg.auto_restart && !self.shutting_down {
                hub.needs_restart(self.worker_type.clone(), worker_id);
            }
        }
    }

    /// Periodic pass: discards terminating stragglers, reaps idle
    /// workers above `min`, applies scaling, and restores `min`.
    pub(crate) fn sweep(
        &mut self,
        now: Instant,
        ids: &IdGenerator,
        events: &UnboundedSender<AdapterEvent>,
        hub: &mut EventHub,
    ) -> Vec<RemovedWorker> {
        let mut removed = Vec::new();

        let stragglers: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, entry)| entry.exit_deadline.is_some_and(|deadline| now >= deadline))
            .map(|(id, _)| id.clone())
            .collect();
        for worker_id in stragglers {
            if let Some(mut entry) = self.workers.remove(&worker_id) {
                let crashed_task = entry.adapter.active_task.take();
                entry.adapter.terminate(true);
                entry
                    .adapter
                    .fail_pending(PoolError::TerminatedWorker(worker_id.clone()));
                hub.public(PoolEvent::WorkerExited {
                    worker_id: worker_id.clone(),
                    code: EXIT_KILLED,
                });
                hub.log(
                    LogEntry::new(LogLevel::Warn, "worker did not exit in time; discarded")
                        .with_worker_type(self.worker_type.clone())
                        .with_worker(worker_id.clone()),
                );
                removed.push(RemovedWorker {
                    worker_id,
                    crashed_task,
                });
            }
        }

        if !self.shutting_down {
            self.reap_idle(now, hub);
            self.apply_scaling(ids, events, hub);
            self.ensure_min_workers(ids, events, hub);
        }

        removed
    }

    fn reap_idle(&mut self, now: Instant, hub: &mut EventHub) {
        loop {
            if self.active_count() <= self.cfg.min {
                return;
            }
            let expired = self.workers.iter().find_map(|(id, entry)| {
                (entry.adapter.status() == WorkerStatus::Idle
                    && entry
                        .adapter
                        .idle_since
                        .is_some_and(|since| now.duration_since(since) >= self.cfg.idle_timeout))
                .then(|| id.clone())
            });
            match expired {
                Some(worker_id) => {
                    hub.log(
                        LogEntry::new(LogLevel::Debug, "idle worker reaped")
                            .with_worker_type(self.worker_type.clone())
                            .with_worker(worker_id.clone()),
                    );
                    self.release_worker(&worker_id, false, hub);
                }
                None => return,
            }
        }
    }

    fn apply_scaling(
        &mut self,
        ids: &IdGenerator,
        events: &UnboundedSender<AdapterEvent>,
        hub: &mut EventHub,
    ) {
        let Some(scaling) = self.cfg.scaling else {
            return;
        };
        let active = self.active_count();
        if active == 0 {
            return;
        }
        let utilization = self.busy_count() as f64 / active as f64;
        if utilization >= scaling.scale_up_utilization && active < self.cfg.max {
            let _ = self.create_worker(ids, events, hub);
        } else if utilization <= scaling.scale_down_utilization && active > self.cfg.min {
            if let Some(worker_id) = self.acquire_idle() {
                hub.log(
                    LogEntry::new(LogLevel::Debug, "scaling down")
                        .with_worker_type(self.worker_type.clone())
                        .with_worker(worker_id.clone()),
                );
                self.release_worker(&worker_id, false, hub);
            }
        }
    }

    /// Terminates every worker and refuses further creation.
    pub(crate) fn shutdown(&mut self, force: bool, hub: &mut EventHub) {
        self.shutting_down = true;
        let ids: Vec<String> = self.workers.keys().cloned().collect();
        for worker_id in ids {
            self.release_worker(&worker_id, force, hub);
        }
    }
}

/// A worker discarded during a sweep or on exit.
pub(crate) struct RemovedWorker {
    pub(crate) worker_id: String,
    pub(crate) crashed_task: Option<String>,
}

/// Finds the manager owning a worker id.
pub(crate) fn manager_of<'a>(
    managers: &'a mut std::collections::HashMap<String, WorkerManager>,
    worker_id: &str,
) -> Option<&'a mut WorkerManager> {
    managers
        .values_mut()
        .find(|manager| manager.adapters().any(|adapter| adapter.id() == worker_id))
}
