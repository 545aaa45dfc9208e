//! The pool control task: one cooperative loop owning every piece of
//! mutable bookkeeping, fed by a command channel and the adapter fan-in.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tidepool_core::ids::IdGenerator;
use tidepool_core::log::{LogEntry, LogLevel};
use tidepool_core::PoolError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::api::{PoolEvent, PoolHandle, PoolStats, TaskOptions, TaskStatus};
use crate::config::{PoolConfig, StreamOptions};
use crate::dispatcher::{DispatcherConfig, TaskDispatcher};
use crate::hub::{EventHub, HubEvent};
use crate::manager::{manager_of, ManagerConfig, ManagerOutcome, WorkerManager};
use crate::monitor::{MonitorConfig, WorkerMonitor};
use crate::registry::WorkerRegistry;
use crate::stream::{StreamLifecycleOp, StreamParts};
use crate::stream_manager::StreamManager;
use crate::transport::AdapterEvent;
use crate::transport::script::ScriptSpec;

/// Worker type used for streams when the caller does not name one.
const DEFAULT_STREAM_WORKER_TYPE: &str = "stream";

pub(crate) enum PoolCommand {
    Submit {
        task_type: String,
        data: Value,
        options: TaskOptions,
        awaiter: oneshot::Sender<Result<Value, PoolError>>,
        reply: oneshot::Sender<Result<String, PoolError>>,
    },
    Cancel {
        task_id: String,
        reply: oneshot::Sender<bool>,
    },
    Status {
        task_id: String,
        reply: oneshot::Sender<Option<TaskStatus>>,
    },
    RegisterTaskType {
        task_type: String,
        worker_type: String,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    RegisterWorker {
        name: String,
        spec: ScriptSpec,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    CreateStream {
        options: StreamOptions,
        reply: oneshot::Sender<Result<StreamParts, PoolError>>,
    },
    StreamSend {
        stream_id: String,
        data: Value,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    StreamLifecycle {
        stream_id: String,
        op: StreamLifecycleOp,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    StreamStatus {
        stream_id: String,
        reply: oneshot::Sender<Option<crate::api::StreamStatus>>,
    },
    Logs {
        min_level: Option<tidepool_core::log::LogLevel>,
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    Workers {
        reply: oneshot::Sender<Vec<crate::api::WorkerInfo>>,
    },
    Shutdown {
        force: bool,
        reply: oneshot::Sender<()>,
    },
}

struct ShutdownState {
    force: bool,
    replies: Vec<oneshot::Sender<()>>,
    drain_deadline: Instant,
    terminating: bool,
}

pub(crate) fn start(mut config: PoolConfig) -> PoolHandle {
    config.normalize();

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, _) = broadcast::channel(config.event_capacity);
    let (stats_tx, stats_rx) = watch::channel(PoolStats::default());
    let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();

    let registry = WorkerRegistry::new(config.workers.drain(..));
    let dispatcher = TaskDispatcher::new(DispatcherConfig {
        default_timeout: config.default_task_timeout,
        cancel_grace: config.cancel_grace,
        max_queue_size: config.max_queue_size,
        recent_max: config.recent_tasks_max,
        priority_allocation: config.priority_allocation,
    });
    let monitor = WorkerMonitor::new(MonitorConfig {
        metrics_interval: config.metrics_interval,
        health_check_interval: config.health_check_interval,
        suspected_hang: config.suspected_hang,
        max_log_entries: config.max_log_entries,
    });

    let runtime = PoolRuntime {
        streams: StreamManager::new(config.event_capacity),
        cfg: config,
        registry,
        managers: HashMap::new(),
        dispatcher,
        monitor,
        hub: EventHub::default(),
        command_rx,
        commands_closed: false,
        adapter_rx,
        adapter_tx,
        event_tx: event_tx.clone(),
        stats_tx,
        worker_ids: IdGenerator::new("worker"),
        task_ids: IdGenerator::new("task"),
        stream_ids: IdGenerator::new("stream"),
        shutdown: None,
        stats_dirty: true,
    };
    tokio::spawn(runtime.run());

    PoolHandle {
        commands: command_tx,
        events: event_tx,
        stats: stats_rx,
    }
}

struct PoolRuntime {
    cfg: PoolConfig,
    registry: WorkerRegistry,
    managers: HashMap<String, WorkerManager>,
    dispatcher: TaskDispatcher,
    streams: StreamManager,
    monitor: WorkerMonitor,
    hub: EventHub,

    command_rx: UnboundedReceiver<PoolCommand>,
    commands_closed: bool,
    adapter_rx: UnboundedReceiver<AdapterEvent>,
    adapter_tx: UnboundedSender<AdapterEvent>,
    event_tx: broadcast::Sender<PoolEvent>,
    stats_tx: watch::Sender<PoolStats>,

    worker_ids: IdGenerator,
    task_ids: IdGenerator,
    stream_ids: IdGenerator,

    shutdown: Option<ShutdownState>,
    stats_dirty: bool,
}

impl PoolRuntime {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.cfg.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            self.drain_hub();
            if self.shutdown.is_none() {
                self.dispatcher.assign(
                    &mut self.managers,
                    &self.worker_ids,
                    &self.adapter_tx,
                    &mut self.hub,
                );
                for manager in self.managers.values_mut() {
                    manager.flush_sends(&mut self.hub);
                }
                self.drain_hub();
            }
            self.refresh_stats(false);
            self.advance_shutdown();
            if self.shutdown_finished() {
                break;
            }

            tokio::select! {
                command = self.command_rx.recv(), if !self.commands_closed => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            // Last handle dropped: wind down gracefully.
                            self.commands_closed = true;
                            self.begin_shutdown(false, None);
                        }
                    }
                }
                event = self.adapter_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_adapter_event(event);
                    }
                }
                _ = tick.tick() => self.on_tick(),
            }
        }

        self.drain_hub();
        let _ = self.event_tx.send(PoolEvent::Shutdown);
        self.refresh_stats(true);
        if let Some(state) = self.shutdown.take() {
            for reply in state.replies {
                let _ = reply.send(());
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.dispatcher.sweep(now, &mut self.managers, &mut self.hub);

        let mut removed = Vec::new();
        for manager in self.managers.values_mut() {
            removed.extend(manager.sweep(now, &self.worker_ids, &self.adapter_tx, &mut self.hub));
        }
        for gone in removed {
            if let Some(task_id) = gone.crashed_task {
                self.dispatcher
                    .handle_worker_crash(&task_id, &mut self.managers, &mut self.hub);
            }
            self.streams.worker_exited(&gone.worker_id, &mut self.hub);
        }

        self.streams.sweep(now, &mut self.managers, &mut self.hub);

        if let Some(stats) =
            self.monitor
                .on_tick(now, &self.dispatcher, &mut self.managers, &mut self.hub)
        {
            self.hub.public(PoolEvent::Stats {
                stats: stats.clone(),
            });
            let _ = self.stats_tx.send(stats);
            self.stats_dirty = false;
        }
    }

    fn handle_adapter_event(&mut self, event: AdapterEvent) {
        let AdapterEvent { worker_id, event } = event;
        let Some(manager) = manager_of(&mut self.managers, &worker_id) else {
            // Late event from a worker already discarded.
            tracing::debug!(worker_id = %worker_id, "event from unknown worker dropped");
            return;
        };
        let worker_type = manager.worker_type().to_string();
        let outcome = manager.handle_event(&worker_id, event, &mut self.hub);
        self.stats_dirty = true;

        match outcome {
            ManagerOutcome::Ignored => {}
            ManagerOutcome::Frame(frame) => {
                if let Some((kind, envelope)) = frame.as_stream() {
                    let envelope = envelope.clone();
                    self.streams
                        .route_inbound(&worker_id, kind, &envelope, &mut self.hub);
                } else {
                    self.dispatcher.handle_frame(
                        &worker_id,
                        frame,
                        &mut self.managers,
                        &mut self.hub,
                    );
                }
            }
            ManagerOutcome::WorkerRemoved { crashed_task } => {
                if let Some(task_id) = crashed_task {
                    self.dispatcher
                        .handle_worker_crash(&task_id, &mut self.managers, &mut self.hub);
                }
                self.streams.worker_exited(&worker_id, &mut self.hub);
                if self.shutdown.is_none() {
                    if let Some(manager) = self.managers.get_mut(&worker_type) {
                        manager.ensure_min_workers(
                            &self.worker_ids,
                            &self.adapter_tx,
                            &mut self.hub,
                        );
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit {
                task_type,
                data,
                options,
                awaiter,
                reply,
            } => {
                let result = self.submit(task_type, data, options, awaiter);
                let _ = reply.send(result);
                self.stats_dirty = true;
            }
            PoolCommand::Cancel { task_id, reply } => {
                let cancelled = self
                    .dispatcher
                    .cancel(&task_id, &mut self.managers, &mut self.hub);
                let _ = reply.send(cancelled);
                self.stats_dirty = true;
            }
            PoolCommand::Status { task_id, reply } => {
                let _ = reply.send(self.dispatcher.status(&task_id));
            }
            PoolCommand::RegisterTaskType {
                task_type,
                worker_type,
                reply,
            } => {
                let result = if self.registry.contains(&worker_type) {
                    self.dispatcher.register_task_type(task_type, worker_type);
                    Ok(())
                } else {
                    Err(PoolError::UnknownWorkerType(worker_type))
                };
                let _ = reply.send(result);
            }
            PoolCommand::RegisterWorker { name, spec, reply } => {
                let _ = reply.send(self.registry.register_custom(name, spec));
            }
            PoolCommand::CreateStream { options, reply } => {
                let result = self.create_stream(options);
                let _ = reply.send(result);
            }
            PoolCommand::StreamSend {
                stream_id,
                data,
                reply,
            } => {
                let _ = reply.send(self.streams.send(&stream_id, data, &mut self.managers));
            }
            PoolCommand::StreamLifecycle {
                stream_id,
                op,
                reply,
            } => {
                let _ = reply.send(self.streams.lifecycle(&stream_id, op, &mut self.managers));
            }
            PoolCommand::StreamStatus { stream_id, reply } => {
                let _ = reply.send(self.streams.status(&stream_id));
            }
            PoolCommand::Logs { min_level, reply } => {
                let _ = reply.send(self.monitor.logs(min_level));
            }
            PoolCommand::Workers { reply } => {
                let infos = self
                    .managers
                    .values()
                    .flat_map(|manager| manager.worker_infos())
                    .collect();
                let _ = reply.send(infos);
            }
            PoolCommand::Shutdown { force, reply } => {
                self.begin_shutdown(force, Some(reply));
            }
        }
    }

    fn submit(
        &mut self,
        task_type: String,
        data: Value,
        options: TaskOptions,
        awaiter: oneshot::Sender<Result<Value, PoolError>>,
    ) -> Result<String, PoolError> {
        if self.shutdown.is_some() {
            return Err(PoolError::ShutdownInProgress);
        }
        let (task_id, worker_type) = self.dispatcher.submit(
            task_type,
            data,
            options,
            awaiter,
            &self.registry,
            &self.task_ids,
            &mut self.hub,
        )?;
        // First task of a type instantiates its manager (and any
        // min-workers floor).
        self.ensure_manager(&worker_type)?;
        Ok(task_id)
    }

    fn create_stream(&mut self, options: StreamOptions) -> Result<StreamParts, PoolError> {
        if self.shutdown.is_some() {
            return Err(PoolError::ShutdownInProgress);
        }
        let worker_type = options
            .worker_type
            .clone()
            .unwrap_or_else(|| DEFAULT_STREAM_WORKER_TYPE.to_string());
        self.ensure_manager(&worker_type)?;
        let Some(manager) = self.managers.get_mut(&worker_type) else {
            return Err(PoolError::UnknownWorkerType(worker_type));
        };
        let worker_id =
            manager.acquire_for_stream(&self.worker_ids, &self.adapter_tx, &mut self.hub)?;
        self.streams.create(
            &worker_id,
            &options,
            manager,
            &self.stream_ids,
            &mut self.hub,
        )
    }

    /// Lazily builds the per-type manager from the registry entry.
    fn ensure_manager(&mut self, worker_type: &str) -> Result<(), PoolError> {
        if self.managers.contains_key(worker_type) {
            return Ok(());
        }
        let spec = self.registry.get(worker_type)?.clone();
        let manager = WorkerManager::new(
            worker_type.to_string(),
            spec,
            ManagerConfig {
                min: self.cfg.min_workers,
                max: self.cfg.max_workers,
                idle_timeout: self.cfg.idle_timeout,
                send_queue_limit: self.cfg.send_queue_limit,
                auto_restart: self.cfg.auto_restart,
                scaling: self.cfg.scaling,
                exit_grace: self.cfg.cancel_grace,
            },
        );
        self.managers.insert(worker_type.to_string(), manager);
        if let Some(manager) = self.managers.get_mut(worker_type) {
            manager.ensure_min_workers(&self.worker_ids, &self.adapter_tx, &mut self.hub);
        }
        Ok(())
    }

    fn drain_hub(&mut self) {
        while !self.hub.is_empty() {
            let events: Vec<HubEvent> = self.hub.drain().collect();
            for event in events {
                match event {
                    HubEvent::Public(event) => {
                        let _ = self.event_tx.send(event);
                        self.stats_dirty = true;
                    }
                    HubEvent::Log(entry) => self.monitor.record(entry),
                    HubEvent::WorkerNeedsRestart {
                        worker_type,
                        worker_id,
                    } => {
                        if self.shutdown.is_some() {
                            continue;
                        }
                        if let Some(manager) = self.managers.get_mut(&worker_type) {
                            manager.release_worker(&worker_id, true, &mut self.hub);
                            manager.ensure_min_workers(
                                &self.worker_ids,
                                &self.adapter_tx,
                                &mut self.hub,
                            );
                        }
                    }
                }
            }
        }
    }

    fn refresh_stats(&mut self, force: bool) {
        if self.stats_dirty || force {
            let stats = self.monitor.sample(&self.dispatcher, &self.managers);
            let _ = self.stats_tx.send(stats);
            self.stats_dirty = false;
        }
    }

    fn begin_shutdown(&mut self, force: bool, reply: Option<oneshot::Sender<()>>) {
        if let Some(state) = &mut self.shutdown {
            state.replies.extend(reply);
            if force && !state.force {
                state.force = true;
                state.terminating = true;
                self.dispatcher
                    .shutdown(true, &mut self.managers, &mut self.hub);
                for manager in self.managers.values_mut() {
                    manager.shutdown(true, &mut self.hub);
                }
            }
            return;
        }

        self.hub.log(LogEntry::new(
            LogLevel::Info,
            if force {
                "forced shutdown requested"
            } else {
                "shutdown requested"
            },
        ));
        self.dispatcher
            .shutdown(force, &mut self.managers, &mut self.hub);
        self.streams.close_all(&mut self.managers, &mut self.hub);
        if force {
            for manager in self.managers.values_mut() {
                manager.shutdown(true, &mut self.hub);
            }
        }
        self.shutdown = Some(ShutdownState {
            force,
            replies: reply.into_iter().collect(),
            drain_deadline: Instant::now() + self.cfg.shutdown_timeout,
            terminating: force,
        });
    }

    /// Graceful shutdown waits for in-flight tasks (bounded by the drain
    /// deadline) before terminating the workers.
    fn advance_shutdown(&mut self) {
        let Some(state) = &mut self.shutdown else {
            return;
        };
        if state.terminating {
            return;
        }
        if self.dispatcher.running_count() == 0 || Instant::now() >= state.drain_deadline {
            state.terminating = true;
            for manager in self.managers.values_mut() {
                manager.shutdown(state.force, &mut self.hub);
            }
        }
    }

    fn shutdown_finished(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|state| state.terminating)
            && self.managers.values().all(|manager| manager.is_drained())
    }
}
