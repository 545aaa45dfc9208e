//! Stream multiplexer: owns the streams of a pool and routes inbound
//! stream frames to their instances.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tidepool_core::ids::IdGenerator;
use tidepool_core::log::{LogEntry, LogLevel};
use tidepool_core::{Frame, PoolError, StreamEnvelope, StreamKind};
use tokio::sync::broadcast;

use crate::api::{StreamEvent, StreamStatus};
use crate::config::StreamOptions;
use crate::hub::EventHub;
use crate::manager::WorkerManager;
use crate::stream::{EventStream, StreamLifecycleOp, StreamParts};

pub(crate) struct StreamManager {
    streams: HashMap<String, EventStream>,
    event_capacity: usize,
}

impl StreamManager {
    pub(crate) fn new(event_capacity: usize) -> Self {
        Self {
            streams: HashMap::new(),
            event_capacity: event_capacity.max(16),
        }
    }

    /// Opens a stream on the given worker: sends `STREAM_INIT` and
    /// registers the record in `initializing` state.
    pub(crate) fn create(
        &mut self,
        worker_id: &str,
        options: &StreamOptions,
        manager: &mut WorkerManager,
        ids: &IdGenerator,
        hub: &mut EventHub,
    ) -> Result<StreamParts, PoolError> {
        let stream_id = ids.next_id();
        let mut envelope = StreamEnvelope::new(stream_id.clone());
        if let Some(data) = &options.initial_data {
            envelope = envelope.with_data(data.clone());
        }

        let adapter = manager
            .adapter_mut(worker_id)
            .ok_or_else(|| PoolError::TerminatedWorker(worker_id.to_string()))?;
        adapter.post_prioritized(Frame::StreamInit(envelope), options.priority)?;

        let (events, _) = broadcast::channel(self.event_capacity);
        self.streams.insert(
            stream_id.clone(),
            EventStream {
                id: stream_id.clone(),
                worker_id: worker_id.to_string(),
                status: StreamStatus::Initializing,
                events: events.clone(),
                inactivity: options.inactivity_timeout,
                last_activity: Instant::now(),
                auto_cleanup: options.auto_cleanup(),
            },
        );
        hub.log(
            LogEntry::new(LogLevel::Debug, "stream created")
                .with_worker(worker_id.to_string())
                .with_data(serde_json::json!({
                    "stream-id": stream_id,
                    "metadata": options.metadata,
                })),
        );
        Ok(StreamParts { stream_id, events })
    }

    /// Routes one inbound stream frame to its instance; unknown stream
    /// ids are dropped with a warning.
    pub(crate) fn route_inbound(
        &mut self,
        worker_id: &str,
        kind: StreamKind,
        envelope: &StreamEnvelope,
        hub: &mut EventHub,
    ) {
        let Some(stream) = self.streams.get_mut(&envelope.stream_id) else {
            hub.log(
                LogEntry::new(LogLevel::Warn, "frame for unknown stream dropped")
                    .with_worker(worker_id.to_string())
                    .with_data(serde_json::json!({"stream-id": envelope.stream_id})),
            );
            return;
        };
        if stream.worker_id != worker_id {
            hub.log(
                LogEntry::new(LogLevel::Warn, "stream frame from wrong worker dropped")
                    .with_worker(worker_id.to_string())
                    .with_data(serde_json::json!({"stream-id": envelope.stream_id})),
            );
            return;
        }
        let status = stream.apply_inbound(kind, envelope);
        if status.is_terminal() && stream.auto_cleanup {
            self.streams.remove(&envelope.stream_id);
        }
    }

    /// Forwards a payload from the client side.
    pub(crate) fn send(
        &mut self,
        stream_id: &str,
        data: Value,
        managers: &mut HashMap<String, WorkerManager>,
    ) -> Result<(), PoolError> {
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(PoolError::StreamNotActive)?;
        match stream.status {
            // Tolerant baseline: forward during initialization and trust
            // the worker to buffer until it emits READY.
            StreamStatus::Active | StreamStatus::Initializing => {}
            _ => return Err(PoolError::StreamNotActive),
        }
        let envelope = StreamEnvelope::new(stream_id).with_data(data);
        let worker_id = stream.worker_id.clone();
        stream.touch();
        post_to_worker(managers, &worker_id, Frame::StreamMessage(envelope))
    }

    /// Client-initiated pause/resume/close.
    pub(crate) fn lifecycle(
        &mut self,
        stream_id: &str,
        op: StreamLifecycleOp,
        managers: &mut HashMap<String, WorkerManager>,
    ) -> Result<(), PoolError> {
        let Some(stream) = self.streams.get_mut(stream_id) else {
            // Closing an already-cleaned-up stream is a no-op.
            return match op {
                StreamLifecycleOp::Close => Ok(()),
                _ => Err(PoolError::StreamNotActive),
            };
        };
        let worker_id = stream.worker_id.clone();
        match op {
            StreamLifecycleOp::Pause => {
                if stream.status != StreamStatus::Active {
                    return Err(PoolError::StreamNotActive);
                }
                stream.touch();
                stream.status = StreamStatus::Paused;
                stream.emit(StreamEvent::Paused);
                post_to_worker(
                    managers,
                    &worker_id,
                    Frame::StreamPause(StreamEnvelope::new(stream_id)),
                )
            }
            StreamLifecycleOp::Resume => {
                if stream.status != StreamStatus::Paused {
                    return Err(PoolError::StreamNotActive);
                }
                stream.touch();
                stream.status = StreamStatus::Active;
                stream.emit(StreamEvent::Resumed);
                post_to_worker(
                    managers,
                    &worker_id,
                    Frame::StreamResume(StreamEnvelope::new(stream_id)),
                )
            }
            StreamLifecycleOp::Close => {
                if stream.status.is_terminal() {
                    return Ok(());
                }
                stream.close();
                let res = post_to_worker(
                    managers,
                    &worker_id,
                    Frame::StreamClose(StreamEnvelope::new(stream_id)),
                );
                if self
                    .streams
                    .get(stream_id)
                    .is_some_and(|stream| stream.auto_cleanup)
                {
                    self.streams.remove(stream_id);
                }
                res
            }
        }
    }

    pub(crate) fn status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.streams.get(stream_id).map(|stream| stream.status)
    }

    /// Expires streams whose inactivity window lapsed.
    pub(crate) fn sweep(
        &mut self,
        now: Instant,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        let expired: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, stream)| !stream.status.is_terminal() && stream.expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for stream_id in expired {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                let worker_id = stream.worker_id.clone();
                stream.fail(PoolError::StreamTimeout.to_string());
                hub.log(
                    LogEntry::new(LogLevel::Warn, "stream timed out")
                        .with_worker(worker_id.clone())
                        .with_data(serde_json::json!({"stream-id": stream_id})),
                );
                let _ = post_to_worker(
                    managers,
                    &worker_id,
                    Frame::StreamClose(StreamEnvelope::new(stream_id.clone())),
                );
                if stream_should_drop(&self.streams, &stream_id) {
                    self.streams.remove(&stream_id);
                }
            }
        }
    }

    /// Fails every stream bound to a worker that is gone.
    pub(crate) fn worker_exited(&mut self, worker_id: &str, hub: &mut EventHub) {
        let affected: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.worker_id == worker_id)
            .map(|(id, _)| id.clone())
            .collect();
        for stream_id in affected {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.fail("worker exited".to_string());
                hub.log(
                    LogEntry::new(LogLevel::Warn, "stream closed: worker exited")
                        .with_worker(worker_id.to_string())
                        .with_data(serde_json::json!({"stream-id": stream.id})),
                );
                if stream_should_drop(&self.streams, &stream_id) {
                    self.streams.remove(&stream_id);
                }
            }
        }
    }

    /// Closes everything; used by pool shutdown.
    pub(crate) fn close_all(
        &mut self,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) {
        let ids: Vec<String> = self.streams.keys().cloned().collect();
        for stream_id in ids {
            let _ = self.lifecycle(&stream_id, StreamLifecycleOp::Close, managers);
        }
        if !self.streams.is_empty() {
            hub.log(LogEntry::new(
                LogLevel::Debug,
                format!("{} stream records retained past close", self.streams.len()),
            ));
        }
        self.streams.clear();
    }
}

fn stream_should_drop(streams: &HashMap<String, EventStream>, stream_id: &str) -> bool {
    streams
        .get(stream_id)
        .is_some_and(|stream| stream.auto_cleanup)
}

fn post_to_worker(
    managers: &mut HashMap<String, WorkerManager>,
    worker_id: &str,
    frame: Frame,
) -> Result<(), PoolError> {
    let manager = crate::manager::manager_of(managers, worker_id)
        .ok_or_else(|| PoolError::TerminatedWorker(worker_id.to_string()))?;
    let adapter = manager
        .adapter_mut(worker_id)
        .ok_or_else(|| PoolError::TerminatedWorker(worker_id.to_string()))?;
    adapter.post(frame)
}
