//! One bidirectional event stream bound to a single worker.

use std::time::{Duration, Instant};

use serde_json::Value;
use tidepool_core::{PoolError, StreamEnvelope, StreamKind};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::api::{StreamEvent, StreamStatus};
use crate::pool::PoolCommand;

/// Control-side record of one stream.
pub(crate) struct EventStream {
    pub(crate) id: String,
    pub(crate) worker_id: String,
    pub(crate) status: StreamStatus,
    pub(crate) events: broadcast::Sender<StreamEvent>,
    pub(crate) inactivity: Option<Duration>,
    pub(crate) last_activity: Instant,
    pub(crate) auto_cleanup: bool,
}

impl EventStream {
    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Applies a worker-side stream frame. Returns the resulting status.
    pub(crate) fn apply_inbound(&mut self, kind: StreamKind, envelope: &StreamEnvelope) -> StreamStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        self.touch();
        match kind {
            StreamKind::Ready => {
                if self.status == StreamStatus::Initializing {
                    self.status = StreamStatus::Active;
                    self.emit(StreamEvent::Ready);
                }
            }
            StreamKind::Message => {
                if self.status == StreamStatus::Active {
                    self.emit(StreamEvent::Message {
                        data: envelope.data.clone().unwrap_or(Value::Null),
                    });
                }
            }
            StreamKind::Pause => {
                if self.status == StreamStatus::Active {
                    self.status = StreamStatus::Paused;
                    self.emit(StreamEvent::Paused);
                }
            }
            StreamKind::Resume => {
                if self.status == StreamStatus::Paused {
                    self.status = StreamStatus::Active;
                    self.emit(StreamEvent::Resumed);
                }
            }
            StreamKind::Error => {
                self.fail(
                    envelope
                        .error
                        .clone()
                        .unwrap_or_else(|| "stream error".to_string()),
                );
            }
            StreamKind::Close => {
                self.close();
            }
            // INIT only ever travels control → worker.
            StreamKind::Init => {}
        }
        self.status
    }

    /// Error transition: subscribers see the error, then the close.
    pub(crate) fn fail(&mut self, error: String) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StreamStatus::Error;
        self.emit(StreamEvent::Error { error });
        self.emit(StreamEvent::Closed);
    }

    /// Clean close; idempotent.
    pub(crate) fn close(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = StreamStatus::Closed;
        self.emit(StreamEvent::Closed);
    }

    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.inactivity
            .is_some_and(|window| now.duration_since(self.last_activity) >= window)
    }
}

/// Pieces handed back to the caller when a stream is created.
#[derive(Debug)]
pub(crate) struct StreamParts {
    pub(crate) stream_id: String,
    pub(crate) events: broadcast::Sender<StreamEvent>,
}

/// Client handle to one stream.
///
/// Frames are delivered to subscribers in worker emission order; after
/// `Closed` or `Error` nothing further is delivered.
#[derive(Debug)]
pub struct EventStreamHandle {
    stream_id: String,
    commands: mpsc::UnboundedSender<PoolCommand>,
    events: broadcast::Sender<StreamEvent>,
}

impl EventStreamHandle {
    pub(crate) fn from_parts(
        parts: StreamParts,
        commands: mpsc::UnboundedSender<PoolCommand>,
    ) -> Self {
        Self {
            stream_id: parts.stream_id,
            commands,
            events: parts.events,
        }
    }

    /// Stream id.
    pub fn id(&self) -> &str {
        &self.stream_id
    }

    /// Subscribes to the stream's event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Sends a payload to the worker. Legal while the stream is active
    /// (or still initializing, in which case the worker buffers it).
    pub async fn send(&self, data: Value) -> Result<(), PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::StreamSend {
                stream_id: self.stream_id.clone(),
                data,
                reply: reply_tx,
            })
            .map_err(|_| PoolError::ShutdownInProgress)?;
        reply_rx.await.map_err(|_| PoolError::ShutdownInProgress)?
    }

    /// Pauses an active stream.
    pub async fn pause(&self) -> Result<(), PoolError> {
        self.lifecycle(StreamLifecycleOp::Pause).await
    }

    /// Resumes a paused stream.
    pub async fn resume(&self) -> Result<(), PoolError> {
        self.lifecycle(StreamLifecycleOp::Resume).await
    }

    /// Closes the stream. Idempotent.
    pub async fn close(&self) -> Result<(), PoolError> {
        self.lifecycle(StreamLifecycleOp::Close).await
    }

    /// Current status, or `None` once the record is cleaned up.
    pub async fn status(&self) -> Option<StreamStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::StreamStatus {
                stream_id: self.stream_id.clone(),
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    async fn lifecycle(&self, op: StreamLifecycleOp) -> Result<(), PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::StreamLifecycle {
                stream_id: self.stream_id.clone(),
                op,
                reply: reply_tx,
            })
            .map_err(|_| PoolError::ShutdownInProgress)?;
        reply_rx.await.map_err(|_| PoolError::ShutdownInProgress)?
    }
}

/// Client-initiated stream lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamLifecycleOp {
    Pause,
    Resume,
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (EventStream, broadcast::Receiver<StreamEvent>) {
        let (events, rx) = broadcast::channel(16);
        (
            EventStream {
                id: "stream-0-0".into(),
                worker_id: "worker-0-0".into(),
                status: StreamStatus::Initializing,
                events,
                inactivity: None,
                last_activity: Instant::now(),
                auto_cleanup: true,
            },
            rx,
        )
    }

    fn envelope() -> StreamEnvelope {
        StreamEnvelope::new("stream-0-0")
    }

    #[test]
    fn ready_activates_only_from_initializing() {
        let (mut stream, _rx) = stream();
        assert_eq!(
            stream.apply_inbound(StreamKind::Ready, &envelope()),
            StreamStatus::Active
        );
        stream.status = StreamStatus::Paused;
        assert_eq!(
            stream.apply_inbound(StreamKind::Ready, &envelope()),
            StreamStatus::Paused
        );
    }

    #[test]
    fn pause_resume_obeys_the_state_machine() {
        let (mut stream, _rx) = stream();
        stream.apply_inbound(StreamKind::Ready, &envelope());
        // Resume on an active stream is a no-op.
        assert_eq!(
            stream.apply_inbound(StreamKind::Resume, &envelope()),
            StreamStatus::Active
        );
        assert_eq!(
            stream.apply_inbound(StreamKind::Pause, &envelope()),
            StreamStatus::Paused
        );
        assert_eq!(
            stream.apply_inbound(StreamKind::Resume, &envelope()),
            StreamStatus::Active
        );
    }

    #[test]
    fn closed_stream_emits_nothing_further() {
        let (mut stream, mut rx) = stream();
        stream.apply_inbound(StreamKind::Ready, &envelope());
        stream.close();
        stream.close(); // idempotent
        let after = stream.apply_inbound(
            StreamKind::Message,
            &envelope().with_data(Value::from("late")),
        );
        assert_eq!(after, StreamStatus::Closed);

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev);
        }
        assert_eq!(seen, vec![StreamEvent::Ready, StreamEvent::Closed]);
    }

    #[test]
    fn paused_stream_drops_messages() {
        let (mut stream, mut rx) = stream();
        stream.apply_inbound(StreamKind::Ready, &envelope());
        stream.apply_inbound(StreamKind::Pause, &envelope());
        stream.apply_inbound(
            StreamKind::Message,
            &envelope().with_data(Value::from("quiet")),
        );
        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev);
        }
        assert_eq!(seen, vec![StreamEvent::Ready, StreamEvent::Paused]);
    }
}
