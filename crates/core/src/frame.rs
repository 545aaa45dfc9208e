//! Worker wire protocol.
//!
//! Every message exchanged between the control plane and a worker is one
//! [`Frame`], a tagged record whose `type` field carries the wire name.
//! Task frames address a task by id; stream frames share the envelope
//! `{stream-id, data?, error?, timestamp}` and are multiplexed over the
//! same worker channel as task traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One protocol message, identified by its `type` field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Control → worker: begin one task. The worker must answer with
    /// exactly one of `task-completed` / `task-failed`.
    #[serde(rename = "start-task")]
    StartTask {
        /// Task being started.
        #[serde(rename = "task-id")]
        task_id: String,
        /// Task input payload.
        data: Value,
    },
    /// Control → worker: stop the named task and answer `task-failed`
    /// with a cancellation reason.
    #[serde(rename = "cancel-task")]
    CancelTask {
        /// Task being cancelled.
        #[serde(rename = "task-id")]
        task_id: String,
    },
    /// Control → worker: liveness probe, answered by `pong`.
    #[serde(rename = "ping")]
    Ping,
    /// Control → worker: finish the current frame and exit cleanly.
    #[serde(rename = "terminate")]
    Terminate,

    /// Worker → control: emitted once after the worker script has loaded.
    #[serde(rename = "worker-ready")]
    WorkerReady,
    /// Worker → control: progress report for a running task.
    #[serde(rename = "task-progress")]
    TaskProgress {
        /// Task the report belongs to.
        #[serde(rename = "task-id")]
        task_id: String,
        /// Opaque progress payload, forwarded to the submitter.
        progress: Value,
    },
    /// Worker → control: terminal success for one task.
    #[serde(rename = "task-completed")]
    TaskCompleted {
        /// Task that finished.
        #[serde(rename = "task-id")]
        task_id: String,
        /// Task result payload.
        result: Value,
    },
    /// Worker → control: terminal failure for one task.
    #[serde(rename = "task-failed")]
    TaskFailed {
        /// Task that failed.
        #[serde(rename = "task-id")]
        task_id: String,
        /// Failure description.
        error: String,
    },
    /// Worker → control: answer to `ping`.
    #[serde(rename = "pong")]
    Pong,

    /// Control → worker: open a stream; answered by `STREAM_READY`.
    #[serde(rename = "STREAM_INIT")]
    StreamInit(StreamEnvelope),
    /// Worker → control: the stream is ready to carry messages.
    #[serde(rename = "STREAM_READY")]
    StreamReady(StreamEnvelope),
    /// Either direction: one stream payload.
    #[serde(rename = "STREAM_MESSAGE")]
    StreamMessage(StreamEnvelope),
    /// Either direction: suspend delivery on the stream.
    #[serde(rename = "STREAM_PAUSE")]
    StreamPause(StreamEnvelope),
    /// Either direction: resume a paused stream.
    #[serde(rename = "STREAM_RESUME")]
    StreamResume(StreamEnvelope),
    /// Worker → control: the stream failed; a close follows.
    #[serde(rename = "STREAM_ERROR")]
    StreamError(StreamEnvelope),
    /// Either direction: close the stream; idempotent.
    #[serde(rename = "STREAM_CLOSE")]
    StreamClose(StreamEnvelope),
}

/// Shared body of every stream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// Stream the frame belongs to.
    #[serde(rename = "stream-id")]
    pub stream_id: String,
    /// Optional payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Optional error description (only on `STREAM_ERROR`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sender wall-clock stamp, epoch milliseconds.
    pub timestamp: i64,
}

impl StreamEnvelope {
    /// Envelope with the current wall-clock stamp and no payload.
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            data: None,
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Attaches a payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches an error description.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Lifecycle kind of a stream frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// `STREAM_INIT`
    Init,
    /// `STREAM_READY`
    Ready,
    /// `STREAM_MESSAGE`
    Message,
    /// `STREAM_PAUSE`
    Pause,
    /// `STREAM_RESUME`
    Resume,
    /// `STREAM_ERROR`
    Error,
    /// `STREAM_CLOSE`
    Close,
}

impl Frame {
    /// Splits a stream frame into its kind and envelope; `None` for task
    /// and lifecycle frames.
    pub fn as_stream(&self) -> Option<(StreamKind, &StreamEnvelope)> {
        match self {
            Frame::StreamInit(env) => Some((StreamKind::Init, env)),
            Frame::StreamReady(env) => Some((StreamKind::Ready, env)),
            Frame::StreamMessage(env) => Some((StreamKind::Message, env)),
            Frame::StreamPause(env) => Some((StreamKind::Pause, env)),
            Frame::StreamResume(env) => Some((StreamKind::Resume, env)),
            Frame::StreamError(env) => Some((StreamKind::Error, env)),
            Frame::StreamClose(env) => Some((StreamKind::Close, env)),
            _ => None,
        }
    }

    /// Builds a stream frame of the given kind around an envelope.
    pub fn stream(kind: StreamKind, envelope: StreamEnvelope) -> Self {
        match kind {
            StreamKind::Init => Frame::StreamInit(envelope),
            StreamKind::Ready => Frame::StreamReady(envelope),
            StreamKind::Message => Frame::StreamMessage(envelope),
            StreamKind::Pause => Frame::StreamPause(envelope),
            StreamKind::Resume => Frame::StreamResume(envelope),
            StreamKind::Error => Frame::StreamError(envelope),
            StreamKind::Close => Frame::StreamClose(envelope),
        }
    }

    /// Wire name of the frame (`type` field value).
    pub fn wire_name(&self) -> &'static str {
        match self {
            Frame::StartTask { .. } => "start-task",
            Frame::CancelTask { .. } => "cancel-task",
            Frame::Ping => "ping",
            Frame::Terminate => "terminate",
            Frame::WorkerReady => "worker-ready",
            Frame::TaskProgress { .. } => "task-progress",
            Frame::TaskCompleted { .. } => "task-completed",
            Frame::TaskFailed { .. } => "task-failed",
            Frame::Pong => "pong",
            Frame::StreamInit(_) => "STREAM_INIT",
            Frame::StreamReady(_) => "STREAM_READY",
            Frame::StreamMessage(_) => "STREAM_MESSAGE",
            Frame::StreamPause(_) => "STREAM_PAUSE",
            Frame::StreamResume(_) => "STREAM_RESUME",
            Frame::StreamError(_) => "STREAM_ERROR",
            Frame::StreamClose(_) => "STREAM_CLOSE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_frames_use_wire_names() {
        let frame = Frame::StartTask {
            task_id: "task-1".into(),
            data: json!({"a": 2, "b": 3}),
        };
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], "start-task");
        assert_eq!(wire["task-id"], "task-1");

        let back: Frame = serde_json::from_value(wire).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn stream_frames_carry_the_shared_envelope() {
        let frame = Frame::StreamMessage(
            StreamEnvelope::new("stream-7").with_data(json!("x")),
        );
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], "STREAM_MESSAGE");
        assert_eq!(wire["stream-id"], "stream-7");
        assert_eq!(wire["data"], "x");
        assert!(wire.get("error").is_none());

        let (kind, env) = frame.as_stream().expect("stream frame");
        assert_eq!(kind, StreamKind::Message);
        assert_eq!(env.stream_id, "stream-7");
    }

    #[test]
    fn task_frames_are_not_stream_frames() {
        assert!(Frame::Ping.as_stream().is_none());
        assert!(
            Frame::TaskCompleted {
                task_id: "t".into(),
                result: Value::Null,
            }
            .as_stream()
            .is_none()
        );
    }
}
