//! Canvas wire types: commands, responses, unsolicited events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rendering context requested at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextType {
    /// 2D canvas context.
    #[serde(rename = "2d")]
    TwoD,
    /// WebGL 1 context.
    #[serde(rename = "webgl")]
    Webgl,
    /// WebGL 2 context.
    #[serde(rename = "webgl2")]
    Webgl2,
}

/// One command sent to the rendering worker. Each command carries a
/// unique id; the worker answers with a [`CanvasResponse`] echoing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasCommand {
    /// Correlation id, unique per manager.
    pub id: String,
    /// The operation.
    #[serde(flatten)]
    pub kind: CanvasCommandKind,
}

/// Canvas operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanvasCommandKind {
    /// Hands the surface to the worker. Sent once, first.
    Init {
        /// Context to create.
        context_type: ContextType,
        /// Context attributes, passed through verbatim.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attrs: Option<Value>,
        /// Surface width in CSS pixels.
        width: u32,
        /// Surface height in CSS pixels.
        height: u32,
        /// Device pixel ratio.
        device_pixel_ratio: f64,
    },
    /// Resizes the surface.
    Resize {
        /// New width in CSS pixels.
        width: u32,
        /// New height in CSS pixels.
        height: u32,
        /// Device pixel ratio.
        device_pixel_ratio: f64,
    },
    /// Clears the surface.
    Clear,
    /// Renders one frame.
    Render {
        /// Application-defined render parameters.
        params: Value,
    },
    /// Releases the surface and worker-side resources.
    Dispose,
    /// Application-specific command.
    Custom {
        /// Command name.
        name: String,
        /// Command parameters.
        params: Value,
    },
}

/// Worker reply to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasResponse {
    /// Correlation id of the command being answered.
    pub id: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure description on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CanvasResponse {
    /// Successful response.
    pub fn ok(id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id: id.into(),
            success: true,
            data,
            error: None,
        }
    }

    /// Failed response.
    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Unsolicited notifications from the rendering worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CanvasEvent {
    /// The worker finished loading and owns the surface.
    Ready,
    /// One frame finished rendering.
    RenderComplete {
        /// Frame wall-clock time in milliseconds.
        frame_time_ms: f64,
    },
    /// Worker-defined metrics payload.
    Metrics {
        /// The metrics.
        data: Value,
    },
}

/// Everything the worker side may send back over the port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CanvasWorkerMessage {
    /// Reply to a command.
    Response(CanvasResponse),
    /// Unsolicited event.
    Event(CanvasEvent),
}

/// Surface dimensions observed by the resize watcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceSize {
    /// Width in CSS pixels.
    pub width: u32,
    /// Height in CSS pixels.
    pub height: u32,
    /// Device pixel ratio.
    pub device_pixel_ratio: f64,
}

/// Transport-level canvas failures. Worker-reported command failures
/// stay inside [`CanvasResponse`] instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanvasError {
    /// The manager was disposed; no further commands are accepted.
    #[error("canvas manager disposed")]
    Disposed,
    /// The rendering worker is gone.
    #[error("canvas worker gone")]
    WorkerGone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_flatten_kind_next_to_id() {
        let command = CanvasCommand {
            id: "cmd-1".into(),
            kind: CanvasCommandKind::Resize {
                width: 800,
                height: 600,
                device_pixel_ratio: 2.0,
            },
        };
        let wire = serde_json::to_value(&command).unwrap();
        assert_eq!(wire["id"], "cmd-1");
        assert_eq!(wire["type"], "RESIZE");
        assert_eq!(wire["width"], 800);
    }

    #[test]
    fn worker_messages_distinguish_responses_from_events() {
        let response: CanvasWorkerMessage = serde_json::from_value(json!({
            "id": "cmd-2", "success": true, "data": {"ok": 1}
        }))
        .unwrap();
        assert!(matches!(response, CanvasWorkerMessage::Response(_)));

        let event: CanvasWorkerMessage =
            serde_json::from_value(json!({"type": "render-complete", "frame_time_ms": 4.2}))
                .unwrap();
        assert!(matches!(
            event,
            CanvasWorkerMessage::Event(CanvasEvent::RenderComplete { .. })
        ));
    }
}
