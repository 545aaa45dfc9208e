//! The main-thread canvas manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tidepool_core::ids::IdGenerator;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, oneshot, watch};

use crate::backend::CanvasBackend;
use crate::command::{
    CanvasCommand, CanvasCommandKind, CanvasError, CanvasEvent, CanvasResponse,
    CanvasWorkerMessage, SurfaceSize,
};

/// Channel pair connecting the manager to its rendering worker.
#[derive(Debug)]
pub struct CanvasPort {
    /// Commands toward the worker.
    pub commands: UnboundedSender<CanvasCommand>,
    /// Responses and events back from the worker.
    pub messages: UnboundedReceiver<CanvasWorkerMessage>,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<CanvasResponse>>>>;

enum Mode {
    /// Commands cross to a rendering worker; responses come back by id.
    Offscreen {
        commands: UnboundedSender<CanvasCommand>,
        pending: PendingMap,
    },
    /// No off-main-thread surface support: commands execute inline
    /// against the backend, same shapes, synchronous.
    Fallback { backend: Box<dyn CanvasBackend> },
}

/// Controls one canvas surface through the command protocol, whether
/// the rendering happens on a worker or inline.
pub struct CanvasManager {
    ids: IdGenerator,
    mode: Mode,
    events: broadcast::Sender<CanvasEvent>,
    resize_rx: Option<watch::Receiver<SurfaceSize>>,
    disposed: bool,
}

impl CanvasManager {
    /// Manager driving a rendering worker over `port`.
    pub fn offscreen(port: CanvasPort) -> Self {
        let (events, _) = broadcast::channel(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let mut messages = port.messages;
        let router_pending = pending.clone();
        let router_events = events.clone();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                match message {
                    CanvasWorkerMessage::Response(response) => {
                        let waiter = router_pending
                            .lock()
                            .ok()
                            .and_then(|mut map| map.remove(&response.id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => {
                                tracing::warn!(id = %response.id, "response for unknown command");
                            }
                        }
                    }
                    CanvasWorkerMessage::Event(event) => {
                        let _ = router_events.send(event);
                    }
                }
            }
        });

        Self {
            ids: IdGenerator::new("cmd"),
            mode: Mode::Offscreen {
                commands: port.commands,
                pending,
            },
            events,
            resize_rx: None,
            disposed: false,
        }
    }

    /// Manager degraded to inline main-thread rendering.
    pub fn fallback(backend: Box<dyn CanvasBackend>) -> Self {
        let (events, _) = broadcast::channel(64);
        tracing::info!("offscreen canvas unavailable; using inline fallback rendering");
        Self {
            ids: IdGenerator::new("cmd"),
            mode: Mode::Fallback { backend },
            events,
            resize_rx: None,
            disposed: false,
        }
    }

    /// True when commands execute inline on the calling thread.
    pub fn is_fallback(&self) -> bool {
        matches!(self.mode, Mode::Fallback { .. })
    }

    /// Subscribes to unsolicited worker events (`ready`, render
    /// completion, metrics).
    pub fn subscribe(&self) -> broadcast::Receiver<CanvasEvent> {
        self.events.subscribe()
    }

    /// Wires a resize observer: observed size changes are applied as
    /// `RESIZE` commands before the next command executes.
    pub fn watch_resize(&mut self, sizes: watch::Receiver<SurfaceSize>) {
        self.resize_rx = Some(sizes);
    }

    /// Sends one command and waits for the worker's response (or, on the
    /// fallback path, executes it inline and synthesizes the response).
    pub async fn send_command(
        &mut self,
        kind: CanvasCommandKind,
    ) -> Result<CanvasResponse, CanvasError> {
        if self.disposed {
            return Err(CanvasError::Disposed);
        }
        self.apply_pending_resize().await?;
        let disposing = matches!(kind, CanvasCommandKind::Dispose);
        let response = self.dispatch(kind).await?;
        if disposing {
            self.disposed = true;
        }
        Ok(response)
    }

    async fn apply_pending_resize(&mut self) -> Result<(), CanvasError> {
        let Some(rx) = &mut self.resize_rx else {
            return Ok(());
        };
        if !rx.has_changed().unwrap_or(false) {
            return Ok(());
        }
        let size = *rx.borrow_and_update();
        let _ = self
            .dispatch(CanvasCommandKind::Resize {
                width: size.width,
                height: size.height,
                device_pixel_ratio: size.device_pixel_ratio,
            })
            .await?;
        Ok(())
    }

    async fn dispatch(&mut self, kind: CanvasCommandKind) -> Result<CanvasResponse, CanvasError> {
        let id = self.ids.next_id();
        match &mut self.mode {
            Mode::Offscreen { commands, pending } => {
                let (tx, rx) = oneshot::channel();
                if let Ok(mut map) = pending.lock() {
                    map.insert(id.clone(), tx);
                }
                commands
                    .send(CanvasCommand {
                        id: id.clone(),
                        kind,
                    })
                    .map_err(|_| CanvasError::WorkerGone)?;
                rx.await.map_err(|_| CanvasError::WorkerGone)
            }
            Mode::Fallback { backend } => Ok(execute_inline(backend.as_mut(), &id, kind, &self.events)),
        }
    }
}

/// Fallback semantics: the command shape executes synchronously against
/// a 2D backend, returning the same response shape the worker would.
fn execute_inline(
    backend: &mut dyn CanvasBackend,
    id: &str,
    kind: CanvasCommandKind,
    events: &broadcast::Sender<CanvasEvent>,
) -> CanvasResponse {
    let result = match kind {
        CanvasCommandKind::Init {
            width,
            height,
            device_pixel_ratio,
            attrs,
            ..
        } => backend
            .init(width, height, device_pixel_ratio, attrs.as_ref())
            .map(|()| {
                let _ = events.send(CanvasEvent::Ready);
                None
            }),
        CanvasCommandKind::Resize {
            width,
            height,
            device_pixel_ratio,
        } => backend.resize(width, height, device_pixel_ratio).map(|()| None),
        CanvasCommandKind::Clear => backend.clear().map(|()| None),
        CanvasCommandKind::Render { params } => backend.render(&params),
        CanvasCommandKind::Dispose => backend.dispose().map(|()| None),
        CanvasCommandKind::Custom { name, params } => backend.custom(&name, &params),
    };
    match result {
        Ok(data) => CanvasResponse::ok(id, data),
        Err(error) => CanvasResponse::err(id, error),
    }
}
