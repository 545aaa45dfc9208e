//! Worker scripts: the opaque bodies that execution contexts run.
//!
//! A script only ever sees its [`ScriptIo`] / [`AsyncScriptIo`] endpoints;
//! it receives protocol frames, does its work, and answers by sending
//! frames back. The engine never inspects what happens in between.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tidepool_core::env::ScriptLocator;
use tidepool_core::Frame;
use tokio::sync::mpsc::UnboundedSender;

use super::{AdapterEvent, TransportEvent};

/// Frame endpoints handed to a blocking script running on its own thread.
pub struct ScriptIo {
    pub(crate) worker_id: String,
    pub(crate) inbox: std::sync::mpsc::Receiver<Frame>,
    pub(crate) outbox: UnboundedSender<AdapterEvent>,
}

impl ScriptIo {
    /// Blocks until the next inbound frame. `None` means the control
    /// plane dropped the channel (forced termination); the script should
    /// return.
    pub fn recv(&mut self) -> Option<Frame> {
        self.inbox.recv().ok()
    }

    /// Sends a frame to the control plane. Silently dropped if the pool
    /// is already gone.
    pub fn send(&self, frame: Frame) {
        let _ = self.outbox.send(AdapterEvent {
            worker_id: self.worker_id.clone(),
            event: TransportEvent::Message(frame),
        });
    }
}

/// Frame endpoints handed to an async script running as a task.
pub struct AsyncScriptIo {
    pub(crate) worker_id: String,
    pub(crate) inbox: tokio::sync::mpsc::UnboundedReceiver<Frame>,
    pub(crate) outbox: UnboundedSender<AdapterEvent>,
}

impl AsyncScriptIo {
    /// Waits for the next inbound frame. `None` means the control plane
    /// dropped the channel (forced termination).
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbox.recv().await
    }

    /// Sends a frame to the control plane.
    pub fn send(&self, frame: Frame) {
        let _ = self.outbox.send(AdapterEvent {
            worker_id: self.worker_id.clone(),
            event: TransportEvent::Message(frame),
        });
    }
}

type BlockingBody = Box<dyn FnOnce(ScriptIo) + Send + 'static>;
type AsyncBody =
    Box<dyn FnOnce(AsyncScriptIo) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static>;

/// One instance of a worker script, ready to run.
pub enum WorkerScript {
    /// Runs on a dedicated OS thread; may block freely.
    Blocking(BlockingBody),
    /// Runs as a spawned task; must stay cooperative.
    Async(AsyncBody),
}

impl WorkerScript {
    /// Wraps a blocking script body.
    pub fn blocking(body: impl FnOnce(ScriptIo) + Send + 'static) -> Self {
        WorkerScript::Blocking(Box::new(body))
    }

    /// Wraps an async script body.
    pub fn spawned<F, Fut>(body: F) -> Self
    where
        F: FnOnce(AsyncScriptIo) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        WorkerScript::Async(Box::new(move |io| Box::pin(body(io))))
    }
}

impl fmt::Debug for WorkerScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerScript::Blocking(_) => f.write_str("WorkerScript::Blocking"),
            WorkerScript::Async(_) => f.write_str("WorkerScript::Async"),
        }
    }
}

/// A registered worker script: where it lives plus how to instantiate it.
#[derive(Clone)]
pub struct ScriptSpec {
    /// Resource locator of the script, for diagnostics and registry
    /// listings.
    pub locator: ScriptLocator,
    factory: Arc<dyn Fn() -> WorkerScript + Send + Sync>,
}

impl ScriptSpec {
    /// Spec producing a fresh script instance per worker.
    pub fn new(
        locator: ScriptLocator,
        factory: impl Fn() -> WorkerScript + Send + Sync + 'static,
    ) -> Self {
        Self {
            locator,
            factory: Arc::new(factory),
        }
    }

    pub(crate) fn instantiate(&self) -> WorkerScript {
        (self.factory)()
    }
}

impl fmt::Debug for ScriptSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptSpec")
            .field("locator", &self.locator)
            .finish_non_exhaustive()
    }
}
