//! Execution-context transports.
//!
//! A transport is the one-way-send, reply-by-send channel between the
//! control plane and a single worker. The pool only depends on the
//! [`Transport`] trait plus the event fan-in; whether the worker is a
//! dedicated OS thread or a spawned task is decided by the flavor of the
//! script it runs.

pub(crate) mod local;
pub(crate) mod script;
pub(crate) mod thread;

use tidepool_core::Frame;
use tokio::sync::mpsc::UnboundedSender;

use script::WorkerScript;

/// Something a worker's execution context reported to the control plane.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// A protocol frame emitted by the worker script.
    Message(Frame),
    /// The execution context failed (panic or abnormal termination).
    Error(String),
    /// The execution context is gone. Fires exactly once per worker.
    Exit(i32),
}

/// A transport event tagged with the worker it came from; every worker
/// funnels into one shared control-plane channel.
#[derive(Debug)]
pub(crate) struct AdapterEvent {
    pub(crate) worker_id: String,
    pub(crate) event: TransportEvent,
}

/// Exit code reported when a context is forcibly discarded.
pub(crate) const EXIT_KILLED: i32 = 130;

/// Control-plane handle to one execution context.
pub(crate) trait Transport: Send {
    /// Delivers a frame to the worker. Fails once the context is closed
    /// or gone.
    fn post(&mut self, frame: Frame) -> Result<(), TransportClosed>;

    /// Graceful close posts `terminate` and lets the context drain;
    /// forced close discards the context immediately.
    fn close(&mut self, force: bool);
}

/// The worker side of the channel is closed.
#[derive(Debug)]
pub(crate) struct TransportClosed;

/// Spawns the execution context for a script: a dedicated thread for
/// blocking scripts, a task for async ones.
pub(crate) fn spawn(
    worker_id: &str,
    script: WorkerScript,
    events: UnboundedSender<AdapterEvent>,
) -> std::io::Result<Box<dyn Transport>> {
    match script {
        WorkerScript::Blocking(body) => {
            Ok(Box::new(thread::ThreadTransport::spawn(worker_id, body, events)?))
        }
        WorkerScript::Async(body) => {
            Ok(Box::new(local::LocalTransport::spawn(worker_id, body, events)))
        }
    }
}

/// Sends `Error`/`Exit` for one worker, guaranteeing a single `Exit`.
pub(crate) struct ExitGuard {
    worker_id: String,
    events: UnboundedSender<AdapterEvent>,
}

impl ExitGuard {
    pub(crate) fn new(worker_id: String, events: UnboundedSender<AdapterEvent>) -> Self {
        Self { worker_id, events }
    }

    pub(crate) fn error(&self, message: String) {
        let _ = self.events.send(AdapterEvent {
            worker_id: self.worker_id.clone(),
            event: TransportEvent::Error(message),
        });
    }

    /// Consumes the guard; the single `Exit` for this context.
    pub(crate) fn exit(self, code: i32) {
        let _ = self.events.send(AdapterEvent {
            worker_id: self.worker_id,
            event: TransportEvent::Exit(code),
        });
    }
}
