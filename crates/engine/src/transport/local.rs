//! Task-backed execution context for async worker scripts, the in-process
//! analog of an isolated script worker.

use std::future::Future;
use std::pin::Pin;

use tidepool_core::error::panic_message;
use tidepool_core::Frame;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use super::script::AsyncScriptIo;
use super::{AdapterEvent, ExitGuard, Transport, TransportClosed, EXIT_KILLED};

pub(crate) struct LocalTransport {
    sender: Option<tokio::sync::mpsc::UnboundedSender<Frame>>,
    abort: AbortHandle,
}

impl LocalTransport {
    pub(crate) fn spawn(
        worker_id: &str,
        body: Box<
            dyn FnOnce(AsyncScriptIo) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static,
        >,
        events: UnboundedSender<AdapterEvent>,
    ) -> Self {
        let (sender, inbox) = tokio::sync::mpsc::unbounded_channel::<Frame>();
        let io = AsyncScriptIo {
            worker_id: worker_id.to_string(),
            inbox,
            outbox: events.clone(),
        };
        let guard = ExitGuard::new(worker_id.to_string(), events);

        let script = tokio::spawn(body(io));
        let abort = script.abort_handle();
        tokio::spawn(async move {
            match script.await {
                Ok(()) => guard.exit(0),
                Err(err) if err.is_panic() => {
                    guard.error(panic_message(err.into_panic().as_ref()));
                    guard.exit(1);
                }
                Err(_) => guard.exit(EXIT_KILLED),
            }
        });

        Self {
            sender: Some(sender),
            abort,
        }
    }
}

impl Transport for LocalTransport {
    fn post(&mut self, frame: Frame) -> Result<(), TransportClosed> {
        let sender = self.sender.as_ref().ok_or(TransportClosed)?;
        sender.send(frame).map_err(|_| TransportClosed)
    }

    fn close(&mut self, force: bool) {
        if force {
            self.sender = None;
            self.abort.abort();
        } else if let Some(sender) = &self.sender {
            let _ = sender.send(Frame::Terminate);
        }
    }
}
