//! Thread-backed execution context for blocking worker scripts.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tidepool_core::error::panic_message;
use tidepool_core::Frame;
use tokio::sync::mpsc::UnboundedSender;

use super::script::ScriptIo;
use super::{AdapterEvent, ExitGuard, Transport, TransportClosed};

pub(crate) struct ThreadTransport {
    sender: Option<std::sync::mpsc::Sender<Frame>>,
}

impl ThreadTransport {
    pub(crate) fn spawn(
        worker_id: &str,
        body: Box<dyn FnOnce(ScriptIo) + Send + 'static>,
        events: UnboundedSender<AdapterEvent>,
    ) -> std::io::Result<Self> {
        let (sender, inbox) = std::sync::mpsc::channel::<Frame>();
        let io = ScriptIo {
            worker_id: worker_id.to_string(),
            inbox,
            outbox: events.clone(),
        };
        let guard = ExitGuard::new(worker_id.to_string(), events);

        std::thread::Builder::new()
            .name(format!("tidepool-{worker_id}"))
            .spawn(move || match catch_unwind(AssertUnwindSafe(|| body(io))) {
                Ok(()) => guard.exit(0),
                Err(payload) => {
                    guard.error(panic_message(payload.as_ref()));
                    guard.exit(1);
                }
            })?;

        Ok(Self {
            sender: Some(sender),
        })
    }
}

impl Transport for ThreadTransport {
    fn post(&mut self, frame: Frame) -> Result<(), TransportClosed> {
        let sender = self.sender.as_ref().ok_or(TransportClosed)?;
        sender.send(frame).map_err(|_| TransportClosed)
    }

    fn close(&mut self, force: bool) {
        if force {
            // Dropping the sender disconnects the script's inbox; the
            // thread is detached and exits at its next receive.
            self.sender = None;
        } else if let Some(sender) = &self.sender {
            let _ = sender.send(Frame::Terminate);
        }
    }
}
