//! Internal event hub.
//!
//! Components never hold references to each other; they push events here
//! and the control loop drains the hub each pass, republishing the public
//! subset, recording log entries, and acting on restart requests.

use std::collections::VecDeque;

use tidepool_core::log::{LogEntry, LogLevel};

use crate::api::PoolEvent;

#[derive(Debug)]
pub(crate) enum HubEvent {
    Public(PoolEvent),
    Log(LogEntry),
    WorkerNeedsRestart {
        worker_type: String,
        worker_id: String,
    },
}

#[derive(Debug, Default)]
pub(crate) struct EventHub {
    queue: VecDeque<HubEvent>,
}

impl EventHub {
    pub(crate) fn public(&mut self, event: PoolEvent) {
        self.queue.push_back(HubEvent::Public(event));
    }

    pub(crate) fn log(&mut self, entry: LogEntry) {
        match entry.level {
            LogLevel::Debug => tracing::debug!(
                worker_id = entry.worker_id.as_deref(),
                task_id = entry.task_id.as_deref(),
                "{}",
                entry.message
            ),
            LogLevel::Info => tracing::info!(
                worker_id = entry.worker_id.as_deref(),
                task_id = entry.task_id.as_deref(),
                "{}",
                entry.message
            ),
            LogLevel::Warn => tracing::warn!(
                worker_id = entry.worker_id.as_deref(),
                task_id = entry.task_id.as_deref(),
                "{}",
                entry.message
            ),
            LogLevel::Error => tracing::error!(
                worker_id = entry.worker_id.as_deref(),
                task_id = entry.task_id.as_deref(),
                "{}",
                entry.message
            ),
        }
        self.queue.push_back(HubEvent::Log(entry));
    }

    pub(crate) fn needs_restart(&mut self, worker_type: String, worker_id: String) {
        self.queue.push_back(HubEvent::WorkerNeedsRestart {
            worker_type,
            worker_id,
        });
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = HubEvent> + '_ {
        self.queue.drain(..)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
