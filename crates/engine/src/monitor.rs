//! Worker monitor: stats sampling, health checks, diagnostic log ring.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tidepool_core::log::{LogEntry, LogLevel, LogRing};

use crate::api::PoolStats;
use crate::dispatcher::TaskDispatcher;
use crate::hub::EventHub;
use crate::manager::WorkerManager;

#[derive(Debug, Clone)]
pub(crate) struct MonitorConfig {
    pub(crate) metrics_interval: Duration,
    pub(crate) health_check_interval: Duration,
    pub(crate) suspected_hang: Duration,
    pub(crate) max_log_entries: usize,
}

pub(crate) struct WorkerMonitor {
    cfg: MonitorConfig,
    ring: LogRing,
    next_metrics: Instant,
    next_health: Instant,
}

impl WorkerMonitor {
    pub(crate) fn new(cfg: MonitorConfig) -> Self {
        let now = Instant::now();
        Self {
            ring: LogRing::new(cfg.max_log_entries),
            next_metrics: now + cfg.metrics_interval,
            next_health: now + cfg.health_check_interval,
            cfg,
        }
    }

    pub(crate) fn record(&mut self, entry: LogEntry) {
        self.ring.push(entry);
    }

    pub(crate) fn logs(&self, min_level: Option<LogLevel>) -> Vec<LogEntry> {
        self.ring.entries(min_level)
    }

    /// Runs whichever periodic duties are due. Returns a fresh stats
    /// sample when the metrics interval elapsed.
    pub(crate) fn on_tick(
        &mut self,
        now: Instant,
        dispatcher: &TaskDispatcher,
        managers: &mut HashMap<String, WorkerManager>,
        hub: &mut EventHub,
    ) -> Option<PoolStats> {
        if now >= self.next_health {
            self.next_health = now + self.cfg.health_check_interval;
            for manager in managers.values_mut() {
                manager.check_health(now, self.cfg.suspected_hang, hub);
            }
        }
        if now >= self.next_metrics {
            self.next_metrics = now + self.cfg.metrics_interval;
            return Some(self.sample(dispatcher, managers));
        }
        None
    }

    /// Recomputes the stats snapshot from live state.
    pub(crate) fn sample(
        &self,
        dispatcher: &TaskDispatcher,
        managers: &HashMap<String, WorkerManager>,
    ) -> PoolStats {
        let (completed, failed, cancelled, avg_task_duration_ms) = dispatcher.counters();
        PoolStats {
            worker_count: managers.values().map(|m| m.active_count()).sum(),
            idle: managers.values().map(|m| m.idle_count()).sum(),
            busy: managers.values().map(|m| m.busy_count()).sum(),
            queued_tasks: dispatcher.queued_count(),
            running_tasks: dispatcher.running_count(),
            completed,
            failed,
            cancelled,
            total_processed: completed + failed + cancelled,
            avg_task_duration_ms,
        }
    }
}
