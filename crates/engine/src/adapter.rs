//! Worker adapter: the control-plane handle over one execution context.

use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use serde_json::Value;
use tidepool_core::{Frame, PoolError};
use tokio::sync::oneshot;

use crate::api::WorkerStatus;
use crate::transport::Transport;

/// Exponential-moving-average weight for per-worker task durations.
const DURATION_EMA_ALPHA: f64 = 0.2;

struct QueuedSend {
    priority: i32,
    seq: u64,
    frame: Frame,
}

impl PartialEq for QueuedSend {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedSend {}

impl PartialOrd for QueuedSend {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedSend {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority first, then oldest enqueue.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

pub(crate) struct WorkerAdapter {
    id: String,
    status: WorkerStatus,
    transport: Box<dyn Transport>,

    send_queue: BinaryHeap<QueuedSend>,
    send_queue_limit: usize,
    send_seq: u64,

    pending_calls: HashMap<String, oneshot::Sender<Result<Value, PoolError>>>,

    pub(crate) active_task: Option<String>,
    pub(crate) idle_since: Option<Instant>,
    pub(crate) busy_since: Option<Instant>,
    pub(crate) created_at: Instant,
    pub(crate) last_active_at: Instant,

    pub(crate) completed_tasks: u64,
    pub(crate) errors: u64,
    pub(crate) avg_task_ms: f64,
}

impl WorkerAdapter {
    pub(crate) fn new(id: String, transport: Box<dyn Transport>, send_queue_limit: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            status: WorkerStatus::Starting,
            transport,
            send_queue: BinaryHeap::new(),
            send_queue_limit,
            send_seq: 0,
            pending_calls: HashMap::new(),
            active_task: None,
            idle_since: None,
            busy_since: None,
            created_at: now,
            last_active_at: now,
            completed_tasks: 0,
            errors: 0,
            avg_task_ms: 0.0,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        self.status
    }

    /// Observability snapshot of this worker.
    pub(crate) fn info(&self, worker_type: &str) -> crate::api::WorkerInfo {
        crate::api::WorkerInfo {
            worker_id: self.id.clone(),
            worker_type: worker_type.to_string(),
            status: self.status,
            active_tasks: usize::from(self.active_task.is_some()),
            completed_tasks: self.completed_tasks,
            errors: self.errors,
            avg_task_duration_ms: self.avg_task_ms,
            uptime_ms: self.created_at.elapsed().as_millis() as u64,
            last_active_ms: self.last_active_at.elapsed().as_millis() as u64,
        }
    }

    /// Fire-and-forget send. Refused once the adapter is terminating.
    pub(crate) fn post(&mut self, frame: Frame) -> Result<(), PoolError> {
        if self.refuses_sends() {
            return Err(PoolError::TerminatedWorker(self.id.clone()));
        }
        self.transport
            .post(frame)
            .map_err(|_| PoolError::TerminatedWorker(self.id.clone()))
    }

    /// Enqueues a frame on the bounded priority send queue; the control
    /// loop drains it in priority order.
    pub(crate) fn post_prioritized(&mut self, frame: Frame, priority: i32) -> Result<(), PoolError> {
        if self.refuses_sends() {
            return Err(PoolError::TerminatedWorker(self.id.clone()));
        }
        if self.send_queue.len() >= self.send_queue_limit {
            return Err(PoolError::SendQueueFull(self.id.clone()));
        }
        let seq = self.send_seq;
        self.send_seq += 1;
        self.send_queue.push(QueuedSend {
            priority,
            seq,
            frame,
        });
        Ok(())
    }

    /// Drains the priority send queue. A transport failure surfaces as
    /// `TerminatedWorker`; remaining frames are discarded.
    pub(crate) fn flush_sends(&mut self) -> Result<(), PoolError> {
        while let Some(queued) = self.send_queue.pop() {
            if let Err(err) = self.post(queued.frame) {
                self.send_queue.clear();
                return Err(err);
            }
        }
        Ok(())
    }

    /// One-shot request/response: posts `start-task` and resolves the
    /// returned channel on the matching terminal frame. Used by embedders
    /// driving an adapter directly; the dispatcher keeps its own index.
    pub(crate) fn start_task(
        &mut self,
        task_id: String,
        data: Value,
    ) -> oneshot::Receiver<Result<Value, PoolError>> {
        let (tx, rx) = oneshot::channel();
        match self.post(Frame::StartTask {
            task_id: task_id.clone(),
            data,
        }) {
            Ok(()) => {
                self.pending_calls.insert(task_id, tx);
            }
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        }
        rx
    }

    /// Routes an inbound frame through the adapter. Frames answering a
    /// pending `start_task` call are consumed; everything else is handed
    /// back for pool-level routing.
    pub(crate) fn handle_inbound(&mut self, frame: Frame) -> Option<Frame> {
        self.last_active_at = Instant::now();
        match &frame {
            Frame::TaskCompleted { task_id, result } => {
                if let Some(tx) = self.pending_calls.remove(task_id) {
                    let _ = tx.send(Ok(result.clone()));
                    return None;
                }
            }
            Frame::TaskFailed { task_id, error } => {
                if let Some(tx) = self.pending_calls.remove(task_id) {
                    let _ = tx.send(Err(PoolError::TaskFailed(error.clone())));
                    return None;
                }
            }
            _ => {}
        }
        Some(frame)
    }

    /// Applies a status transition, honoring the absorbing states: once
    /// `Terminated` nothing changes, and `Error` can only move on to
    /// termination. Returns the applied status.
    pub(crate) fn set_status(&mut self, status: WorkerStatus) -> WorkerStatus {
        match (self.status, status) {
            (WorkerStatus::Terminated, _) => return self.status,
            (WorkerStatus::Error, WorkerStatus::Terminating | WorkerStatus::Terminated) => {}
            (WorkerStatus::Error, _) => return self.status,
            _ => {}
        }
        self.status = status;
        match status {
            WorkerStatus::Idle => {
                self.idle_since = Some(Instant::now());
                self.busy_since = None;
            }
            WorkerStatus::Busy => {
                self.idle_since = None;
                self.busy_since = Some(Instant::now());
            }
            _ => {
                self.idle_since = None;
                self.busy_since = None;
            }
        }
        self.status
    }

    /// Graceful or forced close. After this the adapter refuses sends.
    pub(crate) fn terminate(&mut self, force: bool) {
        if matches!(self.status, WorkerStatus::Terminated) {
            return;
        }
        self.transport.close(force);
        self.set_status(WorkerStatus::Terminating);
        self.fail_pending(PoolError::TerminatedWorker(self.id.clone()));
    }

    /// Rejects every pending `start_task` call.
    pub(crate) fn fail_pending(&mut self, error: PoolError) {
        for (_, tx) in self.pending_calls.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub(crate) fn record_completion(&mut self, duration: Duration) {
        self.completed_tasks += 1;
        let ms = duration.as_secs_f64() * 1000.0;
        if self.avg_task_ms == 0.0 {
            self.avg_task_ms = ms;
        } else {
            self.avg_task_ms =
                self.avg_task_ms * (1.0 - DURATION_EMA_ALPHA) + ms * DURATION_EMA_ALPHA;
        }
    }

    pub(crate) fn record_error(&mut self) {
        self.errors += 1;
    }

    fn refuses_sends(&self) -> bool {
        matches!(
            self.status,
            WorkerStatus::Terminating | WorkerStatus::Terminated
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportClosed};

    struct SinkTransport;

    impl Transport for SinkTransport {
        fn post(&mut self, _frame: Frame) -> Result<(), TransportClosed> {
            Ok(())
        }

        fn close(&mut self, _force: bool) {}
    }

    fn adapter_with_limit(limit: usize) -> WorkerAdapter {
        WorkerAdapter::new("worker-0-0".into(), Box::new(SinkTransport), limit)
    }

    #[test]
    fn send_queue_overflow_is_reported() {
        let mut adapter = adapter_with_limit(2);
        adapter.post_prioritized(Frame::Ping, 0).unwrap();
        adapter.post_prioritized(Frame::Ping, 1).unwrap();
        let err = adapter.post_prioritized(Frame::Ping, 2).unwrap_err();
        assert!(matches!(err, PoolError::SendQueueFull(_)));
    }

    #[test]
    fn terminated_adapter_refuses_sends() {
        let mut adapter = adapter_with_limit(4);
        adapter.terminate(false);
        let err = adapter.post(Frame::Ping).unwrap_err();
        assert!(matches!(err, PoolError::TerminatedWorker(_)));
        let err = adapter.post_prioritized(Frame::Ping, 0).unwrap_err();
        assert!(matches!(err, PoolError::TerminatedWorker(_)));
    }

    #[test]
    fn error_status_only_moves_toward_termination() {
        let mut adapter = adapter_with_limit(4);
        adapter.set_status(WorkerStatus::Error);
        assert_eq!(adapter.set_status(WorkerStatus::Idle), WorkerStatus::Error);
        assert_eq!(
            adapter.set_status(WorkerStatus::Terminating),
            WorkerStatus::Terminating
        );
        adapter.set_status(WorkerStatus::Terminated);
        assert_eq!(
            adapter.set_status(WorkerStatus::Idle),
            WorkerStatus::Terminated
        );
    }

    #[test]
    fn start_task_resolves_on_matching_terminal_frame() {
        let mut adapter = adapter_with_limit(4);
        let rx = adapter.start_task("task-9".into(), serde_json::json!({"n": 1}));

        // A frame for some other task passes through untouched.
        let other = Frame::TaskCompleted {
            task_id: "task-8".into(),
            result: serde_json::Value::Null,
        };
        assert!(adapter.handle_inbound(other).is_some());

        let done = Frame::TaskCompleted {
            task_id: "task-9".into(),
            result: serde_json::json!(5),
        };
        assert!(adapter.handle_inbound(done).is_none());
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), serde_json::json!(5));
    }
}
