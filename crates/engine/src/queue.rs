//! Per-worker-type queue of pending tasks.

use std::collections::VecDeque;

use tidepool_core::PoolError;

/// Ordering key and id of one queued task. The full record lives in the
/// dispatcher's index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueItem {
    pub(crate) task_id: String,
    pub(crate) priority: i32,
    /// Global submission sequence; preserved across re-enqueues so a
    /// retried task keeps its place within its priority class.
    pub(crate) seq: u64,
}

/// Bounded bag of queued tasks, ordered by priority descending then
/// submission sequence ascending. Ordering is stable: equal keys never
/// swap.
#[derive(Debug)]
pub(crate) struct TaskQueue {
    worker_type: String,
    items: VecDeque<QueueItem>,
    limit: usize,
}

impl TaskQueue {
    pub(crate) fn new(worker_type: String, limit: usize) -> Self {
        Self {
            worker_type,
            items: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub(crate) fn enqueue(&mut self, item: QueueItem) -> Result<(), PoolError> {
        if self.items.len() >= self.limit {
            return Err(PoolError::QueueFull {
                worker_type: self.worker_type.clone(),
                limit: self.limit,
            });
        }
        let at = self
            .items
            .iter()
            .position(|existing| {
                existing.priority < item.priority
                    || (existing.priority == item.priority && existing.seq > item.seq)
            })
            .unwrap_or(self.items.len());
        self.items.insert(at, item);
        Ok(())
    }

    pub(crate) fn dequeue(&mut self) -> Option<QueueItem> {
        self.items.pop_front()
    }

    pub(crate) fn peek(&self) -> Option<&QueueItem> {
        self.items.front()
    }

    pub(crate) fn remove(&mut self, task_id: &str) -> bool {
        if let Some(at) = self.items.iter().position(|item| item.task_id == task_id) {
            self.items.remove(at);
            true
        } else {
            false
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<QueueItem> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(task_id: &str, priority: i32, seq: u64) -> QueueItem {
        QueueItem {
            task_id: task_id.to_string(),
            priority,
            seq,
        }
    }

    #[test]
    fn higher_priority_dequeues_first() {
        let mut queue = TaskQueue::new("calc".into(), 10);
        queue.enqueue(item("a", 0, 0)).unwrap();
        queue.enqueue(item("b", 0, 1)).unwrap();
        queue.enqueue(item("c", 10, 2)).unwrap();

        assert_eq!(queue.dequeue().unwrap().task_id, "c");
        assert_eq!(queue.dequeue().unwrap().task_id, "a");
        assert_eq!(queue.dequeue().unwrap().task_id, "b");
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut queue = TaskQueue::new("calc".into(), 10);
        for (i, id) in ["x", "y", "z"].iter().enumerate() {
            queue.enqueue(item(id, 5, i as u64)).unwrap();
        }
        let order: Vec<String> = queue.snapshot().into_iter().map(|i| i.task_id).collect();
        assert_eq!(order, vec!["x", "y", "z"]);
    }

    #[test]
    fn reenqueued_task_keeps_its_place_in_class() {
        let mut queue = TaskQueue::new("calc".into(), 10);
        queue.enqueue(item("first", 0, 0)).unwrap();
        queue.enqueue(item("second", 0, 1)).unwrap();

        let retried = queue.dequeue().unwrap();
        assert_eq!(retried.task_id, "first");
        // Retry preserves the original sequence, so the task goes back
        // ahead of later submissions of the same priority.
        queue.enqueue(retried).unwrap();
        let order: Vec<String> = queue.snapshot().into_iter().map(|i| i.task_id).collect();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut queue = TaskQueue::new("calc".into(), 2);
        queue.enqueue(item("a", 0, 0)).unwrap();
        queue.enqueue(item("b", 0, 1)).unwrap();
        let err = queue.enqueue(item("c", 0, 2)).unwrap_err();
        assert!(matches!(err, PoolError::QueueFull { limit: 2, .. }));
    }

    #[test]
    fn remove_is_by_task_id() {
        let mut queue = TaskQueue::new("calc".into(), 10);
        queue.enqueue(item("a", 0, 0)).unwrap();
        queue.enqueue(item("b", 1, 1)).unwrap();
        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().task_id, "b");
    }
}
