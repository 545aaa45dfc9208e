//! Monotonic-ish identifier generation.
//!
//! Ids are `{prefix}-{epoch_ms}-{seq}`: sortable enough for log
//! correlation, unique within a process thanks to the sequence counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local id source for one kind of entity.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: &'static str,
    seq: AtomicU64,
}

impl IdGenerator {
    /// Generator whose ids start with `prefix`.
    pub const fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            seq: AtomicU64::new(0),
        }
    }

    /// Next id.
    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis();
        format!("{}-{}-{}", self.prefix, now, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let ids = IdGenerator::new("task");
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with("task-"));
        assert!(b.starts_with("task-"));
    }
}
