//! FIFO queue of pending batches.

use parking_lot::Mutex;
use relay_core::SessionBatch;
use std::collections::VecDeque;

/// Bounded-intent FIFO shared between producers and the flush worker.
///
/// Drains take a prefix; a failed drain is pushed back at the head with its
/// relative order intact, so per-session arrival order survives retries.
#[derive(Default)]
pub struct BatchQueue {
    inner: Mutex<VecDeque<SessionBatch>>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a batch at the tail. Returns the new depth.
    pub fn push(&self, batch: SessionBatch) -> usize {
        let mut q = self.inner.lock();
        q.push_back(batch);
        q.len()
    }

    /// Removes and returns up to `max` entries from the head.
    pub fn drain(&self, max: usize) -> Vec<SessionBatch> {
        let mut q = self.inner.lock();
        let n = max.min(q.len());
        q.drain(..n).collect()
    }

    /// Puts a drained run back at the head, preserving its order.
    pub fn requeue_front(&self, batches: Vec<SessionBatch>) {
        let mut q = self.inner.lock();
        for batch in batches.into_iter().rev() {
            q.push_front(batch);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::SessionBatch;
    use serde_json::json;

    fn batch(id: &str) -> SessionBatch {
        SessionBatch {
            session_id: id.to_string(),
            user_id: "u".to_string(),
            metadata: json!({}),
            is_active: true,
            events: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_drain_takes_prefix() {
        let q = BatchQueue::new();
        for id in ["a", "b", "c"] {
            q.push(batch(id));
        }

        let drained = q.drain(2);
        let ids: Vec<&str> = drained.iter().map(|b| b.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_requeue_preserves_order() {
        let q = BatchQueue::new();
        for id in ["a", "b", "c", "d"] {
            q.push(batch(id));
        }

        let drained = q.drain(3);
        q.requeue_front(drained);

        let all = q.drain(4);
        let ids: Vec<&str> = all.iter().map(|b| b.session_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }
}
