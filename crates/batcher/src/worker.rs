//! Flush worker.

use crate::queue::BatchQueue;
use crate::sink::BatchSink;
use relay_core::{BatcherConfig, Error, Result, SessionBatch};
use std::sync::Arc;
use std::time::Instant;
use telemetry::{health, metrics};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Write-behind batcher: non-blocking enqueue below the hard cap, one
/// logical flush pipeline.
pub struct Batcher {
    queue: BatchQueue,
    sink: Arc<dyn BatchSink>,
    config: BatcherConfig,
    /// Serializes flushes. The timed worker and producers at the hard cap
    /// both drive [`Batcher::flush_once`]; drain order must equal apply
    /// order, so only one flush runs at a time.
    flush_lock: Mutex<()>,
}

impl Batcher {
    pub fn new(sink: Arc<dyn BatchSink>, config: BatcherConfig) -> Self {
        Self {
            queue: BatchQueue::new(),
            sink,
            config,
            flush_lock: Mutex::new(()),
        }
    }

    /// Enqueues a batch.
    ///
    /// Below twice the flush size this returns immediately and the timed
    /// worker picks the batch up. At the hard cap the producer itself
    /// flushes, and keeps flushing until the depth falls back under the
    /// cap, so queue memory stays bounded no matter how far the store
    /// lags. A failed flush re-queues its run and stops the spin; the
    /// timed worker retries it.
    pub async fn enqueue(&self, batch: SessionBatch) {
        let depth = self.queue.push(batch);
        metrics().batches_enqueued.inc();
        metrics().queue_depth.set(depth as u64);

        while self.queue.len() >= self.config.pressure_threshold() {
            debug!(
                depth = self.queue.len(),
                "Batch queue at hard cap, flushing from producer"
            );
            if self.flush_once().await.is_err() {
                break;
            }
        }
    }

    /// Current queue depth.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Drains up to `batch_size` entries and applies them in one transaction.
    ///
    /// On failure the drained run goes back to the head of the queue in
    /// order, and the batcher health component degrades until a flush
    /// succeeds again.
    pub async fn flush_once(&self) -> Result<usize> {
        let _flushing = self.flush_lock.lock().await;

        let drained = self.queue.drain(self.config.batch_size);
        if drained.is_empty() {
            return Ok(0);
        }

        let count = drained.len();
        let start = Instant::now();

        match self.sink.apply(&drained).await {
            Ok(()) => {
                metrics().batches_flushed.inc_by(count as u64);
                metrics()
                    .flush_latency_ms
                    .observe(start.elapsed().as_millis() as u64);
                metrics().queue_depth.set(self.queue.len() as u64);
                health().batcher.set_healthy();

                debug!(
                    count = count,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Flushed batches"
                );
                Ok(count)
            }
            Err(e) => {
                metrics().flush_errors.inc();
                health().batcher.set_unhealthy(e.to_string());
                warn!(count = count, error = %e, "Flush failed, re-queueing batches");

                self.queue.requeue_front(drained);
                metrics().queue_depth.set(self.queue.len() as u64);
                Err(e)
            }
        }
    }

    /// Starts the timed flush task.
    pub fn start_flush_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let batcher = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(batcher.config.interval());
            // The first tick resolves immediately; consume it.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                // Errors are already logged and the run re-queued; the next
                // tick retries it.
                let _ = batcher.flush_once().await;
            }
        })
    }

    /// Drains and flushes everything left in the queue.
    ///
    /// Called during graceful shutdown, after the flush task has been
    /// stopped. Gives up after repeated consecutive failures rather than
    /// spinning against a dead store.
    pub async fn shutdown(&self) -> Result<()> {
        let mut consecutive_failures = 0u32;

        while !self.queue.is_empty() {
            match self.flush_once().await {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= 3 {
                        error!(
                            remaining = self.queue.len(),
                            "Abandoning shutdown flush after repeated failures"
                        );
                        return Err(Error::database(format!(
                            "shutdown flush failed: {}",
                            e
                        )));
                    }
                }
            }
        }

        info!("Batcher drained");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use serde_json::json;

    fn batch(id: &str, events: Vec<serde_json::Value>) -> SessionBatch {
        SessionBatch {
            session_id: id.to_string(),
            user_id: "u1".to_string(),
            metadata: json!({}),
            is_active: true,
            events,
            errors: Vec::new(),
        }
    }

    fn small_batcher(sink: &MemorySink) -> Batcher {
        Batcher::new(
            Arc::new(sink.clone()),
            BatcherConfig {
                batch_size: 3,
                batch_interval_ms: 10,
            },
        )
    }

    #[tokio::test]
    async fn test_flush_applies_in_order() {
        let sink = MemorySink::new();
        let batcher = small_batcher(&sink);

        for id in ["a", "b", "c"] {
            batcher.enqueue(batch(id, vec![])).await;
        }

        let flushed = batcher.flush_once().await.unwrap();
        assert_eq!(flushed, 3);
        assert_eq!(batcher.queue_depth(), 0);

        let ids: Vec<String> = sink.applied().iter().map(|b| b.session_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_flush_drains_at_most_batch_size() {
        let sink = MemorySink::new();
        let batcher = small_batcher(&sink);

        for i in 0..5 {
            batcher.enqueue(batch(&format!("s{i}"), vec![])).await;
        }

        assert_eq!(batcher.flush_once().await.unwrap(), 3);
        assert_eq!(batcher.queue_depth(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_flushes_synchronously_at_hard_cap() {
        let sink = MemorySink::new();
        let batcher = small_batcher(&sink);

        // Five enqueues stay below the cap of 6: nothing is applied yet.
        for i in 0..5 {
            batcher.enqueue(batch(&format!("s{i}"), vec![])).await;
        }
        assert_eq!(sink.applied_count(), 0);

        // The sixth hits the cap; the producer flushes before returning.
        batcher.enqueue(batch("s5", vec![])).await;
        assert_eq!(sink.applied_count(), 3);
        assert_eq!(batcher.queue_depth(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_spins_until_below_cap() {
        let sink = MemorySink::new();
        // Cap of 2: every enqueue past the first drives a full drain.
        let batcher = Batcher::new(
            Arc::new(sink.clone()),
            BatcherConfig {
                batch_size: 1,
                batch_interval_ms: 10,
            },
        );

        for i in 0..4 {
            batcher.enqueue(batch(&format!("s{i}"), vec![])).await;
        }

        // Depth never exceeds the cap once enqueue returns.
        assert!(batcher.queue_depth() < 2);
        assert_eq!(sink.applied_count(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_stops_spinning_on_sink_failure() {
        let sink = MemorySink::new();
        let batcher = small_batcher(&sink);
        sink.set_should_fail(true);

        for i in 0..7 {
            batcher.enqueue(batch(&format!("s{i}"), vec![])).await;
        }

        // Nothing applied, nothing dropped: the whole backlog is intact.
        assert_eq!(sink.applied_count(), 0);
        assert_eq!(batcher.queue_depth(), 7);

        sink.set_should_fail(false);
        batcher.shutdown().await.unwrap();
        assert_eq!(sink.applied_count(), 7);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_in_order() {
        let sink = MemorySink::new();
        let batcher = small_batcher(&sink);

        for id in ["a", "b", "c"] {
            batcher.enqueue(batch(id, vec![])).await;
        }

        sink.set_should_fail(true);
        assert!(batcher.flush_once().await.is_err());
        assert_eq!(batcher.queue_depth(), 3);
        assert_eq!(sink.applied_count(), 0);

        sink.set_should_fail(false);
        batcher.flush_once().await.unwrap();

        let ids: Vec<String> = sink.applied().iter().map(|b| b.session_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything() {
        let sink = MemorySink::new();
        let batcher = small_batcher(&sink);

        for i in 0..10 {
            batcher.enqueue(batch(&format!("s{i}"), vec![])).await;
        }

        batcher.shutdown().await.unwrap();
        assert_eq!(batcher.queue_depth(), 0);
        assert_eq!(sink.applied_count(), 10);
    }

    #[tokio::test]
    async fn test_per_session_event_order_survives_retry() {
        let sink = MemorySink::new();
        let batcher = small_batcher(&sink);

        batcher.enqueue(batch("s1", vec![json!({"k": 1})])).await;
        batcher.enqueue(batch("s1", vec![json!({"k": 2})])).await;

        sink.set_should_fail(true);
        let _ = batcher.flush_once().await;
        sink.set_should_fail(false);
        batcher.flush_once().await.unwrap();

        let events: Vec<i64> = sink
            .applied()
            .iter()
            .flat_map(|b| b.events.iter())
            .map(|e| e["k"].as_i64().unwrap())
            .collect();
        assert_eq!(events, vec![1, 2]);
    }
}
