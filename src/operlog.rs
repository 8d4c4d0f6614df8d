//! Operation log writer (C6).
//!
//! Grounded on the teacher's single-writer WAL worker (one thread owns the
//! persistence side, producers only enqueue), generalized from an
//! append-only binary record format to a JSON-detail row destined for a
//! relational `operlog_YYYYMMDD` table -- the sink is abstracted behind
//! [`OperlogSink`] so the core never depends on a concrete database driver.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use serde_json::Value;

use crate::core_types::OperlogId;
use crate::messages::OperlogEntry;

/// Destination for flushed operlog batches. One implementation per
/// deployment (sqlx/Postgres in production, an in-memory `Vec` in tests).
#[async_trait::async_trait]
pub trait OperlogSink: Send + Sync {
    /// `table` is the per-day table name, e.g. `operlog_20260726`.
    async fn write_batch(&self, table: &str, entries: &[OperlogEntry]) -> anyhow::Result<()>;
}

/// Canonical `{method, params}` JSON with sorted keys -- `serde_json`
/// already serializes map keys in insertion order, so callers must build
/// `params` from a `BTreeMap` (or pre-sorted `Value::Object`) to get a
/// stable byte representation across replays.
pub fn canonical_detail(method: &str, params: Value) -> Value {
    serde_json::json!({ "method": method, "params": params })
}

pub fn table_name_for_day(days_since_epoch: i64) -> String {
    // `days_since_epoch` is supplied by the caller (chrono `NaiveDate`
    // arithmetic) rather than computed here, since this module must stay
    // free of wall-clock reads to keep snapshot replay deterministic.
    format!("operlog_{days_since_epoch}")
}

pub struct OperlogWriter {
    queue: Arc<ArrayQueue<OperlogEntry>>,
    max_pending: usize,
}

impl OperlogWriter {
    pub fn new(max_pending: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(max_pending.max(1))),
            max_pending,
        }
    }

    /// `request_count >= MAX_PENDING_OPERLOG` -- surfaced to the dispatcher
    /// as "service unavailable" before any state mutation is attempted.
    pub fn is_blocked(&self) -> bool {
        self.queue.len() >= self.max_pending
    }

    pub fn enqueue(&self, id: OperlogId, time: f64, detail: Value) -> bool {
        self.queue
            .push(OperlogEntry { id, time, detail })
            .is_ok()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drain up to `batch_size` entries for a flush cycle.
    pub fn drain(&self, batch_size: usize) -> Vec<OperlogEntry> {
        let mut out = Vec::with_capacity(batch_size.min(self.queue.len()));
        for _ in 0..batch_size {
            match self.queue.pop() {
                Some(e) => out.push(e),
                None => break,
            }
        }
        out
    }

    /// Single-writer flush loop: every `flush_ms`, drain the queue and hand
    /// the batch to `sink`. On transient failure, retry with a 1s backoff;
    /// sinks should treat a duplicate-key conflict as success (the row was
    /// already written by a previous attempt).
    pub async fn run(self: Arc<Self>, sink: Arc<dyn OperlogSink>, flush_ms: u64, table: impl Fn() -> String + Send + 'static) {
        let mut tick = tokio::time::interval(Duration::from_millis(flush_ms));
        loop {
            tick.tick().await;
            let batch = self.drain(usize::MAX);
            if batch.is_empty() {
                continue;
            }
            let table_name = table();
            loop {
                match sink.write_batch(&table_name, &batch).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, table = %table_name, "operlog flush failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_control_blocks_at_capacity() {
        let writer = OperlogWriter::new(2);
        assert!(writer.enqueue(1, 0.0, Value::Null));
        assert!(!writer.is_blocked());
        assert!(writer.enqueue(2, 0.0, Value::Null));
        assert!(writer.is_blocked());
        assert!(!writer.enqueue(3, 0.0, Value::Null));
    }

    #[test]
    fn drain_empties_the_queue_in_fifo_order() {
        let writer = OperlogWriter::new(10);
        writer.enqueue(1, 0.0, Value::Null);
        writer.enqueue(2, 0.0, Value::Null);
        let batch = writer.drain(10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, 1);
        assert_eq!(batch[1].id, 2);
        assert_eq!(writer.pending(), 0);
    }

    #[test]
    fn canonical_detail_shape() {
        let v = canonical_detail("order.cancel", serde_json::json!({"order_id": 5}));
        assert_eq!(v["method"], "order.cancel");
        assert_eq!(v["params"]["order_id"], 5);
    }
}
