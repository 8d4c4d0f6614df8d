//! History emitter (C7).
//!
//! Five logical streams (user-order, order-detail, order-deal, user-deal,
//! user-balance), each partitioned by `id mod N` so that rows for the same
//! partition coalesce into one multi-row insert per flush. Grounded on the
//! teacher's per-connection history worker pool, generalized from a single
//! stream to five and from a fixed binary row to a `HistoryRow` enum sent
//! through a [`HistorySink`] trait so the core stays database-agnostic.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use crate::messages::{BalanceHistoryEvent, DealEvent, OrderEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    UserOrder,
    OrderDetail,
    OrderDeal,
    UserDeal,
    UserBalance,
}

#[derive(Debug, Clone)]
pub enum HistoryRow {
    Order(OrderEvent),
    Deal(DealEvent),
    Balance(BalanceHistoryEvent),
}

impl HistoryRow {
    fn user_id(&self) -> u64 {
        match self {
            HistoryRow::Order(e) => e.user_id as u64,
            HistoryRow::Deal(e) => e.user_id as u64,
            HistoryRow::Balance(e) => e.user_id as u64,
        }
    }

    fn order_id(&self) -> u64 {
        match self {
            HistoryRow::Order(e) => e.order_id,
            HistoryRow::Deal(e) => e.order_id,
            HistoryRow::Balance(e) => e.user_id as u64,
        }
    }
}

#[async_trait::async_trait]
pub trait HistorySink: Send + Sync {
    async fn write_rows(&self, stream: Stream, partition: u64, rows: &[HistoryRow]) -> anyhow::Result<()>;
}

pub struct HistoryEmitter {
    queue: Arc<ArrayQueue<(Stream, HistoryRow)>>,
    max_pending: usize,
    partitions: usize,
}

impl HistoryEmitter {
    pub fn new(max_pending: usize, partitions: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(max_pending.max(1))),
            max_pending,
            partitions: partitions.max(1),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.queue.len() >= self.max_pending
    }

    pub fn enqueue(&self, stream: Stream, row: HistoryRow) -> bool {
        self.queue.push((stream, row)).is_ok()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// User streams partition by `user_id`, order/deal streams by `order_id`.
    fn partition_of(&self, stream: Stream, row: &HistoryRow) -> u64 {
        let key = match stream {
            Stream::UserOrder | Stream::UserDeal | Stream::UserBalance => row.user_id(),
            Stream::OrderDetail | Stream::OrderDeal => row.order_id(),
        };
        key % self.partitions as u64
    }

    /// Drain the queue, grouping rows by `(stream, partition)` for
    /// coalesced multi-row inserts.
    pub fn drain_grouped(&self) -> std::collections::HashMap<(Stream, u64), Vec<HistoryRow>> {
        let mut groups: std::collections::HashMap<(Stream, u64), Vec<HistoryRow>> = std::collections::HashMap::new();
        while let Some((stream, row)) = self.queue.pop() {
            let partition = self.partition_of(stream, &row);
            groups.entry((stream, partition)).or_default().push(row);
        }
        groups
    }

    /// One worker of the `history_thread` pool: every `flush_ms`, drain and
    /// coalesce pending rows, then hand each group to `sink`. Retries with
    /// a 1s backoff on failure; a duplicate-key error is treated as success
    /// by the sink implementation, not here.
    pub async fn run(self: Arc<Self>, sink: Arc<dyn HistorySink>, flush_ms: u64) {
        let mut tick = tokio::time::interval(Duration::from_millis(flush_ms));
        loop {
            tick.tick().await;
            for ((stream, partition), rows) in self.drain_grouped() {
                loop {
                    match sink.write_rows(stream, partition, &rows).await {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, ?stream, partition, "history flush failed, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }
}
