//! Command dispatcher (C10): the single entry point external callers (a
//! gateway, a replay loop, an admin CLI) go through to touch the engine.
//!
//! Grounded on the teacher's request-validation-then-dispatch shell,
//! generalized from the teacher's narrow order-placement handler to the
//! full command set this design exposes, with the admission gate and depth
//! cache the distilled spec calls for.

use std::time::{Duration, Instant};

use cached::{Cached, TimedCache};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bus::{BusEmitter, BusSink};
use crate::config::AppConfig;
use crate::core_types::{MarketName, OrderId, Side, UserId};
use crate::engine::{Engine, EngineEvents};
use crate::error::DispatchError;
use crate::history::{HistoryEmitter, HistoryRow, HistorySink, Stream};
use crate::balance::AssetStatus;
use crate::idempotency::{IdempotencyCache, RecordOutcome};
use crate::models::Order;
use crate::operlog::{canonical_detail, OperlogSink, OperlogWriter};
use crate::orderbook::DepthSnapshot;
use crate::registry::{Asset, Market};
use crate::core_types::BalanceKind;
use crate::precision::IdSequence;

/// Typed commands accepted by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    BalanceQuery { user_id: UserId, asset: String },
    BalanceUpdate {
        user_id: UserId,
        asset: String,
        business: String,
        business_id: u64,
        delta: Decimal,
    },
    AssetList,
    AssetSummary { asset: String },
    OrderPutLimit {
        market: MarketName,
        user_id: UserId,
        side: Side,
        amount: Decimal,
        price: Decimal,
        taker_fee: Decimal,
        maker_fee: Decimal,
        source: String,
    },
    OrderPutMarket {
        market: MarketName,
        user_id: UserId,
        side: Side,
        amount: Decimal,
        taker_fee: Decimal,
        source: String,
    },
    OrderQuery { market: MarketName, user_id: UserId },
    OrderCancel { market: MarketName, order_id: OrderId },
    OrderBook { market: MarketName, limit: usize },
    OrderDepth { market: MarketName, limit: usize, interval: Option<Decimal> },
    OrderPendingDetail { market: MarketName, order_id: OrderId },
    MarketList,
    MarketSummary { market: MarketName },
}

impl Command {
    fn method(&self) -> &'static str {
        match self {
            Command::BalanceQuery { .. } => "balance.query",
            Command::BalanceUpdate { .. } => "balance.update",
            Command::AssetList => "asset.list",
            Command::AssetSummary { .. } => "asset.summary",
            Command::OrderPutLimit { .. } => "order.put_limit",
            Command::OrderPutMarket { .. } => "order.put_market",
            Command::OrderQuery { .. } => "order.query",
            Command::OrderCancel { .. } => "order.cancel",
            Command::OrderBook { .. } => "order.book",
            Command::OrderDepth { .. } => "order.depth",
            Command::OrderPendingDetail { .. } => "order.pending_detail",
            Command::MarketList => "market.list",
            Command::MarketSummary { .. } => "market.summary",
        }
    }

    /// State-mutating commands go through the admission gate and the
    /// operation log; read-only queries bypass both.
    fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::BalanceUpdate { .. }
                | Command::OrderPutLimit { .. }
                | Command::OrderPutMarket { .. }
                | Command::OrderCancel { .. }
        )
    }

    fn validate(&self, source_max_len: usize) -> Result<(), DispatchError> {
        let fee_in_range = |f: Decimal| f >= Decimal::ZERO && f < Decimal::ONE;
        match self {
            Command::OrderPutLimit { source, taker_fee, maker_fee, .. } => {
                if source.len() >= source_max_len {
                    return Err(DispatchError::InvalidArgument("source too long".into()));
                }
                if !fee_in_range(*taker_fee) || !fee_in_range(*maker_fee) {
                    return Err(DispatchError::InvalidArgument("fee out of range".into()));
                }
                Ok(())
            }
            Command::OrderPutMarket { source, taker_fee, .. } => {
                if source.len() >= source_max_len {
                    return Err(DispatchError::InvalidArgument("source too long".into()));
                }
                if !fee_in_range(*taker_fee) {
                    return Err(DispatchError::InvalidArgument("fee out of range".into()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Result of a single dispatched command, handed back to the caller
/// (reply code + optional payload) while the events go to the sinks.
#[derive(Debug)]
pub enum Reply {
    Ok,
    Depth(DepthSnapshot),
    BalanceOf(Option<Decimal>),
    OrderId(OrderId),
    Assets(Vec<Asset>),
    AssetStatus(AssetStatus),
    Orders(Vec<Order>),
    OrderDetail(Option<Order>),
    Markets(Vec<Market>),
    MarketStatus { bid_levels: usize, bid_qty: Decimal, ask_levels: usize, ask_qty: Decimal },
}

pub struct Dispatcher {
    pub engine: Engine,
    operlog: OperlogWriter,
    history: HistoryEmitter,
    bus: BusEmitter,
    idempotency: IdempotencyCache,
    depth_cache: TimedCache<(String, String), DepthSnapshot>,
    last_cache_clear: Instant,
    source_max_len: usize,
    operlog_id_seq: IdSequence,
}

impl Dispatcher {
    pub fn new(engine: Engine, cfg: &AppConfig) -> Self {
        Self {
            engine,
            operlog: OperlogWriter::new(cfg.max_pending_operlog),
            history: HistoryEmitter::new(cfg.max_pending_history, cfg.history_workers.max(1)),
            bus: BusEmitter::new(cfg.max_pending_message),
            idempotency: IdempotencyCache::new(),
            depth_cache: TimedCache::with_lifespan(cfg.depth_cache_timeout_secs as u64),
            last_cache_clear: Instant::now(),
            source_max_len: cfg.source_max_len,
            operlog_id_seq: IdSequence::default(),
        }
    }

    /// Restore the operlog id counter from the latest snapshot marker (C9).
    pub fn restore_operlog_id_seq(&mut self, persisted: u64) {
        self.operlog_id_seq.restore(persisted);
    }

    pub fn operlog_id_seq(&self) -> u64 {
        self.operlog_id_seq.current()
    }

    fn is_blocked(&self) -> bool {
        self.operlog.is_blocked() || self.history.is_blocked() || self.bus.is_blocked()
    }

    /// Clear the depth cache wholesale every 60s, independent of each
    /// entry's own `cache_timeout` expiry.
    fn maybe_clear_depth_cache(&mut self) {
        if self.last_cache_clear.elapsed() >= Duration::from_secs(60) {
            self.depth_cache.cache_clear();
            self.last_cache_clear = Instant::now();
        }
    }

    /// `real = true` for live traffic; `real = false` during operlog replay
    /// on restore (no history rows, no bus messages, no further operlog
    /// writes).
    pub fn dispatch(&mut self, now: f64, real: bool, command: Command) -> Result<Reply, DispatchError> {
        self.maybe_clear_depth_cache();
        command.validate(self.source_max_len)?;

        if real && command.is_mutating() && self.is_blocked() {
            return Err(DispatchError::ServiceUnavailable);
        }

        let method = command.method();
        let reply = self.apply(now, real, command.clone())?;

        if real && command.is_mutating() {
            let operlog_id = self.operlog_id_seq.next();
            let detail = canonical_detail(method, serde_json::to_value(&command).unwrap_or_default());
            self.operlog.enqueue(operlog_id, now, detail);
        }

        Ok(reply)
    }

    fn apply(&mut self, now: f64, real: bool, command: Command) -> Result<Reply, DispatchError> {
        match command {
            Command::BalanceQuery { user_id, asset } => {
                Ok(Reply::BalanceOf(self.engine.ledger.get(user_id, BalanceKind::Available, &asset)))
            }
            Command::BalanceUpdate { user_id, asset, business, business_id, delta } => {
                if real && self.idempotency.try_record(now, user_id, &asset, &business, business_id) == RecordOutcome::Duplicate {
                    return Ok(Reply::Ok);
                }
                if delta >= Decimal::ZERO {
                    self.engine.ledger.add(user_id, BalanceKind::Available, &asset, delta)?;
                } else {
                    self.engine.ledger.sub(user_id, BalanceKind::Available, &asset, -delta)?;
                }
                Ok(Reply::Ok)
            }
            Command::AssetList => Ok(Reply::Assets(self.engine.registry.assets().cloned().collect())),
            Command::AssetSummary { asset } => Ok(Reply::AssetStatus(self.engine.ledger.status(&asset))),
            Command::OrderPutLimit { market, user_id, side, amount, price, taker_fee, maker_fee, source } => {
                let (order, events) = self.engine.put_limit(real, now, &market, user_id, side, amount, price, taker_fee, maker_fee, source)?;
                self.route_events(real, events);
                Ok(Reply::OrderId(order.id))
            }
            Command::OrderPutMarket { market, user_id, side, amount, taker_fee, source } => {
                let (order, events) = self.engine.put_market(real, now, &market, user_id, side, amount, taker_fee, source)?;
                self.route_events(real, events);
                Ok(Reply::OrderId(order.id))
            }
            Command::OrderQuery { market, user_id } => {
                let orders = self.engine.get_user_orders(&market, user_id).into_iter().cloned().collect();
                Ok(Reply::Orders(orders))
            }
            Command::OrderCancel { market, order_id } => {
                let (_order, events) = self.engine.cancel(real, now, &market, order_id)?;
                self.route_events(real, events);
                Ok(Reply::Ok)
            }
            Command::OrderBook { market, limit } => Ok(Reply::Depth(self.engine.depth(&market, limit))),
            Command::OrderDepth { market, limit, interval } => {
                let key = (market.clone(), format!("{limit}:{interval:?}"));
                if let Some(cached) = self.depth_cache.cache_get(&key) {
                    return Ok(Reply::Depth(cached.clone()));
                }
                let snapshot = match interval {
                    Some(step) => self.engine.depth_merged(&market, limit, step),
                    None => self.engine.depth(&market, limit),
                };
                self.depth_cache.cache_set(key, snapshot.clone());
                Ok(Reply::Depth(snapshot))
            }
            Command::OrderPendingDetail { market, order_id } => {
                Ok(Reply::OrderDetail(self.engine.get_order(&market, order_id).cloned()))
            }
            Command::MarketList => Ok(Reply::Markets(self.engine.registry.markets().cloned().collect())),
            Command::MarketSummary { market } => {
                let (bid_levels, bid_qty, ask_levels, ask_qty) = self.engine.status(&market);
                Ok(Reply::MarketStatus { bid_levels, bid_qty, ask_levels, ask_qty })
            }
        }
    }

    /// 60s housekeeping tick: sweep expired idempotency entries and clear
    /// the depth cache wholesale, independent of any inbound traffic.
    pub fn tick_housekeeping(&mut self, now: f64) {
        self.idempotency.sweep(now);
        self.maybe_clear_depth_cache();
    }

    /// Drive the 100ms flush cycle for all three sinks from a single timer
    /// tick, for callers (the demo binary) that run their own loop instead
    /// of spawning `operlog`/`history`/`bus` as background tasks.
    pub async fn flush_sinks(
        &self,
        operlog_sink: &dyn OperlogSink,
        history_sink: &dyn HistorySink,
        bus_sink: &dyn BusSink,
        operlog_table: &str,
    ) {
        let batch = self.operlog.drain(usize::MAX);
        if !batch.is_empty() {
            if let Err(e) = operlog_sink.write_batch(operlog_table, &batch).await {
                tracing::warn!(error = %e, table = operlog_table, "operlog flush failed");
            }
        }
        for ((stream, partition), rows) in self.history.drain_grouped() {
            if let Err(e) = history_sink.write_rows(stream, partition, &rows).await {
                tracing::warn!(error = %e, ?stream, partition, "history flush failed");
            }
        }
        self.bus.flush_once(bus_sink).await;
    }

    fn route_events(&mut self, real: bool, events: EngineEvents) {
        if !real {
            return;
        }
        for ev in events.order_events {
            self.history.enqueue(Stream::OrderDetail, HistoryRow::Order(ev.clone()));
            self.history.enqueue(Stream::UserOrder, HistoryRow::Order(ev));
        }
        for ev in events.deal_events {
            self.history.enqueue(Stream::OrderDeal, HistoryRow::Deal(ev.clone()));
            self.history.enqueue(Stream::UserDeal, HistoryRow::Deal(ev));
        }
        for ev in events.balance_events {
            self.history.enqueue(Stream::UserBalance, HistoryRow::Balance(ev));
        }
        for msg in events.bus_messages {
            self.bus.buffer(msg);
        }
    }
}
