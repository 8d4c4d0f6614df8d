//! The market engine (C4): ties the registry, ledger, and per-market order
//! books together and implements price-time-priority matching.
//!
//! Grounded on the teacher's `OrderBook` + matching shell, generalized from
//! integer-qty matching against a single implicit asset pair to
//! `Decimal`-scaled stock/money/fee accounting against the registry's
//! per-market precision, and from a fire-and-forget event queue to an
//! explicit `EngineEvents` return value so the engine stays transport- and
//! storage-agnostic (callers route events to C6/C7/C8).

use rustc_hash::FxHashMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::Zero;

use crate::balance::Ledger;
use crate::core_types::{BalanceKind, MarketName, OrderEventKind, OrderId, Role, Side, UserId};
use crate::error::MatchError;
use crate::messages::{BalanceHistoryEvent, BusMessage, DealEvent, OrderEvent};
use crate::models::Order;
use crate::orderbook::{DepthSnapshot, OrderBook};
use crate::precision::{ceil_to_step, floor_to_step, rescale, ulp, IdSequence};
use crate::registry::{Market, Registry};

/// Events produced by a single engine call. The caller (dispatcher) routes
/// these to the operation log, history sinks, and bus -- the engine itself
/// never touches a sink.
#[derive(Debug, Default)]
pub struct EngineEvents {
    pub order_events: Vec<OrderEvent>,
    pub deal_events: Vec<DealEvent>,
    pub balance_events: Vec<BalanceHistoryEvent>,
    pub bus_messages: Vec<BusMessage>,
}

impl EngineEvents {
    fn push_order(&mut self, ev: OrderEvent) {
        self.bus_messages.push(BusMessage::Order(ev.clone()));
        self.order_events.push(ev);
    }

    fn push_deal(&mut self, ev: DealEvent) {
        self.bus_messages.push(BusMessage::Deal(ev.clone()));
        self.deal_events.push(ev);
    }

    #[allow(clippy::too_many_arguments)]
    fn push_balance(
        &mut self,
        time: f64,
        user_id: UserId,
        asset: &str,
        business: &str,
        business_id: u64,
        delta: Decimal,
        balance_after: Decimal,
    ) {
        if delta.is_zero() {
            return;
        }
        self.bus_messages.push(BusMessage::Balance {
            time,
            user_id,
            asset: asset.to_string(),
            business: business.to_string(),
            balance_after,
        });
        self.balance_events.push(BalanceHistoryEvent {
            time,
            user_id,
            asset: asset.to_string(),
            business: business.to_string(),
            business_id,
            delta,
            balance_after,
        });
    }
}

pub struct Engine {
    pub registry: Registry,
    pub ledger: Ledger,
    books: FxHashMap<MarketName, OrderBook>,
    order_id_seq: IdSequence,
    deal_id_seq: IdSequence,
}

impl Engine {
    pub fn new(registry: Registry, ledger: Ledger) -> Self {
        let books = registry
            .markets()
            .map(|m| (m.name.clone(), OrderBook::new()))
            .collect();
        Self {
            registry,
            ledger,
            books,
            order_id_seq: IdSequence::default(),
            deal_id_seq: IdSequence::default(),
        }
    }

    pub fn restore_order_id_seq(&mut self, persisted: u64) {
        self.order_id_seq.restore(persisted);
    }

    pub fn restore_deal_id_seq(&mut self, persisted: u64) {
        self.deal_id_seq.restore(persisted);
    }

    /// Reinsert a resting order during snapshot restore, bypassing balance
    /// freezing -- the order's `freeze` field was already captured by the
    /// snapshot and the corresponding ledger row is restored separately.
    pub fn restore_resting_order(&mut self, market: &str, order: Order) {
        if let Some(book) = self.books.get_mut(market) {
            book.rest_order(order);
        }
    }

    pub fn order_id_seq(&self) -> u64 {
        self.order_id_seq.current()
    }

    pub fn deal_id_seq(&self) -> u64 {
        self.deal_id_seq.current()
    }

    fn market(&self, name: &str) -> Result<&Market, MatchError> {
        self.registry
            .get_market(name)
            .ok_or_else(|| MatchError::InvalidArgument(format!("unknown market {name}")))
    }

    pub fn book(&self, market: &str) -> Option<&OrderBook> {
        self.books.get(market)
    }

    // -- queries --------------------------------------------------------

    pub fn get_order(&self, market: &str, order_id: OrderId) -> Option<&Order> {
        self.books.get(market)?.get(order_id)
    }

    pub fn get_user_orders(&self, market: &str, user_id: UserId) -> Vec<&Order> {
        self.books
            .get(market)
            .map(|b| b.user_orders(user_id))
            .unwrap_or_default()
    }

    pub fn status(&self, market: &str) -> (usize, Decimal, usize, Decimal) {
        self.books
            .get(market)
            .map(|b| b.status())
            .unwrap_or((0, Decimal::ZERO, 0, Decimal::ZERO))
    }

    pub fn depth(&self, market: &str, limit: usize) -> DepthSnapshot {
        self.books
            .get(market)
            .map(|b| b.get_depth(limit))
            .unwrap_or_default()
    }

    /// Depth bucketed by rounding price to a multiple of `interval`; asks
    /// round up, bids round down, so the displayed level never understates
    /// the price a taker would actually have to cross.
    pub fn depth_merged(&self, market: &str, limit: usize, interval: Decimal) -> DepthSnapshot {
        let raw = self.depth(market, usize::MAX);
        let mut bids: Vec<(Decimal, Decimal)> = Vec::new();
        for (price, qty) in raw.bids {
            let bucket = floor_to_step(price, interval);
            match bids.last_mut() {
                Some((p, q)) if *p == bucket => *q += qty,
                _ => bids.push((bucket, qty)),
            }
        }
        let mut asks: Vec<(Decimal, Decimal)> = Vec::new();
        for (price, qty) in raw.asks {
            let bucket = ceil_to_step(price, interval);
            match asks.last_mut() {
                Some((p, q)) if *p == bucket => *q += qty,
                _ => asks.push((bucket, qty)),
            }
        }
        bids.truncate(limit);
        asks.truncate(limit);
        DepthSnapshot { bids, asks }
    }

    // -- mutation ---------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn put_limit(
        &mut self,
        real: bool,
        now: f64,
        market: &str,
        user_id: UserId,
        side: Side,
        amount: Decimal,
        price: Decimal,
        taker_fee: Decimal,
        maker_fee: Decimal,
        source: String,
    ) -> Result<(Order, EngineEvents), MatchError> {
        let m = self.market(market)?.clone();
        if amount < m.min_amount {
            return Err(MatchError::AmountTooSmall);
        }

        let required_asset = match side {
            Side::Ask => &m.stock,
            Side::Bid => &m.money,
        };
        let required_amount = match side {
            Side::Ask => amount,
            Side::Bid => rescale(price * amount, m.money_prec),
        };
        let available = self
            .ledger
            .get(user_id, BalanceKind::Available, required_asset)
            .unwrap_or(Decimal::ZERO);
        if available < required_amount {
            return Err(MatchError::Balance(crate::error::BalanceError::InsufficientBalance));
        }

        let id = self.order_id_seq.next();
        let mut taker = Order::new_limit(
            id, now, user_id, market.to_string(), side, amount, price, taker_fee, maker_fee, source,
        );

        let mut events = EngineEvents::default();
        self.match_loop(&m, real, now, &mut taker, false, &mut events)?;

        if taker.is_finished() {
            self.finish_order(&m, real, now, &taker, &mut events)?;
        } else {
            self.rest_taker(&m, &mut taker)?;
            events.push_order(self.order_event(OrderEventKind::Put, now, &taker));
        }

        Ok((taker, events))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn put_market(
        &mut self,
        real: bool,
        now: f64,
        market: &str,
        user_id: UserId,
        side: Side,
        amount: Decimal,
        taker_fee: Decimal,
        source: String,
    ) -> Result<(Order, EngineEvents), MatchError> {
        let m = self.market(market)?.clone();
        let book = self.books.get(market).ok_or_else(|| {
            MatchError::InvalidArgument(format!("unknown market {market}"))
        })?;

        match side {
            Side::Ask => {
                let available = self
                    .ledger
                    .get(user_id, BalanceKind::Available, &m.stock)
                    .unwrap_or(Decimal::ZERO);
                if available < amount {
                    return Err(MatchError::Balance(crate::error::BalanceError::InsufficientBalance));
                }
                if amount < m.min_amount {
                    return Err(MatchError::AmountTooSmall);
                }
                if book.best_bid().is_none() {
                    return Err(MatchError::NoCounterparty);
                }
            }
            Side::Bid => {
                let available = self
                    .ledger
                    .get(user_id, BalanceKind::Available, &m.money)
                    .unwrap_or(Decimal::ZERO);
                if available < amount {
                    return Err(MatchError::Balance(crate::error::BalanceError::InsufficientBalance));
                }
                let best_ask = book.best_ask().ok_or(MatchError::NoCounterparty)?;
                if amount < best_ask * m.min_amount {
                    return Err(MatchError::AmountTooSmall);
                }
            }
        }

        let id = self.order_id_seq.next();
        let mut taker = Order::new_market(id, now, user_id, market.to_string(), side, amount, taker_fee, source);

        let mut events = EngineEvents::default();
        self.match_loop(&m, real, now, &mut taker, true, &mut events)?;

        // Market orders are always closed, whatever the reason matching stopped.
        self.finish_order(&m, real, now, &taker, &mut events)?;
        Ok((taker, events))
    }

    pub fn cancel(
        &mut self,
        real: bool,
        now: f64,
        market: &str,
        order_id: OrderId,
    ) -> Result<(Order, EngineEvents), MatchError> {
        let m = self.market(market)?.clone();
        let book = self
            .books
            .get_mut(market)
            .ok_or_else(|| MatchError::InvalidArgument(format!("unknown market {market}")))?;
        let order = book
            .remove_order_by_id(order_id)
            .ok_or(MatchError::OrderNotFound)?;

        let mut events = EngineEvents::default();
        self.finish_order(&m, real, now, &order, &mut events)?;
        Ok((order, events))
    }

    // -- internal helpers --------------------------------------------------

    /// Match `taker` against the opposite book. `is_market` disables the
    /// price-crossing check (market orders match until `left == 0` or the
    /// book is empty) and switches on the bid-side rounding-safe amount
    /// calculation.
    fn match_loop(
        &mut self,
        m: &Market,
        real: bool,
        now: f64,
        taker: &mut Order,
        is_market: bool,
        events: &mut EngineEvents,
    ) -> Result<(), MatchError> {
        let opposite_side = taker.side.opposite();
        loop {
            if taker.left.is_zero() {
                break;
            }
            let book = self.books.get_mut(&m.name).expect("market book must exist");
            let crosses = if is_market {
                match opposite_side {
                    Side::Bid => book.best_bid().is_some(),
                    Side::Ask => book.best_ask().is_some(),
                }
            } else {
                match taker.side {
                    Side::Ask => book.best_bid().is_some_and(|bid| taker.price <= bid),
                    Side::Bid => book.best_ask().is_some_and(|ask| taker.price >= ask),
                }
            };
            if !crosses {
                break;
            }
            let mut maker = book.pop_front(opposite_side).expect("crosses implies a resting order");

            let exec_amount = if is_market && taker.side == Side::Bid {
                self.market_bid_exec_amount(m, taker, &maker)
            } else {
                taker.left.min(maker.left)
            };
            if exec_amount.is_zero() {
                // Rounding left nothing to execute; put the maker back and stop.
                self.books.get_mut(&m.name).unwrap().push_front(maker);
                break;
            }
            let exec_price = maker.price;
            // `stock_prec + money_prec <= prec_save(money)` (see registry
            // validation) guarantees this product already fits without a
            // coarser rescale to `money_prec` -- truncating here would round
            // the comparison against `taker.left` the wrong way.
            let exec_money = exec_price * exec_amount;

            self.settle_trade(m, real, now, taker, &mut maker, exec_amount, exec_money, events)?;

            if maker.is_finished() {
                self.finish_order(m, real, now, &maker, events)?;
            } else {
                events.push_order(self.order_event(OrderEventKind::Update, now, &maker));
                self.books.get_mut(&m.name).unwrap().push_front(maker);
            }
        }
        Ok(())
    }

    /// Rounding-safe bid-side market exec amount: floor to stock precision,
    /// then shave one ULP at a time until the resulting money amount no
    /// longer exceeds the taker's remaining money. Terminates because each
    /// step strictly decreases a nonnegative integer count of ULPs.
    fn market_bid_exec_amount(&self, m: &Market, taker: &Order, maker: &Order) -> Decimal {
        let mut exec_amount = floor_to_step(taker.left / maker.price, ulp(m.stock_prec));
        exec_amount = exec_amount.min(maker.left);
        loop {
            if exec_amount.is_zero() {
                return Decimal::ZERO;
            }
            let exec_money = maker.price * exec_amount;
            if exec_money <= taker.left {
                return exec_amount;
            }
            exec_amount -= ulp(m.stock_prec);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_trade(
        &mut self,
        m: &Market,
        real: bool,
        now: f64,
        taker: &mut Order,
        maker: &mut Order,
        exec_amount: Decimal,
        exec_money: Decimal,
        events: &mut EngineEvents,
    ) -> Result<(), MatchError> {
        let deal_id = self.deal_id_seq.next();

        // Fee asset is keyed by each order's own side, not its role: an ask
        // order always pays its fee in money (the asset it receives), a bid
        // order always pays in stock, using whichever rate (`taker_fee` or
        // `maker_fee`) matches its role in this trade. Debited directly from
        // that order's own post-credit balance, mirroring
        // `execute_limit_ask_order`/`execute_limit_bid_order`.
        let (taker_fee_asset, taker_fee_amt, maker_fee_asset, maker_fee_amt) = match taker.side {
            Side::Ask => (
                m.money.as_str(),
                rescale(exec_money * taker.taker_fee, m.money_prec),
                m.stock.as_str(),
                rescale(exec_amount * maker.maker_fee, m.stock_prec),
            ),
            Side::Bid => (
                m.stock.as_str(),
                rescale(exec_amount * taker.taker_fee, m.stock_prec),
                m.money.as_str(),
                rescale(exec_money * maker.maker_fee, m.money_prec),
            ),
        };

        match taker.side {
            Side::Ask => {
                let b = self.ledger.sub(taker.user_id, BalanceKind::Available, &m.stock, exec_amount)?;
                events.push_balance(now, taker.user_id, &m.stock, "trade", deal_id, -exec_amount, b);
                let b = self.ledger.add(taker.user_id, BalanceKind::Available, &m.money, exec_money)?;
                events.push_balance(now, taker.user_id, &m.money, "trade", deal_id, exec_money, b);
                if !taker_fee_amt.is_zero() {
                    let b = self.ledger.sub(taker.user_id, BalanceKind::Available, &m.money, taker_fee_amt)?;
                    events.push_balance(now, taker.user_id, &m.money, "trade_fee", deal_id, -taker_fee_amt, b);
                }

                self.ledger.spend_frozen(maker.user_id, &m.money, exec_money)?;
                let b = self.ledger.get(maker.user_id, BalanceKind::Frozen, &m.money).unwrap_or(Decimal::ZERO);
                events.push_balance(now, maker.user_id, &m.money, "trade", deal_id, -exec_money, b);
                let b = self.ledger.add(maker.user_id, BalanceKind::Available, &m.stock, exec_amount)?;
                events.push_balance(now, maker.user_id, &m.stock, "trade", deal_id, exec_amount, b);
                if !maker_fee_amt.is_zero() {
                    let b = self.ledger.sub(maker.user_id, BalanceKind::Available, &m.stock, maker_fee_amt)?;
                    events.push_balance(now, maker.user_id, &m.stock, "trade_fee", deal_id, -maker_fee_amt, b);
                }
                maker.freeze -= exec_money;
            }
            Side::Bid => {
                let b = self.ledger.sub(taker.user_id, BalanceKind::Available, &m.money, exec_money)?;
                events.push_balance(now, taker.user_id, &m.money, "trade", deal_id, -exec_money, b);
                let b = self.ledger.add(taker.user_id, BalanceKind::Available, &m.stock, exec_amount)?;
                events.push_balance(now, taker.user_id, &m.stock, "trade", deal_id, exec_amount, b);
                if !taker_fee_amt.is_zero() {
                    let b = self.ledger.sub(taker.user_id, BalanceKind::Available, &m.stock, taker_fee_amt)?;
                    events.push_balance(now, taker.user_id, &m.stock, "trade_fee", deal_id, -taker_fee_amt, b);
                }

                self.ledger.spend_frozen(maker.user_id, &m.stock, exec_amount)?;
                let b = self.ledger.get(maker.user_id, BalanceKind::Frozen, &m.stock).unwrap_or(Decimal::ZERO);
                events.push_balance(now, maker.user_id, &m.stock, "trade", deal_id, -exec_amount, b);
                let b = self.ledger.add(maker.user_id, BalanceKind::Available, &m.money, exec_money)?;
                events.push_balance(now, maker.user_id, &m.money, "trade", deal_id, exec_money, b);
                if !maker_fee_amt.is_zero() {
                    let b = self.ledger.sub(maker.user_id, BalanceKind::Available, &m.money, maker_fee_amt)?;
                    events.push_balance(now, maker.user_id, &m.money, "trade_fee", deal_id, -maker_fee_amt, b);
                }
                maker.freeze -= exec_amount;
            }
        }

        taker.left -= exec_amount;
        taker.deal_stock += exec_amount;
        taker.deal_money += exec_money;
        taker.deal_fee += taker_fee_amt;
        taker.update_time = now;

        maker.left -= exec_amount;
        maker.deal_stock += exec_amount;
        maker.deal_money += exec_money;
        maker.deal_fee += maker_fee_amt;
        maker.update_time = now;

        if real {
            events.push_deal(DealEvent {
                deal_id,
                time: now,
                market: m.name.clone(),
                role: Role::Taker,
                order_id: taker.id,
                user_id: taker.user_id,
                counter_order_id: maker.id,
                counter_user_id: maker.user_id,
                side: taker.side,
                price: exec_price_for(maker),
                amount: exec_amount,
                deal_money: exec_money,
                fee_asset: taker_fee_asset.to_string(),
                fee: taker_fee_amt,
            });
            events.push_deal(DealEvent {
                deal_id,
                time: now,
                market: m.name.clone(),
                role: Role::Maker,
                order_id: maker.id,
                user_id: maker.user_id,
                counter_order_id: taker.id,
                counter_user_id: taker.user_id,
                side: maker.side,
                price: exec_price_for(maker),
                amount: exec_amount,
                deal_money: exec_money,
                fee_asset: maker_fee_asset.to_string(),
                fee: maker_fee_amt,
            });
        }
        Ok(())
    }

    /// Common tail for a no-longer-resting order: unfreeze any residual
    /// `freeze`, emit the FINISH event. Cancel and market-order closure and
    /// fully-filled limit orders all funnel through here.
    fn finish_order(
        &mut self,
        m: &Market,
        real: bool,
        now: f64,
        order: &Order,
        events: &mut EngineEvents,
    ) -> Result<(), MatchError> {
        if !order.freeze.is_zero() {
            let asset = match order.side {
                Side::Ask => &m.stock,
                Side::Bid => &m.money,
            };
            self.ledger.unfreeze(order.user_id, asset, order.freeze)?;
            let b = self.ledger.get(order.user_id, BalanceKind::Available, asset).unwrap_or(Decimal::ZERO);
            events.push_balance(now, order.user_id, asset, "unfreeze", order.id, order.freeze, b);
        }
        if real {
            events.push_order(self.order_event(OrderEventKind::Finish, now, order));
        }
        Ok(())
    }

    fn rest_taker(&mut self, m: &Market, taker: &mut Order) -> Result<(), MatchError> {
        let (asset, amount) = match taker.side {
            Side::Ask => (&m.stock, taker.left),
            Side::Bid => (&m.money, rescale(taker.price * taker.left, m.money_prec)),
        };
        self.ledger.freeze(taker.user_id, asset, amount)?;
        taker.freeze = amount;
        self.books.get_mut(&m.name).unwrap().rest_order(taker.clone());
        Ok(())
    }

    fn order_event(&self, kind: OrderEventKind, now: f64, order: &Order) -> OrderEvent {
        OrderEvent {
            kind,
            time: now,
            market: order.market.clone(),
            order_id: order.id,
            user_id: order.user_id,
            side: order.side,
            price: order.price,
            left: order.left,
            deal_stock: order.deal_stock,
            deal_money: order.deal_money,
        }
    }
}

fn exec_price_for(maker: &Order) -> Decimal {
    maker.price
}
