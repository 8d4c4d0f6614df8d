//! OrderBook - BTreeMap-based price-time priority order book.
//!
//! This module contains only the OrderBook data structure.
//! The matching logic lives in the Engine module.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;

use crate::core_types::{OrderId, Side, UserId};
use crate::models::Order;

/// The OrderBook using BTreeMap for O(log n) operations.
///
/// # Key Design:
/// - Asks are stored with their own price as key (ascending order, lowest
///   price = best ask).
/// - Bids are stored under `Reverse(price)`, so the same ascending
///   `BTreeMap` yields the highest price first (best bid). `Decimal` has no
///   `u64::MAX` sentinel to negate against, so `Reverse` replaces the
///   integer-key negation trick directly.
///
/// # Complexity:
/// | Operation | Time |
/// |-----------|------|
/// | Insert | O(log n) |
/// | Best price | O(1) amortized |
/// | Cancel by ID | O(1) lookup + O(log n + k) removal |
#[derive(Debug, Default)]
pub struct OrderBook {
    asks: BTreeMap<Decimal, VecDeque<Order>>,
    bids: BTreeMap<Reverse<Decimal>, VecDeque<Order>>,
    /// OrderId -> (Price, Side) for O(1) cancel lookup.
    order_index: FxHashMap<OrderId, (Decimal, Side)>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next().map(|Reverse(p)| *p)
    }

    #[inline]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) if ask > bid => Some(ask - bid),
            _ => None,
        }
    }

    /// Number of price levels on each side: `(bid_depth, ask_depth)`.
    #[inline]
    pub fn depth_levels(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Pop the order at the front of the best price level for `side`,
    /// removing the level entirely if it becomes empty. Keeps
    /// `order_index` in sync.
    pub fn pop_front(&mut self, side: Side) -> Option<Order> {
        match side {
            Side::Bid => {
                let (&Reverse(price), level) = self.bids.iter_mut().next()?;
                let order = level.pop_front()?;
                if level.is_empty() {
                    self.bids.remove(&Reverse(price));
                }
                self.order_index.remove(&order.id);
                Some(order)
            }
            Side::Ask => {
                let (&price, level) = self.asks.iter_mut().next()?;
                let order = level.pop_front()?;
                if level.is_empty() {
                    self.asks.remove(&price);
                }
                self.order_index.remove(&order.id);
                Some(order)
            }
        }
    }

    /// Put a partially-matched order back at the front of its level. Used
    /// when a resting order survives a partial fill and must re-enter the
    /// queue ahead of anything resting behind it.
    pub fn push_front(&mut self, order: Order) {
        self.order_index.insert(order.id, (order.price, order.side));
        match order.side {
            Side::Bid => self
                .bids
                .entry(Reverse(order.price))
                .or_default()
                .push_front(order),
            Side::Ask => self.asks.entry(order.price).or_default().push_front(order),
        }
    }

    /// Rest an unfilled/partially filled order in the book.
    ///
    /// NOTE: the order's `left`/`freeze` fields should already be set
    /// correctly by the caller -- this only stores it.
    pub fn rest_order(&mut self, order: Order) {
        self.order_index.insert(order.id, (order.price, order.side));
        match order.side {
            Side::Bid => self
                .bids
                .entry(Reverse(order.price))
                .or_default()
                .push_back(order),
            Side::Ask => self.asks.entry(order.price).or_default().push_back(order),
        }
    }

    /// Total remaining quantity at a price level for a side.
    pub fn qty_at_price(&self, price: Decimal, side: Side) -> Decimal {
        match side {
            Side::Bid => self
                .bids
                .get(&Reverse(price))
                .map(|orders| orders.iter().map(|o| o.left).sum())
                .unwrap_or(Decimal::ZERO),
            Side::Ask => self
                .asks
                .get(&price)
                .map(|orders| orders.iter().map(|o| o.left).sum())
                .unwrap_or(Decimal::ZERO),
        }
    }

    /// Remove an order by ID only (uses the order index for fast lookup).
    ///
    /// Complexity: O(1) index lookup + O(log n) tree access + O(k) queue
    /// scan where k = orders at that price level (typically small).
    pub fn remove_order_by_id(&mut self, order_id: OrderId) -> Option<Order> {
        let (price, side) = self.order_index.remove(&order_id)?;
        match side {
            Side::Bid => {
                let level = self.bids.get_mut(&Reverse(price))?;
                let pos = level.iter().position(|o| o.id == order_id)?;
                let order = level.remove(pos)?;
                if level.is_empty() {
                    self.bids.remove(&Reverse(price));
                }
                Some(order)
            }
            Side::Ask => {
                let level = self.asks.get_mut(&price)?;
                let pos = level.iter().position(|o| o.id == order_id)?;
                let order = level.remove(pos)?;
                if level.is_empty() {
                    self.asks.remove(&price);
                }
                Some(order)
            }
        }
    }

    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        let (price, side) = self.order_index.get(&order_id)?;
        match side {
            Side::Bid => self
                .bids
                .get(&Reverse(*price))?
                .iter()
                .find(|o| o.id == order_id),
            Side::Ask => self.asks.get(price)?.iter().find(|o| o.id == order_id),
        }
    }

    /// All orders, bids first (highest price first, then FIFO within
    /// price), then asks (lowest price first, then FIFO). Matches the
    /// natural market depth view; used for snapshot dump.
    pub fn all_orders(&self) -> Vec<&Order> {
        self.bids
            .values()
            .flat_map(|level| level.iter())
            .chain(self.asks.values().flat_map(|level| level.iter()))
            .collect()
    }

    /// Ordered by `id` descending for stable listing, not by the book's own
    /// price/time priority.
    pub fn user_orders(&self, user_id: UserId) -> Vec<&Order> {
        let mut v: Vec<&Order> = self
            .all_orders()
            .into_iter()
            .filter(|o| o.user_id == user_id)
            .collect();
        v.sort_by_key(|o| Reverse(o.id));
        v
    }

    /// Market depth snapshot: top `limit` price levels per side with
    /// aggregated quantities. Bids descending, asks ascending.
    pub fn get_depth(&self, limit: usize) -> DepthSnapshot {
        let bids = self
            .bids
            .iter()
            .take(limit)
            .map(|(Reverse(price), orders)| {
                let qty: Decimal = orders.iter().map(|o| o.left).sum();
                (*price, qty)
            })
            .collect();

        let asks = self
            .asks
            .iter()
            .take(limit)
            .map(|(&price, orders)| {
                let qty: Decimal = orders.iter().map(|o| o.left).sum();
                (price, qty)
            })
            .collect();

        DepthSnapshot { bids, asks }
    }

    /// Aggregated status: `(ask_count, ask_amount_sum, bid_count,
    /// bid_amount_sum)`.
    pub fn status(&self) -> (usize, Decimal, usize, Decimal) {
        let (mut ask_count, mut ask_sum) = (0usize, Decimal::ZERO);
        for level in self.asks.values() {
            for o in level {
                ask_count += 1;
                ask_sum += o.left;
            }
        }
        let (mut bid_count, mut bid_sum) = (0usize, Decimal::ZERO);
        for level in self.bids.values() {
            for o in level {
                bid_count += 1;
                bid_sum += o.left;
            }
        }
        (ask_count, ask_sum, bid_count, bid_sum)
    }
}

/// Market depth snapshot.
#[derive(Debug, Clone, Default)]
pub struct DepthSnapshot {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn make_order(id: OrderId, price: &str, amount: &str, side: Side) -> Order {
        Order::new_limit(
            id,
            0.0,
            1,
            "M".into(),
            side,
            d(amount),
            d(price),
            Decimal::ZERO,
            Decimal::ZERO,
            String::new(),
        )
    }

    #[test]
    fn test_rest_order() {
        let mut book = OrderBook::new();
        book.rest_order(make_order(1, "100", "10", Side::Bid));
        assert_eq!(book.best_bid(), Some(d("100")));
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn test_best_bid_ask() {
        let mut book = OrderBook::new();
        book.rest_order(make_order(1, "100", "10", Side::Bid));
        book.rest_order(make_order(2, "99", "10", Side::Bid));
        book.rest_order(make_order(3, "101", "10", Side::Ask));
        book.rest_order(make_order(4, "102", "10", Side::Ask));

        assert_eq!(book.best_bid(), Some(d("100")));
        assert_eq!(book.best_ask(), Some(d("101")));
        assert_eq!(book.spread(), Some(d("1")));
    }

    #[test]
    fn test_remove_order_by_id() {
        let mut book = OrderBook::new();
        book.rest_order(make_order(1, "100", "10", Side::Bid));
        book.rest_order(make_order(2, "101", "20", Side::Ask));
        book.rest_order(make_order(3, "99", "30", Side::Bid));

        let removed = book.remove_order_by_id(1).unwrap();
        assert_eq!(removed.id, 1);
        assert_eq!(removed.price, d("100"));
        assert_eq!(removed.amount, d("10"));

        assert_eq!(book.best_bid(), Some(d("99")));

        let removed = book.remove_order_by_id(2).unwrap();
        assert_eq!(removed.id, 2);
        assert_eq!(removed.price, d("101"));
        assert_eq!(book.best_ask(), None);

        assert!(book.remove_order_by_id(999).is_none());
    }

    #[test]
    fn test_depth_levels() {
        let mut book = OrderBook::new();
        book.rest_order(make_order(1, "100", "10", Side::Bid));
        book.rest_order(make_order(2, "99", "10", Side::Bid));
        book.rest_order(make_order(3, "101", "10", Side::Ask));
        assert_eq!(book.depth_levels(), (2, 1));
    }

    #[test]
    fn test_get_depth() {
        let mut book = OrderBook::new();
        book.rest_order(make_order(1, "100", "10", Side::Bid));
        book.rest_order(make_order(2, "99", "20", Side::Bid));
        book.rest_order(make_order(3, "98", "15", Side::Bid));
        book.rest_order(make_order(4, "101", "12", Side::Ask));
        book.rest_order(make_order(5, "102", "25", Side::Ask));
        book.rest_order(make_order(6, "103", "8", Side::Ask));

        let depth = book.get_depth(5);

        assert_eq!(depth.bids.len(), 3);
        assert_eq!(depth.bids[0], (d("100"), d("10")));
        assert_eq!(depth.bids[1], (d("99"), d("20")));
        assert_eq!(depth.bids[2], (d("98"), d("15")));

        assert_eq!(depth.asks.len(), 3);
        assert_eq!(depth.asks[0], (d("101"), d("12")));
        assert_eq!(depth.asks[1], (d("102"), d("25")));
        assert_eq!(depth.asks[2], (d("103"), d("8")));

        let depth_limited = book.get_depth(2);
        assert_eq!(depth_limited.bids.len(), 2);
        assert_eq!(depth_limited.asks.len(), 2);
    }

    #[test]
    fn fifo_within_price_level() {
        let mut book = OrderBook::new();
        book.rest_order(make_order(1, "100", "5", Side::Ask));
        book.rest_order(make_order(2, "100", "5", Side::Ask));
        assert_eq!(book.pop_front(Side::Ask).unwrap().id, 1);
        assert_eq!(book.pop_front(Side::Ask).unwrap().id, 2);
    }

    #[test]
    fn user_orders_filters_by_owner() {
        let mut book = OrderBook::new();
        let mut o1 = make_order(1, "10", "1", Side::Bid);
        o1.user_id = 7;
        let mut o2 = make_order(2, "10", "1", Side::Bid);
        o2.user_id = 8;
        book.rest_order(o1);
        book.rest_order(o2);
        assert_eq!(book.user_orders(7).len(), 1);
        assert_eq!(book.user_orders(7)[0].id, 1);
    }
}
