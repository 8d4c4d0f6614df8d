//! The `Order` type and its resting-invariants (C4 data model).

use rust_decimal::Decimal;
use rust_decimal::prelude::Zero;
use serde::{Deserialize, Serialize};

use crate::core_types::{MarketName, OrderId, OrderKind, Side, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub create_time: f64,
    pub update_time: f64,
    pub user_id: UserId,
    pub market: MarketName,
    pub source: String,
    pub kind: OrderKind,
    pub side: Side,
    /// `0` for market orders.
    pub price: Decimal,
    pub amount: Decimal,
    /// `0` for market orders (market: maker_fee = 0).
    pub taker_fee: Decimal,
    pub maker_fee: Decimal,
    pub left: Decimal,
    pub freeze: Decimal,
    pub deal_stock: Decimal,
    pub deal_money: Decimal,
    pub deal_fee: Decimal,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new_limit(
        id: OrderId,
        now: f64,
        user_id: UserId,
        market: MarketName,
        side: Side,
        amount: Decimal,
        price: Decimal,
        taker_fee: Decimal,
        maker_fee: Decimal,
        source: String,
    ) -> Self {
        Self {
            id,
            create_time: now,
            update_time: now,
            user_id,
            market,
            source,
            kind: OrderKind::Limit,
            side,
            price,
            amount,
            taker_fee,
            maker_fee,
            left: amount,
            freeze: Decimal::ZERO,
            deal_stock: Decimal::ZERO,
            deal_money: Decimal::ZERO,
            deal_fee: Decimal::ZERO,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_market(
        id: OrderId,
        now: f64,
        user_id: UserId,
        market: MarketName,
        side: Side,
        amount: Decimal,
        taker_fee: Decimal,
        source: String,
    ) -> Self {
        Self {
            id,
            create_time: now,
            update_time: now,
            user_id,
            market,
            source,
            kind: OrderKind::Market,
            side,
            price: Decimal::ZERO,
            amount,
            taker_fee,
            maker_fee: Decimal::ZERO,
            left: amount,
            freeze: Decimal::ZERO,
            deal_stock: Decimal::ZERO,
            deal_money: Decimal::ZERO,
            deal_fee: Decimal::ZERO,
        }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.left.is_zero()
    }

    /// `deal_stock + left == amount`, checked for limit orders only --
    /// market orders may close with `left > 0` (see the rounding scenario
    /// in the design doc) and are never rested.
    #[cfg(test)]
    pub fn invariant_holds(&self) -> bool {
        match self.kind {
            OrderKind::Limit => self.deal_stock + self.left == self.amount,
            OrderKind::Market => true,
        }
    }
}
