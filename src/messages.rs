//! Event and bus message types emitted by the matching engine.
//!
//! Grounded on the teacher's `OrderEvent`/`BalanceEvent` event-sourcing
//! types (csv-serializable audit records) and `DepthSnapshot` bus payload,
//! generalized from fixed-point `u64` amounts to `Decimal` and from the
//! lock/settle dual-version scheme to the single monotonic operlog id this
//! design uses as its causal ordering key.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{
    AssetName, DealId, MarketName, OrderEventKind, OrderId, OperlogId, Role, Side, UserId,
};

/// Emitted whenever a resting order is created, partially filled, or
/// closed. One of the three `history` streams (order-detail).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub kind: OrderEventKind,
    pub time: f64,
    pub market: MarketName,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub side: Side,
    pub price: Decimal,
    pub left: Decimal,
    pub deal_stock: Decimal,
    pub deal_money: Decimal,
}

impl OrderEvent {
    pub fn csv_header() -> &'static str {
        "kind,time,market,order_id,user_id,side,price,left,deal_stock,deal_money"
    }

    pub fn to_csv(&self) -> String {
        format!(
            "{:?},{},{},{},{},{:?},{},{},{},{}",
            self.kind,
            self.time,
            self.market,
            self.order_id,
            self.user_id,
            self.side,
            self.price,
            self.left,
            self.deal_stock,
            self.deal_money
        )
    }
}

/// One side of a trade, duplicated for maker and taker (deal_history).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealEvent {
    pub deal_id: DealId,
    pub time: f64,
    pub market: MarketName,
    pub role: Role,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub counter_order_id: OrderId,
    pub counter_user_id: UserId,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub deal_money: Decimal,
    pub fee_asset: AssetName,
    pub fee: Decimal,
}

impl DealEvent {
    pub fn csv_header() -> &'static str {
        "deal_id,time,market,role,order_id,user_id,counter_order_id,counter_user_id,side,price,amount,deal_money,fee_asset,fee"
    }

    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{:?},{},{},{},{},{:?},{},{},{},{},{}",
            self.deal_id,
            self.time,
            self.market,
            self.role,
            self.order_id,
            self.user_id,
            self.counter_order_id,
            self.counter_user_id,
            self.side,
            self.price,
            self.amount,
            self.deal_money,
            self.fee_asset,
            self.fee
        )
    }
}

/// One row per non-zero balance delta (user-balance history stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceHistoryEvent {
    pub time: f64,
    pub user_id: UserId,
    pub asset: AssetName,
    pub business: String,
    pub business_id: u64,
    pub delta: Decimal,
    pub balance_after: Decimal,
}

impl BalanceHistoryEvent {
    pub fn csv_header() -> &'static str {
        "time,user_id,asset,business,business_id,delta,balance_after"
    }

    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.time,
            self.user_id,
            self.asset,
            self.business,
            self.business_id,
            self.delta,
            self.balance_after
        )
    }
}

/// The three bus topics (C8): `balances`, `orders`, `deals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusMessage {
    Balance {
        time: f64,
        user_id: UserId,
        asset: AssetName,
        business: String,
        balance_after: Decimal,
    },
    Order(OrderEvent),
    Deal(DealEvent),
}

impl BusMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            BusMessage::Balance { .. } => "balances",
            BusMessage::Order(_) => "orders",
            BusMessage::Deal(_) => "deals",
        }
    }
}

/// A pending write for the operation log (C6): canonical `{method,
/// params}` JSON, replayed verbatim on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperlogEntry {
    pub id: OperlogId,
    pub time: f64,
    pub detail: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_event_csv_round_trip_shape() {
        let ev = OrderEvent {
            kind: OrderEventKind::Put,
            time: 1.0,
            market: "STKMNY".into(),
            order_id: 1,
            user_id: 7,
            side: Side::Bid,
            price: Decimal::ONE,
            left: Decimal::ONE,
            deal_stock: Decimal::ZERO,
            deal_money: Decimal::ZERO,
        };
        assert!(ev.to_csv().starts_with("Put,1,STKMNY,1,7,"));
    }

    #[test]
    fn bus_message_topic_routes_correctly() {
        let ev = OrderEvent {
            kind: OrderEventKind::Finish,
            time: 0.0,
            market: "M".into(),
            order_id: 1,
            user_id: 1,
            side: Side::Ask,
            price: Decimal::ZERO,
            left: Decimal::ZERO,
            deal_stock: Decimal::ZERO,
            deal_money: Decimal::ZERO,
        };
        assert_eq!(BusMessage::Order(ev).topic(), "orders");
    }
}
