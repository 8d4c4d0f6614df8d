//! Core identifier and enum types shared across the engine.

use serde::{Deserialize, Serialize};

/// User identifier. Markets and balances are keyed by this.
pub type UserId = u32;

/// Monotonic order identifier, allocated by [`crate::precision::IdSequence`].
pub type OrderId = u64;

/// Monotonic trade (deal) identifier.
pub type DealId = u64;

/// Monotonic operation-log row identifier.
pub type OperlogId = u64;

/// Asset name, e.g. `"BTC"`, `"USDT"`. Assets are looked up by name, not by a
/// numeric id -- this mirrors the source system's string-keyed asset dict.
pub type AssetName = String;

/// Market name, e.g. `"BTCUSDT"`.
pub type MarketName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Ask,
    Bid,
}

impl Side {
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Ask => Side::Bid,
            Side::Bid => Side::Ask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    Market,
}

/// Which half of a balance a [`crate::balance::BalanceKey`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalanceKind {
    Available,
    Frozen,
}

/// Lifecycle event carried on `orders` bus messages (see the wire protocol
/// section of the design doc).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventKind {
    Put = 1,
    Update = 2,
    Finish = 3,
}

/// Which side of a trade a history/bus record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Maker,
    Taker,
}
