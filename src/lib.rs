//! Core balance ledger, order book, and matching engine for a crypto
//! exchange.
//!
//! # Modules
//!
//! - [`core_types`] - shared identifier and enum types
//! - [`error`] - typed error kinds per component boundary
//! - [`precision`] - decimal rescale helpers and monotonic id counters
//! - [`config`] - asset/market/engine configuration (YAML)
//! - [`registry`] - asset & market registry (C3)
//! - [`balance`] - the balance ledger (C2)
//! - [`models`] - the `Order` data model
//! - [`orderbook`] - price-time priority order book (C4 data structure)
//! - [`engine`] - the matching engine (C4 algorithm)
//! - [`messages`] - event and bus message types
//! - [`idempotency`] - duplicate-command suppression cache (C5)
//! - [`operlog`] - operation log writer (C6)
//! - [`history`] - history emitter (C7)
//! - [`bus`] - bus emitter (C8)
//! - [`snapshot`] - snapshot dump & restore (C9)
//! - [`dispatcher`] - command dispatcher (C10)
//! - [`logging`] - structured logging setup
//! - [`persistence`] - file-based sink implementations for the demo binary

pub mod core_types;
pub mod error;
pub mod precision;

pub mod config;
pub mod registry;

pub mod balance;
pub mod models;
pub mod orderbook;
pub mod engine;
pub mod messages;

pub mod idempotency;
pub mod operlog;
pub mod history;
pub mod bus;
pub mod snapshot;
pub mod dispatcher;

pub mod logging;
pub mod persistence;

pub use balance::Ledger;
pub use core_types::{AssetName, DealId, MarketName, OrderId, OperlogId, Side, UserId};
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use error::{DispatchError, EngineError, MatchError};
pub use models::Order;
pub use orderbook::OrderBook;
pub use registry::{Asset, Market, Registry};
