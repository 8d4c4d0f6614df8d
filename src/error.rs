//! Typed error kinds for every component boundary, composed into one
//! dispatcher-facing [`EngineError`] with a stable reply-code mapping.
//!
//! Mirrors the teacher's per-module `thiserror` enums (see the funding and
//! transfer modules in the reference corpus): each component gets its own
//! error type, and only the dispatcher needs to know how they map to wire
//! reply codes.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    #[error("unknown asset: {0}")]
    UnknownAsset(String),
    #[error("negative amount is not a valid balance operation")]
    NegativeAmount,
    #[error("insufficient balance")]
    InsufficientBalance,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown asset: {0}")]
    UnknownAsset(String),
    #[error("unknown market: {0}")]
    UnknownMarket(String),
    #[error("invalid market definition for {0}: {1}")]
    InvalidMarket(String, String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("amount below market minimum")]
    AmountTooSmall,
    #[error("no counterparty available in opposite book")]
    NoCounterparty,
    #[error("order not found")]
    OrderNotFound,
    #[error("order belongs to a different user")]
    UserMismatch,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("service unavailable: downstream queue saturated")]
    ServiceUnavailable,
    #[error("repeat update suppressed by idempotency cache")]
    RepeatUpdate,
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Stable reply code for the wire protocol (see §7 of the design doc).
impl DispatchError {
    pub fn reply_code(&self) -> u32 {
        match self {
            DispatchError::InvalidArgument(_) => 1,
            DispatchError::InternalError(_) => 2,
            DispatchError::ServiceUnavailable => 3,
            DispatchError::RepeatUpdate => 10,
            DispatchError::Balance(BalanceError::InsufficientBalance) => 10,
            DispatchError::Match(MatchError::InvalidArgument(_)) => 1,
            DispatchError::Match(MatchError::Balance(BalanceError::InsufficientBalance)) => 10,
            DispatchError::Match(MatchError::AmountTooSmall) => 11,
            DispatchError::Match(MatchError::NoCounterparty) => 12,
            DispatchError::Match(MatchError::OrderNotFound) => 10,
            DispatchError::Match(MatchError::UserMismatch) => 11,
            DispatchError::Balance(_) => 1,
            DispatchError::Registry(_) | DispatchError::Match(MatchError::Registry(_)) => 1,
        }
    }
}

pub type EngineError = DispatchError;
