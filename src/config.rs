//! Configuration types and YAML loaders (C11, ambient).
//!
//! Generalized from the teacher's `AssetConfig`/`SymbolConfig`/
//! `TradingConfig` (CSV-loaded asset/symbol rows) to asset/market YAML
//! entries, since markets (not bare symbol pairs) are the unit of
//! registration here, plus a small `AppConfig` covering the logging,
//! snapshot, and worker knobs the teacher's binary wires up from its own
//! `config.rs` + CLI flags.

use std::path::PathBuf;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::registry::{Asset, Market, Registry};
use crate::error::RegistryError;

/// Asset + market rows loaded once at startup, handed to [`Registry::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub assets: Vec<Asset>,
    pub markets: Vec<Market>,
}

impl RegistryConfig {
    pub fn from_yaml(s: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }

    pub fn into_registry(self) -> Result<Registry, RegistryError> {
        Registry::new(self.assets, self.markets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

/// Runtime knobs for logging, snapshot cadence, and worker pool sizes.
/// Completes what the teacher's `logging.rs` assumed but never itself
/// defined as a loadable config type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_dir: PathBuf,
    pub log_file_prefix: String,
    pub rotation: LogRotation,
    pub use_json: bool,
    pub log_level: String,
    pub snapshot_dir: PathBuf,
    pub slice_interval_secs: u64,
    pub slice_keep_secs: u64,
    pub history_workers: usize,
    pub operlog_flush_ms: u64,
    pub history_flush_ms: u64,
    pub bus_flush_ms: u64,
    pub max_pending_operlog: usize,
    pub max_pending_history: usize,
    pub max_pending_message: usize,
    pub depth_cache_timeout_secs: f64,
    pub source_max_len: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("log"),
            log_file_prefix: "matching_core".to_string(),
            rotation: LogRotation::Daily,
            use_json: false,
            log_level: "info".to_string(),
            snapshot_dir: PathBuf::from("snapshot"),
            slice_interval_secs: 86400,
            slice_keep_secs: 7 * 86400,
            history_workers: 4,
            operlog_flush_ms: 100,
            history_flush_ms: 100,
            bus_flush_ms: 100,
            max_pending_operlog: 100,
            max_pending_history: 1000,
            max_pending_message: 1000,
            depth_cache_timeout_secs: 0.45,
            source_max_len: 32,
        }
    }
}

impl AppConfig {
    pub fn from_yaml(s: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }
}

/// `min_amount` convenience constructor used by config fixtures/tests that
/// build `Market` values inline rather than loading YAML.
pub fn amount(s: &str) -> Decimal {
    s.parse().expect("valid decimal literal")
}
