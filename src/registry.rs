//! Asset & market registry (C3): a static catalogue loaded once at startup.
//!
//! Grounded on the teacher's `SymbolManager` (asset/symbol lookup with
//! precision-aware helpers) generalized from symbol-pair registration to
//! full market registration (stock/money/fee precision, minimum order
//! size) as the data model requires.

use rustc_hash::FxHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{AssetName, MarketName};
use crate::error::RegistryError;

/// `(name, prec_save, prec_show)`. `prec_save >= prec_show`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub name: AssetName,
    pub prec_save: u32,
    pub prec_show: u32,
}

/// `(name, stock, money, stock_prec, money_prec, fee_prec, min_amount)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub name: MarketName,
    pub stock: AssetName,
    pub money: AssetName,
    pub stock_prec: u32,
    pub money_prec: u32,
    pub fee_prec: u32,
    pub min_amount: Decimal,
}

/// Immutable after [`Registry::new`] returns successfully.
#[derive(Debug, Default)]
pub struct Registry {
    assets: FxHashMap<AssetName, Asset>,
    markets: FxHashMap<MarketName, Market>,
}

impl Registry {
    /// Build a registry from a flat asset/market config, validating every
    /// market's cross-asset precision invariants at construction time and
    /// never again.
    pub fn new(assets: Vec<Asset>, markets: Vec<Market>) -> Result<Self, RegistryError> {
        let mut reg = Registry::default();
        for asset in assets {
            if asset.prec_save < asset.prec_show {
                return Err(RegistryError::InvalidMarket(
                    asset.name.clone(),
                    "prec_save must be >= prec_show".to_string(),
                ));
            }
            reg.assets.insert(asset.name.clone(), asset);
        }
        for market in markets {
            reg.validate_market(&market)?;
            reg.markets.insert(market.name.clone(), market);
        }
        Ok(reg)
    }

    fn validate_market(&self, m: &Market) -> Result<(), RegistryError> {
        let stock = self.assets.get(&m.stock);
        let money = self.assets.get(&m.money);
        let (stock, money) = match (stock, money) {
            (Some(s), Some(mo)) => (s, mo),
            _ => {
                return Err(RegistryError::InvalidMarket(
                    m.name.clone(),
                    "stock or money asset not registered".to_string(),
                ));
            }
        };
        if m.stock_prec + m.money_prec > money.prec_save {
            return Err(RegistryError::InvalidMarket(
                m.name.clone(),
                "stock_prec + money_prec must be <= prec_save(money)".to_string(),
            ));
        }
        if m.stock_prec + m.fee_prec > stock.prec_save {
            return Err(RegistryError::InvalidMarket(
                m.name.clone(),
                "stock_prec + fee_prec must be <= prec_save(stock)".to_string(),
            ));
        }
        if m.money_prec + m.fee_prec > money.prec_save {
            return Err(RegistryError::InvalidMarket(
                m.name.clone(),
                "money_prec + fee_prec must be <= prec_save(money)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn asset_exist(&self, name: &str) -> bool {
        self.assets.contains_key(name)
    }

    pub fn asset_prec(&self, name: &str) -> Result<u32, RegistryError> {
        self.assets
            .get(name)
            .map(|a| a.prec_save)
            .ok_or_else(|| RegistryError::UnknownAsset(name.to_string()))
    }

    pub fn asset_prec_show(&self, name: &str) -> Result<u32, RegistryError> {
        self.assets
            .get(name)
            .map(|a| a.prec_show)
            .ok_or_else(|| RegistryError::UnknownAsset(name.to_string()))
    }

    pub fn get_market(&self, name: &str) -> Option<&Market> {
        self.markets.get(name)
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    pub fn markets(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }
}
