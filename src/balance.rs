//! Balance ledger (C2): the single source of truth for user balances.
//!
//! # Enforcement strategy
//! 1. The map is private -- all access goes through `Ledger`'s methods.
//! 2. Every mutation returns `Result`; none panic.
//! 3. A balance that reaches exactly zero is deleted, never left as a
//!    stored zero (see the data model's zero-delete invariant).
//! 4. Every stored value is rescaled to the asset's `prec_save` on write.
//!
//! This keeps the private-fields / validated-Result-returning-mutator shape
//! of the teacher's `Balance` type, generalized from a single fixed-point
//! `u64` amount to a per-asset-scaled `Decimal`.

use rustc_hash::FxHashMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::Zero;
use serde::{Deserialize, Serialize};

use crate::core_types::{AssetName, BalanceKind, UserId};
use crate::error::BalanceError;
use crate::precision::rescale;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub user_id: UserId,
    pub kind: BalanceKind,
}

/// Aggregate counts/sums returned by [`Ledger::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AssetStatus {
    pub total: Decimal,
    pub available_count: usize,
    pub available_sum: Decimal,
    pub frozen_count: usize,
    pub frozen_sum: Decimal,
}

/// User x asset x (available, frozen) map.
///
/// Keyed by `(asset, BalanceKey)` rather than a single composite struct so
/// that `status(asset)` can iterate one asset's entries without a full
/// table scan filter -- mirrors the source's per-asset dict-of-dicts shape
/// without actually nesting two hash maps per lookup.
#[derive(Debug, Default)]
pub struct Ledger {
    balances: FxHashMap<(AssetName, BalanceKey), Decimal>,
    /// Precision each asset's stored balances are rescaled to. Populated by
    /// the registry at startup; unknown assets are rejected before any
    /// balance mutation is attempted.
    prec_save: FxHashMap<AssetName, u32>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset's storage precision. Called once at startup by the
    /// registry loader; unknown assets fail every ledger operation.
    pub fn register_asset(&mut self, asset: &str, prec_save: u32) {
        self.prec_save.insert(asset.to_string(), prec_save);
    }

    fn prec_of(&self, asset: &str) -> Result<u32, BalanceError> {
        self.prec_save
            .get(asset)
            .copied()
            .ok_or_else(|| BalanceError::UnknownAsset(asset.to_string()))
    }

    pub fn get(&self, user_id: UserId, kind: BalanceKind, asset: &str) -> Option<Decimal> {
        self.balances
            .get(&(asset.to_string(), BalanceKey { user_id, kind }))
            .copied()
    }

    /// `v<0` fails; `v=0` deletes the entry and returns `Decimal::ZERO`;
    /// else the value is stored rescaled to `prec_save(asset)`.
    pub fn set(
        &mut self,
        user_id: UserId,
        kind: BalanceKind,
        asset: &str,
        v: Decimal,
    ) -> Result<Decimal, BalanceError> {
        if v < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        let prec = self.prec_of(asset)?;
        let key = (asset.to_string(), BalanceKey { user_id, kind });
        if v.is_zero() {
            self.balances.remove(&key);
            return Ok(Decimal::ZERO);
        }
        let stored = rescale(v, prec);
        self.balances.insert(key, stored);
        Ok(stored)
    }

    /// `v<0` fails. Result is rescaled; the zero-delete invariant is still
    /// enforced in case rescaling truncates the sum to exactly zero.
    pub fn add(
        &mut self,
        user_id: UserId,
        kind: BalanceKind,
        asset: &str,
        v: Decimal,
    ) -> Result<Decimal, BalanceError> {
        if v < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        let prec = self.prec_of(asset)?;
        let key = (asset.to_string(), BalanceKey { user_id, kind });
        let current = self.balances.get(&key).copied().unwrap_or(Decimal::ZERO);
        let result = rescale(current + v, prec);
        if result.is_zero() {
            self.balances.remove(&key);
        } else {
            self.balances.insert(key, result);
        }
        Ok(result)
    }

    /// `v<0` fails; fails if `current < v`. Result is rescaled; an exact
    /// zero result deletes the entry.
    pub fn sub(
        &mut self,
        user_id: UserId,
        kind: BalanceKind,
        asset: &str,
        v: Decimal,
    ) -> Result<Decimal, BalanceError> {
        if v < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        let prec = self.prec_of(asset)?;
        let key = (asset.to_string(), BalanceKey { user_id, kind });
        let current = self.balances.get(&key).copied().unwrap_or(Decimal::ZERO);
        if current < v {
            return Err(BalanceError::InsufficientBalance);
        }
        let result = rescale(current - v, prec);
        if result.is_zero() {
            self.balances.remove(&key);
        } else {
            self.balances.insert(key, result);
        }
        Ok(result)
    }

    /// `sub(Available, v) + add(Frozen, v)`. Requires `Available >= v`; we
    /// validate before mutating either side, so there is no partial-failure
    /// window between the two halves.
    pub fn freeze(&mut self, user_id: UserId, asset: &str, v: Decimal) -> Result<(), BalanceError> {
        if v < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        let available = self
            .get(user_id, BalanceKind::Available, asset)
            .unwrap_or(Decimal::ZERO);
        if available < v {
            return Err(BalanceError::InsufficientBalance);
        }
        self.sub(user_id, BalanceKind::Available, asset, v)?;
        self.add(user_id, BalanceKind::Frozen, asset, v)?;
        Ok(())
    }

    /// Dual of [`Ledger::freeze`].
    pub fn unfreeze(&mut self, user_id: UserId, asset: &str, v: Decimal) -> Result<(), BalanceError> {
        if v < Decimal::ZERO {
            return Err(BalanceError::NegativeAmount);
        }
        let frozen = self
            .get(user_id, BalanceKind::Frozen, asset)
            .unwrap_or(Decimal::ZERO);
        if frozen < v {
            return Err(BalanceError::InsufficientBalance);
        }
        self.sub(user_id, BalanceKind::Frozen, asset, v)?;
        self.add(user_id, BalanceKind::Available, asset, v)?;
        Ok(())
    }

    /// Consume previously frozen funds as part of a trade settlement.
    /// Unlike [`Ledger::unfreeze`], nothing is credited back to `available`
    /// -- the amount has left this user's possession entirely, paid to the
    /// trade counterparty, whose own `add` call is the other half of the
    /// transfer.
    pub fn spend_frozen(&mut self, user_id: UserId, asset: &str, v: Decimal) -> Result<Decimal, BalanceError> {
        self.sub(user_id, BalanceKind::Frozen, asset, v)
    }

    pub fn total(&self, user_id: UserId, asset: &str) -> Decimal {
        self.get(user_id, BalanceKind::Available, asset).unwrap_or(Decimal::ZERO)
            + self.get(user_id, BalanceKind::Frozen, asset).unwrap_or(Decimal::ZERO)
    }

    /// Full-scan status for one asset: `(total, available_count,
    /// available_sum, frozen_count, frozen_sum)`.
    pub fn status(&self, asset: &str) -> AssetStatus {
        let mut out = AssetStatus::default();
        for ((a, key), v) in self.balances.iter() {
            if a != asset {
                continue;
            }
            match key.kind {
                BalanceKind::Available => {
                    out.available_count += 1;
                    out.available_sum += *v;
                }
                BalanceKind::Frozen => {
                    out.frozen_count += 1;
                    out.frozen_sum += *v;
                }
            }
        }
        out.total = out.available_sum + out.frozen_sum;
        out
    }

    /// Iterate every non-zero `(asset, BalanceKey, value)` entry, used by
    /// the snapshot writer (C9) and by property tests.
    pub fn iter(&self) -> impl Iterator<Item = (&AssetName, &BalanceKey, &Decimal)> {
        self.balances.iter().map(|((a, k), v)| (a, k, v))
    }

    /// Load a balance directly, bypassing validation -- used only by
    /// snapshot restore (C9), which trusts its own persisted rows.
    pub fn restore_entry(&mut self, user_id: UserId, kind: BalanceKind, asset: &str, v: Decimal) {
        if v.is_zero() {
            return;
        }
        self.balances
            .insert((asset.to_string(), BalanceKey { user_id, kind }), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_stk() -> Ledger {
        let mut l = Ledger::new();
        l.register_asset("STK", 8);
        l
    }

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn add_and_get() {
        let mut l = ledger_with_stk();
        l.add(1, BalanceKind::Available, "STK", d("1.5")).unwrap();
        assert_eq!(l.get(1, BalanceKind::Available, "STK"), Some(d("1.5")));
    }

    #[test]
    fn sub_to_zero_deletes_entry() {
        let mut l = ledger_with_stk();
        l.add(1, BalanceKind::Available, "STK", d("1.5")).unwrap();
        l.sub(1, BalanceKind::Available, "STK", d("1.5")).unwrap();
        assert_eq!(l.get(1, BalanceKind::Available, "STK"), None);
    }

    #[test]
    fn sub_insufficient_fails_without_mutation() {
        let mut l = ledger_with_stk();
        l.add(1, BalanceKind::Available, "STK", d("1.0")).unwrap();
        assert_eq!(
            l.sub(1, BalanceKind::Available, "STK", d("2.0")),
            Err(BalanceError::InsufficientBalance)
        );
        assert_eq!(l.get(1, BalanceKind::Available, "STK"), Some(d("1.0")));
    }

    #[test]
    fn unknown_asset_fails() {
        let mut l = Ledger::new();
        assert_eq!(
            l.add(1, BalanceKind::Available, "NOPE", d("1.0")),
            Err(BalanceError::UnknownAsset("NOPE".to_string()))
        );
    }

    #[test]
    fn freeze_then_unfreeze_is_identity() {
        let mut l = ledger_with_stk();
        l.add(1, BalanceKind::Available, "STK", d("10")).unwrap();
        l.freeze(1, "STK", d("4")).unwrap();
        assert_eq!(l.get(1, BalanceKind::Available, "STK"), Some(d("6")));
        assert_eq!(l.get(1, BalanceKind::Frozen, "STK"), Some(d("4")));
        l.unfreeze(1, "STK", d("4")).unwrap();
        assert_eq!(l.get(1, BalanceKind::Available, "STK"), Some(d("10")));
        assert_eq!(l.get(1, BalanceKind::Frozen, "STK"), None);
    }

    #[test]
    fn freeze_insufficient_available_is_untouched() {
        let mut l = ledger_with_stk();
        l.add(1, BalanceKind::Available, "STK", d("1")).unwrap();
        assert!(l.freeze(1, "STK", d("2")).is_err());
        assert_eq!(l.get(1, BalanceKind::Available, "STK"), Some(d("1")));
        assert_eq!(l.get(1, BalanceKind::Frozen, "STK"), None);
    }

    #[test]
    fn status_aggregates_across_users() {
        let mut l = ledger_with_stk();
        l.add(1, BalanceKind::Available, "STK", d("1")).unwrap();
        l.add(2, BalanceKind::Available, "STK", d("2")).unwrap();
        l.add(2, BalanceKind::Frozen, "STK", d("3")).unwrap();
        let status = l.status("STK");
        assert_eq!(status.available_count, 2);
        assert_eq!(status.available_sum, d("3"));
        assert_eq!(status.frozen_count, 1);
        assert_eq!(status.frozen_sum, d("3"));
        assert_eq!(status.total, d("6"));
    }

    #[test]
    fn rescale_truncates_excess_precision() {
        let mut l = ledger_with_stk();
        l.add(1, BalanceKind::Available, "STK", d("1.123456789")).unwrap();
        assert_eq!(l.get(1, BalanceKind::Available, "STK"), Some(d("1.12345678")));
    }

    #[test]
    fn negative_set_fails() {
        let mut l = ledger_with_stk();
        assert_eq!(
            l.set(1, BalanceKind::Available, "STK", d("-1")),
            Err(BalanceError::NegativeAmount)
        );
    }

    #[test]
    fn set_zero_deletes() {
        let mut l = ledger_with_stk();
        l.add(1, BalanceKind::Available, "STK", d("5")).unwrap();
        l.set(1, BalanceKind::Available, "STK", d("0")).unwrap();
        assert_eq!(l.get(1, BalanceKind::Available, "STK"), None);
    }
}
