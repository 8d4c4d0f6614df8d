//! Idempotency cache (C5): suppresses duplicate external balance mutations.
//!
//! Grounded on the teacher's timestamp-keyed dedup store (a `DashMap`-backed
//! CAS table keyed by a caller-supplied business id), adapted here to a
//! single-threaded `FxHashMap` since the engine itself is single-threaded
//! per market and the dispatcher serializes calls into it.

use rustc_hash::FxHashMap;

use crate::core_types::{AssetName, UserId};

const RETENTION_SECS: f64 = 24.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Fresh,
    Duplicate,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct Key {
    user_id: UserId,
    asset: AssetName,
    business: String,
    business_id: u64,
}

#[derive(Debug, Default)]
pub struct IdempotencyCache {
    entries: FxHashMap<Key, f64>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any external balance mutation must call this before applying its
    /// effect. `Duplicate` means the caller should treat the command as a
    /// successful no-op.
    pub fn try_record(
        &mut self,
        now: f64,
        user_id: UserId,
        asset: &str,
        business: &str,
        business_id: u64,
    ) -> RecordOutcome {
        let key = Key {
            user_id,
            asset: asset.to_string(),
            business: business.to_string(),
            business_id,
        };
        if self.entries.contains_key(&key) {
            return RecordOutcome::Duplicate;
        }
        self.entries.insert(key, now);
        RecordOutcome::Fresh
    }

    /// Drop entries older than 24h. Intended to be called by a periodic
    /// 60-s sweeper task; cheap enough to call more often if needed.
    pub fn sweep(&mut self, now: f64) {
        self.entries.retain(|_, &mut recorded_at| now - recorded_at < RETENTION_SECS);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_record_is_fresh_second_is_duplicate() {
        let mut cache = IdempotencyCache::new();
        assert_eq!(cache.try_record(0.0, 1, "STK", "deposit", 42), RecordOutcome::Fresh);
        assert_eq!(cache.try_record(1.0, 1, "STK", "deposit", 42), RecordOutcome::Duplicate);
    }

    #[test]
    fn distinct_business_ids_are_independent() {
        let mut cache = IdempotencyCache::new();
        assert_eq!(cache.try_record(0.0, 1, "STK", "deposit", 1), RecordOutcome::Fresh);
        assert_eq!(cache.try_record(0.0, 1, "STK", "deposit", 2), RecordOutcome::Fresh);
    }

    #[test]
    fn sweep_purges_entries_older_than_24h() {
        let mut cache = IdempotencyCache::new();
        cache.try_record(0.0, 1, "STK", "deposit", 1);
        cache.sweep(3600.0);
        assert_eq!(cache.len(), 1);
        cache.sweep(25.0 * 3600.0);
        assert_eq!(cache.len(), 0);
    }
}
