//! Process-level candle cache.
//!
//! Datasets are loaded once per (symbol, timeframe, range) key and shared
//! read-only behind `Arc`s. Concurrent jobs requesting the same key get the
//! same allocation: the cache lock is held across the load, so the second
//! requester always finds the first one's entry instead of racing it.
//! Retention is job-scoped. Every `get_or_load` registers the calling run as
//! a user of the entry; releasing a run drops entries nobody else holds.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use paramlab_core::{CandleDataset, DatasetKey, RunId, ValidationMode};

use crate::store::{HistoricalStore, StoreError};

struct CacheEntry {
    dataset: Arc<CandleDataset>,
    users: HashSet<RunId>,
}

pub struct CandleDataCache {
    store: Arc<dyn HistoricalStore>,
    entries: Mutex<HashMap<DatasetKey, CacheEntry>>,
}

impl CandleDataCache {
    pub fn new(store: Arc<dyn HistoricalStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the dataset for `key`, loading it through the backing store on
    /// first use. The validation mode applies only to that first load; later
    /// callers share whatever the first caller validated.
    pub fn get_or_load(
        &self,
        run_id: &RunId,
        key: &DatasetKey,
        mode: ValidationMode,
    ) -> Result<Arc<CandleDataset>, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.users.insert(run_id.clone());
            tracing::debug!(%key, %run_id, "candle cache hit");
            return Ok(Arc::clone(&entry.dataset));
        }

        // Load while holding the lock: a concurrent request for the same key
        // must alias this allocation, not produce a second one.
        let dataset = Arc::new(self.store.load(&key.symbol, key.timeframe, &key.range, mode)?);
        tracing::info!(
            %key,
            %run_id,
            candles = dataset.len(),
            hash = dataset.hash().short(),
            "candle cache miss, loaded dataset"
        );
        let mut users = HashSet::new();
        users.insert(run_id.clone());
        entries.insert(
            key.clone(),
            CacheEntry {
                dataset: Arc::clone(&dataset),
                users,
            },
        );
        Ok(dataset)
    }

    /// Drop `run_id` from every entry it holds; entries with no remaining
    /// users are evicted. Called once per job at termination, on every path
    /// out of the worker.
    pub fn release_job(&self, run_id: &RunId) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|key, entry| {
            entry.users.remove(run_id);
            if entry.users.is_empty() {
                tracing::debug!(%key, "evicting unused dataset");
                false
            } else {
                true
            }
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(%run_id, evicted, "released job datasets");
        }
    }

    /// Evict everything regardless of users. Maintenance path only.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_cached(&self, key: &DatasetKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{NaiveDate, NaiveDateTime};
    use paramlab_core::data::synthetic_walk;
    use paramlab_core::{DateRange, Timeframe};

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn cache_with(symbols: &[&str]) -> CandleDataCache {
        let mut store = MemoryStore::new();
        for (i, symbol) in symbols.iter().enumerate() {
            let candles = synthetic_walk(Timeframe::M15, start(), 200, 42 + i as u64);
            store.insert(CandleDataset::new(*symbol, Timeframe::M15, candles).unwrap());
        }
        CandleDataCache::new(Arc::new(store))
    }

    fn key(symbol: &str, hours: i64) -> DatasetKey {
        DatasetKey {
            symbol: symbol.to_string(),
            timeframe: Timeframe::M15,
            range: DateRange::new(start(), start() + chrono::Duration::hours(hours)).unwrap(),
        }
    }

    fn run(tag: &str) -> RunId {
        RunId(format!("grid_search-20240301T090000-{tag}"))
    }

    #[test]
    fn repeat_requests_share_one_allocation() {
        let cache = cache_with(&["BTCUSDT"]);
        let a = cache
            .get_or_load(&run("aaaaaaaaaa"), &key("BTCUSDT", 10), ValidationMode::Strict)
            .unwrap();
        let b = cache
            .get_or_load(&run("aaaaaaaaaa"), &key("BTCUSDT", 10), ValidationMode::Strict)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn concurrent_jobs_alias_the_same_dataset() {
        let cache = cache_with(&["BTCUSDT"]);
        let a = cache
            .get_or_load(&run("aaaaaaaaaa"), &key("BTCUSDT", 10), ValidationMode::Strict)
            .unwrap();
        let b = cache
            .get_or_load(&run("bbbbbbbbbb"), &key("BTCUSDT", 10), ValidationMode::Strict)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_keys_get_distinct_entries() {
        let cache = cache_with(&["BTCUSDT"]);
        let id = run("aaaaaaaaaa");
        cache
            .get_or_load(&id, &key("BTCUSDT", 10), ValidationMode::Strict)
            .unwrap();
        cache
            .get_or_load(&id, &key("BTCUSDT", 20), ValidationMode::Strict)
            .unwrap();
        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn release_evicts_only_unshared_entries() {
        let cache = cache_with(&["BTCUSDT", "ETHUSDT"]);
        let first = run("aaaaaaaaaa");
        let second = run("bbbbbbbbbb");

        // Shared by both jobs.
        cache
            .get_or_load(&first, &key("BTCUSDT", 10), ValidationMode::Strict)
            .unwrap();
        cache
            .get_or_load(&second, &key("BTCUSDT", 10), ValidationMode::Strict)
            .unwrap();
        // Held by the first job alone.
        cache
            .get_or_load(&first, &key("ETHUSDT", 10), ValidationMode::Strict)
            .unwrap();
        assert_eq!(cache.entry_count(), 2);

        cache.release_job(&first);
        assert!(cache.is_cached(&key("BTCUSDT", 10)));
        assert!(!cache.is_cached(&key("ETHUSDT", 10)));

        cache.release_job(&second);
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn releasing_an_unknown_job_is_harmless() {
        let cache = cache_with(&["BTCUSDT"]);
        cache
            .get_or_load(&run("aaaaaaaaaa"), &key("BTCUSDT", 10), ValidationMode::Strict)
            .unwrap();
        cache.release_job(&run("zzzzzzzzzz"));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn load_failure_caches_nothing() {
        let cache = cache_with(&["BTCUSDT"]);
        let err = cache.get_or_load(&run("aaaaaaaaaa"), &key("GHOST", 10), ValidationMode::Strict);
        assert!(matches!(err, Err(StoreError::MissingSymbol { .. })));
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn clear_evicts_everything() {
        let cache = cache_with(&["BTCUSDT"]);
        cache
            .get_or_load(&run("aaaaaaaaaa"), &key("BTCUSDT", 10), ValidationMode::Strict)
            .unwrap();
        cache.clear();
        assert_eq!(cache.entry_count(), 0);
    }
}
