// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Query cache: an LRU of whole scan results keyed by a digest of the scan
//! specification (spec §4.12, component C12).
//!
//! Grounded on the teacher's `block_cache.rs` (a `quick_cache`-backed,
//! byte-weighted LRU); unlike the block cache this one is invalidated by
//! `(tablename, row, columns)` rather than by block id, so a secondary
//! index from that triple to cache keys is kept alongside the cache.

use crate::Slice;
use quick_cache::sync::Cache;
use quick_cache::Weighter;
use rustc_hash::FxBuildHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Approximate per-entry bookkeeping overhead counted toward its weight
/// (spec §4.12 "approximate size = len + overhead + |row|").
const ENTRY_OVERHEAD: u64 = 64;

/// A 128-bit digest of a scan specification's encoded bytes (spec §4.12).
pub type QueryKey = u128;

#[must_use]
pub fn digest(scan_spec_bytes: &[u8]) -> QueryKey {
    xxhash_rust::xxh3::xxh3_128(scan_spec_bytes)
}

/// A cached scan result (spec §4.12).
#[derive(Clone, Debug)]
pub struct QueryCacheEntry {
    pub tablename: String,
    pub row: Vec<u8>,
    pub columns: Vec<u8>,
    pub cell_count: u32,
    pub result: Slice,
    pub result_len: u32,
}

impl QueryCacheEntry {
    fn weight(&self) -> u64 {
        self.result.len() as u64 + ENTRY_OVERHEAD + self.row.len() as u64
    }
}

#[derive(Clone, Default)]
struct EntryWeighter;

impl Weighter<QueryKey, QueryCacheEntry> for EntryWeighter {
    fn weight(&self, _key: &QueryKey, entry: &QueryCacheEntry) -> u64 {
        entry.weight().max(1)
    }
}

/// Sliding window of the most recent 1000 lookups, for a recent hit rate
/// independent of the lifetime `total_lookups`/`total_hits` counters.
struct RecentWindow {
    hits: Mutex<VecDeque<bool>>,
}

impl RecentWindow {
    const CAPACITY: usize = 1000;

    fn new() -> Self {
        Self {
            hits: Mutex::new(VecDeque::with_capacity(Self::CAPACITY)),
        }
    }

    fn record(&self, hit: bool) {
        let mut hits = self.hits.lock().expect("recent window mutex poisoned");
        if hits.len() == Self::CAPACITY {
            hits.pop_front();
        }
        hits.push_back(hit);
    }

    fn hit_rate(&self) -> f64 {
        let hits = self.hits.lock().expect("recent window mutex poisoned");
        if hits.is_empty() {
            return 0.0;
        }
        hits.iter().filter(|h| **h).count() as f64 / hits.len() as f64
    }
}

/// An LRU keyed by [`QueryKey`], byte-weighted, invalidated by
/// `(tablename, row, columns)` (spec §4.12).
pub struct QueryCache {
    cache: Cache<QueryKey, QueryCacheEntry, EntryWeighter, FxBuildHasher>,
    max_entry_weight: u64,
    index: Mutex<HashMap<(String, Vec<u8>), HashSet<QueryKey>>>,
    total_lookups: AtomicU64,
    total_hits: AtomicU64,
    recent: RecentWindow,
}

impl QueryCache {
    /// `memory_budget` bounds the sum of entry weights; a single entry
    /// whose own weight exceeds it is never cached (spec §4.12 "fail if
    /// entry alone exceeds max").
    #[must_use]
    pub fn new(memory_budget: u64) -> Self {
        Self {
            cache: Cache::with(
                1024,
                memory_budget,
                EntryWeighter,
                FxBuildHasher,
            ),
            max_entry_weight: memory_budget,
            index: Mutex::new(HashMap::new()),
            total_lookups: AtomicU64::new(0),
            total_hits: AtomicU64::new(0),
            recent: RecentWindow::new(),
        }
    }

    /// Inserts `entry` under `key`. Returns `false` without inserting if
    /// the entry's own weight exceeds the cache's memory budget.
    pub fn insert(&self, key: QueryKey, entry: QueryCacheEntry) -> bool {
        if entry.weight() > self.max_entry_weight {
            return false;
        }
        let index_key = (entry.tablename.clone(), entry.row.clone());
        self.index
            .lock()
            .expect("query cache index poisoned")
            .entry(index_key)
            .or_default()
            .insert(key);
        self.cache.insert(key, entry);
        true
    }

    /// On hit, returns `(result, result_len, cell_count)` (spec §4.12
    /// "move to MRU"; `quick_cache`'s sketch-based policy promotes on
    /// every successful `get`).
    pub fn lookup(&self, key: QueryKey) -> Option<(Slice, u32, u32)> {
        self.total_lookups.fetch_add(1, Ordering::Relaxed);
        let found = self.cache.get(&key);
        self.recent.record(found.is_some());
        if found.is_some() {
            self.total_hits.fetch_add(1, Ordering::Relaxed);
        }
        found.map(|e| (e.result.clone(), e.result_len, e.cell_count))
    }

    /// Removes every entry matching `(tablename, row)` whose column set
    /// intersects `columns`, or where either side is empty (spec §4.12
    /// "Invalidation").
    pub fn invalidate(&self, tablename: &str, row: &[u8], columns: &[u8]) {
        let index_key = (tablename.to_string(), row.to_vec());
        let mut index = self.index.lock().expect("query cache index poisoned");
        let Some(keys) = index.remove(&index_key) else {
            return;
        };
        for key in keys {
            if let Some((_, entry)) = self.cache.remove(&key) {
                let intersects = columns.is_empty()
                    || entry.columns.is_empty()
                    || entry.columns.iter().any(|c| columns.contains(c));
                if !intersects {
                    // Not actually invalidated by this column set; put it back.
                    index.entry(index_key.clone()).or_default().insert(key);
                    self.cache.insert(key, entry);
                }
            }
        }
    }

    #[must_use]
    pub fn total_lookups(&self) -> u64 {
        self.total_lookups.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_hits(&self) -> u64 {
        self.total_hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn recent_hit_rate(&self) -> f64 {
        self.recent.hit_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn entry(tablename: &str, row: &[u8], columns: &[u8]) -> QueryCacheEntry {
        QueryCacheEntry {
            tablename: tablename.to_string(),
            row: row.to_vec(),
            columns: columns.to_vec(),
            cell_count: 3,
            result: Slice::new(b"result bytes"),
            result_len: 12,
        }
    }

    #[test]
    fn insert_then_lookup_is_a_hit() {
        let cache = QueryCache::new(1 << 20);
        let key = digest(b"spec-a");
        assert!(cache.insert(key, entry("users", b"row", &[0])));

        let (result, len, cells) = cache.lookup(key).unwrap();
        assert_eq!(&*result, b"result bytes");
        assert_eq!(len, 12);
        assert_eq!(cells, 3);
        assert_eq!(cache.total_hits(), 1);
        assert_eq!(cache.total_lookups(), 1);
    }

    #[test]
    fn lookup_miss_is_counted() {
        let cache = QueryCache::new(1 << 20);
        assert!(cache.lookup(digest(b"missing")).is_none());
        assert_eq!(cache.total_lookups(), 1);
        assert_eq!(cache.total_hits(), 0);
    }

    #[test]
    fn entry_larger_than_budget_is_rejected() {
        let cache = QueryCache::new(8);
        assert!(!cache.insert(digest(b"big"), entry("users", b"row", &[0])));
    }

    #[test]
    fn invalidate_removes_matching_column_set() {
        let cache = QueryCache::new(1 << 20);
        let key = digest(b"spec-b");
        cache.insert(key, entry("users", b"row", &[0, 1]));

        cache.invalidate("users", b"row", &[1, 2]);
        assert!(cache.lookup(key).is_none());
    }

    #[test]
    fn invalidate_with_empty_columns_matches_everything_for_the_row() {
        let cache = QueryCache::new(1 << 20);
        let key = digest(b"spec-c");
        cache.insert(key, entry("users", b"row", &[5]));

        cache.invalidate("users", b"row", &[]);
        assert!(cache.lookup(key).is_none());
    }
}
