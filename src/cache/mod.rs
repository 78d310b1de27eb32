// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cell cache (spec §4.3, component C3).
//!
//! Grounded on the teacher's `memtable/mod.rs`: a `crossbeam-skiplist`-backed
//! sorted map, with the same writer/frozen-snapshot split the teacher uses
//! for flushing memtables to segments.

use crate::arena::Arena;
use crate::key::CellKey;
use crate::value::Cell;
use crate::Slice;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// A single in-memory sorted map of `key -> value`.
///
/// Readers iterate a frozen or writer cache without taking any lock beyond
/// what `crossbeam-skiplist` provides internally (spec: "Frozen snapshots
/// are lock-free readers"). Writers go through [`CacheManager::add`], which
/// holds a read lock on the writer slot for the duration of one insert
/// (spec: "writers hold a write lock across `add`" at the manager level,
/// serializing rotation against in-flight inserts).
pub struct CellCache {
    items: SkipMap<CellKey, Slice>,
    arena: Arena,
    approximate_size: AtomicU64,
}

impl Default for CellCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CellCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: SkipMap::new(),
            arena: Arena::default(),
            approximate_size: AtomicU64::new(0),
        }
    }

    /// Arena-allocates `key` and `value`, then inserts the arena-owned copy.
    pub fn add(&self, key: CellKey, value: Slice) {
        let row_copy = self.arena.dup(&key.row);
        let cq_copy = self.arena.dup(&key.column_qualifier);
        let value_copy = self.arena.dup(&value);

        let size = (row_copy.len() + cq_copy.len() + value_copy.len() + 18) as u64;
        self.approximate_size.fetch_add(size, Ordering::Relaxed);

        self.items.insert(key, value);
    }

    #[must_use]
    pub fn approximate_size(&self) -> u64 {
        self.approximate_size.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates cells within `[lower, upper)` row bounds, in key order.
    pub fn range(&self, lower: Bound<CellKey>, upper: Bound<CellKey>) -> CacheScanner<'_> {
        CacheScanner {
            iter: Box::new(self.items.range((lower, upper))),
        }
    }

    /// Iterates every cell, in key order.
    pub fn iter(&self) -> CacheScanner<'_> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }
}

/// An iterator over a single cache snapshot's cells, in key order.
pub struct CacheScanner<'a> {
    iter: Box<dyn Iterator<Item = crossbeam_skiplist::map::Entry<'a, CellKey, Slice>> + 'a>,
}

impl Iterator for CacheScanner<'_> {
    type Item = Cell;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.iter.next()?;
        Some(Cell {
            key: entry.key().clone(),
            value: entry.value().clone(),
        })
    }
}

/// Owns one writable cell cache and zero or more frozen snapshots awaiting
/// compaction (spec §4.3, "The 'cache manager' owns one writer cache and
/// zero or more frozen snapshots").
pub struct CacheManager {
    writer: RwLock<Arc<CellCache>>,
    frozen: Mutex<Vec<Arc<CellCache>>>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            writer: RwLock::new(Arc::new(CellCache::new())),
            frozen: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, key: CellKey, value: Slice) {
        let writer = self.writer.read().expect("lock poisoned");
        writer.add(key, value);
    }

    /// Returns the current writer cache without freezing it.
    #[must_use]
    pub fn writer(&self) -> Arc<CellCache> {
        Arc::clone(&self.writer.read().expect("lock poisoned"))
    }

    /// Atomically snapshots the writer cache into a frozen, read-only
    /// cache and installs a fresh empty writer cache.
    pub fn freeze(&self) -> Arc<CellCache> {
        let mut writer = self.writer.write().expect("lock poisoned");
        let frozen = std::mem::replace(&mut *writer, Arc::new(CellCache::new()));
        self.frozen
            .lock()
            .expect("lock poisoned")
            .push(Arc::clone(&frozen));
        frozen
    }

    /// All frozen snapshots awaiting compaction, oldest first.
    #[must_use]
    pub fn frozen_snapshots(&self) -> Vec<Arc<CellCache>> {
        self.frozen.lock().expect("lock poisoned").clone()
    }

    /// Removes a frozen snapshot once its contents have been durably
    /// written to a cell store. A no-op if `snapshot` is not present
    /// (already retired), matching the idempotent teardown style the
    /// teacher uses for segment removal.
    pub fn retire(&self, snapshot: &Arc<CellCache>) {
        let mut frozen = self.frozen.lock().expect("lock poisoned");
        frozen.retain(|s| !Arc::ptr_eq(s, snapshot));
    }

    /// Reverts `freeze`: merges a frozen snapshot's cells back into the
    /// current writer and drops the snapshot from the frozen list. Used
    /// when a staged compaction aborts before anything was durably
    /// written, so the cells must not simply be dropped with `retire`.
    pub fn restore(&self, snapshot: &Arc<CellCache>) {
        for cell in snapshot.iter() {
            self.add(cell.key, cell.value);
        }
        self.retire(snapshot);
    }

    /// Total memory held by the writer cache plus every frozen snapshot.
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        let writer_size = self.writer.read().expect("lock poisoned").approximate_size();
        let frozen_size: u64 = self
            .frozen
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|c| c.approximate_size())
            .sum();
        writer_size + frozen_size
    }
}
