// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Client-side range locator: two-level METADATA lookup with a location
//! cache (spec §4.11, component C11).
//!
//! Grounded on the teacher's `descriptor_table/lru.rs` LRU-with-invalidation
//! shape, here keyed by `(table, end_row)` so a lookup for any row finds
//! the smallest cached `end_row >= row` (the range covering it) rather than
//! an exact key match.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Host/port of the range server currently serving a range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Location {
    pub host: String,
    pub port: u16,
}

/// Supplies the root range's current location, as read from the lock
/// service (spec §4.11 step 2: "read the root range entry from the lock
/// service"). A trait so tests and the real lock-service client share one
/// retry/backoff/invalidation implementation.
pub trait RootSource: Send + Sync {
    fn read_root(&self) -> crate::Result<Location>;
}

/// Scans the METADATA range containing `<table>:<row>` and returns the
/// smallest row-key `>= <table>:<row>` with its location (spec §4.11
/// step 2).
pub trait MetadataScanner: Send + Sync {
    fn scan_metadata(&self, root: &Location, table: &str, row: &[u8]) -> crate::Result<(Vec<u8>, Location)>;
}

/// Caches `(table, end_row) -> Location`, so a lookup for `row` finds the
/// smallest cached `end_row >= row`.
#[derive(Default)]
struct LocationCache {
    by_table: HashMap<String, BTreeMap<Vec<u8>, Location>>,
}

impl LocationCache {
    fn get(&self, table: &str, row: &[u8]) -> Option<Location> {
        self.by_table
            .get(table)?
            .range(row.to_vec()..)
            .next()
            .map(|(_, loc)| loc.clone())
    }

    fn insert(&mut self, table: &str, end_row: Vec<u8>, location: Location) {
        self.by_table.entry(table.to_string()).or_default().insert(end_row, location);
    }

    fn invalidate(&mut self, table: &str, row: &[u8]) {
        if let Some(ranges) = self.by_table.get_mut(table) {
            if let Some(end_row) = ranges.range(row.to_vec()..).next().map(|(k, _)| k.clone()) {
                ranges.remove(&end_row);
            }
        }
    }

    /// Removes every entry pointing at `hostname`; returns `true` if any
    /// removed entry's location was `hostname`.
    fn invalidate_host(&mut self, hostname: &str) -> bool {
        let mut any = false;
        for ranges in self.by_table.values_mut() {
            let before = ranges.len();
            ranges.retain(|_, loc| loc.host != hostname);
            any |= ranges.len() != before;
        }
        any
    }
}

/// Client-side range locator (spec §4.11). `backoff_base` controls the
/// sleep between stale-root retries; tests set it to zero.
pub struct RangeLocator {
    root_source: Box<dyn RootSource>,
    metadata_scanner: Box<dyn MetadataScanner>,
    root: Mutex<Option<Location>>,
    root_stale: AtomicBool,
    cache: Mutex<LocationCache>,
    error_queue: Mutex<VecDeque<String>>,
    max_error_queue_length: usize,
    backoff_base: Duration,
    max_retries: u32,
}

impl RangeLocator {
    #[must_use]
    pub fn new(
        root_source: Box<dyn RootSource>,
        metadata_scanner: Box<dyn MetadataScanner>,
        max_error_queue_length: usize,
        backoff_base: Duration,
    ) -> Self {
        Self {
            root_source,
            metadata_scanner,
            root: Mutex::new(None),
            root_stale: AtomicBool::new(true),
            cache: Mutex::new(LocationCache::default()),
            error_queue: Mutex::new(VecDeque::new()),
            max_error_queue_length,
            backoff_base,
            max_retries: 3,
        }
    }

    fn push_error(&self, message: String) {
        let mut queue = self.error_queue.lock().expect("error queue mutex poisoned");
        if queue.len() >= self.max_error_queue_length {
            queue.pop_front();
        }
        queue.push_back(message);
    }

    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.error_queue.lock().expect("error queue mutex poisoned").iter().cloned().collect()
    }

    fn current_root(&self) -> crate::Result<Location> {
        if !self.root_stale.load(Ordering::Acquire) {
            if let Some(root) = self.root.lock().expect("root mutex poisoned").clone() {
                return Ok(root);
            }
        }
        let root = self.root_source.read_root()?;
        *self.root.lock().expect("root mutex poisoned") = Some(root.clone());
        self.root_stale.store(false, Ordering::Release);
        Ok(root)
    }

    /// Locates `(table, row)`: cache hit, else root + METADATA scan, with
    /// stale-root retry and backoff (spec §4.11 "Algorithm").
    pub fn locate(&self, table: &str, row: &[u8]) -> crate::Result<Location> {
        if let Some(location) = self.cache.lock().expect("location cache mutex poisoned").get(table, row) {
            return Ok(location);
        }

        let mut attempt = 0;
        loop {
            let root = self.current_root()?;
            match self.metadata_scanner.scan_metadata(&root, table, row) {
                Ok((end_row, location)) => {
                    self.cache
                        .lock()
                        .expect("location cache mutex poisoned")
                        .insert(table, end_row, location.clone());
                    return Ok(location);
                }
                Err(err) => {
                    self.push_error(format!("metadata scan for {table}:{row:?} failed: {err}"));
                    self.root_stale.store(true, Ordering::Release);
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(err);
                    }
                    if !self.backoff_base.is_zero() {
                        std::thread::sleep(self.backoff_base * attempt);
                    }
                }
            }
        }
    }

    /// Removes a single cached entry (spec §4.11 "Invalidation").
    pub fn invalidate(&self, table: &str, row: &[u8]) {
        self.cache.lock().expect("location cache mutex poisoned").invalidate(table, row);
    }

    /// Removes every cached entry for `hostname`; marks the root stale if
    /// it was the root's host (spec §4.11 "Invalidation").
    pub fn invalidate_host(&self, hostname: &str) {
        self.cache.lock().expect("location cache mutex poisoned").invalidate_host(hostname);
        let root_was_host = self
            .root
            .lock()
            .expect("root mutex poisoned")
            .as_ref()
            .is_some_and(|r| r.host == hostname);
        if root_was_host {
            self.root_stale.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use test_log::test;

    struct FixedRoot(Location);
    impl RootSource for FixedRoot {
        fn read_root(&self) -> crate::Result<Location> {
            Ok(self.0.clone())
        }
    }

    struct FailNTimesThenSucceed {
        remaining_failures: AtomicUsize,
    }
    impl MetadataScanner for FailNTimesThenSucceed {
        fn scan_metadata(&self, _root: &Location, _table: &str, row: &[u8]) -> crate::Result<(Vec<u8>, Location)> {
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(crate::Error::RangeNotFound("metadata unavailable".into()));
            }
            let _ = row;
            Ok((b"zzz".to_vec(), Location { host: "host-a".into(), port: 9000 }))
        }
    }

    fn locator_with(scanner: FailNTimesThenSucceed) -> RangeLocator {
        RangeLocator::new(
            Box::new(FixedRoot(Location { host: "root-host".into(), port: 8000 })),
            Box::new(scanner),
            50,
            Duration::ZERO,
        )
    }

    #[test]
    fn locate_caches_after_first_metadata_scan() {
        let locator = locator_with(FailNTimesThenSucceed { remaining_failures: AtomicUsize::new(0) });
        let loc = locator.locate("users", b"row5").unwrap();
        assert_eq!(loc.host, "host-a");

        // Second call must be served from cache without another scan failing.
        let loc2 = locator.locate("users", b"row5").unwrap();
        assert_eq!(loc2.host, "host-a");
    }

    #[test]
    fn locate_retries_stale_root_and_records_errors() {
        let locator = locator_with(FailNTimesThenSucceed { remaining_failures: AtomicUsize::new(2) });
        let loc = locator.locate("users", b"row5").unwrap();
        assert_eq!(loc.host, "host-a");
        assert_eq!(locator.errors().len(), 2);
    }

    #[test]
    fn invalidate_host_marks_root_stale_when_it_was_the_root() {
        let locator = locator_with(FailNTimesThenSucceed { remaining_failures: AtomicUsize::new(0) });
        locator.locate("users", b"row5").unwrap();
        locator.invalidate_host("root-host");
        assert!(locator.root_stale.load(Ordering::Acquire));
    }

    #[test]
    fn invalidate_removes_single_cache_entry() {
        let locator = locator_with(FailNTimesThenSucceed { remaining_failures: AtomicUsize::new(0) });
        locator.locate("users", b"row5").unwrap();
        locator.invalidate("users", b"row5");
        // A fresh lookup must hit the scanner again (no failures queued,
        // so this simply verifies no panic / cache still functions).
        let loc = locator.locate("users", b"row5").unwrap();
        assert_eq!(loc.host, "host-a");
    }
}
