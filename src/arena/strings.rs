// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Flyweight string interning, layered on top of [`super::Arena`].
//!
//! Grounded on `examples/original_source/src/cc/Common/FlyweightString.h`
//! (named in spec §4.1 as "a companion 'flyweight string set'"); the
//! original has no Rust analogue in the teacher crate.

use super::Arena;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// An ordered, de-duplicating set of interned strings backed by an arena.
///
/// `get(s)` returns the canonical copy for `s`, allocating it in the arena
/// only the first time it is seen. Returned strings are valid until the set
/// is cleared or dropped.
pub struct ArenaStringSet {
    arena: Arena,
    interned: Mutex<BTreeSet<Arc<str>>>,
}

impl Default for ArenaStringSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaStringSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: Arena::default(),
            interned: Mutex::new(BTreeSet::new()),
        }
    }

    /// Returns the canonical, arena-backed copy of `s`.
    pub fn get(&self, s: &str) -> Arc<str> {
        let mut set = self.interned.lock().expect("lock poisoned");
        if let Some(existing) = set.get(s) {
            return Arc::clone(existing);
        }
        let owned: Arc<str> = self.arena.dup_str(s).into();
        set.insert(Arc::clone(&owned));
        owned
    }

    /// Number of distinct interned strings.
    pub fn len(&self) -> usize {
        self.interned.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears the set; every previously returned `Arc<str>` remains valid
    /// via its own reference count, but future lookups will re-intern.
    pub fn clear(&self) {
        self.interned.lock().expect("lock poisoned").clear();
        self.arena.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn get_deduplicates() {
        let set = ArenaStringSet::new();
        let a = set.get("data");
        let b = set.get("data");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn distinct_strings_are_distinct() {
        let set = ArenaStringSet::new();
        let a = set.get("data");
        let b = set.get("meta");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn clear_allows_reinterning() {
        let set = ArenaStringSet::new();
        let _ = set.get("data");
        set.clear();
        assert_eq!(set.len(), 0);
        let _ = set.get("data");
        assert_eq!(set.len(), 1);
    }
}
