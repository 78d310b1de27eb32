// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Monotonic timestamp assignment for `AUTO_ASSIGN` cells (spec §4.9 step 2).

use std::sync::atomic::{AtomicI64, Ordering};

/// Returns the current wall-clock time in nanoseconds since the Unix epoch.
#[cfg(not(test))]
pub fn unix_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos() as i64
}

#[cfg(test)]
pub fn unix_nanos() -> i64 {
    if let Some(v) = NOW_OVERRIDE.with(|cell| *cell.borrow()) {
        return v;
    }
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos() as i64
}

#[cfg(test)]
thread_local! {
    static NOW_OVERRIDE: std::cell::RefCell<Option<i64>> = const { std::cell::RefCell::new(None) };
}

#[cfg(test)]
pub fn set_unix_nanos_for_test(value: Option<i64>) {
    NOW_OVERRIDE.with(|cell| *cell.borrow_mut() = value);
}

/// Assigns strictly-increasing `(timestamp, revision)` pairs for `AUTO_ASSIGN`
/// cells on a single range-server, guarding against clock skew (spec §4.9:
/// "assign timestamps (`AUTO_ASSIGN` -> monotonic now-nanos with skew guard)").
///
/// Both the timestamp and the revision counter are monotonic: if the wall
/// clock has not advanced past the last assigned timestamp, the timestamp is
/// bumped by one nanosecond instead of going backwards or standing still.
pub struct MonotonicClock {
    last: AtomicI64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    /// Returns the next strictly-increasing nanosecond timestamp.
    pub fn next(&self) -> i64 {
        let now = unix_nanos();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let candidate = if now > prev { now } else { prev + 1 };
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// A strictly-increasing per-range-server revision counter (spec §3 `revision`,
/// §5 "revisions are assigned during the qualify stage and are strictly
/// monotonic on that range-server").
pub struct RevisionCounter {
    last: AtomicI64,
}

impl Default for RevisionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn observe(&self, value: i64) {
        self.last.fetch_max(value, Ordering::AcqRel);
    }

    pub fn current(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn clock_is_monotonic_even_when_wall_clock_stalls() {
        set_unix_nanos_for_test(Some(100));
        let clock = MonotonicClock::new();
        let a = clock.next();
        let b = clock.next();
        let c = clock.next();
        assert!(a < b);
        assert!(b < c);
        set_unix_nanos_for_test(None);
    }

    #[test]
    fn revision_counter_is_strictly_monotonic() {
        let counter = RevisionCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        counter.observe(10);
        assert_eq!(counter.next(), 11);
    }
}
