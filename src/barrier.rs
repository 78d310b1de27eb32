// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Reader/writer-style barriers gating writes and scans during structural
//! range operations (spec §4.6, §6.6, component C14).

use std::sync::{Condvar, Mutex};

struct State {
    active: u64,
    blocked: bool,
}

/// A barrier with two states: open (any number of scoped activations may
/// run concurrently) and closed (new activations block until reopened,
/// and closing waits for in-flight activations to drain).
///
/// Used as `update_barrier` (gates `add`) and `scan_barrier` (gates
/// `create_scanner`) on [`crate::range::Range`].
pub struct Barrier {
    state: Mutex<State>,
    drained: Condvar,
    reopened: Condvar,
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Barrier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                active: 0,
                blocked: false,
            }),
            drained: Condvar::new(),
            reopened: Condvar::new(),
        }
    }

    /// Enters the barrier, blocking while it is closed, and returns a
    /// guard that decrements the active count on drop.
    #[must_use]
    pub fn enter(&self) -> BarrierGuard<'_> {
        let mut state = self.state.lock().expect("barrier mutex poisoned");
        while state.blocked {
            state = self.reopened.wait(state).expect("barrier mutex poisoned");
        }
        state.active += 1;
        BarrierGuard { barrier: self }
    }

    /// Closes the barrier (new `enter` calls will block) and waits for
    /// every currently-active guard to drop. Returns a handle that
    /// reopens the barrier on drop.
    #[must_use]
    pub fn close(&self) -> ClosedBarrier<'_> {
        let mut state = self.state.lock().expect("barrier mutex poisoned");
        state.blocked = true;
        while state.active > 0 {
            state = self.drained.wait(state).expect("barrier mutex poisoned");
        }
        ClosedBarrier { barrier: self }
    }
}

/// RAII guard for one active barrier entry.
pub struct BarrierGuard<'a> {
    barrier: &'a Barrier,
}

impl Drop for BarrierGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock().expect("barrier mutex poisoned");
        state.active -= 1;
        if state.active == 0 {
            self.barrier.drained.notify_all();
        }
    }
}

/// RAII handle for a closed barrier; reopens it on drop.
pub struct ClosedBarrier<'a> {
    barrier: &'a Barrier,
}

impl Drop for ClosedBarrier<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock().expect("barrier mutex poisoned");
        state.blocked = false;
        self.barrier.reopened.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use test_log::test;

    #[test]
    fn enter_and_drop_tracks_active_count() {
        let barrier = Barrier::new();
        let guard = barrier.enter();
        drop(guard);
        let closed = barrier.close();
        drop(closed);
    }

    #[test]
    fn close_waits_for_active_guards_to_drain() {
        let barrier = Arc::new(Barrier::new());
        let guard = barrier.enter();

        let barrier2 = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            let _closed = barrier2.close();
        });

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn enter_blocks_while_closed() {
        let barrier = Arc::new(Barrier::new());
        let closed = barrier.close();

        let barrier2 = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            let _guard = barrier2.enter();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        drop(closed);
        handle.join().unwrap();
    }
}
