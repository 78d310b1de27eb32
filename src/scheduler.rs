// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Maintenance scheduler: periodically computes a per-range priority and
//! dispatches structural work to a bounded worker pool (spec §4.14,
//! component C14).
//!
//! The worker pool's thread/queue bring-up follows the same
//! `inner_locustdb.rs`-derived shape as [`crate::pipeline`]: one task
//! queue, a fixed number of dedicated threads pulling from it over
//! `std::sync::mpsc`. Per-range concurrency is enforced by
//! [`crate::range::Range::try_enter_maintenance`], not by the pool itself.

use crate::config::Context;
use crate::range::{Range, RangeState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// What kind of maintenance a range needs (spec §4.14 "Maintenance
/// scheduler").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MaintenanceTrigger {
    Split,
    MinorCompact,
    MajorCompact,
    MergingCompact,
    PurgeMemory,
}

/// A range paired with the trigger the scheduler decided on for it and a
/// relative priority (higher runs first).
pub struct MaintenanceTask {
    pub range: Arc<Range>,
    pub trigger: MaintenanceTrigger,
    pub priority: u32,
}

/// At or above this many cell stores in one access group, a merging
/// compaction is warranted (spec §4.14 "many small cell stores").
const MERGING_COMPACT_STORE_THRESHOLD: usize = 4;

/// Computes the maintenance trigger and priority for one range, or `None`
/// if it needs nothing right now (spec §4.14 (a)-(d); (e) PURGE is driven
/// globally by `memory_pressure`, not per range, see
/// [`purge_priority`]). Checked in priority order: a range over the split
/// size always wins over a merely full cache.
///
/// "Elevated garbage" (c) has no dedicated tombstone counter to read, so
/// it is approximated from the scan counters already kept per range: a
/// range that has scanned many more cells than it has returned to
/// callers is shadowing a lot of superseded/deleted versions, which is
/// exactly what a major compaction reclaims.
#[must_use]
pub fn compute_priority(range: &Range, ctx: &Context) -> Option<(MaintenanceTrigger, u32)> {
    let mem: u64 = range.access_groups().iter().map(crate::accessgroup::AccessGroup::memory_bytes).sum();
    let max_stores = range
        .access_groups()
        .iter()
        .map(crate::accessgroup::AccessGroup::store_count)
        .max()
        .unwrap_or(0);

    if mem >= ctx.range_split_size && range.state() == RangeState::Steady {
        return Some((MaintenanceTrigger::Split, 100));
    }
    if mem >= ctx.access_group_max_mem {
        return Some((MaintenanceTrigger::MinorCompact, 80));
    }

    let scanned = range.counters.cells_scanned.load(Ordering::Relaxed);
    let returned = range.counters.cells_returned.load(Ordering::Relaxed);
    if scanned >= 1000 && returned.saturating_mul(2) < scanned {
        return Some((MaintenanceTrigger::MajorCompact, 60));
    }

    if max_stores >= MERGING_COMPACT_STORE_THRESHOLD {
        return Some((MaintenanceTrigger::MergingCompact, 40));
    }
    None
}

/// Global (e) PURGE trigger: shadow cache memory under pressure is not a
/// per-range property, so the scheduler consults this once per tick
/// rather than per range (spec §4.14 "(e) ranges under memory pressure").
#[must_use]
pub fn purge_priority(total_cache_bytes: u64, budget: u64) -> Option<(MaintenanceTrigger, u32)> {
    if total_cache_bytes >= budget {
        Some((MaintenanceTrigger::PurgeMemory, 20))
    } else {
        None
    }
}

/// Supplies the set of ranges the scheduler should consider each tick.
/// A trait so the scheduler can run against a fake range set in tests
/// without depending on [`crate::server::RangeServer`]'s directory.
pub trait RangeSource: Send + Sync {
    fn ranges(&self) -> Vec<Arc<Range>>;
}

/// Performs one maintenance task. Implementations live in the caller's
/// range-server (minor/major/merging compact, split, purge); the
/// scheduler only decides priority and dispatch, not policy for how a
/// trigger is carried out.
pub trait MaintenanceRunner: Send + Sync {
    fn run(&self, task: &MaintenanceTask);
}

struct Job {
    task: MaintenanceTask,
}

/// Bounded worker pool draining the maintenance queue; per-range
/// concurrency is one, enforced by [`Range::try_enter_maintenance`]
/// around each job (spec §4.14 "Maintenance guard").
pub struct MaintenanceScheduler {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl MaintenanceScheduler {
    /// Spawns `ctx.maintenance_pool_size` worker threads and a single
    /// tick thread that walks `source` every `ctx.scheduler_tick` and
    /// enqueues the highest-priority task per range.
    #[must_use]
    pub fn start(ctx: Arc<Context>, source: Arc<dyn RangeSource>, runner: Arc<dyn MaintenanceRunner>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..ctx.maintenance_pool_size.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                let runner = Arc::clone(&runner);
                thread::spawn(move || Self::worker_loop(&rx, &runner))
            })
            .collect();

        let tick_shutdown = Arc::clone(&shutdown);
        let tick_ctx = Arc::clone(&ctx);
        let tick_tx = tx.clone();
        let tick_source = Arc::clone(&source);
        let tick_handle = thread::spawn(move || Self::tick_loop(&tick_ctx, &tick_source, &tick_tx, &tick_shutdown));

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            tick_handle: Mutex::new(Some(tick_handle)),
            shutdown,
        }
    }

    fn worker_loop(rx: &Arc<Mutex<Receiver<Job>>>, runner: &Arc<dyn MaintenanceRunner>) {
        loop {
            let job = {
                let rx = rx.lock().expect("maintenance queue mutex poisoned");
                rx.recv()
            };
            let Ok(job) = job else {
                return;
            };
            if job.task.range.is_cancelled() {
                continue;
            }
            let Ok(_guard) = job.task.range.try_enter_maintenance() else {
                // Another task is already running on this range; drop
                // this tick's decision, it will be recomputed next tick.
                continue;
            };
            log::debug!("running {:?} (priority {}) on {}", job.task.trigger, job.task.priority, job.task.range.table.id);
            runner.run(&job.task);
        }
    }

    fn tick_loop(ctx: &Arc<Context>, source: &Arc<dyn RangeSource>, tx: &Sender<Job>, shutdown: &Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Acquire) {
            for range in source.ranges() {
                if range.is_cancelled() {
                    continue;
                }
                if let Some((trigger, priority)) = compute_priority(&range, ctx) {
                    let task = MaintenanceTask { range: Arc::clone(&range), trigger, priority };
                    if tx.send(Job { task }).is_err() {
                        return;
                    }
                }
            }
            thread::sleep(ctx.scheduler_tick);
        }
    }

    /// Submits a task directly, bypassing priority computation (used by
    /// `drop_range`-adjacent callers that already know what must run).
    pub fn submit(&self, task: MaintenanceTask) {
        if let Some(tx) = self.tx.lock().expect("maintenance sender mutex poisoned").as_ref() {
            let _ = tx.send(Job { task });
        }
    }

    /// Stops the tick thread, drops this scheduler's sender so the
    /// channel closes once the tick thread's own clone is also dropped,
    /// and joins every worker thread.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.tick_handle.lock().expect("tick handle mutex poisoned").take() {
            let _ = handle.join();
        }
        self.tx.lock().expect("maintenance sender mutex poisoned").take();
        for worker in self.workers.lock().expect("workers mutex poisoned").drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessgroup::{AccessGroup, AccessGroupPolicy};
    use crate::schema::TableIdentifier;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier as StdBarrier;
    use std::time::Duration as StdDuration;
    use test_log::test;

    fn range_with_mem(dir: &std::path::Path, mem_floor: u64) -> Range {
        let ag = AccessGroup::new("default", dir, AccessGroupPolicy::default(), 1, 0);
        for i in 0..((mem_floor / 16).max(1)) {
            ag.add(crate::value::Cell::new(
                crate::key::CellKey::new(format!("row{i}"), 0, "cq", i as i64 + 1, i as i64 + 1, crate::key::CellFlag::Insert),
                vec![0u8; 8],
            ));
        }
        Range::new(
            TableIdentifier::new("users", 0),
            crate::range::RangeSpec::new(None, crate::range::END_ROW_SENTINEL.to_vec()),
            vec![ag],
            vec![0],
        )
    }

    #[test]
    fn minor_compact_triggered_when_cache_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let range = range_with_mem(dir.path(), 64);
        let mut ctx = Context::new();
        ctx.access_group_max_mem = 1;
        ctx.range_split_size = u64::MAX;
        let (trigger, _) = compute_priority(&range, &ctx).unwrap();
        assert_eq!(trigger, MaintenanceTrigger::MinorCompact);
    }

    #[test]
    fn no_trigger_when_everything_is_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        let range = range_with_mem(dir.path(), 16);
        let ctx = Context::new();
        assert!(compute_priority(&range, &ctx).is_none());
    }

    #[test]
    fn purge_priority_fires_over_budget() {
        assert!(purge_priority(100, 50).is_some());
        assert!(purge_priority(10, 50).is_none());
    }

    struct FixedSource(Vec<Arc<Range>>);
    impl RangeSource for FixedSource {
        fn ranges(&self) -> Vec<Arc<Range>> {
            self.0.clone()
        }
    }

    struct CountingRunner {
        runs: AtomicUsize,
        barrier: StdBarrier,
    }
    impl MaintenanceRunner for CountingRunner {
        fn run(&self, _task: &MaintenanceTask) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.barrier.wait();
        }
    }

    #[test]
    fn scheduler_dispatches_a_submitted_task_to_a_worker() {
        let dir = tempfile::tempdir().unwrap();
        let range = Arc::new(range_with_mem(dir.path(), 16));
        let ctx = Arc::new(Context::new());
        let source: Arc<dyn RangeSource> = Arc::new(FixedSource(vec![]));
        let runner = Arc::new(CountingRunner { runs: AtomicUsize::new(0), barrier: StdBarrier::new(2) });
        let runner_dyn: Arc<dyn MaintenanceRunner> = runner.clone();

        let scheduler = MaintenanceScheduler::start(ctx, source, runner_dyn);
        scheduler.submit(MaintenanceTask { range, trigger: MaintenanceTrigger::MinorCompact, priority: 80 });
        runner.barrier.wait();
        thread::sleep(StdDuration::from_millis(10));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }
}
