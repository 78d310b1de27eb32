// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Update pipeline: qualify/commit/respond worker pools with group commit
//! (spec §4.9, component C9).
//!
//! The three-stage worker pool is grounded on the teacher's bounded-queue
//! shape (`examples/fjall-rs-lsm-tree`'s flush/compaction workers hand off
//! through `crossbeam`-style channels); the queue/thread bring-up itself
//! follows `inner_locustdb.rs`'s `start_worker_threads` pattern (task queue
//! per stage, one dedicated thread per stage) from the LocustDB example,
//! adapted here onto `std::sync::mpsc` rather than introducing a
//! thread-pool crate neither example needs elsewhere in this workspace.

use crate::commitlog::CommitLog;
use crate::error::ErrorCode;
use crate::key::{CellFlag, CellKey, AUTO_ASSIGN};
use crate::range::Range;
use crate::schema::TableIdentifier;
use crate::time::{MonotonicClock, RevisionCounter};
use crate::value::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One raw client mutation prior to qualification. `timestamp`/`revision`
/// may be [`AUTO_ASSIGN`].
#[derive(Clone, Debug)]
pub struct Mutation {
    pub row: Vec<u8>,
    pub column_family_id: u8,
    pub qualifier: Vec<u8>,
    pub timestamp: i64,
    pub revision: i64,
    pub flag: CellFlag,
    pub value: Vec<u8>,
}

/// A mutation the qualify stage could not route, with its position in the
/// original batch (spec §4.10 `update`: `{rejected: [{offset, ...}]}`).
#[derive(Clone, Debug)]
pub struct Rejected {
    pub offset: usize,
    pub error_code: ErrorCode,
}

/// Result delivered back to the caller of [`UpdatePipeline::submit`].
#[derive(Clone, Debug, Default)]
pub struct UpdateOutcome {
    pub rejected: Vec<Rejected>,
}

/// A batch of mutations against one table, submitted together (spec §4.9,
/// §4.10 `update(table, count, buffer, flags)`).
pub struct UpdateBatch {
    pub table: TableIdentifier,
    pub cluster_id: u64,
    pub mutations: Vec<Mutation>,
    pub sync: bool,
    pub ignore_unknown_cfs: bool,
}

/// Maps `(table_id, row)` to the owning live [`Range`]. Owned by the
/// range-server and shared with the pipeline and request surface.
#[derive(Default)]
pub struct RangeDirectory {
    ranges: Mutex<HashMap<String, Vec<Arc<Range>>>>,
}

impl RangeDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, table_id: &str, range: Arc<Range>) {
        self.ranges
            .lock()
            .expect("range directory mutex poisoned")
            .entry(table_id.to_string())
            .or_default()
            .push(range);
    }

    pub fn remove(&self, table_id: &str, end_row: &[u8]) {
        if let Some(ranges) = self.ranges.lock().expect("range directory mutex poisoned").get_mut(table_id) {
            ranges.retain(|r| r.spec().end_row != end_row);
        }
    }

    #[must_use]
    pub fn locate(&self, table_id: &str, row: &[u8]) -> Option<Arc<Range>> {
        let ranges = self.ranges.lock().expect("range directory mutex poisoned");
        ranges
            .get(table_id)?
            .iter()
            .find(|r| r.spec().contains_row(row))
            .cloned()
    }

    /// Finds the installed range for `table_id` with exactly `spec` as
    /// its boundary, for request-surface operations that already know
    /// the boundary rather than a row within it (spec §4.10
    /// `relinquish_range`, `drop_range`).
    #[must_use]
    pub fn locate_exact(&self, table_id: &str, spec: &crate::range::RangeSpec) -> Option<Arc<Range>> {
        let ranges = self.ranges.lock().expect("range directory mutex poisoned");
        ranges.get(table_id)?.iter().find(|r| &r.spec() == spec).cloned()
    }

    /// Every installed range across every table, for the maintenance
    /// scheduler's periodic walk and `status()`/`heapcheck()`.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Range>> {
        self.ranges
            .lock()
            .expect("range directory mutex poisoned")
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}

/// An [`UpdateBatch`] paired with the channel its submitter is blocked on,
/// and the back-pressure bytes reserved for it at enqueue time.
struct QualifyItem {
    batch: UpdateBatch,
    reserved_bytes: u64,
    respond: Sender<UpdateOutcome>,
}

struct QualifiedBatch {
    ranges: Vec<(Arc<Range>, Vec<Cell>)>,
    rejected: Vec<Rejected>,
    sync: bool,
    table: TableIdentifier,
    reserved_bytes: u64,
    respond: Sender<UpdateOutcome>,
}

struct CommittedBatch {
    ranges: Vec<(Arc<Range>, Vec<Cell>)>,
    rejected: Vec<Rejected>,
    reserved_bytes: u64,
    respond: Sender<UpdateOutcome>,
}

/// Accumulated commit-byte counter gating back-pressure (spec §4.9
/// "Back-pressure"): new submissions block at the qualify-queue enqueue
/// once `pending_bytes` exceeds `high_water`, until the pipeline drains.
struct BackPressure {
    pending_bytes: Mutex<u64>,
    drained: Condvar,
    high_water: u64,
}

impl BackPressure {
    fn wait_for_capacity(&self, incoming: u64) {
        let mut pending = self.pending_bytes.lock().expect("back-pressure mutex poisoned");
        while *pending > self.high_water {
            pending = self.drained.wait(pending).expect("back-pressure mutex poisoned");
        }
        *pending += incoming;
    }

    fn release(&self, amount: u64) {
        let mut pending = self.pending_bytes.lock().expect("back-pressure mutex poisoned");
        *pending = pending.saturating_sub(amount);
        if *pending <= self.high_water {
            self.drained.notify_all();
        }
    }
}

fn mutation_wire_size(m: &Mutation) -> u64 {
    (m.row.len() + m.qualifier.len() + m.value.len() + 24) as u64
}

/// Three cooperating worker threads (qualify, commit, respond) connected by
/// bounded `mpsc` channels, plus a group-commit coalescer (spec §4.9).
pub struct UpdatePipeline {
    directory: Arc<RangeDirectory>,
    clock: Arc<MonotonicClock>,
    revision: Arc<RevisionCounter>,
    back_pressure: Arc<BackPressure>,
    qualify_tx: Option<Sender<QualifyItem>>,
    closed: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl UpdatePipeline {
    /// Spawns the qualify/commit/respond workers. `commit_log` is the
    /// single range-server commit log all commits append to; `high_water`
    /// is the back-pressure threshold in accumulated commit bytes.
    #[must_use]
    pub fn start(directory: Arc<RangeDirectory>, commit_log: Arc<CommitLog>, high_water: u64) -> Self {
        let clock = Arc::new(MonotonicClock::new());
        let revision = Arc::new(RevisionCounter::new());
        let back_pressure = Arc::new(BackPressure {
            pending_bytes: Mutex::new(0),
            drained: Condvar::new(),
            high_water,
        });
        let closed = Arc::new(AtomicBool::new(false));

        let (qualify_tx, qualify_rx) = mpsc::channel::<QualifyItem>();
        let (commit_tx, commit_rx) = mpsc::channel::<QualifiedBatch>();
        let (respond_tx, respond_rx) = mpsc::channel::<CommittedBatch>();

        let qualify_directory = Arc::clone(&directory);
        let qualify_clock = Arc::clone(&clock);
        let qualify_revision = Arc::clone(&revision);
        let qualify_bp = Arc::clone(&back_pressure);
        let qualify_handle = thread::spawn(move || {
            qualify_loop(qualify_rx, commit_tx, &qualify_directory, &qualify_clock, &qualify_revision, &qualify_bp);
        });

        let commit_handle = thread::spawn(move || {
            commit_loop(commit_rx, respond_tx, &commit_log);
        });

        let respond_bp = Arc::clone(&back_pressure);
        let respond_handle = thread::spawn(move || {
            respond_loop(respond_rx, &respond_bp);
        });

        Self {
            directory,
            clock,
            revision,
            back_pressure,
            qualify_tx: Some(qualify_tx),
            closed,
            workers: vec![qualify_handle, commit_handle, respond_handle],
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<RangeDirectory> {
        &self.directory
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<MonotonicClock> {
        &self.clock
    }

    #[must_use]
    pub fn revision_counter(&self) -> &Arc<RevisionCounter> {
        &self.revision
    }

    /// Enqueues a batch and blocks for its [`UpdateOutcome`]. Rejects
    /// immediately with [`crate::Error::Cancelled`] if the pipeline is
    /// shut down.
    pub fn submit(&self, batch: UpdateBatch) -> crate::Result<UpdateOutcome> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::Error::Cancelled);
        }
        let reserved_bytes: u64 = batch.mutations.iter().map(mutation_wire_size).sum();
        self.back_pressure.wait_for_capacity(reserved_bytes);

        let (tx, rx) = mpsc::channel();
        let Some(qualify_tx) = &self.qualify_tx else {
            self.back_pressure.release(reserved_bytes);
            return Err(crate::Error::Cancelled);
        };
        if qualify_tx
            .send(QualifyItem {
                batch,
                reserved_bytes,
                respond: tx,
            })
            .is_err()
        {
            self.back_pressure.release(reserved_bytes);
            return Err(crate::Error::Cancelled);
        }
        rx.recv().map_err(|_| crate::Error::Cancelled)
    }

    /// Drains all in-flight work, closes the qualify queue so no new
    /// batches are accepted, and joins every worker thread (spec §4.9
    /// "Cancellation": drains queues, flushes the current commit log,
    /// transitions to CLOSED").
    pub fn shutdown(mut self) {
        self.closed.store(true, Ordering::Release);
        self.qualify_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn qualify_loop(
    rx: Receiver<QualifyItem>,
    commit_tx: Sender<QualifiedBatch>,
    directory: &Arc<RangeDirectory>,
    clock: &Arc<MonotonicClock>,
    revision: &Arc<RevisionCounter>,
    back_pressure: &Arc<BackPressure>,
) {
    while let Ok(item) = rx.recv() {
        let QualifyItem {
            batch,
            reserved_bytes,
            respond,
        } = item;
        let UpdateBatch {
            table,
            cluster_id: _,
            mutations,
            sync,
            ignore_unknown_cfs,
        } = batch;

        let mut by_range: Vec<(Arc<Range>, Vec<Cell>)> = Vec::new();
        let mut rejected = Vec::new();

        for (offset, mutation) in mutations.into_iter().enumerate() {
            let Some(range) = directory.locate(&table.id, &mutation.row) else {
                if !ignore_unknown_cfs {
                    rejected.push(Rejected {
                        offset,
                        error_code: ErrorCode::RangeNotFound,
                    });
                }
                continue;
            };

            let timestamp = if mutation.timestamp == AUTO_ASSIGN {
                clock.next()
            } else {
                mutation.timestamp
            };
            let assigned_revision = if mutation.revision == AUTO_ASSIGN {
                revision.next()
            } else {
                mutation.revision
            };

            let key = CellKey::new(
                mutation.row,
                mutation.column_family_id,
                mutation.qualifier,
                timestamp,
                assigned_revision,
                mutation.flag,
            );
            let cell = Cell::new(key, mutation.value);

            match by_range.iter_mut().find(|(r, _)| Arc::ptr_eq(r, &range)) {
                Some((_, cells)) => cells.push(cell),
                None => by_range.push((range, vec![cell])),
            }
        }

        if commit_tx
            .send(QualifiedBatch {
                ranges: by_range,
                rejected,
                sync,
                table,
                reserved_bytes,
                respond,
            })
            .is_err()
        {
            back_pressure.release(reserved_bytes);
            break;
        }
    }
}

fn commit_loop(rx: Receiver<QualifiedBatch>, respond_tx: Sender<CommittedBatch>, commit_log: &Arc<CommitLog>) {
    while let Ok(batch) = rx.recv() {
        let QualifiedBatch {
            ranges,
            mut rejected,
            sync,
            table,
            reserved_bytes,
            respond,
        } = batch;

        let all_cells: Vec<Cell> = ranges.iter().flat_map(|(_, cells)| cells.iter().cloned()).collect();
        if !all_cells.is_empty() {
            let revision = all_cells.iter().map(|c| c.key.revision).max().unwrap_or(0);
            let should_fsync = sync || table.is_metadata_table();

            for (range, cells) in &ranges {
                let _guard = range.update_barrier.enter();
                if let Err(err) = commit_log.append(cells, revision, 0) {
                    rejected.push(Rejected {
                        offset: 0,
                        error_code: ErrorCode::from(&err),
                    });
                }
            }
            if should_fsync {
                let _ = commit_log.sync();
            }
        }

        if respond_tx
            .send(CommittedBatch {
                ranges,
                rejected,
                reserved_bytes,
                respond,
            })
            .is_err()
        {
            break;
        }
    }
}

fn respond_loop(rx: Receiver<CommittedBatch>, back_pressure: &Arc<BackPressure>) {
    while let Ok(batch) = rx.recv() {
        let CommittedBatch {
            ranges,
            rejected,
            reserved_bytes,
            respond,
        } = batch;

        for (range, cells) in ranges {
            for cell in cells {
                let _ = range.add(cell);
            }
        }

        back_pressure.release(reserved_bytes);
        let _ = respond.send(UpdateOutcome { rejected });
    }
}

/// Per-`(cluster_id, table)` coalescer: aggregates successive `update`
/// calls until the table's configured interval elapses, then submits one
/// batched call to the pipeline (spec §4.9 "Group commit").
pub struct GroupCommit {
    tick_interval: Duration,
    pending: Mutex<HashMap<(u64, String), PendingGroup>>,
}

struct PendingGroup {
    mutations: Vec<Mutation>,
    cluster_id: u64,
    table: TableIdentifier,
    sync: bool,
    deadline_ticks: u64,
}

impl GroupCommit {
    #[must_use]
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Rounds `interval` up to the nearest multiple of the global tick
    /// interval (spec §4.9 "rounded up to a multiple of the global tick
    /// interval").
    #[must_use]
    pub fn round_interval(&self, interval: Duration) -> u64 {
        let tick_ms = self.tick_interval.as_millis().max(1) as u64;
        let interval_ms = interval.as_millis() as u64;
        interval_ms.div_ceil(tick_ms).max(1)
    }

    /// Buffers `mutations` under `(cluster_id, table)`. Returns `true` if
    /// this call started a new coalescing window.
    pub fn add(&self, cluster_id: u64, table: TableIdentifier, mutations: Vec<Mutation>, sync: bool, group_commit_interval: Duration) -> bool {
        let ticks = self.round_interval(group_commit_interval);
        let mut pending = self.pending.lock().expect("group commit mutex poisoned");
        match pending.get_mut(&(cluster_id, table.clone())) {
            Some(group) => {
                group.mutations.extend(mutations);
                group.sync |= sync;
                false
            }
            None => {
                pending.insert(
                    (cluster_id, table.clone()),
                    PendingGroup {
                        mutations,
                        cluster_id,
                        table,
                        sync,
                        deadline_ticks: ticks,
                    },
                );
                true
            }
        }
    }

    /// Called once per tick: decrements every pending group's deadline and
    /// returns the groups whose window has elapsed, ready to submit as one
    /// `batch_update`.
    pub fn tick(&self) -> Vec<UpdateBatch> {
        let mut pending = self.pending.lock().expect("group commit mutex poisoned");
        let mut ready = Vec::new();
        let mut still_pending = HashMap::new();

        for (key, mut group) in pending.drain() {
            if group.deadline_ticks <= 1 {
                ready.push(UpdateBatch {
                    table: group.table,
                    cluster_id: group.cluster_id,
                    mutations: group.mutations,
                    sync: group.sync,
                    ignore_unknown_cfs: true,
                });
            } else {
                group.deadline_ticks -= 1;
                still_pending.insert(key, group);
            }
        }
        *pending = still_pending;
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessgroup::{AccessGroup, AccessGroupPolicy};
    use crate::compression::CompressionType;
    use crate::range::RangeSpec;
    use test_log::test;

    fn test_range(dir: &std::path::Path, end_row: &[u8]) -> Arc<Range> {
        let ag = AccessGroup::new("default", dir, AccessGroupPolicy::default(), 1, 0);
        Arc::new(Range::new(
            TableIdentifier::new("users", 0),
            RangeSpec::new(None, end_row.to_vec()),
            vec![ag],
            vec![0],
        ))
    }

    #[test]
    fn monotonic_clock_never_goes_backward() {
        let clock = MonotonicClock::new();
        let mut last = 0;
        for _ in 0..100 {
            let now = clock.next();
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn revision_counter_is_strictly_increasing() {
        let counter = RevisionCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert!(b > a);
    }

    #[test]
    fn range_directory_locates_by_row() {
        let dir = tempfile::tempdir().unwrap();
        let directory = RangeDirectory::new();
        directory.install("users", test_range(dir.path(), &[0xFF, 0xFF]));
        assert!(directory.locate("users", b"anything").is_some());
        assert!(directory.locate("missing", b"anything").is_none());
    }

    #[test]
    fn group_commit_coalesces_then_flushes_after_ticks() {
        let gc = GroupCommit::new(Duration::from_millis(10));
        let table = TableIdentifier::new("users", 0);
        let mutation = Mutation {
            row: b"a".to_vec(),
            column_family_id: 0,
            qualifier: b"q".to_vec(),
            timestamp: AUTO_ASSIGN,
            revision: AUTO_ASSIGN,
            flag: CellFlag::Insert,
            value: b"v".to_vec(),
        };

        let started = gc.add(1, table.clone(), vec![mutation.clone()], false, Duration::from_millis(25));
        assert!(started);
        let started_again = gc.add(1, table.clone(), vec![mutation], false, Duration::from_millis(25));
        assert!(!started_again);

        assert!(gc.tick().is_empty());
        assert!(gc.tick().is_empty());
        let ready = gc.tick();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].mutations.len(), 2);
    }

    #[test]
    fn pipeline_submit_applies_cells_and_returns_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let commit_dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(RangeDirectory::new());
        let range = test_range(dir.path(), &[0xFF, 0xFF]);
        directory.install("users", Arc::clone(&range));

        let commit_log = Arc::new(CommitLog::create(commit_dir.path(), 1 << 20, CompressionType::None).unwrap());
        let pipeline = UpdatePipeline::start(Arc::clone(&directory), commit_log, 1 << 20);

        let batch = UpdateBatch {
            table: TableIdentifier::new("users", 0),
            cluster_id: 1,
            mutations: vec![Mutation {
                row: b"row".to_vec(),
                column_family_id: 0,
                qualifier: b"cq".to_vec(),
                timestamp: AUTO_ASSIGN,
                revision: AUTO_ASSIGN,
                flag: CellFlag::Insert,
                value: b"v".to_vec(),
            }],
            sync: false,
            ignore_unknown_cfs: false,
        };

        let outcome = pipeline.submit(batch).unwrap();
        assert!(outcome.rejected.is_empty());
        assert_eq!(range.counters.updates.load(Ordering::Relaxed), 1);

        pipeline.shutdown();
    }

    #[test]
    fn pipeline_rejects_mutation_with_no_matching_range() {
        let dir = tempfile::tempdir().unwrap();
        let commit_dir = tempfile::tempdir().unwrap();
        let directory = Arc::new(RangeDirectory::new());
        directory.install("users", test_range(dir.path(), &[0xFF, 0xFF]));
        // Remove it again so the row has nowhere to route.
        directory.remove("users", &[0xFF, 0xFF]);

        let commit_log = Arc::new(CommitLog::create(commit_dir.path(), 1 << 20, CompressionType::None).unwrap());
        let pipeline = UpdatePipeline::start(directory, commit_log, 1 << 20);

        let batch = UpdateBatch {
            table: TableIdentifier::new("users", 0),
            cluster_id: 1,
            mutations: vec![Mutation {
                row: b"row".to_vec(),
                column_family_id: 0,
                qualifier: b"cq".to_vec(),
                timestamp: 1,
                revision: 1,
                flag: CellFlag::Insert,
                value: b"v".to_vec(),
            }],
            sync: false,
            ignore_unknown_cfs: false,
        };

        let outcome = pipeline.submit(batch).unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        pipeline.shutdown();
    }
}
