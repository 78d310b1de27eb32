// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Recovery coordinator: replays a dead range server's commit-log
//! fragments and reassigns its ranges to new owners (spec §4.13,
//! component C13).
//!
//! Grounded on the teacher's `version/recovery.rs` phase-machine shape,
//! generalized from single-version recovery to the plan/phantom-map model
//! of spec §4.13.

use crate::commitlog::{replay_fragment, BlockKind};
use crate::range::{RangeSpec, RangeState};
use crate::schema::TableIdentifier;
use crate::value::Cell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// A small macro-free bitflags stand-in, kept local since this is the only
/// flag set in the crate that needs OR/AND bit tests rather than a real enum.
macro_rules! bitflags_like {
    ($(#[$meta:meta])* pub struct $name:ident: $ty:ty { $(const $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $flag: $name = $name($value);)*
        }
    };
}

/// The kind of range a recovery plan covers (spec §4.13).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RangeType {
    Root,
    Metadata,
    System,
    User,
}

/// Identifies one commit-log fragment of the dead server.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FragmentId {
    pub log_dir: PathBuf,
    pub num: u64,
}

/// A range, qualified by table and boundary, independent of which server
/// currently owns it (spec §4.13 "qualified_range").
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct QualifiedRange {
    pub table: TableIdentifier,
    pub spec: RangeSpec,
}

/// A master-constructed recovery plan for one range type (spec §4.13).
#[derive(Clone, Debug)]
pub struct RecoveryPlan {
    pub range_type: RangeType,
    /// `fragment_id -> replayer_server`.
    pub replay_plan: HashMap<FragmentId, String>,
    /// `qualified_range -> (receiver_server, range_state)`.
    pub receiver_plan: HashMap<QualifiedRange, (String, RangeState)>,
    pub plan_generation: u64,
}

bitflags_like! {
    /// Monotonic per-range progress bits (spec §4.13 "Phases").
    pub struct PhantomBits: u8 {
        const LOADED = 0b0001;
        const REPLAYED = 0b0010;
        const PREPARED = 0b0100;
        const COMMITTED = 0b1000;
    }
}

/// Per-receiver progress tracker, reset whenever the plan generation
/// changes (spec §4.13 "Idempotence").
pub struct PhantomRangeMap {
    generation: Mutex<u64>,
    bits: Mutex<HashMap<QualifiedRange, u8>>,
}

impl Default for PhantomRangeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PhantomRangeMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            bits: Mutex::new(HashMap::new()),
        }
    }

    /// Adopts `plan_generation`; if it differs from the currently tracked
    /// generation, every range's bits are cleared (spec: "on plan change
    /// the receivers reset their phantom maps"). Returns `true` if a reset
    /// occurred.
    pub fn begin_generation(&self, plan_generation: u64) -> bool {
        let mut generation = self.generation.lock().expect("phantom map generation mutex poisoned");
        if *generation == plan_generation {
            return false;
        }
        *generation = plan_generation;
        self.bits.lock().expect("phantom map bits mutex poisoned").clear();
        log::info!("recovery plan generation changed to {plan_generation}, phantom map reset");
        true
    }

    fn set_bit(&self, range: &QualifiedRange, bit: PhantomBits) {
        let mut bits = self.bits.lock().expect("phantom map bits mutex poisoned");
        let entry = bits.entry(range.clone()).or_insert(0);
        *entry |= bit.0;
    }

    pub fn mark_loaded(&self, range: &QualifiedRange) {
        self.set_bit(range, PhantomBits::LOADED);
    }

    pub fn mark_replayed(&self, range: &QualifiedRange) {
        self.set_bit(range, PhantomBits::REPLAYED);
    }

    pub fn mark_prepared(&self, range: &QualifiedRange) {
        self.set_bit(range, PhantomBits::PREPARED);
    }

    pub fn mark_committed(&self, range: &QualifiedRange) {
        self.set_bit(range, PhantomBits::COMMITTED);
    }

    #[must_use]
    pub fn bits_for(&self, range: &QualifiedRange) -> u8 {
        *self.bits.lock().expect("phantom map bits mutex poisoned").get(range).unwrap_or(&0)
    }

    /// Only after `COMMITTED` does the receiver make the range live
    /// (spec §4.13 "Phases").
    #[must_use]
    pub fn is_live(&self, range: &QualifiedRange) -> bool {
        self.bits_for(range) & PhantomBits::COMMITTED.0 != 0
    }
}

/// Size-bounded buffer routing replayed cells to their owning receiver,
/// flushing at a per-range or aggregate byte limit (spec §4.13 "Replayer
/// duties").
pub struct ReplayBuffer {
    per_range_limit: u64,
    aggregate_limit: u64,
    pending: HashMap<QualifiedRange, Vec<Cell>>,
    pending_bytes: HashMap<QualifiedRange, u64>,
    total_bytes: u64,
}

impl ReplayBuffer {
    #[must_use]
    pub fn new(per_range_limit: u64, aggregate_limit: u64) -> Self {
        Self {
            per_range_limit,
            aggregate_limit,
            pending: HashMap::new(),
            pending_bytes: HashMap::new(),
            total_bytes: 0,
        }
    }

    /// Buffers `cell` for `range`; returns the ranges that must now be
    /// flushed because a per-range or aggregate limit was reached.
    pub fn push(&mut self, range: QualifiedRange, cell: Cell) -> Vec<QualifiedRange> {
        let size = cell.size() as u64;
        self.total_bytes += size;
        let bytes = self.pending_bytes.entry(range.clone()).or_insert(0);
        *bytes += size;
        let over_range_limit = *bytes >= self.per_range_limit;
        self.pending.entry(range.clone()).or_default().push(cell);

        let mut ready = Vec::new();
        if over_range_limit {
            ready.push(range);
        }
        if self.total_bytes >= self.aggregate_limit {
            ready.extend(self.pending.keys().cloned().filter(|r| !ready.contains(r)));
        }
        ready
    }

    /// Drains and returns the buffered cells for `range`.
    pub fn take(&mut self, range: &QualifiedRange) -> Vec<Cell> {
        let cells = self.pending.remove(range).unwrap_or_default();
        if let Some(bytes) = self.pending_bytes.remove(range) {
            self.total_bytes = self.total_bytes.saturating_sub(bytes);
        }
        cells
    }

    /// Drains every buffered range, for a final flush at end of replay.
    pub fn take_all(&mut self) -> Vec<(QualifiedRange, Vec<Cell>)> {
        let ranges: Vec<_> = self.pending.keys().cloned().collect();
        ranges.into_iter().map(|r| { let cells = self.take(&r); (r, cells) }).collect()
    }
}

/// Reads every assigned fragment, decodes its `COMMITDATA` blocks, and
/// routes each cell via `locate` + `buffer` (spec §4.13 "Replayer
/// duties"). Returns the ranges whose buffer crossed a flush threshold
/// during this fragment.
pub fn replay_one_fragment(
    fragment: &FragmentId,
    locate: impl Fn(&[u8]) -> Option<QualifiedRange>,
    buffer: &mut ReplayBuffer,
) -> crate::Result<Vec<QualifiedRange>> {
    let path = fragment.log_dir.join(fragment.num.to_string());
    let blocks = replay_fragment(&path)?;
    let mut ready = Vec::new();

    for (kind, _revision, _cluster_id, payload) in blocks {
        if kind != BlockKind::CommitData {
            continue;
        }
        let mut cursor = &payload[..];
        while !cursor.is_empty() {
            let cell = crate::coding::Decode::decode_from(&mut cursor)?;
            let cell: Cell = cell;
            if let Some(range) = locate(&cell.key.row) {
                ready.extend(buffer.push(range, cell));
            }
        }
    }
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{CellFlag, CellKey};
    use crate::range::END_ROW_SENTINEL;
    use test_log::test;

    fn range() -> QualifiedRange {
        QualifiedRange {
            table: TableIdentifier::new("users", 0),
            spec: RangeSpec::new(None, END_ROW_SENTINEL.to_vec()),
        }
    }

    #[test]
    fn phantom_map_bits_accumulate_monotonically() {
        let map = PhantomRangeMap::new();
        let r = range();
        map.begin_generation(1);
        map.mark_loaded(&r);
        map.mark_replayed(&r);
        assert!(!map.is_live(&r));
        map.mark_prepared(&r);
        map.mark_committed(&r);
        assert!(map.is_live(&r));
    }

    #[test]
    fn plan_generation_change_resets_bits() {
        let map = PhantomRangeMap::new();
        let r = range();
        map.begin_generation(1);
        map.mark_committed(&r);
        assert!(map.is_live(&r));

        let reset = map.begin_generation(2);
        assert!(reset);
        assert!(!map.is_live(&r));
    }

    #[test]
    fn same_generation_is_not_a_reset() {
        let map = PhantomRangeMap::new();
        map.begin_generation(5);
        assert!(!map.begin_generation(5));
    }

    #[test]
    fn replay_buffer_flushes_at_per_range_limit() {
        let mut buffer = ReplayBuffer::new(100, 1 << 20);
        let r = range();
        let cell = Cell::new(CellKey::new("row", 0, "cq", 1, 1, CellFlag::Insert), vec![0u8; 200]);
        let ready = buffer.push(r.clone(), cell);
        assert_eq!(ready, vec![r.clone()]);
        assert_eq!(buffer.take(&r).len(), 1);
    }

    #[test]
    fn replay_buffer_flushes_at_aggregate_limit() {
        let mut buffer = ReplayBuffer::new(1 << 30, 50);
        let a = range();
        let mut b = range();
        b.table = TableIdentifier::new("other", 0);
        let cell = Cell::new(CellKey::new("row", 0, "cq", 1, 1, CellFlag::Insert), vec![0u8; 60]);
        let ready = buffer.push(a.clone(), cell);
        assert!(ready.contains(&a));
    }
}
