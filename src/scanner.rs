// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Merge scanner: a heap-merging iterator over child scanners honoring
//! versioning, TTL, delete and predicate semantics (spec §4.7, §6.4,
//! component C7).
//!
//! Grounded on the teacher's `merge.rs` (`Merger`): a `BinaryHeap` of
//! `(child_index, item)` pairs ordered by key, repeatedly popping the
//! smallest and pulling the next item from that child. This crate dropped
//! the teacher's `interval-heap` dependency (double-ended iteration is not
//! needed here), so the heap is `std::collections::BinaryHeap` with an
//! inverted `Ord` to get min-heap pop order.

use crate::key::CellFlag;
use crate::value::Cell;
use regex::Regex;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// `op` bitmask for column predicates (spec §6.4).
pub mod predicate_op {
    pub const EXACT: u16 = 0x001;
    pub const PREFIX: u16 = 0x002;
    pub const REGEX: u16 = 0x004;
    pub const QUALIFIER_EXACT: u16 = 0x100;
    pub const QUALIFIER_PREFIX: u16 = 0x200;
    pub const QUALIFIER_REGEX: u16 = 0x400;
}

/// `(cf, cq, op, value?)`: a per-row-key column/value predicate.
#[derive(Clone, Debug)]
pub struct ColumnPredicate {
    pub column_family_id: u8,
    pub qualifier: Vec<u8>,
    pub op: u16,
    pub value: Option<Vec<u8>>,
}

impl ColumnPredicate {
    fn qualifier_matches(&self, qualifier: &[u8]) -> bool {
        if self.op & predicate_op::QUALIFIER_EXACT != 0 {
            return qualifier == self.qualifier.as_slice();
        }
        if self.op & predicate_op::QUALIFIER_PREFIX != 0 {
            return qualifier.starts_with(&self.qualifier);
        }
        if self.op & predicate_op::QUALIFIER_REGEX != 0 {
            let pattern = String::from_utf8_lossy(&self.qualifier);
            return Regex::new(&pattern)
                .map(|re| re.is_match(&String::from_utf8_lossy(qualifier)))
                .unwrap_or(false);
        }
        qualifier == self.qualifier.as_slice()
    }

    /// A predicate with no value-op bit is an "exists" check: it matches
    /// any value once the qualifier matches (spec §6.4).
    fn value_matches(&self, value: &[u8]) -> bool {
        let Some(ref expected) = self.value else {
            return true;
        };
        if self.op & predicate_op::EXACT != 0 {
            return value == expected.as_slice();
        }
        if self.op & predicate_op::PREFIX != 0 {
            return value.starts_with(expected);
        }
        if self.op & predicate_op::REGEX != 0 {
            let pattern = String::from_utf8_lossy(expected);
            return Regex::new(&pattern)
                .map(|re| re.is_match(&String::from_utf8_lossy(value)))
                .unwrap_or(false);
        }
        true
    }

    fn matches(&self, cell: &Cell) -> bool {
        if cell.key.column_family_id != self.column_family_id {
            return false;
        }
        self.qualifier_matches(&cell.key.column_qualifier) && self.value_matches(&cell.value)
    }
}

/// A half-open or closed row interval, per spec §6.4
/// `(start, start_inclusive, end, end_inclusive)`.
#[derive(Clone, Debug)]
pub struct RowInterval {
    pub start: Vec<u8>,
    pub start_inclusive: bool,
    pub end: Vec<u8>,
    pub end_inclusive: bool,
}

impl RowInterval {
    fn contains(&self, row: &[u8]) -> bool {
        let above_start = if self.start_inclusive {
            row >= self.start.as_slice()
        } else {
            row > self.start.as_slice()
        };
        let below_end = if self.end_inclusive {
            row <= self.end.as_slice()
        } else {
            row < self.end.as_slice()
        };
        above_start && below_end
    }
}

/// A scan specification (spec §6.4).
#[derive(Clone, Debug, Default)]
pub struct ScanSpec {
    pub row_limit: Option<u32>,
    pub cell_limit: Option<u32>,
    pub cell_limit_per_family: Option<u32>,
    pub row_offset: u32,
    pub cell_offset: u32,
    pub max_versions: Option<u32>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub return_deletes: bool,
    pub keys_only: bool,
    pub scan_and_filter_rows: bool,
    pub do_not_cache: bool,
    pub row_regex: Option<String>,
    pub value_regex: Option<String>,
    pub row_intervals: Vec<RowInterval>,
    pub columns: Vec<u8>,
    pub column_predicates: Vec<ColumnPredicate>,
    pub now_nanos: i64,
    pub ttl_nanos: HashMap<u8, i64>,
}

struct HeapItem {
    child: usize,
    cell: Cell,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cell.key == other.cell.key
    }
}
impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the smallest key.
        other.cell.key.cmp(&self.cell.key)
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Running I/O and emission state tracked across the merge (spec §4.7
/// "I/O accounting" plus row/cell limit bookkeeping).
#[derive(Default, Debug)]
pub struct ScanCounters {
    pub bytes_scanned: u64,
    pub bytes_returned: u64,
    pub cells_scanned: u64,
    pub cells_returned: u64,
}

/// Heap-merges a set of already key-sorted child iterators, applying the
/// predicate pipeline in the order spec §4.7 lists it.
pub struct MergeScanner {
    children: Vec<Box<dyn Iterator<Item = Cell> + Send>>,
    heap: BinaryHeap<HeapItem>,
    spec: ScanSpec,
    initialized: bool,
    pub counters: ScanCounters,

    rows_seen: u32,
    rows_emitted: u32,
    cells_emitted_total: u32,
    cells_emitted_in_family: HashMap<u8, u32>,
    version_counts: HashMap<(Vec<u8>, u8, Vec<u8>), u32>,
    row_delete_deadline: HashMap<Vec<u8>, i64>,
    cf_delete_deadline: HashMap<(Vec<u8>, u8), i64>,
    cell_delete_deadline: HashMap<(Vec<u8>, u8, Vec<u8>), i64>,
    cell_version_deleted: HashSet<(Vec<u8>, u8, Vec<u8>, i64)>,
    current_row: Option<Vec<u8>>,
    cells_skipped_in_row_offset: u32,
}

impl MergeScanner {
    #[must_use]
    pub fn new(children: Vec<Box<dyn Iterator<Item = Cell> + Send>>, spec: ScanSpec) -> Self {
        let n = children.len();
        Self {
            children,
            heap: BinaryHeap::with_capacity(n),
            spec,
            initialized: false,
            counters: ScanCounters::default(),
            rows_seen: 0,
            rows_emitted: 0,
            cells_emitted_total: 0,
            cells_emitted_in_family: HashMap::new(),
            version_counts: HashMap::new(),
            row_delete_deadline: HashMap::new(),
            cf_delete_deadline: HashMap::new(),
            cell_delete_deadline: HashMap::new(),
            cell_version_deleted: HashSet::new(),
            current_row: None,
            cells_skipped_in_row_offset: 0,
        }
    }

    fn do_initialize(&mut self) {
        for idx in 0..self.children.len() {
            if let Some(cell) = self.children[idx].next() {
                self.heap.push(HeapItem { child: idx, cell });
            }
        }
        self.initialized = true;
    }

    fn pop_next_raw(&mut self) -> Option<Cell> {
        if !self.initialized {
            self.do_initialize();
        }
        let top = self.heap.pop()?;
        if let Some(next) = self.children[top.child].next() {
            self.heap.push(HeapItem {
                child: top.child,
                cell: next,
            });
        }
        Some(top.cell)
    }

    fn column_set_allows(&self, cell: &Cell) -> bool {
        self.spec.columns.is_empty() || self.spec.columns.contains(&cell.key.column_family_id)
    }

    fn time_interval_allows(&self, cell: &Cell) -> bool {
        if let Some(start) = self.spec.start_time {
            if cell.key.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.spec.end_time {
            if cell.key.timestamp >= end {
                return false;
            }
        }
        true
    }

    fn row_interval_allows(&self, row: &[u8]) -> bool {
        self.spec.row_intervals.is_empty() || self.spec.row_intervals.iter().any(|iv| iv.contains(row))
    }

    fn apply_delete(&mut self, cell: &Cell) {
        let row = cell.key.row.to_vec();
        let ts = cell.key.timestamp;
        match cell.key.flag {
            CellFlag::DeleteRow => {
                let entry = self.row_delete_deadline.entry(row).or_insert(i64::MIN);
                *entry = (*entry).max(ts);
            }
            CellFlag::DeleteColumnFamily => {
                let key = (row, cell.key.column_family_id);
                let entry = self.cf_delete_deadline.entry(key).or_insert(i64::MIN);
                *entry = (*entry).max(ts);
            }
            CellFlag::DeleteCell => {
                let key = (row, cell.key.column_family_id, cell.key.column_qualifier.to_vec());
                let entry = self.cell_delete_deadline.entry(key).or_insert(i64::MIN);
                *entry = (*entry).max(ts);
            }
            CellFlag::DeleteCellVersion => {
                let key = (row, cell.key.column_family_id, cell.key.column_qualifier.to_vec(), ts);
                self.cell_version_deleted.insert(key);
            }
            CellFlag::Insert => {}
        }
    }

    fn is_deleted(&self, cell: &Cell) -> bool {
        let row = cell.key.row.to_vec();
        if let Some(&deadline) = self.row_delete_deadline.get(&row) {
            if cell.key.timestamp <= deadline {
                return true;
            }
        }
        let cf_key = (row.clone(), cell.key.column_family_id);
        if let Some(&deadline) = self.cf_delete_deadline.get(&cf_key) {
            if cell.key.timestamp <= deadline {
                return true;
            }
        }
        let cell_key = (row.clone(), cell.key.column_family_id, cell.key.column_qualifier.to_vec());
        if let Some(&deadline) = self.cell_delete_deadline.get(&cell_key) {
            if cell.key.timestamp <= deadline {
                return true;
            }
        }
        let version_key = (row, cell.key.column_family_id, cell.key.column_qualifier.to_vec(), cell.key.timestamp);
        if self.cell_version_deleted.contains(&version_key) {
            return true;
        }
        false
    }

    fn is_ttl_expired(&self, cell: &Cell) -> bool {
        let Some(&ttl) = self.spec.ttl_nanos.get(&cell.key.column_family_id) else {
            return false;
        };
        self.spec.now_nanos - cell.key.timestamp > ttl
    }

    fn predicates_allow(&self, cell: &Cell) -> bool {
        if self.spec.column_predicates.is_empty() {
            return true;
        }
        self.spec
            .column_predicates
            .iter()
            .filter(|p| p.column_family_id == cell.key.column_family_id)
            .any(|p| p.matches(cell))
    }

    fn value_regex_allows(&self, cell: &Cell) -> bool {
        let Some(ref pattern) = self.spec.value_regex else {
            return true;
        };
        Regex::new(pattern)
            .map(|re| re.is_match(&String::from_utf8_lossy(&cell.value)))
            .unwrap_or(false)
    }

    fn row_regex_allows(&self, row: &[u8]) -> bool {
        let Some(ref pattern) = self.spec.row_regex else {
            return true;
        };
        Regex::new(pattern)
            .map(|re| re.is_match(&String::from_utf8_lossy(row)))
            .unwrap_or(false)
    }

    fn limits_exhausted(&self) -> bool {
        if let Some(limit) = self.spec.row_limit {
            if self.rows_emitted >= limit {
                return true;
            }
        }
        if let Some(limit) = self.spec.cell_limit {
            if self.cells_emitted_total >= limit {
                return true;
            }
        }
        false
    }
}

impl Iterator for MergeScanner {
    type Item = Cell;

    /// `do_forward()`: pops the current top, advances row/family/cell
    /// bookkeeping, and applies every predicate in spec order until a
    /// cell survives or the children are exhausted.
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.limits_exhausted() {
                return None;
            }

            let cell = self.pop_next_raw()?;
            self.counters.cells_scanned += 1;
            self.counters.bytes_scanned += cell.size() as u64;

            let row = cell.key.row.to_vec();
            if self.current_row.as_deref() != Some(row.as_slice()) {
                self.current_row = Some(row.clone());
                self.rows_seen += 1;
                self.cells_skipped_in_row_offset = 0;
                if self.rows_seen > self.spec.row_offset {
                    self.rows_emitted += 1;
                }
            }
            if self.rows_seen <= self.spec.row_offset {
                continue;
            }

            if cell.key.flag.is_delete() {
                self.apply_delete(&cell);
                if !self.spec.return_deletes {
                    continue;
                }
            }

            if !self.column_set_allows(&cell) {
                continue;
            }
            if !self.time_interval_allows(&cell) {
                continue;
            }
            if !self.row_interval_allows(&row) {
                continue;
            }

            if !cell.key.flag.is_delete() {
                if let Some(max_versions) = self.spec.max_versions {
                    let key = (row.clone(), cell.key.column_family_id, cell.key.column_qualifier.to_vec());
                    let count = self.version_counts.entry(key).or_insert(0);
                    if *count >= max_versions {
                        continue;
                    }
                    *count += 1;
                }

                if !self.spec.return_deletes && self.is_deleted(&cell) {
                    continue;
                }
                if self.is_ttl_expired(&cell) {
                    continue;
                }
            }

            if !self.row_regex_allows(&row) {
                continue;
            }
            if !self.value_regex_allows(&cell) {
                continue;
            }
            if !self.predicates_allow(&cell) {
                continue;
            }

            if self.cells_skipped_in_row_offset < self.spec.cell_offset {
                self.cells_skipped_in_row_offset += 1;
                continue;
            }

            if let Some(per_family) = self.spec.cell_limit_per_family {
                let count = self.cells_emitted_in_family.entry(cell.key.column_family_id).or_insert(0);
                if *count >= per_family {
                    continue;
                }
                *count += 1;
            }

            self.cells_emitted_total += 1;
            self.counters.cells_returned += 1;
            self.counters.bytes_returned += cell.size() as u64;

            return Some(cell);
        }
    }
}
