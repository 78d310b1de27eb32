// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Range: a horizontal partition of a table (spec §3, §4.6, component C6).

use crate::accessgroup::AccessGroup;
use crate::barrier::Barrier;
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::Error;
use crate::key::CellFlag;
use crate::schema::TableIdentifier;
use crate::value::Cell;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// The END-ROW sentinel marking the final range of a table (spec §3).
pub const END_ROW_SENTINEL: [u8; 2] = [0xFF, 0xFF];

/// `(start_row, end_row)`: start is exclusive, end is inclusive.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RangeSpec {
    pub start_row: Option<Vec<u8>>,
    pub end_row: Vec<u8>,
}

impl RangeSpec {
    #[must_use]
    pub fn new(start_row: Option<Vec<u8>>, end_row: Vec<u8>) -> Self {
        Self { start_row, end_row }
    }

    #[must_use]
    pub fn is_final(&self) -> bool {
        self.end_row == END_ROW_SENTINEL
    }

    #[must_use]
    pub fn contains_row(&self, row: &[u8]) -> bool {
        let above_start = match &self.start_row {
            Some(start) => row > start.as_slice(),
            None => true,
        };
        above_start && row <= self.end_row.as_slice()
    }
}

impl Encode for RangeSpec {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match &self.start_row {
            Some(row) => {
                writer.write_u8(1)?;
                writer.write_u16::<BigEndian>(row.len() as u16)?;
                writer.write_all(row)?;
            }
            None => writer.write_u8(0)?,
        }
        writer.write_u16::<BigEndian>(self.end_row.len() as u16)?;
        writer.write_all(&self.end_row)?;
        Ok(())
    }
}

impl Decode for RangeSpec {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let start_row = match reader.read_u8()? {
            0 => None,
            _ => {
                let len = reader.read_u16::<BigEndian>()?;
                let mut bytes = vec![0u8; len.into()];
                reader.read_exact(&mut bytes)?;
                Some(bytes)
            }
        };
        let len = reader.read_u16::<BigEndian>()?;
        let mut end_row = vec![0u8; len.into()];
        reader.read_exact(&mut end_row)?;
        Ok(Self { start_row, end_row })
    }
}

/// The persisted structural state of a range (spec §3 "Range state").
/// Accompanying fields (`timestamp`, `soft_limit`, `transfer_log`, ...)
/// live alongside this in [`crate::rsml::RangeStateMeta`] rather than as
/// enum payload, since they are not all meaningful for every variant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RangeState {
    Steady,
    SplitLogInstalled,
    SplitShrunk,
    RelinquishLogInstalled,
}

impl Encode for RangeState {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let tag: u8 = match self {
            Self::Steady => 0,
            Self::SplitLogInstalled => 1,
            Self::SplitShrunk => 2,
            Self::RelinquishLogInstalled => 3,
        };
        writer.write_u8(tag)?;
        Ok(())
    }
}

impl Decode for RangeState {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        match reader.read_u8()? {
            0 => Ok(Self::Steady),
            1 => Ok(Self::SplitLogInstalled),
            2 => Ok(Self::SplitShrunk),
            3 => Ok(Self::RelinquishLogInstalled),
            tag => Err(DecodeError::InvalidTag(("RangeState", tag))),
        }
    }
}

/// Per-range operation counters (spec §4.6).
#[derive(Default, Debug)]
pub struct RangeCounters {
    pub scans: AtomicU64,
    pub updates: AtomicU64,
    pub cells_scanned: AtomicU64,
    pub cells_returned: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub bytes_returned: AtomicU64,
}

/// A horizontal partition of a table: access groups, split/relinquish
/// state machine, and a meta-log entity.
pub struct Range {
    pub table: TableIdentifier,
    spec: Mutex<RangeSpec>,
    state: Mutex<RangeState>,
    access_groups: Vec<AccessGroup>,
    cf_to_ag: Vec<usize>,
    pub counters: RangeCounters,
    pub update_barrier: Barrier,
    pub scan_barrier: Barrier,
    maintenance_busy: AtomicBool,
    cancelled: AtomicBool,
    revision: AtomicU64,
}

impl Range {
    #[must_use]
    pub fn new(
        table: TableIdentifier,
        spec: RangeSpec,
        access_groups: Vec<AccessGroup>,
        cf_to_ag: Vec<usize>,
    ) -> Self {
        Self {
            table,
            spec: Mutex::new(spec),
            state: Mutex::new(RangeState::Steady),
            access_groups,
            cf_to_ag,
            counters: RangeCounters::default(),
            update_barrier: Barrier::new(),
            scan_barrier: Barrier::new(),
            maintenance_busy: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            revision: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn spec(&self) -> RangeSpec {
        self.spec.lock().expect("range spec mutex poisoned").clone()
    }

    #[must_use]
    pub fn state(&self) -> RangeState {
        *self.state.lock().expect("range state mutex poisoned")
    }

    #[must_use]
    pub fn access_groups(&self) -> &[AccessGroup] {
        &self.access_groups
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Applies one cell: `DELETE_ROW` fans out to every access group,
    /// everything else routes to the access group owning its column
    /// family (spec §4.6 "Add/scan").
    pub fn add(&self, cell: Cell) -> crate::Result<()> {
        let _guard = self.update_barrier.enter();

        if cell.key.flag == CellFlag::DeleteRow {
            for ag in &self.access_groups {
                ag.add(cell.clone());
            }
        } else {
            let ag_index = *self
                .cf_to_ag
                .get(cell.key.column_family_id as usize)
                .ok_or_else(|| Error::BadColumnFamily(format!("cf id {}", cell.key.column_family_id)))?;
            let ag = self
                .access_groups
                .get(ag_index)
                .ok_or_else(|| Error::BadColumnFamily(format!("cf id {}", cell.key.column_family_id)))?;
            ag.add(cell.clone());
        }

        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        self.revision.fetch_max(cell.key.revision as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Attempts to enter the maintenance guard (spec §4.6, §6.6: "at most
    /// one of {compact, split, relinquish, purge_memory} runs at a time").
    /// Returns `Err(Error::RangeBusy)` if another structural operation is
    /// already running.
    pub fn try_enter_maintenance(&self) -> crate::Result<MaintenanceGuard<'_>> {
        if self
            .maintenance_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(MaintenanceGuard { range: self })
        } else {
            Err(Error::RangeBusy(format!("{:?}", self.spec())))
        }
    }

    /// Transitions `STEADY -> SPLIT_LOG_INSTALLED` after installing a
    /// transfer log for the new range's data (spec §4.6 state machine).
    /// Callers must persist this transition via the owning RSML before
    /// and after, per spec invariant.
    pub fn begin_split(&self) -> crate::Result<()> {
        let mut state = self.state.lock().expect("range state mutex poisoned");
        if *state != RangeState::Steady {
            return Err(Error::RangeBusy("split requires STEADY".into()));
        }
        *state = RangeState::SplitLogInstalled;
        Ok(())
    }

    /// `SPLIT_LOG_INSTALLED -> SPLIT_SHRUNK` after the major compaction
    /// that shrinks this range to its new boundary.
    pub fn shrink_after_split(&self, new_spec: RangeSpec) -> crate::Result<()> {
        let mut state = self.state.lock().expect("range state mutex poisoned");
        if *state != RangeState::SplitLogInstalled {
            return Err(Error::RangeBusy("shrink requires SPLIT_LOG_INSTALLED".into()));
        }
        *self.spec.lock().expect("range spec mutex poisoned") = new_spec;
        *state = RangeState::SplitShrunk;
        Ok(())
    }

    /// `SPLIT_SHRUNK -> STEADY` once the master has acknowledged the split.
    pub fn complete_split(&self) -> crate::Result<()> {
        let mut state = self.state.lock().expect("range state mutex poisoned");
        if *state != RangeState::SplitShrunk {
            return Err(Error::RangeBusy("complete_split requires SPLIT_SHRUNK".into()));
        }
        *state = RangeState::Steady;
        Ok(())
    }

    /// `STEADY -> RELINQUISH_LOG_INSTALLED` after installing a transfer
    /// log transferring this range's data away.
    pub fn begin_relinquish(&self) -> crate::Result<()> {
        let mut state = self.state.lock().expect("range state mutex poisoned");
        if *state != RangeState::Steady {
            return Err(Error::RangeBusy("relinquish requires STEADY".into()));
        }
        *state = RangeState::RelinquishLogInstalled;
        Ok(())
    }

    /// Marks this range for cancellation; `drop_range` sets this so any
    /// in-progress structural task unwinds at its next `is_cancelled()`
    /// check (spec §5 "Cancellation and timeouts").
    pub fn cancel_maintenance(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// RAII handle for the per-range maintenance guard; clears the busy flag
/// on drop so `drop_range` or another scheduler tick can cancel cleanly.
pub struct MaintenanceGuard<'a> {
    range: &'a Range,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.range.maintenance_busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessgroup::AccessGroupPolicy;
    use crate::key::CellKey;
    use test_log::test;

    fn range_with_one_ag(dir: &std::path::Path) -> Range {
        let ag = AccessGroup::new("default", dir, AccessGroupPolicy::default(), 1, 0);
        Range::new(
            TableIdentifier::new("users", 0),
            RangeSpec::new(None, END_ROW_SENTINEL.to_vec()),
            vec![ag],
            vec![0],
        )
    }

    #[test]
    fn range_spec_contains_row_respects_exclusive_start() {
        let spec = RangeSpec::new(Some(b"b".to_vec()), b"m".to_vec());
        assert!(!spec.contains_row(b"b"));
        assert!(spec.contains_row(b"c"));
        assert!(spec.contains_row(b"m"));
        assert!(!spec.contains_row(b"n"));
    }

    #[test]
    fn add_routes_through_barrier_and_updates_counters() {
        let dir = tempfile::tempdir().unwrap();
        let range = range_with_one_ag(dir.path());
        let cell = Cell::new(CellKey::new("row", 0, "cq", 1, 1, CellFlag::Insert), "v");
        range.add(cell).unwrap();
        assert_eq!(range.counters.updates.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn split_state_machine_transitions_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let range = range_with_one_ag(dir.path());
        range.begin_split().unwrap();
        assert_eq!(range.state(), RangeState::SplitLogInstalled);

        range.shrink_after_split(RangeSpec::new(Some(b"m".to_vec()), END_ROW_SENTINEL.to_vec())).unwrap();
        assert_eq!(range.state(), RangeState::SplitShrunk);

        range.complete_split().unwrap();
        assert_eq!(range.state(), RangeState::Steady);
    }

    #[test]
    fn maintenance_guard_excludes_concurrent_structural_ops() {
        let dir = tempfile::tempdir().unwrap();
        let range = range_with_one_ag(dir.path());
        let guard = range.try_enter_maintenance().unwrap();
        assert!(range.try_enter_maintenance().is_err());
        drop(guard);
        assert!(range.try_enter_maintenance().is_ok());
    }
}
