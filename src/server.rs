// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Range-server request surface: the operations a client or the master
//! calls directly on a range server (spec §4.10, component C10).
//!
//! Grounded on the teacher's top-level `TransactionManager`-style facade
//! (one struct owning every subsystem, exposing a small request surface
//! that validates and delegates); scanner reference-counting follows the
//! same id-in-a-`HashMap` shape as the teacher's open-file-handle table.

use crate::accessgroup::AccessGroup;
use crate::commitlog::CommitLog;
use crate::compression::CompressionType;
use crate::config::Context;
use crate::error::{Error, ErrorCode};
use crate::pipeline::{RangeDirectory, UpdateBatch, UpdateOutcome, UpdatePipeline};
use crate::querycache::{QueryCache, QueryCacheEntry, QueryKey};
use crate::range::{Range, RangeSpec, RangeState};
use crate::rsml::{Entity, RangeEntity, RangeStateMeta, Rsml, TaskEntity};
use crate::scanner::{MergeScanner, ScanSpec};
use crate::schema::{Schema, TableIdentifier};
use crate::value::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Cells returned per `fetch_scanblock` call before the caller must ask
/// again (spec §4.10 "next threshold-sized chunk").
const SCAN_BLOCK_THRESHOLD: usize = 256;

/// `compact()`'s `flags` bitmask (spec §4.10 "selects minor/major/merging/move").
pub mod compact_flags {
    pub const MINOR: u32 = 0x1;
    pub const MAJOR: u32 = 0x2;
    pub const MERGING: u32 = 0x4;
    pub const MOVE: u32 = 0x8;
}

/// `{code, message}` returned by `status()` (spec §4.10).
#[derive(Clone, Debug)]
pub struct Status {
    pub code: ErrorCode,
    pub message: String,
}

struct ScannerEntry {
    scanner: Mutex<MergeScanner>,
    range: Arc<Range>,
    created_at_nanos: i64,
    last_touch_nanos: Mutex<i64>,
}

/// One range, staged by `load_range` but not yet visible to
/// [`RangeDirectory`] (spec §4.10 "Creates a range in PHANTOM; does not
/// serve yet").
struct PhantomRange {
    range: Arc<Range>,
    transfer_log: Option<String>,
    needs_compaction: bool,
}

/// A live range server: owns the update pipeline, the meta-log, the
/// query cache, and every currently-loaded range, and answers the
/// request-surface operations of spec §4.10.
pub struct RangeServer {
    ctx: Arc<Context>,
    directory: Arc<RangeDirectory>,
    pipeline: UpdatePipeline,
    commit_log: Arc<CommitLog>,
    rsml: Arc<Rsml>,
    query_cache: Arc<QueryCache>,
    phantom: Mutex<HashMap<(String, RangeSpec), PhantomRange>>,
    scanners: Mutex<HashMap<u64, ScannerEntry>>,
    next_scanner_id: AtomicU64,
    schemas: Mutex<HashMap<String, (Schema, PathBuf)>>,
}

impl RangeServer {
    /// Opens (or creates) the commit log and RSML under `data_dir`, and
    /// starts the update pipeline.
    pub fn start(ctx: Arc<Context>, data_dir: impl AsRef<Path>) -> crate::Result<Self> {
        let data_dir = data_dir.as_ref();
        let commit_log = Arc::new(CommitLog::create(
            data_dir.join("log"),
            ctx.commit_log_roll_limit,
            CompressionType::None,
        )?);
        let directory = Arc::new(RangeDirectory::new());
        let pipeline = UpdatePipeline::start(Arc::clone(&directory), Arc::clone(&commit_log), ctx.update_pipeline_high_water);
        let rsml = Arc::new(Rsml::open(data_dir.join("rsml"))?);
        let query_cache = Arc::new(QueryCache::new(ctx.query_cache_memory));

        Ok(Self {
            ctx,
            directory,
            pipeline,
            commit_log,
            rsml,
            query_cache,
            phantom: Mutex::new(HashMap::new()),
            scanners: Mutex::new(HashMap::new()),
            next_scanner_id: AtomicU64::new(1),
            schemas: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<RangeDirectory> {
        &self.directory
    }

    #[must_use]
    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.query_cache
    }

    fn build_range(table: &TableIdentifier, spec: &RangeSpec, schema: &Schema, dir: &Path) -> crate::Result<Range> {
        let mut cf_to_ag = vec![0usize; schema.max_column_family_id as usize + 1];
        let mut access_groups = Vec::with_capacity(schema.access_groups.len());
        for (ag_index, ag_spec) in schema.access_groups.iter().enumerate() {
            for &cf_id in &ag_spec.column_family_ids {
                if let Some(slot) = cf_to_ag.get_mut(cf_id as usize) {
                    *slot = ag_index;
                }
            }
            let policy = crate::accessgroup::AccessGroupPolicy {
                in_memory: ag_spec.in_memory,
                blocksize: if ag_spec.blocksize == 0 { crate::cellstore::DEFAULT_BLOCK_SIZE } else { ag_spec.blocksize },
                compressor: CompressionType::None,
                bloom_filter: crate::cellstore::bloom::BloomFilterMode::Row,
            };
            access_groups.push(AccessGroup::new(ag_spec.name.clone(), dir, policy, table.generation, table.generation));
        }
        Ok(Range::new(table.clone(), spec.clone(), access_groups, cf_to_ag))
    }

    /// `load_range(table, range, transfer_log?, state, needs_compaction)`:
    /// creates the range in PHANTOM, logging it to the RSML, but does not
    /// make it visible to scans/updates (spec §4.10).
    pub fn load_range(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        schema: &Schema,
        dir: &Path,
        transfer_log: Option<String>,
        state: RangeState,
        needs_compaction: bool,
    ) -> crate::Result<()> {
        let range = Arc::new(Self::build_range(table, spec, schema, dir)?);
        self.schemas
            .lock()
            .expect("schema table mutex poisoned")
            .insert(table.id.clone(), (schema.clone(), dir.to_path_buf()));
        self.rsml.record_state(&Entity::Range(RangeEntity {
            table: table.clone(),
            spec: spec.clone(),
            state,
            meta: RangeStateMeta {
                phantom: true,
                timestamp: crate::time::unix_nanos(),
                soft_limit: self.ctx.range_split_size,
                transfer_log: transfer_log.clone(),
                split_point: None,
                old_boundary_row: None,
                source: None,
            },
            load_acknowledged: false,
            needs_compaction,
            original_transfer_log: transfer_log.clone(),
        }))?;
        log::debug!("load_range: staged {}:{:?} as PHANTOM", table.id, spec.end_row);
        self.phantom
            .lock()
            .expect("phantom map mutex poisoned")
            .insert((table.id.clone(), spec.clone()), PhantomRange { range, transfer_log, needs_compaction });
        Ok(())
    }

    /// `acknowledge_load(ranges[])`: moves each staged PHANTOM range into
    /// the live directory as STEADY (spec §4.10). Returns one code per
    /// input range, in order.
    pub fn acknowledge_load(&self, ranges: &[(TableIdentifier, RangeSpec)]) -> Vec<ErrorCode> {
        let mut out = Vec::with_capacity(ranges.len());
        for (table, spec) in ranges {
            let staged = self.phantom.lock().expect("phantom map mutex poisoned").remove(&(table.id.clone(), spec.clone()));
            let Some(staged) = staged else {
                out.push(ErrorCode::RangeNotFound);
                continue;
            };
            let result = self.rsml.record_state(&Entity::Range(RangeEntity {
                table: table.clone(),
                spec: spec.clone(),
                state: RangeState::Steady,
                meta: RangeStateMeta {
                    phantom: false,
                    timestamp: crate::time::unix_nanos(),
                    soft_limit: self.ctx.range_split_size,
                    transfer_log: staged.transfer_log.clone(),
                    split_point: None,
                    old_boundary_row: None,
                    source: None,
                },
                load_acknowledged: true,
                needs_compaction: staged.needs_compaction,
                original_transfer_log: staged.transfer_log,
            }));
            match result {
                Ok(()) => {
                    self.directory.install(&table.id, staged.range);
                    log::info!("acknowledge_load: {}:{:?} is now STEADY", table.id, spec.end_row);
                    out.push(ErrorCode::Ok);
                }
                Err(err) => out.push(ErrorCode::from(&err)),
            }
        }
        out
    }

    /// `relinquish_range(table, range)`: master-initiated handover
    /// (spec §4.10).
    pub fn relinquish_range(&self, table: &TableIdentifier, spec: &RangeSpec) -> crate::Result<()> {
        let range = self
            .directory
            .locate_exact(&table.id, spec)
            .ok_or_else(|| Error::RangeNotFound(format!("{}:{:?}", table.id, spec.end_row)))?;
        range.begin_relinquish()?;
        self.rsml.record_state(&Entity::Range(RangeEntity {
            table: table.clone(),
            spec: spec.clone(),
            state: RangeState::RelinquishLogInstalled,
            meta: RangeStateMeta {
                phantom: false,
                timestamp: crate::time::unix_nanos(),
                ..Default::default()
            },
            load_acknowledged: true,
            needs_compaction: false,
            original_transfer_log: None,
        }))
    }

    /// `split(table, range, schema, dir)`: splits a range at an
    /// estimated median row into two disjoint ranges, each built fresh
    /// from `schema` (spec §4.6 "Split"). Returns the resulting
    /// `(low, high)` specs. Every cell the original range owns, cached or
    /// already written to a cell store, is re-read through the same
    /// `scan_children` path a normal scan uses and re-added to whichever
    /// half it falls in.
    pub fn split_range(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        schema: &Schema,
        dir: &Path,
    ) -> crate::Result<(RangeSpec, RangeSpec)> {
        let range = self
            .directory
            .locate_exact(&table.id, spec)
            .ok_or_else(|| Error::RangeNotFound(format!("{}:{:?}", table.id, spec.end_row)))?;

        let _maintenance_guard = range.try_enter_maintenance()?;
        range.begin_split()?;

        let split_row = range
            .access_groups()
            .iter()
            .filter_map(crate::accessgroup::AccessGroup::estimate_split_row)
            .max()
            .ok_or_else(|| Error::RangeBusy("split requires at least one cached row".into()))?;

        let low_spec = RangeSpec::new(spec.start_row.clone(), split_row.clone());
        let high_spec = RangeSpec::new(Some(split_row.clone()), spec.end_row.clone());

        let start_row = spec.start_row.clone().unwrap_or_default();
        let all_cells: Vec<Cell> = {
            let _scan_guard = range.scan_barrier.enter();
            Self::gather_scan_children(&range, &start_row, &spec.end_row)?.into_iter().flatten().collect()
        };

        // Each half needs its own directory: two `AccessGroup`s of the
        // same name each number their cell stores from zero, so sharing
        // `dir` between them would let one half's files clobber the
        // other's.
        let now = crate::time::unix_nanos();
        let low_dir = dir.join(format!("split-{now}-lo"));
        let high_dir = dir.join(format!("split-{now}-hi"));
        let low_range = Self::build_range(table, &low_spec, schema, &low_dir)?;
        let high_range = Self::build_range(table, &high_spec, schema, &high_dir)?;
        for cell in all_cells {
            if low_spec.contains_row(&cell.key.row) {
                low_range.add(cell)?;
            } else {
                high_range.add(cell)?;
            }
        }

        range.shrink_after_split(low_spec.clone())?;
        range.complete_split()?;

        self.directory.remove(&table.id, &spec.end_row);
        self.directory.install(&table.id, Arc::new(low_range));
        self.directory.install(&table.id, Arc::new(high_range));

        let low_entity = Entity::Range(RangeEntity {
            table: table.clone(),
            spec: low_spec.clone(),
            state: RangeState::Steady,
            meta: RangeStateMeta {
                phantom: false,
                timestamp: now,
                soft_limit: self.ctx.range_split_size,
                split_point: Some(split_row.clone()),
                old_boundary_row: Some(spec.end_row.clone()),
                ..Default::default()
            },
            load_acknowledged: true,
            needs_compaction: false,
            original_transfer_log: None,
        });
        let high_entity = Entity::Range(RangeEntity {
            table: table.clone(),
            spec: high_spec.clone(),
            state: RangeState::Steady,
            meta: RangeStateMeta {
                phantom: false,
                timestamp: now,
                soft_limit: self.ctx.range_split_size,
                split_point: Some(split_row.clone()),
                old_boundary_row: Some(spec.end_row.clone()),
                source: Some(format!("split of {}:{:?}", table.id, spec.end_row)),
                ..Default::default()
            },
            load_acknowledged: true,
            needs_compaction: false,
            original_transfer_log: None,
        });
        self.rsml.record_states(&[&low_entity, &high_entity])?;

        log::info!("split {}:{:?} at row {:?} into two ranges", table.id, spec.end_row, split_row);
        Ok((low_spec, high_spec))
    }

    /// `drop_range(table, range)`: removes the range from the working
    /// set and cancels any in-flight maintenance on it; actual file
    /// removal is left to a background task (spec §4.10).
    pub fn drop_range(&self, table: &TableIdentifier, spec: &RangeSpec) -> crate::Result<()> {
        if let Some(range) = self.directory.locate_exact(&table.id, spec) {
            range.cancel_maintenance();
        }
        self.phantom.lock().expect("phantom map mutex poisoned").remove(&(table.id.clone(), spec.clone()));
        self.directory.remove(&table.id, &spec.end_row);
        log::info!("drop_range: removed {}:{:?} from the working set", table.id, spec.end_row);
        self.rsml.record_removal(&Entity::RemoveLogTask(TaskEntity {
            description: format!("remove files for {}:{:?}", table.id, spec.end_row),
        }))
    }

    /// `update(table, count, buffer, flags)`: enqueues mutations into the
    /// update pipeline (spec §4.10). `batch` already carries table,
    /// cluster id, and the decoded mutations.
    pub fn update(&self, batch: UpdateBatch) -> crate::Result<UpdateOutcome> {
        self.pipeline.submit(batch)
    }

    /// `commit_log_sync(table)`: forces an fsync of the range-server's
    /// commit log. `table` selects nothing today since this crate keeps
    /// one commit log per server, not per table (spec §4.2 "Rolling").
    pub fn commit_log_sync(&self, _table: &TableIdentifier) -> crate::Result<()> {
        self.commit_log.sync()
    }

    fn gather_scan_children(range: &Range, start_row: &[u8], end_row: &[u8]) -> crate::Result<Vec<Box<dyn Iterator<Item = Cell> + Send>>> {
        let mut children = Vec::new();
        for ag in range.access_groups() {
            children.extend(ag.scan_children(start_row, end_row)?);
        }
        Ok(children)
    }

    fn fetch_block(scanner: &mut MergeScanner) -> (Vec<Cell>, bool) {
        let mut block = Vec::with_capacity(SCAN_BLOCK_THRESHOLD);
        for _ in 0..SCAN_BLOCK_THRESHOLD {
            match scanner.next() {
                Some(cell) => block.push(cell),
                None => return (block, true),
            }
        }
        (block, false)
    }

    fn is_cacheable(spec: &ScanSpec) -> bool {
        !spec.do_not_cache
    }

    /// `create_scanner(table, range, scan_spec, query_key?)` (spec
    /// §4.10). Consults the query cache first when `query_key` is given
    /// and the spec is cacheable.
    pub fn create_scanner(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        scan_spec: ScanSpec,
        query_key: Option<QueryKey>,
    ) -> crate::Result<(u64, Vec<Cell>, bool)> {
        let range = self
            .directory
            .locate_exact(&table.id, spec)
            .ok_or_else(|| Error::RangeNotFound(format!("{}:{:?}", table.id, spec.end_row)))?;

        if let (Some(key), true) = (query_key, Self::is_cacheable(&scan_spec)) {
            if let Some((result, _len, cell_count)) = self.query_cache.lookup(key) {
                let cells = decode_cell_block(&result, cell_count);
                return Ok((0, cells, true));
            }
        }

        let start_row = spec.start_row.clone().unwrap_or_default();
        let children = {
            let _scan_guard = range.scan_barrier.enter();
            Self::gather_scan_children(&range, &start_row, &spec.end_row)?
        };
        let mut scanner = MergeScanner::new(children, scan_spec.clone());
        let (block, eos) = Self::fetch_block(&mut scanner);

        if eos {
            if let Some(key) = query_key {
                if Self::is_cacheable(&scan_spec) {
                    let encoded = encode_cell_block(&block);
                    self.query_cache.insert(
                        key,
                        QueryCacheEntry {
                            tablename: table.id.clone(),
                            row: start_row,
                            columns: scan_spec.columns.clone(),
                            cell_count: block.len() as u32,
                            result_len: encoded.len() as u32,
                            result: encoded.into(),
                        },
                    );
                }
            }
            return Ok((0, block, true));
        }

        let id = self.next_scanner_id.fetch_add(1, Ordering::Relaxed);
        let now = crate::time::unix_nanos();
        self.scanners.lock().expect("scanner table mutex poisoned").insert(
            id,
            ScannerEntry {
                scanner: Mutex::new(scanner),
                range,
                created_at_nanos: now,
                last_touch_nanos: Mutex::new(now),
            },
        );
        Ok((id, block, false))
    }

    /// `fetch_scanblock(scanner_id)`: returns the next chunk and destroys
    /// the scanner once exhausted (spec §4.10).
    pub fn fetch_scanblock(&self, scanner_id: u64) -> crate::Result<(Vec<Cell>, bool)> {
        self.reap_expired_scanners();

        let (block, eos) = {
            let scanners = self.scanners.lock().expect("scanner table mutex poisoned");
            let Some(entry) = scanners.get(&scanner_id) else {
                return Err(Error::InvalidScannerId(scanner_id));
            };
            *entry.last_touch_nanos.lock().expect("scanner touch mutex poisoned") = crate::time::unix_nanos();
            let _scan_guard = entry.range.scan_barrier.enter();
            let mut scanner = entry.scanner.lock().expect("scanner mutex poisoned");
            Self::fetch_block(&mut scanner)
        };

        if eos {
            self.scanners.lock().expect("scanner table mutex poisoned").remove(&scanner_id);
        }
        Ok((block, eos))
    }

    /// `destroy_scanner(scanner_id)`: idempotent on a missing id (spec
    /// §4.10).
    pub fn destroy_scanner(&self, scanner_id: u64) {
        self.scanners.lock().expect("scanner table mutex poisoned").remove(&scanner_id);
    }

    /// Removes scanners idle past `ctx.scanner_ttl` (spec §4.10
    /// "a TTL reaps abandoned scanners").
    pub fn reap_expired_scanners(&self) {
        let now = crate::time::unix_nanos();
        let ttl_nanos = self.ctx.scanner_ttl.as_nanos() as i64;
        let mut scanners = self.scanners.lock().expect("scanner table mutex poisoned");
        let expired: Vec<u64> = scanners
            .iter()
            .filter(|(_, entry)| now - *entry.last_touch_nanos.lock().expect("scanner touch mutex poisoned") > ttl_nanos)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            scanners.remove(id);
        }
        if !expired.is_empty() {
            log::debug!("reaped {} scanner(s) past their TTL", expired.len());
        }
    }

    #[must_use]
    pub fn scanner_count(&self) -> usize {
        self.scanners.lock().expect("scanner table mutex poisoned").len()
    }

    /// Runs the minor/major/merging compactions named by `flags` on one
    /// range. Assumes the caller already holds `range`'s maintenance guard.
    fn compact_range(range: &Range, flags: u32) -> crate::Result<()> {
        for ag in range.access_groups() {
            if flags & compact_flags::MINOR != 0 {
                ag.minor_compact()?;
            }
            if flags & compact_flags::MAJOR != 0 {
                let spec = range.spec();
                ag.major_compact(&spec.start_row.unwrap_or_default(), &spec.end_row)?;
            }
            if flags & compact_flags::MERGING != 0 {
                let spec = range.spec();
                let n = ag.store_count();
                if n >= 2 {
                    ag.merging_compact(0, n, &spec.start_row.unwrap_or_default(), &spec.end_row)?;
                }
            }
        }
        log::debug!("compact: ran flags={:#x} on {}:{:?}", flags, range.table.id, range.spec().end_row);
        Ok(())
    }

    /// `compact(table?, row?, flags)`: forces compaction of matching
    /// ranges (spec §4.10). `flags::MOVE` has no effect here since a
    /// physical move needs a destination directory this call doesn't
    /// take; it is exercised as part of `split_range`'s own directory
    /// relocation instead.
    pub fn compact(&self, table: Option<&str>, row: Option<&[u8]>, flags: u32) -> crate::Result<()> {
        for range in self.directory.all() {
            if let Some(table) = table {
                if range.table.id != table {
                    continue;
                }
            }
            if let Some(row) = row {
                if !range.spec().contains_row(row) {
                    continue;
                }
            }
            let Ok(_guard) = range.try_enter_maintenance() else {
                continue;
            };
            Self::compact_range(&range, flags)?;
        }
        Ok(())
    }

    /// `status()`: a health probe (spec §4.10).
    #[must_use]
    pub fn status(&self) -> Status {
        Status {
            code: ErrorCode::Ok,
            message: format!(
                "ranges={} scanners={} cache_hit_rate={:.3}",
                self.directory.all().len(),
                self.scanner_count(),
                self.query_cache.recent_hit_rate()
            ),
        }
    }

    /// `heapcheck(outfile?)`: dumps a point-in-time resource summary
    /// (spec §4.10). There is no heap profiler in this crate, so the
    /// "profile" is the same counters `status()` reports, optionally
    /// written to `outfile`.
    pub fn heapcheck(&self, outfile: Option<&Path>) -> crate::Result<()> {
        let status = self.status();
        let report = format!("{}: {}\n", crate::time::unix_nanos(), status.message);
        match outfile {
            Some(path) => crate::fs::write_atomic(path, report.as_bytes()),
            None => {
                log::info!("heapcheck: {report}");
                Ok(())
            }
        }
    }
}

/// Lets [`crate::scheduler::MaintenanceScheduler`] decide per range
/// without depending on [`RangeServer`] directly.
impl crate::scheduler::RangeSource for RangeDirectory {
    fn ranges(&self) -> Vec<Arc<Range>> {
        self.all()
    }
}

/// Carries out whatever the scheduler decided a range needed. Split
/// needs the table's schema and data directory, neither of which are
/// part of a [`crate::scheduler::MaintenanceTask`], so they are looked
/// up from what `load_range` recorded; a table the scheduler never saw
/// loaded has nothing to look up and the split is skipped with a warning.
impl crate::scheduler::MaintenanceRunner for RangeServer {
    fn run(&self, task: &crate::scheduler::MaintenanceTask) {
        use crate::scheduler::MaintenanceTrigger;
        let table_id = &task.range.table.id;
        match task.trigger {
            MaintenanceTrigger::Split => {
                let staged = self.schemas.lock().expect("schema table mutex poisoned").get(table_id).cloned();
                let Some((schema, dir)) = staged else {
                    log::warn!("split triggered for {table_id} but no schema is on file, skipping");
                    return;
                };
                let spec = task.range.spec();
                if let Err(err) = self.split_range(&task.range.table, &spec, &schema, &dir) {
                    log::warn!("split of {table_id}:{:?} failed: {err}", spec.end_row);
                }
            }
            MaintenanceTrigger::MinorCompact => {
                if let Err(err) = Self::compact_range(&task.range, compact_flags::MINOR) {
                    log::warn!("minor compact of {table_id} failed: {err}");
                }
            }
            MaintenanceTrigger::MajorCompact => {
                if let Err(err) = Self::compact_range(&task.range, compact_flags::MAJOR) {
                    log::warn!("major compact of {table_id} failed: {err}");
                }
            }
            MaintenanceTrigger::MergingCompact => {
                if let Err(err) = Self::compact_range(&task.range, compact_flags::MERGING) {
                    log::warn!("merging compact of {table_id} failed: {err}");
                }
            }
            MaintenanceTrigger::PurgeMemory => {
                if let Err(err) = Self::compact_range(&task.range, compact_flags::MINOR) {
                    log::warn!("purge-driven minor compact of {table_id} failed: {err}");
                }
            }
        }
    }
}

fn encode_cell_block(cells: &[Cell]) -> Vec<u8> {
    use crate::coding::Encode;
    let mut buf = Vec::new();
    for cell in cells {
        let _ = cell.encode_into(&mut buf);
    }
    buf
}

fn decode_cell_block(bytes: &[u8], cell_count: u32) -> Vec<Cell> {
    use crate::coding::Decode;
    let mut cursor = bytes;
    let mut cells = Vec::with_capacity(cell_count as usize);
    while !cursor.is_empty() {
        match Cell::decode_from(&mut cursor) {
            Ok(cell) => cells.push(cell),
            Err(_) => break,
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{CellFlag, CellKey};
    use crate::range::END_ROW_SENTINEL;
    use crate::schema::{AccessGroupSpec, ColumnFamily};
    use test_log::test;

    fn schema_with_one_ag() -> Schema {
        let mut schema = Schema::new();
        schema.add_access_group(AccessGroupSpec {
            name: "default".into(),
            column_family_ids: vec![],
            in_memory: false,
            blocksize: 0,
        });
        schema.add_column_family(ColumnFamily::new(0, "a", "default")).unwrap();
        schema
    }

    fn server(dir: &Path) -> RangeServer {
        RangeServer::start(Arc::new(Context::new()), dir).unwrap()
    }

    #[test]
    fn load_then_acknowledge_makes_a_range_servable() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let table = TableIdentifier::new("users", 0);
        let spec = RangeSpec::new(None, END_ROW_SENTINEL.to_vec());
        let schema = schema_with_one_ag();

        server
            .load_range(&table, &spec, &schema, dir.path(), None, RangeState::Steady, false)
            .unwrap();
        assert!(server.directory.locate_exact(&table.id, &spec).is_none());

        let codes = server.acknowledge_load(&[(table.clone(), spec.clone())]);
        assert_eq!(codes, vec![ErrorCode::Ok]);
        assert!(server.directory.locate_exact(&table.id, &spec).is_some());
    }

    #[test]
    fn acknowledge_load_of_unknown_range_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let table = TableIdentifier::new("users", 0);
        let spec = RangeSpec::new(None, END_ROW_SENTINEL.to_vec());
        let codes = server.acknowledge_load(&[(table, spec)]);
        assert_eq!(codes, vec![ErrorCode::RangeNotFound]);
    }

    #[test]
    fn create_scanner_then_fetch_drains_then_destroys() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let table = TableIdentifier::new("users", 0);
        let spec = RangeSpec::new(None, END_ROW_SENTINEL.to_vec());
        let schema = schema_with_one_ag();
        server
            .load_range(&table, &spec, &schema, dir.path(), None, RangeState::Steady, false)
            .unwrap();
        server.acknowledge_load(&[(table.clone(), spec.clone())]);

        let range = server.directory.locate_exact(&table.id, &spec).unwrap();
        range
            .add(Cell::new(CellKey::new("row1", 0, "cq", 1, 1, CellFlag::Insert), "v"))
            .unwrap();

        let (id, block, eos) = server.create_scanner(&table, &spec, ScanSpec::default(), None).unwrap();
        assert!(eos, "a single cell fits in one block, so create_scanner should already see eos");
        assert_eq!(block.len(), 1);
        assert_eq!(id, 0);
        assert_eq!(server.scanner_count(), 0);
    }

    #[test]
    fn fetch_scanblock_on_unknown_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let err = server.fetch_scanblock(999).unwrap_err();
        assert!(matches!(err, Error::InvalidScannerId(999)));
    }

    #[test]
    fn destroy_scanner_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        server.destroy_scanner(42);
        server.destroy_scanner(42);
    }

    #[test]
    fn drop_range_cancels_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let table = TableIdentifier::new("users", 0);
        let spec = RangeSpec::new(None, END_ROW_SENTINEL.to_vec());
        let schema = schema_with_one_ag();
        server
            .load_range(&table, &spec, &schema, dir.path(), None, RangeState::Steady, false)
            .unwrap();
        server.acknowledge_load(&[(table.clone(), spec.clone())]);

        let range = server.directory.locate_exact(&table.id, &spec).unwrap();
        server.drop_range(&table, &spec).unwrap();
        assert!(range.is_cancelled());
        assert!(server.directory.locate_exact(&table.id, &spec).is_none());
    }

    #[test]
    fn status_reports_range_and_scanner_counts() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let status = server.status();
        assert_eq!(status.code, ErrorCode::Ok);
        assert!(status.message.contains("ranges=0"));
    }

    #[test]
    fn split_range_produces_two_disjoint_ranges_covering_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path());
        let table = TableIdentifier::new("users", 0);
        let spec = RangeSpec::new(None, END_ROW_SENTINEL.to_vec());
        let schema = schema_with_one_ag();
        server
            .load_range(&table, &spec, &schema, dir.path(), None, RangeState::Steady, false)
            .unwrap();
        server.acknowledge_load(&[(table.clone(), spec.clone())]);

        let range = server.directory.locate_exact(&table.id, &spec).unwrap();
        for i in 0..10 {
            range
                .add(Cell::new(CellKey::new(format!("row{i:02}"), 0, "cq", 1, 1, CellFlag::Insert), "v"))
                .unwrap();
        }

        let (low_spec, high_spec) = server.split_range(&table, &spec, &schema, dir.path()).unwrap();
        assert_ne!(low_spec, high_spec);
        assert!(server.directory.locate_exact(&table.id, &spec).is_none());

        let low_range = server.directory.locate_exact(&table.id, &low_spec).unwrap();
        let high_range = server.directory.locate_exact(&table.id, &high_spec).unwrap();
        assert_eq!(low_range.spec(), low_spec);
        assert_eq!(high_range.spec(), high_spec);

        let (_id, low_cells, low_eos) = server.create_scanner(&table, &low_spec, ScanSpec::default(), None).unwrap();
        let (_id, high_cells, high_eos) = server.create_scanner(&table, &high_spec, ScanSpec::default(), None).unwrap();
        assert!(low_eos && high_eos);
        assert!(!low_cells.is_empty());
        assert!(!high_cells.is_empty());
        assert_eq!(low_cells.len() + high_cells.len(), 10);

        let mut rows: Vec<_> = low_cells.iter().chain(high_cells.iter()).map(|c| c.key.row.to_vec()).collect();
        rows.sort();
        rows.dedup();
        assert_eq!(rows.len(), 10);
    }
}
