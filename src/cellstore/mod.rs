// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cell store: an immutable on-disk sorted run of cells (spec §4.4,
//! component C4).
//!
//! File layout: `[data blocks][block index][bloom filter][trailer]`.
//! Grounded on the teacher's `segment/` module (block + block_index +
//! filter + meta/trailer), generalized to this crate's cell/key types.

pub mod block;
pub mod bloom;
pub mod index;
pub mod trailer;

use crate::compression::CompressionType;
use crate::error::Error;
use crate::key::CellKey;
use crate::value::Cell;
use bloom::{BloomFilter, BloomFilterBuilder, BloomFilterMode};
use index::BlockIndex;
use std::path::{Path, PathBuf};
use trailer::TrailerV7;

/// Target size (uncompressed) for one data block before it is flushed.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Writes cells (which must arrive already sorted) into a single cell
/// store file.
pub struct CellStoreWriter {
    path: PathBuf,
    block_size: u32,
    compression: CompressionType,
    bloom_mode: BloomFilterMode,
    buf: Vec<u8>,
    pending: Vec<Cell>,
    pending_raw_len: usize,
    index: BlockIndex,
    filter: BloomFilterBuilder,
    total_entries: u64,
    key_bytes: u64,
    value_bytes: u64,
    timestamp_min: i64,
    timestamp_max: i64,
    revision: i64,
    table_id: u32,
    table_generation: u32,
}

impl CellStoreWriter {
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        block_size: u32,
        compression: CompressionType,
        bloom_mode: BloomFilterMode,
        table_id: u32,
        table_generation: u32,
    ) -> Self {
        Self {
            path: path.into(),
            block_size,
            compression,
            bloom_mode,
            buf: Vec::new(),
            pending: Vec::new(),
            pending_raw_len: 0,
            index: BlockIndex::new(),
            filter: BloomFilterBuilder::new(10.0),
            total_entries: 0,
            key_bytes: 0,
            value_bytes: 0,
            timestamp_min: i64::MAX,
            timestamp_max: i64::MIN,
            revision: 0,
            table_id,
            table_generation,
        }
    }

    fn filter_key(&self, cell: &Cell) -> Vec<u8> {
        match self.bloom_mode {
            BloomFilterMode::Disabled => Vec::new(),
            BloomFilterMode::Row => cell.key.row.to_vec(),
            BloomFilterMode::RowColumnFamily => {
                let mut k = cell.key.row.to_vec();
                k.push(cell.key.column_family_id);
                k
            }
            BloomFilterMode::RowColumnFamilyQualifier => {
                let mut k = cell.key.row.to_vec();
                k.push(cell.key.column_family_id);
                k.extend_from_slice(&cell.key.column_qualifier);
                k
            }
        }
    }

    /// Accepts the next cell in sorted order.
    pub fn add(&mut self, cell: Cell) -> crate::Result<()> {
        self.total_entries += 1;
        self.key_bytes += cell.key.row.len() as u64 + cell.key.column_qualifier.len() as u64;
        self.value_bytes += cell.value.len() as u64;
        self.timestamp_min = self.timestamp_min.min(cell.key.timestamp);
        self.timestamp_max = self.timestamp_max.max(cell.key.timestamp);
        self.revision = self.revision.max(cell.key.revision);

        if !matches!(self.bloom_mode, BloomFilterMode::Disabled) {
            let fk = self.filter_key(&cell);
            self.filter.add(&fk);
        }

        self.pending_raw_len += cell.key.row.len()
            + cell.key.column_qualifier.len()
            + cell.value.len()
            + 24;
        self.pending.push(cell);

        if self.pending_raw_len as u32 >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> crate::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let offset = self.buf.len() as u64;
        let first_key = self.pending.first().expect("checked non-empty").key.clone();
        block::write_block(&mut self.buf, &self.pending, self.compression)?;
        let on_disk_len = (self.buf.len() as u64 - offset) as u32;
        self.index.push(first_key, offset, on_disk_len);
        self.pending.clear();
        self.pending_raw_len = 0;
        Ok(())
    }

    /// Finalizes the file: flushes any buffered cells, writes the block
    /// index, Bloom filter and trailer, and persists the file.
    pub fn finish(mut self) -> crate::Result<PathBuf> {
        self.flush_block()?;

        let fix_index_offset = self.buf.len() as u64;
        crate::coding::Encode::encode_into(&self.index, &mut self.buf)?;

        let filter = if matches!(self.bloom_mode, BloomFilterMode::Disabled) {
            None
        } else {
            Some(self.filter.build())
        };

        let filter_offset = self.buf.len() as u64;
        let (filter_length, filter_items_estimate, filter_items_actual, hash_count, mode_tag) =
            if let Some(ref f) = filter {
                crate::coding::Encode::encode_into(f, &mut self.buf)?;
                (
                    f.byte_len() as u64,
                    f.item_count(),
                    f.item_count(),
                    f.hash_count(),
                    bloom_mode_tag(self.bloom_mode),
                )
            } else {
                (0, 0, 0, 0, bloom_mode_tag(self.bloom_mode))
            };

        if self.total_entries == 0 {
            self.timestamp_min = 0;
            self.timestamp_max = 0;
        }

        let trailer = TrailerV7 {
            fix_index_offset,
            var_index_offset: 0,
            filter_offset,
            index_entries: self.index.len() as u32,
            total_entries: self.total_entries,
            filter_length,
            filter_items_estimate,
            filter_items_actual,
            block_size: self.block_size,
            compression_ratio: 1.0,
            key_bytes: self.key_bytes,
            value_bytes: self.value_bytes,
            compression_type: self.compression,
            bloom_filter_mode: mode_tag,
            bloom_filter_hash_count: hash_count,
            flags: 0,
            create_time: crate::time::unix_nanos(),
            revision: self.revision,
            timestamp_min: self.timestamp_min,
            timestamp_max: self.timestamp_max,
            table_id: self.table_id,
            table_generation: self.table_generation,
        };
        crate::coding::Encode::encode_into(&trailer, &mut self.buf)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        crate::fs::write_atomic(&self.path, &self.buf)?;

        Ok(self.path)
    }
}

fn bloom_mode_tag(mode: BloomFilterMode) -> u8 {
    match mode {
        BloomFilterMode::Disabled => 0,
        BloomFilterMode::Row => 1,
        BloomFilterMode::RowColumnFamily => 2,
        BloomFilterMode::RowColumnFamilyQualifier => 3,
    }
}

/// A read-only handle to an immutable cell store file.
pub struct CellStoreReader {
    path: PathBuf,
    data: Vec<u8>,
    index: BlockIndex,
    filter: Option<BloomFilter>,
    bloom_mode: BloomFilterMode,
    pub trailer: TrailerV7,
}

impl CellStoreReader {
    /// Opens `path` and parses its trailer, block index and Bloom filter.
    ///
    /// On checksum mismatch while reading the index/filter region, the
    /// file is re-read once before surfacing
    /// [`Error::CorruptCellStore`] (spec §4.4).
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        let data = std::fs::read(&path)?;
        match Self::open_bytes(path.clone(), data) {
            Ok(reader) => Ok(reader),
            Err(first_err) => {
                let retry = std::fs::read(&path)?;
                Self::open_bytes(path.clone(), retry).map_err(|_| {
                    Error::CorruptCellStore(format!("{}: {first_err}", path.display()))
                })
            }
        }
    }

    fn open_bytes(path: PathBuf, data: Vec<u8>) -> crate::Result<Self> {
        if data.len() < trailer::ALIGNMENT as usize {
            return open_small(path, data);
        }
        let tail_start = data.len() - trailer::ALIGNMENT as usize;
        let tail = &data[tail_start..];
        let trailer = trailer::decode_trailer(tail)?;
        build_reader(path, data, trailer)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn total_entries(&self) -> u64 {
        self.trailer.total_entries
    }

    #[must_use]
    pub fn key_range_timestamp(&self) -> (i64, i64) {
        (self.trailer.timestamp_min, self.trailer.timestamp_max)
    }

    /// Returns `false` if `row` is definitely not present, based on the
    /// Bloom filter (when built over row-only keys).
    #[must_use]
    pub fn may_contain_row(&self, row: &[u8]) -> bool {
        if !matches!(self.bloom_mode, BloomFilterMode::Row) {
            return true;
        }
        match &self.filter {
            Some(f) => f.may_contain(row),
            None => true,
        }
    }

    /// Scans cells with `row >= start_row` (inclusive) up to and including
    /// `end_row`.
    pub fn scan(&self, start_row: &[u8], end_row: &[u8]) -> crate::Result<Vec<Cell>> {
        let probe = CellKey::new(start_row, 0, Vec::<u8>::new(), i64::MAX, i64::MAX, crate::key::CellFlag::Insert);
        let Some(mut block_idx) = self.index.locate(&probe) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        loop {
            let Some(entry) = self.index.entries().get(block_idx) else {
                break;
            };
            let (cells, _) = block::read_block(&self.data, entry.offset as usize)?;
            let mut past_end = false;
            for cell in cells {
                if cell.key.row.as_ref() > end_row {
                    past_end = true;
                    break;
                }
                if cell.key.row.as_ref() >= start_row {
                    out.push(cell);
                }
            }
            if past_end {
                break;
            }
            block_idx += 1;
        }
        Ok(out)
    }
}

fn open_small(path: PathBuf, data: Vec<u8>) -> crate::Result<CellStoreReader> {
    let trailer = trailer::decode_trailer(&data)?;
    build_reader(path, data, trailer)
}

fn build_reader(path: PathBuf, data: Vec<u8>, trailer: TrailerV7) -> crate::Result<CellStoreReader> {
    let index = if trailer.index_entries == 0 && trailer.fix_index_offset as usize >= data.len() {
        BlockIndex::new()
    } else {
        let mut cursor = &data[trailer.fix_index_offset as usize..trailer.filter_offset as usize];
        crate::coding::Decode::decode_from(&mut cursor)?
    };

    let bloom_mode = match trailer.bloom_filter_mode {
        1 => BloomFilterMode::Row,
        2 => BloomFilterMode::RowColumnFamily,
        3 => BloomFilterMode::RowColumnFamilyQualifier,
        _ => BloomFilterMode::Disabled,
    };

    let filter = if trailer.filter_length > 0 {
        // Bloom filter on-disk layout: u32 byte_len + u8 hash_count +
        // u32 item_count + `byte_len` bits (see `bloom::BloomFilter::encode_into`).
        const FILTER_HEADER_LEN: usize = 4 + 1 + 4;
        let filter_end =
            trailer.filter_offset as usize + FILTER_HEADER_LEN + trailer.filter_length as usize;
        let mut cursor = &data[trailer.filter_offset as usize..filter_end.min(data.len())];
        Some(crate::coding::Decode::decode_from(&mut cursor)?)
    } else {
        None
    };

    Ok(CellStoreReader {
        path,
        data,
        index,
        filter,
        bloom_mode,
        trailer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CellFlag;
    use test_log::test;

    fn cell(row: &str, ts: i64, value: &str) -> Cell {
        Cell::new(CellKey::new(row, 0, "cq", ts, ts, CellFlag::Insert), value)
    }

    #[test]
    fn write_read_small_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001.cs");

        let mut writer = CellStoreWriter::new(
            &path,
            DEFAULT_BLOCK_SIZE,
            CompressionType::None,
            BloomFilterMode::Row,
            1,
            0,
        );
        for i in 0..50 {
            writer.add(cell(&format!("row{i:03}"), 1, "v")).unwrap();
        }
        let path = writer.finish().unwrap();

        let reader = CellStoreReader::open(&path).unwrap();
        assert_eq!(reader.total_entries(), 50);
        assert!(reader.may_contain_row(b"row000"));
        assert!(!reader.may_contain_row(b"nope"));

        let scanned = reader.scan(b"row010", b"row019").unwrap();
        assert_eq!(scanned.len(), 10);
        assert_eq!(scanned[0].key.row.to_vec(), b"row010".to_vec());
    }

    #[test]
    fn scan_spans_multiple_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001.cs");

        let mut writer = CellStoreWriter::new(&path, 64, CompressionType::None, BloomFilterMode::Disabled, 1, 0);
        for i in 0..200 {
            writer.add(cell(&format!("row{i:04}"), 1, "value-payload")).unwrap();
        }
        let path = writer.finish().unwrap();
        let reader = CellStoreReader::open(&path).unwrap();
        assert!(reader.trailer.index_entries > 1);

        let scanned = reader.scan(b"row0000", b"row0199").unwrap();
        assert_eq!(scanned.len(), 200);
    }

    #[test]
    fn open_rejects_future_trailer_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.cs");
        let mut writer = CellStoreWriter::new(&path, DEFAULT_BLOCK_SIZE, CompressionType::None, BloomFilterMode::Disabled, 1, 0);
        writer.add(cell("a", 1, "v")).unwrap();
        let path = writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 2..].copy_from_slice(&(trailer::CURRENT_VERSION + 1).to_be_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = CellStoreReader::open(&path).unwrap_err();
        assert!(matches!(err, Error::CorruptCellStore(_)));
    }
}
