// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cell store trailer (spec §4.4, §6.2).
//!
//! Only the current version (v7) is fully implemented; versions 0-6 are
//! recognized wire tags so the dispatch-by-tag shape required by spec
//! DESIGN NOTES §9 ("CellStoreV0..V7 ... represented as variants over a
//! capability set ... dispatch is by match on the tag read from the
//! trailer") is present and extensible, but opening a file with an older
//! trailer returns [`Error::UnsupportedCellStoreVersion`] rather than a
//! legacy decoder (see `DESIGN.md`).

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::compression::CompressionType;
use crate::error::Error;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// The latest supported trailer version.
pub const CURRENT_VERSION: u16 = 7;

/// Direct-I/O style alignment used when reading the trailing chunk of a
/// cell store file (spec §4.4: "reads the last `HT_DIRECT_IO_ALIGNMENT`-
/// aligned chunk").
pub const ALIGNMENT: u64 = 512;

/// Cell store trailer, v7 (spec §6.2). Field order matches the wire format.
#[derive(Clone, Debug, PartialEq)]
pub struct TrailerV7 {
    pub fix_index_offset: u64,
    /// Offset of a variable-width key index. This implementation always
    /// uses the fixed-width `BlockIndex` layout, so this is always 0; the
    /// field is retained for wire compatibility with readers that expect it.
    pub var_index_offset: u64,
    pub filter_offset: u64,
    pub index_entries: u32,
    pub total_entries: u64,
    pub filter_length: u64,
    pub filter_items_estimate: u32,
    pub filter_items_actual: u32,
    pub block_size: u32,
    pub compression_ratio: f32,
    pub key_bytes: u64,
    pub value_bytes: u64,
    pub compression_type: CompressionType,
    pub bloom_filter_mode: u8,
    pub bloom_filter_hash_count: u8,
    pub flags: u8,
    pub create_time: i64,
    pub revision: i64,
    pub timestamp_min: i64,
    pub timestamp_max: i64,
    pub table_id: u32,
    pub table_generation: u32,
}

impl Encode for TrailerV7 {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.fix_index_offset)?;
        writer.write_u64::<LittleEndian>(self.var_index_offset)?;
        writer.write_u64::<LittleEndian>(self.filter_offset)?;
        writer.write_u32::<LittleEndian>(self.index_entries)?;
        writer.write_u64::<LittleEndian>(self.total_entries)?;
        writer.write_u64::<LittleEndian>(self.filter_length)?;
        writer.write_u32::<LittleEndian>(self.filter_items_estimate)?;
        writer.write_u32::<LittleEndian>(self.filter_items_actual)?;
        writer.write_u32::<LittleEndian>(self.block_size)?;
        writer.write_f32::<LittleEndian>(self.compression_ratio)?;
        writer.write_u64::<LittleEndian>(self.key_bytes)?;
        writer.write_u64::<LittleEndian>(self.value_bytes)?;
        self.compression_type.encode_into(writer)?;
        writer.write_u8(self.bloom_filter_mode)?;
        writer.write_u8(self.bloom_filter_hash_count)?;
        writer.write_u8(self.flags)?;
        writer.write_i64::<LittleEndian>(self.create_time)?;
        writer.write_i64::<LittleEndian>(self.revision)?;
        writer.write_i64::<LittleEndian>(self.timestamp_min)?;
        writer.write_i64::<LittleEndian>(self.timestamp_max)?;
        writer.write_u32::<LittleEndian>(self.table_id)?;
        writer.write_u32::<LittleEndian>(self.table_generation)?;
        // Version tag stays big-endian: it is read independently by
        // `decode_trailer` before a body decoder is even chosen.
        writer.write_u16::<BigEndian>(CURRENT_VERSION)?;
        Ok(())
    }
}

impl Decode for TrailerV7 {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let fix_index_offset = reader.read_u64::<LittleEndian>()?;
        let var_index_offset = reader.read_u64::<LittleEndian>()?;
        let filter_offset = reader.read_u64::<LittleEndian>()?;
        let index_entries = reader.read_u32::<LittleEndian>()?;
        let total_entries = reader.read_u64::<LittleEndian>()?;
        let filter_length = reader.read_u64::<LittleEndian>()?;
        let filter_items_estimate = reader.read_u32::<LittleEndian>()?;
        let filter_items_actual = reader.read_u32::<LittleEndian>()?;
        let block_size = reader.read_u32::<LittleEndian>()?;
        let compression_ratio = reader.read_f32::<LittleEndian>()?;
        let key_bytes = reader.read_u64::<LittleEndian>()?;
        let value_bytes = reader.read_u64::<LittleEndian>()?;
        let compression_type = CompressionType::decode_from(reader)?;
        let bloom_filter_mode = reader.read_u8()?;
        let bloom_filter_hash_count = reader.read_u8()?;
        let flags = reader.read_u8()?;
        let create_time = reader.read_i64::<LittleEndian>()?;
        let revision = reader.read_i64::<LittleEndian>()?;
        let timestamp_min = reader.read_i64::<LittleEndian>()?;
        let timestamp_max = reader.read_i64::<LittleEndian>()?;
        let table_id = reader.read_u32::<LittleEndian>()?;
        let table_generation = reader.read_u32::<LittleEndian>()?;
        // Trailing version field is read separately by the caller (it is
        // what selects this decoder in the first place).
        Ok(Self {
            fix_index_offset,
            var_index_offset,
            filter_offset,
            index_entries,
            total_entries,
            filter_length,
            filter_items_estimate,
            filter_items_actual,
            block_size,
            compression_ratio,
            key_bytes,
            value_bytes,
            compression_type,
            bloom_filter_mode,
            bloom_filter_hash_count,
            flags,
            create_time,
            revision,
            timestamp_min,
            timestamp_max,
            table_id,
            table_generation,
        })
    }
}

/// Reads the version tag from the trailing two bytes of `tail`, and
/// dispatches to the matching decoder.
///
/// # Errors
///
/// Returns [`Error::UnsupportedCellStoreVersion`] if the version exceeds
/// [`CURRENT_VERSION`] (spec invariant: "a trailer with version >
/// latest-supported is rejected") or is an older, unimplemented version.
pub fn decode_trailer(tail: &[u8]) -> crate::Result<TrailerV7> {
    if tail.len() < 2 {
        return Err(Error::CorruptCellStore("trailer truncated".into()));
    }
    let version_bytes = &tail[tail.len() - 2..];
    let version = u16::from_be_bytes([version_bytes[0], version_bytes[1]]);

    match version {
        CURRENT_VERSION => {
            let body = &tail[..tail.len() - 2];
            let mut cursor = body;
            // The trailer is written at a fixed offset from the end; the
            // caller passes exactly the trailer's bytes (see `reader.rs`).
            Ok(TrailerV7::decode_from(&mut cursor)?)
        }
        v if v > CURRENT_VERSION => Err(Error::UnsupportedCellStoreVersion(v)),
        v => Err(Error::UnsupportedCellStoreVersion(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample() -> TrailerV7 {
        TrailerV7 {
            fix_index_offset: 10,
            var_index_offset: 0,
            filter_offset: 20,
            index_entries: 2,
            total_entries: 5,
            filter_length: 64,
            filter_items_estimate: 5,
            filter_items_actual: 5,
            block_size: 4096,
            compression_ratio: 1.0,
            key_bytes: 100,
            value_bytes: 200,
            compression_type: CompressionType::None,
            bloom_filter_mode: 1,
            bloom_filter_hash_count: 4,
            flags: 0,
            create_time: 1000,
            revision: 7,
            timestamp_min: 1,
            timestamp_max: 9,
            table_id: 1,
            table_generation: 1,
        }
    }

    #[test]
    fn roundtrip_v7() {
        let trailer = sample();
        let bytes = trailer.encode_into_vec();
        let decoded = decode_trailer(&bytes).unwrap();
        assert_eq!(decoded, trailer);
    }

    #[test]
    fn rejects_future_version() {
        let trailer = sample();
        let mut bytes = trailer.encode_into_vec();
        let len = bytes.len();
        bytes[len - 2..].copy_from_slice(&(CURRENT_VERSION + 1).to_be_bytes());
        let err = decode_trailer(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCellStoreVersion(v) if v == CURRENT_VERSION + 1));
    }

    #[test]
    fn rejects_older_version() {
        let trailer = sample();
        let mut bytes = trailer.encode_into_vec();
        let len = bytes.len();
        bytes[len - 2..].copy_from_slice(&0u16.to_be_bytes());
        let err = decode_trailer(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCellStoreVersion(0)));
    }
}
