// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cell store data blocks (spec §4.4).
//!
//! Grounded on the teacher's `segment/block` shape: a header carrying
//! compression metadata and a checksum, followed by a compressed payload
//! of densely-packed, sorted cells.

use crate::coding::{Decode, Encode};
use crate::compression::CompressionType;
use crate::error::Error;
use crate::value::Cell;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

/// On-disk block header.
pub struct BlockHeader {
    pub compression: CompressionType,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
    pub checksum: u64,
}

const HEADER_LEN: usize = 1 + 4 + 4 + 8;

impl BlockHeader {
    fn write<W: Write>(&self, writer: &mut W) -> crate::Result<()> {
        self.compression.encode_into(writer)?;
        writer.write_u32::<BigEndian>(self.uncompressed_len)?;
        writer.write_u32::<BigEndian>(self.compressed_len)?;
        writer.write_u64::<BigEndian>(self.checksum)?;
        Ok(())
    }

    fn read(bytes: &[u8]) -> crate::Result<Self> {
        let mut cursor = bytes;
        let compression = CompressionType::decode_from(&mut cursor)?;
        let uncompressed_len = cursor.read_u32::<BigEndian>()?;
        let compressed_len = cursor.read_u32::<BigEndian>()?;
        let checksum = cursor.read_u64::<BigEndian>()?;
        Ok(Self {
            compression,
            uncompressed_len,
            compressed_len,
            checksum,
        })
    }
}

/// Serializes `cells` (already sorted) into one compressed, checksummed
/// block and appends it to `out`, returning the block's uncompressed byte
/// length (used for block-index / target-size accounting).
pub fn write_block(
    out: &mut Vec<u8>,
    cells: &[Cell],
    compression: CompressionType,
) -> crate::Result<usize> {
    let mut raw = Vec::new();
    for cell in cells {
        cell.encode_into(&mut raw)?;
    }

    let compressed = compression.compress(&raw)?;
    let checksum = crate::checksum::block_checksum(&compressed);

    let header = BlockHeader {
        compression,
        #[allow(clippy::cast_possible_truncation)]
        uncompressed_len: raw.len() as u32,
        #[allow(clippy::cast_possible_truncation)]
        compressed_len: compressed.len() as u32,
        checksum,
    };

    header.write(out)?;
    out.extend_from_slice(&compressed);

    Ok(raw.len())
}

/// Reads and decompresses the block at `bytes[offset..]`, returning the
/// decoded cells and the number of bytes the block occupied on disk.
///
/// On checksum mismatch returns [`Error::ChecksumMismatch`]; callers
/// implement the spec's retry-once-with-verification policy themselves
/// (spec §4.4: "On checksum mismatch, the file is reopened ... and the
/// operation retried once").
pub fn read_block(bytes: &[u8], offset: usize) -> crate::Result<(Vec<Cell>, usize)> {
    let header_bytes = bytes
        .get(offset..offset + HEADER_LEN)
        .ok_or_else(|| Error::CorruptCellStore("block header truncated".into()))?;
    let header = BlockHeader::read(header_bytes)?;

    let payload_start = offset + HEADER_LEN;
    let payload_end = payload_start + header.compressed_len as usize;
    let payload = bytes
        .get(payload_start..payload_end)
        .ok_or_else(|| Error::CorruptCellStore("block payload truncated".into()))?;

    let checksum = crate::checksum::block_checksum(payload);
    if checksum != header.checksum {
        return Err(Error::ChecksumMismatch {
            expected: header.checksum,
            got: checksum,
        });
    }

    let raw = header
        .compression
        .decompress(payload, header.uncompressed_len as usize)?;

    if raw.len() != header.uncompressed_len as usize {
        return Err(Error::CorruptCellStore(
            "decompressed length does not match header".into(),
        ));
    }

    let mut cursor = &raw[..];
    let mut cells = Vec::new();
    while !cursor.is_empty() {
        cells.push(Cell::decode_from(&mut cursor)?);
    }

    Ok((cells, payload_end - offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{CellFlag, CellKey};
    use test_log::test;

    fn cell(row: &str, ts: i64, value: &str) -> Cell {
        Cell::new(
            CellKey::new(row, 0, "cq", ts, ts, CellFlag::Insert),
            value,
        )
    }

    #[test]
    fn write_read_roundtrip_none() {
        let cells = vec![cell("a", 1, "x"), cell("b", 1, "y")];
        let mut buf = Vec::new();
        write_block(&mut buf, &cells, CompressionType::None).unwrap();

        let (decoded, consumed) = read_block(&buf, 0).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].key.row.to_vec(), b"a".to_vec());
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn write_read_roundtrip_zstd() {
        let cells = vec![cell("a", 1, "x"), cell("b", 1, "y")];
        let mut buf = Vec::new();
        write_block(&mut buf, &cells, CompressionType::Zstd).unwrap();
        let (decoded, _) = read_block(&buf, 0).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let cells = vec![cell("a", 1, "x")];
        let mut buf = Vec::new();
        write_block(&mut buf, &cells, CompressionType::None).unwrap();

        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let err = read_block(&buf, 0).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn two_blocks_back_to_back() {
        let mut buf = Vec::new();
        let first_len = write_block(&mut buf, &[cell("a", 1, "x")], CompressionType::None).unwrap();
        let _ = first_len;
        let first_block_disk_len = buf.len();
        write_block(&mut buf, &[cell("b", 1, "y")], CompressionType::None).unwrap();

        let (first, consumed) = read_block(&buf, 0).unwrap();
        assert_eq!(consumed, first_block_disk_len);
        assert_eq!(first[0].key.row.to_vec(), b"a".to_vec());

        let (second, _) = read_block(&buf, first_block_disk_len).unwrap();
        assert_eq!(second[0].key.row.to_vec(), b"b".to_vec());
    }
}
