// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Commit-log fragment framing (spec §6.1).

use crate::checksum::fletcher32;
use crate::compression::CompressionType;
use crate::coding::{Decode, Encode};
use crate::error::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const FRAGMENT_MAGIC: &[u8; 10] = b"COMMITLOG\0";
const COMMITDATA_MAGIC: &[u8; 10] = b"COMMITDATA";
const COMMITLINK_MAGIC: &[u8; 10] = b"COMMITLINK";

/// The per-fragment file header.
pub struct FragmentHeader {
    pub version: u16,
}

impl Default for FragmentHeader {
    fn default() -> Self {
        Self { version: 1 }
    }
}

impl FragmentHeader {
    /// Wire size: 10-byte magic + u16 version + u16 reserved.
    pub const WIRE_LEN: usize = 10 + 2 + 2;

    pub fn write<W: Write>(&self, writer: &mut W) -> crate::Result<()> {
        writer.write_all(FRAGMENT_MAGIC)?;
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u16::<BigEndian>(0)?; // reserved
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let mut magic = [0u8; 10];
        reader.read_exact(&mut magic)?;
        if &magic != FRAGMENT_MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let version = reader.read_u16::<BigEndian>()?;
        let _reserved = reader.read_u16::<BigEndian>()?;
        Ok(Self { version })
    }
}

/// What kind of payload a commit-log block carries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockKind {
    /// A batch of encoded cells.
    CommitData,
    /// A NUL-terminated linked-log directory path.
    CommitLink,
}

impl BlockKind {
    fn magic(self) -> &'static [u8; 10] {
        match self {
            Self::CommitData => COMMITDATA_MAGIC,
            Self::CommitLink => COMMITLINK_MAGIC,
        }
    }

    fn from_magic(magic: &[u8; 10]) -> crate::Result<Self> {
        if magic == COMMITDATA_MAGIC {
            Ok(Self::CommitData)
        } else if magic == COMMITLINK_MAGIC {
            Ok(Self::CommitLink)
        } else {
            Err(Error::BadMagic(*magic))
        }
    }
}

struct BlockHeaderFields {
    magic: [u8; 10],
    compression_type: CompressionType,
    uncompressed_len: u32,
    compressed_len: u32,
    revision: i64,
    cluster_id: u64,
}

impl BlockHeaderFields {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + 1 + 4 + 4 + 8 + 8);
        buf.extend_from_slice(&self.magic);
        // compression_type encodes as a single tag byte (see `compression.rs`).
        self.compression_type
            .encode_into(&mut buf)
            .expect("writing to a Vec never fails");
        buf.write_u32::<BigEndian>(self.uncompressed_len).expect("vec write");
        buf.write_u32::<BigEndian>(self.compressed_len).expect("vec write");
        buf.write_i64::<BigEndian>(self.revision).expect("vec write");
        buf.write_u64::<BigEndian>(self.cluster_id).expect("vec write");
        buf
    }
}

/// Writes one framed, checksummed block and returns the number of bytes
/// appended to `writer` (header + payload), used for roll-limit accounting.
pub fn write_block<W: Write>(
    writer: &mut W,
    kind: BlockKind,
    raw: &[u8],
    revision: i64,
    cluster_id: u64,
    compression: CompressionType,
) -> crate::Result<u64> {
    let compressed = compression.compress(raw)?;

    let fields = BlockHeaderFields {
        magic: *kind.magic(),
        compression_type: compression,
        #[allow(clippy::cast_possible_truncation)]
        uncompressed_len: raw.len() as u32,
        #[allow(clippy::cast_possible_truncation)]
        compressed_len: compressed.len() as u32,
        revision,
        cluster_id,
    };

    let header_bytes = fields.encode();
    let header_checksum = fletcher32(&header_bytes);
    let payload_checksum = fletcher32(&compressed);

    writer.write_all(&header_bytes)?;
    writer.write_u32::<BigEndian>(header_checksum)?;
    writer.write_u32::<BigEndian>(payload_checksum)?;
    writer.write_all(&compressed)?;
    writer.flush()?;

    Ok((header_bytes.len() + 4 + 4 + compressed.len()) as u64)
}

/// Reads the next block from `reader`. Returns `Ok(None)` at a clean EOF
/// (no partial header read).
pub fn read_block<R: Read>(reader: &mut R) -> crate::Result<Option<(BlockKind, i64, u64, Vec<u8>)>> {
    let mut magic = [0u8; 10];
    match reader.read_exact(&mut magic) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let kind = BlockKind::from_magic(&magic)?;

    let compression_type = CompressionType::decode_from(reader)?;
    let uncompressed_len = reader.read_u32::<BigEndian>()?;
    let compressed_len = reader.read_u32::<BigEndian>()?;
    let revision = reader.read_i64::<BigEndian>()?;
    let cluster_id = reader.read_u64::<BigEndian>()?;
    let header_checksum = reader.read_u32::<BigEndian>()?;
    let payload_checksum = reader.read_u32::<BigEndian>()?;

    let fields = BlockHeaderFields {
        magic,
        compression_type,
        uncompressed_len,
        compressed_len,
        revision,
        cluster_id,
    };
    let computed_header_checksum = fletcher32(&fields.encode());
    if computed_header_checksum != header_checksum {
        return Err(Error::HeaderChecksumMismatch {
            expected: header_checksum,
            got: computed_header_checksum,
        });
    }

    let mut compressed = vec![0u8; compressed_len as usize];
    reader.read_exact(&mut compressed)?;

    let computed_payload_checksum = fletcher32(&compressed);
    if computed_payload_checksum != payload_checksum {
        return Err(Error::ChecksumMismatch {
            expected: u64::from(payload_checksum),
            got: u64::from(computed_payload_checksum),
        });
    }

    let raw = compression_type.decompress(&compressed, uncompressed_len as usize)?;
    Ok(Some((kind, revision, cluster_id, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn fragment_header_roundtrip() {
        let mut buf = Vec::new();
        FragmentHeader::default().write(&mut buf).unwrap();
        assert_eq!(buf.len(), FragmentHeader::WIRE_LEN);
        let header = FragmentHeader::read(&mut &buf[..]).unwrap();
        assert_eq!(header.version, 1);
    }

    #[test]
    fn fragment_header_rejects_bad_magic() {
        let buf = vec![0u8; FragmentHeader::WIRE_LEN];
        let err = FragmentHeader::read(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, Error::BadMagic(_)));
    }

    #[test]
    fn commitdata_block_roundtrip() {
        let mut buf = Vec::new();
        write_block(&mut buf, BlockKind::CommitData, b"hello world", 7, 42, CompressionType::None).unwrap();

        let (kind, revision, cluster_id, payload) = read_block(&mut &buf[..]).unwrap().unwrap();
        assert_eq!(kind, BlockKind::CommitData);
        assert_eq!(revision, 7);
        assert_eq!(cluster_id, 42);
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn commitlink_block_roundtrip() {
        let mut buf = Vec::new();
        let path = b"/var/log/other\0".to_vec();
        write_block(&mut buf, BlockKind::CommitLink, &path, 1, 1, CompressionType::None).unwrap();

        let (kind, _, _, payload) = read_block(&mut &buf[..]).unwrap().unwrap();
        assert_eq!(kind, BlockKind::CommitLink);
        assert_eq!(payload, path);
    }

    #[test]
    fn read_block_returns_none_at_clean_eof() {
        let buf: Vec<u8> = Vec::new();
        let result = read_block(&mut &buf[..]).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn corrupted_payload_checksum_is_detected() {
        let mut buf = Vec::new();
        write_block(&mut buf, BlockKind::CommitData, b"payload", 1, 1, CompressionType::None).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let err = read_block(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }
}
