// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Sparse block index (spec §4.4: "records `(first_key_in_block ->
//! block_offset)`"; invariant: "the block index is strictly increasing by
//! key").

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::key::CellKey;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub first_key: CellKey,
    pub offset: u64,
    pub on_disk_len: u32,
}

/// Maps each block's first key to its byte offset, in strictly increasing
/// key order.
#[derive(Default, Debug)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
}

impl BlockIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    ///
    /// # Panics
    ///
    /// Panics if `first_key` does not strictly exceed the previous entry's
    /// key, enforcing the "strictly increasing" invariant at construction
    /// time rather than discovering it lazily at read time.
    pub fn push(&mut self, first_key: CellKey, offset: u64, on_disk_len: u32) {
        if let Some(last) = self.entries.last() {
            assert!(
                first_key > last.first_key,
                "block index keys must be strictly increasing"
            );
        }
        self.entries.push(IndexEntry {
            first_key,
            offset,
            on_disk_len,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Locates the first block whose key range may contain `key`: the last
    /// block whose `first_key <= key`, or the first block if `key` sorts
    /// before every block's first key (spec: "locate the first block >=
    /// `start_row`").
    #[must_use]
    pub fn locate(&self, key: &CellKey) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        match self
            .entries
            .binary_search_by(|entry| entry.first_key.cmp(key))
        {
            Ok(i) => Some(i),
            Err(0) => Some(0),
            Err(i) => Some(i - 1),
        }
    }
}

impl Encode for BlockIndex {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            entry.first_key.encode_into(writer)?;
            writer.write_u64::<BigEndian>(entry.offset)?;
            writer.write_u32::<BigEndian>(entry.on_disk_len)?;
        }
        Ok(())
    }
}

impl Decode for BlockIndex {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let count = reader.read_u32::<BigEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let first_key = CellKey::decode_from(reader)?;
            let offset = reader.read_u64::<BigEndian>()?;
            let on_disk_len = reader.read_u32::<BigEndian>()?;
            entries.push(IndexEntry {
                first_key,
                offset,
                on_disk_len,
            });
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CellFlag;
    use test_log::test;

    fn key(row: &str) -> CellKey {
        CellKey::new(row, 0, "", 0, 0, CellFlag::Insert)
    }

    #[test]
    fn locate_before_first_block() {
        let mut index = BlockIndex::new();
        index.push(key("m"), 0, 10);
        index.push(key("z"), 10, 10);
        assert_eq!(index.locate(&key("a")), Some(0));
    }

    #[test]
    fn locate_between_blocks() {
        let mut index = BlockIndex::new();
        index.push(key("b"), 0, 10);
        index.push(key("m"), 10, 10);
        index.push(key("z"), 20, 10);
        assert_eq!(index.locate(&key("c")), Some(0));
        assert_eq!(index.locate(&key("n")), Some(1));
        assert_eq!(index.locate(&key("z")), Some(2));
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn push_rejects_non_increasing_keys() {
        let mut index = BlockIndex::new();
        index.push(key("b"), 0, 10);
        index.push(key("b"), 10, 10);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut index = BlockIndex::new();
        index.push(key("a"), 0, 10);
        index.push(key("b"), 10, 20);

        let bytes = index.encode_into_vec();
        let decoded = BlockIndex::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.entries()[1].offset, 10);
    }
}
