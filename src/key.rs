// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Cell key data model (spec §3 "Cell").

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::Slice;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Reverse;
use std::io::{Read, Write};

/// Sentinel meaning "assign now (nanoseconds since epoch) at commit" for
/// both `timestamp` and `revision` fields (spec §3).
pub const AUTO_ASSIGN: i64 = i64::MIN;

/// The kind of mutation a cell represents (spec §3).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CellFlag {
    /// Deletes every cell in the row up to and including this timestamp.
    DeleteRow = 0,
    /// Deletes every cell in the column family up to and including this timestamp.
    DeleteColumnFamily = 1,
    /// Deletes every version of `(row, cf, cq)` up to and including this timestamp.
    DeleteCell = 2,
    /// Deletes exactly the version at this timestamp.
    DeleteCellVersion = 3,
    /// A regular inserted value.
    Insert = 4,
}

impl CellFlag {
    #[must_use]
    pub fn is_delete(self) -> bool {
        !matches!(self, Self::Insert)
    }
}

impl From<CellFlag> for u8 {
    fn from(value: CellFlag) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for CellFlag {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::DeleteRow),
            1 => Ok(Self::DeleteColumnFamily),
            2 => Ok(Self::DeleteCell),
            3 => Ok(Self::DeleteCellVersion),
            4 => Ok(Self::Insert),
            _ => Err(()),
        }
    }
}

/// A fully-qualified cell key.
///
/// Ordering (spec §3): row ascending; within row, column-family id
/// ascending; within family, qualifier ascending; within qualifier,
/// timestamp descending (newest first); within timestamp, revision
/// descending; flag is a last tiebreaker so delete markers sort before
/// matching inserts at the same `(row, cf, cq, ts)`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CellKey {
    pub row: Slice,
    pub column_family_id: u8,
    pub column_qualifier: Slice,
    pub timestamp: i64,
    pub revision: i64,
    pub flag: CellFlag,
}

impl CellKey {
    #[must_use]
    pub fn new(
        row: impl Into<Slice>,
        column_family_id: u8,
        column_qualifier: impl Into<Slice>,
        timestamp: i64,
        revision: i64,
        flag: CellFlag,
    ) -> Self {
        Self {
            row: row.into(),
            column_family_id,
            column_qualifier: column_qualifier.into(),
            timestamp,
            revision,
            flag,
        }
    }

    fn sort_tuple(&self) -> (&Slice, u8, &Slice, Reverse<i64>, Reverse<i64>, CellFlag) {
        (
            &self.row,
            self.column_family_id,
            &self.column_qualifier,
            Reverse(self.timestamp),
            Reverse(self.revision),
            self.flag,
        )
    }
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_tuple().cmp(&other.sort_tuple())
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Encode for CellKey {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.row.len() as u16)?;
        writer.write_all(&self.row)?;
        writer.write_u8(self.column_family_id)?;
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.column_qualifier.len() as u16)?;
        writer.write_all(&self.column_qualifier)?;
        writer.write_i64::<BigEndian>(self.timestamp)?;
        writer.write_i64::<BigEndian>(self.revision)?;
        writer.write_u8(self.flag.into())?;
        Ok(())
    }
}

impl Decode for CellKey {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let row_len = reader.read_u16::<BigEndian>()?;
        let mut row = vec![0; row_len.into()];
        reader.read_exact(&mut row)?;

        let column_family_id = reader.read_u8()?;

        let cq_len = reader.read_u16::<BigEndian>()?;
        let mut cq = vec![0; cq_len.into()];
        reader.read_exact(&mut cq)?;

        let timestamp = reader.read_i64::<BigEndian>()?;
        let revision = reader.read_i64::<BigEndian>()?;

        let flag_byte = reader.read_u8()?;
        let flag = flag_byte
            .try_into()
            .map_err(|()| DecodeError::InvalidTag(("CellFlag", flag_byte)))?;

        Ok(Self::new(row, column_family_id, cq, timestamp, revision, flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn orders_by_row_first() {
        let a = CellKey::new("a", 0, "", 1, 1, CellFlag::Insert);
        let b = CellKey::new("b", 0, "", 1, 1, CellFlag::Insert);
        assert!(a < b);
    }

    #[test]
    fn newer_timestamp_sorts_first() {
        let old = CellKey::new("a", 0, "c", 100, 1, CellFlag::Insert);
        let new = CellKey::new("a", 0, "c", 200, 1, CellFlag::Insert);
        assert!(new < old);
    }

    #[test]
    fn delete_sorts_before_insert_at_same_timestamp() {
        let del = CellKey::new("a", 0, "c", 100, 1, CellFlag::DeleteCell);
        let ins = CellKey::new("a", 0, "c", 100, 1, CellFlag::Insert);
        assert!(del < ins);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let key = CellKey::new("row", 3, "qual", 42, 7, CellFlag::Insert);
        let bytes = key.encode_into_vec();
        let decoded = CellKey::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn encode_decode_empty_qualifier() {
        let key = CellKey::new("row", 3, "", 42, 7, CellFlag::DeleteRow);
        let bytes = key.encode_into_vec();
        let decoded = CellKey::decode_from(&mut &bytes[..]).unwrap();
        assert_eq!(key, decoded);
    }
}
