// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A cell: a [`CellKey`] paired with its value bytes.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::key::{CellFlag, CellKey};
use crate::Slice;
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// A fully-materialized cell: key plus value.
#[derive(Clone, Eq, PartialEq)]
pub struct Cell {
    pub key: CellKey,
    pub value: Slice,
}

impl Cell {
    /// Creates a new cell.
    ///
    /// # Panics
    ///
    /// Panics if the row is empty, the row is longer than 65535 bytes, or
    /// the value is longer than 2^32 bytes.
    pub fn new(key: CellKey, value: impl Into<Slice>) -> Self {
        let value = value.into();
        assert!(!key.row.is_empty(), "row key may not be empty");
        assert!(
            u32::try_from(value.len()).is_ok(),
            "values can be at most 2^32 bytes in length"
        );
        Self { key, value }
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.key.flag.is_delete()
    }

    /// Approximate heap footprint, used for cache/soft-limit accounting.
    #[must_use]
    pub fn size(&self) -> usize {
        std::mem::size_of::<i64>() * 2
            + self.key.row.len()
            + self.key.column_qualifier.len()
            + self.value.len()
            + 2 // column family id + flag
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} => {:?}", self.key, self.value)
    }
}

impl Encode for Cell {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.key.encode_into(writer)?;
        if !self.is_delete() {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32_varint(self.value.len() as u32)?;
            writer.write_all(&self.value)?;
        }
        Ok(())
    }
}

impl Decode for Cell {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key = CellKey::decode_from(reader)?;
        if key.flag.is_delete() {
            Ok(Self {
                key,
                value: Slice::empty(),
            })
        } else {
            let value_len = reader.read_u32_varint()?;
            let mut buf = vec![0u8; value_len as usize];
            reader.read_exact(&mut buf)?;
            Ok(Self {
                key,
                value: buf.into(),
            })
        }
    }
}
