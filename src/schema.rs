// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Table identity and schema (spec §3 "Table identifier", "Schema").

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// `(id, generation)`. Table ids starting with `"0/"` are system tables;
/// `"0/0"` is the METADATA table.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TableIdentifier {
    pub id: String,
    pub generation: u32,
}

impl TableIdentifier {
    #[must_use]
    pub fn new(id: impl Into<String>, generation: u32) -> Self {
        Self {
            id: id.into(),
            generation,
        }
    }

    #[must_use]
    pub fn is_system_table(&self) -> bool {
        self.id.starts_with("0/")
    }

    #[must_use]
    pub fn is_metadata_table(&self) -> bool {
        self.id == "0/0"
    }
}

impl Encode for TableIdentifier {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.id.len() as u16)?;
        writer.write_all(self.id.as_bytes())?;
        writer.write_u32::<BigEndian>(self.generation)?;
        Ok(())
    }
}

impl Decode for TableIdentifier {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let len = reader.read_u16::<BigEndian>()?;
        let mut bytes = vec![0u8; len.into()];
        reader.read_exact(&mut bytes)?;
        let id = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidLength("TableIdentifier.id"))?;
        let generation = reader.read_u32::<BigEndian>()?;
        Ok(Self { id, generation })
    }
}

/// A column family within a table's schema (spec §3 "Schema").
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnFamily {
    pub id: u8,
    pub name: String,
    pub ttl_secs: Option<u64>,
    pub max_versions: Option<u32>,
    pub deleted: bool,
    pub value_index: bool,
    pub qualifier_index: bool,
    pub access_group: String,
}

impl ColumnFamily {
    #[must_use]
    pub fn new(id: u8, name: impl Into<String>, access_group: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ttl_secs: None,
            max_versions: None,
            deleted: false,
            value_index: false,
            qualifier_index: false,
            access_group: access_group.into(),
        }
    }
}

/// A named vertical partition of a table's column families (spec §3, C5).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccessGroupSpec {
    pub name: String,
    pub column_family_ids: Vec<u8>,
    pub in_memory: bool,
    pub blocksize: u32,
}

/// A table's schema: its column families and their grouping into access
/// groups.
///
/// Invariant: every non-deleted family belongs to exactly one access group.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub max_column_family_id: u8,
    pub column_families: Vec<ColumnFamily>,
    pub access_groups: Vec<AccessGroupSpec>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column family, extending its access group's membership list.
    /// Returns [`crate::Error::BadColumnFamily`] if the access group named
    /// by `family.access_group` does not exist.
    pub fn add_column_family(&mut self, family: ColumnFamily) -> crate::Result<()> {
        let Some(ag) = self
            .access_groups
            .iter_mut()
            .find(|ag| ag.name == family.access_group)
        else {
            return Err(crate::Error::BadColumnFamily(format!(
                "unknown access group: {}",
                family.access_group
            )));
        };
        ag.column_family_ids.push(family.id);
        self.max_column_family_id = self.max_column_family_id.max(family.id);
        self.column_families.push(family);
        Ok(())
    }

    pub fn add_access_group(&mut self, ag: AccessGroupSpec) {
        self.access_groups.push(ag);
    }

    #[must_use]
    pub fn column_family(&self, id: u8) -> Option<&ColumnFamily> {
        self.column_families.iter().find(|cf| cf.id == id && !cf.deleted)
    }

    #[must_use]
    pub fn column_family_by_name(&self, name: &str) -> Option<&ColumnFamily> {
        self.column_families
            .iter()
            .find(|cf| cf.name == name && !cf.deleted)
    }

    /// Checks every non-deleted family belongs to exactly one access group
    /// (spec §3 invariant).
    #[must_use]
    pub fn validate(&self) -> bool {
        for cf in self.column_families.iter().filter(|cf| !cf.deleted) {
            let owners = self
                .access_groups
                .iter()
                .filter(|ag| ag.column_family_ids.contains(&cf.id))
                .count();
            if owners != 1 {
                return false;
            }
        }
        true
    }
}
