// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Range-server meta-log (RSML): an append-only journal of range lifecycle
//! entities, replayable on startup (spec §4.*, §6.3, component C8).
//!
//! Grounded on the teacher's `manifest.rs` / `version/persist.rs` shape: a
//! single-writer append log of versioned records, with a replay pass that
//! rebuilds in-memory state from the log on open.

use crate::checksum::fletcher32;
use crate::coding::{Decode, Encode};
use crate::error::Error;
use crate::range::{RangeSpec, RangeState};
use crate::schema::TableIdentifier;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::OpenOptions;
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// `RANGE` entity type tag (spec §6.3).
pub const ENTITY_RANGE: u32 = 0x0001_0001;
/// `RANGE2` entity type tag: adds `original_transfer_log`.
pub const ENTITY_RANGE2: u32 = 0x0001_0002;
/// Task entity: e.g. "remove transfer-log directory".
pub const ENTITY_TASK_REMOVE_LOG: u32 = 0x0002_0001;

/// The mutable fields that ride along with a [`RangeState`] (spec §3
/// "Range state"): whether this is a recovery phantom, the state's
/// timestamp, the split target size, and the in-flight transfer/split
/// bookkeeping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RangeStateMeta {
    pub phantom: bool,
    pub timestamp: i64,
    pub soft_limit: u64,
    pub transfer_log: Option<String>,
    pub split_point: Option<Vec<u8>>,
    pub old_boundary_row: Option<Vec<u8>>,
    pub source: Option<String>,
}

fn write_opt_bytes<W: Write>(writer: &mut W, value: &Option<impl AsRef<[u8]>>) -> crate::Result<()> {
    match value {
        Some(v) => {
            let bytes = v.as_ref();
            writer.write_u8(1)?;
            writer.write_u16::<BigEndian>(bytes.len() as u16)?;
            writer.write_all(bytes)?;
        }
        None => writer.write_u8(0)?,
    }
    Ok(())
}

fn read_opt_bytes<R: Read>(reader: &mut R) -> crate::Result<Option<Vec<u8>>> {
    if reader.read_u8()? == 0 {
        return Ok(None);
    }
    let len = reader.read_u16::<BigEndian>()?;
    let mut bytes = vec![0u8; len.into()];
    reader.read_exact(&mut bytes)?;
    Ok(Some(bytes))
}

impl RangeStateMeta {
    fn write<W: Write>(&self, writer: &mut W) -> crate::Result<()> {
        writer.write_u8(u8::from(self.phantom))?;
        writer.write_i64::<BigEndian>(self.timestamp)?;
        writer.write_u64::<BigEndian>(self.soft_limit)?;
        write_opt_bytes(writer, &self.transfer_log.as_ref().map(String::as_bytes))?;
        write_opt_bytes(writer, &self.split_point)?;
        write_opt_bytes(writer, &self.old_boundary_row)?;
        write_opt_bytes(writer, &self.source.as_ref().map(String::as_bytes))?;
        Ok(())
    }

    fn read<R: Read>(reader: &mut R) -> crate::Result<Self> {
        let phantom = reader.read_u8()? != 0;
        let timestamp = reader.read_i64::<BigEndian>()?;
        let soft_limit = reader.read_u64::<BigEndian>()?;
        let transfer_log = read_opt_bytes(reader)?.map(|b| String::from_utf8_lossy(&b).into_owned());
        let split_point = read_opt_bytes(reader)?;
        let old_boundary_row = read_opt_bytes(reader)?;
        let source = read_opt_bytes(reader)?.map(|b| String::from_utf8_lossy(&b).into_owned());
        Ok(Self {
            phantom,
            timestamp,
            soft_limit,
            transfer_log,
            split_point,
            old_boundary_row,
            source,
        })
    }
}

/// One range's persisted lifecycle state, as recorded in the RSML.
#[derive(Clone, Debug, PartialEq)]
pub struct RangeEntity {
    pub table: TableIdentifier,
    pub spec: RangeSpec,
    pub state: RangeState,
    pub meta: RangeStateMeta,
    pub load_acknowledged: bool,
    pub needs_compaction: bool,
    pub original_transfer_log: Option<String>,
}

/// A task record, independent of any specific range (spec: "task records
/// (e.g. 'remove transfer-log directory')").
#[derive(Clone, Debug, PartialEq)]
pub struct TaskEntity {
    pub description: String,
}

/// A decoded RSML entity, tagged by its wire type.
#[derive(Clone, Debug, PartialEq)]
pub enum Entity {
    Range(RangeEntity),
    RemoveLogTask(TaskEntity),
}

impl Entity {
    fn type_tag(&self) -> u32 {
        match self {
            Self::Range(_) => ENTITY_RANGE2,
            Self::RemoveLogTask(_) => ENTITY_TASK_REMOVE_LOG,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Range(range) => {
                range.table.encode_into(&mut buf).expect("vec write");
                range.spec.encode_into(&mut buf).expect("vec write");
                range.state.encode_into(&mut buf).expect("vec write");
                range.meta.write(&mut buf).expect("vec write");
                buf.write_u8(u8::from(range.load_acknowledged)).expect("vec write");
                buf.write_u8(u8::from(range.needs_compaction)).expect("vec write");
                match &range.original_transfer_log {
                    Some(log) => {
                        buf.write_u8(1).expect("vec write");
                        buf.write_u16::<BigEndian>(log.len() as u16).expect("vec write");
                        buf.extend_from_slice(log.as_bytes());
                    }
                    None => buf.write_u8(0).expect("vec write"),
                }
            }
            Self::RemoveLogTask(task) => {
                buf.write_u16::<BigEndian>(task.description.len() as u16).expect("vec write");
                buf.extend_from_slice(task.description.as_bytes());
            }
        }
        buf
    }

    fn decode(type_tag: u32, payload: &[u8]) -> crate::Result<Self> {
        let mut cursor = payload;
        match type_tag {
            ENTITY_RANGE | ENTITY_RANGE2 => {
                let table = TableIdentifier::decode_from(&mut cursor)?;
                let spec = RangeSpec::decode_from(&mut cursor)?;
                let state = RangeState::decode_from(&mut cursor)?;
                let meta = RangeStateMeta::read(&mut cursor)?;
                let load_acknowledged = cursor.read_u8()? != 0;
                let needs_compaction = cursor.read_u8()? != 0;
                let original_transfer_log = if type_tag == ENTITY_RANGE2 {
                    match cursor.read_u8()? {
                        0 => None,
                        _ => {
                            let len = cursor.read_u16::<BigEndian>()?;
                            let mut bytes = vec![0u8; len.into()];
                            cursor.read_exact(&mut bytes)?;
                            Some(String::from_utf8_lossy(&bytes).into_owned())
                        }
                    }
                } else {
                    None
                };
                Ok(Self::Range(RangeEntity {
                    table,
                    spec,
                    state,
                    meta,
                    load_acknowledged,
                    needs_compaction,
                    original_transfer_log,
                }))
            }
            ENTITY_TASK_REMOVE_LOG => {
                let len = cursor.read_u16::<BigEndian>()?;
                let mut bytes = vec![0u8; len.into()];
                cursor.read_exact(&mut bytes)?;
                Ok(Self::RemoveLogTask(TaskEntity {
                    description: String::from_utf8_lossy(&bytes).into_owned(),
                }))
            }
            other => Err(Error::BadKey(format!("unknown RSML entity type {other:#x}"))),
        }
    }
}

/// One RSML record on the wire: `{ id, type, length, flags,
/// payload_checksum, payload }` (spec §6.3).
struct Record {
    id: u64,
    type_tag: u32,
    flags: u16,
    payload: Vec<u8>,
}

impl Record {
    fn write<W: Write>(&self, writer: &mut W) -> crate::Result<()> {
        writer.write_u64::<BigEndian>(self.id)?;
        writer.write_u32::<BigEndian>(self.type_tag)?;
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32::<BigEndian>(self.payload.len() as u32)?;
        writer.write_u16::<BigEndian>(self.flags)?;
        writer.write_u32::<BigEndian>(fletcher32(&self.payload))?;
        writer.write_all(&self.payload)?;
        Ok(())
    }

    fn read<R: Read>(reader: &mut R) -> crate::Result<Option<Self>> {
        let mut id_bytes = [0u8; 8];
        match reader.read_exact(&mut id_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let id = u64::from_be_bytes(id_bytes);
        let type_tag = reader.read_u32::<BigEndian>()?;
        let length = reader.read_u32::<BigEndian>()?;
        let flags = reader.read_u16::<BigEndian>()?;
        let payload_checksum = reader.read_u32::<BigEndian>()?;
        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;

        let computed = fletcher32(&payload);
        if computed != payload_checksum {
            return Err(Error::ChecksumMismatch {
                expected: u64::from(payload_checksum),
                got: u64::from(computed),
            });
        }

        Ok(Some(Self {
            id,
            type_tag,
            flags,
            payload,
        }))
    }
}

const FLAG_TOMBSTONE: u16 = 1;

struct Writer {
    file: BufWriter<std::fs::File>,
    next_id: u64,
}

/// The append-only meta-log itself.
pub struct Rsml {
    path: PathBuf,
    writer: Mutex<Writer>,
}

impl Rsml {
    /// Opens (creating if absent) the meta-log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(Writer {
                file: BufWriter::new(file),
                next_id: 1,
            }),
        })
    }

    fn append_records(&self, entities: &[(&Entity, u16)]) -> crate::Result<()> {
        let mut writer = self.writer.lock().expect("rsml mutex poisoned");
        for (entity, flags) in entities {
            let record = Record {
                id: writer.next_id,
                type_tag: entity.type_tag(),
                flags: *flags,
                payload: entity.encode_payload(),
            };
            writer.next_id += 1;
            record.write(&mut writer.file)?;
        }
        writer.file.flush()?;
        writer.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Durably records the current state of one entity.
    pub fn record_state(&self, entity: &Entity) -> crate::Result<()> {
        self.append_records(&[(entity, 0)])
    }

    /// Durably records the current state of several entities as one
    /// atomic append (spec: "`record_state(entities…)`").
    pub fn record_states(&self, entities: &[&Entity]) -> crate::Result<()> {
        let tagged: Vec<_> = entities.iter().map(|e| (*e, 0)).collect();
        self.append_records(&tagged)
    }

    /// Records the removal of an entity (a tombstone record).
    pub fn record_removal(&self, entity: &Entity) -> crate::Result<()> {
        self.append_records(&[(entity, FLAG_TOMBSTONE)])
    }

    /// Records a task's completion alongside an entity's new state as one
    /// durable operation (spec: "`record_state_and_removal(task, entity)`").
    pub fn record_state_and_removal(&self, task: &Entity, entity: &Entity) -> crate::Result<()> {
        self.append_records(&[(task, 0), (entity, FLAG_TOMBSTONE)])
    }

    /// Replays every record in the log, applying tombstones, and returns
    /// the resulting set of live range entities keyed by `(table, spec)`.
    pub fn replay(&self) -> crate::Result<Vec<RangeEntity>> {
        let file = std::fs::File::open(&self.path)?;
        let mut reader = std::io::BufReader::new(file);

        let mut live: Vec<(TableIdentifier, RangeSpec, RangeEntity)> = Vec::new();
        while let Some(record) = Record::read(&mut reader)? {
            let entity = Entity::decode(record.type_tag, &record.payload)?;
            match entity {
                Entity::Range(range_entity) => {
                    let key = (range_entity.table.clone(), range_entity.spec.clone());
                    live.retain(|(t, s, _)| (t, s) != (&key.0, &key.1));
                    if record.flags & FLAG_TOMBSTONE == 0 {
                        live.push((key.0, key.1, range_entity));
                    }
                }
                Entity::RemoveLogTask(_) => {}
            }
        }
        log::info!("replayed RSML at {}: {} live range(s)", self.path.display(), live.len());
        Ok(live.into_iter().map(|(_, _, entity)| entity).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn entity(row: &str) -> Entity {
        Entity::Range(RangeEntity {
            table: TableIdentifier::new("users", 0),
            spec: RangeSpec::new(None, row.as_bytes().to_vec()),
            state: RangeState::Steady,
            meta: RangeStateMeta::default(),
            load_acknowledged: true,
            needs_compaction: false,
            original_transfer_log: None,
        })
    }

    #[test]
    fn replay_returns_recorded_entities() {
        let dir = tempfile::tempdir().unwrap();
        let rsml = Rsml::open(dir.path().join("rsml.log")).unwrap();
        rsml.record_state(&entity("m")).unwrap();

        let live = rsml.replay().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].spec.end_row, b"m".to_vec());
    }

    #[test]
    fn removal_is_reflected_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let rsml = Rsml::open(dir.path().join("rsml.log")).unwrap();
        let e = entity("m");
        rsml.record_state(&e).unwrap();
        rsml.record_removal(&e).unwrap();

        let live = rsml.replay().unwrap();
        assert!(live.is_empty());
    }

    #[test]
    fn later_state_for_same_range_supersedes_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let rsml = Rsml::open(dir.path().join("rsml.log")).unwrap();
        let mut e = entity("m");
        rsml.record_state(&e).unwrap();
        e.needs_compaction = true;
        rsml.record_state(&e).unwrap();

        let live = rsml.replay().unwrap();
        assert_eq!(live.len(), 1);
        assert!(live[0].needs_compaction);
    }

    #[test]
    fn record_state_and_removal_is_one_atomic_append() {
        let dir = tempfile::tempdir().unwrap();
        let rsml = Rsml::open(dir.path().join("rsml.log")).unwrap();
        let old = entity("m");
        let task = Entity::RemoveLogTask(TaskEntity {
            description: "remove transfer log".into(),
        });
        rsml.record_state_and_removal(&task, &old).unwrap();

        let live = rsml.replay().unwrap();
        assert!(live.is_empty());
    }
}
