// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};
use crate::compression::CompressionType;

/// Errors that can occur in the range-server storage core.
///
/// Variants are grouped per the conceptual taxonomy of spec §7: transport,
/// filesystem, schema/identity, range, commit-log, concurrency,
/// scanner/mutator and recovery.
#[derive(Debug)]
pub enum Error {
    /// I/O error.
    Io(std::io::Error),

    /// Serialization failed.
    Encode(EncodeError),

    /// Deserialization failed.
    Decode(DecodeError),

    /// Decompression failed for the given codec.
    Decompress(CompressionType),

    /// The codec is a recognized wire tag but has no implementation.
    UnsupportedCompressor(CompressionType),

    /// A checksum did not match (expected, got).
    ChecksumMismatch { expected: u64, got: u64 },

    /// The fletcher-32 header checksum of a commit-log block did not match.
    HeaderChecksumMismatch { expected: u32, got: u32 },

    /// A cell store trailer declared a version newer than this crate supports.
    UnsupportedCellStoreVersion(u16),

    /// A cell store file is corrupt (checksum failure survived a retry).
    CorruptCellStore(String),

    /// Table not found.
    TableNotFound(String),

    /// Table generation does not match the caller's cached schema.
    GenerationMismatch { expected: u32, got: u32 },

    /// Column family not found in the schema.
    BadColumnFamily(String),

    /// Malformed cell key.
    BadKey(String),

    /// Range not found on this server.
    RangeNotFound(String),

    /// No row within `(start_row, end_row)` is a valid split point.
    RowOverflow,

    /// The range is busy with another structural operation.
    RangeBusy(String),

    /// The range has moved to another server.
    RangeMoved(String),

    /// Commit log is closed and rejects further operations.
    CommitLogClosed,

    /// Commit log block has a bad or unrecognized magic.
    BadMagic([u8; 10]),

    /// Operation was cancelled (shutdown, maintenance cancel, etc).
    Cancelled,

    /// Identifier does not reference a live scanner.
    InvalidScannerId(u64),

    /// A scanner exceeded its configured TTL and was reaped.
    ScannerTtlExpired(u64),

    /// A recovery plan generation is stale relative to the receiver's.
    PlanGenerationStale { expected: u64, got: u64 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Decompress(c) => write!(f, "decompression failed for codec {c}"),
            Self::UnsupportedCompressor(c) => write!(f, "codec {c} has no implementation"),
            Self::ChecksumMismatch { expected, got } => {
                write!(f, "checksum mismatch: expected {expected}, got {got}")
            }
            Self::HeaderChecksumMismatch { expected, got } => {
                write!(f, "header checksum mismatch: expected {expected}, got {got}")
            }
            Self::UnsupportedCellStoreVersion(v) => {
                write!(f, "unsupported cell store trailer version {v}")
            }
            Self::CorruptCellStore(path) => write!(f, "corrupt cell store: {path}"),
            Self::TableNotFound(id) => write!(f, "table not found: {id}"),
            Self::GenerationMismatch { expected, got } => {
                write!(f, "schema generation mismatch: expected {expected}, got {got}")
            }
            Self::BadColumnFamily(name) => write!(f, "bad column family: {name}"),
            Self::BadKey(msg) => write!(f, "bad key: {msg}"),
            Self::RangeNotFound(spec) => write!(f, "range not found: {spec}"),
            Self::RowOverflow => write!(f, "no valid split row in range"),
            Self::RangeBusy(spec) => write!(f, "range busy: {spec}"),
            Self::RangeMoved(spec) => write!(f, "range moved: {spec}"),
            Self::CommitLogClosed => write!(f, "commit log is closed"),
            Self::BadMagic(magic) => write!(f, "bad block magic: {magic:?}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::InvalidScannerId(id) => write!(f, "invalid scanner id: {id}"),
            Self::ScannerTtlExpired(id) => write!(f, "scanner ttl expired: {id}"),
            Self::PlanGenerationStale { expected, got } => {
                write!(f, "recovery plan generation stale: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// A structured error code surfaced to clients (spec §7, "User-visible behavior").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ErrorCode {
    Ok = 0,
    Io = 1,
    BadKey = 2,
    BadColumnFamily = 3,
    GenerationMismatch = 4,
    RangeNotFound = 5,
    RowOverflow = 6,
    RangeBusy = 7,
    RangeMoved = 8,
    CommitLogClosed = 9,
    Cancelled = 10,
    InvalidScannerId = 11,
    ScannerTtlExpired = 12,
    PlanGenerationStale = 13,
    CorruptCellStore = 14,
    Other = 999,
}

impl From<&Error> for ErrorCode {
    fn from(value: &Error) -> Self {
        match value {
            Error::Io(_) => Self::Io,
            Error::BadKey(_) => Self::BadKey,
            Error::BadColumnFamily(_) => Self::BadColumnFamily,
            Error::GenerationMismatch { .. } => Self::GenerationMismatch,
            Error::RangeNotFound(_) => Self::RangeNotFound,
            Error::RowOverflow => Self::RowOverflow,
            Error::RangeBusy(_) => Self::RangeBusy,
            Error::RangeMoved(_) => Self::RangeMoved,
            Error::CommitLogClosed => Self::CommitLogClosed,
            Error::Cancelled => Self::Cancelled,
            Error::InvalidScannerId(_) => Self::InvalidScannerId,
            Error::ScannerTtlExpired(_) => Self::ScannerTtlExpired,
            Error::PlanGenerationStale { .. } => Self::PlanGenerationStale,
            Error::CorruptCellStore(_) => Self::CorruptCellStore,
            _ => Self::Other,
        }
    }
}

/// Core result type.
pub type Result<T> = std::result::Result<T, Error>;
