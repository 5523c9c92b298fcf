//! Log records and index entries for a group.
//!
//! The log holds three kinds of immutable records. The index holds facts
//! derived from them, keyed by a closed family of key variants. Every kind
//! carries a permanent numeric discriminant used by the wire codec; once
//! assigned, a discriminant is never reused.

pub mod codec;
mod index;
mod log;

pub use index::{FileIndex, Index, InMemoryIndex, Versioned};
pub use log::{CachedLog, FileLog, InMemoryLog, Log};

use crate::types::{
    CompressionType, EncodingId, Fingerprint, Position, SchemaInfo, ValidationRules, VersionInfo,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A newly accepted schema and the identity assigned to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub schema_info: SchemaInfo,
    pub version_info: VersionInfo,
}

/// A newly minted (version, codec) -> id mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingRecord {
    pub encoding_id: EncodingId,
    pub version_info: VersionInfo,
    pub compression_type: CompressionType,
}

/// Rules replacing the group's policy from this point of the log onwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub validation_rules: ValidationRules,
}

/// A log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Schema(SchemaRecord),
    Encoding(EncodingRecord),
    Validation(ValidationRecord),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Schema(_) => RecordKind::Schema,
            Record::Encoding(_) => RecordKind::Encoding,
            Record::Validation(_) => RecordKind::Validation,
        }
    }
}

/// Record discriminants. 0 is reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Schema = 1,
    Encoding = 2,
    Validation = 3,
}

impl RecordKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::Schema),
            2 => Some(RecordKind::Encoding),
            3 => Some(RecordKind::Validation),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Schema => "SchemaRecord",
            RecordKind::Encoding => "EncodingRecord",
            RecordKind::Validation => "ValidationRecord",
        };
        f.write_str(name)
    }
}

/// Keys of a group's index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexKey {
    /// -> log position of the version's `SchemaRecord`.
    VersionInfo(VersionInfo),
    /// -> log position of the latest folded `ValidationRecord`.
    ValidationPolicy,
    /// -> log position up to which the index has been folded.
    SyncdTill,
    /// -> every version whose schema bytes share this fingerprint.
    SchemaInfo(Fingerprint),
    /// -> the encoding id for a (version, codec) pair.
    EncodingInfo(VersionInfo, CompressionType),
    /// -> the (version, codec) pair behind an encoding id.
    EncodingId(EncodingId),
}

impl IndexKey {
    pub fn kind(&self) -> KeyKind {
        match self {
            IndexKey::VersionInfo(_) => KeyKind::VersionInfo,
            IndexKey::ValidationPolicy => KeyKind::ValidationPolicy,
            IndexKey::SyncdTill => KeyKind::SyncdTill,
            IndexKey::SchemaInfo(_) => KeyKind::SchemaInfo,
            IndexKey::EncodingInfo(..) => KeyKind::EncodingInfo,
            IndexKey::EncodingId(_) => KeyKind::EncodingId,
        }
    }

    /// The only value kind that may be stored under this key.
    pub fn value_kind(&self) -> ValueKind {
        match self {
            IndexKey::VersionInfo(_) | IndexKey::ValidationPolicy | IndexKey::SyncdTill => {
                ValueKind::LogPosition
            }
            IndexKey::SchemaInfo(_) => ValueKind::SchemaVersions,
            IndexKey::EncodingInfo(..) => ValueKind::EncodingId,
            IndexKey::EncodingId(_) => ValueKind::EncodingInfo,
        }
    }
}

/// Index key discriminants. 0 is reserved, 4 belonged to group properties
/// in older layouts and must not be reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    VersionInfo = 1,
    ValidationPolicy = 2,
    SyncdTill = 3,
    SchemaInfo = 5,
    EncodingInfo = 6,
    EncodingId = 7,
}

impl KeyKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(KeyKind::VersionInfo),
            2 => Some(KeyKind::ValidationPolicy),
            3 => Some(KeyKind::SyncdTill),
            5 => Some(KeyKind::SchemaInfo),
            6 => Some(KeyKind::EncodingInfo),
            7 => Some(KeyKind::EncodingId),
            _ => None,
        }
    }
}

/// Values of a group's index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexValue {
    LogPosition(Position),
    SchemaVersions(Vec<VersionInfo>),
    EncodingInfo(VersionInfo, CompressionType),
    EncodingId(EncodingId),
}

impl IndexValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            IndexValue::LogPosition(_) => ValueKind::LogPosition,
            IndexValue::SchemaVersions(_) => ValueKind::SchemaVersions,
            IndexValue::EncodingInfo(..) => ValueKind::EncodingInfo,
            IndexValue::EncodingId(_) => ValueKind::EncodingId,
        }
    }

    pub fn as_position(&self) -> Option<Position> {
        match self {
            IndexValue::LogPosition(p) => Some(*p),
            _ => None,
        }
    }
}

/// Index value discriminants. 0 is reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    LogPosition = 1,
    SchemaVersions = 2,
    EncodingInfo = 3,
    EncodingId = 4,
}

impl ValueKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ValueKind::LogPosition),
            2 => Some(ValueKind::SchemaVersions),
            3 => Some(ValueKind::EncodingInfo),
            4 => Some(ValueKind::EncodingId),
            _ => None,
        }
    }
}
