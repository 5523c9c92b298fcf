//! Versioned wire encoding for records, index keys and index values.
//!
//! Frame layout:
//!
//! ```text
//! kind: u8 | write_version: u8 | body_len: u32 LE | body (MessagePack, named fields)
//! ```
//!
//! `kind` selects the decoder from a fixed table. Bodies are encoded as
//! named maps, so a newer writer may append optional fields and an older
//! reader skips them. A frame whose write version is newer than the newest
//! revision known here is decoded with that newest revision.

use super::{IndexKey, IndexValue, KeyKind, Record, RecordKind, ValueKind};
use crate::error::{Result, StoreError};
use crate::types::{CompressionType, EncodingId, Fingerprint, Position, VersionInfo};
use serde::{Deserialize, Serialize};

/// kind + write version + body length.
pub const FRAME_HEADER_LEN: usize = 1 + 1 + 4;

/// Upper bound on a single frame body.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Write version used for every record kind.
pub const RECORD_WRITE_VERSION: u8 = 0;

/// Write version used for every index key and value kind.
pub const INDEX_WRITE_VERSION: u8 = 0;

/// A parsed frame borrowing its body from the input buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    pub kind: u8,
    pub write_version: u8,
    pub body: &'a [u8],
}

impl Frame<'_> {
    /// Total encoded size including the header.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body.len()
    }
}

fn frame(kind: u8, write_version: u8, body: Vec<u8>) -> Result<Vec<u8>> {
    if body.len() > MAX_BODY_LEN {
        return Err(StoreError::InvalidArgument(format!(
            "Frame body of {} bytes exceeds limit of {}",
            body.len(),
            MAX_BODY_LEN
        )));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    out.push(kind);
    out.push(write_version);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse the frame at the start of `bytes`.
pub fn read_frame(bytes: &[u8]) -> Result<Frame<'_>> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(StoreError::Corruption("Truncated frame header".into()));
    }
    let kind = bytes[0];
    let write_version = bytes[1];
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[2..6]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_BODY_LEN {
        return Err(StoreError::Corruption(format!("Frame body too large: {}", len)));
    }
    let end = FRAME_HEADER_LEN + len;
    if bytes.len() < end {
        return Err(StoreError::Corruption("Truncated frame body".into()));
    }

    Ok(Frame {
        kind,
        write_version,
        body: &bytes[FRAME_HEADER_LEN..end],
    })
}

fn to_body<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

fn from_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(body)?)
}

#[derive(Serialize, Deserialize)]
struct EncodingPair {
    version_info: VersionInfo,
    compression_type: CompressionType,
}

// --- Records ---

type Decoder<T> = fn(u8, &[u8]) -> Result<T>;

/// Record decoders by discriminant. Append only.
const RECORD_DECODERS: &[(RecordKind, Decoder<Record>)] = &[
    (RecordKind::Schema, decode_schema_record),
    (RecordKind::Encoding, decode_encoding_record),
    (RecordKind::Validation, decode_validation_record),
];

fn decode_schema_record(_version: u8, body: &[u8]) -> Result<Record> {
    Ok(Record::Schema(from_body(body)?))
}

fn decode_encoding_record(_version: u8, body: &[u8]) -> Result<Record> {
    Ok(Record::Encoding(from_body(body)?))
}

fn decode_validation_record(_version: u8, body: &[u8]) -> Result<Record> {
    Ok(Record::Validation(from_body(body)?))
}

/// Encode a record as a single frame.
pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    let body = match record {
        Record::Schema(r) => to_body(r)?,
        Record::Encoding(r) => to_body(r)?,
        Record::Validation(r) => to_body(r)?,
    };
    frame(record.kind() as u8, RECORD_WRITE_VERSION, body)
}

/// Decode the record frame at the start of `bytes`, returning it with its encoded size.
pub fn decode_record(bytes: &[u8]) -> Result<(Record, usize)> {
    let frame = read_frame(bytes)?;
    let kind = RecordKind::from_u8(frame.kind)
        .ok_or_else(|| StoreError::InvalidFormat(format!("Unknown record kind: {}", frame.kind)))?;
    let decoder = RECORD_DECODERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, d)| *d)
        .ok_or_else(|| StoreError::InvalidFormat(format!("No decoder for {}", kind)))?;
    let record = decoder(frame.write_version, frame.body)?;
    Ok((record, frame.encoded_len()))
}

// --- Index keys ---

/// Encode an index key as a single frame.
pub fn encode_key(key: &IndexKey) -> Result<Vec<u8>> {
    let body = match key {
        IndexKey::VersionInfo(v) => to_body(v)?,
        IndexKey::ValidationPolicy | IndexKey::SyncdTill => Vec::new(),
        IndexKey::SchemaInfo(fp) => to_body(fp)?,
        IndexKey::EncodingInfo(v, c) => to_body(&EncodingPair {
            version_info: v.clone(),
            compression_type: c.clone(),
        })?,
        IndexKey::EncodingId(id) => to_body(id)?,
    };
    frame(key.kind() as u8, INDEX_WRITE_VERSION, body)
}

/// Decode the key frame at the start of `bytes`.
pub fn decode_key(bytes: &[u8]) -> Result<(IndexKey, usize)> {
    let frame = read_frame(bytes)?;
    let kind = KeyKind::from_u8(frame.kind)
        .ok_or_else(|| StoreError::InvalidFormat(format!("Unknown index key kind: {}", frame.kind)))?;
    let key = match kind {
        KeyKind::VersionInfo => IndexKey::VersionInfo(from_body(frame.body)?),
        KeyKind::ValidationPolicy => IndexKey::ValidationPolicy,
        KeyKind::SyncdTill => IndexKey::SyncdTill,
        KeyKind::SchemaInfo => IndexKey::SchemaInfo(from_body::<Fingerprint>(frame.body)?),
        KeyKind::EncodingInfo => {
            let pair: EncodingPair = from_body(frame.body)?;
            IndexKey::EncodingInfo(pair.version_info, pair.compression_type)
        }
        KeyKind::EncodingId => IndexKey::EncodingId(from_body::<EncodingId>(frame.body)?),
    };
    Ok((key, frame.encoded_len()))
}

// --- Index values ---

/// Encode an index value as a single frame.
pub fn encode_value(value: &IndexValue) -> Result<Vec<u8>> {
    let body = match value {
        IndexValue::LogPosition(p) => to_body(p)?,
        IndexValue::SchemaVersions(versions) => to_body(versions)?,
        IndexValue::EncodingInfo(v, c) => to_body(&EncodingPair {
            version_info: v.clone(),
            compression_type: c.clone(),
        })?,
        IndexValue::EncodingId(id) => to_body(id)?,
    };
    frame(value.kind() as u8, INDEX_WRITE_VERSION, body)
}

/// Decode the value frame at the start of `bytes`.
pub fn decode_value(bytes: &[u8]) -> Result<(IndexValue, usize)> {
    let frame = read_frame(bytes)?;
    let kind = ValueKind::from_u8(frame.kind).ok_or_else(|| {
        StoreError::InvalidFormat(format!("Unknown index value kind: {}", frame.kind))
    })?;
    let value = match kind {
        ValueKind::LogPosition => IndexValue::LogPosition(from_body::<Position>(frame.body)?),
        ValueKind::SchemaVersions => IndexValue::SchemaVersions(from_body(frame.body)?),
        ValueKind::EncodingInfo => {
            let pair: EncodingPair = from_body(frame.body)?;
            IndexValue::EncodingInfo(pair.version_info, pair.compression_type)
        }
        ValueKind::EncodingId => IndexValue::EncodingId(from_body::<EncodingId>(frame.body)?),
    };
    Ok((value, frame.encoded_len()))
}
