//! Append-only group log.
//!
//! The log is the only source of truth for a group. Appends are conditional
//! on the caller's etag, which is how concurrent writers to one group are
//! ordered: exactly one append wins per tail position.

use super::codec::{decode_record, encode_record, read_frame, FRAME_HEADER_LEN};
use super::{Record, RecordKind};
use crate::error::{Result, StoreError};
use crate::types::Position;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Append-only, position-addressed record stream.
pub trait Log: Send + Sync {
    /// Position one past the last record.
    fn current_etag(&self) -> Result<Position>;

    /// Append `record` iff `expected` is the current tail. `None` only
    /// succeeds on an empty log. Returns the position written.
    fn append(&self, record: Record, expected: Option<Position>) -> Result<Position>;

    /// Read the record at `position`, failing if it is not of kind `expected`.
    fn read_at(&self, position: Position, expected: RecordKind) -> Result<Record>;

    /// All records from `from` (inclusive, `None` = start) to the tail.
    fn read_from(&self, from: Option<Position>) -> Result<Vec<(Position, Record)>>;

    /// Make appended records durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn check_kind(record: Record, position: Position, expected: RecordKind) -> Result<Record> {
    if record.kind() == expected {
        Ok(record)
    } else {
        Err(StoreError::InvalidArgument(format!(
            "Record at {} is a {}, expected {}",
            position,
            record.kind(),
            expected
        )))
    }
}

fn stale_etag(expected: Option<Position>, tail: Position) -> StoreError {
    StoreError::WriteConflict(format!(
        "Log append expected tail {:?} but tail is {:?}",
        expected, tail
    ))
}

/// Log held in memory.
#[derive(Default)]
pub struct InMemoryLog {
    records: RwLock<Vec<Record>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Log for InMemoryLog {
    fn current_etag(&self) -> Result<Position> {
        Ok(Position(self.records.read().len() as u64))
    }

    fn append(&self, record: Record, expected: Option<Position>) -> Result<Position> {
        let mut records = self.records.write();
        let tail = Position(records.len() as u64);
        if expected.unwrap_or(Position::START) != tail {
            return Err(stale_etag(expected, tail));
        }
        records.push(record);
        Ok(tail)
    }

    fn read_at(&self, position: Position, expected: RecordKind) -> Result<Record> {
        let record = self
            .records
            .read()
            .get(position.0 as usize)
            .cloned()
            .ok_or_else(|| StoreError::DataNotFound(format!("No record at position {}", position)))?;
        check_kind(record, position, expected)
    }

    fn read_from(&self, from: Option<Position>) -> Result<Vec<(Position, Record)>> {
        let start = from.unwrap_or(Position::START).0 as usize;
        let records = self.records.read();
        Ok(records
            .iter()
            .enumerate()
            .skip(start)
            .map(|(i, r)| (Position(i as u64), r.clone()))
            .collect())
    }
}

/// Magic bytes for a group log file.
const LOG_MAGIC: &[u8; 4] = b"SRL\0";

/// Current log file format version.
const LOG_VERSION: u8 = 1;

/// Header size (magic + version).
const LOG_HEADER_SIZE: u64 = 5;

/// CRC32 trailer after every entry.
const CHECKSUM_SIZE: usize = 4;

/// Byte layout of the entries currently in the file.
struct Layout {
    /// File offset of each entry; entry `i` lives at position `i`.
    offsets: Vec<u64>,
    /// Offset one past the last entry.
    end: u64,
}

impl Layout {
    fn span(&self, index: usize) -> Option<(u64, u64)> {
        let start = *self.offsets.get(index)?;
        let stop = self.offsets.get(index + 1).copied().unwrap_or(self.end);
        Some((start, stop))
    }
}

/// Log persisted to a single append-only file.
///
/// Each entry is a record frame followed by a CRC32 of the frame. A torn
/// tail left by a crash is cut off when the file is reopened; damage anywhere
/// else fails the open.
pub struct FileLog {
    path: PathBuf,

    /// File handle; also serializes appends.
    file: Mutex<File>,

    layout: RwLock<Layout>,

    /// Number of appends since the last fsync.
    writes_since_sync: Mutex<u64>,

    /// Fsync every N appends.
    sync_interval: u64,
}

impl FileLog {
    /// Fsync on every append.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 1;

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log, fsyncing every `sync_interval` appends (0 is treated as 1).
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let layout = if file.metadata()?.len() == 0 {
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            Layout {
                offsets: Vec::new(),
                end: LOG_HEADER_SIZE,
            }
        } else {
            Self::scan(&path, &mut file)?
        };

        debug!(path = %path.display(), records = layout.offsets.len(), "opened group log");

        Ok(Self {
            path,
            file: Mutex::new(file),
            layout: RwLock::new(layout),
            writes_since_sync: Mutex::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify the header and locate every intact entry.
    ///
    /// A damaged final entry is a torn write and is cut off. Damage followed
    /// by further entries is reported as corruption and the file is left alone.
    fn scan(path: &Path, file: &mut File) -> Result<Layout> {
        file.seek(SeekFrom::Start(0))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        if contents.len() < LOG_HEADER_SIZE as usize || &contents[0..4] != LOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid log magic".into()));
        }
        if contents[4] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported log version: {}",
                contents[4]
            )));
        }

        let mut offsets = Vec::new();
        let mut cursor = LOG_HEADER_SIZE as usize;
        while cursor < contents.len() {
            match Self::entry_len(&contents[cursor..]) {
                Ok(len) => {
                    offsets.push(cursor as u64);
                    cursor += len;
                }
                Err(e) if Self::reaches_end(&contents[cursor..]) => {
                    warn!(
                        path = %path.display(),
                        offset = cursor,
                        error = %e,
                        "truncating torn log tail"
                    );
                    file.set_len(cursor as u64)?;
                    file.sync_all()?;
                    break;
                }
                Err(e) => {
                    return Err(StoreError::Corruption(format!(
                        "Damaged log entry at offset {} of {} (position {}): {}",
                        cursor,
                        path.display(),
                        offsets.len(),
                        e
                    )));
                }
            }
        }

        Ok(Layout {
            offsets,
            end: cursor as u64,
        })
    }

    /// Whether the entry starting at `bytes` claims to extend to or past EOF.
    fn reaches_end(bytes: &[u8]) -> bool {
        if bytes.len() < FRAME_HEADER_LEN {
            return true;
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[2..6]);
        let declared = FRAME_HEADER_LEN as u64 + u64::from(u32::from_le_bytes(len)) + CHECKSUM_SIZE as u64;
        declared >= bytes.len() as u64
    }

    /// Length of the checksummed entry at the start of `bytes`.
    fn entry_len(bytes: &[u8]) -> Result<usize> {
        let frame_len = read_frame(bytes)?.encoded_len();
        if bytes.len() < frame_len + CHECKSUM_SIZE {
            return Err(StoreError::Corruption("Missing entry checksum".into()));
        }
        Self::verify_checksum(&bytes[..frame_len + CHECKSUM_SIZE])?;
        Ok(frame_len + CHECKSUM_SIZE)
    }

    fn verify_checksum(entry: &[u8]) -> Result<()> {
        let (frame, trailer) = entry.split_at(entry.len() - CHECKSUM_SIZE);
        let mut stored = [0u8; CHECKSUM_SIZE];
        stored.copy_from_slice(trailer);
        let stored = u32::from_le_bytes(stored);
        let computed = crc32fast::hash(frame);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }
        Ok(())
    }

    fn read_span(&self, start: u64, stop: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (stop - start) as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn decode_entry(entry: &[u8]) -> Result<Record> {
        if entry.len() < CHECKSUM_SIZE {
            return Err(StoreError::Corruption("Entry shorter than checksum".into()));
        }
        Self::verify_checksum(entry)?;
        let (record, _) = decode_record(&entry[..entry.len() - CHECKSUM_SIZE])?;
        Ok(record)
    }
}

impl Log for FileLog {
    fn current_etag(&self) -> Result<Position> {
        Ok(Position(self.layout.read().offsets.len() as u64))
    }

    fn append(&self, record: Record, expected: Option<Position>) -> Result<Position> {
        let mut frame = encode_record(&record)?;
        let checksum = crc32fast::hash(&frame);
        frame.extend_from_slice(&checksum.to_le_bytes());

        let mut file = self.file.lock();

        let (tail, offset) = {
            let layout = self.layout.read();
            (Position(layout.offsets.len() as u64), layout.end)
        };
        if expected.unwrap_or(Position::START) != tail {
            return Err(stale_etag(expected, tail));
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&frame)?;

        let mut writes = self.writes_since_sync.lock();
        *writes += 1;
        if *writes >= self.sync_interval {
            file.sync_data()?;
            *writes = 0;
        }

        let mut layout = self.layout.write();
        layout.offsets.push(offset);
        layout.end = offset + frame.len() as u64;

        Ok(tail)
    }

    fn read_at(&self, position: Position, expected: RecordKind) -> Result<Record> {
        let span = self.layout.read().span(position.0 as usize);
        let (start, stop) =
            span.ok_or_else(|| StoreError::DataNotFound(format!("No record at position {}", position)))?;
        let entry = self.read_span(start, stop)?;
        check_kind(Self::decode_entry(&entry)?, position, expected)
    }

    fn read_from(&self, from: Option<Position>) -> Result<Vec<(Position, Record)>> {
        let first = from.unwrap_or(Position::START).0 as usize;
        let (spans, start, stop) = {
            let layout = self.layout.read();
            if first >= layout.offsets.len() {
                return Ok(Vec::new());
            }
            let spans: Vec<(u64, u64)> = (first..layout.offsets.len())
                .filter_map(|i| layout.span(i))
                .collect();
            (spans, layout.offsets[first], layout.end)
        };

        let bytes = self.read_span(start, stop)?;
        spans
            .iter()
            .enumerate()
            .map(|(i, (s, e))| {
                let entry = &bytes[(s - start) as usize..(e - start) as usize];
                Ok((Position((first + i) as u64), Self::decode_entry(entry)?))
            })
            .collect()
    }

    fn flush(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }
}

/// LRU read cache in front of another log.
///
/// Records never change once written, so cached entries never go stale.
pub struct CachedLog<L> {
    inner: L,
    cache: Mutex<LruCache<Position, Record>>,
}

impl<L: Log> CachedLog<L> {
    pub fn new(inner: L, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Number of cached records.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl<L: Log> Log for CachedLog<L> {
    fn current_etag(&self) -> Result<Position> {
        self.inner.current_etag()
    }

    fn append(&self, record: Record, expected: Option<Position>) -> Result<Position> {
        let position = self.inner.append(record.clone(), expected)?;
        self.cache.lock().put(position, record);
        Ok(position)
    }

    fn read_at(&self, position: Position, expected: RecordKind) -> Result<Record> {
        if let Some(record) = self.cache.lock().get(&position).cloned() {
            return check_kind(record, position, expected);
        }
        let record = self.inner.read_at(position, expected)?;
        self.cache.lock().put(position, record.clone());
        Ok(record)
    }

    fn read_from(&self, from: Option<Position>) -> Result<Vec<(Position, Record)>> {
        self.inner.read_from(from)
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}
