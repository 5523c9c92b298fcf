//! Versioned key/value index derived from a group's log.

use super::codec::{decode_key, decode_value, encode_key, encode_value};
use super::{IndexKey, IndexValue, ValueKind};
use crate::error::{Result, StoreError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A value together with the version of its index entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    /// 0 on first insert, incremented by every successful compare-and-set.
    pub version: u64,
}

/// Key/value table with per-key optimistic concurrency.
pub trait Index: Send + Sync {
    /// Value under `key`, which must be of kind `expected`.
    fn get(&self, key: &IndexKey, expected: ValueKind) -> Result<Option<IndexValue>> {
        Ok(self.get_with_version(key, expected)?.map(|v| v.value))
    }

    fn get_with_version(
        &self,
        key: &IndexKey,
        expected: ValueKind,
    ) -> Result<Option<Versioned<IndexValue>>>;

    /// Every entry whose key matches `filter`, in no particular order.
    fn get_all(&self, filter: &dyn Fn(&IndexKey) -> bool) -> Result<Vec<(IndexKey, IndexValue)>>;

    /// Store `value` at version 0 unless the key already exists. Returns
    /// whether this call inserted it.
    fn insert_if_absent(&self, key: IndexKey, value: IndexValue) -> Result<bool>;

    /// Replace the entry iff its version is `expected_version`; the stored
    /// version becomes `expected_version + 1`. An absent key only accepts
    /// `expected_version == 0`.
    fn compare_and_set(&self, key: IndexKey, value: IndexValue, expected_version: u64) -> Result<()>;

    /// Drop every entry.
    fn clear(&self) -> Result<()>;

    /// Whether enough updates piled up that the owner should `flush`.
    fn snapshot_due(&self) -> bool {
        false
    }

    /// Persist the current contents, if the backend persists anything.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn check_value_kind(key: &IndexKey, value: &IndexValue) -> Result<()> {
    if key.value_kind() != value.kind() {
        return Err(StoreError::InvalidArgument(format!(
            "{:?} cannot hold a {:?} value",
            key,
            value.kind()
        )));
    }
    Ok(())
}

type Entries = HashMap<IndexKey, Versioned<IndexValue>>;

/// Index held in memory.
#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<Entries>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries(entries: Entries) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Index for InMemoryIndex {
    fn get_with_version(
        &self,
        key: &IndexKey,
        expected: ValueKind,
    ) -> Result<Option<Versioned<IndexValue>>> {
        match self.entries.read().get(key) {
            Some(entry) if entry.value.kind() != expected => Err(StoreError::InvalidArgument(format!(
                "{:?} holds a {:?}, expected {:?}",
                key,
                entry.value.kind(),
                expected
            ))),
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    fn get_all(&self, filter: &dyn Fn(&IndexKey) -> bool) -> Result<Vec<(IndexKey, IndexValue)>> {
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(k, _)| filter(k))
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect())
    }

    fn insert_if_absent(&self, key: IndexKey, value: IndexValue) -> Result<bool> {
        check_value_kind(&key, &value)?;
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(key, Versioned { value, version: 0 });
        Ok(true)
    }

    fn compare_and_set(&self, key: IndexKey, value: IndexValue, expected_version: u64) -> Result<()> {
        check_value_kind(&key, &value)?;
        let mut entries = self.entries.write();
        let current = entries.get(&key).map(|e| e.version);
        let matches = match current {
            Some(version) => version == expected_version,
            None => expected_version == 0,
        };
        if !matches {
            return Err(StoreError::WriteConflict(format!(
                "{:?} is at version {:?}, expected {}",
                key, current, expected_version
            )));
        }
        entries.insert(
            key,
            Versioned {
                value,
                version: expected_version + 1,
            },
        );
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}

/// Magic bytes for index snapshot files.
const INDEX_MAGIC: &[u8; 4] = b"SIX\0";

/// Current index snapshot format version.
const INDEX_VERSION: u8 = 1;

const INDEX_HEADER_SIZE: usize = 5;

/// Index kept in memory and snapshotted to a file.
///
/// Snapshots are written on [`Index::flush`]. After `snapshot_interval`
/// successful updates [`Index::snapshot_due`] turns true; the owning group
/// then fsyncs its log and flushes, so a snapshot never refers to log
/// entries that are not durable.
///
/// Because every entry is derived from the log, a lost or damaged snapshot
/// only costs a replay: the index starts empty and the group folds the log
/// again.
pub struct FileIndex {
    path: PathBuf,
    inner: InMemoryIndex,
    updates_since_snapshot: Mutex<u64>,
    /// Ask for a snapshot every N updates; 0 never asks.
    snapshot_interval: u64,
}

impl FileIndex {
    pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 256;

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_snapshot_interval(path, Self::DEFAULT_SNAPSHOT_INTERVAL)
    }

    pub fn open_with_snapshot_interval(path: impl AsRef<Path>, snapshot_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            match Self::load(&path) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "discarding unreadable index snapshot, it will be rebuilt from the log"
                    );
                    Entries::new()
                }
            }
        } else {
            Entries::new()
        };

        debug!(path = %path.display(), entries = entries.len(), "opened group index");

        Ok(Self {
            path,
            inner: InMemoryIndex::with_entries(entries),
            updates_since_snapshot: Mutex::new(0),
            snapshot_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Write every entry to the snapshot file.
    ///
    /// Entries are serialized under one read lock, so the snapshot is a
    /// single consistent cut of the index.
    pub fn save(&self) -> Result<()> {
        let mut body = Vec::new();
        {
            let entries = self.inner.entries.read();
            body.extend_from_slice(&(entries.len() as u64).to_le_bytes());
            for (key, entry) in entries.iter() {
                body.extend_from_slice(&entry.version.to_le_bytes());
                body.extend_from_slice(&encode_key(key)?);
                body.extend_from_slice(&encode_value(&entry.value)?);
            }
        }
        let checksum = crc32fast::hash(&body);

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(INDEX_MAGIC)?;
            file.write_all(&[INDEX_VERSION])?;
            file.write_all(&body)?;
            file.write_all(&checksum.to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        *self.updates_since_snapshot.lock() = 0;
        Ok(())
    }

    fn load(path: &Path) -> Result<Entries> {
        let contents = fs::read(path)?;

        if contents.len() < INDEX_HEADER_SIZE + 4 || &contents[0..4] != INDEX_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid index magic".into()));
        }
        if contents[4] != INDEX_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported index version: {}",
                contents[4]
            )));
        }

        let (body, trailer) = contents[INDEX_HEADER_SIZE..].split_at(contents.len() - INDEX_HEADER_SIZE - 4);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(trailer);
        let stored = u32::from_le_bytes(stored);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let mut cursor = Cursor { bytes: body, pos: 0 };
        let count = cursor.u64()?;
        let mut entries = Entries::with_capacity(count.min(1 << 16) as usize);
        for _ in 0..count {
            let version = cursor.u64()?;
            let (key, used) = decode_key(cursor.rest())?;
            cursor.pos += used;
            let (value, used) = decode_value(cursor.rest())?;
            cursor.pos += used;
            check_value_kind(&key, &value)?;
            entries.insert(key, Versioned { value, version });
        }
        if cursor.pos != body.len() {
            return Err(StoreError::Corruption("Trailing bytes in index snapshot".into()));
        }
        Ok(entries)
    }

    fn updated(&self) {
        *self.updates_since_snapshot.lock() += 1;
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u64(&mut self) -> Result<u64> {
        let end = self.pos + 8;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| StoreError::Corruption("Truncated index snapshot".into()))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(slice);
        self.pos = end;
        Ok(u64::from_le_bytes(buf))
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

impl Index for FileIndex {
    fn get_with_version(
        &self,
        key: &IndexKey,
        expected: ValueKind,
    ) -> Result<Option<Versioned<IndexValue>>> {
        self.inner.get_with_version(key, expected)
    }

    fn get_all(&self, filter: &dyn Fn(&IndexKey) -> bool) -> Result<Vec<(IndexKey, IndexValue)>> {
        self.inner.get_all(filter)
    }

    fn insert_if_absent(&self, key: IndexKey, value: IndexValue) -> Result<bool> {
        let inserted = self.inner.insert_if_absent(key, value)?;
        if inserted {
            self.updated();
        }
        Ok(inserted)
    }

    fn compare_and_set(&self, key: IndexKey, value: IndexValue, expected_version: u64) -> Result<()> {
        self.inner.compare_and_set(key, value, expected_version)?;
        self.updated();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()?;
        self.updated();
        Ok(())
    }

    fn snapshot_due(&self) -> bool {
        self.snapshot_interval > 0 && *self.updates_since_snapshot.lock() >= self.snapshot_interval
    }

    fn flush(&self) -> Result<()> {
        self.save()
    }
}
