//! Folding log records into index updates.

use crate::error::Result;
use crate::records::{Index, IndexKey, IndexValue, Record, ValueKind};
use crate::types::{Position, VersionInfo};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Backoff schedule for index compare-and-set conflicts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2,
            max_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(self.max_backoff)
    }

    /// Run `op`, retrying write conflicts until attempts run out.
    pub(crate) fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_write_conflict() && attempt < self.max_attempts => {
                    warn!(attempt, op = what, error = %e, "index update conflicted, retrying");
                    thread::sleep(backoff);
                    backoff = self.next_backoff(backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// One index mutation derived from a log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Operation {
    /// Insert if absent. Derived facts never change, so the first writer wins.
    Add(IndexKey, IndexValue),
    /// Move a position-valued key forward, never backward.
    Advance(IndexKey, Position),
    /// Union a version into a fingerprint bucket.
    AddToList(IndexKey, VersionInfo),
}

/// Index operations for the record at `position`.
pub(crate) fn operations(position: Position, record: &Record) -> Vec<Operation> {
    match record {
        Record::Schema(r) => vec![
            Operation::Add(
                IndexKey::VersionInfo(r.version_info.clone()),
                IndexValue::LogPosition(position),
            ),
            Operation::AddToList(
                IndexKey::SchemaInfo(r.schema_info.fingerprint()),
                r.version_info.clone(),
            ),
        ],
        Record::Encoding(r) => vec![
            Operation::Add(
                IndexKey::EncodingInfo(r.version_info.clone(), r.compression_type.clone()),
                IndexValue::EncodingId(r.encoding_id),
            ),
            Operation::Add(
                IndexKey::EncodingId(r.encoding_id),
                IndexValue::EncodingInfo(r.version_info.clone(), r.compression_type.clone()),
            ),
        ],
        Record::Validation(_) => vec![Operation::Advance(IndexKey::ValidationPolicy, position)],
    }
}

/// Apply one operation. Every operation is idempotent, so replaying a record
/// that is already folded is harmless.
pub(crate) fn apply(index: &dyn Index, retry: &RetryPolicy, operation: Operation) -> Result<()> {
    match operation {
        Operation::Add(key, value) => index.insert_if_absent(key, value).map(|_| ()),
        Operation::Advance(key, to) => advance(index, retry, key, to),
        Operation::AddToList(key, version) => retry.run("add_to_list", || {
            match index.get_with_version(&key, ValueKind::SchemaVersions)? {
                None => index.compare_and_set(
                    key.clone(),
                    IndexValue::SchemaVersions(vec![version.clone()]),
                    0,
                ),
                Some(entry) => {
                    let mut versions = match entry.value {
                        IndexValue::SchemaVersions(versions) => versions,
                        _ => return Ok(()),
                    };
                    if versions.contains(&version) {
                        return Ok(());
                    }
                    versions.push(version.clone());
                    index.compare_and_set(
                        key.clone(),
                        IndexValue::SchemaVersions(versions),
                        entry.version,
                    )
                }
            }
        }),
    }
}

/// Set a position-valued key to `to` unless it already points at or past it.
pub(crate) fn advance(index: &dyn Index, retry: &RetryPolicy, key: IndexKey, to: Position) -> Result<()> {
    retry.run("advance", || match index.get_with_version(&key, ValueKind::LogPosition)? {
        None => index.compare_and_set(key.clone(), IndexValue::LogPosition(to), 0),
        Some(entry) => match entry.value.as_position() {
            Some(current) if current >= to => Ok(()),
            _ => index.compare_and_set(key.clone(), IndexValue::LogPosition(to), entry.version),
        },
    })
}

/// Fold `record` at `position` into `index`.
pub(crate) fn fold(index: &dyn Index, retry: &RetryPolicy, position: Position, record: &Record) -> Result<()> {
    for operation in operations(position, record) {
        apply(index, retry, operation)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{InMemoryIndex, SchemaRecord, ValidationRecord};
    use crate::types::{Compatibility, SchemaInfo, SerializationFormat, ValidationRules};
    use std::sync::Arc;

    fn schema_record(data: &str, ordinal: u32) -> Record {
        Record::Schema(SchemaRecord {
            schema_info: SchemaInfo::new("T", SerializationFormat::Avro, data.as_bytes().to_vec()),
            version_info: VersionInfo::new("T", ordinal, ordinal),
        })
    }

    #[test]
    fn test_fold_is_idempotent() {
        let index = InMemoryIndex::new();
        let retry = RetryPolicy::default();
        let record = schema_record("v1", 0);

        fold(&index, &retry, Position(1), &record).unwrap();
        let first = index.get_all(&|_| true).unwrap();
        fold(&index, &retry, Position(1), &record).unwrap();
        let second = index.get_all(&|_| true).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        let bucket = index
            .get(
                &IndexKey::SchemaInfo(SchemaInfo::new("T", SerializationFormat::Avro, b"v1".to_vec()).fingerprint()),
                ValueKind::SchemaVersions,
            )
            .unwrap();
        assert_eq!(bucket, Some(IndexValue::SchemaVersions(vec![VersionInfo::new("T", 0, 0)])));
    }

    #[test]
    fn test_same_bytes_share_a_bucket() {
        let index = InMemoryIndex::new();
        let retry = RetryPolicy::default();
        fold(&index, &retry, Position(1), &schema_record("same", 0)).unwrap();
        fold(&index, &retry, Position(2), &schema_record("same", 1)).unwrap();

        let buckets = index
            .get_all(&|k| matches!(k, IndexKey::SchemaInfo(_)))
            .unwrap();
        assert_eq!(buckets.len(), 1);
        match &buckets[0].1 {
            IndexValue::SchemaVersions(versions) => assert_eq!(versions.len(), 2),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_validation_policy_only_moves_forward() {
        let index = InMemoryIndex::new();
        let retry = RetryPolicy::default();
        let record = Record::Validation(ValidationRecord {
            validation_rules: ValidationRules::of(Compatibility::Backward),
        });

        fold(&index, &retry, Position(4), &record).unwrap();
        fold(&index, &retry, Position(2), &record).unwrap();

        assert_eq!(
            index.get(&IndexKey::ValidationPolicy, ValueKind::LogPosition).unwrap(),
            Some(IndexValue::LogPosition(Position(4)))
        );
    }

    #[test]
    fn test_concurrent_bucket_unions_lose_nothing() {
        let index = Arc::new(InMemoryIndex::new());
        let retry = RetryPolicy {
            max_attempts: 1000,
            ..RetryPolicy::default()
        };
        let key = IndexKey::SchemaInfo(SchemaInfo::new("T", SerializationFormat::Avro, b"x".to_vec()).fingerprint());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let index = index.clone();
                let retry = retry.clone();
                let key = key.clone();
                thread::spawn(move || {
                    apply(&*index, &retry, Operation::AddToList(key, VersionInfo::new("T", i, i))).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        match index.get(&key, ValueKind::SchemaVersions).unwrap() {
            Some(IndexValue::SchemaVersions(versions)) => assert_eq!(versions.len(), 8),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_retry_gives_up() {
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_micros(1),
            ..RetryPolicy::default()
        };
        let mut calls = 0;
        let result: Result<()> = retry.run("test", || {
            calls += 1;
            Err(crate::error::StoreError::WriteConflict("always".into()))
        });
        assert!(result.unwrap_err().is_write_conflict());
        assert_eq!(calls, 3);
    }
}
