//! Property tests for version allocation and index rebuildability.

use proptest::prelude::*;
use schema_store::records::{IndexKey, IndexValue};
use schema_store::{
    CompressionType, Group, GroupOptions, GroupProperties, InMemoryIndex, InMemoryLog, Index, Log,
    SchemaInfo, SerializationFormat, ValidationRules, VersionInfo,
};
use std::collections::HashMap;
use std::sync::Arc;

fn open(log: Arc<dyn Log>, subgrouped: bool) -> Group {
    open_with(log, Arc::new(InMemoryIndex::new()), subgrouped)
}

fn open_with(log: Arc<dyn Log>, index: Arc<dyn Index>, subgrouped: bool) -> Group {
    let props = GroupProperties::new(SerializationFormat::Json, ValidationRules::default())
        .with_subgrouping(subgrouped)
        .with_encoding(true);
    Group::open("g", props, log, index, GroupOptions::default()).unwrap()
}

/// Every entry with buckets put in ordinal order, sorted by key.
fn entries(index: &InMemoryIndex) -> Vec<(IndexKey, IndexValue)> {
    let mut entries: Vec<(IndexKey, IndexValue)> = index
        .get_all(&|_| true)
        .unwrap()
        .into_iter()
        .map(|(key, value)| match value {
            IndexValue::SchemaVersions(mut versions) => {
                versions.sort_by_key(|v| v.ordinal);
                (key, IndexValue::SchemaVersions(versions))
            }
            other => (key, other),
        })
        .collect();
    entries.sort_by_key(|(key, _)| format!("{:?}", key));
    entries
}

fn add(group: &Group, subgrouped: bool, schema: SchemaInfo) -> VersionInfo {
    let etag = group.current_etag().unwrap();
    if subgrouped {
        group.add_schema_to_subgroup(schema, etag).unwrap()
    } else {
        group.add_schema(schema, etag).unwrap()
    }
}

proptest! {
    #[test]
    fn ordinals_and_versions_are_gapless(
        names in prop::collection::vec(prop::sample::select(vec!["A", "B", "C"]), 1..30),
        subgrouped in any::<bool>(),
    ) {
        let group = open(Arc::new(InMemoryLog::new()), subgrouped);
        let mut per_name: HashMap<&str, u32> = HashMap::new();

        for (i, name) in names.iter().enumerate() {
            let schema = SchemaInfo::new(*name, SerializationFormat::Json, format!("{}", i).into_bytes());
            let version = add(&group, subgrouped, schema);

            prop_assert_eq!(version.ordinal, i as u32);
            let next = per_name.entry(*name).or_insert(0);
            if subgrouped {
                prop_assert_eq!(version.version, *next);
            } else {
                prop_assert_eq!(version.version, version.ordinal);
            }
            *next += 1;
        }
    }

    #[test]
    fn fresh_index_replays_to_same_answers(
        data in prop::collection::vec(0u8..6, 1..20),
        codecs in prop::collection::vec(0usize..3, 0..10),
    ) {
        let log: Arc<dyn Log> = Arc::new(InMemoryLog::new());
        let writer_index = Arc::new(InMemoryIndex::new());
        let writer = open_with(log.clone(), writer_index.clone(), false);

        // Duplicate bytes are allowed; each add is a new version.
        let mut first: HashMap<u8, VersionInfo> = HashMap::new();
        let versions: Vec<VersionInfo> = data
            .iter()
            .map(|d| {
                let version = add(&writer, false, SchemaInfo::new("T", SerializationFormat::Json, vec![*d]));
                first.entry(*d).or_insert_with(|| version.clone());
                version
            })
            .collect();

        let compressions = [CompressionType::None, CompressionType::GZip, CompressionType::Snappy];
        let mut ids = Vec::new();
        for (i, c) in codecs.iter().enumerate() {
            let version = &versions[i % versions.len()];
            let compression = compressions[*c].clone();
            let id = writer.get_or_create_encoding_id(version, compression.clone()).unwrap();
            ids.push((version.clone(), compression, id));
        }

        let rebuilt_index = Arc::new(InMemoryIndex::new());
        let rebuilt = open_with(log, rebuilt_index.clone(), false);
        prop_assert_eq!(rebuilt.sync().unwrap(), writer.sync().unwrap());
        prop_assert_eq!(entries(&rebuilt_index), entries(&writer_index));

        prop_assert_eq!(
            rebuilt.list_schemas().unwrap(),
            writer.list_schemas().unwrap()
        );
        for (version, compression, id) in ids {
            prop_assert_eq!(rebuilt.get_or_create_encoding_id(&version, compression).unwrap(), id);
        }
        for (d, version) in &first {
            let schema = SchemaInfo::new("T", SerializationFormat::Json, vec![*d]);
            prop_assert_eq!(&rebuilt.get_version(&schema).unwrap(), version);
        }
    }
}
