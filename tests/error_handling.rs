//! Error handling and edge case tests.

use schema_store::{
    Compatibility, CompressionType, GroupProperties, SchemaInfo, SchemaStore, SerializationFormat,
    StoreConfig, StoreError, ValidationRules, VersionInfo, MAX_GROUP_PROPERTIES, MAX_PROPERTY_LEN,
};
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> SchemaStore {
    let store = SchemaStore::create(StoreConfig {
        path: dir.path().join("store"),
        ..StoreConfig::default()
    })
    .unwrap();
    store.create_namespace("ns").unwrap();
    store
}

fn props() -> GroupProperties {
    GroupProperties::new(SerializationFormat::Avro, ValidationRules::default())
}

fn avro(name: &str, data: &str) -> SchemaInfo {
    SchemaInfo::new(name, SerializationFormat::Avro, data.as_bytes().to_vec())
}

// --- Lookup Errors ---

#[test]
fn test_unknown_namespace_and_group() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    assert!(matches!(
        store.list_groups("missing"),
        Err(StoreError::DataNotFound(_))
    ));
    assert!(matches!(
        store.current_etag("ns", "missing"),
        Err(StoreError::DataNotFound(_))
    ));
    assert!(matches!(
        store.delete_group("ns", "missing"),
        Err(StoreError::DataNotFound(_))
    ));
    assert!(matches!(
        store.remove_namespace("missing"),
        Err(StoreError::DataNotFound(_))
    ));
}

#[test]
fn test_unknown_version() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.create_group("ns", "g", props()).unwrap();

    let result = store.get_schema("ns", "g", &VersionInfo::new("T", 0, 0));
    assert!(matches!(result, Err(StoreError::DataNotFound(_))));

    let result = store.list_schemas_from("ns", "g", &VersionInfo::new("T", 0, 0));
    assert!(matches!(result, Err(StoreError::DataNotFound(_))));

    assert_eq!(store.latest_schema("ns", "g").unwrap(), None);
}

#[test]
fn test_version_fields_must_all_match() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.create_group("ns", "g", props()).unwrap();

    let etag = store.current_etag("ns", "g").unwrap();
    store.add_schema("ns", "g", avro("T", "v1"), etag).unwrap();

    let wrong_ordinal = VersionInfo::new("T", 0, 5);
    assert!(store
        .get_schema("ns", "g", &wrong_ordinal)
        .unwrap_err()
        .is_not_found());
}

// --- Write Conflicts ---

#[test]
fn test_stale_etag() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.create_group("ns", "g", props()).unwrap();

    let etag = store.current_etag("ns", "g").unwrap();
    store.add_schema("ns", "g", avro("T", "v1"), etag).unwrap();

    let result = store.add_schema("ns", "g", avro("T", "v2"), etag);
    assert!(matches!(result, Err(StoreError::WriteConflict(_))));

    let result = store.update_validation_policy(
        "ns",
        "g",
        ValidationRules::of(Compatibility::AllowAny),
        etag,
    );
    assert!(matches!(result, Err(StoreError::WriteConflict(_))));

    // The failed writes left nothing behind.
    assert_eq!(store.list_schemas("ns", "g").unwrap().len(), 1);
    assert_eq!(
        store.current_validation_rules("ns", "g").unwrap(),
        ValidationRules::default()
    );
}

#[test]
fn test_future_etag_is_a_conflict() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.create_group("ns", "g", props()).unwrap();

    let etag = store.current_etag("ns", "g").unwrap();
    let ahead = schema_store::Position(etag.0 + 10);
    assert!(store
        .add_schema("ns", "g", avro("T", "v1"), ahead)
        .unwrap_err()
        .is_write_conflict());
}

// --- Illegal State ---

#[test]
fn test_subgroup_misuse() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.create_group("ns", "flat", props()).unwrap();
    store
        .create_group("ns", "split", props().with_subgrouping(true))
        .unwrap();

    let etag = store.current_etag("ns", "flat").unwrap();
    assert!(matches!(
        store.add_schema_to_subgroup("ns", "flat", avro("T", "v1"), etag),
        Err(StoreError::IllegalState(_))
    ));
    assert!(matches!(
        store.get_subgroups("ns", "flat"),
        Err(StoreError::IllegalState(_))
    ));

    let etag = store.current_etag("ns", "split").unwrap();
    assert!(matches!(
        store.add_schema("ns", "split", avro("T", "v1"), etag),
        Err(StoreError::IllegalState(_))
    ));
}

#[test]
fn test_encoding_disabled() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.create_group("ns", "g", props()).unwrap();
    let etag = store.current_etag("ns", "g").unwrap();
    let version = store.add_schema("ns", "g", avro("T", "v1"), etag).unwrap();

    let result = store.get_or_create_encoding_id("ns", "g", &version, CompressionType::Snappy);
    assert!(matches!(result, Err(StoreError::IllegalState(_))));
}

#[test]
fn test_encoding_for_missing_version() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store
        .create_group("ns", "g", props().with_encoding(true))
        .unwrap();

    let result =
        store.get_or_create_encoding_id("ns", "g", &VersionInfo::new("T", 0, 0), CompressionType::None);
    assert!(matches!(result, Err(StoreError::DataNotFound(_))));
    assert!(store.list_compressions("ns", "g").unwrap().is_empty());
}

// --- Invalid Arguments ---

#[test]
fn test_group_property_limits() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    let mut too_many = props();
    for i in 0..=MAX_GROUP_PROPERTIES {
        too_many = too_many.with_property(format!("k{}", i), "v");
    }
    assert!(matches!(
        store.create_group("ns", "g", too_many),
        Err(StoreError::InvalidArgument(_))
    ));

    let long_key = props().with_property("k".repeat(MAX_PROPERTY_LEN + 1), "v");
    assert!(matches!(
        store.create_group("ns", "g", long_key),
        Err(StoreError::InvalidArgument(_))
    ));

    assert!(store.list_groups("ns").unwrap().is_empty());
}

#[test]
fn test_empty_rules_rejected() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);
    store.create_group("ns", "g", props()).unwrap();

    let etag = store.current_etag("ns", "g").unwrap();
    let result = store.update_validation_policy("ns", "g", ValidationRules::new(vec![]), etag);
    assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
}

#[test]
fn test_invalid_names() {
    let dir = TempDir::new().unwrap();
    let store = test_store(&dir);

    assert!(matches!(
        store.create_namespace("../outside"),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.create_group("ns", "a b", props()),
        Err(StoreError::InvalidArgument(_))
    ));
}

// --- Store Files ---

#[test]
fn test_bad_manifest() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("MANIFEST"), b"XXXX\x01").unwrap();

    let result = SchemaStore::open(StoreConfig {
        path,
        ..StoreConfig::default()
    });
    assert!(matches!(result, Err(StoreError::InvalidFormat(_))));
}
