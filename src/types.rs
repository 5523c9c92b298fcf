//! Core types for the schema store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, StoreError};

/// Maximum number of user properties on a group.
pub const MAX_GROUP_PROPERTIES: usize = 100;

/// Maximum length in bytes of a group property key or value.
pub const MAX_PROPERTY_LEN: usize = 200;

/// Position in a group's log. Doubles as the etag for conditional appends.
///
/// The etag of a log is the position one past its last record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Position(pub u64);

impl Position {
    pub const START: Position = Position(0);

    pub fn next(self) -> Self {
        Position(self.0 + 1)
    }
}

impl fmt::Debug for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({})", self.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialization format of the schemas in a group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerializationFormat {
    Avro,
    Protobuf,
    Json,
    Any,
    Custom(String),
}

/// Truncated content hash of raw schema bytes.
///
/// Only used to shortlist candidates; two schemas with the same fingerprint
/// are still compared byte for byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    /// First 128 bits of the SHA-256 of `data`.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Fingerprint(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A schema as submitted by a producer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaInfo {
    /// Schema (event type) name; the subgroup key when subgrouping is on.
    pub name: String,
    pub serialization_format: SerializationFormat,
    pub schema_data: Vec<u8>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl SchemaInfo {
    pub fn new(
        name: impl Into<String>,
        serialization_format: SerializationFormat,
        schema_data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            serialization_format,
            schema_data: schema_data.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.schema_data)
    }
}

/// Identity assigned to an accepted schema.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionInfo {
    pub schema_name: String,
    /// Per-name sequence when subgrouping, otherwise equal to `ordinal`.
    pub version: u32,
    /// Group-wide sequence, unique across all schema names.
    pub ordinal: u32,
}

impl VersionInfo {
    pub fn new(schema_name: impl Into<String>, version: u32, ordinal: u32) -> Self {
        Self {
            schema_name: schema_name.into(),
            version,
            ordinal,
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:v{}#{}", self.schema_name, self.version, self.ordinal)
    }
}

/// Small integer identifying a (schema version, codec) pair within a group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodingId(pub u32);

impl fmt::Debug for EncodingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodingId({})", self.0)
    }
}

impl fmt::Display for EncodingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Codec identifier recorded next to an encoding id. The store never runs the codec.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionType {
    None,
    Snappy,
    GZip,
    Custom {
        name: String,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
}

impl CompressionType {
    pub fn custom(name: impl Into<String>) -> Self {
        CompressionType::Custom {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }
}

/// A compatibility policy selection. Evaluation lives outside the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compatibility {
    AllowAny,
    DenyAll,
    Backward,
    BackwardTransitive,
    BackwardTill(VersionInfo),
    Forward,
    ForwardTransitive,
    ForwardTill(VersionInfo),
    Full,
    FullTransitive,
}

/// Validation rules in effect for a group from some log position onwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationRules {
    pub rules: Vec<Compatibility>,
}

impl ValidationRules {
    pub fn new(rules: Vec<Compatibility>) -> Self {
        Self { rules }
    }

    pub fn of(compatibility: Compatibility) -> Self {
        Self {
            rules: vec![compatibility],
        }
    }
}

impl Default for ValidationRules {
    fn default() -> Self {
        ValidationRules::of(Compatibility::FullTransitive)
    }
}

/// Group configuration.
///
/// Everything except `validation_rules` is fixed at creation.
/// `validation_rules` holds the initial policy when creating a group and the
/// current policy when returned from [`crate::Group::properties`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupProperties {
    pub serialization_format: SerializationFormat,
    /// Number versions per schema name instead of group-wide.
    pub subgroup_by_schema_name: bool,
    pub enable_encoding: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub validation_rules: ValidationRules,
}

impl GroupProperties {
    pub fn new(serialization_format: SerializationFormat, validation_rules: ValidationRules) -> Self {
        Self {
            serialization_format,
            subgroup_by_schema_name: false,
            enable_encoding: false,
            properties: BTreeMap::new(),
            validation_rules,
        }
    }

    pub fn with_subgrouping(mut self, subgroup_by_schema_name: bool) -> Self {
        self.subgroup_by_schema_name = subgroup_by_schema_name;
        self
    }

    pub fn with_encoding(mut self, enable_encoding: bool) -> Self {
        self.enable_encoding = enable_encoding;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Reject oversized property maps.
    pub fn validate(&self) -> Result<()> {
        if self.properties.len() > MAX_GROUP_PROPERTIES {
            return Err(StoreError::InvalidArgument(format!(
                "Too many group properties: {} (max {})",
                self.properties.len(),
                MAX_GROUP_PROPERTIES
            )));
        }
        if let Some((key, _)) = self
            .properties
            .iter()
            .find(|(k, v)| k.len() > MAX_PROPERTY_LEN || v.len() > MAX_PROPERTY_LEN)
        {
            return Err(StoreError::InvalidArgument(format!(
                "Group property {} exceeds {} bytes",
                key, MAX_PROPERTY_LEN
            )));
        }
        if self.validation_rules.rules.is_empty() {
            return Err(StoreError::InvalidArgument(
                "Validation rules must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// A stored schema together with its assigned identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaWithVersion {
    pub schema: SchemaInfo,
    pub version: VersionInfo,
}

/// Resolved encoding id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodingInfo {
    pub version_info: VersionInfo,
    pub schema_info: SchemaInfo,
    pub compression: CompressionType,
}

/// One step of a group's schema evolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub schema: SchemaInfo,
    pub version: VersionInfo,
    /// Rules that were in effect when the schema was appended.
    pub rules: ValidationRules,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_content_hash() {
        let a = SchemaInfo::new("T", SerializationFormat::Avro, b"v1".to_vec());
        let b = SchemaInfo::new("U", SerializationFormat::Json, b"v1".to_vec());
        let c = SchemaInfo::new("T", SerializationFormat::Avro, b"v2".to_vec());

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().to_hex().len(), 32);
    }

    #[test]
    fn test_schema_equality_covers_all_fields() {
        let base = SchemaInfo::new("T", SerializationFormat::Avro, b"v1".to_vec());
        assert_eq!(base, base.clone());
        assert_ne!(base, base.clone().with_property("k", "v"));
        assert_ne!(
            base,
            SchemaInfo::new("T", SerializationFormat::Protobuf, b"v1".to_vec())
        );
    }

    #[test]
    fn test_position_navigation() {
        assert_eq!(Position::START.next(), Position(1));
        assert!(Position(3) > Position(2));
    }

    #[test]
    fn test_group_properties_validation() {
        let ok = GroupProperties::new(SerializationFormat::Avro, ValidationRules::default())
            .with_property("owner", "team-a");
        assert!(ok.validate().is_ok());

        let long = GroupProperties::new(SerializationFormat::Avro, ValidationRules::default())
            .with_property("k", "x".repeat(MAX_PROPERTY_LEN + 1));
        assert!(matches!(long.validate(), Err(StoreError::InvalidArgument(_))));

        let empty = GroupProperties::new(SerializationFormat::Avro, ValidationRules::new(vec![]));
        assert!(matches!(empty.validate(), Err(StoreError::InvalidArgument(_))));
    }
}
