//! # Schema Store
//!
//! Storage core for a schema registry. Schemas are organized in groups; each
//! group durably records the evolution of its schemas, hands out stable
//! versions and encoding ids, and remembers which compatibility rules were
//! in force at every point.
//!
//! ## Core Concepts
//!
//! - **Log**: per-group append-only record stream, the only source of truth
//! - **Index**: per-group key/value table derived from the log, rebuildable at any time
//! - **Etag**: log position used as the precondition for every write
//! - **Sync**: folding unseen log records into the index
//!
//! ## Example
//!
//! ```ignore
//! use schema_store::{GroupProperties, SchemaInfo, SchemaStore, SerializationFormat, StoreConfig, ValidationRules};
//!
//! let store = SchemaStore::open_or_create(StoreConfig {
//!     path: "./my-registry".into(),
//!     ..Default::default()
//! })?;
//!
//! store.create_namespace("payments")?;
//! store.create_group(
//!     "payments",
//!     "orders",
//!     GroupProperties::new(SerializationFormat::Avro, ValidationRules::default()),
//! )?;
//!
//! let etag = store.current_etag("payments", "orders")?;
//! let schema = SchemaInfo::new("Order", SerializationFormat::Avro, br#"{"type":"record"}"#.to_vec());
//! let version = store.add_schema("payments", "orders", schema, etag)?;
//! ```

pub mod error;
pub mod group;
pub mod namespace;
pub mod records;
pub mod store;
pub mod types;
pub mod validation;

// Re-exports
pub use error::{Result, StoreError};
pub use group::{Group, GroupOptions, RetryPolicy};
pub use namespace::{FileStorage, GroupStorage, InMemoryStorage, Namespace, Namespaces};
pub use records::{CachedLog, FileIndex, FileLog, InMemoryIndex, InMemoryLog, Index, Log};
pub use store::{Backend, SchemaStore, StoreConfig};
pub use types::*;
pub use validation::{is_compatible, prior_schemas, SchemaValidator};
