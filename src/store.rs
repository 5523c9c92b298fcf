//! Main SchemaStore struct tying namespaces, groups and storage together.

use crate::error::{Result, StoreError};
use crate::group::{Group, GroupOptions, RetryPolicy};
use crate::namespace::{FileStorage, GroupStorage, InMemoryStorage, Namespaces};
use crate::records::FileLog;
use crate::types::{
    CompressionType, EncodingId, EncodingInfo, GroupProperties, HistoryEntry, Position, SchemaInfo,
    SchemaWithVersion, ValidationRules, VersionInfo,
};
use crate::validation::SchemaValidator;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Where group logs and indexes live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Nothing is persisted; `path` is ignored.
    InMemory,
    /// One directory per group under `path`.
    File,
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    pub backend: Backend,

    /// Records cached per group log (0 disables the cache).
    pub log_cache_size: usize,

    /// Fsync group logs every N appends.
    pub log_sync_interval: u64,

    /// Snapshot group indexes every N updates (0 = only on checkpoint).
    pub index_snapshot_interval: u64,

    /// Backoff for index compare-and-set conflicts.
    pub index_retry: RetryPolicy,

    /// Attempts for `get_or_create_encoding_id` when it loses an append race.
    pub encoding_id_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./schema-store"),
            create_if_missing: true,
            backend: Backend::File,
            log_cache_size: 1000,
            log_sync_interval: FileLog::DEFAULT_SYNC_INTERVAL,
            index_snapshot_interval: 256,
            index_retry: RetryPolicy::default(),
            encoding_id_attempts: 8,
        }
    }
}

impl StoreConfig {
    /// Volatile store, mostly for tests.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::InMemory,
            ..Self::default()
        }
    }

    fn group_options(&self) -> GroupOptions {
        GroupOptions {
            index_retry: self.index_retry.clone(),
            encoding_id_attempts: self.encoding_id_attempts,
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"SRS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// The schema store.
///
/// Every operation is addressed by `(namespace, group)`; unknown names fail
/// with [`StoreError::DataNotFound`]. Group handles from [`SchemaStore::group`]
/// expose the same operations without the lookup.
pub struct SchemaStore {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access to a file-backed store.
    _lock_file: Option<File>,

    namespaces: Namespaces,
}

impl SchemaStore {
    /// Open a store, creating it if configured to.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.backend == Backend::InMemory {
            return Self::create(config);
        }
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        if config.backend == Backend::File {
            fs::create_dir_all(&config.path)?;
            Self::write_manifest(&config.path)?;
        }
        Self::start(config)
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if config.backend == Backend::File {
            Self::verify_manifest(&config.path)?;
        }
        Self::start(config)
    }

    fn start(config: StoreConfig) -> Result<Self> {
        let (lock_file, storage): (Option<File>, Arc<dyn GroupStorage>) = match config.backend {
            Backend::InMemory => (None, Arc::new(InMemoryStorage::new())),
            Backend::File => (
                Some(Self::acquire_lock(&config.path)?),
                Arc::new(FileStorage::new(
                    config.path.clone(),
                    config.log_cache_size,
                    config.log_sync_interval,
                    config.index_snapshot_interval,
                )),
            ),
        };
        let namespaces = Namespaces::open(storage, config.group_options())?;

        info!(
            path = %config.path.display(),
            backend = ?config.backend,
            namespaces = namespaces.get_namespaces().len(),
            "opened schema store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            namespaces,
        })
    }

    // --- Namespaces and groups ---

    pub fn create_namespace(&self, namespace: &str) -> Result<bool> {
        self.namespaces.add_new_namespace(namespace)
    }

    pub fn remove_namespace(&self, namespace: &str) -> Result<()> {
        self.namespaces.remove_namespace(namespace)
    }

    pub fn list_namespaces(&self) -> Vec<String> {
        self.namespaces.get_namespaces()
    }

    /// Create a group. Returns `false` if one with this name already exists.
    pub fn create_group(&self, namespace: &str, group: &str, properties: GroupProperties) -> Result<bool> {
        self.namespaces
            .get_namespace(namespace)?
            .add_new_group(group, properties)
    }

    pub fn delete_group(&self, namespace: &str, group: &str) -> Result<()> {
        self.namespaces.get_namespace(namespace)?.delete_group(group)
    }

    pub fn list_groups(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self.namespaces.get_namespace(namespace)?.get_groups())
    }

    /// Handle to a group.
    pub fn group(&self, namespace: &str, group: &str) -> Result<Arc<Group>> {
        self.namespaces.get_namespace(namespace)?.get_group(group)
    }

    // --- Schema operations ---

    pub fn add_schema(&self, namespace: &str, group: &str, schema: SchemaInfo, etag: Position) -> Result<VersionInfo> {
        self.group(namespace, group)?.add_schema(schema, etag)
    }

    pub fn add_schema_to_subgroup(
        &self,
        namespace: &str,
        group: &str,
        schema: SchemaInfo,
        etag: Position,
    ) -> Result<VersionInfo> {
        self.group(namespace, group)?.add_schema_to_subgroup(schema, etag)
    }

    pub fn get_schema(&self, namespace: &str, group: &str, version: &VersionInfo) -> Result<SchemaInfo> {
        self.group(namespace, group)?.get_schema(version)
    }

    pub fn get_version(&self, namespace: &str, group: &str, schema: &SchemaInfo) -> Result<VersionInfo> {
        self.group(namespace, group)?.get_version(schema)
    }

    pub fn list_schemas(&self, namespace: &str, group: &str) -> Result<Vec<SchemaWithVersion>> {
        self.group(namespace, group)?.list_schemas()
    }

    pub fn list_schemas_in(&self, namespace: &str, group: &str, name: &str) -> Result<Vec<SchemaWithVersion>> {
        self.group(namespace, group)?.list_schemas_in(name)
    }

    pub fn list_schemas_from(
        &self,
        namespace: &str,
        group: &str,
        from: &VersionInfo,
    ) -> Result<Vec<SchemaWithVersion>> {
        self.group(namespace, group)?.list_schemas_from(from)
    }

    pub fn list_schemas_in_from(
        &self,
        namespace: &str,
        group: &str,
        name: &str,
        from: &VersionInfo,
    ) -> Result<Vec<SchemaWithVersion>> {
        self.group(namespace, group)?.list_schemas_in_from(name, from)
    }

    pub fn latest_schema(&self, namespace: &str, group: &str) -> Result<Option<SchemaWithVersion>> {
        self.group(namespace, group)?.latest_schema()
    }

    pub fn latest_schema_in(&self, namespace: &str, group: &str, name: &str) -> Result<Option<SchemaWithVersion>> {
        self.group(namespace, group)?.latest_schema_in(name)
    }

    pub fn latest_version(&self, namespace: &str, group: &str) -> Result<Option<VersionInfo>> {
        self.group(namespace, group)?.latest_version()
    }

    pub fn get_subgroups(&self, namespace: &str, group: &str) -> Result<Vec<String>> {
        self.group(namespace, group)?.get_subgroups()
    }

    /// Check a candidate against the group's current rules before adding it.
    pub fn is_compatible(
        &self,
        namespace: &str,
        group: &str,
        validator: &dyn SchemaValidator,
        schema: &SchemaInfo,
    ) -> Result<bool> {
        self.group(namespace, group)?.is_compatible(validator, schema)
    }

    // --- Encoding operations ---

    pub fn get_or_create_encoding_id(
        &self,
        namespace: &str,
        group: &str,
        version: &VersionInfo,
        compression: CompressionType,
    ) -> Result<EncodingId> {
        self.group(namespace, group)?
            .get_or_create_encoding_id(version, compression)
    }

    pub fn get_encoding_info(&self, namespace: &str, group: &str, id: EncodingId) -> Result<EncodingInfo> {
        self.group(namespace, group)?.get_encoding_info(id)
    }

    pub fn list_compressions(&self, namespace: &str, group: &str) -> Result<Vec<CompressionType>> {
        self.group(namespace, group)?.list_compressions()
    }

    // --- Policy and state ---

    pub fn current_validation_rules(&self, namespace: &str, group: &str) -> Result<ValidationRules> {
        self.group(namespace, group)?.current_validation_rules()
    }

    pub fn update_validation_policy(
        &self,
        namespace: &str,
        group: &str,
        rules: ValidationRules,
        etag: Position,
    ) -> Result<Position> {
        self.group(namespace, group)?
            .update_validation_policy(rules, etag)
    }

    pub fn group_properties(&self, namespace: &str, group: &str) -> Result<GroupProperties> {
        self.group(namespace, group)?.properties()
    }

    pub fn current_etag(&self, namespace: &str, group: &str) -> Result<Position> {
        self.group(namespace, group)?.current_etag()
    }

    // --- History ---

    pub fn history(&self, namespace: &str, group: &str) -> Result<Vec<HistoryEntry>> {
        self.group(namespace, group)?.history()
    }

    pub fn history_in(&self, namespace: &str, group: &str, name: &str) -> Result<Vec<HistoryEntry>> {
        self.group(namespace, group)?.history_in(name)
    }

    // --- Maintenance ---

    /// Fsync every log and snapshot every index.
    pub fn checkpoint(&self) -> Result<()> {
        self.namespaces.flush()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let manifest = fs::read(path.join("MANIFEST"))?;
        if manifest.len() < 5 || &manifest[0..4] != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }
        if manifest[4] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                manifest[4]
            )));
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }
}

impl Drop for SchemaStore {
    fn drop(&mut self) {
        // Best-effort checkpoint on drop
        let _ = self.checkpoint();
    }
}
