//! Namespace and group directory.

use crate::error::{Result, StoreError};
use crate::group::{Group, GroupOptions};
use crate::records::{CachedLog, FileIndex, FileLog, InMemoryIndex, InMemoryLog, Index, Log};
use crate::types::GroupProperties;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Immutable properties of every group in a namespace, by group name.
pub type Catalog = BTreeMap<String, GroupProperties>;

/// Supplies storage for groups and persists namespace catalogs.
pub trait GroupStorage: Send + Sync {
    /// Log and index for a group, created empty if new.
    fn open_group(&self, namespace: &str, group: &str) -> Result<(Arc<dyn Log>, Arc<dyn Index>)>;

    fn delete_group(&self, namespace: &str, group: &str) -> Result<()>;

    fn load_catalog(&self, namespace: &str) -> Result<Catalog>;

    fn save_catalog(&self, namespace: &str, catalog: &Catalog) -> Result<()>;

    /// Namespaces with a saved catalog.
    fn list_namespaces(&self) -> Result<Vec<String>>;

    fn delete_namespace(&self, namespace: &str) -> Result<()>;
}

/// Volatile storage; nothing outlives the process.
#[derive(Default)]
pub struct InMemoryStorage;

impl InMemoryStorage {
    pub fn new() -> Self {
        Self
    }
}

impl GroupStorage for InMemoryStorage {
    fn open_group(&self, _namespace: &str, _group: &str) -> Result<(Arc<dyn Log>, Arc<dyn Index>)> {
        Ok((Arc::new(InMemoryLog::new()), Arc::new(InMemoryIndex::new())))
    }

    fn delete_group(&self, _namespace: &str, _group: &str) -> Result<()> {
        Ok(())
    }

    fn load_catalog(&self, _namespace: &str) -> Result<Catalog> {
        Ok(Catalog::new())
    }

    fn save_catalog(&self, _namespace: &str, _catalog: &Catalog) -> Result<()> {
        Ok(())
    }

    fn list_namespaces(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn delete_namespace(&self, _namespace: &str) -> Result<()> {
        Ok(())
    }
}

/// Magic bytes for namespace catalog files.
const CATALOG_MAGIC: &[u8; 4] = b"SGC\0";

/// Current catalog format version.
const CATALOG_VERSION: u8 = 1;

const CATALOG_FILE: &str = "groups.bin";
const LOG_FILE: &str = "log.bin";
const INDEX_FILE: &str = "index.bin";

/// On-disk catalog body.
#[derive(Serialize, Deserialize)]
struct CatalogFile {
    groups: Catalog,
}

/// Groups laid out as `<root>/<namespace>/<group>/{log.bin,index.bin}`.
pub struct FileStorage {
    root: PathBuf,
    /// Cached records per group log; 0 disables the cache.
    log_cache_size: usize,
    log_sync_interval: u64,
    index_snapshot_interval: u64,
}

impl FileStorage {
    pub fn new(
        root: impl Into<PathBuf>,
        log_cache_size: usize,
        log_sync_interval: u64,
        index_snapshot_interval: u64,
    ) -> Self {
        Self {
            root: root.into(),
            log_cache_size,
            log_sync_interval,
            index_snapshot_interval,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn group_dir(&self, namespace: &str, group: &str) -> PathBuf {
        self.namespace_dir(namespace).join(group)
    }
}

impl GroupStorage for FileStorage {
    fn open_group(&self, namespace: &str, group: &str) -> Result<(Arc<dyn Log>, Arc<dyn Index>)> {
        let dir = self.group_dir(namespace, group);
        fs::create_dir_all(&dir)?;

        let file_log = FileLog::open_with_sync_interval(dir.join(LOG_FILE), self.log_sync_interval)?;
        let log: Arc<dyn Log> = if self.log_cache_size > 0 {
            Arc::new(CachedLog::new(file_log, self.log_cache_size))
        } else {
            Arc::new(file_log)
        };
        let index = FileIndex::open_with_snapshot_interval(
            dir.join(INDEX_FILE),
            self.index_snapshot_interval,
        )?;
        Ok((log, Arc::new(index)))
    }

    fn delete_group(&self, namespace: &str, group: &str) -> Result<()> {
        let dir = self.group_dir(namespace, group);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn load_catalog(&self, namespace: &str) -> Result<Catalog> {
        let path = self.namespace_dir(namespace).join(CATALOG_FILE);
        if !path.exists() {
            return Ok(Catalog::new());
        }
        let contents = fs::read(&path)?;
        if contents.len() < 5 || &contents[0..4] != CATALOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid catalog magic".into()));
        }
        if contents[4] != CATALOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported catalog version: {}",
                contents[4]
            )));
        }
        let file: CatalogFile = rmp_serde::from_slice(&contents[5..])?;
        Ok(file.groups)
    }

    fn save_catalog(&self, namespace: &str, catalog: &Catalog) -> Result<()> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)?;

        let encoded = rmp_serde::to_vec_named(&CatalogFile {
            groups: catalog.clone(),
        })?;

        let path = dir.join(CATALOG_FILE);
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(CATALOG_MAGIC)?;
            file.write_all(&[CATALOG_VERSION])?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn list_namespaces(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path().join(CATALOG_FILE).exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let dir = self.namespace_dir(namespace);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Names double as directory names in file-backed stores.
fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name.len() <= 255
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!("Invalid {} name: {:?}", kind, name)))
    }
}

/// A set of uniquely named groups.
pub struct Namespace {
    name: String,
    storage: Arc<dyn GroupStorage>,
    options: GroupOptions,
    groups: RwLock<HashMap<String, Arc<Group>>>,
    /// Serializes catalog changes.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Namespace {
    /// Open a namespace, reattaching every group in its catalog.
    pub fn open(
        name: impl Into<String>,
        storage: Arc<dyn GroupStorage>,
        options: GroupOptions,
    ) -> Result<Self> {
        let name = name.into();
        validate_name("namespace", &name)?;

        let mut groups = HashMap::new();
        for (group_name, properties) in storage.load_catalog(&name)? {
            let (log, index) = storage.open_group(&name, &group_name)?;
            let group = Group::open(group_name.clone(), properties, log, index, options.clone())?;
            groups.insert(group_name, Arc::new(group));
        }
        debug!(namespace = %name, groups = groups.len(), "opened namespace");

        Ok(Self {
            name,
            storage,
            options,
            groups: RwLock::new(groups),
            write_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn catalog(&self, groups: &HashMap<String, Arc<Group>>, extra: Option<(&str, &GroupProperties)>) -> Result<Catalog> {
        let mut catalog = self.storage.load_catalog(&self.name)?;
        catalog.retain(|name, _| groups.contains_key(name));
        if let Some((name, properties)) = extra {
            catalog.insert(name.to_string(), properties.clone());
        }
        Ok(catalog)
    }

    /// Create a group. Returns `false` if it already exists.
    pub fn add_new_group(&self, name: &str, properties: GroupProperties) -> Result<bool> {
        validate_name("group", name)?;
        properties.validate()?;

        let _guard = self.write_lock.lock();
        if self.groups.read().contains_key(name) {
            return Ok(false);
        }

        let (log, index) = self.storage.open_group(&self.name, name)?;
        let group = Group::open(name, properties.clone(), log, index, self.options.clone())?;

        let catalog = self.catalog(&self.groups.read(), Some((name, &properties)))?;
        self.storage.save_catalog(&self.name, &catalog)?;
        self.groups.write().insert(name.to_string(), Arc::new(group));

        info!(namespace = %self.name, group = %name, "created group");
        Ok(true)
    }

    pub fn get_group(&self, name: &str) -> Result<Arc<Group>> {
        self.groups.read().get(name).cloned().ok_or_else(|| {
            StoreError::DataNotFound(format!("Group {} in namespace {}", name, self.name))
        })
    }

    /// Remove a group and its storage.
    pub fn delete_group(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let removed = self.groups.write().remove(name);
        if removed.is_none() {
            return Err(StoreError::DataNotFound(format!(
                "Group {} in namespace {}",
                name, self.name
            )));
        }

        let catalog = self.catalog(&self.groups.read(), None)?;
        self.storage.save_catalog(&self.name, &catalog)?;
        self.storage.delete_group(&self.name, name)?;

        info!(namespace = %self.name, group = %name, "deleted group");
        Ok(())
    }

    /// Group names, sorted.
    pub fn get_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Flush every group.
    pub fn flush(&self) -> Result<()> {
        let groups: Vec<Arc<Group>> = self.groups.read().values().cloned().collect();
        for group in groups {
            group.flush()?;
        }
        Ok(())
    }
}

/// The set of namespaces.
pub struct Namespaces {
    storage: Arc<dyn GroupStorage>,
    options: GroupOptions,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    write_lock: Mutex<()>,
}

impl Namespaces {
    /// Open every namespace the storage knows about.
    pub fn open(storage: Arc<dyn GroupStorage>, options: GroupOptions) -> Result<Self> {
        let mut namespaces = HashMap::new();
        for name in storage.list_namespaces()? {
            let namespace = Namespace::open(name.clone(), storage.clone(), options.clone())?;
            namespaces.insert(name, Arc::new(namespace));
        }
        Ok(Self {
            storage,
            options,
            namespaces: RwLock::new(namespaces),
            write_lock: Mutex::new(()),
        })
    }

    /// Create a namespace. Returns `false` if it already exists.
    pub fn add_new_namespace(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        if self.namespaces.read().contains_key(name) {
            return Ok(false);
        }
        let namespace = Namespace::open(name, self.storage.clone(), self.options.clone())?;
        self.storage.save_catalog(name, &Catalog::new())?;
        self.namespaces.write().insert(name.to_string(), Arc::new(namespace));

        info!(namespace = %name, "created namespace");
        Ok(true)
    }

    pub fn get_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        self.namespaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::DataNotFound(format!("Namespace {}", name)))
    }

    /// Remove a namespace with every group in it.
    pub fn remove_namespace(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.namespaces.write().remove(name).is_none() {
            return Err(StoreError::DataNotFound(format!("Namespace {}", name)));
        }
        self.storage.delete_namespace(name)?;

        info!(namespace = %name, "removed namespace");
        Ok(())
    }

    /// Namespace names, sorted.
    pub fn get_namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn flush(&self) -> Result<()> {
        let namespaces: Vec<Arc<Namespace>> = self.namespaces.read().values().cloned().collect();
        for namespace in namespaces {
            namespace.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SerializationFormat, ValidationRules};
    use tempfile::TempDir;

    fn props() -> GroupProperties {
        GroupProperties::new(SerializationFormat::Avro, ValidationRules::default())
            .with_property("owner", "payments")
    }

    #[test]
    fn test_group_lifecycle() {
        let ns = Namespace::open("ns", Arc::new(InMemoryStorage::new()), GroupOptions::default()).unwrap();

        assert!(ns.add_new_group("orders", props()).unwrap());
        assert!(!ns.add_new_group("orders", props()).unwrap());
        assert!(ns.add_new_group("refunds", props()).unwrap());
        assert_eq!(ns.get_groups(), vec!["orders".to_string(), "refunds".to_string()]);

        ns.delete_group("orders").unwrap();
        assert!(ns.get_group("orders").unwrap_err().is_not_found());
        assert!(ns.delete_group("orders").unwrap_err().is_not_found());
    }

    #[test]
    fn test_rejects_bad_names() {
        let ns = Namespace::open("ns", Arc::new(InMemoryStorage::new()), GroupOptions::default()).unwrap();
        for name in ["", "../escape", ".hidden", "a/b"] {
            assert!(matches!(
                ns.add_new_group(name, props()),
                Err(StoreError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_namespaces() {
        let namespaces = Namespaces::open(Arc::new(InMemoryStorage::new()), GroupOptions::default()).unwrap();
        assert!(namespaces.add_new_namespace("a").unwrap());
        assert!(!namespaces.add_new_namespace("a").unwrap());
        assert!(namespaces.add_new_namespace("b").unwrap());
        assert_eq!(namespaces.get_namespaces(), vec!["a".to_string(), "b".to_string()]);

        namespaces.remove_namespace("a").unwrap();
        assert!(namespaces.get_namespace("a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_file_catalog_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let storage = || -> Arc<dyn GroupStorage> { Arc::new(FileStorage::new(dir.path(), 16, 1, 0)) };

        {
            let namespaces = Namespaces::open(storage(), GroupOptions::default()).unwrap();
            namespaces.add_new_namespace("ns").unwrap();
            let ns = namespaces.get_namespace("ns").unwrap();
            ns.add_new_group("orders", props().with_encoding(true)).unwrap();
            ns.add_new_group("gone", props()).unwrap();
            ns.delete_group("gone").unwrap();
            namespaces.flush().unwrap();
        }

        assert!(dir.path().join("ns").join("orders").join("log.bin").exists());
        assert!(!dir.path().join("ns").join("gone").exists());

        let namespaces = Namespaces::open(storage(), GroupOptions::default()).unwrap();
        let ns = namespaces.get_namespace("ns").unwrap();
        assert_eq!(ns.get_groups(), vec!["orders".to_string()]);
        let group = ns.get_group("orders").unwrap();
        let properties = group.properties().unwrap();
        assert!(properties.enable_encoding);
        assert_eq!(properties.properties.get("owner").map(String::as_str), Some("payments"));
    }
}
