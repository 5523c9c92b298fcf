//! Group storage engine.
//!
//! A group owns one [`Log`] and one [`Index`]. Writers append to the log
//! conditioned on an etag and then fold the new record into the index;
//! readers consult the index and `sync` on a miss. Any number of `Group`
//! handles (in this process or others sharing the same storage) may operate
//! on one group concurrently: the log's conditional append orders writers and
//! the index's per-key versions order folds.

mod derive;

pub use derive::RetryPolicy;

use crate::error::{Result, StoreError};
use crate::records::{
    EncodingRecord, Index, IndexKey, IndexValue, Log, Record, RecordKind, SchemaRecord,
    ValidationRecord, ValueKind,
};
use crate::types::{
    CompressionType, EncodingId, EncodingInfo, GroupProperties, HistoryEntry, Position, SchemaInfo,
    SchemaWithVersion, ValidationRules, VersionInfo,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tunables for a group handle.
#[derive(Clone, Debug)]
pub struct GroupOptions {
    /// Backoff for index compare-and-set conflicts.
    pub index_retry: RetryPolicy,
    /// How many times `get_or_create_encoding_id` re-runs after losing an append race.
    pub encoding_id_attempts: u32,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            index_retry: RetryPolicy::default(),
            encoding_id_attempts: 8,
        }
    }
}

/// Handle to one schema group.
pub struct Group {
    name: String,
    /// Immutable configuration; `validation_rules` holds the initial policy.
    properties: GroupProperties,
    log: Arc<dyn Log>,
    index: Arc<dyn Index>,
    options: GroupOptions,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Group {
    /// Attach to a group, initializing its log if it is empty.
    ///
    /// The first log record is always the initial `ValidationRecord`. If
    /// another handle initializes the log first, its record stands.
    pub fn open(
        name: impl Into<String>,
        properties: GroupProperties,
        log: Arc<dyn Log>,
        index: Arc<dyn Index>,
        options: GroupOptions,
    ) -> Result<Self> {
        properties.validate()?;
        let name = name.into();

        if log.current_etag()? == Position::START {
            let initial = Record::Validation(ValidationRecord {
                validation_rules: properties.validation_rules.clone(),
            });
            match log.append(initial, None) {
                Ok(_) => info!(group = %name, "initialized group log"),
                Err(e) if e.is_write_conflict() => {
                    debug!(group = %name, "group log initialized concurrently")
                }
                Err(e) => return Err(e),
            }
        }
        if index_outlives_log(index.as_ref(), log.as_ref())? {
            discard_index(&name, index.as_ref())?;
        }
        index.insert_if_absent(IndexKey::SyncdTill, IndexValue::LogPosition(Position::START))?;

        Ok(Self {
            name,
            properties,
            log,
            index,
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tail of the log; the precondition for the next write.
    pub fn current_etag(&self) -> Result<Position> {
        self.log.current_etag()
    }

    /// Fold every record the index has not seen yet. Returns the position
    /// the index is now synced up to.
    pub fn sync(&self) -> Result<Position> {
        let mut from = self.syncd_till()?;
        if from > self.log.current_etag()? {
            discard_index(&self.name, self.index.as_ref())?;
            self.index
                .insert_if_absent(IndexKey::SyncdTill, IndexValue::LogPosition(Position::START))?;
            from = Position::START;
        }
        let records = self.log.read_from(Some(from))?;
        let Some((last, _)) = records.last() else {
            return Ok(from);
        };
        let till = last.next();

        for (position, record) in &records {
            derive::fold(self.index.as_ref(), &self.options.index_retry, *position, record)?;
        }
        derive::advance(
            self.index.as_ref(),
            &self.options.index_retry,
            IndexKey::SyncdTill,
            till,
        )?;

        debug!(group = %self.name, from = %from, till = %till, folded = records.len(), "synced index");
        self.snapshot_if_due()?;
        Ok(till)
    }

    /// Flush once the index asks for a snapshot, so the log is durable first.
    fn snapshot_if_due(&self) -> Result<()> {
        if self.index.snapshot_due() {
            self.flush()?;
            debug!(group = %self.name, "snapshotted index");
        }
        Ok(())
    }

    fn syncd_till(&self) -> Result<Position> {
        Ok(self
            .index
            .get(&IndexKey::SyncdTill, ValueKind::LogPosition)?
            .and_then(|v| v.as_position())
            .unwrap_or(Position::START))
    }

    /// Append at `etag`, then fold the record. Returns the position written.
    ///
    /// When the index had already folded everything before `position`, the
    /// sync mark moves past the new record too.
    fn write(&self, record: Record, etag: Position) -> Result<Position> {
        let position = self.log.append(record.clone(), Some(etag))?;
        derive::fold(self.index.as_ref(), &self.options.index_retry, position, &record)?;
        if self.syncd_till()? == position {
            derive::advance(
                self.index.as_ref(),
                &self.options.index_retry,
                IndexKey::SyncdTill,
                position.next(),
            )?;
        }
        self.snapshot_if_due()?;
        Ok(position)
    }

    /// Add a schema to a group that is not subgrouped.
    pub fn add_schema(&self, schema: SchemaInfo, etag: Position) -> Result<VersionInfo> {
        if self.properties.subgroup_by_schema_name {
            return Err(StoreError::IllegalState(format!(
                "Group {} is subgrouped by schema name; use add_schema_to_subgroup",
                self.name
            )));
        }
        self.append_schema(schema, etag)
    }

    /// Add a schema to the subgroup named by `schema.name`.
    pub fn add_schema_to_subgroup(&self, schema: SchemaInfo, etag: Position) -> Result<VersionInfo> {
        if !self.properties.subgroup_by_schema_name {
            return Err(StoreError::IllegalState(format!(
                "Group {} is not subgrouped by schema name",
                self.name
            )));
        }
        self.append_schema(schema, etag)
    }

    fn append_schema(&self, schema: SchemaInfo, etag: Position) -> Result<VersionInfo> {
        self.sync()?;

        let versions = self.versions(|_| true)?;
        let ordinal = versions.iter().map(|v| v.ordinal).max().map_or(0, |m| m + 1);
        let version = if self.properties.subgroup_by_schema_name {
            versions
                .iter()
                .filter(|v| v.schema_name == schema.name)
                .map(|v| v.version)
                .max()
                .map_or(0, |m| m + 1)
        } else {
            ordinal
        };
        let version_info = VersionInfo::new(schema.name.clone(), version, ordinal);

        let record = Record::Schema(SchemaRecord {
            schema_info: schema,
            version_info: version_info.clone(),
        });
        let position = self.write(record, etag)?;

        debug!(group = %self.name, version = %version_info, position = %position, "added schema");
        Ok(version_info)
    }

    /// Every version in the index matching `filter`, by ordinal.
    fn versions(&self, filter: impl Fn(&VersionInfo) -> bool) -> Result<Vec<VersionInfo>> {
        let mut versions: Vec<VersionInfo> = self
            .index
            .get_all(&|k| matches!(k, IndexKey::VersionInfo(v) if filter(v)))?
            .into_iter()
            .filter_map(|(k, _)| match k {
                IndexKey::VersionInfo(v) => Some(v),
                _ => None,
            })
            .collect();
        versions.sort_by_key(|v| v.ordinal);
        Ok(versions)
    }

    fn schema_position(&self, version: &VersionInfo) -> Result<Option<Position>> {
        Ok(self
            .index
            .get(&IndexKey::VersionInfo(version.clone()), ValueKind::LogPosition)?
            .and_then(|v| v.as_position()))
    }

    fn read_schema(&self, position: Position) -> Result<SchemaRecord> {
        match self.log.read_at(position, RecordKind::Schema)? {
            Record::Schema(record) => Ok(record),
            other => Err(StoreError::Corruption(format!(
                "Index points at a {} for a schema",
                other.kind()
            ))),
        }
    }

    /// Schema stored under `version`.
    pub fn get_schema(&self, version: &VersionInfo) -> Result<SchemaInfo> {
        let position = match self.schema_position(version)? {
            Some(position) => position,
            None => {
                self.sync()?;
                self.schema_position(version)?.ok_or_else(|| {
                    StoreError::DataNotFound(format!("Version {} in group {}", version, self.name))
                })?
            }
        };
        Ok(self.read_schema(position)?.schema_info)
    }

    /// Version of an identical, previously added schema.
    pub fn get_version(&self, schema: &SchemaInfo) -> Result<VersionInfo> {
        let fingerprint = schema.fingerprint();
        let mut checked = HashSet::new();

        if let Some(found) = self.find_in_bucket(schema, &mut checked)? {
            return Ok(found);
        }
        self.sync()?;
        if let Some(found) = self.find_in_bucket(schema, &mut checked)? {
            return Ok(found);
        }
        Err(StoreError::DataNotFound(format!(
            "Schema {} with fingerprint {} in group {}",
            schema.name, fingerprint, self.name
        )))
    }

    /// Compare `schema` against every unchecked candidate sharing its fingerprint.
    fn find_in_bucket(
        &self,
        schema: &SchemaInfo,
        checked: &mut HashSet<VersionInfo>,
    ) -> Result<Option<VersionInfo>> {
        let candidates = match self
            .index
            .get(&IndexKey::SchemaInfo(schema.fingerprint()), ValueKind::SchemaVersions)?
        {
            Some(IndexValue::SchemaVersions(candidates)) => candidates,
            _ => return Ok(None),
        };

        for candidate in candidates {
            if checked.contains(&candidate) {
                continue;
            }
            // Not folded yet; the retry after sync will see it.
            let Some(position) = self.schema_position(&candidate)? else {
                continue;
            };
            if self.read_schema(position)?.schema_info == *schema {
                return Ok(Some(candidate));
            }
            checked.insert(candidate);
        }
        Ok(None)
    }

    /// Every schema in ordinal order.
    pub fn list_schemas(&self) -> Result<Vec<SchemaWithVersion>> {
        self.list_matching(|_| true)
    }

    /// Every schema named `name` in version order.
    pub fn list_schemas_in(&self, name: &str) -> Result<Vec<SchemaWithVersion>> {
        self.list_matching(|v| v.schema_name == name)
    }

    fn list_matching(&self, filter: impl Fn(&VersionInfo) -> bool) -> Result<Vec<SchemaWithVersion>> {
        self.sync()?;
        self.versions(filter)?
            .into_iter()
            .map(|version| {
                let position = self.schema_position(&version)?.ok_or_else(|| {
                    StoreError::Corruption(format!("Version {} vanished from the index", version))
                })?;
                let record = self.read_schema(position)?;
                Ok(SchemaWithVersion {
                    schema: record.schema_info,
                    version,
                })
            })
            .collect()
    }

    /// `from` and every schema added after it, in ordinal order.
    pub fn list_schemas_from(&self, from: &VersionInfo) -> Result<Vec<SchemaWithVersion>> {
        self.list_from_matching(from, |_| true)
    }

    /// Schemas named `name`, starting at `from`, in version order.
    pub fn list_schemas_in_from(&self, name: &str, from: &VersionInfo) -> Result<Vec<SchemaWithVersion>> {
        self.list_from_matching(from, |s| s.name == name)
    }

    fn list_from_matching(
        &self,
        from: &VersionInfo,
        filter: impl Fn(&SchemaInfo) -> bool,
    ) -> Result<Vec<SchemaWithVersion>> {
        let start = match self.schema_position(from)? {
            Some(position) => position,
            None => {
                self.sync()?;
                self.schema_position(from)?.ok_or_else(|| {
                    StoreError::DataNotFound(format!("Version {} in group {}", from, self.name))
                })?
            }
        };

        Ok(self
            .log
            .read_from(Some(start))?
            .into_iter()
            .filter_map(|(_, record)| match record {
                Record::Schema(r) if filter(&r.schema_info) => Some(SchemaWithVersion {
                    schema: r.schema_info,
                    version: r.version_info,
                }),
                _ => None,
            })
            .collect())
    }

    /// Highest-ordinal version, if any schema was added.
    pub fn latest_version(&self) -> Result<Option<VersionInfo>> {
        self.sync()?;
        Ok(self.versions(|_| true)?.pop())
    }

    /// Highest version named `name`.
    pub fn latest_version_in(&self, name: &str) -> Result<Option<VersionInfo>> {
        self.sync()?;
        Ok(self.versions(|v| v.schema_name == name)?.pop())
    }

    pub fn latest_schema(&self) -> Result<Option<SchemaWithVersion>> {
        self.latest_version()?
            .map(|version| self.with_schema(version))
            .transpose()
    }

    pub fn latest_schema_in(&self, name: &str) -> Result<Option<SchemaWithVersion>> {
        self.latest_version_in(name)?
            .map(|version| self.with_schema(version))
            .transpose()
    }

    fn with_schema(&self, version: VersionInfo) -> Result<SchemaWithVersion> {
        Ok(SchemaWithVersion {
            schema: self.get_schema(&version)?,
            version,
        })
    }

    /// Distinct schema names, sorted. Only meaningful for subgrouped groups.
    pub fn get_subgroups(&self) -> Result<Vec<String>> {
        if !self.properties.subgroup_by_schema_name {
            return Err(StoreError::IllegalState(format!(
                "Group {} is not subgrouped by schema name",
                self.name
            )));
        }
        self.sync()?;
        let mut names: Vec<String> = self
            .versions(|_| true)?
            .into_iter()
            .map(|v| v.schema_name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn lookup_encoding_id(&self, key: &IndexKey) -> Result<Option<EncodingId>> {
        Ok(match self.index.get(key, ValueKind::EncodingId)? {
            Some(IndexValue::EncodingId(id)) => Some(id),
            _ => None,
        })
    }

    /// Id for `(version, compression)`, minting one if the pair is new.
    ///
    /// Each pair maps to exactly one id no matter how many callers race to
    /// create it: a loser of the append race re-syncs and finds the winner's id.
    pub fn get_or_create_encoding_id(
        &self,
        version: &VersionInfo,
        compression: CompressionType,
    ) -> Result<EncodingId> {
        if !self.properties.enable_encoding {
            return Err(StoreError::IllegalState(format!(
                "Encoding is not enabled for group {}",
                self.name
            )));
        }
        // Also fails if the version does not exist.
        self.get_schema(version)?;

        let key = IndexKey::EncodingInfo(version.clone(), compression.clone());
        let attempts = self.options.encoding_id_attempts.max(1);
        let mut attempt = 1;
        loop {
            if let Some(id) = self.lookup_encoding_id(&key)? {
                return Ok(id);
            }
            let etag = self.sync()?;
            if let Some(id) = self.lookup_encoding_id(&key)? {
                return Ok(id);
            }

            let id = self
                .index
                .get_all(&|k| matches!(k, IndexKey::EncodingId(_)))?
                .into_iter()
                .filter_map(|(k, _)| match k {
                    IndexKey::EncodingId(id) => Some(id.0),
                    _ => None,
                })
                .max()
                .map_or(EncodingId(0), |m| EncodingId(m + 1));

            let record = Record::Encoding(EncodingRecord {
                encoding_id: id,
                version_info: version.clone(),
                compression_type: compression.clone(),
            });
            match self.write(record, etag) {
                Ok(_) => {
                    debug!(group = %self.name, version = %version, id = %id, "minted encoding id");
                    return Ok(id);
                }
                Err(e) if e.is_write_conflict() && attempt < attempts => {
                    warn!(group = %self.name, attempt, "encoding id append lost a race, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Version, schema and codec behind an encoding id.
    pub fn get_encoding_info(&self, id: EncodingId) -> Result<EncodingInfo> {
        let key = IndexKey::EncodingId(id);
        let mut value = self.index.get(&key, ValueKind::EncodingInfo)?;
        if value.is_none() {
            self.sync()?;
            value = self.index.get(&key, ValueKind::EncodingInfo)?;
        }
        match value {
            Some(IndexValue::EncodingInfo(version_info, compression)) => Ok(EncodingInfo {
                schema_info: self.get_schema(&version_info)?,
                version_info,
                compression,
            }),
            _ => Err(StoreError::DataNotFound(format!(
                "Encoding id {} in group {}",
                id, self.name
            ))),
        }
    }

    /// Distinct codecs that have an encoding id.
    pub fn list_compressions(&self) -> Result<Vec<CompressionType>> {
        self.sync()?;
        let mut compressions: Vec<CompressionType> = Vec::new();
        for (key, _) in self
            .index
            .get_all(&|k| matches!(k, IndexKey::EncodingInfo(..)))?
        {
            if let IndexKey::EncodingInfo(_, compression) = key {
                if !compressions.contains(&compression) {
                    compressions.push(compression);
                }
            }
        }
        Ok(compressions)
    }

    /// Rules from the latest `ValidationRecord`.
    pub fn current_validation_rules(&self) -> Result<ValidationRules> {
        self.sync()?;
        let position = self
            .index
            .get(&IndexKey::ValidationPolicy, ValueKind::LogPosition)?
            .and_then(|v| v.as_position())
            .ok_or_else(|| {
                StoreError::Corruption(format!("Group {} has no validation policy", self.name))
            })?;
        match self.log.read_at(position, RecordKind::Validation)? {
            Record::Validation(r) => Ok(r.validation_rules),
            other => Err(StoreError::Corruption(format!(
                "Validation policy points at a {}",
                other.kind()
            ))),
        }
    }

    /// Replace the validation rules. Returns the new etag.
    pub fn update_validation_policy(&self, rules: ValidationRules, etag: Position) -> Result<Position> {
        if rules.rules.is_empty() {
            return Err(StoreError::InvalidArgument(
                "Validation rules must not be empty".into(),
            ));
        }
        let record = Record::Validation(ValidationRecord {
            validation_rules: rules,
        });
        let position = self.write(record, etag)?;
        info!(group = %self.name, position = %position, "updated validation policy");
        Ok(position.next())
    }

    /// Immutable configuration with the current rules.
    pub fn properties(&self) -> Result<GroupProperties> {
        let mut properties = self.properties.clone();
        properties.validation_rules = self.current_validation_rules()?;
        Ok(properties)
    }

    /// Every schema ever added, with the rules in force when it was added.
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.history_matching(|_| true)
    }

    pub fn history_in(&self, name: &str) -> Result<Vec<HistoryEntry>> {
        self.history_matching(|s| s.name == name)
    }

    fn history_matching(&self, filter: impl Fn(&SchemaInfo) -> bool) -> Result<Vec<HistoryEntry>> {
        let mut rules: Option<ValidationRules> = None;
        let mut entries = Vec::new();
        for (position, record) in self.log.read_from(None)? {
            match record {
                Record::Validation(r) => rules = Some(r.validation_rules),
                Record::Schema(r) => {
                    let in_force = rules.clone().ok_or_else(|| {
                        StoreError::Corruption(format!(
                            "Schema at {} precedes any validation rules in group {}",
                            position, self.name
                        ))
                    })?;
                    if filter(&r.schema_info) {
                        entries.push(HistoryEntry {
                            schema: r.schema_info,
                            version: r.version_info,
                            rules: in_force,
                        });
                    }
                }
                Record::Encoding(_) => {}
            }
        }
        Ok(entries)
    }

    /// Fsync the log and persist the index.
    pub fn flush(&self) -> Result<()> {
        self.log.flush()?;
        self.index.flush()
    }

    pub(crate) fn subgrouped(&self) -> bool {
        self.properties.subgroup_by_schema_name
    }

    #[cfg(test)]
    pub(crate) fn log(&self) -> &Arc<dyn Log> {
        &self.log
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> &Arc<dyn Index> {
        &self.index
    }
}

/// Whether the index refers to log positions the log no longer has.
///
/// Entries are read before the tail: anything folded was appended first, so
/// a live index always sits below a tail read afterwards.
fn index_outlives_log(index: &dyn Index, log: &dyn Log) -> Result<bool> {
    let positions = index.get_all(&|k| {
        matches!(
            k,
            IndexKey::VersionInfo(_) | IndexKey::ValidationPolicy | IndexKey::SyncdTill
        )
    })?;
    let tail = log.current_etag()?;
    Ok(positions.iter().any(|(key, value)| match (key, value.as_position()) {
        (IndexKey::SyncdTill, Some(till)) => till > tail,
        (_, Some(position)) => position >= tail,
        _ => false,
    }))
}

fn discard_index(group: &str, index: &dyn Index) -> Result<()> {
    warn!(group = %group, "index is ahead of the log, rebuilding it from the start");
    index.clear()
}
