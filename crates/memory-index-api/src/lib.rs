use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use memory_index_core::{
    compute_stats, derive_keywords, derive_triggers, normalize_tags, search_records, AccessInfo,
    IndexConfig, IndexError, IndexStats, MemoryRecord, OperationKind, RebuildStrategy, RecordId,
    RecordKind, Scope, SearchHit, SearchQuery,
};
use memory_index_store_fs::{
    AppendTarget, IndexStore, RebuildReport, StoreOptions, StoreStatus, CONFIG_FILE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Storage locations: the shared root is always present, the local root is
/// optional and holds `local`-scoped records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoots {
    pub shared: PathBuf,
    pub local: Option<PathBuf>,
}

impl StorageRoots {
    #[must_use]
    pub fn new(shared: PathBuf, local: Option<PathBuf>) -> Self {
        Self { shared, local }
    }

    #[must_use]
    pub fn root_for(&self, scope: Scope) -> Option<&Path> {
        match scope {
            Scope::Shared => Some(self.shared.as_path()),
            Scope::Local => self.local.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRecord {
    pub kind: RecordKind,
    pub scope: Scope,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub related: Vec<RecordId>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub id: Option<RecordId>,
}

impl NewRecord {
    #[must_use]
    pub fn new(kind: RecordKind, scope: Scope, title: impl Into<String>) -> Self {
        Self {
            kind,
            scope,
            title: title.into(),
            summary: String::new(),
            tags: Vec::new(),
            keywords: Vec::new(),
            triggers: Vec::new(),
            related: Vec::new(),
            files: Vec::new(),
            id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordPatch {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub keywords: Option<Vec<String>>,
    pub triggers: Option<Vec<String>>,
    pub related: Option<Vec<RecordId>>,
    pub files: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListFilter {
    pub kind: Option<RecordKind>,
    pub scope: Option<Scope>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchRequest {
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub kind: Option<RecordKind>,
    pub scope: Option<Scope>,
    pub limit: Option<usize>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

impl SearchRequest {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tags: Vec::new(),
            kind: None,
            scope: None,
            limit: None,
            as_of: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitResult {
    pub roots: Vec<String>,
    pub config_created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopedRebuild {
    pub scope: Scope,
    pub report: RebuildReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopedStatus {
    pub scope: Scope,
    pub needs_rebuild: bool,
    #[serde(flatten)]
    pub store: StoreStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStatus {
    pub strategy: RebuildStrategy,
    pub threshold_entries: usize,
    pub roots: Vec<ScopedStatus>,
}

#[derive(Debug, Clone)]
pub struct MemoryIndexApi {
    roots: StorageRoots,
    writer: String,
}

impl MemoryIndexApi {
    #[must_use]
    pub fn new(roots: StorageRoots, writer: impl Into<String>) -> Self {
        Self { roots, writer: writer.into() }
    }

    #[must_use]
    pub fn roots(&self) -> &StorageRoots {
        &self.roots
    }

    /// Effective configuration: local `config.json` keys override shared ones,
    /// missing files fall back to defaults.
    ///
    /// # Errors
    /// Returns an error when a config file exists but is malformed or invalid.
    pub fn load_config(&self) -> Result<IndexConfig> {
        let mut merged = Value::Object(serde_json::Map::new());
        for root in std::iter::once(&self.roots.shared).chain(self.roots.local.iter()) {
            if let Some(layer) = read_config_layer(&root.join(CONFIG_FILE))? {
                merge_json(&mut merged, layer);
            }
        }
        let config: IndexConfig =
            serde_json::from_value(merged).context("failed to decode merged index configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn stores(&self, config: &IndexConfig) -> Vec<(Scope, IndexStore)> {
        let options = StoreOptions::from_config(config);
        [Scope::Shared, Scope::Local]
            .into_iter()
            .filter_map(|scope| {
                self.roots
                    .root_for(scope)
                    .map(|root| (scope, IndexStore::new(root, options.clone())))
            })
            .collect()
    }

    fn store_for(&self, scope: Scope, config: &IndexConfig) -> Result<IndexStore> {
        let root = self.roots.root_for(scope).ok_or_else(|| {
            IndexError::Validation(format!(
                "scope {} requires a local storage root",
                scope.as_str()
            ))
        })?;
        Ok(IndexStore::new(root, StoreOptions::from_config(config)))
    }

    /// Create the storage directories and a default shared `config.json`.
    ///
    /// # Errors
    /// Returns an error when directories or the config file cannot be written.
    pub fn init(&self) -> Result<InitResult> {
        let config = self.load_config()?;
        let mut roots = Vec::new();
        for (_, store) in self.stores(&config) {
            store.init()?;
            roots.push(store.root().display().to_string());
        }

        let config_path = self.roots.shared.join(CONFIG_FILE);
        let config_created = !config_path.exists();
        if config_created {
            let encoded = serde_json::to_vec_pretty(&IndexConfig::default())
                .context("failed to encode default configuration")?;
            fs::write(&config_path, encoded)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }
        Ok(InitResult { roots, config_created })
    }

    /// Create a record in the root matching its scope.
    ///
    /// Keywords and triggers are derived from the content when none are given. An
    /// id is generated when `input.id` is empty; callers that may retry after a
    /// timed-out write should set it so the retry upserts instead of duplicating.
    ///
    /// # Errors
    /// Returns a validation error for malformed input or a missing local root, and
    /// an I/O error when the log entry cannot be written.
    pub fn add_record(&self, input: NewRecord) -> Result<MemoryRecord> {
        let config = self.load_config()?;
        let store = self.store_for(input.scope, &config)?;
        let record = build_record(input, OffsetDateTime::now_utc());

        store.append_operation(
            OperationKind::Add,
            AppendTarget::Record(record.clone()),
            &self.writer,
        )?;
        self.rebuild_after_write(&store, &config);
        Ok(record)
    }

    /// Apply `patch` to an existing record and append it as a replacing update.
    ///
    /// # Errors
    /// Returns an error when the record does not exist or the update is invalid.
    pub fn update_record(&self, id: &RecordId, patch: RecordPatch) -> Result<MemoryRecord> {
        let config = self.load_config()?;
        let (store, current) = self
            .locate(id, &config)?
            .ok_or_else(|| anyhow!("record {id} not found"))?;

        let record = apply_patch(current, patch, OffsetDateTime::now_utc());
        store.append_operation(
            OperationKind::Update,
            AppendTarget::Record(record.clone()),
            &self.writer,
        )?;
        self.rebuild_after_write(&store, &config);
        Ok(record)
    }

    /// Returns `false` when no root holds the record.
    ///
    /// # Errors
    /// Returns an error when views cannot be read or the log entry cannot be written.
    pub fn delete_record(&self, id: &RecordId) -> Result<bool> {
        let config = self.load_config()?;
        let Some((store, _)) = self.locate(id, &config)? else {
            return Ok(false);
        };
        store.append_operation(OperationKind::Delete, AppendTarget::Id(id.clone()), &self.writer)?;
        self.rebuild_after_write(&store, &config);
        Ok(true)
    }

    /// # Errors
    /// Returns an error when views cannot be read or the log entry cannot be written.
    pub fn record_access(&self, id: &RecordId, query: Option<&str>) -> Result<Option<AccessInfo>> {
        let config = self.load_config()?;
        let Some((store, _)) = self.locate(id, &config)? else {
            return Ok(None);
        };
        let access = store.record_access(id, query, &self.writer)?;
        self.rebuild_after_write(&store, &config);
        Ok(access)
    }

    /// # Errors
    /// Returns an error when a view cannot be read.
    pub fn get(&self, id: &RecordId) -> Result<Option<MemoryRecord>> {
        let config = self.load_config()?;
        Ok(self.locate(id, &config)?.map(|(_, record)| record))
    }

    /// Look up a record and count the lookup as an access.
    ///
    /// # Errors
    /// Returns an error when views cannot be read or the access cannot be written.
    pub fn show(&self, id: &RecordId) -> Result<Option<MemoryRecord>> {
        let Some(mut record) = self.get(id)? else {
            return Ok(None);
        };
        if let Some(access) = self.record_access(id, None)? {
            record.access = access;
        }
        Ok(Some(record))
    }

    /// Records of every root, newest first.
    ///
    /// # Errors
    /// Returns an error when a view cannot be read.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<MemoryRecord>> {
        let config = self.load_config()?;
        let mut records = self
            .merged_records(&config)?
            .into_iter()
            .filter(|record| filter.kind.is_none() || filter.kind == Some(record.kind))
            .filter(|record| filter.scope.is_none() || filter.scope == Some(record.scope))
            .filter(|record| filter.tags.iter().all(|tag| record.tags.contains(tag)))
            .collect::<Vec<_>>();
        records.sort_by(|lhs, rhs| {
            rhs.created_at.cmp(&lhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
        });
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Rank records of every root with the configured weights.
    ///
    /// # Errors
    /// Returns an error when a view cannot be read or the query is invalid.
    pub fn search(&self, request: SearchRequest) -> Result<Vec<SearchHit>> {
        let config = self.load_config()?;
        let records = self.merged_records(&config)?;
        let query = SearchQuery {
            text: request.text,
            tags: request.tags,
            kind: request.kind,
            scope: request.scope,
            limit: request.limit,
            as_of: request.as_of.unwrap_or_else(OffsetDateTime::now_utc),
        };
        Ok(search_records(&records, &query, &config.ranking)?)
    }

    /// Rebuild one root, or every configured root when `scope` is `None`.
    ///
    /// # Errors
    /// Returns an error when a requested root is not configured or a rebuild fails.
    pub fn rebuild(&self, scope: Option<Scope>) -> Result<Vec<ScopedRebuild>> {
        let config = self.load_config()?;
        let stores = match scope {
            Some(scope) => vec![(scope, self.store_for(scope, &config)?)],
            None => self.stores(&config),
        };

        let mut reports = Vec::new();
        for (scope, store) in stores {
            reports.push(ScopedRebuild { scope, report: store.rebuild()? });
        }
        Ok(reports)
    }

    /// Rebuild only the roots whose pending logs exceed the configured threshold.
    ///
    /// # Errors
    /// Returns an error when a log directory cannot be listed or a rebuild fails.
    pub fn rebuild_if_needed(&self) -> Result<Vec<ScopedRebuild>> {
        let config = self.load_config()?;
        let mut reports = Vec::new();
        for (scope, store) in self.stores(&config) {
            if store.should_rebuild(config.rebuild.threshold_entries)? {
                reports.push(ScopedRebuild { scope, report: store.rebuild()? });
            }
        }
        Ok(reports)
    }

    /// # Errors
    /// Returns an error when a root cannot be inspected.
    pub fn status(&self) -> Result<IndexStatus> {
        let config = self.load_config()?;
        let mut roots = Vec::new();
        for (scope, store) in self.stores(&config) {
            let status = store.status()?;
            roots.push(ScopedStatus {
                scope,
                needs_rebuild: status.pending_logs > config.rebuild.threshold_entries,
                store: status,
            });
        }
        Ok(IndexStatus {
            strategy: config.rebuild.strategy,
            threshold_entries: config.rebuild.threshold_entries,
            roots,
        })
    }

    /// # Errors
    /// Returns an error when a view cannot be read.
    pub fn stats(&self) -> Result<IndexStats> {
        let config = self.load_config()?;
        Ok(compute_stats(&self.merged_records(&config)?))
    }

    fn merged_records(&self, config: &IndexConfig) -> Result<Vec<MemoryRecord>> {
        let mut merged = BTreeMap::new();
        for (scope, store) in self.stores(config) {
            let view = store
                .read_view(true)
                .with_context(|| format!("failed to read {} index", scope.as_str()))?;
            for (id, record) in view.records {
                merged.entry(id).or_insert(record);
            }
        }
        Ok(merged.into_values().collect())
    }

    fn locate(
        &self,
        id: &RecordId,
        config: &IndexConfig,
    ) -> Result<Option<(IndexStore, MemoryRecord)>> {
        for (scope, store) in self.stores(config) {
            let view = store
                .read_view(true)
                .with_context(|| format!("failed to read {} index", scope.as_str()))?;
            if let Some(record) = view.records.get(id) {
                return Ok(Some((store, record.clone())));
            }
        }
        Ok(None)
    }

    fn rebuild_after_write(&self, store: &IndexStore, config: &IndexConfig) {
        if config.rebuild.strategy != RebuildStrategy::Threshold {
            return;
        }
        let outcome = store
            .should_rebuild(config.rebuild.threshold_entries)
            .and_then(|needed| if needed { store.rebuild().map(Some) } else { Ok(None) });
        match outcome {
            Ok(Some(report)) => tracing::info!(
                root = %store.root().display(),
                writer = %self.writer,
                consumed = report.consumed_logs,
                skipped = report.skipped,
                "automatic rebuild finished"
            ),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                root = %store.root().display(),
                error = %err,
                "automatic rebuild failed; pending logs are kept"
            ),
        }
    }
}

fn read_config_layer(path: &Path) -> Result<Option<Value>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    let value: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    if !value.is_object() {
        return Err(anyhow!("config {} MUST contain a JSON object", path.display()));
    }
    Ok(Some(value))
}

fn merge_json(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

fn build_record(input: NewRecord, now: OffsetDateTime) -> MemoryRecord {
    let id = input.id.unwrap_or_else(|| RecordId::generate(input.kind));
    let mut record = MemoryRecord::new(id, input.kind, input.scope, input.title.trim(), now);
    record.summary = input.summary.trim().to_string();
    record.tags = normalize_tags(&input.tags);
    record.keywords = if input.keywords.is_empty() {
        derive_keywords(&record.title, &record.summary, &input.files)
    } else {
        input.keywords
    };
    record.triggers = if input.triggers.is_empty() {
        derive_triggers(&record.title, &record.tags, &input.files)
    } else {
        input.triggers
    };
    record.related = input.related;
    record.files = input.files;
    record
}

fn apply_patch(mut record: MemoryRecord, patch: RecordPatch, now: OffsetDateTime) -> MemoryRecord {
    if let Some(title) = patch.title {
        record.title = title.trim().to_string();
    }
    if let Some(summary) = patch.summary {
        record.summary = summary.trim().to_string();
    }
    if let Some(tags) = patch.tags {
        record.tags = normalize_tags(&tags);
    }
    if let Some(keywords) = patch.keywords {
        record.keywords = keywords;
    }
    if let Some(triggers) = patch.triggers {
        record.triggers = triggers;
    }
    if let Some(related) = patch.related {
        record.related = related;
    }
    if let Some(files) = patch.files {
        record.files = files;
    }
    record.updated_at = record.updated_at.max(now);
    record
}
