//! Domain model for the append-log-backed memory index.
//!
//! The index is a write-ahead log with checkpoints: every write is an immutable
//! [`LogEntry`] (the intent record), the [`IndexSnapshot`] is the checkpoint, and
//! [`MergedView::replay`] is the deterministic fold that turns a checkpoint plus
//! pending log entries into the current record set. Nothing in this crate touches
//! the filesystem.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;
pub const RECENT_QUERY_LIMIT: usize = 10;
pub const DEFAULT_REBUILD_THRESHOLD: usize = 20;
pub const MAX_RECORD_ID_LEN: usize = 128;

const MAX_DERIVED_KEYWORDS: usize = 20;
const MOST_ACCESSED_LIMIT: usize = 5;
const SECONDS_PER_DAY: f64 = 86_400.0;
const TRIGGER_TECH_WORDS: [&str; 12] = [
    "python",
    "javascript",
    "typescript",
    "react",
    "vue",
    "django",
    "flask",
    "fastapi",
    "auth",
    "database",
    "api",
    "rust",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IndexError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
    #[error("integrity error: {0}")]
    Integrity(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generate a fresh, never-reused id of the form `<kind>-<ulid>`.
    #[must_use]
    pub fn generate(kind: RecordKind) -> Self {
        Self(format!("{}-{}", kind.as_str(), Ulid::new().to_string().to_ascii_lowercase()))
    }

    /// Parse a caller-supplied id.
    ///
    /// # Errors
    /// Returns [`IndexError::Validation`] when the id is empty, too long, or contains
    /// characters outside `[A-Za-z0-9._:-]`.
    pub fn parse(value: &str) -> Result<Self, IndexError> {
        validate_record_id(value)?;
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_record_id(value: &str) -> Result<(), IndexError> {
    if value.is_empty() {
        return Err(IndexError::Validation("record id MUST be non-empty".to_string()));
    }
    if value.len() > MAX_RECORD_ID_LEN {
        return Err(IndexError::Validation(format!(
            "record id MUST be at most {MAX_RECORD_ID_LEN} bytes"
        )));
    }
    if !value.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | ':' | '-'))
    {
        return Err(IndexError::Validation(format!(
            "record id {value:?} MUST only contain [A-Za-z0-9._:-]"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    #[serde(alias = "session")]
    Note,
    Decision,
    Implementation,
    Pattern,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Decision => "decision",
            Self::Implementation => "implementation",
            Self::Pattern => "pattern",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "note" | "session" => Some(Self::Note),
            "decision" => Some(Self::Decision),
            "implementation" => Some(Self::Implementation),
            "pattern" => Some(Self::Pattern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[serde(alias = "global")]
    Shared,
    #[serde(alias = "project")]
    Local,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Local => "local",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "shared" | "global" => Some(Self::Shared),
            "local" | "project" => Some(Self::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecentQuery {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub query: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AccessInfo {
    pub count: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub first_accessed: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_accessed: Option<OffsetDateTime>,
    #[serde(default)]
    pub recent_queries: VecDeque<RecentQuery>,
}

impl AccessInfo {
    /// Count one access at `at`, remembering `query` in the bounded recent-query list.
    pub fn record(&mut self, at: OffsetDateTime, query: Option<&str>) {
        self.count = self.count.saturating_add(1);
        self.first_accessed = Some(self.first_accessed.map_or(at, |first| first.min(at)));
        self.last_accessed = Some(self.last_accessed.map_or(at, |last| last.max(at)));

        if let Some(query) = query.map(str::trim).filter(|query| !query.is_empty()) {
            self.recent_queries.push_back(RecentQuery { at, query: query.to_string() });
            while self.recent_queries.len() > RECENT_QUERY_LIMIT {
                self.recent_queries.pop_front();
            }
        }
    }

    /// Join two access states.
    ///
    /// The join is commutative and idempotent, so replaying the same access entry
    /// twice, or in a different interleaving, never lowers a count.
    pub fn merge(&mut self, other: &AccessInfo) {
        self.count = self.count.max(other.count);
        self.first_accessed = match (self.first_accessed, other.first_accessed) {
            (Some(lhs), Some(rhs)) => Some(lhs.min(rhs)),
            (lhs, rhs) => lhs.or(rhs),
        };
        self.last_accessed = match (self.last_accessed, other.last_accessed) {
            (Some(lhs), Some(rhs)) => Some(lhs.max(rhs)),
            (lhs, rhs) => lhs.or(rhs),
        };

        let union = self
            .recent_queries
            .iter()
            .chain(other.recent_queries.iter())
            .cloned()
            .collect::<BTreeSet<_>>();
        let skip = union.len().saturating_sub(RECENT_QUERY_LIMIT);
        self.recent_queries = union.into_iter().skip(skip).collect();
    }

    /// Validate access-tracking consistency.
    ///
    /// # Errors
    /// Returns [`IndexError::Validation`] when counts and timestamps disagree or the
    /// recent-query list exceeds its cap.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.recent_queries.len() > RECENT_QUERY_LIMIT {
            return Err(IndexError::Validation(format!(
                "recent_queries MUST hold at most {RECENT_QUERY_LIMIT} entries"
            )));
        }

        match (self.count, self.first_accessed, self.last_accessed) {
            (0, None, None) => Ok(()),
            (0, _, _) => Err(IndexError::Validation(
                "access timestamps MUST be empty when count is 0".to_string(),
            )),
            (_, Some(first), Some(last)) if first <= last => Ok(()),
            (_, Some(_), Some(_)) => Err(IndexError::Validation(
                "first_accessed MUST NOT be later than last_accessed".to_string(),
            )),
            _ => Err(IndexError::Validation(
                "first_accessed and last_accessed MUST be set when count > 0".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MemoryRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    pub scope: Scope,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub related: Vec<RecordId>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub access: AccessInfo,
}

impl MemoryRecord {
    #[must_use]
    pub fn new(
        id: RecordId,
        kind: RecordKind,
        scope: Scope,
        title: impl Into<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            kind,
            scope,
            title: title.into(),
            created_at: now,
            updated_at: now,
            tags: BTreeSet::new(),
            summary: String::new(),
            keywords: Vec::new(),
            triggers: Vec::new(),
            related: Vec::new(),
            files: Vec::new(),
            access: AccessInfo::default(),
        }
    }

    /// Validate one record before it is allowed into the log.
    ///
    /// # Errors
    /// Returns [`IndexError::Validation`] when identity, title, timestamp ordering,
    /// list contents, related ids, or access tracking are malformed.
    pub fn validate(&self) -> Result<(), IndexError> {
        validate_record_id(self.id.as_str())?;

        if self.title.trim().is_empty() {
            return Err(IndexError::Validation("title MUST be non-empty".to_string()));
        }

        if self.updated_at < self.created_at {
            return Err(IndexError::Validation(
                "updated_at MUST NOT be earlier than created_at".to_string(),
            ));
        }

        for (field, values) in [
            ("tags", self.tags.iter().collect::<Vec<_>>()),
            ("keywords", self.keywords.iter().collect()),
            ("triggers", self.triggers.iter().collect()),
            ("files", self.files.iter().collect()),
        ] {
            if values.iter().any(|value| value.trim().is_empty()) {
                return Err(IndexError::Validation(format!(
                    "{field} MUST NOT contain empty entries"
                )));
            }
        }

        for related in &self.related {
            validate_record_id(related.as_str())?;
            if related == &self.id {
                return Err(IndexError::Validation(
                    "related MUST NOT reference the record itself".to_string(),
                ));
            }
        }

        self.access.validate()
    }
}

/// Trim tags and drop empty ones; the set form de-duplicates.
#[must_use]
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|tag| tag.as_ref().trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Update,
    Delete,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RecordUpdate {
    Replace(MemoryRecord),
    Access(AccessInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum LogOperation {
    Add(MemoryRecord),
    Update(RecordUpdate),
    Delete,
}

impl LogOperation {
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Add(_) => OperationKind::Add,
            Self::Update(_) => OperationKind::Update,
            Self::Delete => OperationKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LogEntry {
    pub record_id: RecordId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub writer: String,
    pub operation: LogOperation,
}

impl LogEntry {
    #[must_use]
    pub fn add(record: MemoryRecord, writer: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            record_id: record.id.clone(),
            timestamp,
            writer: writer.into(),
            operation: LogOperation::Add(record),
        }
    }

    #[must_use]
    pub fn replace(
        record: MemoryRecord,
        writer: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            record_id: record.id.clone(),
            timestamp,
            writer: writer.into(),
            operation: LogOperation::Update(RecordUpdate::Replace(record)),
        }
    }

    #[must_use]
    pub fn access(
        record_id: RecordId,
        access: AccessInfo,
        writer: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            record_id,
            timestamp,
            writer: writer.into(),
            operation: LogOperation::Update(RecordUpdate::Access(access)),
        }
    }

    #[must_use]
    pub fn delete(
        record_id: RecordId,
        writer: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self { record_id, timestamp, writer: writer.into(), operation: LogOperation::Delete }
    }

    /// Validate a log entry at the write boundary.
    ///
    /// # Errors
    /// Returns [`IndexError::Validation`] when the writer is blank, the target id is
    /// malformed, or a carried record/access payload is invalid or targets another id.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.writer.trim().is_empty() {
            return Err(IndexError::Validation(
                "writer MUST be provided for every log entry".to_string(),
            ));
        }
        validate_record_id(self.record_id.as_str())?;

        match &self.operation {
            LogOperation::Add(record) | LogOperation::Update(RecordUpdate::Replace(record)) => {
                if record.id != self.record_id {
                    return Err(IndexError::Validation(format!(
                        "payload id {} MUST match log entry target {}",
                        record.id, self.record_id
                    )));
                }
                record.validate()
            }
            LogOperation::Update(RecordUpdate::Access(access)) => access.validate(),
            LogOperation::Delete => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReplayOutcome {
    Applied,
    UnknownRecord,
}

/// Apply one log entry to a record map.
///
/// Add is insert-or-replace. A replacing update keeps `created_at`, never moves
/// `updated_at` backwards, and joins access state. Updates and deletes of ids that
/// are not present are no-ops reported as [`ReplayOutcome::UnknownRecord`].
pub fn apply_log_entry(
    records: &mut BTreeMap<RecordId, MemoryRecord>,
    entry: &LogEntry,
) -> ReplayOutcome {
    match &entry.operation {
        LogOperation::Add(record) => {
            records.insert(entry.record_id.clone(), record.clone());
            ReplayOutcome::Applied
        }
        LogOperation::Update(update) => {
            let Some(existing) = records.get_mut(&entry.record_id) else {
                return ReplayOutcome::UnknownRecord;
            };
            match update {
                RecordUpdate::Replace(record) => {
                    let mut replacement = record.clone();
                    replacement.id = existing.id.clone();
                    replacement.created_at = existing.created_at;
                    replacement.updated_at = existing.updated_at.max(record.updated_at);
                    replacement.access = existing.access.clone();
                    replacement.access.merge(&record.access);
                    *existing = replacement;
                }
                RecordUpdate::Access(access) => existing.access.merge(access),
            }
            ReplayOutcome::Applied
        }
        LogOperation::Delete => {
            if records.remove(&entry.record_id).is_some() {
                ReplayOutcome::Applied
            } else {
                ReplayOutcome::UnknownRecord
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub entry_id: String,
    pub entry: LogEntry,
}

impl PendingEntry {
    fn replay_order(lhs: &Self, rhs: &Self) -> Ordering {
        lhs.entry
            .timestamp
            .cmp(&rhs.entry.timestamp)
            .then_with(|| lhs.entry_id.cmp(&rhs.entry_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayDiagnostic {
    pub entry_id: String,
    pub record_id: Option<RecordId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BaseStatus {
    Loaded,
    Missing,
    Corrupt { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedView {
    pub base_status: BaseStatus,
    pub last_consolidated: Option<OffsetDateTime>,
    pub records: BTreeMap<RecordId, MemoryRecord>,
    pub replayed_entries: Vec<String>,
    pub diagnostics: Vec<ReplayDiagnostic>,
}

impl MergedView {
    #[must_use]
    pub fn from_base(
        base_status: BaseStatus,
        last_consolidated: Option<OffsetDateTime>,
        records: Vec<MemoryRecord>,
    ) -> Self {
        Self {
            base_status,
            last_consolidated,
            records: records.into_iter().map(|record| (record.id.clone(), record)).collect(),
            replayed_entries: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Replay pending entries in `(timestamp, entry id)` order on top of the view.
    pub fn replay(&mut self, mut entries: Vec<PendingEntry>) {
        entries.sort_by(PendingEntry::replay_order);
        for pending in entries {
            match apply_log_entry(&mut self.records, &pending.entry) {
                ReplayOutcome::Applied => {}
                ReplayOutcome::UnknownRecord => {
                    let message = match pending.entry.operation.kind() {
                        OperationKind::Update => "update of unknown record",
                        OperationKind::Delete => "delete of absent record",
                        OperationKind::Add => "add was not applied",
                    };
                    self.diagnostics.push(ReplayDiagnostic {
                        entry_id: pending.entry_id.clone(),
                        record_id: Some(pending.entry.record_id.clone()),
                        message: message.to_string(),
                    });
                }
            }
            self.replayed_entries.push(pending.entry_id);
        }
    }

    /// Note an entry that could not be decoded and was skipped.
    pub fn push_skipped(&mut self, entry_id: impl Into<String>, reason: impl Into<String>) {
        self.diagnostics.push(ReplayDiagnostic {
            entry_id: entry_id.into(),
            record_id: None,
            message: reason.into(),
        });
    }

    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<&MemoryRecord> {
        self.records.get(&RecordId(id.to_string()))
    }

    pub fn records(&self) -> impl Iterator<Item = &MemoryRecord> {
        self.records.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn into_records(self) -> Vec<MemoryRecord> {
        self.records.into_values().collect()
    }

    /// Rank this view against `query`.
    ///
    /// # Errors
    /// Returns [`IndexError::Query`] when the ranking weights are unusable.
    pub fn search(
        &self,
        query: &SearchQuery,
        weights: &RankingWeights,
    ) -> Result<Vec<SearchHit>, IndexError> {
        search_records(self.records(), query, weights)
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        compute_stats(self.records())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RankingWeights {
    pub title_match: f64,
    pub keyword_match: f64,
    pub trigger_match: f64,
    pub access_weight: f64,
    pub recency_weight: f64,
    pub recency_window_days: u32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            title_match: 1.0,
            keyword_match: 0.6,
            trigger_match: 0.3,
            access_weight: 0.1,
            recency_weight: 0.2,
            recency_window_days: 90,
        }
    }
}

impl RankingWeights {
    /// Check that every weight is a finite, non-negative number.
    ///
    /// # Errors
    /// Returns [`IndexError::Query`] for negative or non-finite weights or a zero
    /// recency window.
    pub fn validate(&self) -> Result<(), IndexError> {
        for (name, value) in [
            ("title_match", self.title_match),
            ("keyword_match", self.keyword_match),
            ("trigger_match", self.trigger_match),
            ("access_weight", self.access_weight),
            ("recency_weight", self.recency_weight),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(IndexError::Query(format!(
                    "ranking weight {name} MUST be finite and >= 0"
                )));
            }
        }
        if self.recency_window_days == 0 {
            return Err(IndexError::Query("recency_window_days MUST be >= 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub kind: Option<RecordKind>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
}

impl SearchQuery {
    #[must_use]
    pub fn new(text: impl Into<String>, as_of: OffsetDateTime) -> Self {
        Self { text: text.into(), tags: Vec::new(), kind: None, scope: None, limit: None, as_of }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Title,
    Keyword,
    Trigger,
    All,
}

impl MatchField {
    fn weight(self, weights: &RankingWeights) -> f64 {
        match self {
            Self::Title => weights.title_match,
            Self::Keyword => weights.keyword_match,
            Self::Trigger => weights.trigger_match,
            Self::All => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub match_weight: f64,
    pub access_bonus: f64,
    pub recency_bonus: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub rank: usize,
    pub score: f64,
    pub matched_field: MatchField,
    pub matched_terms: Vec<String>,
    pub breakdown: ScoreBreakdown,
    pub record: MemoryRecord,
}

#[must_use]
pub fn search_tie_breakers() -> Vec<String> {
    vec!["score desc".to_string(), "updated_at desc".to_string(), "id asc".to_string()]
}

/// Normalize free text into lowercase search terms of at least two characters.
///
/// Single-character input yields no terms; search then falls back to substring
/// matching rather than matching everything.
#[must_use]
pub fn tokenize(value: &str) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    for raw in value.split_whitespace() {
        let normalized = raw
            .chars()
            .filter(|ch| ch.is_alphanumeric() || *ch == '_' || *ch == '-')
            .collect::<String>()
            .to_lowercase();
        if normalized.chars().count() >= 2 {
            terms.insert(normalized);
        }
    }
    terms
}

fn tokenize_all<'a>(values: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    values.into_iter().flat_map(tokenize).collect()
}

fn count_as_f64(count: u64) -> f64 {
    f64::from(u32::try_from(count).unwrap_or(u32::MAX))
}

fn access_bonus(record: &MemoryRecord, weights: &RankingWeights) -> f64 {
    weights.access_weight * count_as_f64(record.access.count).ln_1p()
}

fn recency_bonus(record: &MemoryRecord, as_of: OffsetDateTime, weights: &RankingWeights) -> f64 {
    let reference = record.access.last_accessed.unwrap_or(record.created_at);
    let age_days = ((as_of - reference).as_seconds_f64() / SECONDS_PER_DAY).max(0.0);
    let remaining = 1.0 - age_days / f64::from(weights.recency_window_days);
    weights.recency_weight * remaining.clamp(0.0, 1.0)
}

fn best_match(
    record: &MemoryRecord,
    query: &SearchQuery,
    query_terms: &BTreeSet<String>,
    weights: &RankingWeights,
) -> Option<(MatchField, Vec<String>)> {
    let needle = query.text.trim().to_lowercase();
    if needle.is_empty() {
        return Some((MatchField::All, Vec::new()));
    }

    let fields = [
        (MatchField::Title, vec![record.title.as_str()]),
        (
            MatchField::Keyword,
            std::iter::once(record.summary.as_str())
                .chain(record.keywords.iter().map(String::as_str))
                .collect(),
        ),
        (MatchField::Trigger, record.triggers.iter().map(String::as_str).collect()),
    ];

    let mut best: Option<(MatchField, Vec<String>)> = None;
    for (field, values) in fields {
        let matched = if query_terms.is_empty() {
            // Queries made only of short tokens fall back to substring matching.
            if values.iter().any(|value| value.to_lowercase().contains(&needle)) {
                vec![needle.clone()]
            } else {
                Vec::new()
            }
        } else {
            query_terms.intersection(&tokenize_all(values)).cloned().collect()
        };
        if matched.is_empty() {
            continue;
        }
        let better = match &best {
            Some((current, _)) => field.weight(weights) > current.weight(weights),
            None => true,
        };
        if better {
            best = Some((field, matched));
        }
    }
    best
}

fn passes_filters(record: &MemoryRecord, query: &SearchQuery) -> bool {
    if query.kind.is_some_and(|kind| kind != record.kind) {
        return false;
    }
    if query.scope.is_some_and(|scope| scope != record.scope) {
        return false;
    }
    query.tags.iter().all(|tag| record.tags.contains(tag))
}

fn cmp_hits(lhs: &SearchHit, rhs: &SearchHit) -> Ordering {
    rhs.score
        .total_cmp(&lhs.score)
        .then_with(|| rhs.record.updated_at.cmp(&lhs.record.updated_at))
        .then_with(|| lhs.record.id.cmp(&rhs.record.id))
}

/// Rank records against a free-text query with tag/kind/scope filters.
///
/// The match weight is the highest weight among the matching fields, never a sum;
/// equal weights prefer title, then keyword/summary, then trigger. Only a blank
/// query matches every record. Access count adds a logarithmic
/// bonus and recent access (or creation) adds a bonus that decays linearly over the
/// recency window.
///
/// # Errors
/// Returns [`IndexError::Query`] when the ranking weights are unusable or the limit
/// is zero.
pub fn search_records<'a, I>(
    records: I,
    query: &SearchQuery,
    weights: &RankingWeights,
) -> Result<Vec<SearchHit>, IndexError>
where
    I: IntoIterator<Item = &'a MemoryRecord>,
{
    weights.validate()?;
    if query.limit == Some(0) {
        return Err(IndexError::Query("limit MUST be >= 1 when provided".to_string()));
    }

    let query_terms = tokenize(&query.text);
    let mut hits = Vec::new();
    for record in records {
        if !passes_filters(record, query) {
            continue;
        }
        let Some((matched_field, matched_terms)) =
            best_match(record, query, &query_terms, weights)
        else {
            continue;
        };

        let breakdown = ScoreBreakdown {
            match_weight: matched_field.weight(weights),
            access_bonus: access_bonus(record, weights),
            recency_bonus: recency_bonus(record, query.as_of, weights),
        };
        hits.push(SearchHit {
            rank: 0,
            score: breakdown.match_weight + breakdown.access_bonus + breakdown.recency_bonus,
            matched_field,
            matched_terms,
            breakdown,
            record: record.clone(),
        });
    }

    hits.sort_by(cmp_hits);
    if let Some(limit) = query.limit {
        hits.truncate(limit);
    }
    for (index, hit) in hits.iter_mut().enumerate() {
        hit.rank = index + 1;
    }
    Ok(hits)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub total_records: usize,
    pub total_accesses: u64,
    pub by_kind: BTreeMap<String, usize>,
    pub by_scope: BTreeMap<String, usize>,
    pub most_accessed: Vec<RecordId>,
    pub never_accessed: Vec<RecordId>,
    pub oldest_unaccessed: Option<RecordId>,
}

#[must_use]
pub fn compute_stats<'a, I>(records: I) -> IndexStats
where
    I: IntoIterator<Item = &'a MemoryRecord>,
{
    let records = records.into_iter().collect::<Vec<_>>();
    let mut stats = IndexStats {
        total_records: records.len(),
        total_accesses: records
            .iter()
            .fold(0_u64, |total, record| total.saturating_add(record.access.count)),
        ..IndexStats::default()
    };

    for record in &records {
        *stats.by_kind.entry(record.kind.as_str().to_string()).or_default() += 1;
        *stats.by_scope.entry(record.scope.as_str().to_string()).or_default() += 1;
    }

    let mut by_access = records.iter().filter(|record| record.access.count > 0).collect::<Vec<_>>();
    by_access.sort_by(|lhs, rhs| {
        rhs.access.count.cmp(&lhs.access.count).then_with(|| lhs.id.cmp(&rhs.id))
    });
    stats.most_accessed =
        by_access.into_iter().take(MOST_ACCESSED_LIMIT).map(|record| record.id.clone()).collect();

    let mut unaccessed =
        records.iter().filter(|record| record.access.count == 0).collect::<Vec<_>>();
    unaccessed.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
    stats.oldest_unaccessed = unaccessed
        .iter()
        .min_by(|lhs, rhs| lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id)))
        .map(|record| record.id.clone());
    stats.never_accessed = unaccessed.into_iter().map(|record| record.id.clone()).collect();

    stats
}

/// SHA-256 over the compact JSON encoding of `records`, hex encoded.
///
/// # Errors
/// Returns [`IndexError::Integrity`] when the records cannot be serialized.
pub fn records_checksum(records: &[MemoryRecord]) -> Result<String, IndexError> {
    let encoded = serde_json::to_vec(records)
        .map_err(|err| IndexError::Integrity(format!("failed to encode records: {err}")))?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub schema_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_consolidated: OffsetDateTime,
    pub checksum: String,
    pub records: Vec<MemoryRecord>,
    #[serde(default)]
    pub stats: IndexStats,
}

impl IndexSnapshot {
    /// Build a checkpoint from a record set, ordering records by id.
    ///
    /// # Errors
    /// Returns [`IndexError::Integrity`] when the checksum cannot be computed.
    pub fn from_records(
        mut records: Vec<MemoryRecord>,
        consolidated_at: OffsetDateTime,
    ) -> Result<Self, IndexError> {
        records.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
        let checksum = records_checksum(&records)?;
        let stats = compute_stats(&records);
        Ok(Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            last_consolidated: consolidated_at,
            checksum,
            records,
            stats,
        })
    }

    /// Verify schema version and checksum of a decoded checkpoint.
    ///
    /// # Errors
    /// Returns [`IndexError::Integrity`] on an unsupported schema version or a
    /// checksum mismatch.
    pub fn verify(&self) -> Result<(), IndexError> {
        if self.schema_version == 0 || self.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(IndexError::Integrity(format!(
                "unsupported snapshot schema version {}; supported range is 1..={}",
                self.schema_version, SNAPSHOT_SCHEMA_VERSION
            )));
        }
        let actual = records_checksum(&self.records)?;
        if actual != self.checksum {
            return Err(IndexError::Integrity(format!(
                "snapshot checksum mismatch: expected {}, got {actual}",
                self.checksum
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStrategy {
    Threshold,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RebuildPolicy {
    pub strategy: RebuildStrategy,
    pub threshold_entries: usize,
}

impl Default for RebuildPolicy {
    fn default() -> Self {
        Self { strategy: RebuildStrategy::Threshold, threshold_entries: DEFAULT_REBUILD_THRESHOLD }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    pub rebuild: RebuildPolicy,
    pub ranking: RankingWeights,
    pub io_timeout_ms: Option<u64>,
    pub exclusive_rebuild: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            rebuild: RebuildPolicy::default(),
            ranking: RankingWeights::default(),
            io_timeout_ms: None,
            exclusive_rebuild: true,
        }
    }
}

impl IndexConfig {
    /// # Errors
    /// Returns [`IndexError::Validation`] for a zero I/O timeout, or the ranking
    /// validation error for unusable weights.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.io_timeout_ms == Some(0) {
            return Err(IndexError::Validation("io_timeout_ms MUST be >= 1".to_string()));
        }
        self.ranking.validate()
    }

    #[must_use]
    pub fn io_timeout(&self) -> Option<std::time::Duration> {
        self.io_timeout_ms.map(std::time::Duration::from_millis)
    }
}

fn push_unique(values: &mut Vec<String>, candidate: String) {
    if !values.contains(&candidate) {
        values.push(candidate);
    }
}

fn file_extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.').map(|(_, ext)| ext).filter(|ext| !ext.is_empty())
}

/// Derive search keywords from title, summary and associated file paths.
///
/// Words shorter than three characters are dropped, order of first appearance is
/// kept, and at most 20 keywords are returned.
#[must_use]
pub fn derive_keywords(title: &str, summary: &str, files: &[String]) -> Vec<String> {
    let mut candidates = Vec::new();
    for text in [title, summary] {
        for raw in text.split_whitespace() {
            candidates.push(
                raw.chars()
                    .filter(|ch| ch.is_alphanumeric() || *ch == '_' || *ch == '-')
                    .collect::<String>()
                    .to_lowercase(),
            );
        }
    }
    for file in files {
        if let Some(ext) = file_extension(file) {
            candidates.push(ext.to_lowercase());
        }
        let mut parts = file.split('/').collect::<Vec<_>>();
        parts.pop();
        candidates.extend(parts.into_iter().map(str::to_lowercase));
    }

    let mut keywords = Vec::new();
    for candidate in candidates {
        if candidate.chars().count() > 2 {
            push_unique(&mut keywords, candidate);
        }
        if keywords.len() == MAX_DERIVED_KEYWORDS {
            break;
        }
    }
    keywords
}

/// Derive lazy-inclusion triggers: tags, `.ext` of files, and known technology
/// words appearing in the title.
#[must_use]
pub fn derive_triggers(title: &str, tags: &BTreeSet<String>, files: &[String]) -> Vec<String> {
    let mut triggers = tags.clone();
    for file in files {
        if let Some(ext) = file_extension(file) {
            triggers.insert(format!(".{}", ext.to_lowercase()));
        }
    }
    let title = title.to_lowercase();
    for word in TRIGGER_TECH_WORDS {
        if title.contains(word) {
            triggers.insert(word.to_string());
        }
    }
    triggers.into_iter().collect()
}
