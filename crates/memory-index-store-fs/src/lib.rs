use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use memory_index_core::{
    AccessInfo, BaseStatus, IndexConfig, IndexError, IndexSnapshot, LogEntry, MemoryRecord,
    MergedView, OperationKind, PendingEntry, RecordId,
};
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use ulid::Ulid;

pub const SNAPSHOT_FILE: &str = "index.json";
pub const LOG_DIR: &str = "index-log";
pub const QUARANTINE_DIR: &str = "quarantine";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CONFIG_FILE: &str = "config.json";
pub const REBUILD_LOCK_FILE: &str = ".rebuild.lock";

const LOG_SUFFIX: &str = ".json";
const STAMP_LEN: usize = 25;
const ULID_LEN: usize = 26;
const MAX_WRITER_LEN: usize = 64;
const MAX_READ_ATTEMPTS: usize = 3;
const MANIFEST_SUMMARY_CHARS: usize = 200;

static LAST_LOG_NANOS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Current UTC instant, strictly later than any instant previously returned in
/// this process.
///
/// # Errors
/// Returns an error when the system clock is outside the representable range.
pub fn next_log_instant() -> Result<OffsetDateTime> {
    let now = i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos())
        .context("system clock is outside the supported range")?;
    let mut previous = LAST_LOG_NANOS.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(previous.saturating_add(1));
        match LAST_LOG_NANOS.compare_exchange(
            previous,
            candidate,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                return OffsetDateTime::from_unix_timestamp_nanos(i128::from(candidate))
                    .context("failed to build log timestamp");
            }
            Err(actual) => previous = actual,
        }
    }
}

/// Reduce a writer label to characters that are safe inside a file name.
#[must_use]
pub fn sanitize_writer(writer: &str) -> String {
    let cleaned = writer
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_WRITER_LEN)
        .collect::<String>();
    if cleaned.is_empty() {
        "anonymous".to_string()
    } else {
        cleaned
    }
}

/// Name of one pending log file: `<stamp>-<ulid>-<writer>.json`.
///
/// The stamp is `YYYYMMDDTHHMMSSnnnnnnnnnZ` in UTC, so lexical order of names is
/// chronological order of appends.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogFileName {
    pub file_name: String,
    pub timestamp: OffsetDateTime,
    pub ulid: Ulid,
    pub writer: String,
}

impl LogFileName {
    #[must_use]
    pub fn new(writer: &str, timestamp: OffsetDateTime) -> Self {
        let ulid = Ulid::new();
        let writer = sanitize_writer(writer);
        let file_name = format!("{}-{ulid}-{writer}{LOG_SUFFIX}", format_stamp(timestamp));
        Self { file_name, timestamp, ulid, writer }
    }

    #[must_use]
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(LOG_SUFFIX)?;
        let timestamp = parse_stamp(stem.get(..STAMP_LEN)?)?;
        let rest = stem.get(STAMP_LEN..)?.strip_prefix('-')?;
        let ulid = Ulid::from_string(rest.get(..ULID_LEN)?).ok()?;
        let writer = rest.get(ULID_LEN..)?.strip_prefix('-')?;
        if writer.is_empty() {
            return None;
        }
        Some(Self { file_name: file_name.to_string(), timestamp, ulid, writer: writer.to_string() })
    }

    /// Entry id used as the replay tie-breaker: the file name without extension.
    #[must_use]
    pub fn entry_id(&self) -> &str {
        self.file_name.strip_suffix(LOG_SUFFIX).unwrap_or(&self.file_name)
    }
}

fn format_stamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}{:09}Z",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        at.nanosecond()
    )
}

fn parse_stamp(raw: &str) -> Option<OffsetDateTime> {
    let bytes = raw.as_bytes();
    if bytes.len() != STAMP_LEN || bytes[8] != b'T' || bytes[STAMP_LEN - 1] != b'Z' {
        return None;
    }
    let digits_ok = bytes[..8].iter().chain(&bytes[9..STAMP_LEN - 1]).all(u8::is_ascii_digit);
    if !digits_ok {
        return None;
    }

    let year = raw[0..4].parse::<i32>().ok()?;
    let month = Month::try_from(raw[4..6].parse::<u8>().ok()?).ok()?;
    let day = raw[6..8].parse::<u8>().ok()?;
    let hour = raw[9..11].parse::<u8>().ok()?;
    let minute = raw[11..13].parse::<u8>().ok()?;
    let second = raw[13..15].parse::<u8>().ok()?;
    let nanos = raw[15..24].parse::<u32>().ok()?;

    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms_nano(hour, minute, second, nanos).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub io_timeout: Option<Duration>,
    pub exclusive_rebuild: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { io_timeout: None, exclusive_rebuild: true }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn from_config(config: &IndexConfig) -> Self {
        Self { io_timeout: config.io_timeout(), exclusive_rebuild: config.exclusive_rebuild }
    }
}

#[derive(Debug, Clone)]
pub enum AppendTarget {
    Record(MemoryRecord),
    Id(RecordId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RebuildReport {
    pub skipped: bool,
    pub previous_base: Option<BaseStatus>,
    pub record_count: usize,
    pub consumed_logs: usize,
    pub quarantined_logs: usize,
    pub checksum: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub consolidated_at: Option<OffsetDateTime>,
}

impl RebuildReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            previous_base: None,
            record_count: 0,
            consumed_logs: 0,
            quarantined_logs: 0,
            checksum: None,
            consolidated_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub root: String,
    pub base: BaseStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_consolidated: Option<OffsetDateTime>,
    pub base_records: usize,
    pub pending_logs: usize,
    pub quarantined_logs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub id: RecordId,
    pub title: String,
    pub kind: String,
    pub scope: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub tags: Vec<String>,
    pub files: Vec<String>,
    pub access_count: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_accessed: Option<OffsetDateTime>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub checksum: String,
    pub total_records: usize,
    pub total_accesses: u64,
    pub records: Vec<ManifestEntry>,
}

impl Manifest {
    #[must_use]
    pub fn from_snapshot(snapshot: &IndexSnapshot) -> Self {
        let records = snapshot
            .records
            .iter()
            .map(|record| ManifestEntry {
                id: record.id.clone(),
                title: record.title.clone(),
                kind: record.kind.as_str().to_string(),
                scope: record.scope.as_str().to_string(),
                created_at: record.created_at,
                tags: record.tags.iter().cloned().collect(),
                files: record.files.clone(),
                access_count: record.access.count,
                last_accessed: record.access.last_accessed,
                summary: record.summary.chars().take(MANIFEST_SUMMARY_CHARS).collect(),
            })
            .collect();
        Self {
            generated_at: snapshot.last_consolidated,
            checksum: snapshot.checksum.clone(),
            total_records: snapshot.stats.total_records,
            total_accesses: snapshot.stats.total_accesses,
            records,
        }
    }
}

struct ViewRead {
    view: MergedView,
    consumed: Vec<PathBuf>,
    undecodable: Vec<PathBuf>,
}

enum ReadAttempt {
    Complete(ViewRead),
    Raced(String),
}

/// Held for the duration of one rebuild; dropping it releases the advisory lock.
pub struct RebuildLock {
    _file: File,
}

/// Append-log store rooted at one directory.
#[derive(Debug, Clone)]
pub struct IndexStore {
    root: PathBuf,
    options: StoreOptions,
}

impl IndexStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self { root: root.into(), options }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    #[must_use]
    pub fn quarantine_dir(&self) -> PathBuf {
        self.log_dir().join(QUARANTINE_DIR)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(REBUILD_LOCK_FILE)
    }

    /// Create the root and log directories.
    ///
    /// # Errors
    /// Returns an error when the directories cannot be created.
    pub fn init(&self) -> Result<()> {
        let log_dir = self.log_dir();
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))
    }

    /// Persist one log entry as a new immutable file and return its entry id.
    ///
    /// The entry is restamped with a fresh instant so that its timestamp matches
    /// the instant encoded in its file name.
    ///
    /// # Errors
    /// Returns [`IndexError::Validation`] (no file is created) for an invalid entry,
    /// an I/O error when the file cannot be written, or `TimedOut` when the
    /// configured I/O timeout elapses.
    pub fn append(&self, entry: &LogEntry) -> Result<String> {
        let at = next_log_instant()?;
        let mut entry = entry.clone();
        entry.timestamp = at;
        self.append_at(entry, at)
    }

    /// Build and append a log entry for `operation`, stamped with a fresh instant.
    ///
    /// # Errors
    /// Returns [`IndexError::Validation`] when an add or update is given only an id,
    /// plus every error [`IndexStore::append`] can return.
    pub fn append_operation(
        &self,
        operation: OperationKind,
        target: AppendTarget,
        writer: &str,
    ) -> Result<String> {
        let at = next_log_instant()?;
        let entry = match (operation, target) {
            (OperationKind::Add, AppendTarget::Record(record)) => LogEntry::add(record, writer, at),
            (OperationKind::Update, AppendTarget::Record(record)) => {
                LogEntry::replace(record, writer, at)
            }
            (OperationKind::Delete, AppendTarget::Record(record)) => {
                LogEntry::delete(record.id, writer, at)
            }
            (OperationKind::Delete, AppendTarget::Id(id)) => LogEntry::delete(id, writer, at),
            (operation, AppendTarget::Id(id)) => {
                return Err(IndexError::Validation(format!(
                    "{} of {id} MUST carry a full record",
                    operation.as_str()
                ))
                .into());
            }
        };
        self.append_at(entry, at)
    }

    /// Count one access of `id` and append it as an access-only update.
    ///
    /// Returns the new access state, or `None` when the record is not in the view.
    ///
    /// # Errors
    /// Returns an error when the view cannot be read or the entry cannot be written.
    pub fn record_access(
        &self,
        id: &RecordId,
        query: Option<&str>,
        writer: &str,
    ) -> Result<Option<AccessInfo>> {
        let view = self.read_view(true)?;
        let Some(record) = view.records.get(id) else {
            return Ok(None);
        };

        let at = next_log_instant()?;
        let mut access = record.access.clone();
        access.record(at, query);
        self.append_at(LogEntry::access(id.clone(), access.clone(), writer, at), at)?;
        Ok(Some(access))
    }

    fn append_at(&self, entry: LogEntry, at: OffsetDateTime) -> Result<String> {
        entry.validate()?;
        self.run_with_timeout("append", move |store| store.write_log_file(&entry, at))
    }

    fn write_log_file(&self, entry: &LogEntry, at: OffsetDateTime) -> Result<String> {
        self.init()?;
        let name = LogFileName::new(&entry.writer, at);
        let log_dir = self.log_dir();
        write_json_atomically(&log_dir, &log_dir.join(&name.file_name), entry, false)?;
        tracing::debug!(
            entry = name.entry_id(),
            record = %entry.record_id,
            operation = entry.operation.kind().as_str(),
            "appended log entry"
        );
        Ok(name.entry_id().to_string())
    }

    /// Pending log files in name order. Temp files and non-log names are ignored.
    ///
    /// # Errors
    /// Returns an error when the log directory exists but cannot be listed.
    pub fn list_pending_logs(&self) -> Result<Vec<LogFileName>> {
        let log_dir = self.log_dir();
        let entries = match fs::read_dir(&log_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list log directory {}", log_dir.display()))
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to list log directory {}", log_dir.display()))?;
            if !entry.file_type().is_ok_and(|kind| kind.is_file()) {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            match LogFileName::parse(file_name) {
                Some(name) => names.push(name),
                None => tracing::debug!(file = file_name, "ignoring non-log file in log directory"),
            }
        }
        names.sort_by(|lhs, rhs| lhs.file_name.cmp(&rhs.file_name));
        Ok(names)
    }

    /// # Errors
    /// Returns an error when the log directory cannot be listed.
    pub fn pending_log_count(&self) -> Result<usize> {
        Ok(self.list_pending_logs()?.len())
    }

    /// True when more than `threshold` log files are pending.
    ///
    /// # Errors
    /// Returns an error when the log directory cannot be listed.
    pub fn should_rebuild(&self, threshold: usize) -> Result<bool> {
        Ok(self.pending_log_count()? > threshold)
    }

    /// Load the base snapshot and, when `include_logs` is set, replay pending logs.
    ///
    /// A corrupt snapshot yields an empty base and a warning, never an error.
    ///
    /// # Errors
    /// Returns an error on I/O failures other than a missing snapshot, when pending
    /// logs keep vanishing mid-read, or when the I/O timeout elapses.
    pub fn read_view(&self, include_logs: bool) -> Result<MergedView> {
        self.run_with_timeout("read_view", move |store| {
            store.read_view_detailed(include_logs).map(|read| read.view)
        })
    }

    fn read_view_detailed(&self, include_logs: bool) -> Result<ViewRead> {
        self.read_view_listing(include_logs, IndexStore::list_pending_logs)
    }

    fn read_view_listing<L>(&self, include_logs: bool, mut list: L) -> Result<ViewRead>
    where
        L: FnMut(&IndexStore) -> Result<Vec<LogFileName>>,
    {
        let mut last_raced = String::new();
        for attempt in 1..=MAX_READ_ATTEMPTS {
            // Logs are listed before the snapshot is loaded: a rebuild that commits in
            // between deletes some listed log, which is then detected as a race.
            let listed = if include_logs { list(self)? } else { Vec::new() };
            match self.try_read_view(include_logs, listed)? {
                ReadAttempt::Complete(read) => return Ok(read),
                ReadAttempt::Raced(file_name) => {
                    tracing::debug!(
                        attempt,
                        file = %file_name,
                        "pending log vanished during read; re-reading view"
                    );
                    last_raced = file_name;
                }
            }
        }
        Err(anyhow!(
            "pending logs kept vanishing while reading {} (last: {last_raced})",
            self.root.display()
        ))
    }

    fn try_read_view(&self, include_logs: bool, listed: Vec<LogFileName>) -> Result<ReadAttempt> {
        let (base_status, last_consolidated, records) = self.load_base()?;
        let mut view = MergedView::from_base(base_status, last_consolidated, records);
        let mut consumed = Vec::new();
        let mut undecodable = Vec::new();

        if include_logs {
            let log_dir = self.log_dir();
            let mut pending = Vec::new();
            for name in listed {
                let path = log_dir.join(&name.file_name);
                let bytes = match fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        return Ok(ReadAttempt::Raced(name.file_name));
                    }
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("failed to read log {}", path.display()));
                    }
                };

                match decode_log_entry(&bytes, &name) {
                    Ok(entry) => {
                        pending.push(PendingEntry { entry_id: name.entry_id().to_string(), entry });
                        consumed.push(path);
                    }
                    Err(reason) => {
                        tracing::warn!(
                            file = %path.display(),
                            error = %reason,
                            "skipping undecodable log entry"
                        );
                        view.push_skipped(
                            name.entry_id(),
                            format!("undecodable log entry: {reason}"),
                        );
                        undecodable.push(path);
                    }
                }
            }
            view.replay(pending);
        }

        for diagnostic in &view.diagnostics {
            if let Some(record) = &diagnostic.record_id {
                tracing::debug!(
                    entry = %diagnostic.entry_id,
                    record = %record,
                    "{}",
                    diagnostic.message
                );
            }
        }

        Ok(ReadAttempt::Complete(ViewRead { view, consumed, undecodable }))
    }

    fn load_base(&self) -> Result<(BaseStatus, Option<OffsetDateTime>, Vec<MemoryRecord>)> {
        let path = self.snapshot_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok((BaseStatus::Missing, None, Vec::new()));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read snapshot {}", path.display()));
            }
        };

        let reason = match serde_json::from_slice::<IndexSnapshot>(&bytes) {
            Ok(snapshot) => match snapshot.verify() {
                Ok(()) => {
                    return Ok((
                        BaseStatus::Loaded,
                        Some(snapshot.last_consolidated),
                        snapshot.records,
                    ));
                }
                Err(err) => err.to_string(),
            },
            Err(err) => format!("failed to decode snapshot: {err}"),
        };

        tracing::warn!(
            file = %path.display(),
            error = %reason,
            "snapshot is corrupt; starting from an empty base"
        );
        Ok((BaseStatus::Corrupt { reason }, None, Vec::new()))
    }

    /// Try to take the advisory rebuild lock without waiting.
    ///
    /// # Errors
    /// Returns an error when the lock file cannot be opened or locking fails for a
    /// reason other than contention.
    pub fn try_lock_rebuild(&self) -> Result<Option<RebuildLock>> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create root {}", self.root.display()))?;
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open rebuild lock {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RebuildLock { _file: file })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to lock {}", path.display()))
            }
        }
    }

    /// Fold pending logs into a new snapshot and delete exactly the logs consumed.
    ///
    /// Undecodable logs are moved to the quarantine directory. When another process
    /// holds the rebuild lock the report comes back with `skipped` set.
    ///
    /// # Errors
    /// Returns an error when the view cannot be read or the snapshot cannot be
    /// written; in that case the previous snapshot and all logs are left untouched.
    pub fn rebuild(&self) -> Result<RebuildReport> {
        self.run_with_timeout("rebuild", IndexStore::rebuild_now)
    }

    fn rebuild_now(&self) -> Result<RebuildReport> {
        let _lock = if self.options.exclusive_rebuild {
            match self.try_lock_rebuild()? {
                Some(lock) => Some(lock),
                None => {
                    tracing::info!(
                        root = %self.root.display(),
                        "rebuild already running elsewhere; skipping"
                    );
                    return Ok(RebuildReport::skipped());
                }
            }
        } else {
            None
        };

        let read = self.read_view_detailed(true)?;
        self.commit_rebuild(read)
    }

    fn commit_rebuild(&self, read: ViewRead) -> Result<RebuildReport> {
        let ViewRead { view, consumed, undecodable } = read;
        let previous_base = view.base_status.clone();
        let snapshot = IndexSnapshot::from_records(view.into_records(), OffsetDateTime::now_utc())?;

        write_json_atomically(&self.root, &self.snapshot_path(), &snapshot, true)?;

        for path in &consumed {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(
                        file = %path.display(),
                        error = %err,
                        "failed to delete consumed log"
                    );
                }
            }
        }

        let mut quarantined = 0;
        for path in &undecodable {
            match self.quarantine(path) {
                Ok(()) => quarantined += 1,
                Err(err) => {
                    tracing::warn!(
                        file = %path.display(),
                        error = %err,
                        "failed to quarantine log"
                    );
                }
            }
        }

        if let Err(err) = self.write_manifest(&snapshot) {
            tracing::warn!(error = %err, "failed to regenerate manifest");
        }

        tracing::info!(
            root = %self.root.display(),
            records = snapshot.records.len(),
            consumed = consumed.len(),
            quarantined,
            "rebuilt snapshot"
        );

        Ok(RebuildReport {
            skipped: false,
            previous_base: Some(previous_base),
            record_count: snapshot.records.len(),
            consumed_logs: consumed.len(),
            quarantined_logs: quarantined,
            checksum: Some(snapshot.checksum),
            consolidated_at: Some(snapshot.last_consolidated),
        })
    }

    fn quarantine(&self, path: &Path) -> Result<()> {
        let dir = self.quarantine_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create quarantine directory {}", dir.display()))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("log path {} has no file name", path.display()))?;
        match fs::rename(path, dir.join(file_name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to move {}", path.display())),
        }
    }

    fn write_manifest(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let manifest = Manifest::from_snapshot(snapshot);
        write_json_atomically(&self.root, &self.manifest_path(), &manifest, true)
    }

    /// Snapshot, pending and quarantine counts for this root.
    ///
    /// # Errors
    /// Returns an error when the snapshot or log directory cannot be read.
    pub fn status(&self) -> Result<StoreStatus> {
        let base = self.read_view(false)?;
        let quarantined_logs = match fs::read_dir(self.quarantine_dir()) {
            Ok(entries) => entries.filter_map(std::result::Result::ok).count(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err).context("failed to list quarantine directory"),
        };
        Ok(StoreStatus {
            root: self.root.display().to_string(),
            last_consolidated: base.last_consolidated,
            base_records: base.len(),
            base: base.base_status,
            pending_logs: self.pending_log_count()?,
            quarantined_logs,
        })
    }

    /// Run `op` on a worker thread when an I/O timeout is configured.
    ///
    /// A timed-out worker is not cancelled: an append may still land after the
    /// caller sees `TimedOut`. Retries stay idempotent only when they reuse the
    /// same record id.
    fn run_with_timeout<T, F>(&self, label: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&IndexStore) -> Result<T> + Send + 'static,
    {
        let Some(timeout) = self.options.io_timeout else {
            return op(self);
        };

        let store = self.clone();
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("memory-index-{label}"))
            .spawn(move || {
                let _ = tx.send(op(&store));
            })
            .context("failed to spawn store worker")?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(operation = label, timeout = ?timeout, "store operation timed out");
                Err(anyhow::Error::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{label} did not finish within {timeout:?}"),
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("{label} worker exited without a result"))
            }
        }
    }
}

fn decode_log_entry(bytes: &[u8], name: &LogFileName) -> std::result::Result<LogEntry, String> {
    let entry = serde_json::from_slice::<LogEntry>(bytes).map_err(|err| err.to_string())?;
    entry.validate().map_err(|err| err.to_string())?;
    if entry.timestamp != name.timestamp {
        return Err(format!(
            "entry timestamp {} does not match file name instant {}",
            entry.timestamp, name.timestamp
        ));
    }
    Ok(entry)
}

fn write_json_atomically<T: Serialize>(
    dir: &Path,
    target: &Path,
    value: &T,
    replace: bool,
) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to encode {}", target.display()))?;
    bytes.push(b'\n');

    let mut temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    temp.write_all(&bytes)
        .with_context(|| format!("failed to write temp file for {}", target.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", target.display()))?;

    let persisted = if replace { temp.persist(target) } else { temp.persist_noclobber(target) };
    persisted
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move temp file into {}", target.display()))?;
    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|handle| handle.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %err, "directory sync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Barrier};

    use memory_index_core::{RecordKind, Scope, SearchQuery};

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000)
    }

    fn mk_record(id: &str, title: &str) -> Result<MemoryRecord> {
        let id = RecordId::parse(id)?;
        Ok(MemoryRecord::new(id, RecordKind::Note, Scope::Shared, title, fixture_time()))
    }

    fn mk_store(dir: &Path) -> IndexStore {
        IndexStore::new(dir.join("memory"), StoreOptions::default())
    }

    fn add(store: &IndexStore, id: &str, title: &str) -> Result<String> {
        let target = AppendTarget::Record(mk_record(id, title)?);
        store.append_operation(OperationKind::Add, target, "test")
    }

    fn titles(view: &MergedView) -> Vec<(String, String)> {
        view.records().map(|record| (record.id.to_string(), record.title.clone())).collect()
    }

    #[test]
    fn log_file_names_parse_and_sort_chronologically() -> Result<()> {
        let first = LogFileName::new("session a/b", fixture_time());
        let second = LogFileName::new("session-b", fixture_time() + time::Duration::nanoseconds(1));

        let parsed = LogFileName::parse(&first.file_name)
            .ok_or_else(|| anyhow!("name should parse: {}", first.file_name))?;
        assert_eq!(parsed, first);
        assert_eq!(parsed.writer, "session_a_b");
        assert_eq!(parsed.timestamp, fixture_time());
        assert!(first.file_name < second.file_name);
        assert!(first.file_name.starts_with("20231114T221320000000000Z-"));

        assert!(LogFileName::parse(".20231114T221320000000000Z.tmp").is_none());
        assert!(LogFileName::parse("20231114221320123456-session.json").is_none());
        assert!(LogFileName::parse("notes.json").is_none());
        Ok(())
    }

    #[test]
    fn next_log_instant_is_strictly_increasing() -> Result<()> {
        let mut previous = next_log_instant()?;
        for _ in 0..1_000 {
            let next = next_log_instant()?;
            assert!(next > previous);
            previous = next;
        }
        Ok(())
    }

    #[test]
    fn append_creates_exactly_one_file_and_replays() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());

        let entry_id = add(&store, "r1", "OAuth setup")?;
        let pending = store.list_pending_logs()?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entry_id(), entry_id);
        assert_eq!(pending[0].writer, "test");
        assert_eq!(fs::read_dir(store.log_dir())?.count(), 1);

        let view = store.read_view(true)?;
        assert_eq!(view.base_status, BaseStatus::Missing);
        assert_eq!(titles(&view), vec![("r1".to_string(), "OAuth setup".to_string())]);
        assert!(store.read_view(false)?.is_empty());
        Ok(())
    }

    #[test]
    fn append_restamps_entry_to_match_its_file_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        let stale = LogEntry::add(mk_record("r1", "OAuth setup")?, "test", fixture_time());
        store.append(&stale)?;

        let pending = store.list_pending_logs()?;
        assert_eq!(pending.len(), 1);
        let bytes = fs::read(store.log_dir().join(&pending[0].file_name))?;
        let written = serde_json::from_slice::<LogEntry>(&bytes)?;
        assert_eq!(written.timestamp, pending[0].timestamp);
        assert!(written.timestamp > fixture_time());
        assert_eq!(store.read_view(true)?.len(), 1);

        let mismatched = LogFileName::new("forged", next_log_instant()?);
        let forged = LogEntry::add(mk_record("r2", "DB tuning")?, "forged", fixture_time());
        fs::write(store.log_dir().join(&mismatched.file_name), serde_json::to_vec(&forged)?)?;
        let view = store.read_view(true)?;
        assert!(view.find_by_id("r2").is_none());
        assert!(view.diagnostics.iter().any(|diag| diag.entry_id == mismatched.entry_id()));
        Ok(())
    }

    #[test]
    fn invalid_entry_creates_no_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());

        let blank = mk_record("r1", " ")?;
        let Err(err) =
            store.append_operation(OperationKind::Add, AppendTarget::Record(blank), "test")
        else {
            return Err(anyhow!("blank title should be rejected"));
        };
        assert!(matches!(err.downcast_ref::<IndexError>(), Some(IndexError::Validation(_))));

        let id_only = AppendTarget::Id(RecordId::parse("r1")?);
        assert!(store.append_operation(OperationKind::Update, id_only, "test").is_err());
        assert_eq!(store.pending_log_count()?, 0);
        Ok(())
    }

    #[test]
    fn garbage_snapshot_recovers_every_logged_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;
        add(&store, "r2", "DB tuning")?;
        fs::write(store.snapshot_path(), b"{ not json at all")?;

        let view = store.read_view(true)?;
        assert!(matches!(view.base_status, BaseStatus::Corrupt { .. }));
        assert_eq!(view.len(), 2);
        Ok(())
    }

    #[test]
    fn tampered_snapshot_is_treated_as_corrupt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;
        store.rebuild()?;

        let raw = fs::read_to_string(store.snapshot_path())?;
        fs::write(store.snapshot_path(), raw.replace("OAuth setup", "OAuth tampered"))?;
        add(&store, "r2", "DB tuning")?;

        let view = store.read_view(true)?;
        let BaseStatus::Corrupt { reason } = &view.base_status else {
            return Err(anyhow!("expected corrupt base, got {:?}", view.base_status));
        };
        assert!(reason.contains("checksum mismatch"));
        assert_eq!(titles(&view), vec![("r2".to_string(), "DB tuning".to_string())]);
        Ok(())
    }

    #[test]
    fn rebuild_then_base_equals_full_view_before() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;
        add(&store, "r2", "DB tuning")?;
        let mut edited = mk_record("r1", "OAuth setup v2")?;
        edited.updated_at = fixture_time() + time::Duration::hours(1);
        store.append_operation(OperationKind::Update, AppendTarget::Record(edited), "test")?;
        let target = AppendTarget::Id(RecordId::parse("r2")?);
        store.append_operation(OperationKind::Delete, target, "test")?;
        store.record_access(&RecordId::parse("r1")?, Some("oauth"), "test")?;

        let before = store.read_view(true)?;
        let report = store.rebuild()?;
        assert!(!report.skipped);
        assert_eq!(report.consumed_logs, 5);
        assert_eq!(report.previous_base, Some(BaseStatus::Missing));
        assert_eq!(store.pending_log_count()?, 0);

        let after = store.read_view(false)?;
        assert_eq!(after.base_status, BaseStatus::Loaded);
        assert_eq!(after.records, before.records);
        assert_eq!(store.read_view(true)?.records, before.records);
        Ok(())
    }

    #[test]
    fn rebuild_deletes_only_the_logs_it_consumed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;

        let read = store.read_view_detailed(true)?;
        let late = add(&store, "r2", "DB tuning")?;
        let report = store.commit_rebuild(read)?;

        assert_eq!(report.record_count, 1);
        let pending = store.list_pending_logs()?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entry_id(), late);
        assert_eq!(store.read_view(true)?.len(), 2);
        Ok(())
    }

    #[test]
    fn undecodable_logs_are_quarantined_by_rebuild() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;
        let broken = LogFileName::new("broken", next_log_instant()?);
        fs::write(store.log_dir().join(&broken.file_name), b"{\"record_id\":")?;

        let view = store.read_view(true)?;
        assert_eq!(view.len(), 1);
        assert!(view.diagnostics.iter().any(|diag| diag.entry_id == broken.entry_id()));

        let report = store.rebuild()?;
        assert_eq!(report.quarantined_logs, 1);
        assert_eq!(store.pending_log_count()?, 0);
        assert!(store.quarantine_dir().join(&broken.file_name).exists());
        assert_eq!(store.status()?.quarantined_logs, 1);
        Ok(())
    }

    #[test]
    fn should_rebuild_requires_exceeding_threshold() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        for index in 0..3 {
            add(&store, &format!("r{index}"), "note")?;
        }
        assert!(!store.should_rebuild(3)?);
        assert!(store.should_rebuild(2)?);
        Ok(())
    }

    #[test]
    fn rebuild_is_skipped_while_lock_is_held() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;

        let Some(lock) = store.try_lock_rebuild()? else {
            return Err(anyhow!("lock should be free"));
        };
        let report = store.rebuild()?;
        assert!(report.skipped);
        assert_eq!(store.pending_log_count()?, 1);

        drop(lock);
        assert!(!store.rebuild()?.skipped);
        assert_eq!(store.pending_log_count()?, 0);
        Ok(())
    }

    #[test]
    fn rebuild_writes_manifest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        let mut record = mk_record("r1", "OAuth setup")?;
        record.summary = "x".repeat(300);
        store.append_operation(OperationKind::Add, AppendTarget::Record(record), "test")?;
        store.rebuild()?;

        let manifest: Manifest = serde_json::from_slice(&fs::read(store.manifest_path())?)?;
        assert_eq!(manifest.total_records, 1);
        assert_eq!(manifest.records[0].summary.chars().count(), MANIFEST_SUMMARY_CHARS);
        Ok(())
    }

    #[test]
    fn record_access_counts_monotonically() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;
        let id = RecordId::parse("r1")?;

        let first = store.record_access(&id, Some("oauth"), "test")?;
        let second = store.record_access(&id, None, "test")?;
        let (Some(first), Some(second)) = (first, second) else {
            return Err(anyhow!("record should exist"));
        };
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert!(second.last_accessed > first.last_accessed);

        let view = store.read_view(true)?;
        assert_eq!(view.find_by_id("r1").map(|record| record.access.count), Some(2));
        assert!(store.record_access(&RecordId::parse("missing")?, None, "test")?.is_none());
        Ok(())
    }

    #[test]
    fn concurrent_appenders_never_lose_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(mk_store(dir.path()));
        store.init()?;

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || -> Result<()> {
                for index in 0..25 {
                    let record = mk_record(&format!("w{worker}-r{index}"), "concurrent note")?;
                    store.append_operation(
                        OperationKind::Add,
                        AppendTarget::Record(record),
                        &format!("worker-{worker}"),
                    )?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("appender thread panicked"));
            };
            result?;
        }

        assert_eq!(store.pending_log_count()?, 200);
        assert_eq!(store.read_view(true)?.len(), 200);
        Ok(())
    }

    #[test]
    fn concurrent_rebuilds_and_appends_keep_every_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = StoreOptions { exclusive_rebuild: false, ..StoreOptions::default() };
        let store = Arc::new(IndexStore::new(dir.path().join("memory"), options));
        store.init()?;

        let appender = {
            let store = Arc::clone(&store);
            thread::spawn(move || -> Result<()> {
                for index in 0..60 {
                    add(&store, &format!("r{index:03}"), "racing note")?;
                }
                Ok(())
            })
        };
        let rebuilder = {
            let store = Arc::clone(&store);
            thread::spawn(move || -> Result<()> {
                for _ in 0..10 {
                    store.rebuild()?;
                }
                Ok(())
            })
        };

        for handle in [appender, rebuilder] {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("worker thread panicked"));
            };
            result?;
        }

        store.rebuild()?;
        let ids = store
            .read_view(false)?
            .records
            .into_keys()
            .map(|id| id.to_string())
            .collect::<BTreeSet<_>>();
        assert_eq!(ids.len(), 60);
        assert_eq!(store.pending_log_count()?, 0);
        Ok(())
    }

    #[test]
    fn concurrent_exclusive_rebuilds_skip_and_keep_every_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(mk_store(dir.path()));
        store.init()?;
        let barrier = Arc::new(Barrier::new(2));

        let appender = {
            let store = Arc::clone(&store);
            thread::spawn(move || -> Result<()> {
                for index in 0..40 {
                    add(&store, &format!("r{index:03}"), "racing note")?;
                }
                Ok(())
            })
        };
        let rebuilders = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || -> Result<usize> {
                    let mut skipped = 0;
                    for _ in 0..20 {
                        barrier.wait();
                        if store.rebuild()?.skipped {
                            skipped += 1;
                        }
                    }
                    Ok(skipped)
                })
            })
            .collect::<Vec<_>>();

        let Ok(appended) = appender.join() else {
            return Err(anyhow!("appender thread panicked"));
        };
        appended?;
        let mut skipped = 0;
        for handle in rebuilders {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("rebuilder thread panicked"));
            };
            skipped += result?;
        }
        assert!(skipped > 0, "overlapping rebuilds should skip on the lock");

        store.rebuild()?;
        assert_eq!(store.read_view(false)?.len(), 40);
        assert_eq!(store.pending_log_count()?, 0);
        Ok(())
    }

    #[test]
    fn read_rereads_when_a_rebuild_consumes_listed_logs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;
        add(&store, "r2", "DB tuning")?;

        let stale = store.list_pending_logs()?;
        store.rebuild()?;
        add(&store, "r3", "Cache layer")?;

        let mut listings = 0;
        let read = store.read_view_listing(true, |store| {
            listings += 1;
            if listings == 1 {
                Ok(stale.clone())
            } else {
                store.list_pending_logs()
            }
        })?;
        assert_eq!(listings, 2);
        assert_eq!(read.view.base_status, BaseStatus::Loaded);
        assert_eq!(read.view.len(), 3);
        assert_eq!(read.consumed.len(), 1);
        Ok(())
    }

    #[test]
    fn read_gives_up_when_listed_logs_keep_vanishing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;
        let gone = LogFileName::new("gone", next_log_instant()?);

        let mut listings = 0;
        let result = store.read_view_listing(true, |store| {
            listings += 1;
            let mut names = store.list_pending_logs()?;
            names.push(gone.clone());
            Ok(names)
        });
        let Err(err) = result else {
            return Err(anyhow!("read should give up on a log that never appears"));
        };
        assert_eq!(listings, MAX_READ_ATTEMPTS);
        assert!(err.to_string().contains(&gone.file_name));
        Ok(())
    }

    #[test]
    fn slow_operation_times_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options =
            StoreOptions { io_timeout: Some(Duration::from_millis(20)), exclusive_rebuild: true };
        let store = IndexStore::new(dir.path().join("memory"), options);

        let result = store.run_with_timeout("sleep", |_| {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        let Err(err) = result else {
            return Err(anyhow!("operation should time out"));
        };
        assert_eq!(
            err.downcast_ref::<io::Error>().map(io::Error::kind),
            Some(io::ErrorKind::TimedOut)
        );

        add(&store, "r1", "fast enough")?;
        assert_eq!(store.read_view(true)?.len(), 1);
        Ok(())
    }

    #[test]
    fn corrupting_base_after_rebuild_loses_only_consolidated_records() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());
        add(&store, "r1", "OAuth setup")?;
        add(&store, "r2", "DB tuning")?;

        fs::write(store.snapshot_path(), b"\x00garbage")?;
        let ids = store
            .read_view(true)?
            .records
            .into_keys()
            .map(|id| id.to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["r1".to_string(), "r2".to_string()]);

        store.rebuild()?;
        fs::write(store.snapshot_path(), b"\x00garbage")?;
        let view = store.read_view(true)?;
        assert!(view.is_empty());
        assert!(matches!(view.base_status, BaseStatus::Corrupt { .. }));
        Ok(())
    }

    #[test]
    fn example_session_end_to_end() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = mk_store(dir.path());

        let mut oauth = mk_record("r1", "OAuth setup")?;
        oauth.tags = memory_index_core::normalize_tags(["auth", "security"]);
        let mut tuning = mk_record("r2", "DB tuning")?;
        tuning.tags = memory_index_core::normalize_tags(["perf"]);
        store.append_operation(OperationKind::Add, AppendTarget::Record(oauth), "session-a")?;
        store.append_operation(OperationKind::Add, AppendTarget::Record(tuning), "session-b")?;

        let view = store.read_view(true)?;
        let hits = view.search(&SearchQuery::new("oauth", fixture_time()), &Default::default())?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id.as_str(), "r1");

        let target = AppendTarget::Id(RecordId::parse("r1")?);
        store.append_operation(OperationKind::Delete, target, "session-a")?;
        store.rebuild()?;
        let after = store.read_view(false)?;
        assert_eq!(titles(&after), vec![("r2".to_string(), "DB tuning".to_string())]);
        Ok(())
    }
}
