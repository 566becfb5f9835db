//! Durable record of tracked sources and the items already handled for each.
//!
//! The ledger is one pretty-printed JSON document. Every mutation is applied to
//! a copy, written with temp-file-then-rename, and only then committed in
//! memory, so readers never observe a partial write and a retried call after a
//! failed write cannot double-apply.

use crate::sources::{SourceDescriptor, SourceKind};
use crate::{now_ms, EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub const LEDGER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Pending,
    InProgress,
    Succeeded,
    Failed(String),
    Skipped,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Pending => "pending",
            DownloadState::InProgress => "in_progress",
            DownloadState::Succeeded => "succeeded",
            DownloadState::Failed(_) => "failed",
            DownloadState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Succeeded | DownloadState::Failed(_) | DownloadState::Skipped
        )
    }
}

/// One remote video/audio entry as seen by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub source_id: String,
    pub title: Option<String>,
    /// Unix seconds.
    pub publish_time: Option<i64>,
    pub duration_seconds: Option<u64>,
    pub download_state: DownloadState,
}

impl Item {
    pub fn pending(source_id: &str, id: &str) -> Self {
        Self {
            id: id.to_string(),
            source_id: source_id.to_string(),
            title: None,
            publish_time: None,
            duration_seconds: None,
            download_state: DownloadState::Pending,
        }
    }
}

/// Result of one worker job. Lives only for the cycle that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadOutcome {
    pub source_id: String,
    pub item_id: String,
    pub state: DownloadState,
    pub file: Option<PathBuf>,
    pub bytes: u64,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl DownloadOutcome {
    pub fn new(item: &Item, state: DownloadState) -> Self {
        let error = match &state {
            DownloadState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        Self {
            source_id: item.source_id.clone(),
            item_id: item.id.clone(),
            state,
            file: None,
            bytes: 0,
            elapsed: Duration::ZERO,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub state: DownloadState,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSource {
    pub id: String,
    pub display_name: String,
    pub kind: SourceKind,
    pub added_at_ms: i64,
    #[serde(default)]
    pub last_checked_at_ms: Option<i64>,
    #[serde(default)]
    pub last_check_error: Option<String>,
    #[serde(default)]
    pub known_items: BTreeSet<String>,
    #[serde(default)]
    pub items: BTreeMap<String, ItemRecord>,
}

impl TrackedSource {
    pub fn from_descriptor(descriptor: &SourceDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            display_name: descriptor.display_name.clone(),
            kind: descriptor.kind,
            added_at_ms: now_ms(),
            last_checked_at_ms: None,
            last_check_error: None,
            known_items: BTreeSet::new(),
            items: BTreeMap::new(),
        }
    }

    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            id: self.id.clone(),
            kind: self.kind,
            display_name: self.display_name.clone(),
        }
    }

    pub fn is_known(&self, item_id: &str) -> bool {
        self.known_items.contains(item_id)
    }

    /// True until a listing has been taken without error and nothing is known yet.
    pub fn never_checked(&self) -> bool {
        self.known_items.is_empty()
            && (self.last_checked_at_ms.is_none() || self.last_check_error.is_some())
    }

    fn count_state(&self, f: impl Fn(&DownloadState) -> bool) -> usize {
        self.items.values().filter(|r| f(&r.state)).count()
    }

    pub fn downloaded_count(&self) -> usize {
        self.count_state(|s| *s == DownloadState::Succeeded)
    }

    pub fn skipped_count(&self) -> usize {
        self.count_state(|s| *s == DownloadState::Skipped)
    }

    pub fn awaiting_retry_count(&self) -> usize {
        self.count_state(|s| matches!(s, DownloadState::Failed(_)))
    }

    pub fn last_download_at_ms(&self) -> Option<i64> {
        self.items
            .values()
            .filter(|r| r.state == DownloadState::Succeeded)
            .map(|r| r.updated_at_ms)
            .max()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub schema_version: u32,
    #[serde(default)]
    pub last_run_at_ms: Option<i64>,
    #[serde(default)]
    pub sources: BTreeMap<String, TrackedSource>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            last_run_at_ms: None,
            sources: BTreeMap::new(),
        }
    }
}

impl Ledger {
    /// Sources in the order they were added, ties broken by id.
    pub fn sources_in_order(&self) -> Vec<&TrackedSource> {
        let mut out: Vec<&TrackedSource> = self.sources.values().collect();
        out.sort_by(|a, b| a.added_at_ms.cmp(&b.added_at_ms).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn source(&self, id: &str) -> Result<&TrackedSource> {
        self.sources
            .get(id)
            .ok_or_else(|| EngineError::UnknownSource(id.to_string()))
    }

    fn source_mut(&mut self, id: &str) -> Result<&mut TrackedSource> {
        self.sources
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownSource(id.to_string()))
    }

    /// Applies one outcome and returns the state actually stored.
    fn apply_outcome(
        &mut self,
        outcome: &DownloadOutcome,
        failure_ceiling: Option<u32>,
    ) -> Result<DownloadState> {
        let source = self.source_mut(&outcome.source_id)?;
        let now = now_ms();
        let item_id = outcome.item_id.clone();

        let applied = match &outcome.state {
            DownloadState::Pending | DownloadState::InProgress => DownloadState::Pending,
            DownloadState::Succeeded => {
                source.known_items.insert(item_id.clone());
                source.items.insert(
                    item_id,
                    ItemRecord {
                        state: DownloadState::Succeeded,
                        failures: 0,
                        last_error: None,
                        file: outcome.file.clone(),
                        updated_at_ms: now,
                    },
                );
                DownloadState::Succeeded
            }
            DownloadState::Skipped => {
                if let Some(existing) = source.items.get(&item_id) {
                    if existing.state == DownloadState::Succeeded {
                        return Ok(DownloadState::Succeeded);
                    }
                }
                source.known_items.insert(item_id.clone());
                let failures = source.items.get(&item_id).map(|r| r.failures).unwrap_or(0);
                source.items.insert(
                    item_id,
                    ItemRecord {
                        state: DownloadState::Skipped,
                        failures,
                        last_error: outcome.error.clone(),
                        file: None,
                        updated_at_ms: now,
                    },
                );
                DownloadState::Skipped
            }
            DownloadState::Failed(reason) => {
                if source.is_known(&item_id) {
                    // Known items are never downgraded.
                    return Ok(source
                        .items
                        .get(&item_id)
                        .map(|r| r.state.clone())
                        .unwrap_or(DownloadState::Succeeded));
                }
                let failures = source.items.get(&item_id).map(|r| r.failures).unwrap_or(0) + 1;
                let exhausted = failure_ceiling.is_some_and(|limit| failures >= limit);
                let state = if exhausted {
                    source.known_items.insert(item_id.clone());
                    DownloadState::Skipped
                } else {
                    DownloadState::Failed(reason.clone())
                };
                source.items.insert(
                    item_id,
                    ItemRecord {
                        state: state.clone(),
                        failures,
                        last_error: Some(reason.clone()),
                        file: None,
                        updated_at_ms: now,
                    },
                );
                state
            }
        };
        Ok(applied)
    }
}

/// Reads the ledger at `path`. A missing file is an empty ledger.
pub fn load(path: &Path) -> Result<Ledger> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Ledger::default()),
        Err(e) => return Err(EngineError::Io(e)),
    };
    parse(path, &bytes)
}

fn parse(path: &Path, bytes: &[u8]) -> Result<Ledger> {
    let corrupt = |reason: String| EngineError::CorruptLedger {
        path: path.to_path_buf(),
        reason,
    };

    let ledger: Ledger = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
    if ledger.schema_version == 0 || ledger.schema_version > LEDGER_SCHEMA_VERSION {
        return Err(corrupt(format!(
            "unsupported schema_version {}",
            ledger.schema_version
        )));
    }
    for (key, source) in &ledger.sources {
        if key != &source.id {
            return Err(corrupt(format!(
                "source keyed as {key} carries id {}",
                source.id
            )));
        }
        for (item_id, record) in &source.items {
            let known = source.known_items.contains(item_id);
            let should_be_known = matches!(
                record.state,
                DownloadState::Succeeded | DownloadState::Skipped
            );
            if known != should_be_known {
                return Err(corrupt(format!(
                    "item {item_id} of {key} is {} but {}in known_items",
                    record.state.as_str(),
                    if known { "" } else { "not " }
                )));
            }
        }
    }
    Ok(ledger)
}

/// Writes `ledger` to `path` via a synced temp file and an atomic rename.
pub fn save(path: &Path, ledger: &Ledger) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(ledger)?;
    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        temp_file.write_all(json.as_bytes())?;
        temp_file.write_all(b"\n")?;
        temp_file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Shared handle over the ledger file. Safe to use from many worker threads.
#[derive(Debug)]
pub struct LedgerStore {
    path: PathBuf,
    failure_ceiling: Option<u32>,
    state: Mutex<Ledger>,
}

impl LedgerStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let ledger = load(&path)?;
        Ok(Self {
            path,
            failure_ceiling: None,
            state: Mutex::new(ledger),
        })
    }

    /// Consecutive failures after which an item is skipped.
    pub fn with_failure_ceiling(mut self, ceiling: Option<u32>) -> Self {
        self.failure_ceiling = ceiling;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Ledger {
        self.lock().clone()
    }

    pub fn add_source(&self, descriptor: &SourceDescriptor) -> Result<TrackedSource> {
        self.mutate(|ledger| {
            if ledger.sources.contains_key(&descriptor.id) {
                return Err(EngineError::DuplicateSource(descriptor.id.clone()));
            }
            let source = TrackedSource::from_descriptor(descriptor);
            ledger.sources.insert(source.id.clone(), source.clone());
            Ok(source)
        })
    }

    pub fn remove_source(&self, id: &str) -> Result<TrackedSource> {
        self.mutate(|ledger| {
            ledger
                .sources
                .remove(id)
                .ok_or_else(|| EngineError::UnknownSource(id.to_string()))
        })
    }

    pub fn rename_source(&self, id: &str, display_name: &str) -> Result<()> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidSource(
                "display name must not be empty".to_string(),
            ));
        }
        self.mutate(|ledger| {
            ledger.source_mut(id)?.display_name = name.to_string();
            Ok(())
        })
    }

    /// Forgets every known item of a source so the next cycle treats it as new.
    pub fn reset_source(&self, id: &str) -> Result<usize> {
        self.mutate(|ledger| {
            let source = ledger.source_mut(id)?;
            let forgotten = source.known_items.len();
            source.known_items.clear();
            source.items.clear();
            source.last_checked_at_ms = None;
            source.last_check_error = None;
            Ok(forgotten)
        })
    }

    pub fn mark_checked(&self, id: &str, error: Option<String>) -> Result<()> {
        self.mutate(|ledger| {
            let source = ledger.source_mut(id)?;
            source.last_checked_at_ms = Some(now_ms());
            source.last_check_error = error;
            Ok(())
        })
    }

    pub fn mark_run_finished(&self, at_ms: i64) -> Result<()> {
        self.mutate(|ledger| {
            ledger.last_run_at_ms = Some(at_ms);
            Ok(())
        })
    }

    /// Records the terminal state of one item and returns the state stored.
    ///
    /// Succeeded and Skipped put the item into `known_items`. Failed bumps the
    /// failure count and becomes Skipped once the ceiling is reached. Pending
    /// and InProgress leave the ledger untouched.
    pub fn record_outcome(&self, outcome: &DownloadOutcome) -> Result<DownloadState> {
        if !outcome.state.is_terminal() {
            self.lock().source(&outcome.source_id)?;
            return Ok(DownloadState::Pending);
        }
        let ceiling = self.failure_ceiling;
        self.mutate(|ledger| ledger.apply_outcome(outcome, ceiling))
    }

    /// Applies many outcomes under a single write.
    pub fn record_outcomes(&self, outcomes: &[DownloadOutcome]) -> Result<Vec<DownloadState>> {
        let ceiling = self.failure_ceiling;
        self.mutate(|ledger| {
            outcomes
                .iter()
                .map(|o| ledger.apply_outcome(o, ceiling))
                .collect()
        })
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Ledger) -> Result<T>) -> Result<T> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        save(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!(path = %self.path.display(), "ledger mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
