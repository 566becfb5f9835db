use crate::ledger::{self, Ledger};
use crate::lifecycle;
use crate::paths;
use crate::sources::SourceKind;
use crate::{EngineError, Result};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

const READ_ATTEMPTS: usize = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub tracked_sources: usize,
    pub channels: usize,
    pub playlists: usize,
    pub known_items: usize,
    pub downloaded_items: usize,
    pub skipped_items: usize,
    pub awaiting_retry: usize,
    pub library_files: usize,
    pub library_bytes: u64,
    pub last_run_at_ms: Option<i64>,
    pub last_download_at_ms: Option<i64>,
    pub sources: Vec<SourceStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub id: String,
    pub display_name: String,
    pub kind: SourceKind,
    pub known_items: usize,
    pub files: usize,
    pub bytes: u64,
    pub last_checked_at_ms: Option<i64>,
    pub last_check_error: Option<String>,
}

/// Counters over a ledger snapshot and the library tree. Read-only.
pub fn summarize(ledger: &Ledger, library_root: &Path) -> Stats {
    let mut stats = Stats {
        last_run_at_ms: ledger.last_run_at_ms,
        ..Stats::default()
    };

    for source in ledger.sources_in_order() {
        let (bytes, files) = lifecycle::library_usage(&paths::source_dir(library_root, &source.id));
        stats.tracked_sources += 1;
        match source.kind {
            SourceKind::Channel => stats.channels += 1,
            SourceKind::Playlist => stats.playlists += 1,
        }
        stats.known_items += source.known_items.len();
        stats.downloaded_items += source.downloaded_count();
        stats.skipped_items += source.skipped_count();
        stats.awaiting_retry += source.awaiting_retry_count();
        stats.last_download_at_ms = stats.last_download_at_ms.max(source.last_download_at_ms());
        stats.sources.push(SourceStats {
            id: source.id.clone(),
            display_name: source.display_name.clone(),
            kind: source.kind,
            known_items: source.known_items.len(),
            files,
            bytes,
            last_checked_at_ms: source.last_checked_at_ms,
            last_check_error: source.last_check_error.clone(),
        });
    }

    // Whole tree, so files left behind by removed sources still count.
    let (bytes, files) = lifecycle::library_usage(library_root);
    stats.library_bytes = bytes;
    stats.library_files = files;
    stats
}

/// Loads the ledger for display while a run may be writing it.
///
/// Saves replace the file atomically, so a parse failure is retried a few
/// times before being reported.
pub fn read_ledger_snapshot(path: &Path) -> Result<Ledger> {
    let mut attempt = 1;
    loop {
        match ledger::load(path) {
            Err(EngineError::CorruptLedger { reason, .. }) if attempt < READ_ATTEMPTS => {
                tracing::debug!(attempt, %reason, "ledger read failed, retrying");
                attempt += 1;
                std::thread::sleep(READ_RETRY_DELAY);
            }
            other => return other,
        }
    }
}
