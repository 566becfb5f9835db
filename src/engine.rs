//! Boundary operations used by the CLI or any other front end.

use crate::config::{self, RunSettings};
use crate::ffmpeg::Ffprobe;
use crate::gap;
use crate::history::History;
use crate::ledger::{DownloadOutcome, DownloadState, LedgerStore, TrackedSource};
use crate::lifecycle::{self, DurationProbe, Lifecycle};
use crate::lock::RunLock;
use crate::paths::{self, AppPaths};
use crate::resolver::{SourceResolver, YtDlpResolver};
use crate::scheduler::{DownloadJob, Downloader, InFlight, Scheduler};
use crate::sources::{self, SourceDescriptor};
use crate::stats::{self, Stats};
use crate::ytdlp::YtDlpDownloader;
use crate::{now_ms, EngineError, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A source that could not be listed, or was listed only partially.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceIssue {
    pub source_id: String,
    pub message: String,
    pub partial: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub sources_checked: usize,
    pub sources_unreachable: usize,
    pub partial_listings: usize,
    pub queued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Items left untouched or reverted by cancellation.
    pub pending: usize,
    pub total_bytes: u64,
    pub elapsed_ms: u64,
    pub retention_deleted: usize,
    pub canceled: bool,
    pub outcomes: Vec<DownloadOutcome>,
    pub source_errors: Vec<SourceIssue>,
}

impl RunSummary {
    pub fn download_errors(&self) -> Vec<EngineError> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.state {
                DownloadState::Failed(reason) => Some(EngineError::DownloadFailed(format!(
                    "{}/{}: {reason}",
                    o.source_id, o.item_id
                ))),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub skipped: usize,
}

/// Raises `cancel` on Ctrl-C, SIGTERM and SIGHUP so a running cycle winds down
/// and saves the ledger. Can be installed once per process.
pub fn cancel_on_termination(cancel: Arc<AtomicBool>) -> std::result::Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::SeqCst);
    })
}

pub struct Engine {
    paths: AppPaths,
    resolver: Arc<dyn SourceResolver>,
    downloader: Arc<dyn Downloader>,
    probe: Arc<dyn DurationProbe>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("base_dir", &self.paths.base_dir)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine backed by yt-dlp and ffprobe.
    pub fn new(paths: AppPaths) -> Self {
        Self {
            resolver: Arc::new(YtDlpResolver::new(paths.clone())),
            downloader: Arc::new(YtDlpDownloader::new(paths.clone())),
            probe: Arc::new(Ffprobe::new(paths.clone())),
            paths,
        }
    }

    pub fn with_tools(
        paths: AppPaths,
        resolver: Arc<dyn SourceResolver>,
        downloader: Arc<dyn Downloader>,
        probe: Arc<dyn DurationProbe>,
    ) -> Self {
        Self {
            paths,
            resolver,
            downloader,
            probe,
        }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// Source edits take the run lock so they never interleave with a cycle.
    fn with_ledger<T>(&self, f: impl FnOnce(&LedgerStore) -> Result<T>) -> Result<T> {
        self.paths.ensure_dirs()?;
        let _lock = RunLock::acquire(&self.paths.run_lock_path())?;
        let ledger = LedgerStore::open(self.paths.ledger_path())?;
        f(&ledger)
    }

    pub fn add_source(&self, descriptor: &str, display_name: Option<&str>) -> Result<TrackedSource> {
        let descriptor = SourceDescriptor::parse(descriptor)?.with_display_name(display_name);
        let source = self.with_ledger(|ledger| ledger.add_source(&descriptor))?;
        tracing::info!(source_id = %source.id, kind = source.kind.as_str(), "source added");
        Ok(source)
    }

    /// Stops tracking a source. Files already downloaded stay in the library.
    pub fn remove_source(&self, id: &str) -> Result<TrackedSource> {
        let source = self.with_ledger(|ledger| ledger.remove_source(id))?;
        tracing::info!(source_id = %source.id, "source removed");
        Ok(source)
    }

    pub fn rename_source(&self, id: &str, display_name: &str) -> Result<()> {
        self.with_ledger(|ledger| ledger.rename_source(id, display_name))
    }

    pub fn reset_source(&self, id: &str) -> Result<usize> {
        let forgotten = self.with_ledger(|ledger| ledger.reset_source(id))?;
        tracing::info!(source_id = id, forgotten, "source reset");
        Ok(forgotten)
    }

    pub fn list_sources(&self) -> Result<Vec<TrackedSource>> {
        let ledger = stats::read_ledger_snapshot(&self.paths.ledger_path())?;
        Ok(ledger.sources_in_order().into_iter().cloned().collect())
    }

    pub fn export_sources(&self, path: &Path) -> Result<usize> {
        let descriptors: Vec<SourceDescriptor> = self
            .list_sources()?
            .iter()
            .map(TrackedSource::descriptor)
            .collect();
        sources::write_export(path, &descriptors)?;
        Ok(descriptors.len())
    }

    /// Adds every exported source not tracked yet.
    pub fn import_sources(&self, path: &Path) -> Result<ImportReport> {
        let descriptors = sources::read_export(path)?;
        self.with_ledger(|ledger| {
            let mut report = ImportReport::default();
            for descriptor in &descriptors {
                match ledger.add_source(descriptor) {
                    Ok(_) => report.inserted += 1,
                    Err(EngineError::DuplicateSource(_)) => report.skipped += 1,
                    Err(e) => return Err(e),
                }
            }
            tracing::info!(inserted = report.inserted, skipped = report.skipped, "sources imported");
            Ok(report)
        })
    }

    pub fn get_statistics(&self) -> Result<Stats> {
        let settings = config::load_settings(&self.paths)?;
        let ledger = stats::read_ledger_snapshot(&self.paths.ledger_path())?;
        Ok(stats::summarize(&ledger, &settings.library_dir(&self.paths)))
    }

    pub fn run_cycle(&self, settings: &RunSettings) -> Result<RunSummary> {
        self.run_cycle_with_cancel(settings, Arc::new(AtomicBool::new(false)))
    }

    /// One full cycle: list every source, download the gap, sweep old files.
    ///
    /// Fails only on integrity problems (lock held, corrupt or unwritable
    /// ledger). Per-source and per-item failures end up in the summary.
    pub fn run_cycle_with_cancel(
        &self,
        settings: &RunSettings,
        cancel: Arc<AtomicBool>,
    ) -> Result<RunSummary> {
        settings.validate()?;
        self.paths.ensure_dirs()?;
        let _lock = RunLock::acquire(&self.paths.run_lock_path())?;
        let ledger = LedgerStore::open(self.paths.ledger_path())?
            .with_failure_ceiling(settings.max_failures_before_skip);

        let library = settings.library_dir(&self.paths);
        std::fs::create_dir_all(&library)?;

        let started = Instant::now();
        let mut summary = RunSummary {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at_ms: now_ms(),
            ..RunSummary::default()
        };
        tracing::info!(run_id = %summary.run_id, library = %library.display(), "run started");

        let mut jobs = Vec::new();
        let snapshot = ledger.snapshot();
        for source in snapshot.sources_in_order() {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            jobs.extend(self.check_source(
                &ledger,
                source,
                settings,
                &library,
                cancel.as_ref(),
                &mut summary,
            )?);
        }
        summary.queued = jobs.len();

        let in_flight = InFlight::new();
        let lifecycle = Lifecycle::new(self.probe.clone());
        let scheduler = Scheduler {
            settings,
            downloader: self.downloader.as_ref(),
            ledger: &ledger,
            lifecycle: &lifecycle,
            in_flight: &in_flight,
            cancel: cancel.as_ref(),
        };
        let report = scheduler.run(jobs);

        summary.succeeded = report.succeeded();
        summary.failed = report.failed();
        summary.skipped += report.skipped();
        summary.pending = report.pending();
        summary.total_bytes = report.total_bytes();
        summary.outcomes.extend(report.outcomes);
        summary.canceled = cancel.load(Ordering::SeqCst);

        if summary.canceled {
            tracing::warn!(pending = summary.pending, "run canceled, retention sweep skipped");
        } else {
            match lifecycle::sweep_retention(&library, settings.retention_days, &in_flight) {
                Ok(deleted) => summary.retention_deleted = deleted,
                Err(e) => tracing::warn!(error = %e, "retention sweep failed"),
            }
        }

        summary.finished_at_ms = now_ms();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        ledger.mark_run_finished(summary.finished_at_ms)?;
        self.journal(&summary);

        tracing::info!(
            run_id = %summary.run_id,
            sources = summary.sources_checked,
            unreachable = summary.sources_unreachable,
            queued = summary.queued,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            pending = summary.pending,
            bytes = summary.total_bytes,
            retention_deleted = summary.retention_deleted,
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
        Ok(summary)
    }

    /// Lists one source, records what gets skipped and returns its jobs.
    ///
    /// A failing source is logged and recorded; only ledger write errors propagate.
    /// A listing cut short by `cancel` leaves the source untouched.
    fn check_source(
        &self,
        ledger: &LedgerStore,
        source: &TrackedSource,
        settings: &RunSettings,
        library: &Path,
        cancel: &AtomicBool,
        summary: &mut RunSummary,
    ) -> Result<Vec<DownloadJob>> {
        let listing = match self.resolver.list_items(source, settings, cancel) {
            Ok(listing) => listing,
            Err(e) if cancel.load(Ordering::SeqCst) => {
                tracing::info!(source_id = %source.id, error = %e, "listing stopped by cancel");
                return Ok(Vec::new());
            }
            Err(e) => {
                summary.sources_checked += 1;
                tracing::warn!(source_id = %source.id, error = %e, "source skipped this cycle");
                summary.sources_unreachable += 1;
                summary.source_errors.push(SourceIssue {
                    source_id: source.id.clone(),
                    message: e.to_string(),
                    partial: false,
                });
                ledger.mark_checked(&source.id, Some(e.to_string()))?;
                return Ok(Vec::new());
            }
        };

        summary.sources_checked += 1;
        if let Some(warning) = listing.warning() {
            tracing::warn!(source_id = %source.id, warning = %warning, "partial listing");
            summary.partial_listings += 1;
            summary.source_errors.push(SourceIssue {
                source_id: source.id.clone(),
                message: listing
                    .tool_error
                    .as_ref()
                    .map(|reason| format!("{warning}; {reason}"))
                    .unwrap_or_else(|| warning.to_string()),
                partial: true,
            });
        }

        let plan = gap::plan(source, &listing.items, settings);
        tracing::info!(
            source_id = %source.id,
            listed = listing.items.len(),
            queued = plan.queue.len(),
            skipped = plan.skipped.len(),
            "source checked"
        );

        if !plan.skipped.is_empty() {
            let skipped: Vec<DownloadOutcome> = plan
                .skipped
                .iter()
                .map(|(item, reason)| {
                    let mut outcome = DownloadOutcome::new(item, DownloadState::Skipped);
                    outcome.error = Some(reason.as_str().to_string());
                    outcome
                })
                .collect();
            ledger.record_outcomes(&skipped)?;
            summary.skipped += skipped.len();
            summary.outcomes.extend(skipped);
        }
        ledger.mark_checked(&source.id, listing.tool_error.clone())?;

        let out_dir = paths::source_dir(library, &source.id);
        Ok(plan
            .queue
            .into_iter()
            .map(|item| DownloadJob {
                item,
                out_dir: out_dir.clone(),
            })
            .collect())
    }

    fn journal(&self, summary: &RunSummary) {
        let written = History::open(&self.paths).and_then(|history| history.record_run(summary));
        if let Err(e) = written {
            tracing::warn!(run_id = %summary.run_id, error = %e, "failed to write run journal");
        }
    }
}
