use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ytfeed_engine::config::RunSettings;
use ytfeed_engine::engine::Engine;
use ytfeed_engine::ledger::{self, DownloadOutcome, DownloadState, Item, LedgerStore, TrackedSource};
use ytfeed_engine::lifecycle::DurationProbe;
use ytfeed_engine::lock::RunLock;
use ytfeed_engine::paths::AppPaths;
use ytfeed_engine::resolver::{Listing, SourceResolver};
use ytfeed_engine::scheduler::{DownloadAttempt, DownloadJob, Downloader};
use ytfeed_engine::{EngineError, Result};

#[derive(Default)]
struct FakeResolver {
    listings: Mutex<HashMap<String, Vec<String>>>,
    listed: Mutex<Vec<String>>,
    /// Listing this source raises the cancel flag and fails like a stopped tool.
    cancel_on: Option<String>,
}

impl FakeResolver {
    fn set(&self, source_id: &str, ids: &[&str]) {
        self.listings
            .lock()
            .expect("listings")
            .insert(source_id.to_string(), ids.iter().map(|s| s.to_string()).collect());
    }
}

impl SourceResolver for FakeResolver {
    fn list_items(
        &self,
        source: &TrackedSource,
        _settings: &RunSettings,
        cancel: &AtomicBool,
    ) -> Result<Listing> {
        self.listed.lock().expect("listed").push(source.id.clone());
        if self.cancel_on.as_deref() == Some(source.id.as_str()) {
            cancel.store(true, Ordering::SeqCst);
            return Err(EngineError::SourceUnreachable {
                source_id: source.id.clone(),
                reason: "yt-dlp canceled".to_string(),
            });
        }
        let listings = self.listings.lock().expect("listings");
        let ids = listings
            .get(&source.id)
            .ok_or_else(|| EngineError::SourceUnreachable {
                source_id: source.id.clone(),
                reason: "no route to host".to_string(),
            })?;
        Ok(Listing {
            source_id: source.id.clone(),
            items: ids
                .iter()
                .map(|id| {
                    let mut item = Item::pending(&source.id, id);
                    item.duration_seconds = Some(300);
                    item
                })
                .collect(),
            malformed: 0,
            tool_error: None,
        })
    }
}

/// Writes a small file per item; ids listed in `failing` exit "non-zero".
#[derive(Default)]
struct FakeDownloader {
    failing: Vec<String>,
    delay: Duration,
    wait_for_cancel: bool,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Downloader for FakeDownloader {
    fn download(
        &self,
        job: &DownloadJob,
        _settings: &RunSettings,
        cancel: &AtomicBool,
    ) -> DownloadAttempt {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let attempt = self.perform(job, cancel);
        self.active.fetch_sub(1, Ordering::SeqCst);
        attempt
    }
}

impl FakeDownloader {
    fn perform(&self, job: &DownloadJob, cancel: &AtomicBool) -> DownloadAttempt {
        if self.wait_for_cancel {
            while !cancel.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            return DownloadAttempt::Interrupted;
        }
        thread::sleep(self.delay);
        if self.failing.contains(&job.item.id) {
            return DownloadAttempt::Failed("ERROR: [youtube] Video unavailable".to_string());
        }
        std::fs::create_dir_all(&job.out_dir).expect("out dir");
        let path = job.out_dir.join(format!("Title [{}].mp4", job.item.id));
        std::fs::write(&path, b"0123456789").expect("write media");
        DownloadAttempt::Completed(path)
    }
}

struct FixedProbe;

impl DurationProbe for FixedProbe {
    fn duration_secs(&self, _path: &Path) -> Result<Option<f64>> {
        Ok(Some(125.0))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    paths: AppPaths,
    resolver: Arc<FakeResolver>,
    downloader: Arc<FakeDownloader>,
    engine: Engine,
}

fn harness(downloader: FakeDownloader) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    let resolver = Arc::new(FakeResolver::default());
    let downloader = Arc::new(downloader);
    let engine = Engine::with_tools(
        paths.clone(),
        resolver.clone(),
        downloader.clone(),
        Arc::new(FixedProbe),
    );
    Harness {
        _dir: dir,
        paths,
        resolver,
        downloader,
        engine,
    }
}

fn settings() -> RunSettings {
    RunSettings {
        retention_days: None,
        ..RunSettings::default()
    }
}

fn known_items(paths: &AppPaths, source_id: &str) -> Vec<String> {
    let ledger = ledger::load(&paths.ledger_path()).expect("load ledger");
    ledger
        .source(source_id)
        .expect("source")
        .known_items
        .iter()
        .cloned()
        .collect()
}

#[test]
fn new_item_is_downloaded_and_joins_known_items() {
    let h = harness(FakeDownloader::default());
    h.engine.add_source("@s", None).expect("add");
    {
        let store = LedgerStore::open(h.paths.ledger_path()).expect("open");
        store
            .record_outcome(&DownloadOutcome::new(
                &Item::pending("@s", "v2"),
                DownloadState::Succeeded,
            ))
            .expect("seed v2");
    }
    h.resolver.set("@s", &["v1", "v2"]);

    let summary = h.engine.run_cycle(&settings()).expect("run");

    assert_eq!(summary.queued, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(known_items(&h.paths, "@s"), vec!["v1", "v2"]);
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 1);

    let file = summary.outcomes[0].file.clone().expect("file");
    assert_eq!(
        file.file_name().and_then(|n| n.to_str()),
        Some("Title [v1] -2min 5sec.mp4")
    );
}

#[test]
fn two_sources_drain_through_a_single_worker() {
    let h = harness(FakeDownloader {
        delay: Duration::from_millis(20),
        ..FakeDownloader::default()
    });
    h.engine.add_source("@a", None).expect("add a");
    h.engine.add_source("@b", None).expect("add b");
    h.resolver.set("@a", &["a1"]);
    h.resolver.set("@b", &["b1"]);

    let summary = h
        .engine
        .run_cycle(&RunSettings {
            max_concurrent_downloads: 1,
            ..settings()
        })
        .expect("run");

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.total_bytes, 20);
    assert_eq!(h.downloader.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrency_ceiling_holds_for_a_long_queue() {
    let h = harness(FakeDownloader {
        delay: Duration::from_millis(15),
        ..FakeDownloader::default()
    });
    h.engine.add_source("@wide", None).expect("add");
    let ids: Vec<String> = (0..12).map(|i| format!("w{i}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    h.resolver.set("@wide", &id_refs);

    let summary = h
        .engine
        .run_cycle(&RunSettings {
            max_concurrent_downloads: 3,
            initial_items_per_source: 50,
            ..settings()
        })
        .expect("run");

    assert_eq!(summary.succeeded, 12);
    let peak = h.downloader.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak {peak} exceeded the ceiling");
}

#[test]
fn failed_download_stays_eligible_for_retry() {
    let h = harness(FakeDownloader {
        failing: vec!["bad".to_string()],
        ..FakeDownloader::default()
    });
    h.engine.add_source("@s", None).expect("add");
    h.resolver.set("@s", &["bad"]);

    let summary = h.engine.run_cycle(&settings()).expect("run");
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 0);
    assert!(known_items(&h.paths, "@s").is_empty());
    assert_eq!(summary.download_errors().len(), 1);

    let again = h.engine.run_cycle(&settings()).expect("second run");
    assert_eq!(again.queued, 1);
}

#[test]
fn repeated_failures_reach_the_skip_ceiling() {
    let h = harness(FakeDownloader {
        failing: vec!["bad".to_string()],
        ..FakeDownloader::default()
    });
    h.engine.add_source("@s", None).expect("add");
    h.resolver.set("@s", &["bad"]);
    let settings = RunSettings {
        max_failures_before_skip: Some(2),
        ..settings()
    };

    assert_eq!(h.engine.run_cycle(&settings).expect("run 1").failed, 1);
    let second = h.engine.run_cycle(&settings).expect("run 2");
    assert_eq!(second.failed, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(known_items(&h.paths, "@s"), vec!["bad"]);
    assert_eq!(h.engine.run_cycle(&settings).expect("run 3").queued, 0);
}

#[test]
fn held_lock_refuses_the_run_and_leaves_the_ledger_alone() {
    let h = harness(FakeDownloader::default());
    h.engine.add_source("@s", None).expect("add");
    h.resolver.set("@s", &["v1"]);
    let before = std::fs::read(h.paths.ledger_path()).expect("read ledger");

    let _held = RunLock::acquire(&h.paths.run_lock_path()).expect("hold lock");
    let err = h.engine.run_cycle(&settings()).expect_err("must refuse");

    assert!(matches!(err, EngineError::LockHeld { .. }));
    assert!(err.is_fatal());
    assert_eq!(std::fs::read(h.paths.ledger_path()).expect("reread"), before);
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn corrupt_ledger_aborts_the_cycle() {
    let h = harness(FakeDownloader::default());
    h.paths.ensure_dirs().expect("dirs");
    std::fs::write(h.paths.ledger_path(), "{\"schema_version\": 1, \"sources\": [").expect("write");

    let err = h.engine.run_cycle(&settings()).expect_err("must abort");
    assert!(matches!(err, EngineError::CorruptLedger { .. }));
    assert!(matches!(
        h.engine.get_statistics(),
        Err(EngineError::CorruptLedger { .. })
    ));
}

#[test]
fn cancellation_reverts_in_flight_items_to_pending() {
    let h = harness(FakeDownloader {
        wait_for_cancel: true,
        ..FakeDownloader::default()
    });
    h.engine.add_source("@s", None).expect("add");
    h.resolver.set("@s", &["x1", "x2", "x3", "x4"]);

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    let downloader = h.downloader.clone();
    let trigger = thread::spawn(move || {
        while downloader.calls.load(Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_millis(5));
        }
        flag.store(true, Ordering::SeqCst);
    });

    let summary = h
        .engine
        .run_cycle_with_cancel(
            &RunSettings {
                max_concurrent_downloads: 2,
                ..settings()
            },
            cancel,
        )
        .expect("run");
    trigger.join().expect("trigger");

    assert!(summary.canceled);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.pending, 4);
    assert_eq!(summary.retention_deleted, 0);
    assert!(known_items(&h.paths, "@s").is_empty());
}

#[test]
fn cancel_during_listing_stops_the_cycle_without_blaming_the_source() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    let resolver = Arc::new(FakeResolver {
        cancel_on: Some("@a".to_string()),
        ..FakeResolver::default()
    });
    resolver.set("@b", &["b1"]);
    let downloader = Arc::new(FakeDownloader::default());
    let engine = Engine::with_tools(
        paths.clone(),
        resolver.clone(),
        downloader.clone(),
        Arc::new(FixedProbe),
    );
    engine.add_source("@a", None).expect("add a");
    engine.add_source("@b", None).expect("add b");

    let summary = engine
        .run_cycle_with_cancel(&settings(), Arc::new(AtomicBool::new(false)))
        .expect("run");

    assert!(summary.canceled);
    assert_eq!(summary.sources_checked, 0);
    assert_eq!(summary.sources_unreachable, 0);
    assert!(summary.source_errors.is_empty());
    assert_eq!(*resolver.listed.lock().expect("listed"), vec!["@a".to_string()]);
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);

    let ledger = ledger::load(&paths.ledger_path()).expect("ledger");
    let a = ledger.source("@a").expect("a");
    assert!(a.last_checked_at_ms.is_none());
    assert!(a.last_check_error.is_none());
}

#[test]
fn statistics_reflect_the_last_cycle() {
    let h = harness(FakeDownloader::default());
    h.engine.add_source("@s", None).expect("add");
    h.engine.add_source("PLzzzzzzzzzzzz", Some("Mix")).expect("add playlist");
    h.resolver.set("@s", &["v1", "v2"]);
    h.resolver.set("PLzzzzzzzzzzzz", &["p1"]);

    h.engine.run_cycle(&settings()).expect("run");
    let stats = h.engine.get_statistics().expect("stats");

    assert_eq!(stats.tracked_sources, 2);
    assert_eq!(stats.channels, 1);
    assert_eq!(stats.playlists, 1);
    assert_eq!(stats.downloaded_items, 3);
    assert_eq!(stats.library_files, 3);
    assert_eq!(stats.library_bytes, 30);
    assert!(stats.last_run_at_ms.is_some());
}
