//! Bounded worker pool that drains one cycle's download queue.
//!
//! Workers claim the next job from a shared FIFO, run the downloader,
//! finalize the file on success and record the outcome in the ledger
//! themselves. Outcomes flow back to the coordinating thread over a channel.

use crate::config::RunSettings;
use crate::ledger::{DownloadOutcome, DownloadState, Item, LedgerStore};
use crate::lifecycle::Lifecycle;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    pub item: Item,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadAttempt {
    Completed(PathBuf),
    Failed(String),
    /// Stopped by cancellation before completing.
    Interrupted,
}

/// Performs one download. Implementations must return promptly once `cancel`
/// is raised (after their grace period).
pub trait Downloader: Send + Sync {
    fn download(&self, job: &DownloadJob, settings: &RunSettings, cancel: &AtomicBool)
        -> DownloadAttempt;
}

/// Item ids whose files are being written or renamed right now.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, item_id: &str) {
        self.lock().insert(item_id.to_string());
    }

    pub fn release(&self, item_id: &str) {
        self.lock().remove(item_id);
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.lock().contains(item_id)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs `f` while no job can register, unless `item_id` is already in flight.
    pub fn unless_in_flight<T>(&self, item_id: Option<&str>, f: impl FnOnce() -> T) -> Option<T> {
        let guard = self.lock();
        if let Some(id) = item_id {
            if guard.contains(id) {
                return None;
            }
        }
        let out = f();
        drop(guard);
        Some(out)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(|poisoned| {
            tracing::error!("in-flight registry mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// What one drain of the queue produced.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub outcomes: Vec<DownloadOutcome>,
    /// Jobs never claimed because the run was canceled.
    pub not_started: Vec<Item>,
    pub peak_in_progress: usize,
    pub elapsed: Duration,
}

impl DrainReport {
    fn count(&self, f: impl Fn(&DownloadState) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(&o.state)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| *s == DownloadState::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, DownloadState::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| *s == DownloadState::Skipped)
    }

    /// Interrupted jobs plus jobs that never started.
    pub fn pending(&self) -> usize {
        self.count(|s| matches!(s, DownloadState::Pending | DownloadState::InProgress))
            + self.not_started.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.outcomes.iter().map(|o| o.bytes).sum()
    }
}

pub struct Scheduler<'a> {
    pub settings: &'a RunSettings,
    pub downloader: &'a dyn Downloader,
    pub ledger: &'a LedgerStore,
    pub lifecycle: &'a Lifecycle,
    pub in_flight: &'a InFlight,
    pub cancel: &'a AtomicBool,
}

struct Shared {
    queue: Mutex<VecDeque<DownloadJob>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Shared {
    fn claim_next(&self) -> Option<DownloadJob> {
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        queue.pop_front()
    }
}

impl<'a> Scheduler<'a> {
    /// Drains `jobs` with at most `max_concurrent_downloads` workers and blocks
    /// until every worker has finished.
    pub fn run(&self, jobs: Vec<DownloadJob>) -> DrainReport {
        let started = Instant::now();
        if jobs.is_empty() {
            return DrainReport::default();
        }

        let total = jobs.len();
        let workers = self.settings.effective_concurrency().min(total);
        let shared = Shared {
            queue: Mutex::new(jobs.into_iter().collect()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        tracing::info!(jobs = total, workers, "download queue started");

        let (tx, rx) = mpsc::channel::<DownloadOutcome>();
        let mut outcomes = Vec::new();

        thread::scope(|scope| {
            for worker_id in 0..workers {
                let tx = tx.clone();
                let shared = &shared;
                scope.spawn(move || self.worker_loop(worker_id, shared, tx));
            }
            drop(tx);

            for outcome in rx {
                outcomes.push(outcome);
            }
        });

        let not_started: Vec<Item> = shared
            .queue
            .into_inner()
            .unwrap_or_else(|p| p.into_inner())
            .into_iter()
            .map(|job| job.item)
            .collect();

        let report = DrainReport {
            outcomes,
            not_started,
            peak_in_progress: shared.peak.load(Ordering::SeqCst),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            pending = report.pending(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "download queue drained"
        );
        report
    }

    fn worker_loop(&self, worker_id: usize, shared: &Shared, tx: mpsc::Sender<DownloadOutcome>) {
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            let Some(mut job) = shared.claim_next() else {
                break;
            };

            job.item.download_state = DownloadState::InProgress;
            self.in_flight.register(&job.item.id);
            let now_active = shared.active.fetch_add(1, Ordering::SeqCst) + 1;
            shared.peak.fetch_max(now_active, Ordering::SeqCst);
            tracing::debug!(
                worker_id,
                source_id = %job.item.source_id,
                item_id = %job.item.id,
                "download started"
            );

            let outcome = self.execute(&job);
            shared.active.fetch_sub(1, Ordering::SeqCst);
            let outcome = self.record(outcome);
            self.in_flight.release(&job.item.id);

            if tx.send(outcome).is_err() {
                break;
            }
        }
    }

    fn execute(&self, job: &DownloadJob) -> DownloadOutcome {
        let started = Instant::now();
        let attempt = self.downloader.download(job, self.settings, self.cancel);

        let mut outcome = match attempt {
            DownloadAttempt::Completed(path) => {
                let final_path = match self.lifecycle.finalize(&job.item, &path) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(
                            item_id = %job.item.id,
                            path = %path.display(),
                            error = %e,
                            "finalize failed, keeping downloaded name"
                        );
                        path
                    }
                };
                let mut outcome = DownloadOutcome::new(&job.item, DownloadState::Succeeded);
                outcome.bytes = std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
                outcome.file = Some(final_path);
                outcome
            }
            DownloadAttempt::Failed(reason) => {
                DownloadOutcome::new(&job.item, DownloadState::Failed(reason))
            }
            DownloadAttempt::Interrupted => DownloadOutcome::new(&job.item, DownloadState::Pending),
        };
        outcome.elapsed = started.elapsed();
        outcome
    }

    fn record(&self, mut outcome: DownloadOutcome) -> DownloadOutcome {
        match self.ledger.record_outcome(&outcome) {
            Ok(applied) => {
                if applied != outcome.state {
                    tracing::info!(
                        item_id = %outcome.item_id,
                        from = outcome.state.as_str(),
                        to = applied.as_str(),
                        "ledger adjusted outcome"
                    );
                    outcome.state = applied;
                }
            }
            Err(e) => {
                tracing::error!(
                    item_id = %outcome.item_id,
                    source_id = %outcome.source_id,
                    error = %e,
                    "failed to record outcome"
                );
                if outcome.state == DownloadState::Succeeded {
                    let reason = format!("downloaded but not recorded: {e}");
                    outcome.error = Some(reason.clone());
                    outcome.state = DownloadState::Failed(reason);
                }
            }
        }

        match &outcome.state {
            DownloadState::Succeeded => tracing::info!(
                item_id = %outcome.item_id,
                bytes = outcome.bytes,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "download succeeded"
            ),
            DownloadState::Failed(reason) => tracing::warn!(
                item_id = %outcome.item_id,
                reason = %reason,
                "download failed"
            ),
            DownloadState::Skipped => tracing::warn!(
                item_id = %outcome.item_id,
                "download skipped after repeated failures"
            ),
            DownloadState::Pending | DownloadState::InProgress => tracing::info!(
                item_id = %outcome.item_id,
                "download interrupted, item stays pending"
            ),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{DurationProbe, Lifecycle};
    use crate::sources::{SourceDescriptor, SourceKind};
    use std::path::Path;

    struct NoProbe;

    impl DurationProbe for NoProbe {
        fn duration_secs(&self, _path: &Path) -> crate::Result<Option<f64>> {
            Ok(None)
        }
    }

    /// Writes a file per job, tracking how many calls overlap.
    struct FakeDownloader {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        hold: Duration,
        fail_ids: Vec<String>,
    }

    impl FakeDownloader {
        fn new(hold: Duration) -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                hold,
                fail_ids: Vec::new(),
            }
        }
    }

    impl Downloader for FakeDownloader {
        fn download(
            &self,
            job: &DownloadJob,
            _settings: &RunSettings,
            cancel: &AtomicBool,
        ) -> DownloadAttempt {
            assert_eq!(job.item.download_state, DownloadState::InProgress);
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let deadline = Instant::now() + self.hold;
            while Instant::now() < deadline {
                if cancel.load(Ordering::SeqCst) {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return DownloadAttempt::Interrupted;
                }
                thread::sleep(Duration::from_millis(5));
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail_ids.contains(&job.item.id) {
                return DownloadAttempt::Failed("ERROR: simulated".to_string());
            }
            std::fs::create_dir_all(&job.out_dir).expect("mkdir");
            let path = job.out_dir.join(format!("title [{}].mp4", job.item.id));
            std::fs::write(&path, b"media-bytes").expect("write");
            DownloadAttempt::Completed(path)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        ledger: LedgerStore,
        lifecycle: Lifecycle,
        in_flight: InFlight,
    }

    fn fixture(sources: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let ledger = LedgerStore::open(root.join("ledger.json"))
            .expect("ledger")
            .with_failure_ceiling(Some(3));
        for id in sources {
            ledger
                .add_source(&SourceDescriptor {
                    id: id.to_string(),
                    kind: SourceKind::Channel,
                    display_name: id.to_string(),
                })
                .expect("add");
        }
        Fixture {
            _dir: dir,
            root,
            ledger,
            lifecycle: Lifecycle::new(Arc::new(NoProbe)),
            in_flight: InFlight::new(),
        }
    }

    fn jobs(fx: &Fixture, source: &str, n: usize) -> Vec<DownloadJob> {
        (0..n)
            .map(|i| DownloadJob {
                item: Item::pending(source, &format!("{source}-{i}")),
                out_dir: fx.root.join("library").join(source),
            })
            .collect()
    }

    fn run(
        fx: &Fixture,
        settings: &RunSettings,
        dl: &FakeDownloader,
        cancel: &AtomicBool,
        jobs: Vec<DownloadJob>,
    ) -> DrainReport {
        Scheduler {
            settings,
            downloader: dl,
            ledger: &fx.ledger,
            lifecycle: &fx.lifecycle,
            in_flight: &fx.in_flight,
            cancel,
        }
        .run(jobs)
    }

    #[test]
    fn concurrency_never_exceeds_ceiling() {
        for (ceiling, queue) in [(1usize, 0usize), (1, 4), (2, 7), (3, 3), (4, 12)] {
            let fx = fixture(&["a"]);
            let settings = RunSettings {
                max_concurrent_downloads: ceiling,
                ..RunSettings::default()
            };
            let dl = FakeDownloader::new(Duration::from_millis(30));
            let cancel = AtomicBool::new(false);
            let report = run(&fx, &settings, &dl, &cancel, jobs(&fx, "a", queue));

            assert_eq!(report.outcomes.len(), queue);
            assert_eq!(report.succeeded(), queue);
            assert!(dl.peak.load(Ordering::SeqCst) <= ceiling);
            assert!(report.peak_in_progress <= ceiling);
            assert_eq!(dl.calls.load(Ordering::SeqCst), queue);
            assert!(fx.in_flight.is_empty());
        }
    }

    #[test]
    fn two_sources_single_worker_both_succeed() {
        let fx = fixture(&["a", "b"]);
        let settings = RunSettings {
            max_concurrent_downloads: 1,
            ..RunSettings::default()
        };
        let dl = FakeDownloader::new(Duration::ZERO);
        let cancel = AtomicBool::new(false);
        let mut queue = jobs(&fx, "a", 1);
        queue.extend(jobs(&fx, "b", 1));

        let report = run(&fx, &settings, &dl, &cancel, queue);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 0);
        // A single worker preserves queue order.
        let order: Vec<&str> = report.outcomes.iter().map(|o| o.item_id.as_str()).collect();
        assert_eq!(order, vec!["a-0", "b-0"]);

        let ledger = fx.ledger.snapshot();
        assert!(ledger.source("a").expect("a").is_known("a-0"));
        assert!(ledger.source("b").expect("b").is_known("b-0"));
        assert_eq!(report.total_bytes(), 2 * "media-bytes".len() as u64);
    }

    #[test]
    fn failed_download_is_reported_and_not_known() {
        let fx = fixture(&["a"]);
        let settings = RunSettings::default();
        let mut dl = FakeDownloader::new(Duration::ZERO);
        dl.fail_ids = vec!["a-1".to_string()];
        let cancel = AtomicBool::new(false);

        let report = run(&fx, &settings, &dl, &cancel, jobs(&fx, "a", 3));
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        let failed = report
            .outcomes
            .iter()
            .find(|o| o.item_id == "a-1")
            .expect("failed outcome");
        assert_eq!(failed.error.as_deref(), Some("ERROR: simulated"));
        assert!(!fx.ledger.snapshot().source("a").expect("a").is_known("a-1"));
    }

    #[test]
    fn cancellation_leaves_items_pending() {
        let fx = fixture(&["a"]);
        let settings = RunSettings {
            max_concurrent_downloads: 2,
            ..RunSettings::default()
        };
        let dl = FakeDownloader::new(Duration::from_secs(30));
        let cancel = Arc::new(AtomicBool::new(false));

        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        let report = run(&fx, &settings, &dl, &cancel, jobs(&fx, "a", 5));
        canceller.join().expect("join");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.pending(), 5);
        assert_eq!(report.not_started.len(), 3);
        let ledger = fx.ledger.snapshot();
        let a = ledger.source("a").expect("a");
        assert!(a.known_items.is_empty());
        assert!(a.items.is_empty());
    }

    #[test]
    fn unknown_source_success_is_not_counted_as_success() {
        let fx = fixture(&["a"]);
        let settings = RunSettings::default();
        let dl = FakeDownloader::new(Duration::ZERO);
        let cancel = AtomicBool::new(false);
        let report = run(&fx, &settings, &dl, &cancel, jobs(&fx, "ghost", 1));
        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.failed(), 1);
    }
}
