use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ytfeed_engine::config::{self, RunSettings};
use ytfeed_engine::engine::{cancel_on_termination, Engine, RunSummary};
use ytfeed_engine::history::History;
use ytfeed_engine::paths::AppPaths;
use ytfeed_engine::stats::Stats;
use ytfeed_engine::{logging, notify, EngineError};

const EXIT_ERROR: u8 = 1;
const EXIT_LOCK_HELD: u8 = 3;
const EXIT_CORRUPT_LEDGER: u8 = 4;

#[derive(Debug, Parser)]
#[command(name = "ytfeed", version, about = "Keeps local copies of YouTube channels and playlists")]
struct Cli {
    /// Data directory (defaults to $YTFEED_HOME or ~/.local/share/ytfeed).
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Track a channel or playlist (URL, @handle, channel id or playlist id).
    Add {
        descriptor: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Stop tracking a source. Downloaded files are kept.
    Remove { id: String },
    Rename { id: String, name: String },
    /// Forget every known item of a source.
    Reset { id: String },
    List,
    /// Run one cycle: list, download, tag, sweep.
    Run,
    Stats {
        #[arg(long)]
        json: bool,
    },
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    Export { file: PathBuf },
    Import { file: PathBuf },
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    Show,
    /// Write the default settings file if none exists.
    Init,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let paths = cli
        .base_dir
        .clone()
        .map(AppPaths::new)
        .unwrap_or_else(AppPaths::from_env);

    if let Err(e) = logging::init(&paths, cli.verbose) {
        eprintln!("warning: file logging unavailable: {e}");
    }

    match run(cli.command, paths) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(e: &EngineError) -> u8 {
    match e {
        EngineError::LockHeld { .. } => EXIT_LOCK_HELD,
        EngineError::CorruptLedger { .. } => EXIT_CORRUPT_LEDGER,
        _ => EXIT_ERROR,
    }
}

fn run(command: Command, paths: AppPaths) -> ytfeed_engine::Result<()> {
    let engine = Engine::new(paths.clone());
    match command {
        Command::Add { descriptor, name } => {
            let source = engine.add_source(&descriptor, name.as_deref())?;
            println!("added {} {} ({})", source.kind.as_str(), source.id, source.display_name);
        }
        Command::Remove { id } => {
            let source = engine.remove_source(&id)?;
            println!("removed {} ({})", source.id, source.display_name);
        }
        Command::Rename { id, name } => {
            engine.rename_source(&id, &name)?;
            println!("renamed {id}");
        }
        Command::Reset { id } => {
            let forgotten = engine.reset_source(&id)?;
            println!("reset {id}: forgot {forgotten} items");
        }
        Command::List => {
            for source in engine.list_sources()? {
                println!(
                    "{:<8} {:<34} {:<24} known={}",
                    source.kind.as_str(),
                    source.id,
                    source.display_name,
                    source.known_items.len()
                );
            }
        }
        Command::Run => {
            let settings = config::load_settings(&paths)?;
            let cancel = Arc::new(AtomicBool::new(false));
            if let Err(e) = cancel_on_termination(cancel.clone()) {
                tracing::warn!(error = %e, "could not install termination handler");
            }
            let summary = engine.run_cycle_with_cancel(&settings, cancel)?;
            print_summary(&summary);
            if let Some(program) = settings.notify_command.as_deref() {
                if notify::should_notify(&summary) {
                    if let Err(e) = notify::send(program, &summary) {
                        tracing::warn!(error = %e, "notification failed");
                    }
                }
            }
        }
        Command::Stats { json } => {
            let stats = engine.get_statistics()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats);
            }
        }
        Command::History { limit } => {
            let history = History::open(&paths)?;
            for run in history.recent_runs(limit)? {
                println!(
                    "{}  {}  ok={} failed={} skipped={} pending={} bytes={}{}",
                    run.id,
                    run.started_at_ms,
                    run.succeeded,
                    run.failed,
                    run.skipped,
                    run.pending,
                    run.total_bytes,
                    if run.canceled { " (canceled)" } else { "" }
                );
            }
            let failures = history.recent_failures(limit)?;
            if !failures.is_empty() {
                println!("recent failures:");
                for f in failures {
                    println!(
                        "  {}/{}: {}",
                        f.source_id,
                        f.item_id,
                        f.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }
        Command::Settings { action } => match action {
            SettingsAction::Show => {
                let settings = config::load_settings(&paths)?;
                println!("{}", serde_json::to_string_pretty(&settings)?);
            }
            SettingsAction::Init => {
                let path = paths.settings_path();
                if path.exists() {
                    println!("settings already exist at {}", path.display());
                } else {
                    config::save_settings(&paths, &RunSettings::default())?;
                    println!("wrote {}", path.display());
                }
            }
        },
        Command::Export { file } => {
            let count = engine.export_sources(&file)?;
            println!("exported {count} sources to {}", file.display());
        }
        Command::Import { file } => {
            let report = engine.import_sources(&file)?;
            println!("imported {} sources, {} already tracked", report.inserted, report.skipped);
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run {}: {} sources ({} unreachable, {} partial), {} queued",
        summary.run_id,
        summary.sources_checked,
        summary.sources_unreachable,
        summary.partial_listings,
        summary.queued
    );
    println!(
        "succeeded={} failed={} skipped={} pending={} bytes={} deleted={} elapsed={}s",
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.pending,
        summary.total_bytes,
        summary.retention_deleted,
        summary.elapsed_ms / 1000
    );
    for issue in &summary.source_errors {
        println!("  source {}: {}", issue.source_id, issue.message);
    }
    for e in summary.download_errors() {
        println!("  {e}");
    }
    if summary.canceled {
        println!("canceled; unfinished items will be retried next run");
    }
}

fn print_stats(stats: &Stats) {
    println!(
        "sources: {} ({} channels, {} playlists)",
        stats.tracked_sources, stats.channels, stats.playlists
    );
    println!(
        "items: {} known, {} downloaded, {} skipped, {} awaiting retry",
        stats.known_items, stats.downloaded_items, stats.skipped_items, stats.awaiting_retry
    );
    println!(
        "library: {} files, {:.1} MiB",
        stats.library_files,
        stats.library_bytes as f64 / (1024.0 * 1024.0)
    );
    match stats.last_run_at_ms {
        Some(ms) => println!("last run: {ms} (unix ms)"),
        None => println!("last run: never"),
    }
    for s in &stats.sources {
        println!(
            "  {:<34} {:<24} known={} files={} bytes={}",
            s.id, s.display_name, s.known_items, s.files, s.bytes
        );
    }
}
