use crate::paths::AppPaths;
use crate::Result;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "YTFEED_LOG";

const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;
const KEPT_LOG_FILES: usize = 3;

/// Installs the global subscriber: stderr plus an append-only log file.
///
/// `YTFEED_LOG` takes an `EnvFilter` directive; without it the level is
/// `info`, or `debug` when `verbose` is set.
pub fn init(paths: &AppPaths, verbose: bool) -> Result<()> {
    std::fs::create_dir_all(paths.logs_dir())?;
    let log_path = paths.log_file_path();
    rotate_if_large(&log_path, MAX_LOG_BYTES)?;

    let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false),
        )
        .try_init()
        .ok();

    Ok(())
}

/// Shifts `ytfeed.log` to `ytfeed.log.1` (and so on) once it exceeds `max_bytes`.
fn rotate_if_large(path: &Path, max_bytes: u64) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if len <= max_bytes {
        return Ok(());
    }

    let rotated = |n: usize| {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        std::path::PathBuf::from(name)
    };
    let oldest = rotated(KEPT_LOG_FILES);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for n in (1..KEPT_LOG_FILES).rev() {
        let from = rotated(n);
        if from.exists() {
            std::fs::rename(&from, rotated(n + 1))?;
        }
    }
    std::fs::rename(path, rotated(1))?;
    Ok(())
}
