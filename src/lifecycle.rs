//! Post-download file handling: duration-tagged renames and retention sweeps.

use crate::ledger::Item;
use crate::scheduler::InFlight;
use crate::ytdlp;
use crate::Result;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

const SECS_PER_DAY: u64 = 86_400;

pub trait DurationProbe: Send + Sync {
    fn duration_secs(&self, path: &Path) -> Result<Option<f64>>;
}

fn duration_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s*-\s*\d+(\.\d+)?(?:hr|min|sec|h|m|s)(?:\s*\d+(\.\d+)?(?:min|sec|m|s))?$")
            .expect("duration tag regex")
    })
}

fn item_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[([A-Za-z0-9_-]+)\]").expect("item id regex")
    })
}

pub fn has_duration_tag(stem: &str) -> bool {
    duration_tag_regex().is_match(stem)
}

/// Item id embedded in a library file name as `[<id>]`. The last match wins.
pub fn item_id_from_file_name(name: &str) -> Option<String> {
    item_id_regex()
        .captures_iter(name)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `3hr 45min`, `3hr`, `4min 5sec`, `4min` or `26sec`.
pub fn format_duration_tag(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.round() as u64
    } else {
        0
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        if minutes > 0 {
            format!("{hours}hr {minutes}min")
        } else {
            format!("{hours}hr")
        }
    } else if minutes > 0 {
        if secs > 0 {
            format!("{minutes}min {secs}sec")
        } else {
            format!("{minutes}min")
        }
    } else {
        format!("{secs}sec")
    }
}

pub struct Lifecycle {
    probe: Arc<dyn DurationProbe>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle").finish_non_exhaustive()
    }
}

impl Lifecycle {
    pub fn new(probe: Arc<dyn DurationProbe>) -> Self {
        Self { probe }
    }

    /// Appends ` -<duration>` to the file stem and renames matching sidecars.
    ///
    /// Already-tagged files and files with no known duration are returned unchanged.
    pub fn finalize(&self, item: &Item, file_path: &Path) -> Result<PathBuf> {
        let (Some(stem), Some(parent)) = (
            file_path.file_stem().map(|s| s.to_string_lossy().to_string()),
            file_path.parent(),
        ) else {
            return Ok(file_path.to_path_buf());
        };
        if has_duration_tag(&stem) {
            return Ok(file_path.to_path_buf());
        }

        let measured = match self.probe.duration_secs(file_path) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(path = %file_path.display(), error = %e, "duration probe failed");
                None
            }
        };
        let Some(seconds) = measured
            .filter(|s| s.is_finite() && *s > 0.0)
            .or_else(|| item.duration_seconds.filter(|d| *d > 0).map(|d| d as f64))
        else {
            return Ok(file_path.to_path_buf());
        };

        let tagged_stem = format!("{stem} -{}", format_duration_tag(seconds));
        let new_name = match file_path.extension() {
            Some(ext) => format!("{tagged_stem}.{}", ext.to_string_lossy()),
            None => tagged_stem.clone(),
        };
        let new_path = parent.join(new_name);
        if new_path.exists() {
            tracing::warn!(path = %new_path.display(), "tagged name already taken, leaving file as is");
            return Ok(file_path.to_path_buf());
        }

        std::fs::rename(file_path, &new_path)?;
        rename_sidecars(parent, &stem, &tagged_stem, file_path);
        tracing::debug!(from = %file_path.display(), to = %new_path.display(), "tagged with duration");
        Ok(new_path)
    }
}

fn rename_sidecars(dir: &Path, old_stem: &str, new_stem: &str, main_file: &Path) {
    let prefix = format!("{old_stem}.");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path == main_file {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let target = dir.join(format!("{new_stem}.{rest}"));
        if target.exists() {
            continue;
        }
        if let Err(e) = std::fs::rename(&path, &target) {
            tracing::warn!(path = %path.display(), error = %e, "failed to rename sidecar");
        }
    }
}

/// Deletes files under `root` older than `max_age_days` and prunes emptied
/// directories. `None` keeps everything. Files of in-flight items are left alone.
pub fn sweep_retention(root: &Path, max_age_days: Option<u32>, in_flight: &InFlight) -> Result<usize> {
    let Some(days) = max_age_days else {
        return Ok(0);
    };
    if !root.is_dir() {
        return Ok(0);
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(u64::from(days) * SECS_PER_DAY))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut deleted = 0usize;
    sweep_dir(root, cutoff, in_flight, &mut deleted)?;
    prune_empty_dirs(root, true)?;
    if deleted > 0 {
        tracing::info!(root = %root.display(), deleted, days, "retention sweep removed old files");
    }
    Ok(deleted)
}

fn sweep_dir(dir: &Path, cutoff: SystemTime, in_flight: &InFlight, deleted: &mut usize) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            sweep_dir(&path, cutoff, in_flight, deleted)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if modified > cutoff {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        let item_id = item_id_from_file_name(&name);
        match in_flight.unless_in_flight(item_id.as_deref(), || std::fs::remove_file(&path)) {
            None => {
                tracing::debug!(path = %path.display(), "skipping file of in-flight item");
            }
            Some(Ok(())) => {
                *deleted += 1;
                tracing::debug!(path = %path.display(), "deleted by retention");
            }
            Some(Err(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "could not delete old file");
            }
        }
    }
    Ok(())
}

/// Removes empty directories below `dir`. Returns whether `dir` ended up empty.
fn prune_empty_dirs(dir: &Path, is_root: bool) -> Result<bool> {
    let mut empty = true;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if !prune_empty_dirs(&entry.path(), false)? {
                empty = false;
            }
        } else {
            empty = false;
        }
    }
    if empty && !is_root {
        match std::fs::remove_dir(dir) {
            Ok(()) => tracing::debug!(dir = %dir.display(), "removed empty directory"),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "could not remove empty directory");
                return Ok(false);
            }
        }
    }
    Ok(empty)
}

/// Bytes and media file count under `root`, skipping sidecars and partial files.
pub fn library_usage(root: &Path) -> (u64, usize) {
    fn walk(dir: &Path, bytes: &mut u64, files: &mut usize) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                walk(&path, bytes, files);
            } else if meta.is_file() {
                *bytes += meta.len();
                if !ytdlp::is_side_file(&path) {
                    *files += 1;
                }
            }
        }
    }
    let mut bytes = 0;
    let mut files = 0;
    walk(root, &mut bytes, &mut files);
    (bytes, files)
}
