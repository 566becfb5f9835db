use crate::cmd::{CommandRunError, RunControl};
use crate::config::RunSettings;
use crate::ledger::{DownloadState, Item, TrackedSource};
use crate::paths::AppPaths;
use crate::sources;
use crate::ytdlp::{self, YtDlp};
use crate::{EngineError, Result};
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Items currently visible for one source, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub source_id: String,
    pub items: Vec<Item>,
    /// Lines or entries that could not be turned into an item.
    pub malformed: usize,
    /// Set when the tool reported an error but still produced items.
    pub tool_error: Option<String>,
}

impl Listing {
    pub fn is_partial(&self) -> bool {
        self.malformed > 0 || self.tool_error.is_some()
    }

    pub fn warning(&self) -> Option<EngineError> {
        if !self.is_partial() {
            return None;
        }
        Some(EngineError::PartialListing {
            source_id: self.source_id.clone(),
            parsed: self.items.len(),
            malformed: self.malformed,
        })
    }
}

pub trait SourceResolver: Send + Sync {
    /// Remote listing for `source`, without downloading media.
    ///
    /// Fails with `SourceUnreachable` when nothing usable came back. Raising
    /// `cancel` stops a listing that is still running.
    fn list_items(
        &self,
        source: &TrackedSource,
        settings: &RunSettings,
        cancel: &AtomicBool,
    ) -> Result<Listing>;
}

#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    tool: YtDlp,
}

impl YtDlpResolver {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            tool: YtDlp::new(paths),
        }
    }
}

impl SourceResolver for YtDlpResolver {
    fn list_items(
        &self,
        source: &TrackedSource,
        settings: &RunSettings,
        cancel: &AtomicBool,
    ) -> Result<Listing> {
        let url = sources::listing_url(&source.id, source.kind);
        let args = ytdlp::listing_args(&url, settings.listing_depth, settings);
        let unreachable = |reason: String| EngineError::SourceUnreachable {
            source_id: source.id.clone(),
            reason,
        };

        let control = RunControl::with_timeout(settings.listing_timeout_secs)
            .cancelable(cancel, Duration::from_secs(settings.cancel_grace_secs));
        let output = match self.tool.run(&args, control) {
            Ok(output) => output,
            Err(CommandRunError::Spawn(e)) => return Err(unreachable(format!("yt-dlp: {e}"))),
            Err(e) => return Err(unreachable(format!("yt-dlp {e}"))),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut listing = parse_listing(&source.id, &stdout);

        if !output.status.success() {
            let reason = ytdlp::last_error_line(&stderr)
                .unwrap_or_else(|| format!("yt-dlp exited with code {:?}", output.status.code()));
            if listing.items.is_empty() {
                return Err(unreachable(reason));
            }
            listing.tool_error = Some(reason);
        }

        Ok(listing)
    }
}

/// Parses `--dump-json` output, one JSON object per line.
pub fn parse_listing(source_id: &str, stdout: &str) -> Listing {
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut malformed = 0usize;

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                malformed += 1;
                continue;
            }
        };
        if is_tab_entry(&value) {
            continue;
        }
        match item_from_json(source_id, &value) {
            Some(item) => {
                if seen.insert(item.id.clone()) {
                    items.push(item);
                }
            }
            None => malformed += 1,
        }
    }

    if malformed > 0 {
        tracing::warn!(source_id, parsed = items.len(), malformed, "listing had malformed entries");
    }

    Listing {
        source_id: source_id.to_string(),
        items,
        malformed,
        tool_error: None,
    }
}

// Channels without an uploads tab list their tabs instead of videos.
fn is_tab_entry(value: &Value) -> bool {
    value.get("ie_key").and_then(Value::as_str) == Some("YoutubeTab")
        || value.get("_type").and_then(Value::as_str) == Some("playlist")
}

fn item_from_json(source_id: &str, value: &Value) -> Option<Item> {
    let id = value.get("id")?.as_str()?.trim();
    if id.is_empty() {
        return None;
    }

    let title = value
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string);
    let duration_seconds = positive_seconds(value.get("duration"))
        .or_else(|| positive_seconds(value.get("average_duration")));
    let publish_time = value
        .get("timestamp")
        .and_then(Value::as_i64)
        .or_else(|| value.get("release_timestamp").and_then(Value::as_i64))
        .or_else(|| {
            value
                .get("upload_date")
                .and_then(Value::as_str)
                .and_then(parse_upload_date)
        });

    Some(Item {
        id: id.to_string(),
        source_id: source_id.to_string(),
        title,
        publish_time,
        duration_seconds,
        download_state: DownloadState::Pending,
    })
}

fn positive_seconds(value: Option<&Value>) -> Option<u64> {
    let secs = value?.as_f64()?;
    if secs.is_finite() && secs > 0.0 {
        Some(secs.round() as u64)
    } else {
        None
    }
}

/// `YYYYMMDD` to unix seconds at midnight UTC. Impossible dates are rejected.
fn parse_upload_date(raw: &str) -> Option<i64> {
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}
