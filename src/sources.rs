use crate::{now_ms, EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

const EXPORT_SCHEMA_VERSION: u32 = 1;
const YOUTUBE_BASE: &str = "https://www.youtube.com";
const PLAYLIST_ID_PREFIXES: [&str; 7] = ["PL", "UU", "OL", "FL", "LL", "RD", "WL"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Channel,
    Playlist,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Channel => "channel",
            SourceKind::Playlist => "playlist",
        }
    }
}

/// What a user asked to track, normalized to a stable id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub kind: SourceKind,
    pub display_name: String,
}

impl SourceDescriptor {
    /// Accepts channel/playlist URLs, `@handle`, `UC…` channel ids and bare playlist ids.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(EngineError::InvalidSource(input.to_string()));
        }

        let looks_like_url = trimmed.contains("://")
            || trimmed.contains("youtube.com")
            || trimmed.contains("youtu.be");
        let parsed = if looks_like_url {
            parse_url(trimmed)
        } else {
            parse_bare(trimmed)
        };
        let (id, kind) = parsed.ok_or_else(|| EngineError::InvalidSource(input.to_string()))?;
        let display_name = default_display_name(&id, kind);
        Ok(Self {
            id,
            kind,
            display_name,
        })
    }

    pub fn with_display_name(mut self, name: Option<&str>) -> Self {
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            self.display_name = name.to_string();
        }
        self
    }
}

pub fn listing_url(id: &str, kind: SourceKind) -> String {
    match kind {
        SourceKind::Playlist => format!("{YOUTUBE_BASE}/playlist?list={id}"),
        SourceKind::Channel => {
            if id.starts_with('@') || id.starts_with("c/") || id.starts_with("user/") {
                format!("{YOUTUBE_BASE}/{id}/videos")
            } else {
                format!("{YOUTUBE_BASE}/channel/{id}/videos")
            }
        }
    }
}

pub fn item_url(item_id: &str) -> String {
    format!("{YOUTUBE_BASE}/watch?v={item_id}")
}

fn parse_url(raw: &str) -> Option<(String, SourceKind)> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let parsed = Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let is_youtube = host == "youtube.com" || host.ends_with(".youtube.com");
    if !is_youtube && host != "youtu.be" {
        return None;
    }

    for (k, v) in parsed.query_pairs() {
        if k == "list" {
            let id = v.trim().to_string();
            if is_valid_id(&id) {
                return Some((id, SourceKind::Playlist));
            }
        }
    }
    if !is_youtube {
        return None;
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    match segments.as_slice() {
        ["channel", id, ..] if is_valid_id(id) => Some((id.to_string(), SourceKind::Channel)),
        ["c", name, ..] if is_valid_id(name) => Some((format!("c/{name}"), SourceKind::Channel)),
        ["user", name, ..] if is_valid_id(name) => {
            Some((format!("user/{name}"), SourceKind::Channel))
        }
        [first, ..] if first.starts_with('@') => {
            let handle = percent_decode(first);
            if is_valid_handle(&handle) {
                Some((handle, SourceKind::Channel))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn parse_bare(raw: &str) -> Option<(String, SourceKind)> {
    if raw.starts_with('@') {
        return is_valid_handle(raw).then(|| (raw.to_string(), SourceKind::Channel));
    }
    for prefix in ["c/", "user/"] {
        if let Some(name) = raw.strip_prefix(prefix) {
            return is_valid_id(name).then(|| (raw.to_string(), SourceKind::Channel));
        }
    }
    if !is_valid_id(raw) {
        return None;
    }
    if raw.starts_with("UC") && raw.len() == 24 {
        return Some((raw.to_string(), SourceKind::Channel));
    }
    if raw.len() >= 12 && PLAYLIST_ID_PREFIXES.iter().any(|p| raw.starts_with(p)) {
        return Some((raw.to_string(), SourceKind::Playlist));
    }
    None
}

fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_valid_handle(value: &str) -> bool {
    match value.strip_prefix('@') {
        Some(rest) => {
            !rest.is_empty()
                && rest
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
        }
        None => false,
    }
}

fn percent_decode(segment: &str) -> String {
    url::form_urlencoded::parse(format!("x={segment}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| segment.to_string())
}

fn default_display_name(id: &str, kind: SourceKind) -> String {
    match kind {
        SourceKind::Playlist => id.to_string(),
        SourceKind::Channel => {
            if let Some(handle) = id.strip_prefix('@') {
                return handle.to_string();
            }
            id.rsplit('/').next().unwrap_or(id).to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourcesExportFile {
    schema_version: u32,
    exported_at_ms: i64,
    app: String,
    sources: Vec<SourceDescriptor>,
}

pub fn write_export(path: &Path, sources: &[SourceDescriptor]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = SourcesExportFile {
        schema_version: EXPORT_SCHEMA_VERSION,
        exported_at_ms: now_ms(),
        app: "ytfeed".to_string(),
        sources: sources.to_vec(),
    };
    let json = serde_json::to_string_pretty(&file)?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}

/// Reads an export file, re-normalizing every id. Unparseable entries are dropped.
pub fn read_export(path: &Path) -> Result<Vec<SourceDescriptor>> {
    let bytes = std::fs::read(path)?;
    let file: SourcesExportFile = serde_json::from_slice(&bytes)?;
    if file.schema_version > EXPORT_SCHEMA_VERSION {
        return Err(EngineError::InvalidSource(format!(
            "unsupported export schema_version {} in {}",
            file.schema_version,
            path.to_string_lossy()
        )));
    }

    let mut out = Vec::with_capacity(file.sources.len());
    for entry in file.sources {
        match SourceDescriptor::parse(&entry.id) {
            Ok(parsed) => out.push(parsed.with_display_name(Some(&entry.display_name))),
            Err(e) => tracing::warn!(id = %entry.id, error = %e, "skipping unparseable export entry"),
        }
    }
    Ok(out)
}
