use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const MAX_MAX_CONCURRENT_DOWNLOADS: usize = 16;

/// Options for one run cycle. Loaded once at run start and not changed while
/// the run is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub max_concurrent_downloads: usize,
    /// Height ceiling for the video format selector; `None` takes the best available.
    pub max_height: Option<u32>,
    pub audio_only: bool,
    pub video_container: String,
    pub audio_format: String,
    pub audio_quality: String,
    /// SponsorBlock categories cut from the media. Empty disables SponsorBlock.
    pub sponsorblock_remove: Vec<String>,
    /// Subtitle languages to fetch and embed. Empty disables subtitles.
    pub subtitle_langs: Vec<String>,
    pub embed_metadata: bool,
    pub embed_chapters: bool,
    /// Browser to borrow cookies from for private, unlisted or members-only items.
    pub cookies_from_browser: Option<String>,
    /// `None` keeps downloads forever.
    pub retention_days: Option<u32>,
    pub listing_depth: usize,
    pub initial_items_per_source: usize,
    pub skip_shorts: bool,
    pub shorts_max_seconds: u64,
    /// Consecutive failed cycles before an item is skipped. `None` retries forever.
    pub max_failures_before_skip: Option<u32>,
    pub listing_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub cancel_grace_secs: u64,
    pub library_dir: Option<PathBuf>,
    /// Program run after a cycle as `<program> ytfeed <message>`, e.g. `notify-send`.
    pub notify_command: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_height: Some(720),
            audio_only: false,
            video_container: "mp4".to_string(),
            audio_format: "mp3".to_string(),
            audio_quality: "320K".to_string(),
            sponsorblock_remove: [
                "sponsor",
                "intro",
                "outro",
                "selfpromo",
                "preview",
                "interaction",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            subtitle_langs: vec!["en".to_string()],
            embed_metadata: true,
            embed_chapters: true,
            cookies_from_browser: None,
            retention_days: Some(60),
            listing_depth: 100,
            initial_items_per_source: 5,
            skip_shorts: true,
            shorts_max_seconds: 60,
            max_failures_before_skip: Some(3),
            listing_timeout_secs: 120,
            download_timeout_secs: 1800,
            cancel_grace_secs: 10,
            library_dir: None,
            notify_command: None,
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(EngineError::InvalidSettings(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.max_height == Some(0) {
            return Err(EngineError::InvalidSettings(
                "max_height must be positive (use null for best quality)".to_string(),
            ));
        }
        if self.listing_depth == 0 {
            return Err(EngineError::InvalidSettings(
                "listing_depth must be at least 1".to_string(),
            ));
        }
        if self.max_failures_before_skip == Some(0) {
            return Err(EngineError::InvalidSettings(
                "max_failures_before_skip must be at least 1 (use null to retry forever)"
                    .to_string(),
            ));
        }
        if self.video_container.trim().is_empty() || self.audio_format.trim().is_empty() {
            return Err(EngineError::InvalidSettings(
                "video_container and audio_format must not be empty".to_string(),
            ));
        }
        for lang in &self.subtitle_langs {
            if lang.trim().is_empty() || lang.contains(',') {
                return Err(EngineError::InvalidSettings(format!(
                    "invalid subtitle language: {lang:?}"
                )));
            }
        }
        for category in &self.sponsorblock_remove {
            if category.trim().is_empty() || category.contains(',') {
                return Err(EngineError::InvalidSettings(format!(
                    "invalid sponsorblock category: {category:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrent_downloads
            .clamp(1, MAX_MAX_CONCURRENT_DOWNLOADS)
    }

    pub fn library_dir(&self, paths: &AppPaths) -> PathBuf {
        match &self.library_dir {
            Some(dir) => dir.clone(),
            None => paths.default_library_dir(),
        }
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<RunSettings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(RunSettings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: RunSettings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidSettings(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &RunSettings) -> Result<()> {
    settings.validate()?;
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
