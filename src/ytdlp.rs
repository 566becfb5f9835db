//! Invocation of the external `yt-dlp` tool: executable lookup, argument sets
//! for listings and downloads, and reading its results back.

use crate::cmd::{self, CommandRunError, RunControl};
use crate::config::RunSettings;
use crate::ledger::Item;
use crate::paths::AppPaths;
use crate::scheduler::{DownloadAttempt, DownloadJob, Downloader};
use crate::sources;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

pub const OUTPUT_TEMPLATE: &str = "%(title).150B [%(id)s].%(ext)s";
const SOCKET_TIMEOUT_SECS: &str = "30";
const SIDE_FILE_EXTENSIONS: [&str; 9] = [
    "part", "ytdl", "srt", "vtt", "json", "jpg", "webp", "png", "temp",
];

#[derive(Debug, Clone)]
pub struct YtDlp {
    paths: AppPaths,
}

impl YtDlp {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    fn candidates(&self) -> Vec<(PathBuf, Vec<&'static str>)> {
        let mut out = Vec::new();
        let bundled = self.paths.bundled_yt_dlp_path();
        if bundled.exists() {
            out.push((bundled, Vec::new()));
        }
        out.push((PathBuf::from("yt-dlp"), Vec::new()));
        out.push((PathBuf::from("python"), vec!["-m", "yt_dlp"]));
        out.push((PathBuf::from("python3"), vec!["-m", "yt_dlp"]));
        out
    }

    /// Runs the first yt-dlp executable that can be started.
    ///
    /// Only a missing executable (or a Python without the module) moves on to
    /// the next candidate; any other result is returned as is.
    pub fn run(
        &self,
        args: &[String],
        control: RunControl<'_>,
    ) -> std::result::Result<Output, CommandRunError> {
        for (program, prefix) in self.candidates() {
            let mut command = cmd::command(&program);
            command.args(&prefix);
            command.args(args);
            match cmd::run_with_control(&mut command, control) {
                Ok(output) => {
                    if !prefix.is_empty() && !output.status.success() {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        if stderr.contains("No module named") {
                            continue;
                        }
                    }
                    return Ok(output);
                }
                Err(CommandRunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(program = %program.display(), "yt-dlp candidate not found");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(CommandRunError::Spawn(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "yt-dlp is not installed (tried bundled, yt-dlp, python -m yt_dlp, python3 -m yt_dlp)",
        )))
    }
}

pub fn listing_args(listing_url: &str, depth: usize, settings: &RunSettings) -> Vec<String> {
    let mut args = vec![
        "--flat-playlist".to_string(),
        "--playlist-items".to_string(),
        format!("1-{}", depth.max(1)),
        "--dump-json".to_string(),
        "--ignore-errors".to_string(),
        "--no-warnings".to_string(),
        "--socket-timeout".to_string(),
        SOCKET_TIMEOUT_SECS.to_string(),
    ];
    push_cookie_args(&mut args, settings);
    args.push(listing_url.to_string());
    args
}

pub fn format_selector(settings: &RunSettings) -> String {
    if settings.audio_only {
        return "bestaudio[ext=m4a]/bestaudio/best".to_string();
    }
    match settings.max_height {
        Some(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
        None => "bestvideo+bestaudio/best".to_string(),
    }
}

/// Full argument set for downloading one item into `out_dir`.
pub fn download_args(
    settings: &RunSettings,
    item: &Item,
    out_dir: &Path,
    with_subtitles: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--no-playlist".to_string(),
        "--newline".to_string(),
        "--no-warnings".to_string(),
        "--no-cache-dir".to_string(),
        "--no-mtime".to_string(),
        "--retries".to_string(),
        "10".to_string(),
        "--fragment-retries".to_string(),
        "10".to_string(),
        "--socket-timeout".to_string(),
        SOCKET_TIMEOUT_SECS.to_string(),
        "-f".to_string(),
        format_selector(settings),
    ];

    if settings.audio_only {
        args.extend([
            "--extract-audio".to_string(),
            "--audio-format".to_string(),
            settings.audio_format.clone(),
            "--audio-quality".to_string(),
            settings.audio_quality.clone(),
            "--embed-thumbnail".to_string(),
        ]);
    } else {
        args.extend([
            "--merge-output-format".to_string(),
            settings.video_container.clone(),
        ]);
    }

    if !settings.sponsorblock_remove.is_empty() {
        args.push("--sponsorblock-remove".to_string());
        args.push(settings.sponsorblock_remove.join(","));
    }

    if with_subtitles && wants_subtitles(settings) {
        args.extend([
            "--write-sub".to_string(),
            "--write-auto-sub".to_string(),
            "--sub-langs".to_string(),
            settings.subtitle_langs.join(","),
            "--convert-subs".to_string(),
            "srt".to_string(),
            "--embed-subs".to_string(),
        ]);
    }

    if settings.embed_metadata {
        args.push("--embed-metadata".to_string());
    }
    if settings.embed_chapters {
        args.push("--embed-chapters".to_string());
    }
    push_cookie_args(&mut args, settings);

    args.extend([
        "-P".to_string(),
        out_dir.to_string_lossy().to_string(),
        "-o".to_string(),
        OUTPUT_TEMPLATE.to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "--no-simulate".to_string(),
        sources::item_url(&item.id),
    ]);
    args
}

fn push_cookie_args(args: &mut Vec<String>, settings: &RunSettings) {
    match settings.cookies_from_browser.as_deref().map(str::trim) {
        Some(browser) if !browser.is_empty() => {
            args.push("--cookies-from-browser".to_string());
            args.push(browser.to_string());
        }
        _ => args.push("--no-cookies".to_string()),
    }
}

pub fn wants_subtitles(settings: &RunSettings) -> bool {
    !settings.audio_only && !settings.subtitle_langs.is_empty()
}

/// yt-dlp can exit 0 while still reporting an `ERROR:` line.
pub fn has_error_line(stderr: &str) -> bool {
    stderr.lines().any(|l| l.trim_start().starts_with("ERROR:"))
}

/// Last `ERROR:` line, else the last non-empty line.
pub fn last_error_line(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
}

fn is_subtitle_failure(reason: &str) -> bool {
    let lower = reason.to_ascii_lowercase();
    lower.contains("subtitle") || lower.contains("429")
}

/// Finds the downloaded media file: the path yt-dlp printed, else a file in
/// `out_dir` whose name carries `[<item id>]`.
pub fn locate_output(stdout: &str, out_dir: &Path, item_id: &str) -> Option<PathBuf> {
    for line in stdout.lines().rev() {
        let candidate = PathBuf::from(line.trim());
        if !line.trim().is_empty() && is_non_empty_file(&candidate) {
            return Some(candidate);
        }
    }
    find_item_file(out_dir, item_id)
}

/// Largest media file in `dir` tagged with `[<item id>]`, ignoring sidecars.
pub fn find_item_file(dir: &Path, item_id: &str) -> Option<PathBuf> {
    let marker = format!("[{item_id}]");
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().contains(&marker))
                .unwrap_or(false)
        })
        .filter(|p| !is_side_file(p))
        .filter_map(|p| std::fs::metadata(&p).ok().filter(|m| m.is_file()).map(|m| (p, m.len())))
        .filter(|(_, len)| *len > 0)
        .max_by_key(|(_, len)| *len)
        .map(|(p, _)| p)
}

pub fn is_side_file(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let ext = e.to_string_lossy().to_ascii_lowercase();
            SIDE_FILE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn is_non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Downloads through the real yt-dlp executable.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    tool: YtDlp,
}

impl YtDlpDownloader {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            tool: YtDlp::new(paths),
        }
    }

    fn attempt(
        &self,
        job: &DownloadJob,
        settings: &RunSettings,
        cancel: &AtomicBool,
        with_subtitles: bool,
    ) -> DownloadAttempt {
        let args = download_args(settings, &job.item, &job.out_dir, with_subtitles);
        let control = RunControl::with_timeout(settings.download_timeout_secs)
            .cancelable(cancel, Duration::from_secs(settings.cancel_grace_secs));

        let output = match self.tool.run(&args, control) {
            Ok(output) => output,
            Err(CommandRunError::Canceled) => return DownloadAttempt::Interrupted,
            Err(e) => return DownloadAttempt::Failed(format!("yt-dlp {e}")),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || has_error_line(&stderr) {
            let reason = last_error_line(&stderr)
                .unwrap_or_else(|| format!("yt-dlp exited with code {:?}", output.status.code()));
            return DownloadAttempt::Failed(reason);
        }

        match locate_output(&stdout, &job.out_dir, &job.item.id) {
            Some(file) => DownloadAttempt::Completed(file),
            None => DownloadAttempt::Failed(format!(
                "yt-dlp reported success but no output file for {} was found in {}",
                job.item.id,
                job.out_dir.display()
            )),
        }
    }
}

impl Downloader for YtDlpDownloader {
    fn download(
        &self,
        job: &DownloadJob,
        settings: &RunSettings,
        cancel: &AtomicBool,
    ) -> DownloadAttempt {
        if let Err(e) = std::fs::create_dir_all(&job.out_dir) {
            return DownloadAttempt::Failed(format!(
                "cannot create {}: {e}",
                job.out_dir.display()
            ));
        }

        let with_subtitles = wants_subtitles(settings);
        let first = self.attempt(job, settings, cancel, with_subtitles);
        match first {
            DownloadAttempt::Failed(reason) if with_subtitles && is_subtitle_failure(&reason) => {
                tracing::warn!(
                    item_id = %job.item.id,
                    reason = %reason,
                    "retrying download without subtitles"
                );
                self.attempt(job, settings, cancel, false)
            }
            other => other,
        }
    }
}
