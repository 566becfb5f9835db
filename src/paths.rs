use std::path::{Path, PathBuf};

pub const BASE_DIR_ENV: &str = "YTFEED_HOME";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// `$YTFEED_HOME`, then `$XDG_DATA_HOME/ytfeed`, then `~/.local/share/ytfeed`.
    pub fn from_env() -> Self {
        if let Some(dir) = non_empty_env(BASE_DIR_ENV) {
            return Self::new(PathBuf::from(dir));
        }
        if let Some(dir) = non_empty_env("XDG_DATA_HOME") {
            return Self::new(PathBuf::from(dir).join("ytfeed"));
        }
        let home = non_empty_env("HOME")
            .or_else(|| non_empty_env("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".local").join("share").join("ytfeed"))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join("state")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir().join("ledger.json")
    }

    pub fn run_lock_path(&self) -> PathBuf {
        self.state_dir().join("run.lock")
    }

    pub fn default_library_dir(&self) -> PathBuf {
        self.base_dir.join("library")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn history_db_path(&self) -> PathBuf {
        self.db_dir().join("history.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.logs_dir().join("ytfeed.log")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn bundled_yt_dlp_path(&self) -> PathBuf {
        with_exe_extension(self.tools_dir().join("yt-dlp").join("yt-dlp"))
    }

    pub fn ffprobe_bin_path(&self) -> PathBuf {
        with_exe_extension(self.tools_dir().join("ffmpeg").join("ffprobe"))
    }

    pub fn ffprobe_cmd(&self) -> PathBuf {
        let path = self.ffprobe_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffprobe")
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.state_dir())?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

/// Directory inside the library that holds one source's downloads.
pub fn source_dir(library_dir: &Path, source_id: &str) -> PathBuf {
    library_dir.join(sanitize_component(source_id))
}

/// Maps an id or title onto a single portable path component.
pub fn sanitize_component(raw: &str) -> String {
    let mut out: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    while out.ends_with('.') || out.ends_with(' ') {
        out.pop();
    }
    if out.is_empty() || out == "." || out == ".." {
        return "_".to_string();
    }
    out
}

fn with_exe_extension(mut path: PathBuf) -> PathBuf {
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
