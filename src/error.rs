use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source unreachable: {source_id}: {reason}")]
    SourceUnreachable { source_id: String, reason: String },

    #[error("partial listing for {source_id}: parsed {parsed} items, skipped {malformed} malformed entries")]
    PartialListing {
        source_id: String,
        parsed: usize,
        malformed: usize,
    },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("ledger at {path} is corrupt: {reason}")]
    CorruptLedger { path: PathBuf, reason: String },

    #[error("unknown source id: {0}")]
    UnknownSource(String),

    #[error("another run holds the lock at {path}{}", holder_suffix(.holder))]
    LockHeld {
        path: PathBuf,
        holder: Option<String>,
    },

    #[error("not a recognizable channel or playlist: {0}")]
    InvalidSource(String),

    #[error("source is already tracked: {0}")]
    DuplicateSource(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl EngineError {
    /// Integrity failures that must abort a whole cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::CorruptLedger { .. } | EngineError::LockHeld { .. }
        )
    }
}

fn holder_suffix(holder: &Option<String>) -> String {
    match holder {
        Some(h) => format!(" ({h})"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
