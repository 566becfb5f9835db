pub mod cmd;
pub mod config;
pub mod engine;
mod error;
pub mod ffmpeg;
pub mod gap;
pub mod history;
pub mod ledger;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod notify;
pub mod paths;
pub mod resolver;
pub mod scheduler;
pub mod sources;
pub mod stats;
pub mod ytdlp;

pub use error::{EngineError, Result};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
