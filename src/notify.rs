//! Optional desktop notification after a cycle.
//!
//! The configured program is run as `<program> ytfeed <message>`, which suits
//! `notify-send` and any script taking a title and a body.

use crate::cmd::{self, CommandRunError, RunControl};
use crate::engine::RunSummary;
use crate::{EngineError, Result};

pub const NOTIFY_TITLE: &str = "ytfeed";
const NOTIFY_TIMEOUT_SECS: u64 = 10;

/// Quiet cycles, where nothing was fetched, failed or deleted, stay silent.
pub fn should_notify(summary: &RunSummary) -> bool {
    summary.succeeded > 0
        || summary.failed > 0
        || summary.retention_deleted > 0
        || summary.sources_unreachable > 0
        || summary.canceled
}

pub fn summary_message(summary: &RunSummary) -> String {
    let mut message = format!(
        "{} downloaded, {} failed, {} deleted",
        summary.succeeded, summary.failed, summary.retention_deleted
    );
    match summary.sources_unreachable {
        0 => {}
        1 => message.push_str(", 1 source unreachable"),
        n => message.push_str(&format!(", {n} sources unreachable")),
    }
    if summary.canceled {
        message.push_str(" (canceled)");
    }
    message
}

pub fn notify_args(summary: &RunSummary) -> Vec<String> {
    vec![NOTIFY_TITLE.to_string(), summary_message(summary)]
}

/// Runs `program` with the cycle summary. Output is discarded.
pub fn send(program: &str, summary: &RunSummary) -> Result<()> {
    let mut command = cmd::command(program);
    command.args(notify_args(summary));
    let tool_failed = |stderr: String, code: Option<i32>| EngineError::ExternalToolFailed {
        tool: program.to_string(),
        code,
        stderr,
    };

    let control = RunControl::with_timeout(NOTIFY_TIMEOUT_SECS);
    let output = match cmd::run_with_control(&mut command, control) {
        Ok(output) => output,
        Err(CommandRunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::ExternalToolMissing {
                tool: program.to_string(),
            });
        }
        Err(CommandRunError::Spawn(e)) => return Err(EngineError::Io(e)),
        Err(e) => return Err(tool_failed(e.to_string(), None)),
    };

    if !output.status.success() {
        return Err(tool_failed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
            output.status.code(),
        ));
    }
    tracing::debug!(program, "notification sent");
    Ok(())
}
