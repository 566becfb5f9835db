use crate::cmd;
use crate::lifecycle::DurationProbe;
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::Deserialize;
use std::path::Path;

/// Container duration of `input` in seconds, or `None` when ffprobe has none.
pub fn probe_duration_secs(paths: &AppPaths, input: &Path) -> Result<Option<f64>> {
    let output = cmd::command(paths.ffprobe_cmd())
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "json",
        ])
        .arg(input)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: "ffprobe".to_string(),
            },
            _ => EngineError::Io(e),
        })?;

    if !output.status.success() {
        return Err(EngineError::ExternalToolFailed {
            tool: "ffprobe".to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    parse_duration_output(&output.stdout)
}

fn parse_duration_output(stdout: &[u8]) -> Result<Option<f64>> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;
    Ok(parsed
        .format
        .and_then(|f| f.duration)
        .as_deref()
        .and_then(parse_seconds))
}

/// Measures finished downloads with ffprobe.
#[derive(Debug, Clone)]
pub struct Ffprobe {
    paths: AppPaths,
}

impl Ffprobe {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }
}

impl DurationProbe for Ffprobe {
    fn duration_secs(&self, path: &Path) -> Result<Option<f64>> {
        probe_duration_secs(&self.paths, path)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_seconds(value: &str) -> Option<f64> {
    let seconds: f64 = value.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(seconds)
}
