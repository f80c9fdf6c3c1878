use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

/// Source of audio durations; the assembly stage only needs this one answer.
pub trait DurationProbe: Send + Sync {
    fn duration_seconds(&self, path: &Path) -> Result<f64>;
}

#[derive(Debug, Clone)]
pub struct FfprobeDuration {
    binary: PathBuf,
}

impl Default for FfprobeDuration {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffprobe"),
        }
    }
}

impl FfprobeDuration {
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl DurationProbe for FfprobeDuration {
    fn duration_seconds(&self, path: &Path) -> Result<f64> {
        probe_duration_with(&self.binary, path)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

pub fn probe_duration(path: &Path) -> Result<f64> {
    probe_duration_with(Path::new("ffprobe"), path)
}

fn probe_duration_with(ffprobe: &Path, path: &Path) -> Result<f64> {
    if !path.is_file() {
        bail!("audio file not found: {}", path.display());
    }

    let output = Command::new(ffprobe)
        .args(["-v", "error", "-show_format", "-of", "json"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!(
                    "ffprobe executable not found (resolved_path={})",
                    ffprobe.display()
                )
            } else {
                anyhow!("failed to spawn ffprobe for {}: {error}", path.display())
            }
        })?;

    if !output.status.success() {
        bail!(
            "ffprobe failed with status {} for {}: {}",
            output.status,
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_duration(&output.stdout)
        .with_context(|| format!("failed to read duration of {}", path.display()))
}

pub fn parse_duration(json: &[u8]) -> Result<f64> {
    let parsed: ProbeOutput =
        serde_json::from_slice(json).context("ffprobe output is not valid JSON")?;
    let raw = parsed
        .format
        .duration
        .ok_or_else(|| anyhow!("ffprobe reported no duration"))?;
    let seconds: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid duration '{raw}'"))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("duration must be positive, got {seconds}");
    }
    Ok(seconds)
}
