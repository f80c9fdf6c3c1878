//! Application settings: an optional YAML file, then environment overrides,
//! then command-line flags (applied by the binary). Later layers win.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::assembly::{AssemblyOptions, DEFAULT_SILENT_SECONDS_PER_IMAGE};

pub const CONFIG_ENV: &str = "PROPERTY_REEL_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AppConfig {
    pub output_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub silent_seconds_per_image: f64,
    /// Render jobs still running after this many seconds are failed.
    pub task_timeout_secs: Option<u64>,
    /// Finished task records older than this are purged while polling.
    pub task_retention_secs: u64,
    pub poll_interval_ms: u64,
    pub ffmpeg_mode: String,
    pub log_format: String,
    pub api: ApiKeys,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            projects_dir: PathBuf::from("storage"),
            silent_seconds_per_image: DEFAULT_SILENT_SECONDS_PER_IMAGE,
            task_timeout_secs: Some(180),
            task_retention_secs: 1800,
            poll_interval_ms: 2000,
            ffmpeg_mode: "auto".to_owned(),
            log_format: "pretty".to_owned(),
            api: ApiKeys::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApiKeys {
    pub google_maps: Option<String>,
    pub google_places: Option<String>,
    pub gemini: Option<String>,
    pub elevenlabs: Option<String>,
    pub elevenlabs_voice_id: Option<String>,
}

impl AppConfig {
    /// Explicit path, else `$PROPERTY_REEL_CONFIG`, else defaults; environment
    /// overrides are applied on top in every case.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&raw).map_err(|error| {
            let location = error
                .location()
                .map(|location| format!("line {}, column {}", location.line(), location.column()))
                .unwrap_or_else(|| "unknown location".to_owned());
            anyhow!("failed to parse config {} at {}: {}", path.display(), location, error)
        })
    }

    /// Applies overrides from `lookup`, which stands in for the process
    /// environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(dir) = non_empty("PROPERTY_REEL_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty("PROPERTY_REEL_PROJECTS_DIR") {
            self.projects_dir = PathBuf::from(dir);
        }
        if let Some(raw) = non_empty("PROPERTY_REEL_TASK_TIMEOUT") {
            self.task_timeout_secs = parse_timeout(&raw)
                .with_context(|| format!("invalid PROPERTY_REEL_TASK_TIMEOUT '{raw}'"))?;
        }
        if let Some(mode) = non_empty("PROPERTY_REEL_FFMPEG_MODE") {
            self.ffmpeg_mode = mode;
        }
        if let Some(format) = non_empty("PROPERTY_REEL_LOG_FORMAT") {
            self.log_format = format;
        }

        let keys = [
            ("GOOGLE_MAPS_API_KEY", &mut self.api.google_maps),
            ("GOOGLE_PLACES_API_KEY", &mut self.api.google_places),
            ("GEMINI_API_KEY", &mut self.api.gemini),
            ("ELEVENLABS_API_KEY", &mut self.api.elevenlabs),
            ("ELEVENLABS_VOICE_ID", &mut self.api.elevenlabs_voice_id),
        ];
        for (key, slot) in keys {
            if let Some(value) = non_empty(key) {
                *slot = Some(value);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.silent_seconds_per_image > 0.0 && self.silent_seconds_per_image.is_finite()) {
            bail!(
                "silent_seconds_per_image must be > 0, got {}",
                self.silent_seconds_per_image
            );
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be > 0");
        }
        if self.task_timeout_secs == Some(0) {
            bail!("task_timeout_secs must be > 0 (omit it to disable the timeout)");
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    pub fn assembly_options(&self) -> AssemblyOptions {
        AssemblyOptions {
            output_dir: self.output_dir.clone(),
            silent_seconds_per_image: self.silent_seconds_per_image,
        }
    }
}

/// `none`/`off`/`0` disable the timeout; anything else must be whole seconds.
pub fn parse_timeout(raw: &str) -> Result<Option<u64>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "none" | "off" | "0" => Ok(None),
        value => Ok(Some(value.parse::<u64>()?)),
    }
}

/// CLI wins over env; `None` when neither says anything.
pub fn resolve_bool_override(cli_arg: Option<bool>, env_var: Option<String>) -> Option<bool> {
    if cli_arg.is_some() {
        return cli_arg;
    }
    match env_var.as_deref().map(str::trim) {
        Some("1") | Some("on") | Some("true") => Some(true),
        Some("0") | Some("off") | Some("false") => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_values_fill_and_defaults_remain() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, "output_dir: /srv/videos\napi:\n  gemini: from-file\n").expect("write config");

        let config = AppConfig::from_file(&path).expect("config should parse");
        assert_eq!(config.output_dir, PathBuf::from("/srv/videos"));
        assert_eq!(config.api.gemini.as_deref(), Some("from-file"));
        assert_eq!(config.task_timeout_secs, Some(180));
        assert_eq!(config.poll_interval_ms, 2000);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = AppConfig {
            api: ApiKeys {
                gemini: Some("from-file".to_owned()),
                ..ApiKeys::default()
            },
            ..AppConfig::default()
        };
        config
            .apply_env(env_from(&[
                ("GEMINI_API_KEY", "from-env"),
                ("PROPERTY_REEL_TASK_TIMEOUT", "off"),
                ("ELEVENLABS_API_KEY", "  "),
            ]))
            .expect("env should apply");
        assert_eq!(config.api.gemini.as_deref(), Some("from-env"));
        assert_eq!(config.task_timeout_secs, None);
        assert_eq!(config.api.elevenlabs, None);
    }

    #[test]
    fn bad_timeout_is_reported() {
        let mut config = AppConfig::default();
        let error = config
            .apply_env(env_from(&[("PROPERTY_REEL_TASK_TIMEOUT", "soon")]))
            .expect_err("non-numeric timeout must fail");
        assert!(error.to_string().contains("PROPERTY_REEL_TASK_TIMEOUT"));
    }

    #[test]
    fn cli_flag_beats_env_for_bool_overrides() {
        assert_eq!(resolve_bool_override(Some(false), Some("1".to_owned())), Some(false));
        assert_eq!(resolve_bool_override(None, Some("on".to_owned())), Some(true));
        assert_eq!(resolve_bool_override(None, Some("maybe".to_owned())), None);
        assert_eq!(resolve_bool_override(None, None), None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, "outptu_dir: typo\n").expect("write config");
        assert!(AppConfig::from_file(&path).is_err());
    }
}
