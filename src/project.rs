//! Saved projects: a render request plus the property details, with every
//! image and the narration copied under the storage root so a project keeps
//! working after the original files are gone.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error_codes::{CodedError, INVALID_PROJECT_NAME};
use crate::raster::load_image;
use crate::sandbox::StorageSandbox;
use crate::schema::RenderRequest;

pub const MAX_PROJECT_NAME_LEN: usize = 50;
pub const STATE_VERSION: &str = "1.0";
const STATE_FILE: &str = "state.json";
const PROJECT_LIST_FILE: &str = "project_list.json";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("'{0}' adında bir proje zaten var")]
    AlreadyExists(String),
    #[error("'{0}' adında bir proje bulunamadı")]
    NotFound(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    #[serde(default)]
    pub property_location: Option<String>,
    #[serde(default)]
    pub property_text: Option<String>,
    pub request: RenderRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMetadata {
    pub saved_date: DateTime<Utc>,
    pub version: String,
}

/// On-disk `state.json`: the flat snapshot plus a `_metadata` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(flatten)]
    pub snapshot: ProjectSnapshot,
    #[serde(rename = "_metadata")]
    pub metadata: StateMetadata,
}

pub fn validate_project_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    let reason = if trimmed.is_empty() {
        Some("proje adı boş olamaz")
    } else if name.chars().count() > MAX_PROJECT_NAME_LEN {
        Some("proje adı en fazla 50 karakter olabilir")
    } else if name.contains(['/', '\\']) || name.contains("..") {
        Some("proje adı yol ayırıcı veya '..' içeremez")
    } else if name.starts_with('.') {
        Some("proje adı '.' ile başlayamaz")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(anyhow!(CodedError::usage(
            INVALID_PROJECT_NAME,
            format!("geçersiz proje adı '{name}': {reason}"),
        ))),
        None => Ok(()),
    }
}

pub struct ProjectStore {
    sandbox: StorageSandbox,
}

impl ProjectStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            sandbox: StorageSandbox::new(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        self.sandbox.root()
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let path = self.sandbox.join(PROJECT_LIST_FILE)?;
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn write_list(&self, names: &[String]) -> Result<()> {
        let path = self.sandbox.join(PROJECT_LIST_FILE)?;
        let json = serde_json::to_string_pretty(names).context("failed to encode project list")?;
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Copies the snapshot's assets into the store and writes `state.json`.
    /// Existing projects are only replaced when `overwrite` is set.
    pub fn save(&self, name: &str, snapshot: &ProjectSnapshot, overwrite: bool) -> Result<ProjectState> {
        validate_project_name(name)?;
        let mut names = self.list()?;
        let project_dir = self.sandbox.join(name)?;
        let exists = names.iter().any(|existing| existing == name) || project_dir.exists();
        if exists && !overwrite {
            return Err(ProjectError::AlreadyExists(name.to_owned()).into());
        }

        // Assets are written to a staging directory first: an overwrite may be
        // saving a snapshot whose images live in the directory being replaced.
        let staging = self.sandbox.join(format!(".staging-{}", Uuid::new_v4()))?;
        let state = match self.write_project(&staging, &project_dir, snapshot) {
            Ok(state) => state,
            Err(error) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(error);
            }
        };
        if project_dir.exists() {
            fs::remove_dir_all(&project_dir)
                .with_context(|| format!("failed to replace {}", project_dir.display()))?;
        }
        fs::rename(&staging, &project_dir)
            .with_context(|| format!("failed to move project into {}", project_dir.display()))?;

        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_owned());
            self.write_list(&names)?;
        }
        info!(project = name, "project saved");
        Ok(state)
    }

    fn write_project(&self, staging: &Path, final_dir: &Path, snapshot: &ProjectSnapshot) -> Result<ProjectState> {
        let mut stored = snapshot.clone();
        stored.request.map_images =
            copy_images(&snapshot.request.map_images, staging, final_dir, "map_images")?;
        stored.request.user_images =
            copy_images(&snapshot.request.user_images, staging, final_dir, "user_images")?;

        stored.request.narration = match &snapshot.request.narration {
            Some(source) if source.is_file() => {
                let ext = source
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or("mp3");
                let relative = PathBuf::from("audio").join(format!("narration.{ext}"));
                let target = staging.join(&relative);
                create_parent(&target)?;
                fs::copy(source, &target).with_context(|| {
                    format!("failed to copy narration {}", source.display())
                })?;
                Some(final_dir.join(relative))
            }
            Some(source) => {
                warn!(path = %source.display(), "narration not found, project saved without audio");
                None
            }
            None => None,
        };

        let state = ProjectState {
            snapshot: stored,
            metadata: StateMetadata {
                saved_date: Utc::now(),
                version: STATE_VERSION.to_owned(),
            },
        };
        let json = serde_json::to_string_pretty(&state).context("failed to encode project state")?;
        let state_path = staging.join(STATE_FILE);
        create_parent(&state_path)?;
        fs::write(&state_path, json)
            .with_context(|| format!("failed to write {}", state_path.display()))?;
        Ok(state)
    }

    /// Reads a project back; stored images that disappeared are dropped with a
    /// warning.
    pub fn load(&self, name: &str) -> Result<ProjectState> {
        validate_project_name(name)?;
        let project_dir = self.existing_project_dir(name)?;
        let state_path = project_dir.join(STATE_FILE);
        if !state_path.is_file() {
            return Err(ProjectError::NotFound(name.to_owned()).into());
        }
        let raw = fs::read_to_string(&state_path)
            .with_context(|| format!("failed to read {}", state_path.display()))?;
        let mut state: ProjectState = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", state_path.display()))?;

        let request = &mut state.snapshot.request;
        for images in [&mut request.map_images, &mut request.user_images] {
            images.retain(|path| {
                let present = path.is_file();
                if !present {
                    warn!(path = %path.display(), "stored image missing");
                }
                present
            });
        }
        Ok(state)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        validate_project_name(name)?;
        let mut names = self.list()?;
        let listed = names.iter().any(|existing| existing == name);
        let project_dir = match self.existing_project_dir(name) {
            Ok(dir) => Some(dir),
            Err(_) if listed => None,
            Err(error) => return Err(error),
        };
        if let Some(dir) = project_dir {
            fs::remove_dir_all(&dir).with_context(|| format!("failed to delete {}", dir.display()))?;
        }
        if listed {
            names.retain(|existing| existing != name);
            self.write_list(&names)?;
        }
        info!(project = name, "project deleted");
        Ok(())
    }

    fn existing_project_dir(&self, name: &str) -> Result<PathBuf> {
        let candidate = self.sandbox.join(name)?;
        if !candidate.is_dir() {
            return Err(ProjectError::NotFound(name.to_owned()).into());
        }
        self.sandbox.resolve(name)
    }
}

fn copy_images(sources: &[PathBuf], staging: &Path, final_dir: &Path, kind: &str) -> Result<Vec<PathBuf>> {
    sources
        .iter()
        .enumerate()
        .map(|(index, source)| {
            let relative = PathBuf::from("images").join(kind).join(format!("image_{index}.png"));
            let target = staging.join(&relative);
            create_parent(&target)?;
            load_image(source)?
                .save(&target)
                .with_context(|| format!("failed to store {}", target.display()))?;
            Ok(final_dir.join(relative))
        })
        .collect()
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_codes::find_coded_error;

    #[test]
    fn names_are_bounded_and_plain() {
        assert!(validate_project_name("Bağdat Caddesi 3+1").is_ok());
        assert!(validate_project_name(&"x".repeat(50)).is_ok());
        for bad in ["", "   ", "a/b", "a\\b", "..", "x..y", ".hidden"] {
            let error = validate_project_name(bad).expect_err("name should be rejected");
            let coded = find_coded_error(&error).expect("coded error");
            assert_eq!(coded.code, INVALID_PROJECT_NAME, "{bad:?}");
        }
        assert!(validate_project_name(&"x".repeat(51)).is_err());
    }

    #[test]
    fn state_file_nests_metadata_block() {
        let state = ProjectState {
            snapshot: ProjectSnapshot {
                property_location: Some("Kadıköy, İstanbul".to_owned()),
                ..ProjectSnapshot::default()
            },
            metadata: StateMetadata {
                saved_date: Utc::now(),
                version: STATE_VERSION.to_owned(),
            },
        };
        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["_metadata"]["version"], "1.0");
        assert_eq!(value["property_location"], "Kadıköy, İstanbul");
        assert!(value["request"].is_object());
    }
}
