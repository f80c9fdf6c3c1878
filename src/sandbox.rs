use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Keeps every resolved path inside a storage root directory.
#[derive(Debug, Clone)]
pub struct StorageSandbox {
    root: PathBuf,
}

impl StorageSandbox {
    /// Creates the root if needed and canonicalizes it.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(root.as_ref()).with_context(|| {
            format!("Failed to create storage root: {}", root.as_ref().display())
        })?;
        let root = fs::canonicalize(root.as_ref()).with_context(|| {
            format!(
                "Failed to canonicalize storage root: {}",
                root.as_ref().display()
            )
        })?;
        Ok(Self { root })
    }

    /// Resolves an existing entry, rejecting anything that lands outside the
    /// root, including through symlinks.
    pub fn resolve<P: AsRef<Path>>(&self, target: P) -> Result<PathBuf> {
        let combined = self.root.join(target.as_ref());
        let canonical = fs::canonicalize(&combined).with_context(|| {
            format!(
                "Failed to resolve or canonicalize path: {}",
                combined.display()
            )
        })?;

        if !canonical.starts_with(&self.root) {
            bail!(
                "Path traversal violation: blocked access to {}",
                canonical.display()
            );
        }
        Ok(canonical)
    }

    /// Joins a path that may not exist yet. Only plain relative components
    /// are accepted.
    pub fn join<P: AsRef<Path>>(&self, target: P) -> Result<PathBuf> {
        let target = target.as_ref();
        if target
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            bail!(
                "Path traversal violation: {} is not a plain relative path",
                target.display()
            );
        }
        Ok(self.root.join(target))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
