use crate::error::{Result, WardenError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Finds the entry point of a process when its spec names none
pub trait PathResolver: Send + Sync {
    fn resolve(&self, cwd: &Path) -> Result<PathBuf>;
}

/// Reads the entry point declared by a manifest file in the working directory
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    manifest: String,
}

#[derive(Deserialize)]
struct Manifest {
    main: Option<String>,
}

impl ManifestResolver {
    pub fn new() -> Self {
        Self::with_manifest("package.json")
    }

    pub fn with_manifest(manifest: impl Into<String>) -> Self {
        Self {
            manifest: manifest.into(),
        }
    }
}

impl Default for ManifestResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PathResolver for ManifestResolver {
    fn resolve(&self, cwd: &Path) -> Result<PathBuf> {
        let manifest_path = cwd.join(&self.manifest);

        let contents = std::fs::read_to_string(&manifest_path).map_err(|e| {
            WardenError::ResolutionError(format!(
                "Failed to read {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        let manifest: Manifest = serde_json::from_str(&contents).map_err(|e| {
            WardenError::ResolutionError(format!(
                "Invalid manifest {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        match manifest.main {
            Some(main) if !main.trim().is_empty() => Ok(cwd.join(main)),
            _ => Err(WardenError::ResolutionError(format!(
                "{} declares no entry point",
                manifest_path.display()
            ))),
        }
    }
}
