//! Mirror configuration and its on-disk catalog.
//!
//! Geometry depends only on whether a mirror is coated: coated blanks are
//! measured over a smaller outer diameter. The catalog holds per-mirror
//! overrides and the data roots used to locate each mirror's session folders.
//! It lives in `~/.mirror_config/mirrors.json` by default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modal::INCH_M;

/// Outer/inner diameters for one coating state, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MirrorGeometry {
    pub outer_diameter: f64,
    pub inner_diameter: f64,
}

/// Per-mirror override entry in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorEntry {
    #[serde(default)]
    pub coated: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("HOME not set")]
    NoHome,
}

/// Resolved configuration of one mirror. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub mirror_id: String,
    /// Outer diameter in metres
    pub outer_diameter: f64,
    /// Inner diameter in metres
    pub inner_diameter: f64,
    pub coated: bool,
    /// Folder holding this mirror's dated session folders
    pub storage_path: PathBuf,
}

impl MirrorConfig {
    /// Outer clear-aperture radius in metres.
    pub fn clear_outer(&self) -> f64 {
        0.5 * self.outer_diameter
    }

    /// Inner clear-aperture radius in metres.
    pub fn clear_inner(&self) -> f64 {
        0.5 * self.inner_diameter
    }
}

/// Mirror catalog: coating defaults, per-mirror overrides, data roots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorCatalog {
    pub coated: MirrorGeometry,
    pub uncoated: MirrorGeometry,
    #[serde(default)]
    pub mirrors: BTreeMap<String, MirrorEntry>,
    /// Candidate data roots, first existing one wins; the last is the fallback
    pub data_roots: Vec<PathBuf>,
}

impl Default for MirrorCatalog {
    fn default() -> Self {
        let mirrors = [("1", true), ("9", false), ("10", true), ("19", false)]
            .into_iter()
            .map(|(id, coated)| (id.to_string(), MirrorEntry { coated }))
            .collect();

        Self {
            coated: MirrorGeometry {
                outer_diameter: 30.0 * INCH_M,
                inner_diameter: 3.0 * INCH_M,
            },
            uncoated: MirrorGeometry {
                outer_diameter: 32.0 * INCH_M,
                inner_diameter: 3.0 * INCH_M,
            },
            mirrors,
            data_roots: vec![
                PathBuf::from("C:/Users/lfast-admin/Documents/mirrors"),
                PathBuf::from("mirrors"),
            ],
        }
    }
}

impl MirrorCatalog {
    /// Resolve the configuration for a mirror id.
    ///
    /// Unknown mirrors are treated as uncoated.
    pub fn mirror(&self, mirror_id: &str) -> MirrorConfig {
        let coated = self
            .mirrors
            .get(mirror_id)
            .map(|entry| entry.coated)
            .unwrap_or(false);
        let geometry = if coated { self.coated } else { self.uncoated };

        MirrorConfig {
            mirror_id: mirror_id.to_string(),
            outer_diameter: geometry.outer_diameter,
            inner_diameter: geometry.inner_diameter,
            coated,
            storage_path: self.data_root().join(format!("M{mirror_id}")),
        }
    }

    /// First data root that exists, else the last candidate.
    pub fn data_root(&self) -> PathBuf {
        self.data_roots
            .iter()
            .find(|p| p.exists())
            .or_else(|| self.data_roots.last())
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Location of the catalog on disk.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Storage rooted at `~/.mirror_config`.
    pub fn new() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME").map_err(|_| ConfigError::NoHome)?;
        Ok(Self {
            root_path: PathBuf::from(home).join(".mirror_config"),
        })
    }

    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn catalog_path(&self) -> PathBuf {
        self.root_path.join("mirrors.json")
    }

    /// Load the catalog, falling back to built-in defaults if none is stored.
    pub fn catalog(&self) -> Result<MirrorCatalog, ConfigError> {
        let path = self.catalog_path();
        if !path.exists() {
            return Ok(MirrorCatalog::default());
        }
        MirrorCatalog::load_from_file(&path)
    }

    /// Save the catalog, creating the config directory if needed.
    pub fn save_catalog(&self, catalog: &MirrorCatalog) -> Result<PathBuf, ConfigError> {
        std::fs::create_dir_all(&self.root_path)?;
        let path = self.catalog_path();
        catalog.save_to_file(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    #[test]
    fn test_coated_and_uncoated_defaults() {
        let catalog = MirrorCatalog::default();

        let coated = catalog.mirror("10");
        assert!(coated.coated);
        assert_relative_eq!(coated.outer_diameter, 0.762, epsilon = 1e-12);
        assert_relative_eq!(coated.clear_inner(), 0.0381, epsilon = 1e-12);

        let uncoated = catalog.mirror("19");
        assert!(!uncoated.coated);
        assert_relative_eq!(uncoated.outer_diameter, 0.8128, epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_mirror_is_uncoated() {
        let config = MirrorCatalog::default().mirror("42");
        assert!(!config.coated);
        assert!(config.storage_path.ends_with("M42"));
    }

    #[test]
    fn test_data_root_prefers_existing() {
        let dir = TempDir::new().unwrap();
        let catalog = MirrorCatalog {
            data_roots: vec![PathBuf::from("/definitely/not/here"), dir.path().to_path_buf()],
            ..MirrorCatalog::default()
        };
        assert_eq!(catalog.data_root(), dir.path());

        let catalog = MirrorCatalog {
            data_roots: vec![dir.path().to_path_buf(), PathBuf::from("fallback")],
            ..MirrorCatalog::default()
        };
        assert_eq!(catalog.data_root(), dir.path());
    }

    #[test]
    fn test_storage_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("cfg"));
        assert_eq!(storage.catalog().unwrap(), MirrorCatalog::default());
    }

    #[test]
    fn test_storage_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("cfg"));

        let mut catalog = MirrorCatalog::default();
        catalog
            .mirrors
            .insert("20".to_string(), MirrorEntry { coated: true });
        let path = storage.save_catalog(&catalog).unwrap();
        assert!(path.exists());

        let loaded = storage.catalog().unwrap();
        assert!(loaded.mirror("20").coated);
    }
}
