//! Builder configuration.
//!
//! Loaded from `builder.toml` when present, otherwise defaults. The
//! file only carries host-side knobs (mirror, sizes, directories);
//! variant definitions live in the registry.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_MIRROR: &str = "https://geo.mirror.pkgbuild.com/$repo/os/$arch";
const DEFAULT_DISK_SIZE_GIB: u64 = 8;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuilderConfig {
    /// Package mirror the bootstrap resolves against.
    pub mirror: String,
    /// Base disk image size in GiB; variants may override.
    pub disk_size_gib: u64,
    /// Scratch root; the per-run working directory is created inside.
    pub work_root: PathBuf,
    /// Where finished artifacts and checksums land.
    pub output_dir: PathBuf,
    /// Host package cache, bind-mounted into every variant chroot.
    pub package_cache: PathBuf,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            mirror: DEFAULT_MIRROR.to_string(),
            disk_size_gib: DEFAULT_DISK_SIZE_GIB,
            work_root: PathBuf::from("/var/tmp/vm-image-builder"),
            output_dir: PathBuf::from("output"),
            package_cache: PathBuf::from("/var/cache/pacman/pkg"),
        }
    }
}

impl BuilderConfig {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config '{}'", path.display()))?;
        Ok(config)
    }

    pub fn disk_size_bytes(&self) -> u64 {
        self.disk_size_gib * 1024 * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_missing() {
        let config = BuilderConfig::load(Path::new("/nonexistent/builder.toml")).unwrap();
        assert_eq!(config.disk_size_gib, DEFAULT_DISK_SIZE_GIB);
        assert_eq!(config.package_cache, PathBuf::from("/var/cache/pacman/pkg"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("builder.toml");
        fs::write(&path, "disk_size_gib = 20\n").unwrap();

        let config = BuilderConfig::load(&path).unwrap();
        assert_eq!(config.disk_size_gib, 20);
        assert_eq!(config.mirror, DEFAULT_MIRROR);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("builder.toml");
        fs::write(&path, "disk_size = 20\n").unwrap();

        assert!(BuilderConfig::load(&path).is_err());
    }

    #[test]
    fn test_disk_size_bytes() {
        let config = BuilderConfig::default();
        assert_eq!(config.disk_size_bytes(), 8 * 1024 * 1024 * 1024);
    }
}
