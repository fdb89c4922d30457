//! Artifact finalization: checksums, ownership, output placement.
//!
//! Artifacts are immutable once finalized: checksum first, then a
//! single move into the output directory, never touched again.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use walkdir::WalkDir;

/// Streaming SHA-256 of a file, hex-encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("hashing '{}'", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write the companion checksum file next to `artifact`, in
/// `sha256sum`-compatible format. Returns the checksum file path.
pub fn write_checksum_file(artifact: &Path) -> Result<PathBuf> {
    let digest = sha256_file(artifact)?;
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut checksum_path = artifact.as_os_str().to_os_string();
    checksum_path.push(".SHA256");
    let checksum_path = PathBuf::from(checksum_path);

    fs::write(&checksum_path, format!("{digest}  {name}\n"))
        .with_context(|| format!("writing '{}'", checksum_path.display()))?;
    Ok(checksum_path)
}

/// Move `path` into `dir`, falling back to copy+remove across
/// filesystems. Returns the new location.
pub fn move_into(path: &Path, dir: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .with_context(|| format!("'{}' has no file name", path.display()))?;
    let destination = dir.join(file_name);

    if destination.exists() {
        fs::remove_file(&destination)
            .with_context(|| format!("replacing '{}'", destination.display()))?;
    }
    fs::rename(path, &destination)
        .or_else(|_| {
            // Cross-filesystem: copy then remove
            fs::copy(path, &destination)?;
            fs::remove_file(path)?;
            Ok::<(), io::Error>(())
        })
        .with_context(|| format!("moving '{}' to '{}'", path.display(), destination.display()))?;

    Ok(destination)
}

/// The uid/gid of the user who invoked the privilege elevation, when
/// the process runs under sudo.
pub fn invoking_user() -> Option<(u32, u32)> {
    let uid = std::env::var("SUDO_UID").ok()?.parse().ok()?;
    let gid = std::env::var("SUDO_GID").ok()?.parse().ok()?;
    Some((uid, gid))
}

/// Return everything under `root` to the invoking user's ownership.
/// No-op when the process was not privilege-elevated.
pub fn fix_ownership(root: &Path) -> Result<()> {
    let Some((uid, gid)) = invoking_user() else {
        return Ok(());
    };

    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        chown(entry.path(), uid, gid)?;
    }
    Ok(())
}

fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path '{}' contains NUL", path.display()))?;
    // SAFETY: c_path is a valid NUL-terminated string for the call.
    let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("chown '{}'", path.display()));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ArtifactRecord {
    pub variant: String,
    pub file: String,
    pub sha256: String,
}

#[derive(Debug, Serialize)]
struct BuildManifest<'a> {
    schema: u32,
    version: &'a str,
    built_at: String,
    artifacts: &'a [ArtifactRecord],
}

/// Write `build-manifest.json` into the output directory, summarizing
/// the run.
pub fn write_manifest(output_dir: &Path, version: &str, artifacts: &[ArtifactRecord]) -> Result<PathBuf> {
    let manifest = BuildManifest {
        schema: 1,
        version,
        built_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("formatting build timestamp")?,
        artifacts,
    };

    let path = output_dir.join("build-manifest.json");
    let json = serde_json::to_string_pretty(&manifest).context("serializing build manifest")?;
    fs::write(&path, json).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sha256_known_vector() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        fs::write(&path, "abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_checksum_file_format() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("vm-basic-1.img.zst");
        fs::write(&artifact, "payload").unwrap();

        let checksum_path = write_checksum_file(&artifact).unwrap();
        assert_eq!(
            checksum_path.file_name().unwrap().to_str().unwrap(),
            "vm-basic-1.img.zst.SHA256"
        );

        let content = fs::read_to_string(&checksum_path).unwrap();
        let digest = sha256_file(&artifact).unwrap();
        assert_eq!(content, format!("{digest}  vm-basic-1.img.zst\n"));
    }

    #[test]
    fn test_move_into() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        let src = dir.path().join("artifact.qcow2");
        fs::write(&src, "image").unwrap();

        let moved = move_into(&src, &out).unwrap();
        assert!(!src.exists());
        assert_eq!(moved, out.join("artifact.qcow2"));
        assert_eq!(fs::read_to_string(&moved).unwrap(), "image");
    }

    #[test]
    fn test_fix_ownership_noop_without_sudo_env() {
        // Without SUDO_UID/SUDO_GID there is no invoking user to
        // restore; the walk must not run at all.
        if std::env::var_os("SUDO_UID").is_some() {
            return;
        }
        let dir = tempdir().unwrap();
        fix_ownership(dir.path()).unwrap();
    }

    #[test]
    fn test_manifest_contents() {
        let dir = tempdir().unwrap();
        let records = vec![ArtifactRecord {
            variant: "cloud".into(),
            file: "vm-cloud-1.qcow2".into(),
            sha256: "deadbeef".into(),
        }];

        let path = write_manifest(dir.path(), "20260806", &records).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["schema"], 1);
        assert_eq!(json["version"], "20260806");
        assert_eq!(json["artifacts"][0]["variant"], "cloud");
    }
}
