//! Base system installation into the mounted hierarchy.
//!
//! pacstrap resolves against an ephemeral pacman.conf written for this
//! run, so the host's own configuration never leaks into the build.
//! The `-c` flag keeps downloads in the host package cache, which is
//! deliberately shared across runs and across variants.

use std::fs;
use std::path::Path;

use crate::error::BuildError;
use crate::process::Cmd;

/// Render the ephemeral pacman.conf resolving against `mirror`.
pub fn pacman_conf(mirror: &str) -> String {
    format!(
        "[options]\n\
         Architecture = x86_64\n\
         SigLevel = Required DatabaseOptional\n\
         LocalFileSigLevel = Optional\n\
         \n\
         [core]\n\
         Server = {mirror}\n\
         \n\
         [extra]\n\
         Server = {mirror}\n"
    )
}

/// Mirrorlist written into the installed hierarchy so the produced
/// system can update itself against the same mirror.
pub fn mirrorlist(mirror: &str) -> String {
    format!("Server = {mirror}\n")
}

/// Install `packages` into `mount_point` against `mirror`.
///
/// Fatal for the entire run on failure: every variant derives from
/// this base.
pub fn bootstrap(
    mount_point: &Path,
    work_dir: &Path,
    mirror: &str,
    packages: &[String],
) -> Result<(), BuildError> {
    let conf_path = work_dir.join("pacman.conf");
    fs::write(&conf_path, pacman_conf(mirror)).map_err(|err| {
        BuildError::Bootstrap(format!("writing {}: {err}", conf_path.display()))
    })?;

    // -c: host package cache (shared across runs); -M: the image gets
    // the mirrorlist written below, not a copy of the host's.
    let mut cmd = Cmd::new("pacstrap")
        .arg("-C")
        .arg_path(&conf_path)
        .args(["-c", "-M"])
        .arg_path(mount_point);
    for package in packages {
        cmd = cmd.arg(package);
    }
    cmd.error_msg("pacstrap failed")
        .run_interactive()
        .map_err(|err| BuildError::Bootstrap(format!("{err:#}")))?;

    let mirrorlist_path = mount_point.join("etc/pacman.d/mirrorlist");
    if let Some(parent) = mirrorlist_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            BuildError::Bootstrap(format!("creating {}: {err}", parent.display()))
        })?;
    }
    fs::write(&mirrorlist_path, mirrorlist(mirror)).map_err(|err| {
        BuildError::Bootstrap(format!("writing {}: {err}", mirrorlist_path.display()))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIRROR: &str = "https://mirror.example.org/$repo/os/$arch";

    #[test]
    fn test_pacman_conf_points_every_repo_at_mirror() {
        let conf = pacman_conf(MIRROR);
        assert_eq!(conf.matches(MIRROR).count(), 2);
        assert!(conf.contains("[core]"));
        assert!(conf.contains("[extra]"));
    }

    #[test]
    fn test_signatures_stay_required() {
        let conf = pacman_conf(MIRROR);
        assert!(conf.contains("SigLevel = Required"));
    }

    #[test]
    fn test_mirrorlist_single_server_line() {
        let list = mirrorlist(MIRROR);
        assert_eq!(list, format!("Server = {MIRROR}\n"));
    }
}
