//! Preflight checks for build validation.
//!
//! Validates that the host has every external tool the pipeline drives
//! before any disk or loop device is touched. This prevents cryptic
//! mid-build failures that would otherwise leave work behind for the
//! cleanup guard.

use anyhow::{bail, Result};

use crate::process;

/// Host tools required for a full build.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("sfdisk", "util-linux"),
    ("losetup", "util-linux"),
    ("fstrim", "util-linux"),
    ("mkfs.vfat", "dosfstools"),
    ("mkfs.btrfs", "btrfs-progs"),
    ("btrfs", "btrfs-progs"),
    ("pacstrap", "arch-install-scripts"),
    ("arch-chroot", "arch-install-scripts"),
    ("qemu-img", "qemu-img"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with the list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !process::exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check that all tools in [`REQUIRED_TOOLS`] are available.
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_tools_list_is_well_formed() {
        assert!(!REQUIRED_TOOLS.is_empty());
        for (tool, package) in REQUIRED_TOOLS {
            assert!(!tool.is_empty());
            assert!(!package.is_empty());
        }
    }

    #[test]
    fn test_check_required_tools_success() {
        // These should exist on any Unix system
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure_names_package() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }
}
