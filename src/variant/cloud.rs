//! Cloud variant customization.
//!
//! Cloud providers attach a serial console and feed instance data
//! through cloud-init datasources, so the pre-hook pins both before
//! the bootloader config is regenerated.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::process::Cmd;

const SERIAL_CMDLINE: &str = "console=tty0 console=ttyS0,115200";
const DATASOURCE_CFG: &str = "datasource_list: [ NoCloud, ConfigDrive, OpenStack, Ec2 ]\n";

/// Replace (or add) the `GRUB_CMDLINE_LINUX_DEFAULT` entry in a GRUB
/// defaults file.
pub(super) fn set_grub_cmdline(existing: &str, cmdline: &str) -> String {
    let entry = format!("GRUB_CMDLINE_LINUX_DEFAULT=\"{cmdline}\"");
    let mut replaced = false;
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("GRUB_CMDLINE_LINUX_DEFAULT=") {
                replaced = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(entry);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

pub(super) fn pre_customize(mount_point: &Path) -> Result<()> {
    let grub_defaults = mount_point.join("etc/default/grub");
    let existing = fs::read_to_string(&grub_defaults).unwrap_or_default();
    fs::write(&grub_defaults, set_grub_cmdline(&existing, SERIAL_CMDLINE))
        .with_context(|| format!("writing {}", grub_defaults.display()))?;

    let datasource = mount_point.join("etc/cloud/cloud.cfg.d/90_datasource.cfg");
    if let Some(parent) = datasource.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(&datasource, DATASOURCE_CFG)
        .with_context(|| format!("writing {}", datasource.display()))?;

    Cmd::new("arch-chroot")
        .arg_path(mount_point)
        .args(["grub-mkconfig", "-o", "/boot/grub/grub.cfg"])
        .error_msg("regenerating GRUB config failed")
        .run()?;

    Ok(())
}

/// Convert the raw image to a compressed qcow2 and delete the raw file
/// once the conversion succeeded.
pub(super) fn convert_to_qcow2(raw: &Path, artifact: &Path) -> Result<()> {
    Cmd::new("qemu-img")
        .args(["convert", "-f", "raw", "-O", "qcow2", "-c"])
        .arg_path(raw)
        .arg_path(artifact)
        .error_msg("qemu-img convert failed")
        .run()?;

    fs::remove_file(raw).with_context(|| format!("removing {}", raw.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_replaces_existing_entry() {
        let before = "GRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet\"\n";
        let after = set_grub_cmdline(before, SERIAL_CMDLINE);
        assert!(after.contains("console=ttyS0,115200"));
        assert!(!after.contains("\"quiet\""));
        assert!(after.contains("GRUB_TIMEOUT=5"));
    }

    #[test]
    fn test_cmdline_appended_when_absent() {
        let after = set_grub_cmdline("GRUB_TIMEOUT=5\n", SERIAL_CMDLINE);
        assert!(after.ends_with(&format!(
            "GRUB_CMDLINE_LINUX_DEFAULT=\"{SERIAL_CMDLINE}\"\n"
        )));
    }

    #[test]
    fn test_datasource_lists_nocloud_first() {
        assert!(DATASOURCE_CFG.trim_start().starts_with("datasource_list: [ NoCloud"));
    }
}
