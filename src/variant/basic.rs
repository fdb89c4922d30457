//! Basic variant: the bootstrapped system as-is, shipped as a
//! zstd-compressed raw image. No extra packages, no extra services.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::Path;

use crate::process::Cmd;

const ZSTD_LEVEL: i32 = 6;

pub(super) fn pre_customize(mount_point: &Path) -> Result<()> {
    Cmd::new("arch-chroot")
        .arg_path(mount_point)
        .args(["grub-mkconfig", "-o", "/boot/grub/grub.cfg"])
        .error_msg("regenerating GRUB config failed")
        .run()?;
    Ok(())
}

/// Compress the raw image in-process and delete it once the compressed
/// artifact is fully written.
pub(super) fn compress_raw(raw: &Path, artifact: &Path) -> Result<()> {
    let mut input = File::open(raw).with_context(|| format!("opening {}", raw.display()))?;
    let output =
        File::create(artifact).with_context(|| format!("creating {}", artifact.display()))?;

    zstd::stream::copy_encode(&mut input, &output, ZSTD_LEVEL)
        .with_context(|| format!("compressing {}", raw.display()))?;
    output
        .sync_all()
        .with_context(|| format!("flushing {}", artifact.display()))?;

    fs::remove_file(raw).with_context(|| format!("removing {}", raw.display()))?;
    Ok(())
}
