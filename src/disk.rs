//! Disk image creation, partitioning and formatting.
//!
//! The layout is fixed: a 1MiB BIOS-boot partition, a 300MiB EFI
//! system partition, and a root partition consuming the remaining
//! space. The root partition is always last so a grown image only has
//! to delete and recreate it at the new end-of-disk boundary; the two
//! fixed partitions in front of it are never touched.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::process::Cmd;
use crate::resource::{partition_node, MountOptions, ResourceHandle, EFI_PARTITION, ROOT_PARTITION};

/// GPT type GUID for the BIOS boot partition.
pub const TYPE_BIOS_BOOT: &str = "21686148-6449-6E6F-744E-656564454649";
/// GPT type GUID for the EFI system partition.
pub const TYPE_EFI_SYSTEM: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
/// GPT type GUID for a Linux x86-64 root partition.
pub const TYPE_LINUX_ROOT: &str = "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709";

pub const BIOS_BOOT_SIZE_MIB: u64 = 1;
pub const EFI_SIZE_MIB: u64 = 300;

/// A raw disk image file and its logical size.
#[derive(Debug, Clone)]
pub struct DiskImage {
    pub path: PathBuf,
    pub size: u64,
}

/// sfdisk input describing the full three-partition GPT layout. The
/// root entry carries no size, so sfdisk end-aligns it over the
/// remaining space.
pub fn gpt_layout_script() -> String {
    format!(
        "label: gpt\n\
         size={BIOS_BOOT_SIZE_MIB}MiB, type={TYPE_BIOS_BOOT}, name=\"boot\"\n\
         size={EFI_SIZE_MIB}MiB, type={TYPE_EFI_SYSTEM}, name=\"efi\"\n\
         type={TYPE_LINUX_ROOT}, name=\"root\"\n"
    )
}

/// sfdisk input recreating only the root partition, appended after the
/// old one was deleted from a grown image.
pub fn root_recreate_script() -> String {
    format!("type={TYPE_LINUX_ROOT}, name=\"root\"\n")
}

/// Truncate a fresh sparse file of `size` bytes at `path`.
fn create_sparse(path: &Path, size: u64) -> Result<(), BuildError> {
    let file = File::create(path)
        .map_err(|err| BuildError::DiskSetup(format!("creating {}: {err}", path.display())))?;
    file.set_len(size)
        .map_err(|err| BuildError::DiskSetup(format!("truncating {}: {err}", path.display())))?;
    Ok(())
}

/// Create, partition, format and mount the base disk image.
///
/// On success the root filesystem is mounted at the handle's mount
/// point with the EFI partition under it, ready for bootstrap. Any
/// partitioning or formatting failure is fatal for the whole run; the
/// image file is in an undefined state and must be discarded.
pub fn create_base_disk(
    handle: &ResourceHandle,
    path: &Path,
    size: u64,
) -> Result<DiskImage, BuildError> {
    create_sparse(path, size)?;

    Cmd::new("sfdisk")
        .arg_path(path)
        .stdin(gpt_layout_script())
        .error_msg("writing GPT partition table failed")
        .run()
        .map_err(|err| BuildError::DiskSetup(format!("{err:#}")))?;

    let loop_device = handle.attach(path)?;
    handle.wait_settled(&loop_device)?;

    format_partitions(&loop_device)?;
    handle.mount_hierarchy(&loop_device, MountOptions::default())?;

    Ok(DiskImage {
        path: path.to_path_buf(),
        size,
    })
}

fn format_partitions(loop_device: &str) -> Result<(), BuildError> {
    let efi_node = partition_node(loop_device, EFI_PARTITION);
    Cmd::new("mkfs.vfat")
        .args(["-F", "32", "-n", "EFI"])
        .arg_path(&efi_node)
        .error_msg("mkfs.vfat failed")
        .run()
        .map_err(|err| BuildError::DiskSetup(format!("{err:#}")))?;

    let root_node = partition_node(loop_device, ROOT_PARTITION);
    Cmd::new("mkfs.btrfs")
        .args(["-q", "-L", "root"])
        .arg_path(&root_node)
        .error_msg("mkfs.btrfs failed")
        .run()
        .map_err(|err| BuildError::DiskSetup(format!("{err:#}")))?;

    Ok(())
}

/// Grow a cloned image to `new_size`: truncate the file, delete the
/// root partition and recreate it end-aligned. The filesystem itself
/// is grown after the image is mounted (see [`grow_root_filesystem`]).
pub fn grow_disk(image: &mut DiskImage, new_size: u64) -> Result<(), BuildError> {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(&image.path)
        .map_err(|err| {
            BuildError::DiskSetup(format!("opening {}: {err}", image.path.display()))
        })?;
    file.set_len(new_size).map_err(|err| {
        BuildError::DiskSetup(format!("growing {}: {err}", image.path.display()))
    })?;

    Cmd::new("sfdisk")
        .arg("--delete")
        .arg_path(&image.path)
        .arg(&ROOT_PARTITION.to_string())
        .error_msg("deleting root partition failed")
        .run()
        .map_err(|err| BuildError::DiskSetup(format!("{err:#}")))?;

    Cmd::new("sfdisk")
        .arg("--append")
        .arg_path(&image.path)
        .stdin(root_recreate_script())
        .error_msg("recreating root partition failed")
        .run()
        .map_err(|err| BuildError::DiskSetup(format!("{err:#}")))?;

    image.size = new_size;
    Ok(())
}

/// Grow the mounted root filesystem to fill its partition.
pub fn grow_root_filesystem(mount_point: &Path) -> Result<(), BuildError> {
    Cmd::new("btrfs")
        .args(["filesystem", "resize", "max"])
        .arg_path(mount_point)
        .error_msg("growing root filesystem failed")
        .run()
        .map_err(|err| BuildError::DiskSetup(format!("{err:#}")))?;
    Ok(())
}

/// Clone the base image file to a private path, sharing storage via
/// reflink where the filesystem supports it.
pub fn clone_image(base: &DiskImage, destination: &Path) -> Result<DiskImage, BuildError> {
    Cmd::new("cp")
        .arg("--reflink=auto")
        .arg("--sparse=always")
        .arg_path(&base.path)
        .arg_path(destination)
        .error_msg("cloning base image failed")
        .run()
        .map_err(|err| BuildError::DiskSetup(format!("{err:#}")))?;

    Ok(DiskImage {
        path: destination.to_path_buf(),
        size: base.size,
    })
}
