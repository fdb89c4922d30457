//! Loop device and mount handling for one disk image at a time.
//!
//! Partition scanning after `losetup --partscan` is asynchronous: the
//! kernel enumerates `p1..p3` nodes some time after the attach returns.
//! [`ResourceHandle::wait_settled`] is therefore a mandatory
//! synchronization point between attach and any mkfs/mount, not an
//! optimization.
//!
//! All acquired resources are recorded in the session's
//! [`ResourceState`] so the cleanup guard can release them even when
//! the normal unmount pairing is skipped by an earlier failure.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::BuildError;
use crate::process::Cmd;
use crate::session::{release_resources, BuildSession, ResourceState};

/// Partition index of the EFI system partition.
pub const EFI_PARTITION: u32 = 2;
/// Partition index of the root partition (always last).
pub const ROOT_PARTITION: u32 = 3;

/// Root filesystem mount options: copy-on-write with forced
/// compression keeps the sparse image minimal.
pub const ROOT_MOUNT_OPTIONS: &str = "compress-force=zstd";

/// Subpath of the root mount the EFI partition is mounted at.
pub const EFI_SUBPATH: &str = "efi";

const SETTLE_ATTEMPTS: u32 = 100;
const SETTLE_INTERVAL: Duration = Duration::from_millis(100);

/// Options for [`ResourceHandle::mount_hierarchy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions<'a> {
    /// Bind-mount this host package cache into the tree. Set when
    /// customizing an existing base so variants share downloads.
    pub bind_package_cache: Option<&'a Path>,
}

/// Device node for a partition of an attached loop device
/// (`/dev/loop0` + 3 -> `/dev/loop0p3`).
pub fn partition_node(loop_device: &str, index: u32) -> PathBuf {
    PathBuf::from(format!("{loop_device}p{index}"))
}

/// Handle on the session's singleton loop-device/mount-point pair.
pub struct ResourceHandle {
    state: Arc<Mutex<ResourceState>>,
    mount_point: PathBuf,
}

impl ResourceHandle {
    pub fn new(session: &BuildSession) -> Self {
        Self {
            state: session.resources(),
            mount_point: session.mount_point(),
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Attach `disk` to a free loop device with partition scanning and
    /// record the device as the process-wide active handle.
    pub fn attach(&self, disk: &Path) -> Result<String, BuildError> {
        let device = Cmd::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg_path(disk)
            .run_capture()
            .map_err(|err| BuildError::Attach {
                image: disk.to_path_buf(),
                message: format!("{err:#}"),
            })?;

        if device.is_empty() {
            return Err(BuildError::Attach {
                image: disk.to_path_buf(),
                message: "losetup reported no device".to_string(),
            });
        }

        self.state.lock().expect("resource lock").loop_device = Some(device.clone());
        Ok(device)
    }

    /// Block until the kernel has enumerated the root partition node,
    /// polling at a fixed interval for a bounded number of attempts.
    pub fn wait_settled(&self, loop_device: &str) -> Result<PathBuf, BuildError> {
        let node = partition_node(loop_device, ROOT_PARTITION);
        wait_for_node(node, SETTLE_ATTEMPTS, SETTLE_INTERVAL)
    }

    /// Mount the root partition at the session mount point, the EFI
    /// partition under [`EFI_SUBPATH`], and optionally bind the shared
    /// package cache into the tree.
    pub fn mount_hierarchy(
        &self,
        loop_device: &str,
        options: MountOptions<'_>,
    ) -> Result<(), BuildError> {
        let root_node = partition_node(loop_device, ROOT_PARTITION);
        let root_target = self.mount_point.clone();
        self.mount_one(&root_node, &root_target, &["-o", ROOT_MOUNT_OPTIONS])?;

        let efi_dir = self.mount_point.join(EFI_SUBPATH);
        std::fs::create_dir_all(&efi_dir)
            .map_err(|err| BuildError::Mount(format!("creating {}: {err}", efi_dir.display())))?;
        let efi_node = partition_node(loop_device, EFI_PARTITION);
        self.mount_one(&efi_node, &efi_dir, &[])?;

        if let Some(cache) = options.bind_package_cache {
            let target = self.mount_point.join("var/cache/pacman/pkg");
            std::fs::create_dir_all(&target).map_err(|err| {
                BuildError::Mount(format!("creating {}: {err}", target.display()))
            })?;
            self.bind_mount(cache, &target)?;
        }

        Ok(())
    }

    /// Unmount all recorded subpaths in reverse mount order and detach
    /// the loop device. Calling with no active resources is a no-op.
    pub fn unmount(&self) -> Result<(), BuildError> {
        let mut state = self.state.lock().expect("resource lock");
        release_resources(&mut state).map_err(|err| BuildError::Mount(format!("{err:#}")))
    }

    fn mount_one(&self, source: &Path, target: &Path, extra: &[&str]) -> Result<(), BuildError> {
        Cmd::new("mount")
            .args(extra.iter().copied())
            .arg_path(source)
            .arg_path(target)
            .run()
            .map_err(|err| BuildError::Mount(format!("{err:#}")))?;
        self.record_mount(target);
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), BuildError> {
        Cmd::new("mount")
            .arg("--bind")
            .arg_path(source)
            .arg_path(target)
            .run()
            .map_err(|err| BuildError::Mount(format!("{err:#}")))?;
        self.record_mount(target);
        Ok(())
    }

    fn record_mount(&self, target: &Path) {
        self.state
            .lock()
            .expect("resource lock")
            .mounts
            .push(target.to_path_buf());
    }
}

fn wait_for_node(node: PathBuf, attempts: u32, interval: Duration) -> Result<PathBuf, BuildError> {
    for _ in 0..attempts {
        if node.exists() {
            return Ok(node);
        }
        thread::sleep(interval);
    }
    Err(BuildError::Timeout {
        device: node,
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BuildSession;
    use tempfile::tempdir;

    #[test]
    fn test_partition_node() {
        assert_eq!(
            partition_node("/dev/loop0", ROOT_PARTITION),
            PathBuf::from("/dev/loop0p3")
        );
        assert_eq!(
            partition_node("/dev/loop12", EFI_PARTITION),
            PathBuf::from("/dev/loop12p2")
        );
    }

    #[test]
    fn test_unmount_idempotent_with_no_resources() {
        let dir = tempdir().unwrap();
        let session =
            BuildSession::create(&dir.path().join("work"), &dir.path().join("out")).unwrap();
        let handle = ResourceHandle::new(&session);

        // Nothing attached or mounted: both calls are silent no-ops.
        handle.unmount().unwrap();
        handle.unmount().unwrap();
    }

    #[test]
    fn test_wait_for_node_times_out() {
        let err = wait_for_node(
            PathBuf::from("/dev/nonexistent-loop-device-12345p3"),
            3,
            Duration::from_millis(1),
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::Timeout { attempts: 3, .. }));
    }

    #[test]
    fn test_wait_for_node_finds_existing_path() {
        let dir = tempdir().unwrap();
        let node = dir.path().join("loop0p3");
        std::fs::write(&node, b"").unwrap();

        let found = wait_for_node(node.clone(), 3, Duration::from_millis(1)).unwrap();
        assert_eq!(found, node);
    }
}
