//! Per-variant build pipeline.
//!
//! Each selected variant runs the same stage sequence against a clone
//! of the base image:
//!
//! 1. Clone the base image file (reflink when available)
//! 2. Resize, only when the variant overrides the disk size
//! 3. Attach + settle + mount, with the shared package cache bound in
//! 4. Variant pre-hook against the mounted tree
//! 5. Package/service apply (skipped silently when the sets are empty)
//! 6. Generic image cleanup
//! 7. Variant post-hook: format conversion of the unmounted raw file
//! 8. Finalize: checksum, ownership, move into the output directory
//!
//! A failure after mount still unmounts before the variant is reported
//! failed; the cleanup guard remains the backstop. Variants are
//! isolated: an earlier variant's finished artifact is never touched
//! by a later failure.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::artifact;
use crate::disk::{self, DiskImage};
use crate::error::BuildError;
use crate::process::Cmd;
use crate::resource::{MountOptions, ResourceHandle, EFI_SUBPATH};
use crate::variant::VariantSpec;

/// In-chroot package and service operations.
///
/// The production implementation shells out through arch-chroot; tests
/// substitute a recording double, so the skip-if-empty contract is
/// checkable without spawning anything.
pub trait ChrootRunner {
    fn install_packages(&mut self, mount_point: &Path, packages: &[String]) -> Result<()>;
    fn enable_services(&mut self, mount_point: &Path, services: &[String]) -> Result<()>;
}

/// Production runner: pacman and systemctl inside the mounted tree.
pub struct PacmanChroot;

impl ChrootRunner for PacmanChroot {
    fn install_packages(&mut self, mount_point: &Path, packages: &[String]) -> Result<()> {
        let mut cmd = Cmd::new("arch-chroot")
            .arg_path(mount_point)
            .args(["pacman", "-Sy", "--noconfirm", "--needed"]);
        for package in packages {
            cmd = cmd.arg(package);
        }
        cmd.error_msg("in-chroot package installation failed")
            .run_interactive()
    }

    fn enable_services(&mut self, mount_point: &Path, services: &[String]) -> Result<()> {
        let mut cmd = Cmd::new("arch-chroot")
            .arg_path(mount_point)
            .args(["systemctl", "enable"]);
        for service in services {
            cmd = cmd.arg(service);
        }
        cmd.error_msg("in-chroot service enablement failed").run()?;
        Ok(())
    }
}

/// Stage 5: install the variant's package set and enable its services.
/// Empty sets are a legitimate no-op, not an error; nothing is invoked
/// for them.
pub fn apply_packages_and_services(
    spec: &VariantSpec,
    mount_point: &Path,
    runner: &mut dyn ChrootRunner,
) -> Result<(), BuildError> {
    if !spec.packages.is_empty() {
        runner
            .install_packages(mount_point, &spec.packages)
            .map_err(|err| BuildError::PackageApply {
                variant: spec.name.to_string(),
                message: format!("{err:#}"),
            })?;
    }
    if !spec.services.is_empty() {
        runner
            .enable_services(mount_point, &spec.services)
            .map_err(|err| BuildError::ServiceApply {
                variant: spec.name.to_string(),
                message: format!("{err:#}"),
            })?;
    }
    Ok(())
}

/// Delete the package-manager trust material from the image so the
/// produced system re-initializes its signing identity on first boot.
pub fn reset_trust_material(mount_point: &Path) -> Result<()> {
    let gnupg = mount_point.join("etc/pacman.d/gnupg");
    if gnupg.exists() {
        fs::remove_dir_all(&gnupg)
            .with_context(|| format!("removing '{}'", gnupg.display()))?;
    }
    Ok(())
}

/// Promote the fallback initramfs over the default one. The default is
/// built with hardware autodetection against the build host, which can
/// omit drivers the eventual target needs; the fallback carries them
/// all.
pub fn promote_fallback_initramfs(mount_point: &Path) -> Result<()> {
    let fallback = mount_point.join("boot/initramfs-linux-fallback.img");
    let default = mount_point.join("boot/initramfs-linux.img");

    if !fallback.exists() {
        anyhow::bail!("fallback initramfs not found at '{}'", fallback.display());
    }
    fs::copy(&fallback, &default).with_context(|| {
        format!(
            "promoting '{}' over '{}'",
            fallback.display(),
            default.display()
        )
    })?;
    Ok(())
}

/// Write the build marker into the image and flush it to durable
/// storage.
pub fn write_build_marker(mount_point: &Path, variant: &str, version: &str) -> Result<()> {
    let marker = mount_point.join("etc/image-build-info");
    let built_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting marker timestamp")?;

    let mut file = File::create(&marker)
        .with_context(|| format!("creating '{}'", marker.display()))?;
    write!(file, "variant={variant}\nversion={version}\nbuilt={built_at}\n")
        .with_context(|| format!("writing '{}'", marker.display()))?;
    file.sync_all()
        .with_context(|| format!("flushing '{}'", marker.display()))?;
    Ok(())
}

/// Release unused blocks on both filesystems so the sparse image stays
/// minimal.
fn trim_filesystems(mount_point: &Path) -> Result<()> {
    Cmd::new("fstrim")
        .arg_path(mount_point)
        .error_msg("trimming root filesystem failed")
        .run()?;
    Cmd::new("fstrim")
        .arg_path(&mount_point.join(EFI_SUBPATH))
        .error_msg("trimming EFI filesystem failed")
        .run()?;
    Ok(())
}

/// Stage 6: generic cleanup applied to every variant.
pub fn generic_cleanup(mount_point: &Path, variant: &str, version: &str) -> Result<()> {
    reset_trust_material(mount_point)?;
    promote_fallback_initramfs(mount_point)?;
    write_build_marker(mount_point, variant, version)?;
    trim_filesystems(mount_point)?;
    Ok(())
}

/// Stage 7: run the variant's conversion hook. The hook deletes the
/// raw file only after a successful conversion, so on failure the
/// intermediate image survives for diagnosis.
pub fn run_post_hook(
    spec: &VariantSpec,
    raw: &Path,
    artifact_path: &Path,
) -> Result<(), BuildError> {
    (spec.post_hook)(raw, artifact_path).map_err(|err| BuildError::Conversion {
        variant: spec.name.to_string(),
        message: format!("{err:#}"),
    })
}

/// Paths and naming shared by every variant of one run.
pub struct PipelineContext<'a> {
    pub work_dir: &'a Path,
    pub output_dir: &'a Path,
    pub package_cache: &'a Path,
    pub version: &'a str,
}

/// A finished variant build.
#[derive(Debug)]
pub struct VariantOutcome {
    pub variant: String,
    pub artifact: PathBuf,
    pub checksum: PathBuf,
    pub sha256: String,
}

/// Run the full pipeline for one variant.
pub fn build_variant(
    handle: &ResourceHandle,
    base: &DiskImage,
    spec: &VariantSpec,
    runner: &mut dyn ChrootRunner,
    ctx: &PipelineContext<'_>,
) -> Result<VariantOutcome> {
    println!("\n=== Variant '{}' ===", spec.name);

    println!("[{}] cloning base image...", spec.name);
    let raw_path = ctx.work_dir.join(format!("{}.img", spec.name));
    let mut image = disk::clone_image(base, &raw_path)?;

    // Resize is growth-only: the root partition is recreated at the
    // new end-of-disk boundary, which cannot shrink a filesystem.
    let resized = match spec.disk_size_override {
        Some(new_size) if new_size > base.size => {
            println!("[{}] growing disk to {} bytes...", spec.name, new_size);
            disk::grow_disk(&mut image, new_size)?;
            true
        }
        _ => false,
    };

    println!("[{}] mounting...", spec.name);
    let loop_device = handle.attach(&image.path)?;

    // Everything between attach and here must be paired with the
    // unmount below, even on failure; the cleanup guard only backstops
    // process exit.
    let staged = (|| -> Result<()> {
        handle.wait_settled(&loop_device)?;
        handle.mount_hierarchy(
            &loop_device,
            MountOptions {
                bind_package_cache: Some(ctx.package_cache),
            },
        )?;
        customize_mounted(handle.mount_point(), spec, runner, resized, ctx.version)
    })();

    println!("[{}] unmounting...", spec.name);
    let unmounted = handle.unmount();
    staged.with_context(|| format!("customizing variant '{}'", spec.name))?;
    unmounted?;

    println!("[{}] converting artifact...", spec.name);
    let artifact_path = ctx.work_dir.join(spec.artifact_filename(ctx.version));
    run_post_hook(spec, &image.path, &artifact_path)?;

    println!("[{}] finalizing...", spec.name);
    let sha256 = artifact::sha256_file(&artifact_path)?;
    let checksum_path = artifact::write_checksum_file(&artifact_path)?;
    let artifact_final = artifact::move_into(&artifact_path, ctx.output_dir)?;
    let checksum_final = artifact::move_into(&checksum_path, ctx.output_dir)?;
    artifact::fix_ownership(ctx.output_dir)?;

    println!("[{}] done: {}", spec.name, artifact_final.display());
    Ok(VariantOutcome {
        variant: spec.name.to_string(),
        artifact: artifact_final,
        checksum: checksum_final,
        sha256,
    })
}

/// Stages 4-6, everything that needs the image mounted. Split out so
/// the caller can unconditionally unmount around it.
fn customize_mounted(
    mount_point: &Path,
    spec: &VariantSpec,
    runner: &mut dyn ChrootRunner,
    resized: bool,
    version: &str,
) -> Result<()> {
    if resized {
        disk::grow_root_filesystem(mount_point)?;
    }

    println!("[{}] applying customization...", spec.name);
    (spec.pre_hook)(mount_point)
        .with_context(|| format!("pre-hook for variant '{}'", spec.name))?;

    apply_packages_and_services(spec, mount_point, runner)?;

    println!("[{}] cleaning image...", spec.name);
    generic_cleanup(mount_point, spec.name, version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use tempfile::tempdir;

    /// Records invocations instead of spawning anything.
    #[derive(Default)]
    struct RecordingRunner {
        installs: Vec<Vec<String>>,
        enables: Vec<Vec<String>>,
    }

    impl ChrootRunner for RecordingRunner {
        fn install_packages(&mut self, _mount: &Path, packages: &[String]) -> Result<()> {
            self.installs.push(packages.to_vec());
            Ok(())
        }

        fn enable_services(&mut self, _mount: &Path, services: &[String]) -> Result<()> {
            self.enables.push(services.to_vec());
            Ok(())
        }
    }

    fn spec_with(
        packages: &[&str],
        services: &[&str],
        post_hook: crate::variant::PostHook,
    ) -> VariantSpec {
        VariantSpec {
            name: "test",
            packages: packages.iter().map(|s| s.to_string()).collect(),
            services: services.iter().map(|s| s.to_string()).collect(),
            disk_size_override: None,
            artifact_extension: "img",
            pre_hook: |_| Ok(()),
            post_hook,
        }
    }

    fn ok_post_hook(_raw: &Path, _artifact: &Path) -> Result<()> {
        Ok(())
    }

    fn failing_post_hook(_raw: &Path, _artifact: &Path) -> Result<()> {
        bail!("conversion exploded")
    }

    #[test]
    fn test_empty_sets_invoke_nothing() {
        let mut runner = RecordingRunner::default();
        let spec = spec_with(&[], &[], ok_post_hook);

        apply_packages_and_services(&spec, Path::new("/mnt"), &mut runner).unwrap();

        assert!(runner.installs.is_empty());
        assert!(runner.enables.is_empty());
    }

    #[test]
    fn test_nonempty_sets_invoke_exactly_once() {
        let mut runner = RecordingRunner::default();
        let spec = spec_with(&["extra-pkg"], &["svc.service"], ok_post_hook);

        apply_packages_and_services(&spec, Path::new("/mnt"), &mut runner).unwrap();

        assert_eq!(runner.installs, vec![vec!["extra-pkg".to_string()]]);
        assert_eq!(runner.enables, vec![vec!["svc.service".to_string()]]);
    }

    #[test]
    fn test_failed_conversion_retains_raw_image() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("test.img");
        fs::write(&raw, "raw image").unwrap();
        let spec = spec_with(&[], &[], failing_post_hook);

        let err = run_post_hook(&spec, &raw, &dir.path().join("test.qcow2")).unwrap_err();

        assert!(matches!(err, BuildError::Conversion { .. }));
        assert!(raw.exists(), "intermediate image must survive for diagnosis");
    }

    #[test]
    fn test_reset_trust_material() {
        let dir = tempdir().unwrap();
        let gnupg = dir.path().join("etc/pacman.d/gnupg");
        fs::create_dir_all(gnupg.join("private-keys")).unwrap();

        reset_trust_material(dir.path()).unwrap();
        assert!(!gnupg.exists());

        // Absent material is fine; the image simply never had it.
        reset_trust_material(dir.path()).unwrap();
    }

    #[test]
    fn test_promote_fallback_initramfs() {
        let dir = tempdir().unwrap();
        let boot = dir.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("initramfs-linux.img"), "autodetected").unwrap();
        fs::write(boot.join("initramfs-linux-fallback.img"), "full").unwrap();

        promote_fallback_initramfs(dir.path()).unwrap();

        let promoted = fs::read_to_string(boot.join("initramfs-linux.img")).unwrap();
        assert_eq!(promoted, "full");
    }

    #[test]
    fn test_promote_fails_without_fallback() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("boot")).unwrap();
        assert!(promote_fallback_initramfs(dir.path()).is_err());
    }

    #[test]
    fn test_build_marker_contents() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();

        write_build_marker(dir.path(), "cloud", "20260806").unwrap();

        let marker = fs::read_to_string(dir.path().join("etc/image-build-info")).unwrap();
        assert!(marker.contains("variant=cloud"));
        assert!(marker.contains("version=20260806"));
        assert!(marker.contains("built="));
    }
}
