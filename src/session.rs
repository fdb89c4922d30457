//! Process-wide build state and its cleanup guard.
//!
//! A [`BuildSession`] owns the working directory, the output directory
//! and the single [`ResourceState`] (active loop device + mounts) for
//! the whole process. The [`CleanupGuard`] observes that state through
//! a weak reference and releases it on interrupt; `close()` and `Drop`
//! cover the normal and error exits. Whichever path runs first wins —
//! release is idempotent.
//!
//! Failed builds keep their working directory on disk so the
//! intermediate image can be inspected; successful builds and
//! interrupts remove it.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::process::Cmd;

const LOCK_FILE: &str = ".builder.lock";

/// The loop device and mounts currently held by the build.
///
/// Mounts are recorded in mount order and released in reverse.
#[derive(Debug, Default)]
pub struct ResourceState {
    pub loop_device: Option<String>,
    pub mounts: Vec<PathBuf>,
}

/// Unmount everything in reverse mount order, then detach the loop
/// device. Idempotent: with nothing recorded this is a no-op.
///
/// A failed unmount is an error (a stuck mount is unsafe for the
/// host); a failed detach is ignored as best effort.
pub fn release_resources(state: &mut ResourceState) -> Result<()> {
    let mut failures = Vec::new();

    while let Some(target) = state.mounts.pop() {
        match Cmd::new("umount").arg_path(&target).allow_fail().run() {
            Ok(output) if output.success() => {}
            Ok(output) => failures.push(format!(
                "{}: {}",
                target.display(),
                output.stderr_trimmed()
            )),
            Err(err) => failures.push(format!("{}: {}", target.display(), err)),
        }
    }

    if let Some(device) = state.loop_device.take() {
        let _ = Cmd::new("losetup").arg("-d").arg(&device).allow_fail().run();
    }

    if !failures.is_empty() {
        bail!("failed to unmount: {}", failures.join("; "));
    }
    Ok(())
}

/// Scratch and output directories plus the process-wide resource state.
pub struct BuildSession {
    work_dir: PathBuf,
    output_dir: PathBuf,
    resources: Arc<Mutex<ResourceState>>,
    preserve_work_dir: bool,
    closed: bool,
    // Held for the session lifetime; unlocks on drop.
    _lock: File,
}

impl BuildSession {
    /// Create the working directory under `work_root` and take the
    /// single-build lock. Fails if another build holds it.
    pub fn create(work_root: &Path, output_dir: &Path) -> Result<Self> {
        fs::create_dir_all(work_root)
            .with_context(|| format!("creating work root '{}'", work_root.display()))?;

        let lock_path = work_root.join(LOCK_FILE);
        let lock = File::create(&lock_path)
            .with_context(|| format!("creating lock file '{}'", lock_path.display()))?;
        if lock.try_lock_exclusive().is_err() {
            bail!(
                "another build is already in flight (lock held on '{}')",
                lock_path.display()
            );
        }

        let work_dir = work_root.join("build");
        if work_dir.exists() {
            fs::remove_dir_all(&work_dir)
                .with_context(|| format!("clearing stale work dir '{}'", work_dir.display()))?;
        }
        fs::create_dir_all(work_dir.join("mnt"))
            .with_context(|| format!("creating work dir '{}'", work_dir.display()))?;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating output dir '{}'", output_dir.display()))?;

        Ok(Self {
            work_dir,
            output_dir: output_dir.to_path_buf(),
            resources: Arc::new(Mutex::new(ResourceState::default())),
            preserve_work_dir: false,
            closed: false,
            _lock: lock,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// The single mount point all images are mounted under.
    pub fn mount_point(&self) -> PathBuf {
        self.work_dir.join("mnt")
    }

    pub fn resources(&self) -> Arc<Mutex<ResourceState>> {
        Arc::clone(&self.resources)
    }

    /// Keep the working directory on disk when the session ends, so a
    /// failed variant's intermediate image can be inspected.
    pub fn preserve_work_dir(&mut self) {
        self.preserve_work_dir = true;
    }

    /// Normal-exit teardown: release resources and remove the working
    /// directory. An unmount failure is returned as an error after the
    /// rest of the teardown ran.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let release = release_resources(&mut self.resources.lock().expect("resource lock"));
        if self.preserve_work_dir {
            println!(
                "Working directory kept for inspection: {}",
                self.work_dir.display()
            );
        } else {
            fs::remove_dir_all(&self.work_dir).with_context(|| {
                format!("removing work dir '{}'", self.work_dir.display())
            })?;
        }
        release
    }
}

impl Drop for BuildSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(mut state) = self.resources.lock() {
            if let Err(err) = release_resources(&mut state) {
                eprintln!("cleanup: {err:#}");
            }
        }
        if self.preserve_work_dir {
            eprintln!(
                "Working directory kept for inspection: {}",
                self.work_dir.display()
            );
        } else {
            let _ = fs::remove_dir_all(&self.work_dir);
        }
    }
}

struct GuardState {
    resources: Weak<Mutex<ResourceState>>,
    work_dir: PathBuf,
}

static GUARD_STATE: Mutex<Option<GuardState>> = Mutex::new(None);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Backstop that releases the session's resources when the process is
/// interrupted. Holds only a weak reference: the session stays the
/// owner, and a session that already tore down leaves the guard with
/// nothing to do.
pub struct CleanupGuard;

impl CleanupGuard {
    /// Register the guard for `session`. Must be called before any
    /// resource is acquired; the signal handler is installed once per
    /// process.
    pub fn install(session: &BuildSession) -> Result<()> {
        *GUARD_STATE.lock().expect("guard lock") = Some(GuardState {
            resources: Arc::downgrade(&session.resources),
            work_dir: session.work_dir.clone(),
        });

        if !HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
            ctrlc::set_handler(|| {
                let code = run_guard();
                std::process::exit(code);
            })
            .context("installing interrupt handler")?;
        }
        Ok(())
    }
}

/// Release whatever the guarded session still holds and remove its
/// working directory. Returns the process exit code: 130 for a clean
/// interrupt, 1 when an unmount failed (the host is left with a stuck
/// mount, which must not look like a clean exit).
fn run_guard() -> i32 {
    let Some(state) = GUARD_STATE.lock().expect("guard lock").take() else {
        return 130;
    };

    let mut code = 130;
    if let Some(resources) = state.resources.upgrade() {
        if let Ok(mut resources) = resources.lock() {
            if let Err(err) = release_resources(&mut resources) {
                eprintln!("interrupted: {err:#}");
                code = 1;
            }
        }
    }
    let _ = fs::remove_dir_all(&state.work_dir);
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_close_removes_work_dir() {
        let dir = tempdir().unwrap();
        let work_root = dir.path().join("work");
        let output = dir.path().join("out");

        let session = BuildSession::create(&work_root, &output).unwrap();
        let work_dir = session.work_dir().to_path_buf();
        assert!(work_dir.join("mnt").is_dir());
        assert!(output.is_dir());

        session.close().unwrap();
        assert!(!work_dir.exists());
    }

    #[test]
    fn test_preserved_work_dir_survives_close() {
        let dir = tempdir().unwrap();
        let mut session =
            BuildSession::create(&dir.path().join("work"), &dir.path().join("out")).unwrap();
        let work_dir = session.work_dir().to_path_buf();

        session.preserve_work_dir();
        session.close().unwrap();
        assert!(work_dir.exists());
    }

    #[test]
    fn test_second_session_rejected_while_locked() {
        let dir = tempdir().unwrap();
        let work_root = dir.path().join("work");
        let output = dir.path().join("out");

        let _first = BuildSession::create(&work_root, &output).unwrap();
        let second = BuildSession::create(&work_root, &output);
        assert!(second.is_err());
    }

    #[test]
    fn test_release_with_no_resources_is_noop() {
        let mut state = ResourceState::default();
        release_resources(&mut state).unwrap();
        // Idempotent: a second call is also a no-op.
        release_resources(&mut state).unwrap();
        assert!(state.loop_device.is_none());
        assert!(state.mounts.is_empty());
    }
}
