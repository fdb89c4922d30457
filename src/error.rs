//! Build failure classification.
//!
//! Each variant maps to one failure scope: disk setup and bootstrap
//! failures abort the whole run, everything else is fatal for the
//! current image variant only. The orchestrator propagates these
//! through `anyhow` with stage context attached.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Partitioning or formatting failed. The image file is in an
    /// undefined state and must be discarded; no retry.
    #[error("disk setup failed: {0}")]
    DiskSetup(String),

    /// No free loop device, or the partition table could not be read.
    #[error("failed to attach loop device for {}: {message}", image.display())]
    Attach { image: PathBuf, message: String },

    /// The kernel did not enumerate the expected partition node within
    /// the bounded settlement poll.
    #[error("timed out waiting for {} to appear ({attempts} attempts)", device.display())]
    Timeout { device: PathBuf, attempts: u32 },

    #[error("mount failed: {0}")]
    Mount(String),

    /// Base system installation failed; nothing can be derived from it.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("package installation failed for variant '{variant}': {message}")]
    PackageApply { variant: String, message: String },

    #[error("service enablement failed for variant '{variant}': {message}")]
    ServiceApply { variant: String, message: String },

    /// Post-hook conversion failed. The intermediate raw image is
    /// retained for diagnosis.
    #[error("artifact conversion failed for variant '{variant}': {message}")]
    Conversion { variant: String, message: String },
}

impl BuildError {
    /// True when the failure aborts the entire run rather than the
    /// current variant.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Self::DiskSetup(_) | Self::Bootstrap(_))
    }
}
