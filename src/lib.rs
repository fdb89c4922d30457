//! Builds bootable VM disk images for a Linux distribution from a
//! common bootstrap, then derives specialized variants (cloud, basic)
//! from that base without re-running the bootstrap.
//!
//! The core is the build orchestration: ephemeral loop-device and
//! mount resources are acquired per image, driven through a fixed
//! pipeline (partition, format, mount, bootstrap, clone per variant,
//! customize, finalize, convert), and released exactly once no matter
//! where a stage fails.
//!
//! # Architecture
//!
//! ```text
//! orchestrator          sequences the whole run, owns the session
//!     │
//!     ├── session       working dir + resource state + cleanup guard
//!     ├── disk          sparse file, GPT layout, mkfs, resize
//!     ├── resource      loop attach, settlement wait, mount/unmount
//!     ├── bootstrap     pacstrap against an ephemeral pacman.conf
//!     ├── pipeline      per-variant stage machine
//!     ├── variant       registry of variant definitions + hooks
//!     └── artifact      checksums, ownership, output placement
//! ```
//!
//! Builds are strictly sequential: one process, one loop device, one
//! mount hierarchy, variants one after another. The shared host
//! package cache is bind-mounted into every variant's chroot so
//! downloads happen once per run.

pub mod artifact;
pub mod bootstrap;
pub mod config;
pub mod disk;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod resource;
pub mod session;
pub mod variant;

pub use config::BuilderConfig;
pub use error::BuildError;
pub use session::{BuildSession, CleanupGuard};
pub use variant::{VariantRegistry, VariantSpec};
