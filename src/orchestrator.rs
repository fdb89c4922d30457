//! Top-level build driver.
//!
//! Sequences the whole run: preflight, session and guard setup, base
//! disk + bootstrap, then the variant pipeline over the selection,
//! strictly one variant at a time. Variants already completed keep
//! their artifacts when a later one fails; the remaining ones are
//! abandoned (fail-fast).

use anyhow::{Context, Result};
use time::OffsetDateTime;

use crate::artifact::{self, ArtifactRecord};
use crate::bootstrap;
use crate::config::BuilderConfig;
use crate::disk;
use crate::pipeline::{self, PacmanChroot, PipelineContext, VariantOutcome};
use crate::preflight;
use crate::resource::ResourceHandle;
use crate::session::{BuildSession, CleanupGuard};
use crate::variant::{VariantRegistry, VariantSpec};

/// Whether the process runs with effective root privileges. Loop
/// devices, mounts and chroots all require it.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

/// Default version tag: the UTC build date as YYYYMMDD.
pub fn default_version() -> String {
    let format = time::macros::format_description!("[year][month][day]");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Run a full build of `selected` variants.
///
/// On failure the working directory is preserved so the intermediate
/// image of the failed variant can be inspected; resources are still
/// released through the session teardown.
pub fn run_build(
    config: &BuilderConfig,
    registry: &VariantRegistry,
    selected: &[&VariantSpec],
    version: &str,
) -> Result<()> {
    let names: Vec<&str> = selected.iter().map(|spec| spec.name).collect();
    println!(
        "=== Building version {} (variants: {}) ===",
        version,
        names.join(", ")
    );

    preflight::check_host_tools()?;

    let mut session = BuildSession::create(&config.work_root, &config.output_dir)?;
    CleanupGuard::install(&session)?;
    let handle = ResourceHandle::new(&session);

    match build_all(&session, &handle, config, registry, selected, version) {
        Ok(outcomes) => {
            session.close()?;
            println!("\n=== Build Complete ===");
            for outcome in &outcomes {
                println!("  {}  {}", outcome.sha256, outcome.artifact.display());
            }
            Ok(())
        }
        Err(err) => {
            session.preserve_work_dir();
            drop(session);
            Err(err)
        }
    }
}

fn build_all(
    session: &BuildSession,
    handle: &ResourceHandle,
    config: &BuilderConfig,
    registry: &VariantRegistry,
    selected: &[&VariantSpec],
    version: &str,
) -> Result<Vec<VariantOutcome>> {
    println!("\n=== Base Bootstrap ===");
    let base_path = session.work_dir().join("base.img");
    let base = disk::create_base_disk(handle, &base_path, config.disk_size_bytes())
        .context("creating base disk")?;

    bootstrap::bootstrap(
        &session.mount_point(),
        session.work_dir(),
        &config.mirror,
        &registry.base().packages,
    )
    .context("bootstrapping base system")?;
    handle.unmount().context("unmounting base image")?;

    let ctx = PipelineContext {
        work_dir: session.work_dir(),
        output_dir: session.output_dir(),
        package_cache: &config.package_cache,
        version,
    };
    let mut runner = PacmanChroot;

    let mut outcomes = Vec::new();
    for spec in selected {
        let outcome = pipeline::build_variant(handle, &base, spec, &mut runner, &ctx)
            .with_context(|| format!("building variant '{}'", spec.name))?;
        outcomes.push(outcome);
    }

    let records: Vec<ArtifactRecord> = outcomes
        .iter()
        .map(|outcome| ArtifactRecord {
            variant: outcome.variant.clone(),
            file: outcome
                .artifact
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            sha256: outcome.sha256.clone(),
        })
        .collect();
    artifact::write_manifest(session.output_dir(), version, &records)?;
    artifact::fix_ownership(session.output_dir())?;

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_version_is_compact_date() {
        let version = default_version();
        assert_eq!(version.len(), 8);
        assert!(version.chars().all(|c| c.is_ascii_digit()));
    }
}
