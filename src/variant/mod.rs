//! Variant definitions and the name registry.
//!
//! A variant describes one derived image: extra packages, services to
//! enable, an optional disk size override, and two opaque hooks. The
//! pre-hook runs against the mounted tree (configuration writes plus
//! bootloader regeneration); the post-hook converts the unmounted raw
//! image into its final artifact form.
//!
//! The `base` entry is reserved: it only supplies the bootstrap
//! package list and is never selectable as an output variant.

mod basic;
mod cloud;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub const BASE_VARIANT: &str = "base";

const GIB: u64 = 1024 * 1024 * 1024;

/// Customization callback bound to the mounted filesystem tree.
pub type PreHook = fn(&Path) -> Result<()>;
/// Conversion callback: (intermediate raw path, final artifact path).
pub type PostHook = fn(&Path, &Path) -> Result<()>;

pub struct VariantSpec {
    pub name: &'static str,
    pub packages: Vec<String>,
    pub services: Vec<String>,
    /// Total disk size in bytes; `None` inherits the base size.
    pub disk_size_override: Option<u64>,
    /// Extension of the final artifact file.
    pub artifact_extension: &'static str,
    pub pre_hook: PreHook,
    pub post_hook: PostHook,
}

impl VariantSpec {
    pub fn artifact_filename(&self, version: &str) -> String {
        format!("vm-{}-{}.{}", self.name, version, self.artifact_extension)
    }
}

fn no_pre_hook(_mount: &Path) -> Result<()> {
    Ok(())
}

fn no_post_hook(_raw: &Path, _artifact: &Path) -> Result<()> {
    Ok(())
}

/// Why a selection input was rejected. Both map to exit code 2 at the
/// CLI boundary.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("'base' is reserved and cannot be built directly")]
    ReservedBase,
    #[error("unknown variant '{0}'")]
    Unknown(String),
}

/// Explicit mapping from variant name to definition.
pub struct VariantRegistry {
    variants: BTreeMap<&'static str, VariantSpec>,
}

impl VariantRegistry {
    /// The built-in variant set.
    pub fn builtin() -> Self {
        let mut variants = BTreeMap::new();

        variants.insert(
            BASE_VARIANT,
            VariantSpec {
                name: BASE_VARIANT,
                packages: [
                    "base",
                    "linux",
                    "grub",
                    "efibootmgr",
                    "btrfs-progs",
                    "openssh",
                    "sudo",
                ]
                .map(String::from)
                .to_vec(),
                services: Vec::new(),
                disk_size_override: None,
                artifact_extension: "img",
                pre_hook: no_pre_hook,
                post_hook: no_post_hook,
            },
        );

        variants.insert(
            "basic",
            VariantSpec {
                name: "basic",
                packages: Vec::new(),
                services: Vec::new(),
                disk_size_override: None,
                artifact_extension: "img.zst",
                pre_hook: basic::pre_customize,
                post_hook: basic::compress_raw,
            },
        );

        variants.insert(
            "cloud",
            VariantSpec {
                name: "cloud",
                packages: ["cloud-init", "cloud-guest-utils"].map(String::from).to_vec(),
                services: [
                    "cloud-init.service",
                    "cloud-init-local.service",
                    "cloud-config.service",
                    "cloud-final.service",
                ]
                .map(String::from)
                .to_vec(),
                disk_size_override: Some(16 * GIB),
                artifact_extension: "qcow2",
                pre_hook: cloud::pre_customize,
                post_hook: cloud::convert_to_qcow2,
            },
        );

        Self { variants }
    }

    pub fn get(&self, name: &str) -> Option<&VariantSpec> {
        self.variants.get(name)
    }

    /// The reserved base definition (bootstrap package list).
    pub fn base(&self) -> &VariantSpec {
        self.variants
            .get(BASE_VARIANT)
            .expect("registry always contains the base definition")
    }

    /// Selectable variant names, sorted.
    pub fn selectable(&self) -> Vec<&'static str> {
        self.variants
            .keys()
            .copied()
            .filter(|name| *name != BASE_VARIANT)
            .collect()
    }

    /// Resolve a comma-separated selection. Empty or absent input
    /// selects every non-base variant.
    pub fn select(&self, raw: Option<&str>) -> Result<Vec<&VariantSpec>, SelectionError> {
        let raw = raw.unwrap_or("").trim();
        if raw.is_empty() {
            return Ok(self
                .selectable()
                .into_iter()
                .map(|name| self.get(name).expect("selectable names resolve"))
                .collect());
        }

        let mut selected = Vec::new();
        for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name == BASE_VARIANT {
                return Err(SelectionError::ReservedBase);
            }
            let spec = self
                .get(name)
                .ok_or_else(|| SelectionError::Unknown(name.to_string()))?;
            if !selected.iter().any(|s: &&VariantSpec| s.name == spec.name) {
                selected.push(spec);
            }
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_supplies_bootstrap_packages() {
        let registry = VariantRegistry::builtin();
        assert!(registry.base().packages.iter().any(|p| p == "linux"));
        assert!(registry.base().services.is_empty());
    }

    #[test]
    fn test_base_not_selectable() {
        let registry = VariantRegistry::builtin();
        assert!(!registry.selectable().contains(&BASE_VARIANT));
        assert!(matches!(
            registry.select(Some("base")),
            Err(SelectionError::ReservedBase)
        ));
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let registry = VariantRegistry::builtin();
        assert!(matches!(
            registry.select(Some("cloud,nope")),
            Err(SelectionError::Unknown(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_empty_selection_is_all_non_base() {
        let registry = VariantRegistry::builtin();
        let all: Vec<&str> = registry.select(None).unwrap().iter().map(|s| s.name).collect();
        assert_eq!(all, registry.selectable());

        let blank: Vec<&str> = registry
            .select(Some(""))
            .unwrap()
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(blank, all);
    }

    #[test]
    fn test_selection_preserves_order_and_dedups() {
        let registry = VariantRegistry::builtin();
        let picked: Vec<&str> = registry
            .select(Some("cloud, basic ,cloud"))
            .unwrap()
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(picked, vec!["cloud", "basic"]);
    }

    #[test]
    fn test_basic_variant_has_empty_sets() {
        let registry = VariantRegistry::builtin();
        let basic = registry.get("basic").unwrap();
        assert!(basic.packages.is_empty());
        assert!(basic.services.is_empty());
        assert!(basic.disk_size_override.is_none());
    }

    #[test]
    fn test_artifact_filename() {
        let registry = VariantRegistry::builtin();
        let cloud = registry.get("cloud").unwrap();
        assert_eq!(cloud.artifact_filename("20260806"), "vm-cloud-20260806.qcow2");
    }
}
