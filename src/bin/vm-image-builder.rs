use std::env;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use vm_image_builder::{orchestrator, BuilderConfig, VariantRegistry};

const CONFIG_FILE: &str = "builder.toml";

fn usage() -> &'static str {
    "Usage:\n  \
     vm-image-builder                build the selected variants (requires root)\n  \
     vm-image-builder <version>      build with an explicit version tag (requires root)\n  \
     vm-image-builder list           list selectable variants\n  \
     vm-image-builder help           show this help\n\n\
     Environment:\n  \
     VARIANTS    comma-separated variant names to build (default: all)"
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();

    match args.as_slice() {
        [] => build(None),
        [cmd] if cmd == "list" => {
            for name in VariantRegistry::builtin().selectable() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        [cmd] if cmd == "help" || cmd == "-h" || cmd == "--help" => {
            println!("{}", usage());
            Ok(ExitCode::SUCCESS)
        }
        [version] => build(Some(version.as_str())),
        _ => {
            eprintln!("{}", usage());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn build(version: Option<&str>) -> Result<ExitCode> {
    if !orchestrator::running_as_root() {
        eprintln!("vm-image-builder must run as root to manage loop devices and mounts");
        return Ok(ExitCode::from(1));
    }

    let registry = VariantRegistry::builtin();
    let selection = env::var("VARIANTS").ok();
    let selected = match registry.select(selection.as_deref()) {
        Ok(selected) => selected,
        Err(err) => {
            eprintln!("Error: {err}");
            eprintln!(
                "Selectable variants: {}",
                registry.selectable().join(", ")
            );
            return Ok(ExitCode::from(2));
        }
    };

    let config = BuilderConfig::load(Path::new(CONFIG_FILE))?;
    let version = version
        .map(str::to_string)
        .unwrap_or_else(orchestrator::default_version);

    orchestrator::run_build(&config, &registry, &selected, &version)?;
    Ok(ExitCode::SUCCESS)
}
