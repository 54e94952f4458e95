//! Bundle commands: ls, inspect, check.

use std::time::SystemTime;

use anyhow::{Context, Result};
use huorn::bundle::CONFIG_FILE;
use huorn::{BundleStore, VmCatalog};

use crate::OutputFormat;

/// Arguments for `huorn ls`.
#[derive(clap::Args)]
pub struct LsArgs {
    /// Only display bundle paths.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Output format.
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// A bundle named on the command line.
#[derive(clap::Args)]
pub struct TargetArgs {
    /// Bundle name under the storage root, or a bundle path.
    pub target: String,
}

pub fn ls(store: &BundleStore, args: &LsArgs) -> Result<()> {
    let vms = VmCatalog::new(store.clone())
        .list_all()
        .with_context(|| format!("cannot list {}", store.root().display()))?;

    if args.quiet {
        for vm in &vms {
            println!("{}", vm.bundle.display());
        }
        return Ok(());
    }

    if matches!(args.format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&vms)?);
        return Ok(());
    }

    if vms.is_empty() {
        println!("No VMs in {}.", store.root().display());
        return Ok(());
    }
    println!(
        "{:<20} {:>4} {:>10} {:>10} {:<10}",
        "NAME", "CPUS", "MEMORY", "DISK", "MODIFIED"
    );
    for vm in &vms {
        println!(
            "{:<20} {:>4} {:>10} {:>10} {:<10}",
            vm.name,
            vm.cpu_cores,
            vm.memory_formatted(),
            vm.disk_size_formatted(),
            ago(vm.last_modified),
        );
    }
    Ok(())
}

pub fn inspect(store: &BundleStore, args: &TargetArgs) -> Result<()> {
    let bundle = store.resolve(&args.target);
    let config = store
        .read_config(&bundle)
        .with_context(|| format!("cannot read {}", bundle.join(CONFIG_FILE).display()))?;
    let info = VmCatalog::new(store.clone()).info(&bundle)?;

    let obj = serde_json::json!({
        "bundle": bundle,
        "config": config,
        "diskBytesOnHost": info.disk_size_bytes,
        "missing": store.missing_artifacts(&bundle),
    });
    println!("{}", serde_json::to_string_pretty(&obj)?);
    Ok(())
}

pub fn check(store: &BundleStore, args: &TargetArgs) -> Result<()> {
    let bundle = store.resolve(&args.target);
    let missing = store.missing_artifacts(&bundle);
    for name in &missing {
        println!("missing: {name}");
    }
    store
        .load(&bundle)
        .with_context(|| format!("{} is not usable", bundle.display()))?;
    println!("{}: ok", bundle.display());
    Ok(())
}

/// Coarse age such as `"5m ago"`.
fn ago(when: SystemTime) -> String {
    let Ok(elapsed) = SystemTime::now().duration_since(when) else {
        return "just now".to_owned();
    };
    let secs = elapsed.as_secs();
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86_400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
