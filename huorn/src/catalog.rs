//! Best-effort listing of bundles in a storage root.

use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::bundle::{BUNDLE_EXTENSION, BundleLayout, BundleStore};
use crate::error::Result;

/// Lightweight view of a bundle for listings.
///
/// Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct VmInfo {
    /// Bundle directory.
    pub bundle: PathBuf,
    /// VM name from the config document.
    pub name: String,
    /// Number of virtual CPUs.
    pub cpu_cores: u32,
    /// Guest memory in bytes.
    pub memory_bytes: u64,
    /// Current size of `disk.img` on disk. May exceed the configured size.
    pub disk_size_bytes: u64,
    /// Bundle directory modification time.
    pub last_modified: SystemTime,
}

impl VmInfo {
    /// Memory as `"8.0 GB"`.
    pub fn memory_formatted(&self) -> String {
        format_gb(self.memory_bytes)
    }

    /// Disk size as `"64.0 GB"`.
    pub fn disk_size_formatted(&self) -> String {
        format_gb(self.disk_size_bytes)
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_gb(bytes: u64) -> String {
    format!("{:.1} GB", bytes as f64 / 1024.0 / 1024.0 / 1024.0)
}

/// Enumerates bundles without loading them.
#[derive(Debug, Clone)]
pub struct VmCatalog {
    /// Store whose root is scanned.
    store: BundleStore,
}

impl VmCatalog {
    /// Creates a catalog over the store's root.
    pub const fn new(store: BundleStore) -> Self {
        Self { store }
    }

    /// Lists every readable bundle, most recently modified first.
    ///
    /// Entries whose config cannot be read are skipped. A missing storage
    /// root yields an empty list.
    pub fn list_all(&self) -> Result<Vec<VmInfo>> {
        let root = self.store.root();
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut vms = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    tracing::debug!(root = %root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !path.extension().is_some_and(|e| e == BUNDLE_EXTENSION) {
                continue;
            }
            match self.info(&path) {
                Ok(info) => vms.push(info),
                Err(e) => {
                    tracing::debug!(bundle = %path.display(), error = %e, "skipping bundle");
                }
            }
        }

        vms.sort_by(|a, b| {
            Reverse(a.last_modified)
                .cmp(&Reverse(b.last_modified))
                .then_with(|| a.bundle.cmp(&b.bundle))
        });
        Ok(vms)
    }

    /// Derives [`VmInfo`] for a single bundle.
    pub fn info(&self, bundle: &Path) -> Result<VmInfo> {
        let config = self.store.read_config(bundle)?;
        let disk_size_bytes = fs::metadata(BundleLayout::new(bundle).disk()).map_or(0, |m| m.len());
        let last_modified = fs::metadata(bundle)?.modified()?;

        Ok(VmInfo {
            bundle: bundle.to_path_buf(),
            name: config.name,
            cpu_cores: config.cpu_cores,
            memory_bytes: config.memory_bytes,
            disk_size_bytes,
            last_modified,
        })
    }
}
