//! VM configuration and its JSON document form.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 1 GiB in bytes.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// A host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct SharedFolder {
    /// Directory on the host.
    pub host_path: PathBuf,
    /// Tag the guest mounts the share by. Unique within a config.
    pub guest_tag: String,
    /// Whether the guest may only read the share.
    pub read_only: bool,
}

impl SharedFolder {
    /// Creates a shared folder entry.
    pub fn new(host_path: impl Into<PathBuf>, guest_tag: impl Into<String>, read_only: bool) -> Self {
        Self {
            host_path: host_path.into(),
            guest_tag: guest_tag.into(),
            read_only,
        }
    }
}

/// Persisted configuration of a VM bundle.
///
/// Serialized as the flat `config.json` document inside the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct VmConfig {
    /// Human name, also the bundle's default directory stem.
    pub name: String,
    /// Number of virtual CPUs.
    pub cpu_cores: u32,
    /// Guest memory in bytes.
    pub memory_bytes: u64,
    /// Nominal size of the primary disk image in bytes.
    pub disk_size_bytes: u64,
    /// Display width in pixels.
    pub display_width: u32,
    /// Display height in pixels.
    pub display_height: u32,
    /// Display density.
    #[serde(rename = "displayPPI")]
    pub display_ppi: u32,
    /// Shared folders, in mount order.
    #[serde(default)]
    pub shared_folders: Vec<SharedFolder>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "vm".to_owned(),
            cpu_cores: 4.min(host_cores()),
            memory_bytes: 8 * GIB,
            disk_size_bytes: 64 * GIB,
            display_width: 1920,
            display_height: 1080,
            display_ppi: 144,
            shared_folders: Vec::new(),
        }
    }
}

impl VmConfig {
    /// Creates a config with the given name and defaults for everything else.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Checks the static invariants of the configuration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::ConfigurationInvalid(msg));

        if self.name.trim().is_empty() {
            return invalid("name must not be empty".into());
        }
        if self.name.contains(['/', '\\']) {
            return invalid(format!("name must not contain path separators: {}", self.name));
        }
        let max = host_cores();
        if self.cpu_cores == 0 || self.cpu_cores > max {
            return invalid(format!(
                "cpu cores must be between 1 and {max}, got {}",
                self.cpu_cores
            ));
        }
        if self.memory_bytes == 0 {
            return invalid("memory size must be positive".into());
        }
        if self.disk_size_bytes == 0 {
            return invalid("disk size must be positive".into());
        }
        if self.display_width == 0 || self.display_height == 0 || self.display_ppi == 0 {
            return invalid("display dimensions must be positive".into());
        }
        let mut tags = HashSet::new();
        for folder in &self.shared_folders {
            if !tags.insert(folder.guest_tag.as_str()) {
                return invalid(format!("duplicate shared folder tag: {}", folder.guest_tag));
            }
        }
        Ok(())
    }

    /// Loads a config document from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Number of logical cores on the host (at least 1).
pub fn host_cores() -> u32 {
    std::thread::available_parallelism()
        .map_or(1, |n| u32::try_from(n.get()).unwrap_or(u32::MAX))
}
