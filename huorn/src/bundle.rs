//! On-disk VM bundle format.
//!
//! # Layout
//!
//! ```text
//! {storage_root}/
//!   {name}.huornvm/
//!     config.json          # VmConfig document
//!     hardware_model.bin   # engine hardware identity
//!     machine_id.bin       # engine machine identity
//!     auxiliary.img        # engine auxiliary storage
//!     disk.img             # sparse primary disk
//! ```
//!
//! A bundle is either complete (config parses and every artifact exists)
//! or it is rejected by [`BundleStore::load`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::{fs, io};

use crate::config::VmConfig;
use crate::error::{Error, Result};

/// Directory extension of a bundle.
pub const BUNDLE_EXTENSION: &str = "huornvm";
/// Config document name.
pub const CONFIG_FILE: &str = "config.json";
/// Hardware-model descriptor name.
pub const HARDWARE_MODEL_FILE: &str = "hardware_model.bin";
/// Machine-identity descriptor name.
pub const MACHINE_ID_FILE: &str = "machine_id.bin";
/// Auxiliary-storage image name.
pub const AUXILIARY_FILE: &str = "auxiliary.img";
/// Primary disk image name.
pub const DISK_FILE: &str = "disk.img";

/// Artifacts that must exist alongside `config.json`.
pub const REQUIRED_ARTIFACTS: [&str; 4] =
    [HARDWARE_MODEL_FILE, MACHINE_ID_FILE, AUXILIARY_FILE, DISK_FILE];

/// Paths of every file in one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct BundleLayout {
    /// Bundle directory.
    pub root: PathBuf,
}

impl BundleLayout {
    /// Describes the bundle rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `config.json` path.
    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Hardware-model descriptor path.
    pub fn hardware_model(&self) -> PathBuf {
        self.root.join(HARDWARE_MODEL_FILE)
    }

    /// Machine-identity descriptor path.
    pub fn machine_id(&self) -> PathBuf {
        self.root.join(MACHINE_ID_FILE)
    }

    /// Auxiliary-storage image path.
    pub fn auxiliary(&self) -> PathBuf {
        self.root.join(AUXILIARY_FILE)
    }

    /// Primary disk image path.
    pub fn disk(&self) -> PathBuf {
        self.root.join(DISK_FILE)
    }
}

/// Reads, writes, and validates bundles under a storage root.
#[derive(Debug, Clone)]
pub struct BundleStore {
    /// Directory holding `{name}.huornvm` bundles.
    root: PathBuf,
}

impl BundleStore {
    /// Creates a store over `root`. The directory is not created until a
    /// bundle is saved into it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns `{root}/{name}.huornvm`.
    ///
    /// Two configs with the same name map to the same path; avoiding that is
    /// up to the caller.
    pub fn default_bundle_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{BUNDLE_EXTENSION}"))
    }

    /// Persists `config` as `config.json` inside `bundle`.
    ///
    /// Creates the bundle directory if needed. The document is written to a
    /// temporary file in the same directory, synced, and renamed over the
    /// old config, so a crash never leaves a torn `config.json`.
    pub fn save(&self, config: &VmConfig, bundle: &Path) -> Result<()> {
        fs::create_dir_all(bundle)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".config")
            .suffix(".tmp")
            .tempfile_in(bundle)?;
        serde_json::to_writer_pretty(&mut tmp, config)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(bundle.join(CONFIG_FILE)).map_err(|e| e.error)?;

        tracing::debug!(bundle = %bundle.display(), name = %config.name, "saved vm config");
        Ok(())
    }

    /// Loads and validates a complete bundle.
    pub fn load(&self, bundle: &Path) -> Result<VmConfig> {
        if !bundle.is_dir() {
            return Err(Error::BundleNotFound(bundle.to_path_buf()));
        }
        let config = self.read_config(bundle)?;
        if let Some(missing) = self.missing_artifacts(bundle).first() {
            return Err(Error::BundleInvalid(format!("missing required file: {missing}")));
        }
        Ok(config)
    }

    /// Reads `config.json` without checking the other artifacts.
    pub fn read_config(&self, bundle: &Path) -> Result<VmConfig> {
        match VmConfig::load(&bundle.join(CONFIG_FILE)) {
            Ok(config) => Ok(config),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::BundleInvalid(format!("missing {CONFIG_FILE}")))
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(Error::BundleInvalid(format!("unreadable {CONFIG_FILE}: {e}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists required artifacts absent from `bundle`, in layout order.
    pub fn missing_artifacts(&self, bundle: &Path) -> Vec<&'static str> {
        REQUIRED_ARTIFACTS
            .into_iter()
            .filter(|name| !bundle.join(name).is_file())
            .collect()
    }

    /// Deletes a bundle directory and everything in it.
    pub fn remove(&self, bundle: &Path) -> Result<()> {
        if !bundle.is_dir() {
            return Err(Error::BundleNotFound(bundle.to_path_buf()));
        }
        fs::remove_dir_all(bundle)?;
        Ok(())
    }

    /// Resolves a CLI-style reference: an existing path, or a bundle name
    /// under the storage root.
    pub fn resolve(&self, name_or_path: &str) -> PathBuf {
        let as_path = Path::new(name_or_path);
        if as_path.is_dir() {
            return as_path.to_path_buf();
        }
        self.default_bundle_path(name_or_path)
    }
}
