//! Local virtual machines packaged as self-contained directory bundles.
//!
//! `huorn` owns the on-disk bundle format, the catalog over a storage root,
//! the builder that provisions new bundles, and guarded lifecycle state. The
//! hypervisor itself is an external [`Engine`] supplied by the caller.
//!
//! Two independent byte-stream transports bridge a guest to a terminal: a
//! pipe-backed [`SerialConsole`] and an [`SshSession`] driven by the system
//! `ssh` client.
//!
//! # Quick start
//!
//! ```no_run
//! # async fn demo(engine: std::sync::Arc<dyn huorn::Engine>) -> huorn::Result<()> {
//! let huorn = huorn::Huorn::open_default(engine)?;
//!
//! for vm in huorn.list_vms()? {
//!     println!("{} {} {}", vm.name, vm.memory_formatted(), vm.disk_size_formatted());
//! }
//!
//! let mut vm = huorn.load("dev")?;
//! vm.start().await?;
//! # Ok(())
//! # }
//! ```

mod builder;
pub mod bundle;
mod catalog;
mod config;
mod disk;
mod engine;
mod error;
mod lock;
mod state;
pub mod transport;
mod vm;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use builder::VmBuilder;
pub use bundle::{BundleLayout, BundleStore};
pub use catalog::{VmCatalog, VmInfo};
pub use config::{GIB, SharedFolder, VmConfig, host_cores};
pub use disk::create_sparse as create_sparse_disk;
pub use engine::{Engine, ImageRequirements, Machine, OpenRequest, ProvisionRequest};
pub use error::{Error, ErrorKind, Result};
pub use lock::BundleLock;
pub use state::{Operation, VmState};
pub use transport::buffer::{BufferLimits, OutputBuffer};
#[cfg(unix)]
pub use transport::console::{ConsoleEndpoints, SerialConsole};
pub use transport::ssh::{SessionState, SshOptions, SshSession};
pub use transport::{Duplex, DuplexTransport, Subscription};
pub use vm::VmHandle;

/// Environment variable overriding the default storage root.
pub const HOME_ENV: &str = "HUORN_HOME";

/// Default storage root: `$HUORN_HOME`, else `{data_dir}/huorn/VMs`.
pub fn default_storage_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    dirs::data_dir()
        .map(|d| d.join("huorn").join("VMs"))
        .ok_or_else(|| Error::ConfigurationInvalid("cannot determine data directory".into()))
}

/// Entry point tying a storage root to an engine.
pub struct Huorn {
    /// Bundle reader/writer.
    store: BundleStore,
    /// Listing over the same root.
    catalog: VmCatalog,
    /// Hypervisor collaborator.
    engine: Arc<dyn Engine>,
}

impl std::fmt::Debug for Huorn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Huorn")
            .field("root", &self.store.root())
            .finish_non_exhaustive()
    }
}

impl Huorn {
    /// Uses `root` as the storage root. Nothing is created on disk yet.
    pub fn open(root: impl Into<PathBuf>, engine: Arc<dyn Engine>) -> Self {
        let store = BundleStore::new(root);
        Self {
            catalog: VmCatalog::new(store.clone()),
            store,
            engine,
        }
    }

    /// Uses [`default_storage_dir`] as the storage root.
    pub fn open_default(engine: Arc<dyn Engine>) -> Result<Self> {
        Ok(Self::open(default_storage_dir()?, engine))
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        self.store.root()
    }

    /// Bundle store over the root.
    pub const fn store(&self) -> &BundleStore {
        &self.store
    }

    /// Catalog over the root.
    pub const fn catalog(&self) -> &VmCatalog {
        &self.catalog
    }

    /// Whether the engine can run VMs on this host.
    pub fn is_supported(&self) -> bool {
        self.engine.is_supported()
    }

    /// Every readable bundle under the root, most recent first.
    pub fn list_vms(&self) -> Result<Vec<VmInfo>> {
        self.catalog.list_all()
    }

    /// Starts a builder bound to this engine.
    pub fn builder(&self) -> VmBuilder {
        VmBuilder::new(Arc::clone(&self.engine))
    }

    /// Loads a complete bundle by name or path.
    pub fn load(&self, name_or_path: &str) -> Result<VmHandle> {
        let bundle = self.store.resolve(name_or_path);
        let config = self.store.load(&bundle)?;
        tracing::debug!(vm = %config.name, bundle = %bundle.display(), "loaded bundle");
        Ok(VmHandle::new(bundle, config, Arc::clone(&self.engine), None))
    }
}
