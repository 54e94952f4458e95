//! Fluent VM construction with provisioning and rollback.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bundle::{BundleLayout, BundleStore, CONFIG_FILE, REQUIRED_ARTIFACTS};
use crate::config::{GIB, SharedFolder, VmConfig, host_cores};
use crate::disk;
use crate::engine::{Engine, ImageRequirements, ProvisionRequest};
use crate::error::{Error, Result};
use crate::lock::{BundleLock, LOCK_FILE};
use crate::vm::VmHandle;

/// Builder for a new VM bundle.
///
/// Setters only record values; nothing touches the disk or the engine until
/// [`build`](Self::build).
///
/// # Example
///
/// ```no_run
/// # async fn demo(huorn: &huorn::Huorn) -> huorn::Result<()> {
/// let vm = huorn
///     .builder()
///     .from_image("/images/restore.ipsw")
///     .name("dev")
///     .cpus(4)
///     .memory(8 * huorn::GIB)
///     .build(huorn.store())
///     .await?;
/// # let _ = vm;
/// # Ok(())
/// # }
/// ```
#[must_use = "a VmBuilder does nothing until .build() is called"]
pub struct VmBuilder {
    /// Engine that provisions the bundle.
    engine: Arc<dyn Engine>,
    /// Draft configuration.
    config: VmConfig,
    /// Provisioning image.
    image: Option<PathBuf>,
    /// Explicit bundle directory; defaults from the name.
    bundle: Option<PathBuf>,
}

impl std::fmt::Debug for VmBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmBuilder")
            .field("config", &self.config)
            .field("image", &self.image)
            .field("bundle", &self.bundle)
            .finish_non_exhaustive()
    }
}

impl VmBuilder {
    /// Starts a builder with default configuration.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            config: VmConfig::default(),
            image: None,
            bundle: None,
        }
    }

    /// Sets the image to provision from. Required.
    pub fn from_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Places the bundle at `path` instead of `{storage}/{name}.huornvm`.
    pub fn bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.bundle = Some(path.into());
        self
    }

    /// Sets the VM name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Sets the CPU count, clamped to the host's logical cores.
    pub fn cpus(mut self, cores: u32) -> Self {
        self.config.cpu_cores = cores.min(host_cores());
        self
    }

    /// Sets guest memory in bytes.
    pub const fn memory(mut self, bytes: u64) -> Self {
        self.config.memory_bytes = bytes;
        self
    }

    /// Sets the primary disk size in bytes.
    pub const fn disk_size(mut self, bytes: u64) -> Self {
        self.config.disk_size_bytes = bytes;
        self
    }

    /// Sets display geometry.
    pub const fn display(mut self, width: u32, height: u32, ppi: u32) -> Self {
        self.config.display_width = width;
        self.config.display_height = height;
        self.config.display_ppi = ppi;
        self
    }

    /// Adds a shared folder.
    pub fn shared_folder(
        mut self,
        host_path: impl Into<PathBuf>,
        guest_tag: impl Into<String>,
        read_only: bool,
    ) -> Self {
        self.config
            .shared_folders
            .push(SharedFolder::new(host_path, guest_tag, read_only));
        self
    }

    /// Replaces the whole draft configuration.
    pub fn config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the draft configuration.
    pub const fn draft(&self) -> &VmConfig {
        &self.config
    }

    /// Validates, provisions, and persists the bundle.
    ///
    /// On any failure after the bundle directory exists, everything this
    /// call wrote is removed again, so [`BundleStore::load`] never accepts a
    /// half-built bundle.
    pub async fn build(self, store: &BundleStore) -> Result<VmHandle> {
        let Self {
            engine,
            config,
            image,
            bundle,
        } = self;

        if !engine.is_supported() {
            return Err(Error::VirtualizationNotSupported);
        }
        let image = image.ok_or_else(|| {
            Error::ConfigurationInvalid("no provisioning image set".into())
        })?;
        config.validate()?;

        let bundle = bundle.unwrap_or_else(|| store.default_bundle_path(&config.name));
        let created_dir = !bundle.exists();
        let preexisting = if created_dir {
            Vec::new()
        } else {
            Rollback::bundle_files()
                .filter(|name| bundle.join(name).exists())
                .collect()
        };
        fs::create_dir_all(&bundle)?;
        let _lock = BundleLock::acquire(&bundle)?;
        if bundle.join(CONFIG_FILE).exists() {
            return Err(Error::ConfigurationInvalid(format!(
                "bundle already exists: {}",
                bundle.display()
            )));
        }

        let mut rollback = Rollback::new(bundle.clone(), created_dir, preexisting);
        tracing::info!(vm = %config.name, bundle = %bundle.display(), "building vm");

        let requirements = engine.image_requirements(&image).await?;
        check_minimums(&config, &requirements)?;

        let layout = BundleLayout::new(&bundle);
        disk::create_sparse(&layout.disk(), config.disk_size_bytes)?;
        fs::write(layout.hardware_model(), &requirements.hardware_model)?;

        tracing::info!(vm = %config.name, image = %image.display(), "provisioning");
        let machine = engine
            .provision(ProvisionRequest {
                config: &config,
                image: &image,
                layout: &layout,
                requirements: &requirements,
            })
            .await
            .map_err(|e| match e {
                Error::Provisioning(_) => e,
                other => Error::Provisioning(other.to_string()),
            })?;

        if let Some(missing) = store.missing_artifacts(&bundle).first() {
            return Err(Error::Provisioning(format!("engine did not write {missing}")));
        }
        store.save(&config, &bundle)?;
        rollback.disarm();

        tracing::info!(vm = %config.name, "vm built");
        Ok(VmHandle::new(bundle, config, engine, Some(machine)))
    }
}

/// Fails if `config` asks for less than the image supports.
fn check_minimums(config: &VmConfig, requirements: &ImageRequirements) -> Result<()> {
    if config.cpu_cores < requirements.min_cpu {
        return Err(Error::ConfigurationInvalid(format!(
            "image requires at least {} CPU cores",
            requirements.min_cpu
        )));
    }
    if config.memory_bytes < requirements.min_memory {
        #[allow(clippy::cast_precision_loss)]
        let gib = requirements.min_memory as f64 / GIB as f64;
        return Err(Error::ConfigurationInvalid(format!(
            "image requires at least {gib:.1} GB of memory"
        )));
    }
    Ok(())
}

/// Undoes a partial build when dropped while armed.
#[derive(Debug)]
struct Rollback {
    /// Bundle being built.
    bundle: PathBuf,
    /// The directory did not exist before this build.
    created_dir: bool,
    /// Bundle files that were already present; never deleted.
    preexisting: Vec<&'static str>,
    /// Cleared once the build has succeeded.
    armed: bool,
}

impl Rollback {
    /// Arms a rollback for `bundle`.
    const fn new(bundle: PathBuf, created_dir: bool, preexisting: Vec<&'static str>) -> Self {
        Self {
            bundle,
            created_dir,
            preexisting,
            armed: true,
        }
    }

    /// Every file a build may write into the bundle directory.
    fn bundle_files() -> impl Iterator<Item = &'static str> {
        [CONFIG_FILE, LOCK_FILE].into_iter().chain(REQUIRED_ARTIFACTS)
    }

    /// Keeps everything that was written.
    const fn disarm(&mut self) {
        self.armed = false;
    }

    /// Removes the directory, or only the files this build created if it
    /// pre-existed.
    fn undo(&self) -> io::Result<()> {
        if self.created_dir {
            return fs::remove_dir_all(&self.bundle);
        }
        let created = Self::bundle_files().filter(|name| !self.preexisting.contains(name));
        for name in created {
            match fs::remove_file(self.bundle.join(name)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.undo() {
            Ok(()) => tracing::info!(bundle = %self.bundle.display(), "rolled back partial bundle"),
            Err(e) => {
                tracing::warn!(bundle = %self.bundle.display(), error = %e, "rollback failed");
            }
        }
    }
}
