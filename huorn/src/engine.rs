//! Boundary to the virtualization engine.
//!
//! huorn never emulates hardware itself. Everything that touches the
//! hypervisor goes through [`Engine`] (host-level queries, provisioning,
//! opening an existing bundle) and [`Machine`] (one live VM).

use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;

use crate::bundle::BundleLayout;
use crate::config::VmConfig;
use crate::error::Result;
#[cfg(unix)]
use crate::transport::console::ConsoleEndpoints;

/// Minimums and identity an image demands of a new VM.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ImageRequirements {
    /// Fewest virtual CPUs the image supports.
    pub min_cpu: u32,
    /// Least memory the image supports, in bytes.
    pub min_memory: u64,
    /// Opaque hardware-model descriptor persisted into the bundle.
    pub hardware_model: Vec<u8>,
}

impl ImageRequirements {
    /// Creates a requirements record.
    pub const fn new(min_cpu: u32, min_memory: u64, hardware_model: Vec<u8>) -> Self {
        Self {
            min_cpu,
            min_memory,
            hardware_model,
        }
    }
}

/// Inputs to [`Engine::provision`].
///
/// By the time the engine sees this request the builder has already written
/// `disk.img` and `hardware_model.bin`. The engine must write the machine
/// identity and auxiliary storage into `layout` and install the image.
#[derive(Debug)]
#[non_exhaustive]
pub struct ProvisionRequest<'a> {
    /// Validated configuration.
    pub config: &'a VmConfig,
    /// Source image to install from.
    pub image: &'a Path,
    /// Paths of the bundle being populated.
    pub layout: &'a BundleLayout,
    /// Requirements previously returned for `image`.
    pub requirements: &'a ImageRequirements,
}

/// Inputs to [`Engine::open`].
#[derive(Debug)]
#[non_exhaustive]
pub struct OpenRequest<'a> {
    /// Configuration loaded from the bundle.
    pub config: &'a VmConfig,
    /// Paths of the complete bundle.
    pub layout: &'a BundleLayout,
    /// Guest ends of the serial console pipes.
    #[cfg(unix)]
    pub console: Option<ConsoleEndpoints>,
}

/// Host-level engine operations.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Returns `true` if the host supports hardware virtualization.
    fn is_supported(&self) -> bool;

    /// Reads the minimums and hardware model an image requires.
    async fn image_requirements(&self, image: &Path) -> Result<ImageRequirements>;

    /// Installs `image` into a new bundle. Long-running; no internal timeout.
    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<Box<dyn Machine>>;

    /// Creates a runtime machine for an already complete bundle.
    async fn open(&self, request: OpenRequest<'_>) -> Result<Box<dyn Machine>>;
}

/// One engine-side virtual machine.
#[async_trait]
pub trait Machine: Send + Sync {
    /// Boots the guest.
    async fn start(&mut self) -> Result<()>;

    /// Shuts the guest down.
    async fn stop(&mut self) -> Result<()>;

    /// Suspends guest execution.
    async fn pause(&mut self) -> Result<()>;

    /// Continues a paused guest.
    async fn resume(&mut self) -> Result<()>;

    /// The guest's current address, if the engine knows it.
    async fn current_ip_address(&self) -> Option<IpAddr>;
}
