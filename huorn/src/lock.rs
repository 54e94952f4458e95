//! Path-scoped advisory lock for bundle directories.
//!
//! A builder holds [`BundleLock`] for the whole provisioning run so two
//! builders targeting the same bundle cannot interleave writes. The lock is
//! `flock(2)` on `{bundle}/.lock` and is released when the guard drops.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the lock file inside a bundle directory.
pub const LOCK_FILE: &str = ".lock";

/// Exclusive advisory lock on a bundle directory.
#[derive(Debug)]
pub struct BundleLock {
    /// Locked bundle directory.
    bundle: PathBuf,
    /// Held `flock`; unlocked on drop.
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<std::fs::File>,
}

impl BundleLock {
    /// Takes the lock without blocking.
    ///
    /// Fails with [`Error::BundleLocked`] if another holder has it.
    #[cfg(unix)]
    pub fn acquire(bundle: &Path) -> Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(bundle.join(LOCK_FILE))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Self {
                bundle: bundle.to_path_buf(),
                _flock: flock,
            }),
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                Err(Error::BundleLocked(bundle.to_path_buf()))
            }
            Err((_, errno)) => Err(std::io::Error::from(errno).into()),
        }
    }

    /// No advisory locking on this platform; always succeeds.
    #[cfg(not(unix))]
    pub fn acquire(bundle: &Path) -> Result<Self> {
        Ok(Self {
            bundle: bundle.to_path_buf(),
        })
    }

    /// Returns the locked bundle directory.
    pub fn bundle(&self) -> &Path {
        &self.bundle
    }
}
