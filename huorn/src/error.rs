//! Error types for huorn operations.

use std::fmt;
use std::path::PathBuf;

use crate::state::{Operation, VmState};

/// Alias for `Result<T, huorn::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by bundle, builder, lifecycle, and transport operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The engine reports no hardware virtualization support on this host.
    #[error("virtualization is not supported on this host")]
    VirtualizationNotSupported,

    /// Missing or invalid build input, or an unmet image minimum.
    #[error("invalid vm configuration: {0}")]
    ConfigurationInvalid(String),

    /// No bundle directory exists at the given path.
    #[error("vm bundle not found: {}", .0.display())]
    BundleNotFound(PathBuf),

    /// The bundle exists but is not complete.
    #[error("invalid vm bundle: {0}")]
    BundleInvalid(String),

    /// Another builder holds the advisory lock for this bundle.
    #[error("vm bundle is locked by another builder: {}", .0.display())]
    BundleLocked(PathBuf),

    /// The primary disk image could not be created or resized.
    #[error("disk creation failed: {0}")]
    DiskCreationFailed(String),

    /// The engine failed to provision, start, stop, pause, or resume a VM.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// The session process exited before it became ready.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The operation requires a connected session.
    #[error("not connected")]
    NotConnected,

    /// A one-shot command exited with a nonzero status. Carries its stderr.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// The session process reported a connect timeout.
    #[error("connection timed out")]
    Timeout,

    /// The transport has already been closed.
    #[error("transport is closed")]
    TransportClosed,

    /// The operation is not valid in the VM's current state.
    #[error("cannot {operation} a vm that is {state}")]
    Lifecycle {
        /// State the VM was in when the operation was attempted.
        state: VmState,
        /// The rejected operation.
        operation: Operation,
    },

    /// An I/O error from bundle or transport operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A config document could not be encoded or decoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Invalid or missing build inputs.
    Configuration,
    /// Missing, invalid, or locked bundle.
    Bundle,
    /// Engine-reported failure.
    Provisioning,
    /// Connection, command, or timeout failures of a transport.
    Transport,
    /// Illegal state transition.
    Lifecycle,
    /// Underlying I/O or serialization failure.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configuration => "configuration",
            Self::Bundle => "bundle",
            Self::Provisioning => "provisioning",
            Self::Transport => "transport",
            Self::Lifecycle => "lifecycle",
            Self::Io => "io",
        })
    }
}

impl Error {
    /// Returns the error's class.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::VirtualizationNotSupported | Self::ConfigurationInvalid(_) => {
                ErrorKind::Configuration
            }
            Self::BundleNotFound(_)
            | Self::BundleInvalid(_)
            | Self::BundleLocked(_)
            | Self::DiskCreationFailed(_) => ErrorKind::Bundle,
            Self::Provisioning(_) => ErrorKind::Provisioning,
            Self::ConnectionFailed(_)
            | Self::NotConnected
            | Self::CommandFailed(_)
            | Self::Timeout
            | Self::TransportClosed => ErrorKind::Transport,
            Self::Lifecycle { .. } => ErrorKind::Lifecycle,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }
}
