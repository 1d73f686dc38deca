//! Engine-level error taxonomy

use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the handle table and the event notifier
#[derive(Error, Debug)]
pub enum PortError {
    /// Unknown, stale, or already-closed handle
    #[error("Invalid handle")]
    InvalidHandle,

    /// Port could not be claimed: busy, missing, or permission denied
    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    /// Rejected parameter combination
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Transport-level fault (unplugged device, hardware error)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Notifier operation on a handle whose device was removed
    #[error("Device not present: {0}")]
    DeviceNotPresent(String),
}

impl From<TransportError> for PortError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(name) => {
                Self::PortUnavailable(format!("{name}: no such device"))
            }
            TransportError::Busy(name) => Self::PortUnavailable(format!("{name}: busy")),
            TransportError::PermissionDenied(name) => {
                Self::PortUnavailable(format!("{name}: permission denied"))
            }
            TransportError::Unsupported(what) => Self::InvalidConfiguration(what),
            TransportError::NotOpen => Self::InvalidHandle,
            TransportError::Disconnected => Self::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device removed",
            )),
            TransportError::Io(e) => Self::Io(e),
        }
    }
}
