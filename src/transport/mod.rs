//! Transport layer: the byte-device seam underneath every port session
//!
//! Implementations:
//! - Hardware serial ports (RS-232, RS-485, USB-Serial)
//! - In-memory null-modem loopback pairs (deterministic testing peer)
//!
//! Any conforming implementation may be substituted without changing the
//! layers above (handle table, event notifier, transfer engine).

mod loopback;
mod serial;

pub use loopback::LoopbackTransport;
pub use serial::{available_ports, SerialTransport};

use crate::config::LineConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Device does not exist
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Device exists but is claimed elsewhere
    #[error("Device busy: {0}")]
    Busy(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The backend cannot express the requested setting
    #[error("Unsupported by this backend: {0}")]
    Unsupported(String),

    /// Operation on a transport that is not open
    #[error("Transport not open")]
    NotOpen,

    /// Device disappeared (unplugged, peer torn down)
    #[error("Device removed")]
    Disconnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot of the line-status signals as seen by one end of the wire
///
/// `break_received` is latched by the transport when the peer raises a break
/// condition and cleared once it has been observed through [`PortTransport::status`].
/// Backends that cannot detect break report `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStatus {
    /// Clear To Send
    pub cts: bool,
    /// Data Set Ready
    pub dsr: bool,
    /// Ring Indicator
    pub ri: bool,
    /// Carrier Detect
    pub cd: bool,
    /// Break condition observed since the previous status read
    pub break_received: bool,
}

/// Byte-device abstraction consumed by the session engine
///
/// Contract notes:
/// - `read_bytes` never blocks past its timeout; expiry yields an empty
///   buffer, a device fault yields an error.
/// - `status` and `queued_bytes` are cheap snapshots and may be called while
///   another task performs I/O on the same object.
#[async_trait]
pub trait PortTransport: Send + Sync {
    /// Open the underlying device
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Apply a full line configuration
    async fn apply_config(&mut self, config: &LineConfig) -> Result<(), TransportError>;

    /// Read up to `max` bytes, waiting at most `timeout`
    async fn read_bytes(&mut self, max: usize, timeout: Duration) -> Result<Bytes, TransportError>;

    /// Write bytes, returning how many were accepted
    async fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Current line-status signals
    fn status(&self) -> Result<LineStatus, TransportError>;

    /// Drive the RTS and DTR outputs
    async fn set_control_lines(&mut self, rts: bool, dtr: bool) -> Result<(), TransportError>;

    /// Raise or clear the break condition on the transmit line
    async fn set_break(&mut self, on: bool) -> Result<(), TransportError>;

    /// Discard buffered input and/or output
    async fn clear_buffers(&mut self, input: bool, output: bool) -> Result<(), TransportError>;

    /// Bytes waiting in the (input, output) buffers
    fn queued_bytes(&self) -> Result<(usize, usize), TransportError>;

    /// Release the device
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the device is currently open
    fn is_open(&self) -> bool;

    /// Human-readable description of the endpoint
    fn description(&self) -> String;
}
