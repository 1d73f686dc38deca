//! # Portkit
//!
//! A serial port session engine:
//! - Many concurrently open hardware/virtual ports behind opaque,
//!   generation-checked handles with validated configuration and teardown
//! - An asynchronous notification subsystem watching line-status signals
//!   (CTS/DSR/RI/CD/break) and device removal without blocking callers
//! - A reliable XMODEM-family file-transfer engine (checksum and CRC
//!   variants) layered on the raw, lossy byte stream
//!
//! Transports are interchangeable behind the [`PortTransport`] seam: real
//! UARTs via the `serialport` crate, or in-memory null-modem loopback pairs
//! for deterministic testing.
//!
//! ## Example
//!
//! ```rust,no_run
//! use portkit::{OpenMode, PortHandleTable};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portkit::PortError> {
//!     let table = PortHandleTable::with_serial_backend();
//!     let handle = table.open("/dev/ttyUSB0", OpenMode::default()).await?;
//!
//!     table.write(handle, b"AT\r\n", None).await?;
//!     let reply = table.read(handle, 256).await?;
//!     println!("Received: {reply:?}");
//!
//!     table.close(handle).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod table;
pub mod transport;

// Re-exports for convenience
pub use crate::config::{BaudRate, DataBits, FlowControl, LineConfig, OpenMode, Parity, StopBits};
pub use crate::error::PortError;
pub use crate::events::{EventMask, LineEvent, PortEvent, PortListener};
pub use crate::protocol::{
    receive_stream, send_stream, TransferError, TransferReport, XmodemConfig, XmodemVariant,
};
pub use crate::table::{
    available_ports, PortHandle, PortHandleTable, SerialFactory, SessionStats, TransportFactory,
};
pub use crate::transport::{
    LineStatus, LoopbackTransport, PortTransport, SerialTransport, TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
