//! Reliable file-transfer protocol over raw serial byte streams
//!
//! Provides the XMODEM family (checksum and CRC variants) plus the checksum
//! primitives the wire format is built on.

pub mod checksum;
pub mod xmodem;

pub use checksum::{crc16_xmodem, sum8};
pub use xmodem::{
    receive_stream, send_stream, TransferError, TransferReport, XmodemConfig, XmodemVariant,
    BLOCK_SIZE,
};
