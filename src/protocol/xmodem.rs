//! XMODEM transfer engine
//!
//! Stop-and-wait sender and receiver state machines over a raw
//! [`PortTransport`]. Supports the original checksum variant and the
//! CRC-16 variant; the mode is negotiated by the receiver's handshake byte
//! (NAK requests checksum, 'C' requests CRC) and is fixed for the whole
//! transfer.
//!
//! Entry points operate on in-memory byte buffers; callers own file I/O and
//! truncate received data to a known length (the final block is padded with
//! 0x1A on the wire).

use super::checksum::{crc16_xmodem, sum8};
use crate::transport::{PortTransport, TransportError};
use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use thiserror::Error;

// XMODEM wire constants
const SOH: u8 = 0x01; // Start of Header
const EOT: u8 = 0x04; // End of Transmission
const ACK: u8 = 0x06; // Acknowledge
const NAK: u8 = 0x15; // Negative Acknowledge
const CAN: u8 = 0x18; // Cancel
const SUB: u8 = 0x1A; // Padding character (Ctrl-Z)
const CRC_REQUEST: u8 = 0x43; // 'C'

/// Payload bytes per packet
pub const BLOCK_SIZE: usize = 128;

/// XMODEM variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XmodemVariant {
    /// Original XMODEM with an 8-bit additive checksum
    Checksum,
    /// XMODEM-CRC with CRC-16/XMODEM
    #[default]
    Crc,
}

/// Tunable timeouts and retry budgets for one transfer
///
/// Defaults follow the classic protocol figures: 10 second waits, 10
/// attempts at every stage.
#[derive(Debug, Clone, Copy)]
pub struct XmodemConfig {
    /// Variant the receiver requests; the sender learns it from the wire
    pub variant: XmodemVariant,
    /// Wait for the initial handshake byte / first packet
    pub handshake_timeout: Duration,
    /// Handshake attempts before giving up
    pub handshake_attempts: u32,
    /// Per-packet reply and inter-packet idle timeout
    pub reply_timeout: Duration,
    /// Retransmissions of the same packet (sender) or idle waits (receiver)
    pub max_retries: u32,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            variant: XmodemVariant::default(),
            handshake_timeout: Duration::from_secs(10),
            handshake_attempts: 10,
            reply_timeout: Duration::from_secs(10),
            max_retries: 10,
        }
    }
}

impl XmodemConfig {
    /// Configuration for the given variant with classic timings
    pub fn new(variant: XmodemVariant) -> Self {
        Self { variant, ..Self::default() }
    }

    /// Set both timeouts at once
    #[must_use]
    pub fn timeouts(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self.reply_timeout = timeout;
        self
    }

    /// Set the retry budget
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Terminal transfer failures
///
/// Transient faults (a timeout, a NAK, one corrupt packet) are retried
/// internally and never surface individually; only retry-budget exhaustion
/// or a peer cancel does.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The receiver never sent its handshake byte
    #[error("No receiver response")]
    NoReceiverResponse,

    /// No packet header arrived after the handshake was sent
    #[error("No sender response")]
    NoSenderResponse,

    /// The same packet failed more times than the retry budget allows
    #[error("Maximum retries exceeded")]
    MaxRetriesExceeded,

    /// The sender went quiet mid-transfer
    #[error("Sender timed out")]
    SenderTimeout,

    /// The peer sent CAN
    #[error("Transfer cancelled by peer")]
    TransferCancelledByPeer,

    /// Every payload byte was acknowledged but the EOT handshake was not;
    /// the data in `bytes_transferred` was delivered
    #[error("Termination handshake failed after {bytes_transferred} bytes were delivered")]
    IncompleteTermination {
        /// Payload bytes the receiver acknowledged
        bytes_transferred: u64,
    },

    /// The transport failed underneath the state machine
    #[error("Transport fault: {0}")]
    Transport(#[from] TransportError),
}

/// Summary of a finished transfer
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferReport {
    /// Payload bytes transferred (excluding padding)
    pub bytes_transferred: u64,
    /// Packets accepted
    pub packets: u32,
    /// Retransmissions / NAKs along the way
    pub retries: u32,
}

/// Per-transfer bookkeeping; lives for one send/receive call only
#[derive(Debug, Default)]
struct TransferSession {
    block_num: u8,
    bytes_transferred: u64,
    packets: u32,
    retries: u32,
}

impl TransferSession {
    fn report(&self) -> TransferReport {
        TransferReport {
            bytes_transferred: self.bytes_transferred,
            packets: self.packets,
            retries: self.retries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderState {
    Start,
    WaitForReceiverReady,
    SendPacket,
    WaitAck,
    SendEot,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverState {
    Start,
    RequestFirstPacket,
    WaitPacket,
    Done,
}

/// Frame one packet: `SOH, block, 255-block, 128 data bytes, check`
fn build_packet(block_num: u8, data: &[u8], use_crc: bool) -> Vec<u8> {
    debug_assert!(data.len() <= BLOCK_SIZE);

    let mut packet = Vec::with_capacity(3 + BLOCK_SIZE + 2);
    packet.push(SOH);
    packet.push(block_num);
    packet.push(!block_num);

    let mut block = data.to_vec();
    block.resize(BLOCK_SIZE, SUB);
    packet.extend_from_slice(&block);

    if use_crc {
        let crc = crc16_xmodem(&block);
        packet.push((crc >> 8) as u8);
        packet.push((crc & 0xFF) as u8);
    } else {
        packet.push(sum8(&block));
    }

    packet
}

/// Read exactly `len` bytes before the timeout elapses; `None` on expiry
async fn read_exact(
    transport: &mut dyn PortTransport,
    len: usize,
    timeout: Duration,
) -> Result<Option<Vec<u8>>, TransferError> {
    let deadline = Instant::now() + timeout;
    let mut buf = Vec::with_capacity(len);

    while buf.len() < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        let chunk = transport.read_bytes(len - buf.len(), remaining).await?;
        if chunk.is_empty() {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(Some(buf))
}

/// Read a single control byte; `None` on timeout
async fn read_byte(
    transport: &mut dyn PortTransport,
    timeout: Duration,
) -> Result<Option<u8>, TransferError> {
    Ok(read_exact(transport, 1, timeout).await?.map(|buf| buf[0]))
}

/// Write the whole buffer, retrying short writes
async fn write_all(
    transport: &mut dyn PortTransport,
    data: &[u8],
) -> Result<(), TransferError> {
    let mut offset = 0;
    while offset < data.len() {
        let written = transport.write_bytes(&data[offset..]).await?;
        if written == 0 {
            return Err(TransferError::Transport(TransportError::Io(
                std::io::Error::new(std::io::ErrorKind::WriteZero, "transport accepted no bytes"),
            )));
        }
        offset += written;
    }
    Ok(())
}

/// Send `data` as an XMODEM stream over `transport`
///
/// Blocks (asynchronously) until the transfer reaches a terminal state. The
/// checksum/CRC mode is dictated by the receiver's handshake byte regardless
/// of `config.variant`.
pub async fn send_stream(
    transport: &mut dyn PortTransport,
    data: &[u8],
    config: &XmodemConfig,
) -> Result<TransferReport, TransferError> {
    let chunks: Vec<&[u8]> = data.chunks(BLOCK_SIZE).collect();
    let mut session = TransferSession { block_num: 1, ..TransferSession::default() };
    let mut state = SenderState::Start;
    let mut use_crc = config.variant == XmodemVariant::Crc;
    let mut chunk_index = 0usize;
    let mut packet: Vec<u8> = Vec::new();
    let mut packet_retries = 0u32;

    loop {
        match state {
            SenderState::Start => {
                tracing::debug!("XMODEM send: {} bytes, {} packets", data.len(), chunks.len());
                state = SenderState::WaitForReceiverReady;
            }

            SenderState::WaitForReceiverReady => {
                let mut attempts = 0;
                loop {
                    match read_byte(transport, config.handshake_timeout).await? {
                        Some(CRC_REQUEST) => {
                            use_crc = true;
                            break;
                        }
                        Some(NAK) => {
                            use_crc = false;
                            break;
                        }
                        Some(CAN) => return Err(TransferError::TransferCancelledByPeer),
                        Some(_) | None => {
                            attempts += 1;
                            if attempts >= config.handshake_attempts {
                                return Err(TransferError::NoReceiverResponse);
                            }
                        }
                    }
                }
                tracing::debug!(
                    "XMODEM send: receiver ready, {} mode",
                    if use_crc { "CRC" } else { "checksum" }
                );
                state = if chunks.is_empty() { SenderState::SendEot } else { SenderState::SendPacket };
            }

            SenderState::SendPacket => {
                packet = build_packet(session.block_num, chunks[chunk_index], use_crc);
                write_all(transport, &packet).await?;
                state = SenderState::WaitAck;
            }

            SenderState::WaitAck => {
                match read_byte(transport, config.reply_timeout).await? {
                    Some(ACK) => {
                        session.bytes_transferred += chunks[chunk_index].len() as u64;
                        session.packets += 1;
                        session.block_num = session.block_num.wrapping_add(1);
                        packet_retries = 0;
                        chunk_index += 1;
                        state = if chunk_index == chunks.len() {
                            SenderState::SendEot
                        } else {
                            SenderState::SendPacket
                        };
                    }
                    Some(CAN) => return Err(TransferError::TransferCancelledByPeer),
                    // NAK, a corrupted reply byte, and a timeout all count
                    // the same against the retry budget
                    Some(_) | None => {
                        packet_retries += 1;
                        session.retries += 1;
                        if packet_retries > config.max_retries {
                            return Err(TransferError::MaxRetriesExceeded);
                        }
                        tracing::trace!(
                            "XMODEM send: retransmitting block {} (attempt {})",
                            session.block_num,
                            packet_retries
                        );
                        write_all(transport, &packet).await?;
                    }
                }
            }

            SenderState::SendEot => {
                let mut attempts = 0;
                loop {
                    write_all(transport, &[EOT]).await?;
                    match read_byte(transport, config.reply_timeout).await? {
                        Some(ACK) => break,
                        _ => {
                            attempts += 1;
                            if attempts >= config.max_retries {
                                // Payload is fully acknowledged at this
                                // point; only the handshake failed
                                return Err(TransferError::IncompleteTermination {
                                    bytes_transferred: session.bytes_transferred,
                                });
                            }
                        }
                    }
                }
                state = SenderState::Done;
            }

            SenderState::Done => {
                tracing::debug!(
                    "XMODEM send: done, {} bytes in {} packets ({} retries)",
                    session.bytes_transferred,
                    session.packets,
                    session.retries
                );
                return Ok(session.report());
            }
        }
    }
}

/// Receive an XMODEM stream from `transport`
///
/// Returns the payload in whole 128-byte blocks (the final block keeps its
/// 0x1A padding) together with the transfer report.
pub async fn receive_stream(
    transport: &mut dyn PortTransport,
    config: &XmodemConfig,
) -> Result<(Bytes, TransferReport), TransferError> {
    let use_crc = config.variant == XmodemVariant::Crc;
    let handshake = if use_crc { CRC_REQUEST } else { NAK };
    let check_len = if use_crc { 2 } else { 1 };

    let mut session = TransferSession::default();
    let mut state = ReceiverState::Start;
    let mut output = BytesMut::new();
    let mut expected_block: u8 = 1;
    // Last accepted block, None until the first accept; only a duplicate of
    // this block may be re-ACKed
    let mut prev_block: Option<u8> = None;
    let mut idle_retries = 0u32;
    // Header byte carried over from the handshake wait
    let mut pending_header: Option<u8> = None;

    loop {
        match state {
            ReceiverState::Start => {
                tracing::debug!(
                    "XMODEM receive: requesting {} mode",
                    if use_crc { "CRC" } else { "checksum" }
                );
                state = ReceiverState::RequestFirstPacket;
            }

            ReceiverState::RequestFirstPacket => {
                let mut attempts = 0;
                loop {
                    write_all(transport, &[handshake]).await?;
                    match read_byte(transport, config.handshake_timeout).await? {
                        Some(byte) => {
                            pending_header = Some(byte);
                            break;
                        }
                        None => {
                            attempts += 1;
                            if attempts >= config.handshake_attempts {
                                return Err(TransferError::NoSenderResponse);
                            }
                        }
                    }
                }
                state = ReceiverState::WaitPacket;
            }

            ReceiverState::WaitPacket => {
                let header = match pending_header.take() {
                    Some(byte) => byte,
                    None => match read_byte(transport, config.reply_timeout).await? {
                        Some(byte) => byte,
                        None => {
                            idle_retries += 1;
                            if idle_retries > config.max_retries {
                                // Tell a still-alive sender to stop too
                                write_all(transport, &[CAN, CAN]).await.ok();
                                return Err(TransferError::SenderTimeout);
                            }
                            write_all(transport, &[NAK]).await?;
                            continue;
                        }
                    },
                };

                match header {
                    EOT => {
                        write_all(transport, &[ACK]).await?;
                        state = ReceiverState::Done;
                    }
                    CAN => return Err(TransferError::TransferCancelledByPeer),
                    SOH => {
                        let body =
                            match read_exact(transport, 2 + BLOCK_SIZE + check_len, config.reply_timeout)
                                .await?
                            {
                                Some(body) => body,
                                None => {
                                    // Truncated packet: purge and re-request
                                    session.retries += 1;
                                    transport.clear_buffers(true, false).await?;
                                    write_all(transport, &[NAK]).await?;
                                    continue;
                                }
                            };

                        let block_num = body[0];
                        let block_comp = body[1];
                        let block_data = &body[2..2 + BLOCK_SIZE];

                        let complement_ok = block_num == !block_comp;
                        let check_ok = complement_ok
                            && if use_crc {
                                let received = ((body[2 + BLOCK_SIZE] as u16) << 8)
                                    | (body[3 + BLOCK_SIZE] as u16);
                                crc16_xmodem(block_data) == received
                            } else {
                                sum8(block_data) == body[2 + BLOCK_SIZE]
                            };

                        if !check_ok {
                            session.retries += 1;
                            tracing::trace!(
                                "XMODEM receive: bad packet for block {}, requesting again",
                                expected_block
                            );
                            transport.clear_buffers(true, false).await?;
                            write_all(transport, &[NAK]).await?;
                        } else if block_num == expected_block {
                            output.extend_from_slice(block_data);
                            session.bytes_transferred += BLOCK_SIZE as u64;
                            session.packets += 1;
                            prev_block = Some(block_num);
                            expected_block = expected_block.wrapping_add(1);
                            idle_retries = 0;
                            write_all(transport, &[ACK]).await?;
                        } else if prev_block == Some(block_num) {
                            // Duplicate of the last accepted block: our ACK
                            // was lost; re-ACK without writing twice
                            write_all(transport, &[ACK]).await?;
                        } else {
                            // Out-of-sequence block; keep requesting the
                            // expected one, never resynchronize
                            session.retries += 1;
                            transport.clear_buffers(true, false).await?;
                            write_all(transport, &[NAK]).await?;
                        }
                    }
                    _ => {
                        // Line noise where a header was expected
                        session.retries += 1;
                        transport.clear_buffers(true, false).await?;
                        write_all(transport, &[NAK]).await?;
                    }
                }
            }

            ReceiverState::Done => {
                tracing::debug!(
                    "XMODEM receive: done, {} bytes in {} packets ({} retries)",
                    session.bytes_transferred,
                    session.packets,
                    session.retries
                );
                return Ok((output.freeze(), session.report()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_packet_checksum() {
        let packet = build_packet(1, b"hello", false);
        assert_eq!(packet.len(), 3 + BLOCK_SIZE + 1);
        assert_eq!(packet[0], SOH);
        assert_eq!(packet[1], 1);
        assert_eq!(packet[2], 0xFE);
        assert_eq!(&packet[3..8], b"hello");
        assert!(packet[8..3 + BLOCK_SIZE].iter().all(|&b| b == SUB));

        let mut block = b"hello".to_vec();
        block.resize(BLOCK_SIZE, SUB);
        assert_eq!(packet[3 + BLOCK_SIZE], sum8(&block));
    }

    #[test]
    fn test_build_packet_crc() {
        let packet = build_packet(3, &[0xAA; BLOCK_SIZE], true);
        assert_eq!(packet.len(), 3 + BLOCK_SIZE + 2);
        assert_eq!(packet[1], 3);
        assert_eq!(packet[2], 0xFC);

        let crc = crc16_xmodem(&[0xAA; BLOCK_SIZE]);
        assert_eq!(packet[3 + BLOCK_SIZE], (crc >> 8) as u8);
        assert_eq!(packet[4 + BLOCK_SIZE], (crc & 0xFF) as u8);
    }

    #[test]
    fn test_block_number_complement() {
        for block in [0u8, 1, 127, 128, 255] {
            let packet = build_packet(block, b"x", true);
            assert_eq!(packet[1], !packet[2]);
            assert_eq!(packet[2], 255 - block);
        }
    }
}
