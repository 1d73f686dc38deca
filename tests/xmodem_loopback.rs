//! XMODEM transfers over a deterministic loopback link, including fault
//! injection

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portkit::protocol::{crc16_xmodem, receive_stream, send_stream, TransferError, XmodemConfig,
    XmodemVariant, BLOCK_SIZE};
use portkit::{
    LineConfig, LineStatus, LoopbackTransport, OpenMode, PortHandleTable, PortTransport,
    TransportError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;

fn fast_config(variant: XmodemVariant) -> XmodemConfig {
    XmodemConfig::new(variant)
        .timeouts(Duration::from_millis(300))
        .max_retries(10)
}

fn payload(len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    (0..len).map(|_| rng.gen()).collect()
}

async fn open_pair(name: &str) -> (LoopbackTransport, LoopbackTransport) {
    let (mut a, mut b) = LoopbackTransport::pair(name);
    a.open().await.unwrap();
    b.open().await.unwrap();
    (a, b)
}

/// Collect exactly `len` bytes from a raw endpoint
async fn read_exact_from(transport: &mut LoopbackTransport, len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(len);
    while buf.len() < len {
        let chunk = transport
            .read_bytes(len - buf.len(), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(!chunk.is_empty(), "peer went quiet waiting for {len} bytes");
        buf.extend_from_slice(&chunk);
    }
    buf
}

/// Build a valid CRC-mode packet by hand, for scripted peers
fn crc_packet(block_num: u8, data: &[u8]) -> Vec<u8> {
    let mut block = data.to_vec();
    block.resize(BLOCK_SIZE, 0x1A);

    let mut packet = vec![SOH, block_num, !block_num];
    packet.extend_from_slice(&block);
    let crc = crc16_xmodem(&block);
    packet.push((crc >> 8) as u8);
    packet.push((crc & 0xFF) as u8);
    packet
}

#[tokio::test]
async fn test_round_trip_crc_three_packets() {
    let (mut tx_end, mut rx_end) = open_pair("rt-crc").await;
    let data = payload(300);
    let expected = data.clone();

    let config = fast_config(XmodemVariant::Crc);
    let receiver = tokio::spawn(async move {
        receive_stream(&mut rx_end, &config).await
    });

    let report = send_stream(&mut tx_end, &data, &config).await.unwrap();
    assert_eq!(report.bytes_transferred, 300);
    assert_eq!(report.packets, 3);
    assert_eq!(report.retries, 0);

    let (received, rx_report) = receiver.await.unwrap().unwrap();
    assert_eq!(received.len(), 3 * BLOCK_SIZE);
    // Strip padding using the originally known length
    assert_eq!(&received[..300], &expected[..]);
    assert!(received[300..].iter().all(|&b| b == 0x1A));
    assert_eq!(rx_report.packets, 3);
}

#[tokio::test]
async fn test_round_trip_checksum_mode() {
    let (mut tx_end, mut rx_end) = open_pair("rt-sum").await;
    let data = payload(BLOCK_SIZE * 2);
    let expected = data.clone();

    // Receiver requests checksum mode; the sender must follow
    let config = fast_config(XmodemVariant::Checksum);
    let receiver = tokio::spawn(async move { receive_stream(&mut rx_end, &config).await });

    let sender_config = fast_config(XmodemVariant::Crc);
    let report = send_stream(&mut tx_end, &data, &sender_config).await.unwrap();
    assert_eq!(report.bytes_transferred, (BLOCK_SIZE * 2) as u64);

    let (received, _) = receiver.await.unwrap().unwrap();
    assert_eq!(&received[..], &expected[..]);
}

#[tokio::test]
async fn test_empty_payload_is_just_eot() {
    let (mut tx_end, mut rx_end) = open_pair("rt-empty").await;

    let config = fast_config(XmodemVariant::Crc);
    let receiver = tokio::spawn(async move { receive_stream(&mut rx_end, &config).await });

    let report = send_stream(&mut tx_end, &[], &config).await.unwrap();
    assert_eq!(report.bytes_transferred, 0);
    assert_eq!(report.packets, 0);

    let (received, _) = receiver.await.unwrap().unwrap();
    assert!(received.is_empty());
}

/// Wrapper that flips one byte in the nth full data packet written
struct CorruptingTransport {
    inner: LoopbackTransport,
    target_packet: u32,
    packets_seen: u32,
    corrupted: bool,
}

impl CorruptingTransport {
    fn new(inner: LoopbackTransport, target_packet: u32) -> Self {
        Self { inner, target_packet, packets_seen: 0, corrupted: false }
    }
}

#[async_trait]
impl PortTransport for CorruptingTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.inner.open().await
    }

    async fn apply_config(&mut self, config: &LineConfig) -> Result<(), TransportError> {
        self.inner.apply_config(config).await
    }

    async fn read_bytes(&mut self, max: usize, timeout: Duration) -> Result<Bytes, TransportError> {
        self.inner.read_bytes(max, timeout).await
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if data.len() >= 3 + BLOCK_SIZE && data[0] == SOH {
            self.packets_seen += 1;
            if self.packets_seen == self.target_packet && !self.corrupted {
                self.corrupted = true;
                let mut mangled = data.to_vec();
                mangled[10] ^= 0xFF;
                return self.inner.write_bytes(&mangled).await;
            }
        }
        self.inner.write_bytes(data).await
    }

    fn status(&self) -> Result<LineStatus, TransportError> {
        self.inner.status()
    }

    async fn set_control_lines(&mut self, rts: bool, dtr: bool) -> Result<(), TransportError> {
        self.inner.set_control_lines(rts, dtr).await
    }

    async fn set_break(&mut self, on: bool) -> Result<(), TransportError> {
        self.inner.set_break(on).await
    }

    async fn clear_buffers(&mut self, input: bool, output: bool) -> Result<(), TransportError> {
        self.inner.clear_buffers(input, output).await
    }

    fn queued_bytes(&self) -> Result<(usize, usize), TransportError> {
        self.inner.queued_bytes()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn description(&self) -> String {
        self.inner.description()
    }
}

#[tokio::test]
async fn test_single_corrupted_packet_causes_one_retransmission() {
    let (tx_end, mut rx_end) = open_pair("corrupt").await;
    let mut tx_end = CorruptingTransport::new(tx_end, 2);
    let data = payload(300);
    let expected = data.clone();

    let config = fast_config(XmodemVariant::Checksum);
    let receiver = tokio::spawn(async move { receive_stream(&mut rx_end, &config).await });

    let report = send_stream(&mut tx_end, &data, &config).await.unwrap();
    assert_eq!(report.bytes_transferred, 300);
    assert_eq!(report.retries, 1, "exactly one NAK/retransmission of packet 2");

    let (received, rx_report) = receiver.await.unwrap().unwrap();
    assert_eq!(&received[..300], &expected[..]);
    assert_eq!(rx_report.retries, 1);
}

#[tokio::test]
async fn test_peer_can_terminates_sender_promptly() {
    let (mut tx_end, mut peer) = open_pair("cancel").await;
    let data = payload(BLOCK_SIZE * 4);

    let config = fast_config(XmodemVariant::Checksum);
    let sender = tokio::spawn(async move { send_stream(&mut tx_end, &data, &config).await });

    // Scripted receiver: request checksum mode, then cancel on packet 1
    peer.write_bytes(&[NAK]).await.unwrap();
    let packet = read_exact_from(&mut peer, 3 + BLOCK_SIZE + 1).await;
    assert_eq!(packet[0], SOH);
    assert_eq!(packet[1], 1);
    peer.write_bytes(&[CAN]).await.unwrap();

    let result = sender.await.unwrap();
    assert!(matches!(result, Err(TransferError::TransferCancelledByPeer)));

    // No further packets may arrive after the cancel
    let silence = peer.read_bytes(64, Duration::from_millis(200)).await.unwrap();
    assert!(silence.is_empty());
}

#[tokio::test]
async fn test_retry_exhaustion_aborts_with_zero_delivered() {
    let (mut tx_end, mut peer) = open_pair("retries").await;
    let data = payload(BLOCK_SIZE);

    let config = fast_config(XmodemVariant::Checksum).max_retries(10);
    let sender = tokio::spawn(async move { send_stream(&mut tx_end, &data, &config).await });

    peer.write_bytes(&[NAK]).await.unwrap();
    // 11 consecutive corrupted replies: initial transmission plus 10
    // retransmissions, every one answered with garbage
    for _ in 0..11 {
        let packet = read_exact_from(&mut peer, 3 + BLOCK_SIZE + 1).await;
        assert_eq!(packet[1], 1, "sender must keep retransmitting block 1");
        peer.write_bytes(&[0x7F]).await.unwrap();
    }

    let result = sender.await.unwrap();
    assert!(matches!(result, Err(TransferError::MaxRetriesExceeded)));
}

#[tokio::test]
async fn test_no_receiver_response() {
    let (mut tx_end, _peer) = open_pair("mute-rx").await;

    let config = XmodemConfig::new(XmodemVariant::Crc)
        .timeouts(Duration::from_millis(50))
        .max_retries(2);
    let result = send_stream(&mut tx_end, &payload(10), &config).await;
    assert!(matches!(result, Err(TransferError::NoReceiverResponse)));
}

#[tokio::test]
async fn test_no_sender_response() {
    let (mut rx_end, _peer) = open_pair("mute-tx").await;

    let config = XmodemConfig::new(XmodemVariant::Crc)
        .timeouts(Duration::from_millis(50))
        .max_retries(2);
    let result = receive_stream(&mut rx_end, &config).await;
    assert!(matches!(result, Err(TransferError::NoSenderResponse)));
}

#[tokio::test]
async fn test_receiver_times_out_on_quiet_sender_and_sends_can() {
    let (mut rx_end, mut peer) = open_pair("quiet").await;

    let config = XmodemConfig::new(XmodemVariant::Crc)
        .timeouts(Duration::from_millis(100))
        .max_retries(2);
    let receiver = tokio::spawn(async move { receive_stream(&mut rx_end, &config).await });

    // Deliver packet 1, then go quiet
    let handshake = read_exact_from(&mut peer, 1).await;
    assert_eq!(handshake[0], b'C');
    peer.write_bytes(&crc_packet(1, b"first")).await.unwrap();
    let ack = read_exact_from(&mut peer, 1).await;
    assert_eq!(ack[0], ACK);

    let result = receiver.await.unwrap();
    assert!(matches!(result, Err(TransferError::SenderTimeout)));

    // The receiver warns a still-alive sender before aborting
    let mut seen = Vec::new();
    loop {
        let chunk = peer.read_bytes(16, Duration::from_millis(100)).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        seen.extend_from_slice(&chunk);
    }
    assert!(seen.contains(&CAN));
}

#[tokio::test]
async fn test_block_zero_before_first_accept_is_naked() {
    let (mut rx_end, mut peer) = open_pair("zero").await;

    let config = fast_config(XmodemVariant::Crc);
    let receiver = tokio::spawn(async move { receive_stream(&mut rx_end, &config).await });

    let handshake = read_exact_from(&mut peer, 1).await;
    assert_eq!(handshake[0], b'C');

    // A stray block 0 before anything was accepted is out of sequence, not
    // a duplicate; it must be refused
    peer.write_bytes(&crc_packet(0, b"ghost")).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], NAK);

    peer.write_bytes(&crc_packet(1, b"real")).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], ACK);

    peer.write_bytes(&[EOT]).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], ACK);

    let (received, report) = receiver.await.unwrap().unwrap();
    assert_eq!(&received[..4], b"real");
    assert_eq!(report.packets, 1);
}

#[tokio::test]
async fn test_duplicate_block_re_acked_without_double_write() {
    let (mut rx_end, mut peer) = open_pair("dup").await;

    let config = fast_config(XmodemVariant::Crc);
    let receiver = tokio::spawn(async move { receive_stream(&mut rx_end, &config).await });

    let handshake = read_exact_from(&mut peer, 1).await;
    assert_eq!(handshake[0], b'C');

    peer.write_bytes(&crc_packet(1, b"block one")).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], ACK);

    // Retransmit block 1 as if our ACK had been lost on the wire
    peer.write_bytes(&crc_packet(1, b"block one")).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], ACK);

    peer.write_bytes(&crc_packet(2, b"block two")).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], ACK);

    peer.write_bytes(&[EOT]).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], ACK);

    let (received, report) = receiver.await.unwrap().unwrap();
    assert_eq!(received.len(), 2 * BLOCK_SIZE, "duplicate must not be written twice");
    assert_eq!(&received[..9], b"block one");
    assert_eq!(&received[BLOCK_SIZE..BLOCK_SIZE + 9], b"block two");
    assert_eq!(report.packets, 2);
}

#[tokio::test]
async fn test_out_of_sequence_block_naked_not_resynced() {
    let (mut rx_end, mut peer) = open_pair("skip").await;

    let config = fast_config(XmodemVariant::Crc);
    let receiver = tokio::spawn(async move { receive_stream(&mut rx_end, &config).await });

    let handshake = read_exact_from(&mut peer, 1).await;
    assert_eq!(handshake[0], b'C');

    // Block 3 where block 1 is expected: NAK, never resynchronize
    peer.write_bytes(&crc_packet(3, b"wrong")).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], NAK);

    peer.write_bytes(&crc_packet(1, b"right")).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], ACK);

    peer.write_bytes(&[EOT]).await.unwrap();
    assert_eq!(read_exact_from(&mut peer, 1).await[0], ACK);

    let (received, _) = receiver.await.unwrap().unwrap();
    assert_eq!(&received[..5], b"right");
}

#[tokio::test]
async fn test_transfer_through_handle_table() {
    let (near, mut far) = LoopbackTransport::pair("table-xfer");
    far.open().await.unwrap();

    let cell = Mutex::new(Some(near));
    let table = PortHandleTable::new(move |target: &str| {
        cell.lock()
            .take()
            .map(|t| Box::new(t) as Box<dyn PortTransport>)
            .ok_or_else(|| TransportError::NotFound(target.to_string()))
    });
    let handle = table.open("table-xfer", OpenMode::default()).await.unwrap();

    let data = payload(300);
    let expected = data.clone();
    let config = fast_config(XmodemVariant::Crc);

    let receiver = tokio::spawn(async move { receive_stream(&mut far, &config).await });

    let report = table.send_xmodem(handle, &data, &config).await.unwrap();
    assert_eq!(report.bytes_transferred, 300);
    assert_eq!(report.packets, 3);

    let (received, _) = receiver.await.unwrap().unwrap();
    assert_eq!(&received[..300], &expected[..]);

    table.close(handle).await.unwrap();
    // A closed handle refuses further transfers
    let result = table.send_xmodem(handle, &expected, &config).await;
    assert!(matches!(result, Err(TransferError::Transport(TransportError::NotOpen))));
}

#[tokio::test]
async fn test_close_unblocks_inflight_transfer() {
    let (near, mut far) = LoopbackTransport::pair("close-mid");
    far.open().await.unwrap();

    let cell = Mutex::new(Some(near));
    let table = Arc::new(PortHandleTable::new(move |target: &str| {
        cell.lock()
            .take()
            .map(|t| Box::new(t) as Box<dyn PortTransport>)
            .ok_or_else(|| TransportError::NotFound(target.to_string()))
    }));
    let handle = table.open("close-mid", OpenMode::default()).await.unwrap();

    // The receiver never answers, so left alone the sender would sit in
    // its handshake loop for ~20 seconds
    let config = XmodemConfig::new(XmodemVariant::Crc)
        .timeouts(Duration::from_secs(2))
        .max_retries(10);
    let transfer = {
        let table = table.clone();
        tokio::spawn(async move { table.send_xmodem(handle, &[0x42; 256], &config).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_millis(500), table.close(handle))
        .await
        .expect("close must not wait out the in-flight transfer")
        .unwrap();

    let result = transfer.await.unwrap();
    assert!(matches!(result, Err(TransferError::Transport(_))));
}

#[tokio::test]
async fn test_unacked_eot_reports_incomplete_termination() {
    let (mut tx_end, mut peer) = open_pair("eot").await;
    let data = payload(100);

    let config = XmodemConfig::new(XmodemVariant::Checksum)
        .timeouts(Duration::from_millis(100))
        .max_retries(2);
    let sender = tokio::spawn(async move { send_stream(&mut tx_end, &data, &config).await });

    peer.write_bytes(&[NAK]).await.unwrap();
    let packet = read_exact_from(&mut peer, 3 + BLOCK_SIZE + 1).await;
    assert_eq!(packet[1], 1);
    peer.write_bytes(&[ACK]).await.unwrap();
    // Swallow the EOTs without ever acknowledging them

    let result = sender.await.unwrap();
    match result {
        Err(TransferError::IncompleteTermination { bytes_transferred }) => {
            assert_eq!(bytes_transferred, 100, "payload was delivered before the handshake failed");
        }
        other => panic!("expected IncompleteTermination, got {other:?}"),
    }
}
