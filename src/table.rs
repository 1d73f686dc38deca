//! Port handle table: every open session lives here behind an opaque,
//! generation-checked handle
//!
//! Handles encode a table slot plus a generation counter. Closing a session
//! bumps its slot's generation, so a stale handle held past `close` fails
//! lookup with `InvalidHandle` instead of touching a recycled slot.

use crate::config::{BaudRate, DataBits, FlowControl, LineConfig, OpenMode, Parity, StopBits};
use crate::error::PortError;
use crate::events::{spawn_watcher, EventMask, ListenerSlot, PortListener, Watcher};
use crate::protocol::{TransferError, TransferReport, XmodemConfig};
use crate::transport::{PortTransport, SerialTransport, TransportError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

/// Read timeout applied to a session until the caller overrides it
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Opaque token referencing one open port session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(u64);

impl PortHandle {
    fn new(index: usize, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw token value, for logging and FFI-style plumbing
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Per-session I/O counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Bytes written through the session
    pub bytes_sent: u64,
    /// Bytes read through the session
    pub bytes_received: u64,
    /// Write operations
    pub writes: u64,
    /// Read operations that returned data
    pub reads: u64,
}

/// Raised by `close` so a long-running transfer holding the transport lock
/// observes teardown without `close` having to wait the transfer out
struct CloseSignal {
    tx: tokio::sync::watch::Sender<bool>,
}

impl CloseSignal {
    fn new() -> Self {
        Self { tx: tokio::sync::watch::Sender::new(false) }
    }

    fn fire(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One open port session; owned exclusively by the table
struct PortSession {
    target: String,
    mode: OpenMode,
    config: RwLock<LineConfig>,
    read_timeout: RwLock<Duration>,
    control_lines: RwLock<(bool, bool)>, // (rts, dtr) as last driven
    transport: Arc<tokio::sync::Mutex<Box<dyn PortTransport>>>,
    listener_slot: Arc<ListenerSlot>,
    watcher: Mutex<Option<Watcher>>,
    close_signal: CloseSignal,
    stats: RwLock<SessionStats>,
}

struct Slot {
    generation: u32,
    session: Option<Arc<PortSession>>,
}

/// Creates transports from target names; the seam that lets hardware and
/// loopback backends interchange underneath the table
pub trait TransportFactory: Send + Sync {
    /// Create an unopened transport for `target`
    fn create(&self, target: &str) -> Result<Box<dyn PortTransport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&str) -> Result<Box<dyn PortTransport>, TransportError> + Send + Sync,
{
    fn create(&self, target: &str) -> Result<Box<dyn PortTransport>, TransportError> {
        self(target)
    }
}

/// Factory opening hardware serial devices by name
pub struct SerialFactory;

impl TransportFactory for SerialFactory {
    fn create(&self, target: &str) -> Result<Box<dyn PortTransport>, TransportError> {
        Ok(Box::new(SerialTransport::new(target)))
    }
}

/// Arena of open port sessions indexed by opaque handle
pub struct PortHandleTable {
    factory: Box<dyn TransportFactory>,
    slots: RwLock<Vec<Slot>>,
}

impl PortHandleTable {
    /// Create a table whose sessions come from `factory`
    pub fn new(factory: impl TransportFactory + 'static) -> Self {
        Self { factory: Box::new(factory), slots: RwLock::new(Vec::new()) }
    }

    /// Create a table backed by hardware serial devices
    pub fn with_serial_backend() -> Self {
        Self::new(SerialFactory)
    }

    fn session(&self, handle: PortHandle) -> Result<Arc<PortSession>, PortError> {
        let slots = self.slots.read();
        let slot = slots.get(handle.index()).ok_or(PortError::InvalidHandle)?;
        if slot.generation != handle.generation() {
            return Err(PortError::InvalidHandle);
        }
        slot.session.clone().ok_or(PortError::InvalidHandle)
    }

    /// Whether opening `target` with `mode` conflicts with a live session
    fn exclusivity_conflict(slots: &[Slot], target: &str, mode: OpenMode) -> bool {
        slots.iter().any(|slot| {
            slot.session.as_ref().is_some_and(|session| {
                session.target == target && (mode.exclusive || session.mode.exclusive)
            })
        })
    }

    /// Open a session on `target`
    ///
    /// Fails with `PortUnavailable` if the device cannot be claimed or if
    /// the requested exclusivity conflicts with an existing session on the
    /// same target.
    pub async fn open(&self, target: &str, mode: OpenMode) -> Result<PortHandle, PortError> {
        {
            let slots = self.slots.read();
            if Self::exclusivity_conflict(&slots, target, mode) {
                return Err(PortError::PortUnavailable(format!(
                    "{target}: held by another session"
                )));
            }
        }

        let mut transport = self.factory.create(target)?;
        transport.open().await?;

        let session = Arc::new(PortSession {
            target: target.to_string(),
            mode,
            config: RwLock::new(LineConfig::default()),
            read_timeout: RwLock::new(DEFAULT_READ_TIMEOUT),
            control_lines: RwLock::new((false, false)),
            transport: Arc::new(tokio::sync::Mutex::new(transport)),
            listener_slot: ListenerSlot::new(),
            watcher: Mutex::new(None),
            close_signal: CloseSignal::new(),
            stats: RwLock::new(SessionStats::default()),
        });

        let handle = {
            let mut slots = self.slots.write();
            // A racing open may have claimed the target while ours was opening
            if Self::exclusivity_conflict(&slots, target, mode) {
                None
            } else {
                Some(match slots.iter().position(|slot| slot.session.is_none()) {
                    Some(index) => {
                        let slot = &mut slots[index];
                        slot.session = Some(session.clone());
                        PortHandle::new(index, slot.generation)
                    }
                    None => {
                        slots.push(Slot { generation: 0, session: Some(session.clone()) });
                        PortHandle::new(slots.len() - 1, 0)
                    }
                })
            }
        };

        let Some(handle) = handle else {
            // The device was claimed and opened for nothing; release it
            // before reporting the conflict
            let mut transport = session.transport.lock().await;
            let _ = transport.close().await;
            return Err(PortError::PortUnavailable(format!(
                "{target}: held by another session"
            )));
        };

        tracing::debug!("Opened {target} as handle {:#x}", handle.raw());
        Ok(handle)
    }

    /// Reconfigure framing and baud rate
    ///
    /// The combination is validated first and applied as a whole; if the
    /// backend rejects it the previous configuration is restored, so either
    /// the full configuration takes effect or none of it does.
    pub async fn configure_data(
        &self,
        handle: PortHandle,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
        baud: BaudRate,
    ) -> Result<(), PortError> {
        let session = self.session(handle)?;

        let previous = *session.config.read();
        let requested = LineConfig { baud, data_bits, stop_bits, parity, ..previous };
        requested.validate().map_err(PortError::InvalidConfiguration)?;

        let mut transport = session.transport.lock().await;
        if let Err(e) = transport.apply_config(&requested).await {
            let _ = transport.apply_config(&previous).await;
            return Err(e.into());
        }

        *session.config.write() = requested;
        Ok(())
    }

    /// Reconfigure flow control and drive the initial RTS/DTR states
    pub async fn configure_control(
        &self,
        handle: PortHandle,
        flow_control: FlowControl,
        rts: bool,
        dtr: bool,
    ) -> Result<(), PortError> {
        let session = self.session(handle)?;

        let previous = *session.config.read();
        let requested = LineConfig { flow_control, ..previous };
        requested.validate().map_err(PortError::InvalidConfiguration)?;

        let mut transport = session.transport.lock().await;
        if let Err(e) = transport.apply_config(&requested).await {
            let _ = transport.apply_config(&previous).await;
            return Err(e.into());
        }
        transport.set_control_lines(rts, dtr).await?;

        *session.config.write() = requested;
        *session.control_lines.write() = (rts, dtr);
        Ok(())
    }

    /// Write raw bytes, optionally pacing them with a per-byte delay
    pub async fn write(
        &self,
        handle: PortHandle,
        data: &[u8],
        per_byte_delay: Option<Duration>,
    ) -> Result<usize, PortError> {
        let session = self.session(handle)?;
        if !session.mode.write {
            return Err(PortError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "session not open for writing",
            )));
        }

        let written = match per_byte_delay {
            Some(delay) if !delay.is_zero() => {
                let mut written = 0;
                for byte in data {
                    let mut transport = session.transport.lock().await;
                    written += transport.write_bytes(std::slice::from_ref(byte)).await?;
                    drop(transport);
                    tokio::time::sleep(delay).await;
                }
                written
            }
            _ => {
                let mut transport = session.transport.lock().await;
                transport.write_bytes(data).await?
            }
        };

        let mut stats = session.stats.write();
        stats.bytes_sent += written as u64;
        stats.writes += 1;
        Ok(written)
    }

    /// Read up to `max` raw bytes, honoring the session read timeout;
    /// returns an empty buffer on timeout
    pub async fn read(&self, handle: PortHandle, max: usize) -> Result<Bytes, PortError> {
        let session = self.session(handle)?;
        if !session.mode.read {
            return Err(PortError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "session not open for reading",
            )));
        }

        let timeout = *session.read_timeout.read();
        let data = {
            let mut transport = session.transport.lock().await;
            transport.read_bytes(max, timeout).await?
        };

        if !data.is_empty() {
            let mut stats = session.stats.write();
            stats.bytes_received += data.len() as u64;
            stats.reads += 1;
        }
        Ok(data)
    }

    /// Override the session read timeout
    pub fn set_read_timeout(&self, handle: PortHandle, timeout: Duration) -> Result<(), PortError> {
        let session = self.session(handle)?;
        *session.read_timeout.write() = timeout;
        Ok(())
    }

    /// Discard buffered input and/or output
    pub async fn clear_buffers(
        &self,
        handle: PortHandle,
        input: bool,
        output: bool,
    ) -> Result<(), PortError> {
        let session = self.session(handle)?;
        let mut transport = session.transport.lock().await;
        transport.clear_buffers(input, output).await?;
        Ok(())
    }

    /// Bytes waiting in the (input, output) buffers of this session
    pub async fn queued_bytes(&self, handle: PortHandle) -> Result<(usize, usize), PortError> {
        let session = self.session(handle)?;
        let transport = session.transport.lock().await;
        Ok(transport.queued_bytes()?)
    }

    /// Drive the RTS output
    pub async fn set_rts(&self, handle: PortHandle, on: bool) -> Result<(), PortError> {
        let session = self.session(handle)?;
        let dtr = session.control_lines.read().1;
        let mut transport = session.transport.lock().await;
        transport.set_control_lines(on, dtr).await?;
        session.control_lines.write().0 = on;
        Ok(())
    }

    /// Drive the DTR output
    pub async fn set_dtr(&self, handle: PortHandle, on: bool) -> Result<(), PortError> {
        let session = self.session(handle)?;
        let rts = session.control_lines.read().0;
        let mut transport = session.transport.lock().await;
        transport.set_control_lines(rts, on).await?;
        session.control_lines.write().1 = on;
        Ok(())
    }

    /// Hold a break condition for approximately `duration`, then clear it
    ///
    /// The raise/wait/clear scope runs as a detached task, so a caller that
    /// stops awaiting mid-wait cannot leave the line stuck in break.
    pub async fn send_break(&self, handle: PortHandle, duration: Duration) -> Result<(), PortError> {
        let session = self.session(handle)?;

        let scope = tokio::spawn(async move {
            {
                let mut transport = session.transport.lock().await;
                transport.set_break(true).await?;
            }

            tokio::time::sleep(duration).await;

            let mut transport = session.transport.lock().await;
            transport.set_break(false).await?;
            Ok::<(), PortError>(())
        });

        match scope.await {
            Ok(result) => result,
            Err(e) => Err(PortError::Io(std::io::Error::other(e.to_string()))),
        }
    }

    /// Current session statistics
    pub fn stats(&self, handle: PortHandle) -> Result<SessionStats, PortError> {
        Ok(*self.session(handle)?.stats.read())
    }

    /// Current line configuration
    pub fn config(&self, handle: PortHandle) -> Result<LineConfig, PortError> {
        Ok(*self.session(handle)?.config.read())
    }

    /// Send `data` as an XMODEM stream over this handle's transport
    ///
    /// Holds the transport for the whole transfer, so raw I/O and status
    /// polling on the same handle wait until it finishes. A stale handle
    /// surfaces as a `Transport` error; closing the handle mid-transfer
    /// fails the transfer promptly with a transport I/O error.
    pub async fn send_xmodem(
        &self,
        handle: PortHandle,
        data: &[u8],
        config: &XmodemConfig,
    ) -> Result<TransferReport, TransferError> {
        let session = self
            .session(handle)
            .map_err(|_| TransferError::Transport(TransportError::NotOpen))?;

        let mut transport = tokio::select! {
            guard = session.transport.lock() => guard,
            () = session.close_signal.wait() => return Err(closed_mid_transfer()),
        };
        tokio::select! {
            result = crate::protocol::send_stream(transport.as_mut(), data, config) => result,
            () = session.close_signal.wait() => Err(closed_mid_transfer()),
        }
    }

    /// Receive an XMODEM stream over this handle's transport
    ///
    /// Returns the payload in whole 128-byte blocks; callers truncate to a
    /// known length. Closing the handle mid-transfer fails the transfer
    /// promptly with a transport I/O error.
    pub async fn receive_xmodem(
        &self,
        handle: PortHandle,
        config: &XmodemConfig,
    ) -> Result<(Bytes, TransferReport), TransferError> {
        let session = self
            .session(handle)
            .map_err(|_| TransferError::Transport(TransportError::NotOpen))?;

        let mut transport = tokio::select! {
            guard = session.transport.lock() => guard,
            () = session.close_signal.wait() => return Err(closed_mid_transfer()),
        };
        tokio::select! {
            result = crate::protocol::receive_stream(transport.as_mut(), config) => result,
            () = session.close_signal.wait() => Err(closed_mid_transfer()),
        }
    }

    /// Install a line/presence listener, replacing any previous one, and
    /// start the watcher for this handle if it is not already running
    pub fn register_listener(
        &self,
        handle: PortHandle,
        listener: Box<dyn PortListener>,
    ) -> Result<(), PortError> {
        let session = self.session(handle)?;

        if !session.listener_slot.register(listener) {
            return Err(PortError::DeviceNotPresent(session.target.clone()));
        }

        let mut watcher = session.watcher.lock();
        if watcher.is_none() {
            *watcher = Some(spawn_watcher(
                session.transport.clone(),
                session.listener_slot.clone(),
                session.target.clone(),
            ));
        }
        Ok(())
    }

    /// Narrow or widen the set of signals delivered to the listener; takes
    /// effect atomically with respect to dispatch
    pub fn set_event_mask(&self, handle: PortHandle, mask: EventMask) -> Result<(), PortError> {
        let session = self.session(handle)?;
        session.listener_slot.set_mask(mask);
        Ok(())
    }

    /// Remove the listener and stop the watcher
    ///
    /// Synchronous barrier: after this returns no callback is in flight and
    /// none will be invoked. Unregistering with no listener installed is a
    /// no-op, not an error.
    pub fn unregister_listener(&self, handle: PortHandle) -> Result<(), PortError> {
        let session = self.session(handle)?;
        session.listener_slot.unregister();
        if let Some(watcher) = session.watcher.lock().take() {
            watcher.stop();
        }
        Ok(())
    }

    /// Close the session, releasing the transport and any watcher
    ///
    /// A second close of the same handle fails with `InvalidHandle`.
    pub async fn close(&self, handle: PortHandle) -> Result<(), PortError> {
        let session = {
            let mut slots = self.slots.write();
            let slot = slots.get_mut(handle.index()).ok_or(PortError::InvalidHandle)?;
            if slot.generation != handle.generation() {
                return Err(PortError::InvalidHandle);
            }
            let session = slot.session.take().ok_or(PortError::InvalidHandle)?;
            // Stale copies of this handle must never resolve again
            slot.generation = slot.generation.wrapping_add(1);
            session
        };

        // Fail any in-flight transfer before waiting for the transport lock,
        // or close would queue behind the transfer's full retry budget
        session.close_signal.fire();

        session.listener_slot.unregister();
        if let Some(watcher) = session.watcher.lock().take() {
            watcher.stop();
        }

        let mut transport = session.transport.lock().await;
        transport.close().await?;
        tracing::debug!("Closed {} (handle {:#x})", session.target, handle.raw());
        Ok(())
    }

    /// Number of currently open sessions
    pub fn open_sessions(&self) -> usize {
        self.slots.read().iter().filter(|slot| slot.session.is_some()).count()
    }
}

/// Transfer error reported when `close` tears the session down mid-transfer
fn closed_mid_transfer() -> TransferError {
    TransferError::Transport(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "session closed",
    )))
}

/// List the serial devices visible to the platform
pub fn available_ports() -> Result<Vec<String>, PortError> {
    Ok(crate::transport::available_ports()?)
}
