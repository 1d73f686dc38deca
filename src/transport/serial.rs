//! Hardware serial port transport

use super::{LineStatus, PortTransport, TransportError};
use crate::config::{DataBits, FlowControl, LineConfig, Parity, StopBits};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Default per-read timeout applied until the session overrides it
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port transport backed by the `serialport` crate
pub struct SerialTransport {
    target: String,
    config: LineConfig,
    port: Arc<Mutex<Option<Box<dyn serialport::SerialPort>>>>,
}

impl SerialTransport {
    /// Create an unopened transport for the named device (e.g. `COM3`,
    /// `/dev/ttyUSB0`)
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            config: LineConfig::default(),
            port: Arc::new(Mutex::new(None)),
        }
    }

    fn map_open_error(&self, e: &serialport::Error) -> TransportError {
        match e.kind() {
            serialport::ErrorKind::NoDevice => TransportError::NotFound(self.target.clone()),
            serialport::ErrorKind::Io(io_kind) => match io_kind {
                std::io::ErrorKind::PermissionDenied => {
                    TransportError::PermissionDenied(self.target.clone())
                }
                std::io::ErrorKind::AddrInUse | std::io::ErrorKind::WouldBlock => {
                    TransportError::Busy(self.target.clone())
                }
                _ => TransportError::Io(std::io::Error::new(io_kind, e.to_string())),
            },
            _ => TransportError::Io(std::io::Error::other(e.to_string())),
        }
    }

    /// Translate a full line configuration into `serialport` settings,
    /// rejecting what the crate cannot express.
    fn backend_settings(
        config: &LineConfig,
    ) -> Result<
        (
            u32,
            serialport::DataBits,
            serialport::StopBits,
            serialport::Parity,
            serialport::FlowControl,
        ),
        TransportError,
    > {
        let data_bits = match config.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(TransportError::Unsupported(
                    "1.5 stop bits are not supported by this backend".into(),
                ))
            }
        };

        let parity = match config.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
            Parity::Mark | Parity::Space => {
                return Err(TransportError::Unsupported(
                    "mark/space parity is not supported by this backend".into(),
                ))
            }
        };

        let flow_control = match config.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software { .. } => serialport::FlowControl::Software,
        };

        Ok((config.baud.as_u32(), data_bits, stop_bits, parity, flow_control))
    }
}

#[async_trait]
impl PortTransport for SerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let (baud, data_bits, stop_bits, parity, flow_control) =
            Self::backend_settings(&self.config)?;

        let port = serialport::new(&self.target, baud)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(|e| self.map_open_error(&e))?;

        tracing::debug!("Opened serial device {}", self.target);
        *self.port.lock() = Some(port);
        Ok(())
    }

    async fn apply_config(&mut self, config: &LineConfig) -> Result<(), TransportError> {
        let (baud, data_bits, stop_bits, parity, flow_control) = Self::backend_settings(config)?;

        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let map = |e: serialport::Error| TransportError::Io(std::io::Error::other(e.to_string()));
        port.set_baud_rate(baud).map_err(map)?;
        port.set_data_bits(data_bits).map_err(map)?;
        port.set_stop_bits(stop_bits).map_err(map)?;
        port.set_parity(parity).map_err(map)?;
        port.set_flow_control(flow_control).map_err(map)?;

        self.config = *config;
        Ok(())
    }

    async fn read_bytes(&mut self, max: usize, timeout: Duration) -> Result<Bytes, TransportError> {
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;

        port.set_timeout(timeout)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;

        let mut buffer = vec![0u8; max.min(4096)];
        match port.read(&mut buffer) {
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => {
                buffer.truncate(n);
                Ok(Bytes::from(buffer))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Bytes::new()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        use std::io::Write;

        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let written = port.write(data).map_err(TransportError::Io)?;
        port.flush().map_err(TransportError::Io)?;
        Ok(written)
    }

    fn status(&self) -> Result<LineStatus, TransportError> {
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let map = |e: serialport::Error| match e.kind() {
            serialport::ErrorKind::NoDevice => TransportError::Disconnected,
            _ => TransportError::Io(std::io::Error::other(e.to_string())),
        };

        Ok(LineStatus {
            cts: port.read_clear_to_send().map_err(map)?,
            dsr: port.read_data_set_ready().map_err(map)?,
            ri: port.read_ring_indicator().map_err(map)?,
            cd: port.read_carrier_detect().map_err(map)?,
            // The serialport crate exposes no break detection
            break_received: false,
        })
    }

    async fn set_control_lines(&mut self, rts: bool, dtr: bool) -> Result<(), TransportError> {
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let map = |e: serialport::Error| TransportError::Io(std::io::Error::other(e.to_string()));
        port.write_request_to_send(rts).map_err(map)?;
        port.write_data_terminal_ready(dtr).map_err(map)?;
        Ok(())
    }

    async fn set_break(&mut self, on: bool) -> Result<(), TransportError> {
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let result = if on { port.set_break() } else { port.clear_break() };
        result.map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))
    }

    async fn clear_buffers(&mut self, input: bool, output: bool) -> Result<(), TransportError> {
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let buffer = match (input, output) {
            (true, true) => Some(serialport::ClearBuffer::All),
            (true, false) => Some(serialport::ClearBuffer::Input),
            (false, true) => Some(serialport::ClearBuffer::Output),
            (false, false) => None,
        };
        if let Some(buffer) = buffer {
            port.clear(buffer)
                .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        }
        Ok(())
    }

    fn queued_bytes(&self) -> Result<(usize, usize), TransportError> {
        let guard = self.port.lock();
        let port = guard.as_ref().ok_or(TransportError::NotOpen)?;

        let map = |e: serialport::Error| TransportError::Io(std::io::Error::other(e.to_string()));
        let input = port.bytes_to_read().map_err(map)? as usize;
        let output = port.bytes_to_write().map_err(map)? as usize;
        Ok((input, output))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let previous = self.port.lock().take();
        if previous.is_none() {
            return Err(TransportError::NotOpen);
        }
        tracing::debug!("Closed serial device {}", self.target);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.lock().is_some()
    }

    fn description(&self) -> String {
        format!("serial:{}", self.target)
    }
}

/// List the serial devices visible to the platform
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
