//! Line configuration for a serial port session
//!
//! Configuration is validated before it touches a device: rejected
//! combinations surface `InvalidConfiguration` and leave the previous
//! settings intact.

use serde::{Deserialize, Serialize};

/// Baud rate selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    /// 1200 baud
    B1200,
    /// 2400 baud
    B2400,
    /// 4800 baud
    B4800,
    /// 9600 baud
    B9600,
    /// 19200 baud
    B19200,
    /// 38400 baud
    B38400,
    /// 57600 baud
    B57600,
    /// 115200 baud
    B115200,
    /// 230400 baud
    B230400,
    /// Non-standard rate in baud; must be positive
    Custom(u32),
}

impl BaudRate {
    /// Rate in baud
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::B1200 => 1200,
            Self::B2400 => 2400,
            Self::B4800 => 4800,
            Self::B9600 => 9600,
            Self::B19200 => 19200,
            Self::B38400 => 38400,
            Self::B57600 => 57600,
            Self::B115200 => 115_200,
            Self::B230400 => 230_400,
            Self::Custom(rate) => *rate,
        }
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        Self::B115200
    }
}

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataBits {
    /// 5 data bits
    Five,
    /// 6 data bits
    Six,
    /// 7 data bits
    Seven,
    /// 8 data bits
    #[default]
    Eight,
}

/// Number of stop bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    /// 1 stop bit
    #[default]
    One,
    /// 1.5 stop bits (5-data-bit framing only)
    OnePointFive,
    /// 2 stop bits
    Two,
}

/// Parity bit mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
    /// Parity bit always 1
    Mark,
    /// Parity bit always 0
    Space,
}

/// Flow control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF) with configurable control bytes
    Software {
        /// Resume-transmission byte (conventionally 0x11)
        xon: u8,
        /// Pause-transmission byte (conventionally 0x13)
        xoff: u8,
    },
}

impl FlowControl {
    /// Software flow control with the conventional DC1/DC3 bytes
    pub fn software() -> Self {
        Self::Software { xon: 0x11, xoff: 0x13 }
    }
}

/// Access mode requested when opening a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenMode {
    /// Open for reading
    pub read: bool,
    /// Open for writing
    pub write: bool,
    /// Refuse to share the device with any other session
    pub exclusive: bool,
}

impl Default for OpenMode {
    fn default() -> Self {
        Self { read: true, write: true, exclusive: false }
    }
}

impl OpenMode {
    /// Read/write, exclusive access
    pub fn exclusive() -> Self {
        Self { read: true, write: true, exclusive: true }
    }
}

/// Full line configuration for one port session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineConfig {
    /// Baud rate
    pub baud: BaudRate,
    /// Data bits
    pub data_bits: DataBits,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Parity
    pub parity: Parity,
    /// Flow control
    pub flow_control: FlowControl,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            baud: BaudRate::default(),
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            parity: Parity::default(),
            flow_control: FlowControl::default(),
        }
    }
}

impl LineConfig {
    /// Create a configuration at the given baud rate, 8N1, no flow control
    pub fn new(baud: BaudRate) -> Self {
        Self { baud, ..Self::default() }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: DataBits) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: StopBits) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: FlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Validate the combination without touching any device
    ///
    /// Rules: 5 data bits cannot pair with 2 stop bits, 1.5 stop bits pair
    /// only with 5 data bits, a custom baud rate must be positive, and
    /// software flow control needs distinct non-zero XON/XOFF bytes.
    pub fn validate(&self) -> Result<(), String> {
        if self.data_bits == DataBits::Five && self.stop_bits == StopBits::Two {
            return Err("5 data bits cannot be combined with 2 stop bits".into());
        }
        if self.stop_bits == StopBits::OnePointFive && self.data_bits != DataBits::Five {
            return Err("1.5 stop bits require 5 data bits".into());
        }
        if let BaudRate::Custom(rate) = self.baud {
            if rate == 0 {
                return Err("custom baud rate must be positive".into());
            }
        }
        if let FlowControl::Software { xon, xoff } = self.flow_control {
            if xon == 0 || xoff == 0 {
                return Err("XON/XOFF bytes must be non-zero".into());
            }
            if xon == xoff {
                return Err("XON and XOFF bytes must differ".into());
            }
        }
        Ok(())
    }
}
