//! Transport layer for half-duplex serial buses
//!
//! A transport owns one physical byte channel (UART, USB-RS485 adapter) and,
//! optionally, the direction-control output of its transceiver. Everything
//! above this layer is byte-oriented and protocol-agnostic.

mod serial;

pub use serial::{list_ports, SerialTransport};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl SerialParity {
    /// Number of parity bits on the wire
    pub fn bits(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Odd | Self::Even => 1,
        }
    }

    fn letter(self) -> char {
        match self {
            Self::None => 'N',
            Self::Odd => 'O',
            Self::Even => 'E',
        }
    }
}

impl FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity '{other}'")),
        }
    }
}

/// Modem control line wired to the transceiver's driver-enable input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlLine {
    /// Request To Send
    #[default]
    Rts,
    /// Data Terminal Ready
    Dtr,
}

/// Direction-control output of a half-duplex transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionControl {
    /// Line driving the transceiver
    pub line: ControlLine,
    /// Line level that enables the driver (transmit)
    pub transmit_level: bool,
    /// Hold time after switching to transmit, before the first byte is written
    pub settle_us: u64,
}

impl Default for DirectionControl {
    fn default() -> Self {
        Self {
            line: ControlLine::Rts,
            transmit_level: true,
            settle_us: 100,
        }
    }
}

impl DirectionControl {
    /// Direction control on the given line, active high
    pub fn new(line: ControlLine) -> Self {
        Self {
            line,
            ..Self::default()
        }
    }

    /// Drive the line low to transmit
    #[must_use]
    pub fn inverted(mut self) -> Self {
        self.transmit_level = !self.transmit_level;
        self
    }

    /// Set the settle time
    #[must_use]
    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle_us = u64::try_from(settle.as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// Line level for a direction state
    pub fn level_for(&self, state: DirectionState) -> bool {
        match state {
            DirectionState::Transmit => self.transmit_level,
            DirectionState::Receive => !self.transmit_level,
        }
    }

    /// Settle time as a duration
    pub fn settle_time(&self) -> Duration {
        Duration::from_micros(self.settle_us)
    }
}

/// Physical channel parameters. Immutable once a transport is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Port name (e.g. /dev/ttyUSB0, COM3)
    pub port: String,
    /// Baud rate in bits per second
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Direction-control line, if the transceiver needs one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<DirectionControl>,
    /// Soft cap on the size of one received frame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_buffer_limit: Option<usize>,
}

impl ChannelConfig {
    /// Create a new 8N1 channel configuration
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            direction: None,
            read_buffer_limit: None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the direction-control line
    #[must_use]
    pub fn direction(mut self, control: DirectionControl) -> Self {
        self.direction = Some(control);
        self
    }

    /// Set the receive soft limit
    #[must_use]
    pub fn read_buffer_limit(mut self, limit: usize) -> Self {
        self.read_buffer_limit = Some(limit);
        self
    }

    /// Check that the parameters describe a usable channel
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.baud_rate == 0 {
            return Err(TransportError::Configuration(
                "baud rate must be greater than zero".to_string(),
            ));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(TransportError::Configuration(format!(
                "unsupported data bits: {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(TransportError::Configuration(format!(
                "unsupported stop bits: {}",
                self.stop_bits
            )));
        }
        if self.read_buffer_limit == Some(0) {
            return Err(TransportError::Configuration(
                "read buffer limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Bits on the wire per character (start + data + parity + stop)
    pub fn bits_per_character(&self) -> u32 {
        1 + u32::from(self.data_bits) + u32::from(self.parity.bits()) + u32::from(self.stop_bits)
    }

    /// Short description, e.g. `/dev/ttyUSB0 @ 9600 baud (8N1)`
    pub fn describe(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{})",
            self.port,
            self.baud_rate,
            self.data_bits,
            self.parity.letter(),
            self.stop_bits
        )
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 9600)
    }
}

/// State of the transceiver direction line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DirectionState {
    /// Driver disabled, listening
    #[default]
    Receive,
    /// Driver enabled
    Transmit,
}

impl fmt::Display for DirectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receive => write!(f, "RX"),
            Self::Transmit => write!(f, "TX"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Channel parameters rejected
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Hardware did not confirm transmission in time
    #[error("Transmit not confirmed within {0:?}")]
    TransmitTimeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Line closed by the other end or the driver
    #[error("Disconnected")]
    Disconnected,
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read
    pub bytes_received: u64,
    /// Bytes discarded by input flushes
    pub bytes_flushed: u64,
    /// Write calls
    pub writes: u64,
    /// Direction line changes
    pub direction_switches: u64,
}

/// Byte-level access to one physical bus
///
/// Reads and writes suspend the calling task; none of them blocks a thread.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BusTransport: Send {
    /// Channel parameters this transport was built with
    fn channel(&self) -> ChannelConfig;

    /// Hand `data` to the transmit buffer. Does not wait for the wire.
    async fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Wait until the last bit has left the transmitter, or fail with
    /// [`TransportError::TransmitTimeout`]
    async fn wait_for_transmit_complete(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Bytes that arrived within `timeout`. An empty result is a timeout.
    async fn read_available(&mut self, timeout: Duration) -> Result<Bytes, TransportError>;

    /// Drive the direction line. Takes effect immediately.
    fn set_direction(&mut self, state: DirectionState) -> Result<(), TransportError>;

    /// Current direction line state
    fn direction(&self) -> DirectionState;

    /// Discard buffered input and anything arriving within `grace`.
    /// Returns the number of bytes dropped.
    async fn flush_input(&mut self, grace: Duration) -> Result<usize, TransportError>;

    /// Get statistics
    fn stats(&self) -> TransportStats;
}
