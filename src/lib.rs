//! # Buslink Core Library
//!
//! Master side of a half-duplex RS-485/UART bus:
//! - Transport over serial ports with RTS/DTR direction control
//! - Timing derived from channel parameters (inter-frame silence)
//! - Frame assembly by bus silence, terminators or Modbus RTU headers
//! - Serialized transactions with retries, timeouts and cancellation
//! - Poll batches and traffic logging
//! - A simulated bus for tests and demos
//!
//! ## Example
//!
//! ```rust,no_run
//! use buslink_core::{Bus, BusOptions, ChannelConfig, DirectionControl, FrameProfile, SerialTransport};
//! use buslink_core::core::protocol::modbus::{self, FunctionCode};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let channel = ChannelConfig::new("/dev/ttyUSB0", 9600).direction(DirectionControl::default());
//!     let transport = SerialTransport::open(channel)?;
//!     let bus = Bus::new(transport, BusOptions::default().frame(FrameProfile::modbus_rtu()))?;
//!
//!     let request = modbus::build_rtu_request(1, FunctionCode::ReadHoldingRegisters, 0, 2);
//!     let response = bus.send_receive(request.clone()).await?;
//!     let registers = modbus::check_response(&request, &response)?.registers();
//!     println!("registers: {registers:?}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{ConfigError, LinkConfig};
pub use crate::core::batch::{BatchResult, ErrorStrategy, PollBatch};
pub use crate::core::logger::{LogEntry, LogFormat, TrafficLogger};
pub use crate::core::protocol::framing::{Frame, FrameBoundary, FrameProfile};
pub use crate::core::retry::RetryPolicy;
pub use crate::core::simulator::{DeviceTemplates, SimulatedBus, VirtualDevice};
pub use crate::core::timing::TimingProfile;
pub use crate::core::transaction::{
    Bus, BusOptions, BusStats, FailureKind, Transaction, TransactionError, TransactionState,
};
pub use crate::core::transport::{
    BusTransport, ChannelConfig, DirectionControl, DirectionState, SerialParity, SerialTransport,
    TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
