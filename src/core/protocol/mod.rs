//! Protocol helpers
//!
//! - Framing: frame boundaries, structural validation and the frame assembler
//! - Checksum algorithms (XOR, LRC, CRC-16 variants)
//! - Modbus RTU request building and response checks

pub mod checksum;
pub mod framing;
pub mod modbus;

pub use checksum::{calculate as calc_checksum, ChecksumType};
pub use framing::{Assembly, Frame, FrameAssembler, FrameBoundary, FrameProfile};
pub use modbus::{build_rtu_request, check_response, FunctionCode, ModbusError, RtuResponse};
