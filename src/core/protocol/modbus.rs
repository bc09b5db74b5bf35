//! Modbus RTU helpers
//!
//! The bus engine is protocol-agnostic; these helpers sit on top of it for
//! the common case of polling Modbus RTU slaves:
//!
//! - request builders with CRC
//! - expected response length, used to close a frame before the silence
//! - response header validation (CRC, address, exception)
//! - slave-side request acceptance

use super::checksum::{self, ChecksumType};
use bytes::Bytes;
use thiserror::Error;

/// Offset added to the function code in an exception response
pub const ERROR_BIAS: u8 = 0x80;
/// Length of an exception response: address, function, code, CRC
pub const EXCEPTION_RESPONSE_LEN: usize = 5;
/// Length of an echo-style response (writes)
pub const FIXED_RESPONSE_LEN: usize = 8;
/// Shortest request a slave will consider
pub const MIN_REQUEST_LEN: usize = 8;
/// Broadcast address
pub const BROADCAST_ADDRESS: u8 = 0;
/// Most registers one read response can carry
pub const MAX_READ_REGISTERS: usize = 125;

const CRC_LEN: usize = 2;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Get function code from u8
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(FunctionCode::ReadCoils),
            0x02 => Some(FunctionCode::ReadDiscreteInputs),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x0F => Some(FunctionCode::WriteMultipleCoils),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    /// Get name of function code
    pub fn name(&self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }

    /// Responses to reads carry a byte count after the function code
    pub fn is_counted(code: u8) -> bool {
        (0x01..=0x04).contains(&code)
    }
}

/// Name of a Modbus exception code
pub fn exception_name(code: &u8) -> &'static str {
    match *code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Failed to Respond",
        _ => "Unknown Exception",
    }
}

/// Modbus response and request errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    #[error("no data received from slave")]
    Empty,

    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("CRC mismatch (expected {}, got {})", hex::encode(.expected), hex::encode(.received))]
    CrcMismatch { expected: Vec<u8>, received: Vec<u8> },

    #[error("wrong slave address in response (expected {expected}, got {received})")]
    AddressMismatch { expected: u8, received: u8 },

    #[error("wrong function code in response (expected {expected:#04x}, got {received:#04x})")]
    FunctionMismatch { expected: u8, received: u8 },

    #[error("byte count {declared} does not match payload of {actual} bytes")]
    ByteCountMismatch { declared: usize, actual: usize },

    #[error("slave {slave} raised exception {code:#04x} ({}) for function {function:#04x}", exception_name(.code))]
    Exception { slave: u8, function: u8, code: u8 },

    #[error("request addressed to unit {0}")]
    NotAddressed(u8),
}

/// Validated response from a slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuResponse {
    pub slave_id: u8,
    pub function: u8,
    /// Data after the header (and byte count), without CRC
    pub payload: Bytes,
}

impl RtuResponse {
    /// Payload as big-endian registers
    pub fn registers(&self) -> Vec<u16> {
        parse_registers(&self.payload)
    }
}

/// Request accepted by a slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuRequest {
    pub slave_id: u8,
    pub function: u8,
    /// Data after the function code, without CRC
    pub data: Bytes,
}

/// Append the Modbus CRC to a PDU-with-address
pub fn with_crc(frame: &[u8]) -> Vec<u8> {
    let mut out = frame.to_vec();
    checksum::append(&mut out, ChecksumType::Crc16Modbus);
    out
}

/// Build a read/write request with a start address and a quantity or value
pub fn build_rtu_request(slave_id: u8, function: FunctionCode, start_address: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FIXED_RESPONSE_LEN);
    frame.push(slave_id);
    frame.push(function as u8);
    frame.extend_from_slice(&start_address.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    checksum::append(&mut frame, ChecksumType::Crc16Modbus);
    frame
}

/// Build the response to a register read
///
/// Only the first [`MAX_READ_REGISTERS`] values fit in one response.
pub fn build_read_response(slave_id: u8, function: u8, values: &[u16]) -> Vec<u8> {
    let values = &values[..values.len().min(MAX_READ_REGISTERS)];
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();

    let mut frame = Vec::with_capacity(3 + payload.len() + CRC_LEN);
    frame.push(slave_id);
    frame.push(function);
    frame.push(u8::try_from(payload.len()).unwrap_or(u8::MAX));
    frame.extend_from_slice(&payload);
    checksum::append(&mut frame, ChecksumType::Crc16Modbus);
    frame
}

/// Build an exception response
pub fn build_exception_response(slave_id: u8, function: u8, code: u8) -> Vec<u8> {
    with_crc(&[slave_id, function | ERROR_BIAS, code])
}

/// Length the response in `buf` will have once complete
///
/// `None` while the header is incomplete, or for function codes whose length
/// is not derivable from the header; the inter-frame silence closes those.
pub fn expected_response_len(buf: &[u8]) -> Option<usize> {
    let function = *buf.get(1)?;
    if function >= ERROR_BIAS {
        return Some(EXCEPTION_RESPONSE_LEN);
    }
    if FunctionCode::is_counted(function) {
        let byte_count = *buf.get(2)?;
        return Some(2 + 1 + usize::from(byte_count) + CRC_LEN);
    }
    match FunctionCode::from_u8(function) {
        Some(_) => Some(FIXED_RESPONSE_LEN),
        None => None,
    }
}

/// Validate a response against the request that solicited it
pub fn check_response(request: &[u8], response: &[u8]) -> Result<RtuResponse, ModbusError> {
    if response.is_empty() {
        return Err(ModbusError::Empty);
    }
    if response.len() < EXCEPTION_RESPONSE_LEN {
        return Err(ModbusError::TooShort(response.len()));
    }

    checksum::verify_trailing(response, ChecksumType::Crc16Modbus).map_err(|m| {
        ModbusError::CrcMismatch {
            expected: m.expected,
            received: m.received,
        }
    })?;

    let slave_id = response[0];
    if let Some(&expected) = request.first() {
        if slave_id != expected {
            return Err(ModbusError::AddressMismatch {
                expected,
                received: slave_id,
            });
        }
    }

    let function = response[1];
    if function >= ERROR_BIAS {
        return Err(ModbusError::Exception {
            slave: slave_id,
            function: function & !ERROR_BIAS,
            code: response[2],
        });
    }
    if let Some(&expected) = request.get(1) {
        if function != expected {
            return Err(ModbusError::FunctionMismatch {
                expected,
                received: function,
            });
        }
    }

    let body = &response[2..response.len() - CRC_LEN];
    let payload = if FunctionCode::is_counted(function) {
        let declared = usize::from(body[0]);
        let data = &body[1..];
        if data.len() != declared {
            return Err(ModbusError::ByteCountMismatch {
                declared,
                actual: data.len(),
            });
        }
        data
    } else {
        body
    };

    Ok(RtuResponse {
        slave_id,
        function,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Accept a request frame as a slave serving `units`
pub fn accept_request(frame: &[u8], units: &[u8]) -> Result<RtuRequest, ModbusError> {
    if frame.len() < MIN_REQUEST_LEN {
        return Err(ModbusError::TooShort(frame.len()));
    }
    let slave_id = frame[0];
    if !units.contains(&slave_id) {
        return Err(ModbusError::NotAddressed(slave_id));
    }
    checksum::verify_trailing(frame, ChecksumType::Crc16Modbus).map_err(|m| {
        ModbusError::CrcMismatch {
            expected: m.expected,
            received: m.received,
        }
    })?;

    Ok(RtuRequest {
        slave_id,
        function: frame[1],
        data: Bytes::copy_from_slice(&frame[2..frame.len() - CRC_LEN]),
    })
}

/// Parse big-endian registers; a trailing odd byte is ignored
pub fn parse_registers(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}
