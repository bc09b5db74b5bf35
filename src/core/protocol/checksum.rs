//! Frame check sequences
//!
//! Supports: CRC-16 (Modbus, CCITT, XMODEM), XOR, LRC, Sum-8

use serde::{Deserialize, Serialize};

/// Check-sequence algorithm carried at the end of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumType {
    /// No checksum
    #[default]
    None,
    /// XOR of all bytes
    Xor,
    /// Longitudinal Redundancy Check (sum mod 256, negated)
    Lrc,
    /// Simple sum mod 256
    Sum8,
    /// CRC-16 Modbus (polynomial 0x8005, init 0xFFFF, reflected), low byte first
    Crc16Modbus,
    /// CRC-16 CCITT (polynomial 0x1021, init 0xFFFF), high byte first
    Crc16Ccitt,
    /// CRC-16 XMODEM (polynomial 0x1021, init 0x0000), high byte first
    Crc16Xmodem,
}

impl ChecksumType {
    /// Get name of checksum type
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumType::None => "None",
            ChecksumType::Xor => "XOR",
            ChecksumType::Lrc => "LRC",
            ChecksumType::Sum8 => "Sum-8",
            ChecksumType::Crc16Modbus => "CRC-16/Modbus",
            ChecksumType::Crc16Ccitt => "CRC-16/CCITT",
            ChecksumType::Crc16Xmodem => "CRC-16/XMODEM",
        }
    }

    /// Trailer size in bytes
    pub fn size(&self) -> usize {
        match self {
            ChecksumType::None => 0,
            ChecksumType::Xor | ChecksumType::Lrc | ChecksumType::Sum8 => 1,
            ChecksumType::Crc16Modbus | ChecksumType::Crc16Ccitt | ChecksumType::Crc16Xmodem => 2,
        }
    }
}

/// Mismatch between the received trailer and the computed one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub expected: Vec<u8>,
    pub received: Vec<u8>,
}

/// Calculate the trailer for `data`, in wire byte order
pub fn calculate(data: &[u8], algorithm: ChecksumType) -> Vec<u8> {
    match algorithm {
        ChecksumType::None => Vec::new(),
        ChecksumType::Xor => vec![xor_checksum(data)],
        ChecksumType::Lrc => vec![lrc_checksum(data)],
        ChecksumType::Sum8 => vec![sum8_checksum(data)],
        ChecksumType::Crc16Modbus => crc16_modbus(data).to_le_bytes().to_vec(),
        ChecksumType::Crc16Ccitt => crc16_ccitt(data).to_be_bytes().to_vec(),
        ChecksumType::Crc16Xmodem => crc16_xmodem(data).to_be_bytes().to_vec(),
    }
}

/// Append the trailer to `frame`
pub fn append(frame: &mut Vec<u8>, algorithm: ChecksumType) {
    let trailer = calculate(frame, algorithm);
    frame.extend_from_slice(&trailer);
}

/// Check the trailer at the end of `frame`
///
/// A frame shorter than the trailer plus one byte is a mismatch with an empty
/// expectation.
pub fn verify_trailing(frame: &[u8], algorithm: ChecksumType) -> Result<(), ChecksumMismatch> {
    let size = algorithm.size();
    if size == 0 {
        return Ok(());
    }
    if frame.len() <= size {
        return Err(ChecksumMismatch {
            expected: Vec::new(),
            received: frame.to_vec(),
        });
    }
    let (body, trailer) = frame.split_at(frame.len() - size);
    let expected = calculate(body, algorithm);
    if expected == trailer {
        Ok(())
    } else {
        Err(ChecksumMismatch {
            expected,
            received: trailer.to_vec(),
        })
    }
}

/// XOR checksum - XOR of all bytes
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// LRC: two's complement of the byte sum
pub fn lrc_checksum(data: &[u8]) -> u8 {
    sum8_checksum(data).wrapping_neg()
}

/// Simple 8-bit sum
pub fn sum8_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

const fn reflected_table(poly: u16) -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ poly } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const CRC16_MODBUS_TABLE: [u16; 256] = reflected_table(0xA001);

/// CRC-16/Modbus
pub fn crc16_modbus(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc: u16, &byte| {
        (crc >> 8) ^ CRC16_MODBUS_TABLE[usize::from((crc ^ u16::from(byte)) as u8)]
    })
}

fn crc16_msb_first(data: &[u8], init: u16) -> u16 {
    data.iter().fold(init, |mut crc, &byte| {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
        crc
    })
}

/// CRC-16/CCITT-FALSE
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    crc16_msb_first(data, 0xFFFF)
}

/// CRC-16/XMODEM
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    crc16_msb_first(data, 0x0000)
}
