//! Frame assembly on a silence-delimited bus
//!
//! Bytes are gathered from the transport until the line stays quiet for the
//! inter-frame silence, or an earlier boundary (terminator, Modbus length,
//! buffer limit) closes the frame. Bytes that arrive after a gap belong to
//! the next frame and are kept for it.

use super::checksum::{self, ChecksumType};
use super::modbus;
use crate::core::timing::TimingProfile;
use crate::core::transport::{BusTransport, TransportError};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// One contiguous burst of bytes on the bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Frame(Bytes);

impl Frame {
    /// Wrap bytes
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Parse a hex string; whitespace is ignored
    pub fn from_hex(text: &str) -> Result<Self, hex::FromHexError> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(Self(Bytes::from(hex::decode(compact)?)))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Consume into raw bytes
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Lowercase hex without separators
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl Deref for Frame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Frame {
    fn from(data: Bytes) -> Self {
        Self(data)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

impl From<&[u8]> for Frame {
    fn from(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }
}

impl<const N: usize> From<[u8; N]> for Frame {
    fn from(data: [u8; N]) -> Self {
        Self(Bytes::copy_from_slice(&data))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// What, besides silence, ends a frame
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBoundary {
    /// Only the inter-frame silence
    #[default]
    Silence,
    /// A trailing byte sequence, e.g. `\n`
    Terminator { bytes: Vec<u8> },
    /// Length derived from the Modbus RTU response header
    ModbusRtu,
}

impl FrameBoundary {
    /// Line-feed terminated frames
    pub fn line_feed() -> Self {
        Self::Terminator { bytes: vec![b'\n'] }
    }

    /// Whether `buf` is already a complete frame
    pub fn is_complete(&self, buf: &[u8]) -> bool {
        match self {
            Self::Silence => false,
            Self::Terminator { bytes } => !bytes.is_empty() && buf.ends_with(bytes),
            Self::ModbusRtu => modbus::expected_response_len(buf).is_some_and(|len| buf.len() >= len),
        }
    }
}

/// Boundary and integrity rules for received frames
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameProfile {
    pub boundary: FrameBoundary,
    pub checksum: ChecksumType,
}

impl FrameProfile {
    /// Modbus RTU: header-derived length, CRC-16 trailer
    pub fn modbus_rtu() -> Self {
        Self {
            boundary: FrameBoundary::ModbusRtu,
            checksum: ChecksumType::Crc16Modbus,
        }
    }

    /// Text lines terminated by `\n`
    pub fn line() -> Self {
        Self {
            boundary: FrameBoundary::line_feed(),
            checksum: ChecksumType::None,
        }
    }

    /// Set the checksum
    #[must_use]
    pub fn checksum(mut self, checksum: ChecksumType) -> Self {
        self.checksum = checksum;
        self
    }

    /// Check a received frame. The error is a human-readable reason.
    ///
    /// With a terminator the checksum sits before it.
    pub fn validate(&self, frame: &[u8]) -> Result<(), String> {
        if frame.is_empty() {
            return Err("empty frame".to_string());
        }

        let body = match &self.boundary {
            FrameBoundary::Terminator { bytes } => match frame.strip_suffix(bytes.as_slice()) {
                Some(body) => body,
                None => return Err("missing frame terminator".to_string()),
            },
            FrameBoundary::Silence | FrameBoundary::ModbusRtu => frame,
        };

        if let FrameBoundary::ModbusRtu = self.boundary {
            if let Some(expected) = modbus::expected_response_len(body) {
                if body.len() != expected {
                    return Err(format!(
                        "length {} does not match header ({expected})",
                        body.len()
                    ));
                }
            }
        }

        checksum::verify_trailing(body, self.checksum).map_err(|m| {
            if m.expected.is_empty() {
                format!("frame too short for {}", self.checksum.name())
            } else {
                format!(
                    "{} mismatch (expected {}, got {})",
                    self.checksum.name(),
                    hex::encode(m.expected),
                    hex::encode(m.received)
                )
            }
        })
    }
}

/// Outcome of one assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// A complete frame
    Frame(Frame),
    /// Nothing arrived before the first-byte timeout
    NoData,
    /// The line closed after some bytes arrived
    Truncated(Bytes),
}

/// Gathers bytes into frames, remembering bytes that start the next frame
#[derive(Debug, Default)]
pub struct FrameAssembler {
    carry: BytesMut,
    carry_at: Option<Instant>,
    limit: Option<usize>,
}

impl FrameAssembler {
    /// Create an assembler; `limit` closes a frame once reached
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            carry: BytesMut::new(),
            carry_at: None,
            limit,
        }
    }

    /// Bytes held over for the next frame
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Drop held-over bytes, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.carry.len();
        self.carry.clear();
        self.carry_at = None;
        dropped
    }

    fn is_full(&self, buf: &[u8]) -> bool {
        self.limit.is_some_and(|limit| buf.len() >= limit)
    }

    /// Read one frame from `transport`
    ///
    /// `first_byte` bounds the wait for the first byte; once it arrived the
    /// frame is closed by silence, by `boundary`, by the buffer limit, after
    /// `timing.frame_timeout` or after `timing.max_polls` further polls.
    pub async fn assemble(
        &mut self,
        transport: &mut dyn BusTransport,
        timing: &TimingProfile,
        boundary: &FrameBoundary,
        first_byte: Duration,
    ) -> Result<Assembly, TransportError> {
        let started = Instant::now();
        let mut buf = std::mem::take(&mut self.carry);
        let mut first_arrival = self.carry_at.take();
        let mut last_arrival = first_arrival;

        if !buf.is_empty() && (boundary.is_complete(&buf) || self.is_full(&buf)) {
            return Ok(Assembly::Frame(Frame(buf.freeze())));
        }

        // The wait for the first byte is bounded by `first_byte` alone
        let mut polls = 0;
        loop {
            if first_arrival.is_some() {
                if polls >= timing.max_polls {
                    break;
                }
                polls += 1;
            }

            let chunk = match transport.read_available(timing.poll_interval).await {
                Ok(chunk) => chunk,
                Err(TransportError::Disconnected) if !buf.is_empty() => {
                    debug!(received = buf.len(), "line closed mid-frame");
                    return Ok(Assembly::Truncated(buf.freeze()));
                }
                Err(e) => return Err(e),
            };
            let now = Instant::now();

            if chunk.is_empty() {
                match last_arrival {
                    Some(at) if now.duration_since(at) >= timing.inter_frame_silence => {
                        trace!(len = buf.len(), "frame closed by silence");
                        return Ok(Assembly::Frame(Frame(buf.freeze())));
                    }
                    None if now.duration_since(started) >= first_byte => {
                        return Ok(Assembly::NoData);
                    }
                    _ => {}
                }
            } else {
                if let Some(at) = last_arrival {
                    if now.duration_since(at) >= timing.inter_frame_silence {
                        trace!(carried = chunk.len(), "bytes after gap kept for next frame");
                        self.carry.extend_from_slice(&chunk);
                        self.carry_at = Some(now);
                        return Ok(Assembly::Frame(Frame(buf.freeze())));
                    }
                }
                buf.extend_from_slice(&chunk);
                last_arrival = Some(now);
                if first_arrival.is_none() {
                    first_arrival = Some(now);
                }

                if boundary.is_complete(&buf) || self.is_full(&buf) {
                    return Ok(Assembly::Frame(Frame(buf.freeze())));
                }
            }

            if let Some(first) = first_arrival {
                if now.duration_since(first) >= timing.frame_timeout {
                    debug!(len = buf.len(), "frame closed by frame timeout");
                    return Ok(Assembly::Frame(Frame(buf.freeze())));
                }
            }
        }

        debug!(polls, len = buf.len(), "poll limit reached");
        Ok(Assembly::Frame(Frame(buf.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulator::{SimulatedBus, VirtualDevice};
    use crate::core::transport::{ChannelConfig, MockBusTransport};

    fn setup(baud: u32) -> (SimulatedBus, TimingProfile) {
        let channel = ChannelConfig::new("sim", baud);
        let timing = TimingProfile::for_channel(&channel).with_poll_interval(Duration::from_millis(1));
        (SimulatedBus::new(channel, VirtualDevice::new("quiet")), timing)
    }

    #[test]
    fn test_frame_display_and_hex() {
        let frame = Frame::from_hex("01 03 02 00 2a").unwrap();
        assert_eq!(frame.to_string(), "01 03 02 00 2A");
        assert_eq!(frame.to_hex(), "010302002a");
        assert!(Frame::from_hex("0g").is_err());
    }

    #[test]
    fn test_boundary_completion() {
        assert!(!FrameBoundary::Silence.is_complete(b"abc"));
        assert!(FrameBoundary::line_feed().is_complete(b"ok\n"));
        assert!(!FrameBoundary::Terminator { bytes: vec![] }.is_complete(b"ok"));
        assert!(FrameBoundary::ModbusRtu.is_complete(&[1, 0x83, 2, 0xC0, 0xF1]));
        assert!(!FrameBoundary::ModbusRtu.is_complete(&[1, 3, 2, 0]));
    }

    #[test]
    fn test_profile_validation() {
        let rtu = FrameProfile::modbus_rtu();
        let good = modbus::build_read_response(1, 3, &[42]);
        assert!(rtu.validate(&good).is_ok());

        let mut bad = good.clone();
        bad[4] ^= 0x10;
        assert!(rtu.validate(&bad).unwrap_err().contains("mismatch"));
        assert!(rtu.validate(&good[..4]).unwrap_err().contains("length"));
        assert_eq!(rtu.validate(&[]).unwrap_err(), "empty frame");

        let line = FrameProfile::line().checksum(ChecksumType::Xor);
        let mut text = b"OK".to_vec();
        text.push(checksum::xor_checksum(b"OK"));
        text.push(b'\n');
        assert!(line.validate(&text).is_ok());
        assert!(line.validate(b"OK").unwrap_err().contains("terminator"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_closed_by_silence() {
        let (mut bus, timing) = setup(9600);
        let handle = bus.handle();
        handle.schedule(Duration::from_millis(5), &[0x01, 0x03, 0x02]);
        handle.schedule(Duration::from_millis(7), &[0x00, 0x2A]);

        let mut assembler = FrameAssembler::default();
        let started = Instant::now();
        let out = assembler
            .assemble(&mut bus, &timing, &FrameBoundary::Silence, timing.response_timeout)
            .await
            .unwrap();

        assert_eq!(out, Assembly::Frame(Frame::from([0x01, 0x03, 0x02, 0x00, 0x2A])));
        // closed no earlier than one silence after the last byte
        assert!(started.elapsed() >= Duration::from_millis(7) + timing.inter_frame_silence);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_splits_frames_and_carries_remainder() {
        let (mut bus, timing) = setup(9600);
        let handle = bus.handle();
        handle.schedule(Duration::from_millis(2), b"first");
        handle.schedule(Duration::from_millis(30), b"second");

        // A poll longer than the silence sees both bursts back to back
        let timing = timing.with_poll_interval(Duration::from_millis(50));
        let mut assembler = FrameAssembler::default();
        let first = assembler
            .assemble(&mut bus, &timing, &FrameBoundary::Silence, timing.response_timeout)
            .await
            .unwrap();
        assert_eq!(first, Assembly::Frame(Frame::from(&b"first"[..])));
        assert_eq!(assembler.pending(), 6);

        let second = assembler
            .assemble(&mut bus, &timing, &FrameBoundary::Silence, timing.response_timeout)
            .await
            .unwrap();
        assert_eq!(second, Assembly::Frame(Frame::from(&b"second"[..])));
        assert_eq!(assembler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data() {
        let (mut bus, timing) = setup(19_200);
        let mut assembler = FrameAssembler::default();
        let started = Instant::now();
        let out = assembler
            .assemble(&mut bus, &timing, &FrameBoundary::Silence, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(out, Assembly::NoData);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_modbus_length_closes_early() {
        let (mut bus, timing) = setup(9600);
        let handle = bus.handle();
        let response = modbus::build_read_response(1, 3, &[1, 2]);
        handle.schedule(Duration::from_millis(3), &response);

        let mut assembler = FrameAssembler::default();
        let started = Instant::now();
        let out = assembler
            .assemble(&mut bus, &timing, &FrameBoundary::ModbusRtu, timing.response_timeout)
            .await
            .unwrap();
        assert_eq!(out, Assembly::Frame(Frame::from(response)));
        assert!(started.elapsed() < Duration::from_millis(3) + timing.inter_frame_silence);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_frame_is_truncated() {
        let (mut bus, timing) = setup(9600);
        let handle = bus.handle();
        handle.schedule(Duration::from_millis(1), &[0x01, 0x03]);
        handle.disconnect_after(Duration::from_millis(2));

        let mut assembler = FrameAssembler::default();
        let out = assembler
            .assemble(&mut bus, &timing, &FrameBoundary::Silence, timing.response_timeout)
            .await
            .unwrap();
        assert_eq!(out, Assembly::Truncated(Bytes::from_static(&[0x01, 0x03])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_limit_closes_frame() {
        let (mut bus, timing) = setup(9600);
        let handle = bus.handle();
        handle.schedule(Duration::from_millis(1), &[0xAA; 12]);

        let mut assembler = FrameAssembler::new(Some(8));
        let out = assembler
            .assemble(&mut bus, &timing, &FrameBoundary::Silence, timing.response_timeout)
            .await
            .unwrap();
        assert_eq!(out, Assembly::Frame(Frame::from([0xAA; 12])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_timeout_on_babbling_line() {
        let (mut bus, timing) = setup(9600);
        let handle = bus.handle();
        for i in 0..100u64 {
            handle.schedule(Duration::from_millis(1 + i * 2), &[0x55]);
        }
        let timing = timing.with_frame_timeout(Duration::from_millis(50));

        let mut assembler = FrameAssembler::default();
        let out = assembler
            .assemble(&mut bus, &timing, &FrameBoundary::Silence, timing.response_timeout)
            .await
            .unwrap();
        match out {
            Assembly::Frame(frame) => assert!(frame.len() >= 25 && frame.len() < 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cap_ends_line_that_never_goes_quiet() {
        let (_, timing) = setup(9600);
        let timing = timing
            .with_frame_timeout(Duration::from_secs(60))
            .with_max_polls(5);

        // every poll returns a byte at once and the clock never moves
        let mut noisy = MockBusTransport::new();
        noisy
            .expect_read_available()
            .times(6)
            .returning(|_| Ok(Bytes::from_static(&[0x55])));

        let mut assembler = FrameAssembler::default();
        let out = assembler
            .assemble(&mut noisy, &timing, &FrameBoundary::Silence, timing.response_timeout)
            .await
            .unwrap();
        assert_eq!(out, Assembly::Frame(Frame::from([0x55; 6])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_byte_wait_is_not_charged_to_poll_cap() {
        let (mut bus, timing) = setup(9600);
        let timing = timing.with_max_polls(8);
        let handle = bus.handle();
        handle.schedule(Duration::from_millis(30), &[0x01, 0x02, 0x03]);

        let mut assembler = FrameAssembler::default();
        let out = assembler
            .assemble(&mut bus, &timing, &FrameBoundary::Silence, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(out, Assembly::Frame(Frame::from([0x01, 0x02, 0x03])));
    }
}
