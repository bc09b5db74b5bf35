//! Virtual bus and device simulator
//!
//! [`SimulatedBus`] is an in-memory [`BusTransport`] with a scripted
//! [`VirtualDevice`] at the far end of the wire. Replies are scheduled on the
//! tokio clock relative to the end of the request's transmission, so tests
//! run deterministically with paused time.

use crate::core::protocol::modbus;
use crate::core::timing::TimingProfile;
use crate::core::transport::{
    BusTransport, ChannelConfig, DirectionState, TransportError, TransportStats,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

const MAX_FLUSH_READS: usize = 64;

/// Response rule condition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchCondition {
    /// Match exact bytes
    Exact { bytes: Vec<u8> },
    /// Match leading bytes given as hex (`*` or `??` is a wildcard)
    HexPattern { pattern: String },
    /// Match any input
    Any,
    /// Match by length range
    LengthRange { min: usize, max: usize },
    /// Combined conditions (all must match)
    All(Vec<MatchCondition>),
    /// Combined conditions (any must match)
    OneOf(Vec<MatchCondition>),
}

impl MatchCondition {
    /// Check if data matches this condition
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            Self::Exact { bytes } => data == bytes.as_slice(),
            Self::HexPattern { pattern } => Self::match_hex_pattern(data, pattern),
            Self::Any => true,
            Self::LengthRange { min, max } => (*min..=*max).contains(&data.len()),
            Self::All(conditions) => conditions.iter().all(|c| c.matches(data)),
            Self::OneOf(conditions) => conditions.iter().any(|c| c.matches(data)),
        }
    }

    fn match_hex_pattern(data: &[u8], pattern: &str) -> bool {
        let parts: Vec<&str> = pattern.split_whitespace().collect();
        if data.len() < parts.len() {
            return false;
        }
        parts.iter().zip(data).all(|(part, byte)| {
            matches!(*part, "*" | "??") || u8::from_str_radix(part, 16).is_ok_and(|b| b == *byte)
        })
    }
}

/// What the device does when a rule fires
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseAction {
    /// Send fixed bytes
    Send { data: Vec<u8> },
    /// Send hex string
    SendHex { hex: String },
    /// Echo input back
    Echo,
    /// Wait before the following actions
    Delay { ms: u64 },
    /// Send `data` in chunks of `chunk` bytes, `gap_us` apart
    Burst { data: Vec<u8>, chunk: usize, gap_us: u64 },
    /// Answer a Modbus register read from a register table
    ModbusRegisters { values: Vec<u16> },
    /// Answer with a Modbus exception
    ModbusException { code: u8 },
    /// Close the line
    Disconnect,
    /// Execute multiple actions in sequence
    Sequence(Vec<ResponseAction>),
    /// No response
    None,
}

/// Response rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Rule name
    pub name: String,
    /// Match condition
    pub condition: MatchCondition,
    /// Response action
    pub action: ResponseAction,
    /// Priority (higher = checked first)
    pub priority: i32,
    /// Enabled
    pub enabled: bool,
    /// One-shot (disable after first match)
    pub one_shot: bool,
    /// Match count
    #[serde(default)]
    pub match_count: u64,
}

impl ResponseRule {
    /// Rule firing `action` on `condition`
    pub fn new(name: &str, condition: MatchCondition, action: ResponseAction) -> Self {
        Self {
            name: name.to_string(),
            condition,
            action,
            priority: 0,
            enabled: true,
            one_shot: false,
            match_count: 0,
        }
    }

    /// Create a simple echo rule
    pub fn echo(name: &str) -> Self {
        Self::new(name, MatchCondition::Any, ResponseAction::Echo)
    }

    /// Reply `response` to requests matching a hex pattern
    pub fn pattern(name: &str, pattern: &str, response: Vec<u8>) -> Self {
        Self::new(
            name,
            MatchCondition::HexPattern {
                pattern: pattern.to_string(),
            },
            ResponseAction::Send { data: response },
        )
        .priority(10)
    }

    /// Set priority
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Fire only once
    #[must_use]
    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }
}

/// Something the device puts on the wire, relative to the end of the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    Bytes { after: Duration, data: Vec<u8> },
    Disconnect { after: Duration },
}

/// Scripted device on the far end of a [`SimulatedBus`]
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    name: String,
    rules: Vec<ResponseRule>,
}

impl VirtualDevice {
    /// Create a device without rules; it never answers
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
        }
    }

    /// Add a response rule
    pub fn add_rule(&mut self, rule: ResponseRule) {
        self.rules.push(rule);
        // stable sort keeps insertion order within a priority
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Builder form of [`Self::add_rule`]
    #[must_use]
    pub fn with_rule(mut self, rule: ResponseRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// Get all rules
    pub fn rules(&self) -> &[ResponseRule] {
        &self.rules
    }

    /// Get device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// React to a request. Only the first matching rule fires.
    pub fn respond(&mut self, input: &[u8]) -> Vec<Emission> {
        let mut out = Vec::new();
        let Some(rule) = self
            .rules
            .iter_mut()
            .find(|r| r.enabled && r.condition.matches(input))
        else {
            return out;
        };

        rule.match_count += 1;
        if rule.one_shot {
            rule.enabled = false;
        }
        trace!(device = %self.name, rule = %rule.name, "rule matched");

        let mut delay = Duration::ZERO;
        expand(&rule.action, input, &mut delay, &mut out);
        out
    }
}

fn emit(out: &mut Vec<Emission>, data: Vec<u8>, after: Duration) {
    if !data.is_empty() {
        out.push(Emission::Bytes { after, data });
    }
}

fn expand(action: &ResponseAction, input: &[u8], delay: &mut Duration, out: &mut Vec<Emission>) {
    match action {
        ResponseAction::Send { data } => emit(out, data.clone(), *delay),
        ResponseAction::SendHex { hex } => {
            if let Ok(data) = hex::decode(hex.replace(' ', "")) {
                emit(out, data, *delay);
            }
        }
        ResponseAction::Echo => emit(out, input.to_vec(), *delay),
        ResponseAction::Delay { ms } => *delay += Duration::from_millis(*ms),
        ResponseAction::Burst { data, chunk, gap_us } => {
            for (i, piece) in data.chunks((*chunk).max(1)).enumerate() {
                if i > 0 {
                    *delay += Duration::from_micros(*gap_us);
                }
                emit(out, piece.to_vec(), *delay);
            }
        }
        ResponseAction::ModbusRegisters { values } => {
            if let Some(reply) = register_reply(input, values) {
                emit(out, reply, *delay);
            }
        }
        ResponseAction::ModbusException { code } => {
            if let [slave, function, ..] = input {
                emit(out, modbus::build_exception_response(*slave, *function, *code), *delay);
            }
        }
        ResponseAction::Disconnect => out.push(Emission::Disconnect { after: *delay }),
        ResponseAction::Sequence(actions) => {
            for action in actions {
                expand(action, input, delay, out);
            }
        }
        ResponseAction::None => {}
    }
}

fn register_reply(input: &[u8], values: &[u16]) -> Option<Vec<u8>> {
    let slave = *input.first()?;
    // A slave ignores frames it cannot trust
    let request = modbus::accept_request(input, &[slave]).ok()?;
    if !matches!(request.function, 0x03 | 0x04) || request.data.len() < 4 {
        return Some(modbus::build_exception_response(slave, request.function, 0x01));
    }
    let start = usize::from(u16::from_be_bytes([request.data[0], request.data[1]]));
    let count = usize::from(u16::from_be_bytes([request.data[2], request.data[3]]));
    if count == 0 || count > modbus::MAX_READ_REGISTERS {
        return Some(modbus::build_exception_response(slave, request.function, 0x03));
    }
    match values.get(start..start + count) {
        Some(slice) => Some(modbus::build_read_response(slave, request.function, slice)),
        _ => Some(modbus::build_exception_response(slave, request.function, 0x02)),
    }
}

/// Preset device templates
pub struct DeviceTemplates;

impl DeviceTemplates {
    /// Simple echo device
    pub fn echo() -> VirtualDevice {
        VirtualDevice::new("Echo Device").with_rule(ResponseRule::echo("echo_all"))
    }

    /// Modbus RTU slave serving a holding/input register table
    pub fn modbus_slave(address: u8, registers: Vec<u16>) -> VirtualDevice {
        let read = MatchCondition::OneOf(vec![
            MatchCondition::HexPattern {
                pattern: format!("{address:02X} 03"),
            },
            MatchCondition::HexPattern {
                pattern: format!("{address:02X} 04"),
            },
        ]);

        VirtualDevice::new(&format!("Modbus Slave {address}"))
            .with_rule(
                ResponseRule::new(
                    "read_registers",
                    read,
                    ResponseAction::Sequence(vec![
                        ResponseAction::Delay { ms: 5 },
                        ResponseAction::ModbusRegisters { values: registers },
                    ]),
                )
                .priority(10),
            )
            .with_rule(
                ResponseRule::new(
                    "unsupported",
                    MatchCondition::HexPattern {
                        pattern: format!("{address:02X}"),
                    },
                    ResponseAction::Sequence(vec![
                        ResponseAction::Delay { ms: 5 },
                        ResponseAction::ModbusException { code: 0x01 },
                    ]),
                )
                .priority(1),
            )
    }
}

/// What happened on the simulated wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Direction line changed
    Direction(DirectionState),
    /// Bytes written, with the direction line at the time
    Write { data: Vec<u8>, direction: DirectionState },
    /// Input flushed
    Flush(usize),
}

#[derive(Debug, Default)]
struct Wire {
    inbound: Vec<(Instant, Vec<u8>)>,
    disconnect_at: Option<Instant>,
    direction: DirectionState,
    transmit_done_at: Option<Instant>,
    stall_transmit: bool,
    events: Vec<WireEvent>,
}

impl Wire {
    fn schedule(&mut self, at: Instant, data: Vec<u8>) {
        let pos = self.inbound.partition_point(|(t, _)| *t <= at);
        self.inbound.insert(pos, (at, data));
    }

    fn take_ready(&mut self, now: Instant) -> Vec<u8> {
        let ready = self.inbound.partition_point(|(t, _)| *t <= now);
        self.inbound.drain(..ready).flat_map(|(_, data)| data).collect()
    }

    fn next_wake(&self) -> Option<Instant> {
        let next = self.inbound.first().map(|(t, _)| *t);
        match (next, self.disconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_closed(&self, now: Instant) -> bool {
        self.disconnect_at.is_some_and(|at| at <= now)
    }
}

/// Test and scripting access to a [`SimulatedBus`] after it was handed off
#[derive(Debug, Clone)]
pub struct SimHandle {
    wire: Arc<Mutex<Wire>>,
}

impl SimHandle {
    /// Deliver `data` to the master after `after`
    pub fn schedule(&self, after: Duration, data: &[u8]) {
        self.wire.lock().schedule(Instant::now() + after, data.to_vec());
    }

    /// Deliver `data` immediately, e.g. line noise
    pub fn inject(&self, data: &[u8]) {
        self.schedule(Duration::ZERO, data);
    }

    /// Close the line after `after`
    pub fn disconnect_after(&self, after: Duration) {
        self.wire.lock().disconnect_at = Some(Instant::now() + after);
    }

    /// Make transmit completion never arrive
    pub fn stall_transmit(&self, stall: bool) {
        self.wire.lock().stall_transmit = stall;
    }

    /// Everything that happened on the wire
    pub fn events(&self) -> Vec<WireEvent> {
        self.wire.lock().events.clone()
    }

    /// Payloads of all writes, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.wire
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                WireEvent::Write { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Writes issued while the driver was disabled
    pub fn writes_while_receiving(&self) -> usize {
        self.wire
            .lock()
            .events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    WireEvent::Write {
                        direction: DirectionState::Receive,
                        ..
                    }
                )
            })
            .count()
    }

    /// Current direction line state
    pub fn direction(&self) -> DirectionState {
        self.wire.lock().direction
    }

    /// Bytes scheduled but not yet read
    pub fn pending_inbound(&self) -> usize {
        self.wire.lock().inbound.iter().map(|(_, d)| d.len()).sum()
    }
}

/// In-memory half-duplex bus with a virtual device attached
pub struct SimulatedBus {
    channel: ChannelConfig,
    timing: TimingProfile,
    device: VirtualDevice,
    wire: Arc<Mutex<Wire>>,
    stats: TransportStats,
}

impl SimulatedBus {
    /// Create a bus; the device answers every write that reaches the wire
    pub fn new(channel: ChannelConfig, device: VirtualDevice) -> Self {
        let timing = TimingProfile::for_channel(&channel);
        Self {
            channel,
            timing,
            device,
            wire: Arc::new(Mutex::new(Wire::default())),
            stats: TransportStats::default(),
        }
    }

    /// Handle for scripting and inspection
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            wire: Arc::clone(&self.wire),
        }
    }

    async fn next_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let wake = {
                let mut wire = self.wire.lock();
                let ready = wire.take_ready(now);
                if !ready.is_empty() {
                    return Ok(ready);
                }
                if wire.is_closed(now) {
                    return Err(TransportError::Disconnected);
                }
                wire.next_wake()
            };
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake = wake.map_or(deadline, |at| at.min(deadline));
            tokio::time::sleep_until(wake).await;
        }
    }
}

#[async_trait]
impl BusTransport for SimulatedBus {
    fn channel(&self) -> ChannelConfig {
        self.channel.clone()
    }

    async fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let now = Instant::now();
        let done = now + self.timing.wire_time(data.len());
        let mut wire = self.wire.lock();
        if wire.is_closed(now) {
            return Err(TransportError::Disconnected);
        }

        let direction = wire.direction;
        wire.events.push(WireEvent::Write {
            data: data.to_vec(),
            direction,
        });
        wire.transmit_done_at = Some(done);
        self.stats.bytes_sent += data.len() as u64;
        self.stats.writes += 1;

        if self.channel.direction.is_some() && direction == DirectionState::Receive {
            debug!(device = %self.device.name(), "write with driver disabled never reaches the bus");
            return Ok(());
        }

        for emission in self.device.respond(data) {
            match emission {
                Emission::Bytes { after, data } => wire.schedule(done + after, data),
                Emission::Disconnect { after } => wire.disconnect_at = Some(done + after),
            }
        }
        Ok(())
    }

    async fn wait_for_transmit_complete(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let (stalled, done) = {
            let wire = self.wire.lock();
            (wire.stall_transmit, wire.transmit_done_at)
        };
        let limit = Instant::now() + timeout;
        match done {
            Some(done) if !stalled && done <= limit => {
                tokio::time::sleep_until(done).await;
                Ok(())
            }
            None if !stalled => Ok(()),
            _ => {
                tokio::time::sleep_until(limit).await;
                Err(TransportError::TransmitTimeout(timeout))
            }
        }
    }

    async fn read_available(&mut self, timeout: Duration) -> Result<Bytes, TransportError> {
        let chunk = self.next_chunk(timeout).await?;
        self.stats.bytes_received += chunk.len() as u64;
        Ok(Bytes::from(chunk))
    }

    fn set_direction(&mut self, state: DirectionState) -> Result<(), TransportError> {
        let mut wire = self.wire.lock();
        if wire.direction != state {
            wire.direction = state;
            wire.events.push(WireEvent::Direction(state));
            self.stats.direction_switches += 1;
        }
        Ok(())
    }

    fn direction(&self) -> DirectionState {
        self.wire.lock().direction
    }

    async fn flush_input(&mut self, grace: Duration) -> Result<usize, TransportError> {
        let mut discarded = 0;
        for _ in 0..MAX_FLUSH_READS {
            let chunk = self.next_chunk(grace).await?;
            if chunk.is_empty() {
                break;
            }
            discarded += chunk.len();
        }
        if discarded > 0 {
            self.wire.lock().events.push(WireEvent::Flush(discarded));
        }
        self.stats.bytes_flushed += discarded as u64;
        Ok(discarded)
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}
