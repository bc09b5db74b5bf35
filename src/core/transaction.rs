//! Transaction controller
//!
//! A [`Bus`] owns one transport and runs every exchange on it as a
//! [`Transaction`]:
//!
//! ```text
//! Idle -> Flushing -> Transmitting -> AwaitingTransmitComplete -> Receiving -> Validating -> Complete
//!                                                       \-> Complete (send only)
//! Idle -> Receiving (listen only)
//! any non-terminal state -> Failed
//! ```
//!
//! Exchanges are serialized in arrival order. The direction line is back in
//! receive on every exit path, including cancellation and a dropped future.

use crate::core::logger::{Direction, SharedTrafficLogger};
use crate::core::protocol::framing::{Assembly, Frame, FrameAssembler, FrameProfile};
use crate::core::retry::RetryPolicy;
use crate::core::timing::TimingProfile;
use crate::core::transport::{
    BusTransport, ChannelConfig, DirectionState, TransportError, TransportStats,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Not started
    Idle,
    /// Discarding stale input
    Flushing,
    /// Driver enabled, request being written
    Transmitting,
    /// Waiting for the last bit to leave
    AwaitingTransmitComplete,
    /// Gathering the response
    Receiving,
    /// Checking the received frame
    Validating,
    /// Finished successfully
    Complete,
    /// Finished with an error
    Failed,
}

impl TransactionState {
    /// Terminal states accept no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Flushing => "flushing",
            Self::Transmitting => "transmitting",
            Self::AwaitingTransmitComplete => "awaiting-transmit-complete",
            Self::Receiving => "receiving",
            Self::Validating => "validating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Shape of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Request then response
    SendReceive,
    /// Request only
    SendOnly,
    /// Response only, no request
    ReceiveOnly,
}

/// Coarse failure category, stable for callers and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Configuration,
    InvalidRequest,
    TransmitTimeout,
    NoResponse,
    MalformedResponse,
    Cancelled,
    DeadlineExceeded,
    Transport,
}

/// Why a transaction failed
#[derive(Error, Debug)]
pub enum TransactionError {
    /// Channel or profile parameters rejected
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Request rejected before touching the line
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Transmission not confirmed in time
    #[error("Transmit not confirmed within {0:?}")]
    TransmitTimeout(Duration),

    /// Nothing arrived before the first-byte timeout
    #[error("No response within {0:?}")]
    NoResponse(Duration),

    /// A response arrived but failed validation
    #[error("Malformed response ({reason}): {}", hex::encode(.raw))]
    MalformedResponse { reason: String, raw: Bytes },

    /// Caller cancelled
    #[error("Transaction cancelled")]
    CancellationRequested,

    /// All attempts together exceeded the deadline
    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl TransactionError {
    /// Validation failure with the offending bytes
    pub fn malformed(reason: impl Into<String>, raw: impl Into<Bytes>) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Failure category
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::TransmitTimeout(_) => FailureKind::TransmitTimeout,
            Self::NoResponse(_) => FailureKind::NoResponse,
            Self::MalformedResponse { .. } => FailureKind::MalformedResponse,
            Self::CancellationRequested => FailureKind::Cancelled,
            Self::DeadlineExceeded(_) => FailureKind::DeadlineExceeded,
            Self::Transport(_) => FailureKind::Transport,
        }
    }

    /// Bytes of a malformed response
    pub fn raw_response(&self) -> Option<&Bytes> {
        match self {
            Self::MalformedResponse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

impl From<TransportError> for TransactionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Configuration(msg) => Self::Configuration(msg),
            TransportError::TransmitTimeout(limit) => Self::TransmitTimeout(limit),
            other => Self::Transport(other),
        }
    }
}

/// One attempt of an exchange on the bus
#[derive(Debug, Clone)]
pub struct Transaction {
    id: u64,
    attempt: u32,
    kind: TransactionKind,
    state: TransactionState,
    started: Instant,
    trail: Vec<TransactionState>,
}

impl Transaction {
    fn new(id: u64, attempt: u32, kind: TransactionKind) -> Self {
        Self {
            id,
            attempt,
            kind,
            state: TransactionState::Idle,
            started: Instant::now(),
            trail: vec![TransactionState::Idle],
        }
    }

    /// Transaction id, shared by all attempts
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Attempt number, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Exchange shape
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// States visited so far, in order
    pub fn trail(&self) -> &[TransactionState] {
        &self.trail
    }

    /// Time since the attempt started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Check whether a transition is allowed
    pub fn can_advance(&self, to: TransactionState) -> bool {
        use TransactionState::*;

        match (self.state, to) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Flushing) => self.kind != TransactionKind::ReceiveOnly,
            (Idle, Receiving) => self.kind == TransactionKind::ReceiveOnly,
            (Flushing, Transmitting) => true,
            (Transmitting, AwaitingTransmitComplete) => true,
            (AwaitingTransmitComplete, Receiving) => self.kind == TransactionKind::SendReceive,
            (AwaitingTransmitComplete, Complete) => self.kind == TransactionKind::SendOnly,
            (Receiving, Validating) => true,
            (Validating, Complete) => true,
            _ => false,
        }
    }

    fn advance(&mut self, to: TransactionState) {
        debug_assert!(
            self.can_advance(to),
            "invalid transaction transition {} -> {}",
            self.state,
            to
        );
        trace!(transaction = self.id, attempt = self.attempt, from = %self.state, %to, "transition");
        self.state = to;
        self.trail.push(to);
    }
}

/// Bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Transactions started
    pub transactions: u64,
    /// Transactions that completed
    pub completed: u64,
    /// Transactions that failed
    pub failed: u64,
    /// Extra attempts made
    pub retries: u64,
    /// Failures with no response
    pub no_response: u64,
    /// Failures with a malformed response
    pub malformed: u64,
    /// Failures confirming transmission
    pub transmit_timeouts: u64,
    /// Cancelled transactions
    pub cancelled: u64,
    /// Transactions stopped by the overall deadline
    pub deadline_exceeded: u64,
}

/// Options for building a [`Bus`]
#[derive(Clone)]
pub struct BusOptions {
    /// Name used in logs
    pub name: String,
    /// Timing; derived from the channel when absent
    pub timing: Option<TimingProfile>,
    /// Frame boundary and integrity rules
    pub frame: FrameProfile,
    /// Retry policy
    pub retry: RetryPolicy,
    /// Optional wire record
    pub traffic: Option<SharedTrafficLogger>,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            name: "bus".to_string(),
            timing: None,
            frame: FrameProfile::default(),
            retry: RetryPolicy::default(),
            traffic: None,
        }
    }
}

impl BusOptions {
    /// Set name
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set timing
    #[must_use]
    pub fn timing(mut self, timing: TimingProfile) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Set frame profile
    #[must_use]
    pub fn frame(mut self, frame: FrameProfile) -> Self {
        self.frame = frame;
        self
    }

    /// Set retry policy
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Record traffic
    #[must_use]
    pub fn traffic(mut self, logger: SharedTrafficLogger) -> Self {
        self.traffic = Some(logger);
        self
    }
}

struct BusInner {
    transport: Box<dyn BusTransport>,
    assembler: FrameAssembler,
}

/// Exclusive access to the line. Puts the transceiver back into receive
/// when released, however the holder exits.
struct LineGuard<'a> {
    inner: MutexGuard<'a, BusInner>,
    bus: &'a str,
}

impl Deref for LineGuard<'_> {
    type Target = BusInner;

    fn deref(&self) -> &BusInner {
        &self.inner
    }
}

impl DerefMut for LineGuard<'_> {
    fn deref_mut(&mut self) -> &mut BusInner {
        &mut self.inner
    }
}

impl Drop for LineGuard<'_> {
    fn drop(&mut self) {
        let transport = &mut self.inner.transport;
        if transport.direction() != DirectionState::Receive {
            warn!(bus = %self.bus, "line released while transmitting, forcing receive");
            if let Err(e) = transport.set_direction(DirectionState::Receive) {
                warn!(bus = %self.bus, error = %e, "could not restore receive direction");
            }
        }
    }
}

/// Driver-enabled window around one transmission
struct TransmitScope<'a> {
    transport: &'a mut dyn BusTransport,
    released: bool,
}

impl<'a> TransmitScope<'a> {
    fn enter(transport: &'a mut dyn BusTransport) -> Result<Self, TransportError> {
        transport.set_direction(DirectionState::Transmit)?;
        Ok(Self {
            transport,
            released: false,
        })
    }

    fn release(mut self) -> Result<(), TransportError> {
        let result = self.transport.set_direction(DirectionState::Receive);
        self.released = result.is_ok();
        result
    }
}

impl<'a> Deref for TransmitScope<'a> {
    type Target = dyn BusTransport + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.transport
    }
}

impl DerefMut for TransmitScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.transport
    }
}

impl Drop for TransmitScope<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.transport.set_direction(DirectionState::Receive) {
                warn!(error = %e, "could not restore receive direction");
            }
        }
    }
}

/// Publishes an attempt as the last transaction. An attempt dropped before
/// reaching a terminal state (cancelled, past the deadline) is published as
/// failed.
struct AttemptRecord<'a> {
    tx: Transaction,
    last: &'a RwLock<Option<Transaction>>,
}

impl AttemptRecord<'_> {
    fn finish(&mut self, state: TransactionState) {
        self.tx.advance(state);
        *self.last.write() = Some(self.tx.clone());
    }
}

impl Drop for AttemptRecord<'_> {
    fn drop(&mut self) {
        if !self.tx.state().is_terminal() {
            trace!(transaction = self.tx.id(), attempt = self.tx.attempt(), state = %self.tx.state(), "attempt abandoned");
            self.finish(TransactionState::Failed);
        }
    }
}

/// Master side of one half-duplex bus
pub struct Bus {
    id: Uuid,
    name: String,
    channel: ChannelConfig,
    timing: TimingProfile,
    frame: FrameProfile,
    retry: RetryPolicy,
    traffic: Option<SharedTrafficLogger>,
    inner: Mutex<BusInner>,
    stats: RwLock<BusStats>,
    last: RwLock<Option<Transaction>>,
    next_id: AtomicU64,
}

impl Bus {
    /// Take ownership of `transport` and put the line into receive
    pub fn new<T: BusTransport + 'static>(transport: T, options: BusOptions) -> Result<Self, TransactionError> {
        Self::from_boxed(Box::new(transport), options)
    }

    /// Same as [`Bus::new`] for an already boxed transport
    pub fn from_boxed(mut transport: Box<dyn BusTransport>, options: BusOptions) -> Result<Self, TransactionError> {
        let channel = transport.channel();
        channel.validate()?;

        let timing = options
            .timing
            .unwrap_or_else(|| TimingProfile::for_channel(&channel));
        if timing.poll_interval.is_zero() {
            return Err(TransactionError::Configuration(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if timing.max_polls == 0 {
            return Err(TransactionError::Configuration(
                "poll limit must be greater than zero".to_string(),
            ));
        }
        transport.set_direction(DirectionState::Receive)?;

        info!(
            bus = %options.name,
            channel = %channel.describe(),
            silence_us = timing.inter_frame_silence_us(),
            "bus ready"
        );

        Ok(Self {
            id: Uuid::new_v4(),
            name: options.name,
            channel: channel.clone(),
            timing,
            frame: options.frame,
            retry: options.retry,
            traffic: options.traffic,
            inner: Mutex::new(BusInner {
                transport,
                assembler: FrameAssembler::new(channel.read_buffer_limit),
            }),
            stats: RwLock::new(BusStats::default()),
            last: RwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    /// Unique bus id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bus name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel parameters
    pub fn channel(&self) -> &ChannelConfig {
        &self.channel
    }

    /// Timing in effect
    pub fn timing(&self) -> &TimingProfile {
        &self.timing
    }

    /// Frame rules in effect
    pub fn frame_profile(&self) -> &FrameProfile {
        &self.frame
    }

    /// Retry policy in effect
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Get statistics
    pub fn stats(&self) -> BusStats {
        self.stats.read().clone()
    }

    /// Last attempt that reached a terminal state
    pub fn last_transaction(&self) -> Option<Transaction> {
        self.last.read().clone()
    }

    /// Transport statistics; waits for the line
    pub async fn transport_stats(&self) -> TransportStats {
        self.inner.lock().await.transport.stats()
    }

    /// Direction line state; waits for the line
    pub async fn direction(&self) -> DirectionState {
        self.inner.lock().await.transport.direction()
    }

    /// Give the transport back
    pub fn into_transport(self) -> Box<dyn BusTransport> {
        self.inner.into_inner().transport
    }

    /// Send `request` and return the response frame
    pub async fn send_receive(&self, request: impl Into<Frame>) -> Result<Frame, TransactionError> {
        self.send_receive_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// [`Bus::send_receive`] that stops when `cancel` fires
    pub async fn send_receive_with_cancel(
        &self,
        request: impl Into<Frame>,
        cancel: &CancellationToken,
    ) -> Result<Frame, TransactionError> {
        let request = request.into();
        let response = self
            .execute(TransactionKind::SendReceive, Some(&request), None, cancel)
            .await?;
        response.ok_or_else(|| TransactionError::NoResponse(self.timing.response_timeout))
    }

    /// Send `request` without waiting for a response
    pub async fn send(&self, request: impl Into<Frame>) -> Result<(), TransactionError> {
        self.send_with_cancel(request, &CancellationToken::new()).await
    }

    /// [`Bus::send`] that stops when `cancel` fires
    pub async fn send_with_cancel(
        &self,
        request: impl Into<Frame>,
        cancel: &CancellationToken,
    ) -> Result<(), TransactionError> {
        let request = request.into();
        self.execute(TransactionKind::SendOnly, Some(&request), None, cancel)
            .await
            .map(|_| ())
    }

    /// Wait up to `timeout` for one unsolicited frame
    pub async fn receive(&self, timeout: Duration) -> Result<Frame, TransactionError> {
        self.receive_with_cancel(timeout, &CancellationToken::new())
            .await
    }

    /// [`Bus::receive`] that stops when `cancel` fires
    pub async fn receive_with_cancel(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Frame, TransactionError> {
        let response = self
            .execute(TransactionKind::ReceiveOnly, None, Some(timeout), cancel)
            .await?;
        response.ok_or(TransactionError::NoResponse(timeout))
    }

    async fn execute(
        &self,
        kind: TransactionKind,
        request: Option<&Frame>,
        listen: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Frame>, TransactionError> {
        if request.is_some_and(|r| r.is_empty()) {
            return Err(TransactionError::InvalidRequest(
                "request frame is empty".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.stats.write().transactions += 1;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransactionError::CancellationRequested),
            result = self.run_exclusive(id, kind, request, listen) => result,
        };

        self.record(id, &outcome);
        outcome
    }

    async fn run_exclusive(
        &self,
        id: u64,
        kind: TransactionKind,
        request: Option<&Frame>,
        listen: Option<Duration>,
    ) -> Result<Option<Frame>, TransactionError> {
        let mut line = LineGuard {
            inner: self.inner.lock().await,
            bus: &self.name,
        };
        trace!(bus = %self.name, transaction = id, "line acquired");

        let attempts = self.run_attempts(&mut line, id, kind, request, listen);
        match self.retry.deadline() {
            Some(limit) => tokio::time::timeout(limit, attempts)
                .await
                .map_err(|_| TransactionError::DeadlineExceeded(limit))?,
            None => attempts.await,
        }
    }

    async fn run_attempts(
        &self,
        line: &mut BusInner,
        id: u64,
        kind: TransactionKind,
        request: Option<&Frame>,
        listen: Option<Duration>,
    ) -> Result<Option<Frame>, TransactionError> {
        let mut attempt = 1;
        loop {
            let mut record = AttemptRecord {
                tx: Transaction::new(id, attempt, kind),
                last: &self.last,
            };
            let result = self.attempt(line, &mut record.tx, request, listen).await;

            match result {
                Ok(frame) => {
                    record.finish(TransactionState::Complete);
                    debug!(
                        bus = %self.name,
                        transaction = id,
                        attempt,
                        elapsed_us = u64::try_from(record.tx.elapsed().as_micros()).unwrap_or(u64::MAX),
                        "transaction complete"
                    );
                    return Ok(frame);
                }
                Err(err) => {
                    record.finish(TransactionState::Failed);
                    let retry = kind != TransactionKind::ReceiveOnly
                        && self.retry.should_retry(&err, attempt);
                    if !retry {
                        return Err(err);
                    }
                    warn!(bus = %self.name, transaction = id, attempt, error = %err, "attempt failed, retrying");
                    self.stats.write().retries += 1;
                    let pause = self.retry.delay_for_attempt(attempt);
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        line: &mut BusInner,
        tx: &mut Transaction,
        request: Option<&Frame>,
        listen: Option<Duration>,
    ) -> Result<Option<Frame>, TransactionError> {
        let BusInner {
            transport,
            assembler,
        } = line;

        if let Some(request) = request {
            tx.advance(TransactionState::Flushing);
            let stale = transport.flush_input(self.timing.flush_grace).await? + assembler.clear();
            if stale > 0 {
                debug!(bus = %self.name, transaction = tx.id(), discarded = stale, "stale input flushed");
            }

            tx.advance(TransactionState::Transmitting);
            let settle = self
                .channel
                .direction
                .map_or(Duration::ZERO, |control| control.settle_time());
            let mut scope = TransmitScope::enter(transport.as_mut())?;
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            scope.write_bytes(request).await?;
            debug!(bus = %self.name, transaction = tx.id(), attempt = tx.attempt(), frame = %request.to_hex(), "request written");
            self.log_traffic(Direction::Sent, request);

            tx.advance(TransactionState::AwaitingTransmitComplete);
            scope
                .wait_for_transmit_complete(self.timing.transmit_timeout(request.len()))
                .await?;
            scope.release()?;

            if tx.kind() == TransactionKind::SendOnly {
                return Ok(None);
            }
        }

        tx.advance(TransactionState::Receiving);
        let first_byte = listen.unwrap_or(self.timing.response_timeout);
        let assembled = assembler
            .assemble(transport.as_mut(), &self.timing, &self.frame.boundary, first_byte)
            .await?;

        let frame = match assembled {
            Assembly::Frame(frame) => frame,
            Assembly::NoData => return Err(TransactionError::NoResponse(first_byte)),
            Assembly::Truncated(raw) => {
                self.log_traffic(Direction::Received, &raw);
                tx.advance(TransactionState::Validating);
                return Err(TransactionError::malformed("line closed mid-frame", raw));
            }
        };

        debug!(bus = %self.name, transaction = tx.id(), frame = %frame.to_hex(), "frame received");
        self.log_traffic(Direction::Received, &frame);

        tx.advance(TransactionState::Validating);
        self.frame
            .validate(&frame)
            .map_err(|reason| TransactionError::malformed(reason, frame.as_bytes().clone()))?;
        Ok(Some(frame))
    }

    fn log_traffic(&self, direction: Direction, data: &[u8]) {
        if let Some(logger) = &self.traffic {
            logger.lock().log(&self.name, direction, data);
        }
    }

    fn record(&self, id: u64, outcome: &Result<Option<Frame>, TransactionError>) {
        let mut stats = self.stats.write();
        let Err(err) = outcome else {
            stats.completed += 1;
            return;
        };

        stats.failed += 1;
        match err.kind() {
            FailureKind::NoResponse => stats.no_response += 1,
            FailureKind::MalformedResponse => stats.malformed += 1,
            FailureKind::TransmitTimeout => stats.transmit_timeouts += 1,
            FailureKind::Cancelled => stats.cancelled += 1,
            FailureKind::DeadlineExceeded => stats.deadline_exceeded += 1,
            _ => {}
        }
        debug!(bus = %self.name, transaction = id, error = %err, "transaction failed");
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::modbus;
    use crate::core::simulator::{
        DeviceTemplates, MatchCondition, ResponseAction, ResponseRule, SimHandle, SimulatedBus,
        VirtualDevice, WireEvent,
    };
    use crate::core::transport::{DirectionControl, MockBusTransport};
    use std::sync::Arc;

    const REPLY: [u8; 5] = [0x01, 0x03, 0x02, 0x00, 0x2A];

    fn channel() -> ChannelConfig {
        ChannelConfig::new("sim", 9600).direction(DirectionControl::default())
    }

    fn replying(delay_ms: u64, data: &[u8]) -> VirtualDevice {
        VirtualDevice::new("slave").with_rule(ResponseRule::new(
            "reply",
            MatchCondition::Any,
            ResponseAction::Sequence(vec![
                ResponseAction::Delay { ms: delay_ms },
                ResponseAction::Send { data: data.to_vec() },
            ]),
        ))
    }

    fn bus_with(device: VirtualDevice, options: BusOptions) -> (Bus, SimHandle) {
        let sim = SimulatedBus::new(channel(), device);
        let handle = sim.handle();
        (Bus::new(sim, options).unwrap(), handle)
    }

    #[test]
    fn test_state_graph() {
        use TransactionState::*;

        let mut tx = Transaction::new(1, 1, TransactionKind::SendReceive);
        assert!(tx.can_advance(Flushing));
        assert!(!tx.can_advance(Receiving));
        for next in [Flushing, Transmitting, AwaitingTransmitComplete] {
            tx.advance(next);
        }
        assert!(!tx.can_advance(Complete));
        assert!(tx.can_advance(Receiving));
        tx.advance(Failed);
        assert!(!tx.can_advance(Failed));

        let send_only = Transaction {
            state: AwaitingTransmitComplete,
            ..Transaction::new(2, 1, TransactionKind::SendOnly)
        };
        assert!(send_only.can_advance(Complete));
        assert!(!send_only.can_advance(Receiving));

        let listen = Transaction::new(3, 1, TransactionKind::ReceiveOnly);
        assert!(listen.can_advance(Receiving));
        assert!(!listen.can_advance(Flushing));
    }

    #[test]
    fn test_error_kinds() {
        let err: TransactionError = TransportError::TransmitTimeout(Duration::from_millis(5)).into();
        assert_eq!(err.kind(), FailureKind::TransmitTimeout);
        let err: TransactionError = TransportError::Disconnected.into();
        assert_eq!(err.kind(), FailureKind::Transport);

        let malformed = TransactionError::malformed("crc", vec![0xAB]);
        assert_eq!(malformed.raw_response().map(|b| b.to_vec()), Some(vec![0xAB]));
        assert!(malformed.to_string().contains("ab"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_receive_complete() {
        let (bus, handle) = bus_with(replying(3, &REPLY), BusOptions::default());

        let response = bus.send_receive([0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).await.unwrap();
        assert_eq!(&response[..], &REPLY);

        let last = bus.last_transaction().unwrap();
        assert_eq!(
            last.trail(),
            &[
                TransactionState::Idle,
                TransactionState::Flushing,
                TransactionState::Transmitting,
                TransactionState::AwaitingTransmitComplete,
                TransactionState::Receiving,
                TransactionState::Validating,
                TransactionState::Complete,
            ]
        );

        assert_eq!(handle.direction(), DirectionState::Receive);
        assert_eq!(handle.writes_while_receiving(), 0);
        assert_eq!(
            handle.events(),
            vec![
                WireEvent::Direction(DirectionState::Transmit),
                WireEvent::Write {
                    data: vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01],
                    direction: DirectionState::Transmit,
                },
                WireEvent::Direction(DirectionState::Receive),
            ]
        );
        assert_eq!(bus.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_is_retried() {
        let (bus, handle) = bus_with(VirtualDevice::new("absent"), BusOptions::default());

        let err = bus.send_receive([0x05, 0x03]).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::NoResponse);
        assert_eq!(handle.written().len(), 3);
        assert_eq!(bus.stats().retries, 2);
        assert_eq!(bus.stats().no_response, 1);
        assert_eq!(
            bus.last_transaction().map(|t| (t.attempt(), t.state())),
            Some((3, TransactionState::Failed))
        );
        assert_eq!(handle.direction(), DirectionState::Receive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_not_retried_by_default() {
        let mut corrupt = modbus::build_read_response(1, 0x03, &[42]);
        corrupt[3] ^= 0xFF;
        let options = BusOptions::default().frame(FrameProfile::modbus_rtu());
        let (bus, handle) = bus_with(replying(2, &corrupt), options);

        let request = modbus::build_rtu_request(1, modbus::FunctionCode::ReadHoldingRegisters, 0, 1);
        let err = bus.send_receive(request).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::MalformedResponse);
        assert_eq!(err.raw_response().map(|b| b.to_vec()), Some(corrupt));
        assert_eq!(handle.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_retried_when_enabled() {
        let good = modbus::build_read_response(1, 0x03, &[42]);
        let mut corrupt = good.clone();
        corrupt[4] ^= 0x01;
        let device = VirtualDevice::new("noisy")
            .with_rule(ResponseRule::new("bad", MatchCondition::Any, ResponseAction::Send { data: corrupt }).priority(5).once())
            .with_rule(ResponseRule::new("good", MatchCondition::Any, ResponseAction::Send { data: good.clone() }));
        let options = BusOptions::default()
            .frame(FrameProfile::modbus_rtu())
            .retry(RetryPolicy::default().with_retry_malformed(true));
        let (bus, handle) = bus_with(device, options);

        let request = modbus::build_rtu_request(1, modbus::FunctionCode::ReadHoldingRegisters, 0, 1);
        let response = bus.send_receive(request).await.unwrap();
        assert_eq!(response.to_vec(), good);
        assert_eq!(handle.written().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmit_timeout_releases_line() {
        let (bus, handle) = bus_with(replying(1, &REPLY), BusOptions::default());
        handle.stall_transmit(true);

        let err = bus.send_receive([0x01]).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::TransmitTimeout);
        assert_eq!(handle.written().len(), 3);
        assert_eq!(handle.direction(), DirectionState::Receive);
        assert_eq!(bus.stats().transmit_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_line() {
        let (bus, handle) = bus_with(replying(500, &REPLY), BusOptions::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = bus.send_receive_with_cancel([0x01], &cancel).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Cancelled);
        assert_eq!(handle.direction(), DirectionState::Receive);
        assert_eq!(bus.stats().cancelled, 1);

        let abandoned = bus.last_transaction().unwrap();
        assert_eq!(abandoned.state(), TransactionState::Failed);
        assert_eq!(abandoned.attempt(), 1);
        assert!(abandoned.trail().contains(&TransactionState::Receiving));

        // the late reply to the cancelled request is flushed, not returned
        tokio::time::sleep(Duration::from_millis(600)).await;
        let response = bus.send_receive([0x02]).await.unwrap();
        assert_eq!(&response[..], &REPLY);
        assert!(handle
            .events()
            .iter()
            .any(|e| matches!(e, WireEvent::Flush(n) if *n == REPLY.len())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_releases_line() {
        let (bus, handle) = bus_with(replying(1, &REPLY), BusOptions::default());

        // 8 bytes take about 8 ms at 9600 baud
        let abandoned =
            tokio::time::timeout(Duration::from_millis(4), bus.send_receive([0u8; 8])).await;
        assert!(abandoned.is_err());
        assert_eq!(handle.direction(), DirectionState::Receive);
        assert_eq!(
            handle.events().last(),
            Some(&WireEvent::Direction(DirectionState::Receive))
        );
        assert_eq!(bus.direction().await, DirectionState::Receive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_all_attempts() {
        let options = BusOptions::default().retry(RetryPolicy::default().with_deadline(Duration::from_millis(50)));
        let (bus, handle) = bus_with(VirtualDevice::new("absent"), options);

        let started = Instant::now();
        let err = bus.send_receive([0x01]).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::DeadlineExceeded);
        assert!(started.elapsed() < Duration::from_millis(60));
        assert_eq!(handle.direction(), DirectionState::Receive);

        let stats = bus.stats();
        assert_eq!(stats.deadline_exceeded, 1);
        assert_eq!(stats.failed, 1);
        let last = bus.last_transaction().unwrap();
        assert_eq!(last.state(), TransactionState::Failed);
        assert_eq!(
            last.trail(),
            &[
                TransactionState::Idle,
                TransactionState::Flushing,
                TransactionState::Transmitting,
                TransactionState::AwaitingTransmitComplete,
                TransactionState::Receiving,
                TransactionState::Failed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_only() {
        let (bus, handle) = bus_with(replying(1, &REPLY), BusOptions::default());
        bus.send([0xFF, 0x00]).await.unwrap();

        let last = bus.last_transaction().unwrap();
        assert_eq!(last.kind(), TransactionKind::SendOnly);
        assert_eq!(
            &last.trail()[last.trail().len() - 2..],
            &[TransactionState::AwaitingTransmitComplete, TransactionState::Complete]
        );
        assert_eq!(handle.written(), vec![vec![0xFF, 0x00]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_only() {
        let (bus, handle) = bus_with(VirtualDevice::new("talker"), BusOptions::default());
        handle.schedule(Duration::from_millis(30), b"unsolicited");

        let frame = bus.receive(Duration::from_millis(100)).await.unwrap();
        assert_eq!(&frame[..], b"unsolicited");
        assert!(handle.events().is_empty());

        let err = bus.receive(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::NoResponse);
        assert_eq!(bus.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_request_rejected() {
        let (bus, handle) = bus_with(replying(1, &REPLY), BusOptions::default());
        let err = bus.send_receive(Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidRequest);
        assert!(handle.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_transactions_are_serialized() {
        let (bus, handle) = bus_with(DeviceTemplates::echo(), BusOptions::default());

        let (a, b) = tokio::join!(bus.send_receive(*b"first"), bus.send_receive(*b"second"));
        assert_eq!(&a.unwrap()[..], b"first");
        assert_eq!(&b.unwrap()[..], b"second");

        let directions: Vec<WireEvent> = handle
            .events()
            .into_iter()
            .filter(|e| !matches!(e, WireEvent::Flush(_)))
            .collect();
        assert_eq!(
            directions,
            vec![
                WireEvent::Direction(DirectionState::Transmit),
                WireEvent::Write { data: b"first".to_vec(), direction: DirectionState::Transmit },
                WireEvent::Direction(DirectionState::Receive),
                WireEvent::Direction(DirectionState::Transmit),
                WireEvent::Write { data: b"second".to_vec(), direction: DirectionState::Transmit },
                WireEvent::Direction(DirectionState::Receive),
            ]
        );
    }

    #[tokio::test]
    async fn test_write_failure_restores_direction() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        let mut mock = MockBusTransport::new();
        mock.expect_channel().return_const(ChannelConfig::new("mock", 9600));
        mock.expect_set_direction().returning(move |state| {
            log.lock().push(state);
            Ok(())
        });
        mock.expect_direction().return_const(DirectionState::Receive);
        mock.expect_flush_input().returning(|_| Ok(0));
        mock.expect_write_bytes().times(1).returning(|_| {
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "adapter unplugged",
            )))
        });

        let bus = Bus::new(mock, BusOptions::default()).unwrap();
        let err = bus.send_receive([0x01, 0x02]).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Transport);
        assert_eq!(
            *seen.lock(),
            vec![DirectionState::Receive, DirectionState::Transmit, DirectionState::Receive]
        );
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let mut mock = MockBusTransport::new();
        mock.expect_channel().return_const(ChannelConfig::new("mock", 0));
        let err = Bus::new(mock, BusOptions::default()).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
    }

    #[tokio::test]
    async fn test_zero_poll_limit_rejected() {
        let mut timing = TimingProfile::for_channel(&channel());
        timing.max_polls = 0;
        let sim = SimulatedBus::new(channel(), VirtualDevice::new("idle"));

        let err = Bus::new(sim, BusOptions::default().timing(timing)).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Configuration);
        assert!(err.to_string().contains("poll limit"));
    }
}
