//! Poll batches
//!
//! Runs a list of raw requests on one bus in order and aggregates the
//! outcome per request. The first byte of every request is taken as the
//! slave address, so a slave that stops answering can be skipped for the
//! rest of the batch instead of burning a full retry cycle per request.

use crate::core::protocol::framing::Frame;
use crate::core::transaction::{Bus, FailureKind, TransactionError};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do after a request fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorStrategy {
    /// Stop the batch at the first failure
    StopOnError,
    /// Send every request regardless of earlier failures
    ContinueOnError,
    /// Skip the remaining requests of a slave that failed
    #[default]
    SkipFailedSlave,
}

/// Batch definition
#[derive(Debug, Clone)]
pub struct PollBatch {
    /// Batch name
    pub name: String,
    /// Requests, sent in order
    pub requests: Vec<Frame>,
    /// Error handling
    pub strategy: ErrorStrategy,
}

impl PollBatch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requests: Vec::new(),
            strategy: ErrorStrategy::default(),
        }
    }

    /// Add request
    #[must_use]
    pub fn with_request(mut self, request: impl Into<Frame>) -> Self {
        self.requests.push(request.into());
        self
    }

    /// Add a request given as hex
    pub fn with_hex(self, hex: &str) -> Result<Self, hex::FromHexError> {
        Ok(self.with_request(Frame::from_hex(hex)?))
    }

    /// Set error strategy
    #[must_use]
    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Run on `bus`
    pub async fn run(&self, bus: &Bus) -> BatchResult {
        self.run_with_cancel(bus, &CancellationToken::new()).await
    }

    /// Run on `bus` until done or `cancel` fires
    pub async fn run_with_cancel(&self, bus: &Bus, cancel: &CancellationToken) -> BatchResult {
        let start = Instant::now();
        let mut result = BatchResult::new(self.name.clone());
        let mut failed_slaves = HashSet::new();
        let mut stopped = false;

        info!(batch = %self.name, bus = %bus.name(), requests = self.requests.len(), "batch started");

        for (index, request) in self.requests.iter().enumerate() {
            let slave = request.first().copied().unwrap_or_default();

            let skip = stopped
                || (self.strategy == ErrorStrategy::SkipFailedSlave
                    && failed_slaves.contains(&slave));
            if skip {
                debug!(batch = %self.name, index, slave, "request skipped");
                result.results.push(OperationResult {
                    index,
                    slave,
                    request: request.clone(),
                    outcome: RequestOutcome::Skipped,
                    duration: Duration::ZERO,
                });
                continue;
            }

            let started = Instant::now();
            let outcome = match bus.send_receive_with_cancel(request.clone(), cancel).await {
                Ok(response) => RequestOutcome::Response(response),
                Err(err) => {
                    warn!(batch = %self.name, index, slave, error = %err, "request failed");
                    match err.kind() {
                        FailureKind::Cancelled => {
                            result.cancelled = true;
                            stopped = true;
                        }
                        _ if self.strategy == ErrorStrategy::StopOnError => stopped = true,
                        _ => {}
                    }
                    failed_slaves.insert(slave);
                    RequestOutcome::Failed(err)
                }
            };

            result.results.push(OperationResult {
                index,
                slave,
                request: request.clone(),
                outcome,
                duration: started.elapsed(),
            });
        }

        result.total_duration = start.elapsed();
        info!(batch = %self.name, "{}", result.summary());
        result
    }
}

/// How one request ended
#[derive(Debug)]
pub enum RequestOutcome {
    /// Valid response frame
    Response(Frame),
    /// Transaction failed
    Failed(TransactionError),
    /// Not sent
    Skipped,
}

/// Result of a single request
#[derive(Debug)]
pub struct OperationResult {
    /// Position in the batch
    pub index: usize,
    /// Slave address (first request byte)
    pub slave: u8,
    /// Request as sent
    pub request: Frame,
    /// Outcome
    pub outcome: RequestOutcome,
    /// Time spent, including retries
    pub duration: Duration,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RequestOutcome::Response(_))
    }

    /// Response frame, if any
    pub fn response(&self) -> Option<&Frame> {
        match &self.outcome {
            RequestOutcome::Response(frame) => Some(frame),
            _ => None,
        }
    }

    /// Error, if the request failed
    pub fn error(&self) -> Option<&TransactionError> {
        match &self.outcome {
            RequestOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Result from batch execution
#[derive(Debug)]
pub struct BatchResult {
    /// Batch name
    pub name: String,
    /// Per-request results, in batch order
    pub results: Vec<OperationResult>,
    /// Batch stopped by cancellation
    pub cancelled: bool,
    /// Total execution time
    pub total_duration: Duration,
}

impl BatchResult {
    fn new(name: String) -> Self {
        Self {
            name,
            results: Vec::new(),
            cancelled: false,
            total_duration: Duration::ZERO,
        }
    }

    /// Every request got a valid response
    pub fn success(&self) -> bool {
        self.results.iter().all(OperationResult::is_success)
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.error().is_some()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, RequestOutcome::Skipped))
            .count()
    }

    /// Slaves with at least one failed request, in first-failure order
    pub fn failed_slaves(&self) -> Vec<u8> {
        let mut slaves = Vec::new();
        for result in self.results.iter().filter(|r| r.error().is_some()) {
            if !slaves.contains(&result.slave) {
                slaves.push(result.slave);
            }
        }
        slaves
    }

    /// First failure, used for the process exit status
    pub fn first_error(&self) -> Option<&TransactionError> {
        self.results.iter().find_map(OperationResult::error)
    }

    /// Success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.succeeded() as f64 / self.results.len() as f64
    }

    /// Get summary string
    pub fn summary(&self) -> String {
        format!(
            "Batch '{}': {} ok, {} failed, {} skipped, {:.1}% success rate, took {:?}",
            self.name,
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.success_rate() * 100.0,
            self.total_duration
        )
    }
}
