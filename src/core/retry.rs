//! Retry and timeout policy for bus transactions

use crate::core::transaction::{FailureKind, TransactionError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Decides whether a failed attempt is repeated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per transaction, including the first (0 is treated as 1)
    pub max_attempts: u32,
    /// Also retry when a response arrived but failed validation
    pub retry_malformed: bool,
    /// Pause before the second attempt
    pub retry_delay_ms: u64,
    /// Growth of the pause per further attempt
    pub backoff_multiplier: f32,
    /// Ceiling on all attempts of one transaction together
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_malformed: false,
            retry_delay_ms: 20,
            backoff_multiplier: 1.0,
            deadline_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` and default pauses
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Exactly one attempt
    pub fn single_attempt() -> Self {
        Self::new(1)
    }

    /// Retry malformed responses too
    #[must_use]
    pub fn with_retry_malformed(mut self, retry: bool) -> Self {
        self.retry_malformed = retry;
        self
    }

    /// Set the pause between attempts
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the backoff multiplier
    #[must_use]
    pub fn with_backoff(mut self, multiplier: f32) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Bound all attempts together
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Effective attempt count
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Overall deadline, if any
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Pause after the failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.retry_delay_ms);
        if attempt <= 1 || self.backoff_multiplier <= 1.0 {
            return base;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let factor = f64::from(self.backoff_multiplier).powi(exponent);
        Duration::from_millis((self.retry_delay_ms as f64 * factor).round() as u64)
    }

    /// Whether a failure of this kind is worth another attempt
    pub fn is_retryable(&self, error: &TransactionError) -> bool {
        match error.kind() {
            FailureKind::TransmitTimeout | FailureKind::NoResponse => true,
            FailureKind::MalformedResponse => self.retry_malformed,
            FailureKind::Configuration
            | FailureKind::InvalidRequest
            | FailureKind::Cancelled
            | FailureKind::DeadlineExceeded
            | FailureKind::Transport => false,
        }
    }

    /// Whether attempt number `attempt` (1-based) failing with `error` is
    /// followed by another one
    pub fn should_retry(&self, error: &TransactionError, attempt: u32) -> bool {
        attempt < self.attempts() && self.is_retryable(error)
    }
}
