//! Bus timing
//!
//! Derives the inter-frame silence and the receive deadlines from the channel
//! parameters. The silence is 3.5 character times, with the character taken
//! as `data_bits + stop_bits + 2` bits. Above 19200 baud it is pinned to
//! 1750 µs.

use crate::core::transport::ChannelConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest baud rate for which the silence scales with the character time
pub const PROPORTIONAL_SILENCE_MAX_BAUD: u32 = 19_200;
/// Silence used above [`PROPORTIONAL_SILENCE_MAX_BAUD`]
pub const FIXED_SILENCE_US: u64 = 1_750;

/// Default wait for the first response byte
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);
/// Default ceiling on one frame, measured from its first byte
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(2000);
/// Default timeout of a single read poll
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Default cap on read polls per frame
pub const DEFAULT_MAX_POLLS: u32 = 1024;
/// Default window in which late stale bytes are still flushed
pub const DEFAULT_FLUSH_GRACE: Duration = Duration::from_millis(1);

const TRANSMIT_MARGIN: Duration = Duration::from_millis(100);

/// Inter-frame silence in microseconds
///
/// `baud_rate` must be non-zero; [`ChannelConfig::validate`] rejects zero.
pub fn inter_frame_silence_us(baud_rate: u32, data_bits: u8, stop_bits: u8) -> u64 {
    if baud_rate <= PROPORTIONAL_SILENCE_MAX_BAUD {
        let bits = u64::from(data_bits) + u64::from(stop_bits) + 2;
        3_500_000 * bits / u64::from(baud_rate.max(1))
    } else {
        FIXED_SILENCE_US
    }
}

/// Timing for one bus, computed once per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingProfile {
    /// Quiet time that closes a frame
    pub inter_frame_silence: Duration,
    /// Wait for the first response byte
    pub response_timeout: Duration,
    /// Ceiling on one frame once its first byte arrived
    pub frame_timeout: Duration,
    /// Timeout of each read poll
    pub poll_interval: Duration,
    /// Cap on read polls per frame, counted from its first byte
    pub max_polls: u32,
    /// Grace window of the input flush
    pub flush_grace: Duration,
    character_time: Duration,
}

impl TimingProfile {
    /// Derive the profile for a channel
    pub fn for_channel(channel: &ChannelConfig) -> Self {
        let silence_us =
            inter_frame_silence_us(channel.baud_rate, channel.data_bits, channel.stop_bits);
        let bits = u64::from(channel.bits_per_character());
        let baud = u64::from(channel.baud_rate.max(1));

        Self {
            inter_frame_silence: Duration::from_micros(silence_us),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
            flush_grace: DEFAULT_FLUSH_GRACE,
            character_time: Duration::from_nanos(bits * 1_000_000_000 / baud),
        }
    }

    /// Silence threshold in whole microseconds
    pub fn inter_frame_silence_us(&self) -> u64 {
        u64::try_from(self.inter_frame_silence.as_micros()).unwrap_or(u64::MAX)
    }

    /// Time one character occupies on the wire
    pub fn character_time(&self) -> Duration {
        self.character_time
    }

    /// Time `len` bytes occupy on the wire
    pub fn wire_time(&self, len: usize) -> Duration {
        let chars = u32::try_from(len).unwrap_or(u32::MAX);
        self.character_time.saturating_mul(chars)
    }

    /// Bound on the wait for transmit completion: twice the wire time plus a
    /// fixed margin for driver latency
    pub fn transmit_timeout(&self, len: usize) -> Duration {
        self.wire_time(len).saturating_mul(2).saturating_add(TRANSMIT_MARGIN)
    }

    /// Set the first-byte timeout
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the frame ceiling
    #[must_use]
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Set the poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the poll cap
    #[must_use]
    pub fn with_max_polls(mut self, polls: u32) -> Self {
        self.max_polls = polls.max(1);
        self
    }

    /// Set the flush grace window
    #[must_use]
    pub fn with_flush_grace(mut self, grace: Duration) -> Self {
        self.flush_grace = grace;
        self
    }

    /// Override the computed silence
    #[must_use]
    pub fn with_inter_frame_silence(mut self, silence: Duration) -> Self {
        self.inter_frame_silence = silence;
        self
    }

    /// Apply configured overrides
    #[must_use]
    pub fn apply(mut self, overrides: &TimingOverrides) -> Self {
        if let Some(ms) = overrides.response_timeout_ms {
            self.response_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.frame_timeout_ms {
            self.frame_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(polls) = overrides.max_polls {
            self = self.with_max_polls(polls);
        }
        if let Some(us) = overrides.flush_grace_us {
            self.flush_grace = Duration::from_micros(us);
        }
        if let Some(us) = overrides.inter_frame_silence_us {
            self.inter_frame_silence = Duration::from_micros(us);
        }
        self
    }
}

/// Optional overrides of the derived timing, as read from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_polls: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_grace_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inter_frame_silence_us: Option<u64>,
}
