//! Link configuration file

use crate::core::batch::PollBatch;
use crate::core::logger::LogFormat;
use crate::core::protocol::framing::{Frame, FrameProfile};
use crate::core::retry::RetryPolicy;
use crate::core::timing::{TimingOverrides, TimingProfile};
use crate::core::transaction::BusOptions;
use crate::core::transport::ChannelConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Request {index} is not valid hex: {source}")]
    InvalidRequest {
        index: usize,
        #[source]
        source: hex::FromHexError,
    },

    #[error("Invalid channel: {0}")]
    Channel(String),
}

/// One bus link: channel, timing, framing, retries and the poll list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bus name used in logs
    pub name: String,
    /// Poll list, one hex-encoded raw request per entry
    pub requests: Vec<String>,
    /// Physical channel
    pub channel: ChannelConfig,
    /// Timing overrides
    pub timing: TimingOverrides,
    /// Retry policy
    pub retry: RetryPolicy,
    /// Frame boundary and checksum
    pub framing: FrameProfile,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: "rs485".to_string(),
            requests: Vec::new(),
            channel: ChannelConfig::default(),
            timing: TimingOverrides::default(),
            retry: RetryPolicy::default(),
            framing: FrameProfile::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Load from the default location, or defaults if there is no file
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::default_config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)
    }

    /// Check channel parameters and the poll list
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel
            .validate()
            .map_err(|e| ConfigError::Channel(e.to_string()))?;
        self.request_frames().map(|_| ())
    }

    /// Timing derived from the channel with the overrides applied
    pub fn timing_profile(&self) -> TimingProfile {
        TimingProfile::for_channel(&self.channel).apply(&self.timing)
    }

    /// Options for building a bus from this link
    pub fn bus_options(&self) -> BusOptions {
        BusOptions::default()
            .name(&self.name)
            .timing(self.timing_profile())
            .frame(self.framing.clone())
            .retry(self.retry.clone())
    }

    /// Poll list as frames
    pub fn request_frames(&self) -> Result<Vec<Frame>, ConfigError> {
        self.requests
            .iter()
            .enumerate()
            .map(|(index, hex)| {
                Frame::from_hex(hex).map_err(|source| ConfigError::InvalidRequest { index, source })
            })
            .collect()
    }

    /// Poll list as a batch
    pub fn poll_batch(&self) -> Result<PollBatch, ConfigError> {
        let mut batch = PollBatch::new(self.name.clone());
        batch.requests = self.request_frames()?;
        Ok(batch)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Diagnostic log filter (`RUST_LOG` syntax)
    pub level: String,
    /// Diagnostic log file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Traffic log file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_log: Option<PathBuf>,
    /// Traffic log format
    pub traffic_format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            traffic_log: None,
            traffic_format: LogFormat::Hex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::framing::FrameBoundary;
    use crate::core::protocol::ChecksumType;
    use crate::core::transport::{ControlLine, DirectionControl, SerialParity};
    use std::time::Duration;

    const SAMPLE: &str = r#"
name = "boiler-room"
requests = ["01 03 00 00 00 02 C4 0B", "020300000001840a"]

[channel]
port = "/dev/ttyUSB1"
baud_rate = 19200
parity = "even"

[channel.direction]
line = "dtr"
transmit_level = false

[timing]
response_timeout_ms = 250

[retry]
max_attempts = 5
retry_malformed = true

[framing]
checksum = "crc16_modbus"

[framing.boundary]
type = "modbus_rtu"

[logging]
level = "debug"
traffic_format = "csv"
"#;

    #[test]
    fn test_parse_sample() {
        let config: LinkConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.name, "boiler-room");
        assert_eq!(config.channel.baud_rate, 19200);
        assert_eq!(config.channel.data_bits, 8);
        assert_eq!(config.channel.parity, SerialParity::Even);
        assert_eq!(
            config.channel.direction,
            Some(DirectionControl::new(ControlLine::Dtr).inverted())
        );
        assert_eq!(config.retry.attempts(), 5);
        assert_eq!(config.framing.boundary, FrameBoundary::ModbusRtu);
        assert_eq!(config.framing.checksum, ChecksumType::Crc16Modbus);
        assert_eq!(config.logging.traffic_format, LogFormat::Csv);

        let timing = config.timing_profile();
        assert_eq!(timing.response_timeout, Duration::from_millis(250));
        assert_eq!(timing.inter_frame_silence_us(), 2005);

        let batch = config.poll_batch().unwrap();
        assert_eq!(batch.name, "boiler-room");
        assert_eq!(batch.requests[1][0], 0x02);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = LinkConfig::default();
        config.requests.push("01 03 00 00 00 01 84 0A".to_string());
        config.channel = ChannelConfig::new("COM4", 38400).direction(DirectionControl::default());
        config.framing = FrameProfile::modbus_rtu();
        config.timing.max_polls = Some(64);

        config.save_to(&path).unwrap();
        let loaded = LinkConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_entries() {
        let mut config = LinkConfig::default();
        config.requests = vec!["0103".into(), "zz".into()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRequest { index: 1, .. })
        ));

        config.requests.clear();
        config.channel.stop_bits = 3;
        assert!(matches!(config.validate(), Err(ConfigError::Channel(_))));

        let missing = LinkConfig::load_from(Path::new("/nonexistent/buslink.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
