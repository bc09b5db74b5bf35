//! Bus traffic log
//!
//! Records every frame a bus sends or receives, to a file and to a bounded
//! in-memory history. Diagnostic output goes through `tracing`; this log is
//! the wire record.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Traffic logger shared between a bus and its owner
pub type SharedTrafficLogger = Arc<Mutex<TrafficLogger>>;

const DEFAULT_HISTORY: usize = 10_000;
const FLUSH_EVERY: usize = 100;

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Hex dump lines
    #[default]
    Hex,
    /// CSV with timestamp
    Csv,
    /// JSON lines
    JsonLines,
}

impl LogFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Hex => "hex",
            LogFormat::Csv => "csv",
            LogFormat::JsonLines => "jsonl",
        }
    }
}

/// Data direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Received,
    Sent,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Received => "RX",
            Direction::Sent => "TX",
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub bus: String,
    pub direction: Direction,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

impl LogEntry {
    /// Create new entry stamped now
    pub fn new(bus: &str, direction: Direction, data: Vec<u8>) -> Self {
        Self {
            timestamp: Local::now(),
            bus: bus.to_string(),
            direction,
            data,
        }
    }

    fn stamp(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    /// Format as hex
    pub fn to_hex(&self) -> String {
        let hex: Vec<String> = self.data.iter().map(|b| format!("{b:02X}")).collect();
        format!("[{}] {} {} {}", self.stamp(), self.bus, self.direction.tag(), hex.join(" "))
    }

    /// Format as CSV
    pub fn to_csv(&self) -> String {
        format!(
            "\"{}\",\"{}\",\"{}\",\"{}\"",
            self.stamp(),
            self.bus.replace('"', "\"\""),
            self.direction.tag(),
            hex::encode_upper(&self.data)
        )
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Hex => self.to_hex(),
            LogFormat::Csv => self.to_csv(),
            LogFormat::JsonLines => self.to_json(),
        }
    }
}

/// Frame-level traffic logger
pub struct TrafficLogger {
    file: Option<BufWriter<File>>,
    format: LogFormat,
    path: Option<PathBuf>,
    history: VecDeque<LogEntry>,
    max_history: usize,
    bytes_logged: usize,
    lines_logged: usize,
}

impl Default for TrafficLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficLogger {
    /// Create a logger that only keeps in-memory history
    pub fn new() -> Self {
        Self {
            file: None,
            format: LogFormat::default(),
            path: None,
            history: VecDeque::new(),
            max_history: DEFAULT_HISTORY,
            bytes_logged: 0,
            lines_logged: 0,
        }
    }

    /// Wrap for sharing with a bus
    pub fn shared(self) -> SharedTrafficLogger {
        Arc::new(Mutex::new(self))
    }

    /// Start appending to `path`
    pub fn start(&mut self, path: &Path, format: LogFormat) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        if format == LogFormat::Csv {
            writeln!(writer, "Timestamp,Bus,Direction,Hex")?;
        }

        self.file = Some(writer);
        self.format = format;
        self.path = Some(path.to_path_buf());
        self.bytes_logged = 0;
        self.lines_logged = 0;
        Ok(())
    }

    /// Stop writing to the file
    pub fn stop(&mut self) {
        if let Some(ref mut file) = self.file {
            let _ = file.flush();
        }
        self.file = None;
    }

    /// Get log path
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one frame
    pub fn log(&mut self, bus: &str, direction: Direction, data: &[u8]) {
        let entry = LogEntry::new(bus, direction, data.to_vec());

        if let Some(ref mut file) = self.file {
            if writeln!(file, "{}", entry.render(self.format)).is_ok() {
                self.bytes_logged += data.len();
                self.lines_logged += 1;
                if self.lines_logged % FLUSH_EVERY == 0 {
                    let _ = file.flush();
                }
            }
        }

        self.history.push_back(entry);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    /// In-memory history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &LogEntry> {
        self.history.iter()
    }

    /// Set history size
    pub fn set_max_history(&mut self, size: usize) {
        self.max_history = size;
        while self.history.len() > size {
            self.history.pop_front();
        }
    }

    /// Bytes and lines written to the file
    pub fn stats(&self) -> (usize, usize) {
        (self.bytes_logged, self.lines_logged)
    }

    /// Flush to disk
    pub fn flush(&mut self) -> io::Result<()> {
        match self.file {
            Some(ref mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for TrafficLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Generate a log filename with timestamp
pub fn generate_log_filename(prefix: &str, format: LogFormat) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.{}", prefix, timestamp, format.extension())
}
