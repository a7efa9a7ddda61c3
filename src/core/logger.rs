//! Raw traffic logging
//!
//! [`TrafficLogger`] records every chunk a session writes or receives,
//! timestamped, in one of several line formats. Attach it to a session
//! with [`TrafficLogger::attach`]; it subscribes to the session's raw
//! data and sent-bytes registries.

use crate::core::observer::SubscriptionId;
use crate::core::session::DeviceSession;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Timestamp, direction and lossy text
    Text,
    /// Hex dump
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
            LogFormat::Text => "txt",
            LogFormat::Hex => "hex",
            LogFormat::Csv => "csv",
            LogFormat::JsonLines => "jsonl",
        }
    }
}

/// Data direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    Received,
    /// Host to device
    Sent,
}

impl Direction {
    fn tag(&self) -> &'static str {
        match self {
            Direction::Received => "RX",
            Direction::Sent => "TX",
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the chunk was seen
    pub timestamp: DateTime<Local>,
    /// Direction
    pub direction: Direction,
    /// Device address
    pub address: String,
    /// Chunk bytes
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

impl LogEntry {
    /// Create new entry stamped now
    pub fn new(direction: Direction, address: &str, data: &[u8]) -> Self {
        Self {
            timestamp: Local::now(),
            direction,
            address: address.to_string(),
            data: data.to_vec(),
        }
    }

    fn stamp(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    /// Format as text
    pub fn to_text(&self) -> String {
        format!(
            "[{}] {} {} {}",
            self.stamp(),
            self.address,
            self.direction.tag(),
            String::from_utf8_lossy(&self.data)
        )
    }

    /// Format as hex
    pub fn to_hex(&self) -> String {
        let hex: Vec<String> = self.data.iter().map(|b| format!("{:02X}", b)).collect();
        format!(
            "[{}] {} {} {}",
            self.stamp(),
            self.address,
            self.direction.tag(),
            hex.join(" ")
        )
    }

    /// Format as CSV
    pub fn to_csv(&self) -> String {
        format!(
            "\"{}\",\"{}\",\"{}\",\"{}\"",
            self.stamp(),
            self.address,
            self.direction.tag(),
            hex::encode_upper(&self.data)
        )
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Format in `format`
    pub fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Text => self.to_text(),
            LogFormat::Hex => self.to_hex(),
            LogFormat::Csv => self.to_csv(),
            LogFormat::JsonLines => self.to_json(),
        }
    }
}

struct LoggerState {
    file: BufWriter<File>,
    bytes_logged: usize,
    lines_logged: usize,
}

/// File-backed traffic recorder
pub struct TrafficLogger {
    path: PathBuf,
    format: LogFormat,
    state: Mutex<LoggerState>,
}

impl TrafficLogger {
    /// Open (append) `path` for logging
    pub fn create(path: impl AsRef<Path>, format: LogFormat) -> io::Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);

        if format == LogFormat::Csv && is_new {
            writeln!(writer, "Timestamp,Address,Direction,Hex")?;
        }

        tracing::info!("Traffic log: {}", path.display());
        Ok(Arc::new(Self {
            path,
            format,
            state: Mutex::new(LoggerState {
                file: writer,
                bytes_logged: 0,
                lines_logged: 0,
            }),
        }))
    }

    /// Log file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one chunk
    pub fn log(&self, direction: Direction, address: &str, data: &[u8]) {
        let line = LogEntry::new(direction, address, data).render(self.format);
        let mut state = self.state.lock();

        if let Err(e) = writeln!(state.file, "{}", line) {
            tracing::warn!("Traffic log write failed: {}", e);
            return;
        }
        state.bytes_logged += data.len();
        state.lines_logged += 1;

        // Flush periodically
        if state.lines_logged % 100 == 0 {
            let _ = state.file.flush();
        }
    }

    /// Subscribe to a session's inbound and outbound traffic
    pub fn attach(self: &Arc<Self>, session: &DeviceSession) -> [SubscriptionId; 2] {
        let address = session.address().to_string();

        let rx_logger = Arc::clone(self);
        let rx_address = address.clone();
        let rx = session.on_raw_data(move |data| {
            rx_logger.log(Direction::Received, &rx_address, data);
        });

        let tx_logger = Arc::clone(self);
        let tx = session.on_sent(move |data| {
            tx_logger.log(Direction::Sent, &address, data);
        });

        [rx, tx]
    }

    /// Bytes and lines written so far
    pub fn stats(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.bytes_logged, state.lines_logged)
    }

    /// Flush to disk
    pub fn flush(&self) {
        if let Err(e) = self.state.lock().file.flush() {
            tracing::warn!("Traffic log flush failed: {}", e);
        }
    }
}

impl Drop for TrafficLogger {
    fn drop(&mut self) {
        let _ = self.state.get_mut().file.flush();
    }
}

/// Generate log filename with timestamp
pub fn generate_log_filename(prefix: &str, format: LogFormat) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!("{}_{}.{}", prefix, timestamp, format.extension())
}
