//! Protocol resolvers
//!
//! A [`ProtocolResolver`] is the pluggable codec for one sensor firmware:
//! - `decode` turns inbound bytes into key/value telemetry updates,
//!   buffering partial frames across calls
//! - `encode` turns a logical [`Command`] into wire bytes
//!
//! Resolvers never fail on malformed input. Corrupt or unknown bytes are
//! skipped until the next recognizable frame start and counted in
//! [`ResolverStats`].

pub mod checksum;
pub mod wit;

pub use wit::{keys, WitBle5Resolver, WitSerialResolver};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One decoded telemetry value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryUpdate {
    /// Telemetry key, e.g. `AngleX` or `61_0`
    pub key: String,
    /// Decoded value
    pub value: String,
}

impl TelemetryUpdate {
    /// Create an update
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Sensor output rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnRate {
    /// 0.1 Hz
    Hz0_1,
    /// 0.5 Hz
    Hz0_5,
    /// 1 Hz
    Hz1,
    /// 2 Hz
    Hz2,
    /// 5 Hz
    Hz5,
    /// 10 Hz
    Hz10,
    /// 20 Hz
    Hz20,
    /// 50 Hz
    Hz50,
    /// 100 Hz
    Hz100,
    /// 200 Hz
    Hz200,
}

impl ReturnRate {
    /// Register code written to the rate register
    pub fn code(&self) -> u8 {
        match self {
            Self::Hz0_1 => 0x01,
            Self::Hz0_5 => 0x02,
            Self::Hz1 => 0x03,
            Self::Hz2 => 0x04,
            Self::Hz5 => 0x05,
            Self::Hz10 => 0x06,
            Self::Hz20 => 0x07,
            Self::Hz50 => 0x08,
            Self::Hz100 => 0x09,
            Self::Hz200 => 0x0B,
        }
    }

    /// Parse a register code
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::Hz0_1,
            0x02 => Self::Hz0_5,
            0x03 => Self::Hz1,
            0x04 => Self::Hz2,
            0x05 => Self::Hz5,
            0x06 => Self::Hz10,
            0x07 => Self::Hz20,
            0x08 => Self::Hz50,
            0x09 => Self::Hz100,
            0x0B => Self::Hz200,
            _ => return None,
        })
    }

    /// Rate in hertz
    pub fn hz(&self) -> f64 {
        match self {
            Self::Hz0_1 => 0.1,
            Self::Hz0_5 => 0.5,
            Self::Hz1 => 1.0,
            Self::Hz2 => 2.0,
            Self::Hz5 => 5.0,
            Self::Hz10 => 10.0,
            Self::Hz20 => 20.0,
            Self::Hz50 => 50.0,
            Self::Hz100 => 100.0,
            Self::Hz200 => 200.0,
        }
    }

    /// Parse a whole-hertz value as given on a command line
    pub fn from_hz(hz: u32) -> Option<Self> {
        Some(match hz {
            1 => Self::Hz1,
            2 => Self::Hz2,
            5 => Self::Hz5,
            10 => Self::Hz10,
            20 => Self::Hz20,
            50 => Self::Hz50,
            100 => Self::Hz100,
            200 => Self::Hz200,
            _ => return None,
        })
    }
}

/// Logical sensor command, encoded by the session's resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Unlock registers for writing
    UnlockRegisters,
    /// Persist register values
    SaveRegisters,
    /// Accelerometer (addition) calibration
    AccelerometerCalibration,
    /// Begin magnetic field calibration
    StartMagneticCalibration,
    /// End magnetic field calibration
    EndMagneticCalibration,
    /// Request a register read-back
    ReadRegister(u8),
    /// Write a register value
    WriteRegister {
        /// Register address
        reg: u8,
        /// Value
        value: u16,
    },
    /// Change the output rate
    SetReturnRate(ReturnRate),
    /// Pre-encoded bytes, passed through untouched
    Raw(Vec<u8>),
}

/// Decoder health counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    /// Complete frames decoded
    pub frames_decoded: u64,
    /// Resynchronisations after corrupt or unknown bytes
    pub desync_events: u64,
    /// Bytes discarded while resynchronising
    pub bytes_skipped: u64,
}

/// Codec for one device firmware protocol
pub trait ProtocolResolver: Send {
    /// Protocol name (for logs)
    fn name(&self) -> &str;

    /// Consume newly arrived bytes and return every completed update
    fn decode(&mut self, data: &[u8]) -> Vec<TelemetryUpdate>;

    /// Encode a logical command to wire bytes
    fn encode(&self, command: &Command) -> Bytes;

    /// Called when the session opens. Returned frames are sent once the
    /// session is open (e.g. to prime read-back state).
    fn on_open(&mut self) -> Vec<Bytes> {
        Vec::new()
    }

    /// Called when the session closes
    fn on_close(&mut self) {}

    /// Whether `captured` already holds the complete reply to `request`.
    ///
    /// Used by the early-completion wait mode. The default never
    /// completes early, so the full window is always waited.
    fn response_complete(&self, _request: &[u8], _captured: &[u8]) -> bool {
        false
    }

    /// Key whose update marks a fresh data frame
    fn heartbeat_key(&self) -> Option<&str> {
        None
    }

    /// Decoder counters
    fn stats(&self) -> ResolverStats {
        ResolverStats::default()
    }
}
