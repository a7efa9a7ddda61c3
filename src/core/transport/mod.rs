//! Byte channel layer
//!
//! A [`ByteChannel`] is the duplex byte pipe to one physical sensor:
//! - outbound bytes go through [`ByteChannel::send`]
//! - inbound chunks are pushed into the single registered [`DataSink`]
//!
//! Chunk boundaries carry no meaning; resolvers reassemble frames.
//!
//! Send policy: a channel that is closed or not yet ready rejects the
//! write with [`TransportError::NotReady`] right away. A send never
//! blocks past the channel's write timeout and never panics.

mod bluetooth;

pub use bluetooth::{
    BleChannel, BleProfile, BleTransportManager, BluetoothConfig, DiscoveredDevice,
    TransportEvent,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Channel closed or not ready for writes
    #[error("Channel not ready")]
    NotReady,

    /// Transport manager used before `init()`
    #[error("Transport manager not initialized")]
    NotInitialized,

    /// No Bluetooth adapter present
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Device address unknown to the transport
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Required GATT characteristic missing
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Write rejected by the transport
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Operation exceeded its time bound
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Writes issued
    pub packets_sent: u64,
    /// Notifications delivered
    pub packets_received: u64,
    /// Failed writes
    pub errors: u64,
}

impl TransportStats {
    /// Account for one outbound write
    pub fn record_sent(&mut self, len: usize) {
        self.bytes_sent += len as u64;
        self.packets_sent += 1;
    }

    /// Account for one inbound chunk
    pub fn record_received(&mut self, len: usize) {
        self.bytes_received += len as u64;
        self.packets_received += 1;
    }
}

/// Receiver of inbound bytes from a channel.
///
/// Called on the transport's delivery path, so implementations must not
/// block. A channel delivers from a single task: `on_data` calls never
/// overlap.
#[cfg_attr(test, mockall::automock)]
pub trait DataSink: Send + Sync {
    /// A chunk of bytes arrived, in transport order
    fn on_data(&self, data: &[u8]);

    /// The underlying link went away without a local close
    fn on_channel_lost(&self) {}
}

/// Duplex byte transport for a single device
#[async_trait]
pub trait ByteChannel: Send + Sync {
    /// Acquire the link (connect, discover, subscribe)
    async fn open(&self) -> Result<(), TransportError>;

    /// Release the link. Safe to call when already closed.
    async fn close(&self);

    /// Whether writes are currently accepted
    fn is_ready(&self) -> bool;

    /// Write bytes to the device. See the module docs for the not-ready policy.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Install (or clear) the single delivery sink
    fn set_sink(&self, sink: Option<Arc<dyn DataSink>>);

    /// Stable device address
    fn address(&self) -> &str;

    /// Traffic counters
    fn stats(&self) -> TransportStats;
}

/// Slot holding a channel's delivery sink.
///
/// Delivery clones the sink out of the lock before calling it, so a sink
/// may swap itself out from inside a callback.
#[derive(Default)]
pub struct SinkSlot {
    sink: RwLock<Option<Arc<dyn DataSink>>>,
}

impl SinkSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current sink
    pub fn set(&self, sink: Option<Arc<dyn DataSink>>) {
        *self.sink.write() = sink;
    }

    /// Whether a sink is installed
    pub fn is_set(&self) -> bool {
        self.sink.read().is_some()
    }

    /// Hand a chunk to the sink, if any
    pub fn deliver(&self, data: &[u8]) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_data(data);
        }
    }

    /// Report link loss to the sink, if any
    pub fn lost(&self) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_channel_lost();
        }
    }
}
