//! # Sensorlink Core Library
//!
//! Device sessions for wireless inertial measurement sensors:
//! - Byte channels over Bluetooth LE (plus scripted and virtual devices)
//! - Pluggable protocol resolvers for the WIT frame layouts
//! - A shared telemetry store with per-key and heartbeat observers
//! - Request/response correlation with bounded waits
//! - Session lifecycle with a guarded state machine
//!
//! ## Features
//!
//! - Multiple simultaneous sensors (see [`core::fleet`])
//! - Register read, write and calibration helpers
//! - Traffic logging in text, hex, CSV or JSON lines
//! - CLI with exit codes for scripting
//!
//! ## Example
//!
//! ```rust,no_run
//! use sensorlink_core::core::protocol::WitBle5Resolver;
//! use sensorlink_core::core::session::{DeviceSession, SessionConfig};
//! use sensorlink_core::core::simulator::{VirtualSensor, VirtualSensorConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let device = VirtualSensor::new("VIRTUAL:00", VirtualSensorConfig::default());
//!     let session = DeviceSession::with_channel(
//!         Arc::new(device),
//!         Box::new(WitBle5Resolver::new()),
//!         SessionConfig::default(),
//!     );
//!
//!     session.on_heartbeat(|store| println!("AccZ = {:?}", store.get("AccZ")));
//!     session.open().await?;
//!
//!     let reply = session
//!         .send_and_wait(&[0xFF, 0xAA, 0x27, 0x03, 0x00], Duration::from_millis(200))
//!         .await?;
//!     println!("{} bytes", reply.bytes.len());
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::AppConfig;
pub use crate::core::correlator::{CaptureResult, SingleFlight, WaitMode, WaitOutcome};
pub use crate::core::protocol::{Command, ProtocolResolver, TelemetryUpdate};
pub use crate::core::session::{DeviceSession, SessionConfig, SessionError};
pub use crate::core::state_machine::SessionState;
pub use crate::core::telemetry::TelemetryStore;
pub use crate::core::transport::{ByteChannel, DataSink, TransportError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
