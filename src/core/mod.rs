//! Core module containing the device session layer
//!
//! This module provides:
//! - Byte channels (Bluetooth LE, scripted, virtual sensor)
//! - Protocol resolvers for WIT sensors
//! - Telemetry store and observer registries
//! - Request/response correlation
//! - Session management with state machine
//! - Sensor facade and fleet operations
//! - Traffic logging

pub mod correlator;
pub mod fleet;
pub mod logger;
pub mod observer;
pub mod protocol;
pub mod sensor;
pub mod session;
pub mod simulator;
pub mod state_machine;
pub mod telemetry;
pub mod transport;

pub use crate::core::fleet::{Fleet, FleetReport};
pub use crate::core::logger::{LogEntry, LogFormat, TrafficLogger};
pub use crate::core::observer::{ObserverRegistry, SubscriptionId};
pub use crate::core::sensor::{CalibrationKind, Sensor};
pub use crate::core::session::{DeviceSession, SessionConfig, SessionError};
pub use crate::core::state_machine::SessionState;
