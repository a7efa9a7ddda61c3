//! Fleet of sensors
//!
//! Bulk operations run once per sensor, concurrently. A failure on one
//! device is recorded in the [`FleetReport`] and never stops the others.

use crate::core::protocol::{Command, ReturnRate};
use crate::core::sensor::{CalibrationKind, Sensor};
use crate::core::session::SessionError;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Per-device outcome of a bulk operation
#[derive(Debug, Clone)]
pub struct FleetReport<T> {
    /// `(address, result)` in address order
    pub results: Vec<(String, Result<T, SessionError>)>,
}

impl<T> FleetReport<T> {
    /// Addresses that succeeded
    pub fn succeeded(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(a, _)| a.as_str())
            .collect()
    }

    /// Addresses that failed, with their errors
    pub fn failed(&self) -> Vec<(&str, &SessionError)> {
        self.results
            .iter()
            .filter_map(|(a, r)| r.as_ref().err().map(|e| (a.as_str(), e)))
            .collect()
    }

    /// Whether every device succeeded
    pub fn is_all_ok(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// Result for one device
    pub fn get(&self, address: &str) -> Option<&Result<T, SessionError>> {
        self.results
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, r)| r)
    }
}

/// Address-keyed set of active sensors
#[derive(Default)]
pub struct Fleet {
    sensors: RwLock<BTreeMap<String, Arc<Sensor>>>,
}

impl Fleet {
    /// Create an empty fleet
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sensor, returning the one it replaced
    pub fn insert(&self, sensor: Sensor) -> Option<Arc<Sensor>> {
        let address = sensor.address().to_string();
        tracing::info!("Fleet: added {} ({})", sensor.name(), address);
        self.sensors.write().insert(address, Arc::new(sensor))
    }

    /// Sensor by address
    pub fn get(&self, address: &str) -> Option<Arc<Sensor>> {
        self.sensors.read().get(address).cloned()
    }

    /// Remove a sensor and close its session
    pub async fn remove(&self, address: &str) -> Option<Arc<Sensor>> {
        let sensor = self.sensors.write().remove(address)?;
        sensor.close().await;
        tracing::info!("Fleet: removed {}", address);
        Some(sensor)
    }

    /// All sensors in address order
    pub fn sensors(&self) -> Vec<Arc<Sensor>> {
        self.sensors.read().values().cloned().collect()
    }

    /// Number of sensors
    pub fn len(&self) -> usize {
        self.sensors.read().len()
    }

    /// Whether the fleet is empty
    pub fn is_empty(&self) -> bool {
        self.sensors.read().is_empty()
    }

    /// Run `op` on every sensor and collect per-device results
    pub async fn for_each<T, F, Fut>(&self, op: F) -> FleetReport<T>
    where
        F: Fn(Arc<Sensor>) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let sensors = self.sensors();
        let addresses: Vec<String> = sensors.iter().map(|s| s.address().to_string()).collect();
        let results = join_all(sensors.into_iter().map(op)).await;

        for (address, result) in addresses.iter().zip(&results) {
            if let Err(e) = result {
                tracing::warn!("Fleet: {} failed: {}", address, e);
            }
        }

        FleetReport {
            results: addresses.into_iter().zip(results).collect(),
        }
    }

    /// Open every sensor
    pub async fn open_all(&self) -> FleetReport<()> {
        self.for_each(|sensor| async move { sensor.open().await }).await
    }

    /// Close every sensor
    pub async fn close_all(&self) {
        join_all(self.sensors().into_iter().map(|sensor| async move { sensor.close().await })).await;
    }

    /// Run a calibration on every sensor
    pub async fn calibrate_all(&self, kind: CalibrationKind) -> FleetReport<()> {
        self.for_each(move |sensor| async move { sensor.calibrate(kind).await })
            .await
    }

    /// Read one register from every sensor
    pub async fn read_register_all(&self, reg: u8, wait: Duration) -> FleetReport<Option<i16>> {
        self.for_each(move |sensor| async move { sensor.read_register(reg, wait).await })
            .await
    }

    /// Change the output rate of every sensor (unlock, write, save)
    pub async fn set_return_rate_all(&self, rate: ReturnRate) -> FleetReport<()> {
        self.for_each(move |sensor| async move {
            sensor.configure(&Command::SetReturnRate(rate)).await
        })
        .await
    }
}
