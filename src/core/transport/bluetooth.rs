//! Bluetooth LE transport
//!
//! [`BleTransportManager`] owns the adapter and the set of discovered
//! sensors. It has an explicit `init()`/`shutdown()` lifecycle and is
//! injected wherever channels are needed. [`BleChannel`] is the
//! [`ByteChannel`] for one connected peripheral.

use super::{ByteChannel, DataSink, SinkSlot, TransportError, TransportStats};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// GATT profile: which service and characteristics carry the byte stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleProfile {
    /// Profile name (for logs)
    pub name: String,
    /// Service UUID
    pub service_uuid: String,
    /// Characteristic written with commands
    pub write_characteristic: String,
    /// Characteristic delivering notifications
    pub notify_characteristic: String,
}

impl BleProfile {
    /// Single-mode BLE 5.0 sensors
    pub fn ble5() -> Self {
        Self {
            name: "ble5".to_string(),
            service_uuid: "0000ffe5-0000-1000-8000-00805f9a34fb".to_string(),
            write_characteristic: "0000ffe9-0000-1000-8000-00805f9a34fb".to_string(),
            notify_characteristic: "0000ffe4-0000-1000-8000-00805f9a34fb".to_string(),
        }
    }

    /// Dual-mode sensors bridging a serial stream over BLE
    pub fn dual_mode() -> Self {
        Self {
            name: "dual-mode".to_string(),
            service_uuid: "49535343-fe7d-4ae5-8fa9-9fafd205e455".to_string(),
            write_characteristic: "49535343-8841-43f4-a8d4-ecbe34729bb3".to_string(),
            notify_characteristic: "49535343-1e4d-4bd9-ba61-23c647249616".to_string(),
        }
    }

    fn uuids(&self) -> Result<(Uuid, Uuid), TransportError> {
        let write = Uuid::parse_str(&self.write_characteristic).map_err(|e| {
            TransportError::InvalidConfiguration(format!("Invalid write UUID: {}", e))
        })?;
        let notify = Uuid::parse_str(&self.notify_characteristic).map_err(|e| {
            TransportError::InvalidConfiguration(format!("Invalid notify UUID: {}", e))
        })?;
        Ok((write, notify))
    }
}

/// Bluetooth transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Only keep peripherals whose advertised name contains this
    pub name_filter: String,
    /// Scan duration in seconds
    pub scan_secs: u64,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Upper bound on a single write, in milliseconds
    pub write_timeout_ms: u64,
    /// GATT profiles tried in order when opening a channel
    pub profiles: Vec<BleProfile>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            name_filter: "WT".to_string(),
            scan_secs: 5,
            connect_timeout_secs: 10,
            write_timeout_ms: 500,
            profiles: vec![BleProfile::ble5(), BleProfile::dual_mode()],
        }
    }
}

/// Discovered sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Advertised name
    pub name: String,
    /// Stable address (platform peripheral id)
    pub address: String,
    /// Signal strength
    pub rssi: Option<i16>,
}

/// Transport lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A sensor matching the name filter was found
    Found(DiscoveredDevice),
    /// Link established
    Connected(String),
    /// Link lost or closed
    Disconnected(String),
    /// Connection attempt failed
    ConnectionFailed {
        /// Device address
        address: String,
        /// Failure description
        reason: String,
    },
}

struct Backend {
    _manager: Manager,
    adapter: Adapter,
}

/// Adapter owner and registry of discovered sensors
pub struct BleTransportManager {
    config: BluetoothConfig,
    backend: RwLock<Option<Arc<Backend>>>,
    devices: Arc<RwLock<HashMap<String, (DiscoveredDevice, Peripheral)>>>,
    events: broadcast::Sender<TransportEvent>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    scanning: AtomicBool,
}

impl BleTransportManager {
    /// Create an uninitialized manager
    pub fn new(config: BluetoothConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            backend: RwLock::new(None),
            devices: Arc::new(RwLock::new(HashMap::new())),
            events,
            event_task: Mutex::new(None),
            scanning: AtomicBool::new(false),
        }
    }

    /// Acquire the first Bluetooth adapter and start the event pump
    pub async fn init(&self) -> Result<(), TransportError> {
        if self.is_initialized() {
            return Ok(());
        }

        let manager = Manager::new().await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to create Bluetooth manager: {}", e))
        })?;
        let adapters = manager.adapters().await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to get adapters: {}", e))
        })?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterNotFound)?;

        let mut central_events = adapter.events().await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to subscribe to adapter events: {}", e))
        })?;

        let devices = self.devices.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                match event {
                    CentralEvent::DeviceConnected(id) => {
                        let address = id.to_string();
                        if devices.read().contains_key(&address) {
                            let _ = events.send(TransportEvent::Connected(address));
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let address = id.to_string();
                        if devices.read().contains_key(&address) {
                            let _ = events.send(TransportEvent::Disconnected(address));
                        }
                    }
                    _ => {}
                }
            }
        });

        *self.event_task.lock() = Some(task);
        *self.backend.write() = Some(Arc::new(Backend {
            _manager: manager,
            adapter,
        }));
        tracing::info!("Bluetooth transport initialized");
        Ok(())
    }

    /// Stop scanning, drop the adapter and forget discovered devices
    pub async fn shutdown(&self) {
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        let backend = self.backend.write().take();
        if let Some(backend) = backend {
            if self.scanning.swap(false, Ordering::SeqCst) {
                let _ = backend.adapter.stop_scan().await;
            }
        }
        self.devices.write().clear();
        tracing::info!("Bluetooth transport shut down");
    }

    /// Whether `init()` has completed
    pub fn is_initialized(&self) -> bool {
        self.backend.read().is_some()
    }

    /// Subscribe to transport events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn backend(&self) -> Result<Arc<Backend>, TransportError> {
        self.backend
            .read()
            .clone()
            .ok_or(TransportError::NotInitialized)
    }

    /// Scan for `duration` and return the sensors matching the name filter.
    ///
    /// Previously discovered devices are forgotten first.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let backend = self.backend()?;
        let adapter = &backend.adapter;

        self.devices.write().clear();
        self.scanning.store(true, Ordering::SeqCst);
        tracing::info!("Scanning for sensors ({} s)...", duration.as_secs());

        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to start scan: {}", e)))?;

        tokio::time::sleep(duration).await;

        let peripherals = adapter.peripherals().await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to get peripherals: {}", e))
        });

        self.scanning.store(false, Ordering::SeqCst);
        adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to stop scan: {}", e)))?;

        let mut found = Vec::new();
        for peripheral in peripherals? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let Some(name) = props.local_name else {
                continue;
            };
            if !name.contains(&self.config.name_filter) {
                continue;
            }

            let device = DiscoveredDevice {
                name,
                address: peripheral.id().to_string(),
                rssi: props.rssi,
            };
            tracing::info!("Found sensor {} ({})", device.name, device.address);
            let _ = self.events.send(TransportEvent::Found(device.clone()));
            self.devices
                .write()
                .insert(device.address.clone(), (device.clone(), peripheral));
            found.push(device);
        }

        Ok(found)
    }

    /// Sensors found by the last scan
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.devices.read().values().map(|(d, _)| d.clone()).collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    /// Build a channel for a discovered sensor
    pub fn channel_for(&self, address: &str) -> Result<BleChannel, TransportError> {
        let peripheral = self
            .devices
            .read()
            .get(address)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;

        Ok(BleChannel::new(
            address.to_string(),
            peripheral,
            self.config.clone(),
            self.events.clone(),
        ))
    }
}

/// [`ByteChannel`] over one BLE peripheral
pub struct BleChannel {
    address: String,
    peripheral: Peripheral,
    config: BluetoothConfig,
    write_char: RwLock<Option<Characteristic>>,
    ready: Arc<AtomicBool>,
    sink: Arc<SinkSlot>,
    stats: Arc<RwLock<TransportStats>>,
    notification_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<TransportEvent>,
}

impl BleChannel {
    fn new(
        address: String,
        peripheral: Peripheral,
        config: BluetoothConfig,
        events: broadcast::Sender<TransportEvent>,
    ) -> Self {
        Self {
            address,
            peripheral,
            config,
            write_char: RwLock::new(None),
            ready: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(SinkSlot::new()),
            stats: Arc::new(RwLock::new(TransportStats::default())),
            notification_task: Mutex::new(None),
            events,
        }
    }

    /// Find the first configured profile whose characteristics are present
    fn select_profile(&self) -> Result<(Characteristic, Characteristic), TransportError> {
        let characteristics = self.peripheral.characteristics();

        for profile in &self.config.profiles {
            let (write_uuid, notify_uuid) = profile.uuids()?;
            let write = characteristics.iter().find(|c| c.uuid == write_uuid);
            let notify = characteristics.iter().find(|c| c.uuid == notify_uuid);

            if let (Some(write), Some(notify)) = (write, notify) {
                tracing::debug!("{}: using {} profile", self.address, profile.name);
                return Ok((write.clone(), notify.clone()));
            }
        }

        Err(TransportError::CharacteristicNotFound(format!(
            "no known sensor profile on {}",
            self.address
        )))
    }

    async fn connect_and_subscribe(&self) -> Result<(), TransportError> {
        let connected = self.peripheral.is_connected().await.unwrap_or(false);
        if !connected {
            let timeout = Duration::from_secs(self.config.connect_timeout_secs);
            tokio::time::timeout(timeout, self.peripheral.connect())
                .await
                .map_err(|_| TransportError::Timeout(timeout.as_millis() as u64))?
                .map_err(|e| TransportError::ConnectionFailed(format!("Failed to connect: {}", e)))?;
        }

        self.peripheral.discover_services().await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to discover services: {}", e))
        })?;

        let (write, notify) = self.select_profile()?;

        self.peripheral
            .subscribe(&notify)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to subscribe: {}", e)))?;

        let mut notifications = self.peripheral.notifications().await.map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to open notification stream: {}", e))
        })?;

        *self.write_char.write() = Some(write);
        self.ready.store(true, Ordering::SeqCst);

        let notify_uuid = notify.uuid;
        let sink = self.sink.clone();
        let stats = self.stats.clone();
        let ready = self.ready.clone();
        let events = self.events.clone();
        let address = self.address.clone();

        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                stats.write().record_received(notification.value.len());
                sink.deliver(&notification.value);
            }

            // Stream ended without a local close: the link is gone
            if ready.swap(false, Ordering::SeqCst) {
                tracing::warn!("{}: notification stream ended", address);
                let _ = events.send(TransportEvent::Disconnected(address));
                sink.lost();
            }
        });
        *self.notification_task.lock() = Some(task);

        Ok(())
    }
}

#[async_trait]
impl ByteChannel for BleChannel {
    async fn open(&self) -> Result<(), TransportError> {
        if self.is_ready() {
            return Ok(());
        }
        tracing::info!("Connecting to sensor {}", self.address);

        match self.connect_and_subscribe().await {
            Ok(()) => {
                tracing::info!("Sensor {} connected", self.address);
                let _ = self.events.send(TransportEvent::Connected(self.address.clone()));
                Ok(())
            }
            Err(e) => {
                let _ = self.events.send(TransportEvent::ConnectionFailed {
                    address: self.address.clone(),
                    reason: e.to_string(),
                });
                let _ = self.peripheral.disconnect().await;
                Err(e)
            }
        }
    }

    async fn close(&self) {
        let was_ready = self.ready.swap(false, Ordering::SeqCst);
        if let Some(task) = self.notification_task.lock().take() {
            task.abort();
        }
        *self.write_char.write() = None;

        if was_ready {
            tracing::info!("Disconnecting from sensor {}", self.address);
            if let Err(e) = self.peripheral.disconnect().await {
                tracing::warn!("{}: disconnect failed: {}", self.address, e);
            }
            let _ = self.events.send(TransportEvent::Disconnected(self.address.clone()));
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let write_char = match (self.is_ready(), self.write_char.read().clone()) {
            (true, Some(c)) => c,
            _ => {
                tracing::debug!("{}: dropping {} byte write, channel not ready", self.address, data.len());
                return Err(TransportError::NotReady);
            }
        };

        tracing::debug!("{}: TX {}", self.address, hex::encode(data));
        let timeout = Duration::from_millis(self.config.write_timeout_ms);
        let result = tokio::time::timeout(
            timeout,
            self.peripheral.write(&write_char, data, WriteType::WithoutResponse),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                self.stats.write().record_sent(data.len());
                Ok(())
            }
            Ok(Err(e)) => {
                self.stats.write().errors += 1;
                Err(TransportError::SendFailed(e.to_string()))
            }
            Err(_) => {
                self.stats.write().errors += 1;
                Err(TransportError::Timeout(self.config.write_timeout_ms))
            }
        }
    }

    fn set_sink(&self, sink: Option<Arc<dyn DataSink>>) {
        self.sink.set(sink);
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bluetooth_config_default() {
        let config = BluetoothConfig::default();
        assert_eq!(config.name_filter, "WT");
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.profiles[0], BleProfile::ble5());
    }

    #[test]
    fn test_profile_uuids_parse() {
        let (write, notify) = BleProfile::ble5().uuids().unwrap();
        assert_eq!(write.as_u128() >> 96, 0x0000_ffe9);
        assert_eq!(notify.as_u128() >> 96, 0x0000_ffe4);
        assert!(BleProfile::dual_mode().uuids().is_ok());
    }

    #[test]
    fn test_profile_rejects_bad_uuid() {
        let mut profile = BleProfile::ble5();
        profile.write_characteristic = "not-a-uuid".to_string();
        assert!(matches!(
            profile.uuids(),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_manager_requires_init() {
        let manager = BleTransportManager::new(BluetoothConfig::default());
        assert!(!manager.is_initialized());
        assert!(manager.discovered().is_empty());
        assert!(matches!(
            manager.channel_for("AA:BB"),
            Err(TransportError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let manager = BleTransportManager::new(BluetoothConfig::default());
        let mut first = manager.subscribe();
        let mut second = manager.subscribe();

        let device = DiscoveredDevice {
            name: "WT901BLE68".to_string(),
            address: "AA:BB".to_string(),
            rssi: Some(-60),
        };
        manager
            .events
            .send(TransportEvent::Found(device.clone()))
            .unwrap();
        manager
            .events
            .send(TransportEvent::Disconnected("AA:BB".to_string()))
            .unwrap();

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap(), TransportEvent::Found(device.clone()));
            assert_eq!(
                rx.recv().await.unwrap(),
                TransportEvent::Disconnected("AA:BB".to_string())
            );
        }
    }

    #[tokio::test]
    async fn test_scan_before_init_fails() {
        let manager = BleTransportManager::new(BluetoothConfig::default());
        let result = manager.scan(Duration::from_millis(1)).await;
        assert_eq!(result, Err(TransportError::NotInitialized));
    }
}
