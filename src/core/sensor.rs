//! Sensor facade
//!
//! [`Sensor`] wraps a [`DeviceSession`] with the operations of a WIT
//! inertial sensor. Writes that expect no reply are sent fire-and-forget
//! and followed by a short pacing delay so the firmware can apply them.

use crate::core::observer::SubscriptionId;
use crate::core::protocol::{keys, Command, ReturnRate};
use crate::core::session::{DeviceSession, SessionError};
use crate::core::telemetry::TelemetryStore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default delay after a fire-and-forget register write
pub const DEFAULT_PACING: Duration = Duration::from_millis(10);

/// Calibration procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationKind {
    /// Accelerometer (addition) calibration
    Accelerometer,
    /// Begin magnetic field calibration
    MagneticStart,
    /// End magnetic field calibration
    MagneticEnd,
}

impl CalibrationKind {
    /// Command starting this procedure
    pub fn command(&self) -> Command {
        match self {
            Self::Accelerometer => Command::AccelerometerCalibration,
            Self::MagneticStart => Command::StartMagneticCalibration,
            Self::MagneticEnd => Command::EndMagneticCalibration,
        }
    }
}

/// One named sensor and its session
#[derive(Debug, Clone)]
pub struct Sensor {
    name: String,
    session: DeviceSession,
    pacing: Duration,
}

impl Sensor {
    /// Wrap a session
    pub fn new(name: impl Into<String>, session: DeviceSession) -> Self {
        Self {
            name: name.into(),
            session,
            pacing: DEFAULT_PACING,
        }
    }

    /// Override the delay after fire-and-forget writes
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Advertised name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device address
    pub fn address(&self) -> &str {
        self.session.address()
    }

    /// Underlying session
    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Open the session
    pub async fn open(&self) -> Result<(), SessionError> {
        self.session.open().await
    }

    /// Close the session
    pub async fn close(&self) {
        self.session.close().await
    }

    /// Whether the session is open
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    async fn send_paced(&self, command: &Command) -> Result<(), SessionError> {
        self.session.send_command(command).await?;
        tokio::time::sleep(self.pacing).await;
        Ok(())
    }

    /// Accelerometer calibration
    pub async fn applied_calibration(&self) -> Result<(), SessionError> {
        self.send_paced(&Command::AccelerometerCalibration).await
    }

    /// Begin magnetic field calibration
    pub async fn start_field_calibration(&self) -> Result<(), SessionError> {
        self.send_paced(&Command::StartMagneticCalibration).await
    }

    /// End magnetic field calibration
    pub async fn end_field_calibration(&self) -> Result<(), SessionError> {
        self.send_paced(&Command::EndMagneticCalibration).await
    }

    /// Unlock registers for writing
    pub async fn unlock(&self) -> Result<(), SessionError> {
        self.send_paced(&Command::UnlockRegisters).await
    }

    /// Persist register values
    pub async fn save(&self) -> Result<(), SessionError> {
        self.send_paced(&Command::SaveRegisters).await
    }

    /// Write one register
    pub async fn write_register(&self, reg: u8, value: u16) -> Result<(), SessionError> {
        self.send_paced(&Command::WriteRegister { reg, value }).await
    }

    /// Change the output rate
    pub async fn set_return_rate(&self, rate: ReturnRate) -> Result<(), SessionError> {
        self.send_paced(&Command::SetReturnRate(rate)).await
    }

    /// Unlock, send `command`, then save
    pub async fn configure(&self, command: &Command) -> Result<(), SessionError> {
        self.unlock().await?;
        self.send_paced(command).await?;
        self.save().await
    }

    /// Run a calibration procedure inside an unlock/save bracket
    pub async fn calibrate(&self, kind: CalibrationKind) -> Result<(), SessionError> {
        self.configure(&kind.command()).await
    }

    /// Request a register and read the value back from telemetry after
    /// `wait`.
    ///
    /// Returns `None` if the register has never been reported. A value
    /// from an earlier read may be returned if the device stays silent.
    pub async fn read_register(&self, reg: u8, wait: Duration) -> Result<Option<i16>, SessionError> {
        let capture = self.session.exchange(&Command::ReadRegister(reg), wait).await?;
        if capture.is_empty() {
            tracing::debug!("{}: no reply to register {:02X} read", self.address(), reg);
        }
        Ok(self
            .telemetry(&keys::register(u16::from(reg)))
            .and_then(|v| v.parse().ok()))
    }

    /// Latest value of a telemetry key
    pub fn telemetry(&self, key: &str) -> Option<String> {
        self.session.get_telemetry(key)
    }

    /// Subscribe to fresh data records (heartbeat updates)
    pub fn on_record<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&TelemetryStore) + Send + Sync + 'static,
    {
        self.session.on_heartbeat(observer)
    }

    /// Drop a record subscription
    pub fn remove_record_observer(&self, id: SubscriptionId) -> bool {
        self.session.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::WitBle5Resolver;
    use crate::core::session::SessionConfig;
    use crate::core::simulator::{ScriptedChannel, VirtualSensor, VirtualSensorConfig};
    use std::sync::Arc;

    fn scripted_sensor(channel: &ScriptedChannel) -> Sensor {
        let session = DeviceSession::with_channel(
            Arc::new(channel.clone()),
            Box::new(WitBle5Resolver::new().with_priming(false)),
            SessionConfig::default(),
        );
        Sensor::new("WT901BLE68", session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibrate_brackets_with_unlock_and_save() {
        let channel = ScriptedChannel::new("AA:BB");
        let sensor = scripted_sensor(&channel);
        sensor.open().await.unwrap();

        sensor.calibrate(CalibrationKind::Accelerometer).await.unwrap();

        assert_eq!(
            channel.sent(),
            vec![
                vec![0xFF, 0xAA, 0x69, 0x88, 0xB5],
                vec![0xFF, 0xAA, 0x01, 0x01, 0x00],
                vec![0xFF, 0xAA, 0x00, 0x00, 0x00],
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_field_calibration_commands() {
        let channel = ScriptedChannel::new("AA:BB");
        let sensor = scripted_sensor(&channel);
        sensor.open().await.unwrap();

        sensor.start_field_calibration().await.unwrap();
        sensor.end_field_calibration().await.unwrap();
        sensor.write_register(0x24, 0x0001).await.unwrap();

        assert_eq!(
            channel.sent(),
            vec![
                vec![0xFF, 0xAA, 0x01, 0x07, 0x00],
                vec![0xFF, 0xAA, 0x01, 0x00, 0x00],
                vec![0xFF, 0xAA, 0x24, 0x01, 0x00],
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_sensor_rejects_commands() {
        let channel = ScriptedChannel::new("AA:BB");
        let sensor = scripted_sensor(&channel);
        assert_eq!(sensor.unlock().await, Err(SessionError::NotOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_register_from_virtual_sensor() {
        let device = VirtualSensor::new(
            "VS:01",
            VirtualSensorConfig {
                streaming: false,
                ..Default::default()
            },
        );
        let session = DeviceSession::with_channel(
            Arc::new(device.clone()),
            Box::new(WitBle5Resolver::new()),
            SessionConfig::default(),
        );
        let sensor = Sensor::new("virtual", session);
        sensor.open().await.unwrap();

        assert_eq!(
            sensor.read_register(0x03, Duration::from_millis(200)).await,
            Ok(Some(0x06))
        );

        sensor.set_return_rate(ReturnRate::Hz50).await.unwrap();
        assert_eq!(device.rate(), ReturnRate::Hz50);
        assert_eq!(
            sensor.read_register(0x03, Duration::from_millis(200)).await,
            Ok(Some(0x08))
        );

        // Version registers were primed on open
        assert_eq!(sensor.telemetry("2E").as_deref(), Some("30"));
    }
}
