//! End-to-end session behaviour against scripted and virtual devices

use bytes::Bytes;
use parking_lot::Mutex;
use sensorlink_core::core::correlator::WaitOutcome;
use sensorlink_core::core::fleet::Fleet;
use sensorlink_core::core::logger::{LogFormat, TrafficLogger};
use sensorlink_core::core::protocol::{
    keys, Command, ProtocolResolver, ReturnRate, TelemetryUpdate, WitBle5Resolver,
};
use sensorlink_core::core::sensor::Sensor;
use sensorlink_core::core::session::{DeviceSession, SessionConfig};
use sensorlink_core::core::simulator::{
    ResponseRule, ScriptedChannel, VirtualSensor, VirtualSensorConfig,
};
use sensorlink_core::core::telemetry::TelemetryStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

/// Decodes 5-byte `FF AA reg lo hi` frames into `"{reg:02X}" = value`
#[derive(Default)]
struct RegisterEchoResolver {
    buffer: Vec<u8>,
}

impl ProtocolResolver for RegisterEchoResolver {
    fn name(&self) -> &str {
        "register-echo"
    }

    fn decode(&mut self, data: &[u8]) -> Vec<TelemetryUpdate> {
        self.buffer.extend_from_slice(data);
        let mut updates = Vec::new();
        while self.buffer.len() >= 5 {
            if self.buffer[0] != 0xFF || self.buffer[1] != 0xAA {
                self.buffer.remove(0);
                continue;
            }
            let value = u16::from_le_bytes([self.buffer[3], self.buffer[4]]);
            updates.push(TelemetryUpdate::new(
                format!("{:02X}", self.buffer[2]),
                value.to_string(),
            ));
            self.buffer.drain(..5);
        }
        updates
    }

    fn encode(&self, command: &Command) -> Bytes {
        match command {
            Command::Raw(bytes) => Bytes::copy_from_slice(bytes),
            _ => Bytes::new(),
        }
    }

    fn on_close(&mut self) {
        self.buffer.clear();
    }
}

fn echo_session(channel: &ScriptedChannel) -> DeviceSession {
    DeviceSession::with_channel(
        Arc::new(channel.clone()),
        Box::new(RegisterEchoResolver::default()),
        SessionConfig::default(),
    )
}

fn wit_session(channel: &ScriptedChannel) -> DeviceSession {
    DeviceSession::with_channel(
        Arc::new(channel.clone()),
        Box::new(WitBle5Resolver::new().with_priming(false)),
        SessionConfig::default(),
    )
}

fn data_frame(angle_z: i16) -> Vec<u8> {
    let mut frame = vec![0x55, 0x61];
    for raw in [0i16, 0, 2048, 0, 0, 0, 0, 0, angle_z] {
        frame.extend_from_slice(&raw.to_le_bytes());
    }
    frame
}

#[tokio::test(start_paused = true)]
async fn register_read_echo_is_captured_and_decoded() {
    let request = [0xFF, 0xAA, 0x27, 0x03, 0x00];
    let reply = [0xFF, 0xAA, 0x03, 0x7A, 0x00];
    let channel = ScriptedChannel::new("AA:BB").with_rule(
        ResponseRule::exact("read rate", &request, &reply).with_delay(Duration::from_millis(50)),
    );
    let session = echo_session(&channel);
    session.open().await.unwrap();

    let capture = session
        .send_and_wait(&request, Duration::from_millis(200))
        .await
        .unwrap();

    assert_eq!(capture.bytes.as_ref(), &reply);
    assert_eq!(capture.outcome, WaitOutcome::WindowElapsed);
    assert_eq!(session.get_telemetry("03").as_deref(), Some("122"));
    assert_eq!(channel.sent(), vec![request.to_vec()]);
}

#[test]
fn any_key_observer_sees_single_update() {
    let store = TelemetryStore::new(None);
    let calls = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&calls);
    store.on_any_key(Arc::new(move |key: &str, value: &str| {
        seen.lock().push((key.to_string(), value.to_string()));
    }));

    store.set("AngleX", "12.5");

    assert_eq!(
        *calls.lock(),
        vec![("AngleX".to_string(), "12.5".to_string())]
    );
    assert_eq!(store.get("AngleX").as_deref(), Some("12.5"));
}

#[tokio::test(start_paused = true)]
async fn silent_device_yields_empty_capture_after_window() {
    let channel = ScriptedChannel::new("AA:BB");
    let session = echo_session(&channel);
    session.open().await.unwrap();

    let window = Duration::from_millis(300);
    let started = Instant::now();
    let capture = session
        .send_and_wait(&[0xFF, 0xAA, 0x27, 0x03, 0x00], window)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(capture.is_empty());
    assert!(elapsed >= window);
    assert!(elapsed < window + Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn overlapping_exchanges_keep_their_own_bytes() {
    let first = [0xFF, 0xAA, 0x27, 0x03, 0x00];
    let second = [0xFF, 0xAA, 0x27, 0x2E, 0x00];
    let channel = ScriptedChannel::new("AA:BB")
        .with_rule(
            ResponseRule::exact("rate", &first, &[0xFF, 0xAA, 0x03, 0x06, 0x00])
                .with_delay(Duration::from_millis(20)),
        )
        .with_rule(
            ResponseRule::exact("version", &second, &[0xFF, 0xAA, 0x2E, 0x1E, 0x00])
                .with_delay(Duration::from_millis(20)),
        );
    let session = echo_session(&channel);
    session.open().await.unwrap();

    let window = Duration::from_millis(100);
    let (a, b) = tokio::join!(
        session.send_and_wait(&first, window),
        session.send_and_wait(&second, window),
    );

    assert_eq!(a.unwrap().bytes.as_ref(), &[0xFF, 0xAA, 0x03, 0x06, 0x00]);
    assert_eq!(b.unwrap().bytes.as_ref(), &[0xFF, 0xAA, 0x2E, 0x1E, 0x00]);
    assert_eq!(session.get_telemetry("03").as_deref(), Some("6"));
    assert_eq!(session.get_telemetry("2E").as_deref(), Some("30"));
}

#[tokio::test(start_paused = true)]
async fn close_during_wait_returns_promptly() {
    let channel = ScriptedChannel::new("AA:BB");
    let session = echo_session(&channel);
    session.open().await.unwrap();

    let waiter = session.clone();
    let handle = tokio::spawn(async move {
        waiter
            .send_and_wait(&[0xFF, 0xAA, 0x27, 0x03, 0x00], Duration::from_secs(10))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    session.close().await;

    let capture = assert_ok!(handle.await.unwrap());
    assert_eq!(capture.outcome, WaitOutcome::Cancelled);
    assert_err!(session.send_fire_and_forget(&[0x00]).await);
    assert!(capture.elapsed < Duration::from_secs(1));
    assert!(!session.is_open());
}

#[tokio::test]
async fn byte_at_a_time_delivery_matches_single_chunk() {
    let whole = ScriptedChannel::new("AA:01");
    let split = ScriptedChannel::new("AA:02");
    let whole_session = wit_session(&whole);
    let split_session = wit_session(&split);
    whole_session.open().await.unwrap();
    split_session.open().await.unwrap();

    let records = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&records);
    split_session.on_heartbeat(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let frame = data_frame(9000);
    assert!(whole.inject(&frame));
    for byte in &frame {
        assert!(split.inject(std::slice::from_ref(byte)));
    }

    assert_eq!(records.load(Ordering::SeqCst), 1);
    assert_eq!(
        whole_session.telemetry().snapshot(),
        split_session.telemetry().snapshot()
    );
    assert!(split_session.get_telemetry(keys::ACC_Z).is_some());
    assert!(split_session.get_telemetry(keys::HEARTBEAT_BLE5).is_some());
}

#[tokio::test]
async fn traffic_logger_records_both_directions() {
    let request = [0xFF, 0xAA, 0x27, 0x03, 0x00];
    let channel = ScriptedChannel::new("AA:BB")
        .with_rule(ResponseRule::exact("echo", &request, &[0xFF, 0xAA, 0x03, 0x06, 0x00]));
    let session = echo_session(&channel);

    let dir = tempfile::tempdir().unwrap();
    let logger = TrafficLogger::create(dir.path().join("traffic.log"), LogFormat::Hex).unwrap();
    logger.attach(&session);

    session.open().await.unwrap();
    session
        .send_and_wait(&request, Duration::from_millis(50))
        .await
        .unwrap();
    session.close().await;
    logger.flush();

    assert_eq!(logger.stats(), (10, 2));
    let text = std::fs::read_to_string(logger.path()).unwrap();
    assert_eq!(text.lines().count(), 2);
}

#[tokio::test(start_paused = true)]
async fn fleet_of_virtual_sensors() {
    let fleet = Fleet::new();
    let mut devices = Vec::new();
    for address in ["VS:01", "VS:02"] {
        let device = VirtualSensor::new(
            address,
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
        fleet.insert(Sensor::new(format!("WT-{}", address), session));
        devices.push(device);
    }

    assert!(fleet.open_all().await.is_all_ok());

    let report = fleet.read_register_all(0x03, Duration::from_millis(200)).await;
    assert_eq!(report.get("VS:01"), Some(&Ok(Some(0x06))));
    assert_eq!(report.get("VS:02"), Some(&Ok(Some(0x06))));

    assert!(fleet.set_return_rate_all(ReturnRate::Hz50).await.is_all_ok());
    for device in &devices {
        assert_eq!(device.rate(), ReturnRate::Hz50);
    }

    fleet.close_all().await;
    assert!(fleet.sensors().iter().all(|s| !s.is_open()));
}
