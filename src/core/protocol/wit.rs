//! WIT inertial sensor protocols
//!
//! Two firmware families share the command format (`FF AA reg lo hi`) but
//! differ on the inbound side:
//!
//! ```text
//! BLE 5.0 (20-byte frames, no checksum)
//!   55 61 [ax ay az gx gy gz rx ry rz]     9 x i16 LE, streaming data
//!   55 71 [reg_lo reg_hi] [v0 .. v7]       8 x i16 LE, register read-back
//!
//! Serial / dual-mode (11-byte frames)
//!   55 kind [d0 d1 d2 d3] sum8             4 x i16 LE + checksum
//!   kind 51 acc+temp, 52 gyro, 53 angle, 54 mag, 5F register read-back
//! ```
//!
//! Raw values are published as `{flag:02X}_{index}` keys. The index 0 key
//! of the heartbeat frame is emitted last, so heartbeat observers always
//! see a complete frame.

use super::checksum::verify_sum8;
use super::{Command, ProtocolResolver, ResolverStats, TelemetryUpdate};
use bytes::Bytes;
use std::cell::Cell;

/// Telemetry keys produced by the WIT resolvers
pub mod keys {
    /// Acceleration X (g)
    pub const ACC_X: &str = "AccX";
    /// Acceleration Y (g)
    pub const ACC_Y: &str = "AccY";
    /// Acceleration Z (g)
    pub const ACC_Z: &str = "AccZ";
    /// Angular velocity X (°/s)
    pub const GYRO_X: &str = "AsX";
    /// Angular velocity Y (°/s)
    pub const GYRO_Y: &str = "AsY";
    /// Angular velocity Z (°/s)
    pub const GYRO_Z: &str = "AsZ";
    /// Roll (°)
    pub const ANGLE_X: &str = "AngleX";
    /// Pitch (°)
    pub const ANGLE_Y: &str = "AngleY";
    /// Yaw (°)
    pub const ANGLE_Z: &str = "AngleZ";
    /// Magnetic field X (raw)
    pub const MAG_X: &str = "MagX";
    /// Magnetic field Y (raw)
    pub const MAG_Y: &str = "MagY";
    /// Magnetic field Z (raw)
    pub const MAG_Z: &str = "MagZ";
    /// Temperature (°C)
    pub const TEMPERATURE: &str = "Temperature";
    /// Heartbeat key of the BLE 5.0 protocol
    pub const HEARTBEAT_BLE5: &str = "61_0";
    /// Heartbeat key of the serial protocol
    pub const HEARTBEAT_SERIAL: &str = "53_0";

    /// Key of a register read back from the device
    pub fn register(reg: u16) -> String {
        format!("{:02X}", reg)
    }
}

const FRAME_HEAD: u8 = 0x55;
const COMMAND_HEAD: [u8; 2] = [0xFF, 0xAA];

const BLE5_FRAME_LEN: usize = 20;
const FLAG_DATA: u8 = 0x61;
const FLAG_REGISTER: u8 = 0x71;

const SERIAL_FRAME_LEN: usize = 11;
const KIND_ACC: u8 = 0x51;
const KIND_GYRO: u8 = 0x52;
const KIND_ANGLE: u8 = 0x53;
const KIND_MAG: u8 = 0x54;
const KIND_REGISTER: u8 = 0x5F;

const REG_SAVE: u8 = 0x00;
const REG_CALSW: u8 = 0x01;
const REG_RATE: u8 = 0x03;
const REG_READ: u8 = 0x27;
const REG_VERSION: u8 = 0x2E;
const REG_UNLOCK: u8 = 0x69;
const UNLOCK_KEY: u16 = 0xB588;

const ACC_RANGE: f64 = 16.0;
const GYRO_RANGE: f64 = 2000.0;
const ANGLE_RANGE: f64 = 180.0;
const FULL_SCALE: f64 = 32768.0;

/// Build a `FF AA reg lo hi` command frame
pub fn command_frame(reg: u8, value: u16) -> Bytes {
    let [lo, hi] = value.to_le_bytes();
    Bytes::copy_from_slice(&[COMMAND_HEAD[0], COMMAND_HEAD[1], reg, lo, hi])
}

/// Encode a logical command for WIT firmware
pub fn encode_command(command: &Command) -> Bytes {
    match command {
        Command::UnlockRegisters => command_frame(REG_UNLOCK, UNLOCK_KEY),
        Command::SaveRegisters => command_frame(REG_SAVE, 0x0000),
        Command::AccelerometerCalibration => command_frame(REG_CALSW, 0x0001),
        Command::StartMagneticCalibration => command_frame(REG_CALSW, 0x0007),
        Command::EndMagneticCalibration => command_frame(REG_CALSW, 0x0000),
        Command::ReadRegister(reg) => command_frame(REG_READ, u16::from(*reg)),
        Command::WriteRegister { reg, value } => command_frame(*reg, *value),
        Command::SetReturnRate(rate) => command_frame(REG_RATE, u16::from(rate.code())),
        Command::Raw(bytes) => Bytes::copy_from_slice(bytes),
    }
}

/// Register targeted by a read request, if `request` is one
fn read_request_target(request: &[u8]) -> Option<u8> {
    match request {
        [0xFF, 0xAA, REG_READ, reg, ..] => Some(*reg),
        _ => None,
    }
}

fn i16_at(frame: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([frame[offset], frame[offset + 1]])
}

fn scaled(raw: i16, range: f64) -> String {
    format!("{:.3}", f64::from(raw) / FULL_SCALE * range)
}

/// Push raw keys for `flag`, index 0 last
fn push_raw(updates: &mut Vec<TelemetryUpdate>, flag: u8, raw: &[i16]) {
    for (i, value) in raw.iter().enumerate().skip(1) {
        updates.push(TelemetryUpdate::new(format!("{:02X}_{}", flag, i), value.to_string()));
    }
    if let Some(first) = raw.first() {
        updates.push(TelemetryUpdate::new(format!("{:02X}_0", flag), first.to_string()));
    }
}

/// Reassembly buffer with skip-and-resync on bad input
#[derive(Debug, Default)]
struct FrameScanner {
    pending: Vec<u8>,
    stats: ResolverStats,
}

impl FrameScanner {
    fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    fn clear(&mut self) {
        self.pending.clear();
    }

    /// Pop the next complete frame.
    ///
    /// `frame_len` maps a flag byte to its frame length (`None` = unknown
    /// flag); `valid` checks a complete candidate frame.
    fn next_frame(
        &mut self,
        frame_len: impl Fn(u8) -> Option<usize>,
        valid: impl Fn(&[u8]) -> bool,
    ) -> Option<Vec<u8>> {
        loop {
            match self.pending.iter().position(|&b| b == FRAME_HEAD) {
                Some(0) => {}
                Some(n) => self.skip(n),
                None => {
                    let n = self.pending.len();
                    if n > 0 {
                        self.skip(n);
                    }
                    return None;
                }
            }

            if self.pending.len() < 2 {
                return None;
            }
            let Some(len) = frame_len(self.pending[1]) else {
                self.skip(1);
                continue;
            };
            if self.pending.len() < len {
                return None;
            }
            if !valid(&self.pending[..len]) {
                self.skip(1);
                continue;
            }

            self.stats.frames_decoded += 1;
            return Some(self.pending.drain(..len).collect());
        }
    }

    fn skip(&mut self, n: usize) {
        self.pending.drain(..n);
        self.stats.desync_events += 1;
        self.stats.bytes_skipped += n as u64;
        tracing::warn!("Protocol desync, skipped {} byte(s)", n);
    }
}

/// Resolver for BLE 5.0 firmware (e.g. BWT901BLE)
#[derive(Debug)]
pub struct WitBle5Resolver {
    scanner: FrameScanner,
    prime_on_open: bool,
}

impl Default for WitBle5Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl WitBle5Resolver {
    /// Create a resolver that reads the version registers on open
    pub fn new() -> Self {
        Self {
            scanner: FrameScanner::default(),
            prime_on_open: true,
        }
    }

    /// Enable or disable the version read on open
    pub fn with_priming(mut self, enabled: bool) -> Self {
        self.prime_on_open = enabled;
        self
    }

    fn frame_len(flag: u8) -> Option<usize> {
        match flag {
            FLAG_DATA | FLAG_REGISTER => Some(BLE5_FRAME_LEN),
            _ => None,
        }
    }

    fn decode_frame(frame: &[u8], updates: &mut Vec<TelemetryUpdate>) {
        match frame[1] {
            FLAG_DATA => {
                let raw: Vec<i16> = (0..9).map(|i| i16_at(frame, 2 + i * 2)).collect();
                let engineering = [
                    (keys::ACC_X, raw[0], ACC_RANGE),
                    (keys::ACC_Y, raw[1], ACC_RANGE),
                    (keys::ACC_Z, raw[2], ACC_RANGE),
                    (keys::GYRO_X, raw[3], GYRO_RANGE),
                    (keys::GYRO_Y, raw[4], GYRO_RANGE),
                    (keys::GYRO_Z, raw[5], GYRO_RANGE),
                    (keys::ANGLE_X, raw[6], ANGLE_RANGE),
                    (keys::ANGLE_Y, raw[7], ANGLE_RANGE),
                    (keys::ANGLE_Z, raw[8], ANGLE_RANGE),
                ];
                for (key, value, range) in engineering {
                    updates.push(TelemetryUpdate::new(key, scaled(value, range)));
                }
                push_raw(updates, FLAG_DATA, &raw);
            }
            FLAG_REGISTER => {
                let start = u16::from_le_bytes([frame[2], frame[3]]);
                for i in 0..8u16 {
                    let value = i16_at(frame, 4 + usize::from(i) * 2);
                    updates.push(TelemetryUpdate::new(
                        keys::register(start.wrapping_add(i)),
                        value.to_string(),
                    ));
                }
            }
            _ => {}
        }
    }
}

impl ProtocolResolver for WitBle5Resolver {
    fn name(&self) -> &str {
        "wit-ble5"
    }

    fn decode(&mut self, data: &[u8]) -> Vec<TelemetryUpdate> {
        self.scanner.push(data);
        let mut updates = Vec::new();
        while let Some(frame) = self.scanner.next_frame(Self::frame_len, |_| true) {
            Self::decode_frame(&frame, &mut updates);
        }
        updates
    }

    fn encode(&self, command: &Command) -> Bytes {
        encode_command(command)
    }

    fn on_open(&mut self) -> Vec<Bytes> {
        self.scanner.clear();
        if self.prime_on_open {
            vec![encode_command(&Command::ReadRegister(REG_VERSION))]
        } else {
            Vec::new()
        }
    }

    fn on_close(&mut self) {
        self.scanner.clear();
    }

    fn response_complete(&self, request: &[u8], captured: &[u8]) -> bool {
        let Some(reg) = read_request_target(request) else {
            return false;
        };
        captured.windows(BLE5_FRAME_LEN).any(|w| {
            w[0] == FRAME_HEAD
                && w[1] == FLAG_REGISTER
                && u16::from_le_bytes([w[2], w[3]]) == u16::from(reg)
        })
    }

    fn heartbeat_key(&self) -> Option<&str> {
        Some(keys::HEARTBEAT_BLE5)
    }

    fn stats(&self) -> ResolverStats {
        self.scanner.stats
    }
}

/// Resolver for the 11-byte serial protocol spoken by dual-mode sensors.
///
/// `0x5F` frames carry no register address. They are keyed from the last
/// read request this resolver encoded.
#[derive(Debug, Default)]
pub struct WitSerialResolver {
    scanner: FrameScanner,
    last_read: Cell<Option<u8>>,
}

impl WitSerialResolver {
    /// Create a resolver
    pub fn new() -> Self {
        Self::default()
    }

    fn frame_len(kind: u8) -> Option<usize> {
        (0x50..=0x5F).contains(&kind).then_some(SERIAL_FRAME_LEN)
    }

    fn decode_frame(&self, frame: &[u8], updates: &mut Vec<TelemetryUpdate>) {
        let kind = frame[1];
        let raw: Vec<i16> = (0..4).map(|i| i16_at(frame, 2 + i * 2)).collect();

        match kind {
            KIND_ACC => {
                updates.push(TelemetryUpdate::new(keys::ACC_X, scaled(raw[0], ACC_RANGE)));
                updates.push(TelemetryUpdate::new(keys::ACC_Y, scaled(raw[1], ACC_RANGE)));
                updates.push(TelemetryUpdate::new(keys::ACC_Z, scaled(raw[2], ACC_RANGE)));
                updates.push(TelemetryUpdate::new(
                    keys::TEMPERATURE,
                    format!("{:.2}", f64::from(raw[3]) / 100.0),
                ));
            }
            KIND_GYRO => {
                updates.push(TelemetryUpdate::new(keys::GYRO_X, scaled(raw[0], GYRO_RANGE)));
                updates.push(TelemetryUpdate::new(keys::GYRO_Y, scaled(raw[1], GYRO_RANGE)));
                updates.push(TelemetryUpdate::new(keys::GYRO_Z, scaled(raw[2], GYRO_RANGE)));
            }
            KIND_ANGLE => {
                updates.push(TelemetryUpdate::new(keys::ANGLE_X, scaled(raw[0], ANGLE_RANGE)));
                updates.push(TelemetryUpdate::new(keys::ANGLE_Y, scaled(raw[1], ANGLE_RANGE)));
                updates.push(TelemetryUpdate::new(keys::ANGLE_Z, scaled(raw[2], ANGLE_RANGE)));
            }
            KIND_MAG => {
                updates.push(TelemetryUpdate::new(keys::MAG_X, raw[0].to_string()));
                updates.push(TelemetryUpdate::new(keys::MAG_Y, raw[1].to_string()));
                updates.push(TelemetryUpdate::new(keys::MAG_Z, raw[2].to_string()));
            }
            KIND_REGISTER => {
                if let Some(start) = self.last_read.get() {
                    for (i, value) in raw.iter().enumerate() {
                        updates.push(TelemetryUpdate::new(
                            keys::register(u16::from(start) + i as u16),
                            value.to_string(),
                        ));
                    }
                }
            }
            _ => {}
        }
        push_raw(updates, kind, &raw);
    }
}

impl ProtocolResolver for WitSerialResolver {
    fn name(&self) -> &str {
        "wit-serial"
    }

    fn decode(&mut self, data: &[u8]) -> Vec<TelemetryUpdate> {
        self.scanner.push(data);
        let mut updates = Vec::new();
        while let Some(frame) = self.scanner.next_frame(Self::frame_len, verify_sum8) {
            self.decode_frame(&frame, &mut updates);
        }
        updates
    }

    fn encode(&self, command: &Command) -> Bytes {
        let bytes = encode_command(command);
        if let Some(reg) = read_request_target(&bytes) {
            self.last_read.set(Some(reg));
        }
        bytes
    }

    fn on_open(&mut self) -> Vec<Bytes> {
        self.scanner.clear();
        Vec::new()
    }

    fn on_close(&mut self) {
        self.scanner.clear();
        self.last_read.set(None);
    }

    fn response_complete(&self, request: &[u8], captured: &[u8]) -> bool {
        read_request_target(request).is_some()
            && captured.windows(SERIAL_FRAME_LEN).any(|w| {
                w[0] == FRAME_HEAD && w[1] == KIND_REGISTER && verify_sum8(w)
            })
    }

    fn heartbeat_key(&self) -> Option<&str> {
        Some(keys::HEARTBEAT_SERIAL)
    }

    fn stats(&self) -> ResolverStats {
        self.scanner.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::checksum::append_sum8;
    use crate::core::protocol::ReturnRate;

    fn data_frame(values: [i16; 9]) -> Vec<u8> {
        let mut frame = vec![FRAME_HEAD, FLAG_DATA];
        for v in values {
            frame.extend_from_slice(&v.to_le_bytes());
        }
        frame
    }

    fn register_frame(start: u16, values: [i16; 8]) -> Vec<u8> {
        let mut frame = vec![FRAME_HEAD, FLAG_REGISTER];
        frame.extend_from_slice(&start.to_le_bytes());
        for v in values {
            frame.extend_from_slice(&v.to_le_bytes());
        }
        frame
    }

    fn serial_frame(kind: u8, values: [i16; 4]) -> Vec<u8> {
        let mut frame = vec![FRAME_HEAD, kind];
        for v in values {
            frame.extend_from_slice(&v.to_le_bytes());
        }
        append_sum8(&mut frame);
        frame
    }

    fn value_of<'a>(updates: &'a [TelemetryUpdate], key: &str) -> Option<&'a str> {
        updates.iter().find(|u| u.key == key).map(|u| u.value.as_str())
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(
            encode_command(&Command::UnlockRegisters).as_ref(),
            &[0xFF, 0xAA, 0x69, 0x88, 0xB5]
        );
        assert_eq!(
            encode_command(&Command::SaveRegisters).as_ref(),
            &[0xFF, 0xAA, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode_command(&Command::AccelerometerCalibration).as_ref(),
            &[0xFF, 0xAA, 0x01, 0x01, 0x00]
        );
        assert_eq!(
            encode_command(&Command::StartMagneticCalibration).as_ref(),
            &[0xFF, 0xAA, 0x01, 0x07, 0x00]
        );
        assert_eq!(
            encode_command(&Command::ReadRegister(0x03)).as_ref(),
            &[0xFF, 0xAA, 0x27, 0x03, 0x00]
        );
        assert_eq!(
            encode_command(&Command::SetReturnRate(ReturnRate::Hz50)).as_ref(),
            &[0xFF, 0xAA, 0x03, 0x08, 0x00]
        );
        assert_eq!(
            encode_command(&Command::Raw(vec![1, 2])).as_ref(),
            &[1, 2]
        );
    }

    #[test]
    fn test_ble5_data_frame() {
        let mut resolver = WitBle5Resolver::new();
        let updates = resolver.decode(&data_frame([16384, 0, -2048, 0, 0, 16384, 8192, 0, -16384]));

        assert_eq!(value_of(&updates, keys::ACC_X), Some("8.000"));
        assert_eq!(value_of(&updates, keys::ACC_Z), Some("-1.000"));
        assert_eq!(value_of(&updates, keys::GYRO_Z), Some("1000.000"));
        assert_eq!(value_of(&updates, keys::ANGLE_X), Some("45.000"));
        assert_eq!(value_of(&updates, keys::ANGLE_Z), Some("-90.000"));
        assert_eq!(value_of(&updates, "61_8"), Some("-16384"));

        // Heartbeat key closes the frame
        let last = updates.last().unwrap();
        assert_eq!(last.key, keys::HEARTBEAT_BLE5);
        assert_eq!(last.value, "16384");
        assert_eq!(resolver.stats().frames_decoded, 1);
    }

    #[test]
    fn test_ble5_register_frame() {
        let mut resolver = WitBle5Resolver::new();
        let updates = resolver.decode(&register_frame(0x03, [6, 1, 2, 3, 4, 5, 6, -7]));

        assert_eq!(updates.len(), 8);
        assert_eq!(value_of(&updates, "03"), Some("6"));
        assert_eq!(value_of(&updates, "0A"), Some("-7"));
    }

    #[test]
    fn test_ble5_chunk_boundary_independence() {
        let mut stream = data_frame([1, 2, 3, 4, 5, 6, 7, 8, 9]);
        stream.extend(register_frame(0x2E, [1, 0, 0, 0, 0, 0, 0, 0]));
        stream.extend(data_frame([-1, -2, -3, -4, -5, -6, -7, -8, -9]));

        let mut whole = WitBle5Resolver::new();
        let expected = whole.decode(&stream);

        let mut bytewise = WitBle5Resolver::new();
        let actual: Vec<_> = stream.iter().flat_map(|b| bytewise.decode(&[*b])).collect();

        assert_eq!(expected.len(), 9 + 9 + 8 + 9 + 9);
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_ble5_resync_after_garbage() {
        let mut resolver = WitBle5Resolver::new();
        let mut stream = vec![0x00, 0x13, FRAME_HEAD, 0x42, 0x99];
        stream.extend(data_frame([0; 9]));

        let updates = resolver.decode(&stream);
        assert_eq!(value_of(&updates, keys::HEARTBEAT_BLE5), Some("0"));

        let stats = resolver.stats();
        assert_eq!(stats.frames_decoded, 1);
        assert!(stats.desync_events >= 2);
        assert_eq!(stats.bytes_skipped, 5);
    }

    #[test]
    fn test_ble5_truncated_frame_waits() {
        let mut resolver = WitBle5Resolver::new();
        let frame = data_frame([0; 9]);

        assert!(resolver.decode(&frame[..12]).is_empty());
        assert!(!resolver.decode(&frame[12..]).is_empty());
    }

    #[test]
    fn test_ble5_response_complete() {
        let resolver = WitBle5Resolver::new();
        let request = encode_command(&Command::ReadRegister(0x03));

        let mut captured = data_frame([0; 9]);
        assert!(!resolver.response_complete(&request, &captured));

        captured.extend(register_frame(0x04, [0; 8]));
        assert!(!resolver.response_complete(&request, &captured));

        captured.extend(register_frame(0x03, [0; 8]));
        assert!(resolver.response_complete(&request, &captured));

        let write = encode_command(&Command::SaveRegisters);
        assert!(!resolver.response_complete(&write, &captured));
    }

    #[test]
    fn test_ble5_on_open_primes_version_read() {
        let mut resolver = WitBle5Resolver::new();
        let frames = resolver.on_open();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), &[0xFF, 0xAA, 0x27, 0x2E, 0x00]);

        let mut quiet = WitBle5Resolver::new().with_priming(false);
        assert!(quiet.on_open().is_empty());
    }

    #[test]
    fn test_serial_frames() {
        let mut resolver = WitSerialResolver::new();
        let mut stream = serial_frame(KIND_ACC, [16384, 0, 0, 2512]);
        stream.extend(serial_frame(KIND_ANGLE, [8192, 0, 0, 0]));

        let updates = resolver.decode(&stream);
        assert_eq!(value_of(&updates, keys::ACC_X), Some("8.000"));
        assert_eq!(value_of(&updates, keys::TEMPERATURE), Some("25.12"));
        assert_eq!(value_of(&updates, keys::ANGLE_X), Some("45.000"));
        assert_eq!(updates.last().unwrap().key, keys::HEARTBEAT_SERIAL);
    }

    #[test]
    fn test_serial_bad_checksum_resyncs() {
        let mut resolver = WitSerialResolver::new();
        let mut corrupt = serial_frame(KIND_GYRO, [1, 2, 3, 4]);
        corrupt[10] ^= 0xFF;
        let mut stream = corrupt;
        stream.extend(serial_frame(KIND_MAG, [10, 20, 30, 0]));

        let updates = resolver.decode(&stream);
        assert_eq!(value_of(&updates, keys::GYRO_X), None);
        assert_eq!(value_of(&updates, keys::MAG_Y), Some("20"));
        assert!(resolver.stats().desync_events >= 1);
    }

    #[test]
    fn test_serial_response_complete() {
        let resolver = WitSerialResolver::new();
        let request = encode_command(&Command::ReadRegister(0x03));
        let reply = serial_frame(KIND_REGISTER, [6, 0, 0, 0]);

        assert!(resolver.response_complete(&request, &reply));
        assert!(!resolver.response_complete(&request, &reply[..10]));
    }

    #[test]
    fn test_serial_register_keys_follow_last_read() {
        let mut resolver = WitSerialResolver::new();
        let reply = serial_frame(KIND_REGISTER, [6, 1, 2, 3]);

        // No read issued yet, only raw keys
        let updates = resolver.decode(&reply);
        assert_eq!(value_of(&updates, "03"), None);
        assert_eq!(value_of(&updates, "5F_0"), Some("6"));

        resolver.encode(&Command::ReadRegister(0x03));
        let updates = resolver.decode(&reply);
        assert_eq!(value_of(&updates, "03"), Some("6"));
        assert_eq!(value_of(&updates, "06"), Some("3"));
    }
}
