//! Simulated byte channels
//!
//! Two in-memory [`ByteChannel`]s for tests, demos and `--simulate` runs:
//! - [`ScriptedChannel`]: answers writes according to response rules,
//!   with manual injection and link-loss simulation
//! - [`VirtualSensor`]: emulates a WIT BLE 5.0 sensor, streaming data
//!   frames and answering register reads

use crate::core::protocol::checksum::sum8;
use crate::core::protocol::ReturnRate;
use crate::core::transport::{ByteChannel, DataSink, SinkSlot, TransportError, TransportStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============ Scripted channel ============

/// Response rule condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatchCondition {
    /// Match exact bytes
    Exact {
        /// Expected write
        bytes: Vec<u8>,
    },
    /// Match writes starting with these bytes
    Prefix {
        /// Expected prefix
        bytes: Vec<u8>,
    },
    /// Match any input
    Any,
}

impl MatchCondition {
    /// Check if data matches this condition
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            Self::Exact { bytes } => data == bytes.as_slice(),
            Self::Prefix { bytes } => data.starts_with(bytes),
            Self::Any => true,
        }
    }
}

/// Response rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Rule name
    pub name: String,
    /// Match condition
    pub condition: MatchCondition,
    /// Bytes delivered back when the rule matches
    pub reply: Vec<u8>,
    /// Delay before the reply is delivered
    pub delay_ms: u64,
    /// Deliver the reply in chunks of this size
    pub chunk_size: Option<usize>,
    /// One-shot (disable after first match)
    pub one_shot: bool,
    /// Enabled
    pub enabled: bool,
    /// Match count
    #[serde(default)]
    pub match_count: u64,
}

impl ResponseRule {
    fn new(name: &str, condition: MatchCondition, reply: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            condition,
            reply,
            delay_ms: 0,
            chunk_size: None,
            one_shot: false,
            enabled: true,
            match_count: 0,
        }
    }

    /// Reply to an exact write
    pub fn exact(name: &str, request: &[u8], reply: &[u8]) -> Self {
        Self::new(
            name,
            MatchCondition::Exact {
                bytes: request.to_vec(),
            },
            reply.to_vec(),
        )
    }

    /// Reply to any write starting with `prefix`
    pub fn prefix(name: &str, prefix: &[u8], reply: &[u8]) -> Self {
        Self::new(
            name,
            MatchCondition::Prefix {
                bytes: prefix.to_vec(),
            },
            reply.to_vec(),
        )
    }

    /// Reply to every write
    pub fn any(name: &str, reply: &[u8]) -> Self {
        Self::new(name, MatchCondition::Any, reply.to_vec())
    }

    /// Delay the reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    /// Split the reply into chunks of `size` bytes
    pub fn chunked(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Disable the rule after its first match
    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }
}

struct ScriptedShared {
    address: String,
    ready: AtomicBool,
    fail_open: AtomicBool,
    sink: SinkSlot,
    rules: Mutex<Vec<ResponseRule>>,
    sent: Mutex<Vec<Vec<u8>>>,
    stats: Mutex<TransportStats>,
}

impl ScriptedShared {
    fn deliver(&self, data: &[u8]) -> bool {
        if !self.ready.load(Ordering::SeqCst) {
            return false;
        }
        self.stats.lock().record_received(data.len());
        self.sink.deliver(data);
        true
    }

    /// Reply of the first enabled rule matching `data`
    fn match_rules(&self, data: &[u8]) -> Option<ResponseRule> {
        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .find(|r| r.enabled && r.condition.matches(data))?;
        rule.match_count += 1;
        if rule.one_shot {
            rule.enabled = false;
        }
        Some(rule.clone())
    }
}

/// Scriptable in-memory channel
#[derive(Clone)]
pub struct ScriptedChannel {
    shared: Arc<ScriptedShared>,
}

impl ScriptedChannel {
    /// Create a closed channel for `address`
    pub fn new(address: &str) -> Self {
        Self {
            shared: Arc::new(ScriptedShared {
                address: address.to_string(),
                ready: AtomicBool::new(false),
                fail_open: AtomicBool::new(false),
                sink: SinkSlot::new(),
                rules: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                stats: Mutex::new(TransportStats::default()),
            }),
        }
    }

    /// Add a response rule. Rules are checked in insertion order.
    pub fn add_rule(&self, rule: ResponseRule) {
        self.shared.rules.lock().push(rule);
    }

    /// Builder form of [`add_rule`](Self::add_rule)
    pub fn with_rule(self, rule: ResponseRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// Match count of a rule
    pub fn match_count(&self, name: &str) -> u64 {
        self.shared
            .rules
            .lock()
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.match_count)
            .unwrap_or(0)
    }

    /// Make the next `open` calls fail
    pub fn set_fail_open(&self, fail: bool) {
        self.shared.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Deliver bytes as if the device sent them. Dropped (returns
    /// `false`) while the channel is not ready.
    pub fn inject(&self, data: &[u8]) -> bool {
        self.shared.deliver(data)
    }

    /// Simulate the link going away
    pub fn drop_link(&self) {
        if self.shared.ready.swap(false, Ordering::SeqCst) {
            tracing::info!("Scripted link {} dropped", self.shared.address);
            self.shared.sink.lost();
        }
    }

    /// Every write accepted so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.sent.lock().clone()
    }

    /// Whether a sink is installed
    pub fn has_sink(&self) -> bool {
        self.shared.sink.is_set()
    }

    fn schedule_reply(&self, rule: ResponseRule) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if rule.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(rule.delay_ms)).await;
            }
            match rule.chunk_size {
                Some(size) => {
                    for chunk in rule.reply.chunks(size) {
                        shared.deliver(chunk);
                        tokio::task::yield_now().await;
                    }
                }
                None => {
                    shared.deliver(&rule.reply);
                }
            }
        });
    }
}

#[async_trait]
impl ByteChannel for ScriptedChannel {
    async fn open(&self) -> Result<(), TransportError> {
        if self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "{} refused connection",
                self.shared.address
            )));
        }
        self.shared.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.shared.ready.store(false, Ordering::SeqCst);
    }

    fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_ready() {
            tracing::warn!("Send on closed scripted channel {}", self.shared.address);
            self.shared.stats.lock().errors += 1;
            return Err(TransportError::NotReady);
        }

        self.shared.sent.lock().push(data.to_vec());
        self.shared.stats.lock().record_sent(data.len());

        if let Some(rule) = self.shared.match_rules(data) {
            tracing::debug!("Scripted rule '{}' matched", rule.name);
            self.schedule_reply(rule);
        }
        Ok(())
    }

    fn set_sink(&self, sink: Option<Arc<dyn DataSink>>) {
        self.shared.sink.set(sink);
    }

    fn address(&self) -> &str {
        &self.shared.address
    }

    fn stats(&self) -> TransportStats {
        self.shared.stats.lock().clone()
    }
}

// ============ Virtual sensor ============

const REG_RATE: u8 = 0x03;
const REG_READ: u8 = 0x27;
const REG_VERSION: u8 = 0x2E;

/// Virtual sensor behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualSensorConfig {
    /// Initial output rate
    pub rate: ReturnRate,
    /// Delay before a register read is answered
    pub response_delay_ms: u64,
    /// Probability (0.0 - 1.0) that a streamed frame gets one byte corrupted
    pub corruption_probability: f32,
    /// Stream data frames while open
    pub streaming: bool,
}

impl Default for VirtualSensorConfig {
    fn default() -> Self {
        Self {
            rate: ReturnRate::Hz10,
            response_delay_ms: 20,
            corruption_probability: 0.0,
            streaming: true,
        }
    }
}

struct SensorShared {
    address: String,
    config: VirtualSensorConfig,
    ready: AtomicBool,
    sink: SinkSlot,
    registers: Mutex<HashMap<u8, i16>>,
    ticks: AtomicU64,
    stats: Mutex<TransportStats>,
}

impl SensorShared {
    fn deliver(&self, data: &[u8]) {
        if !self.ready.load(Ordering::SeqCst) {
            return;
        }
        self.stats.lock().record_received(data.len());
        self.sink.deliver(data);
    }

    fn rate(&self) -> ReturnRate {
        let code = self.registers.lock().get(&REG_RATE).copied().unwrap_or(0);
        ReturnRate::from_code(code as u8).unwrap_or(self.config.rate)
    }

    fn data_frame(&self) -> Vec<u8> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        let sweep = ((tick * 91) % 65536) as u16 as i16;
        let values: [i16; 9] = [0, 0, 2048, 0, 0, 0, 0, 0, sweep];

        let mut frame = Vec::with_capacity(20);
        frame.extend_from_slice(&[0x55, 0x61]);
        for v in values {
            frame.extend_from_slice(&v.to_le_bytes());
        }
        frame
    }

    fn register_frame(&self, start: u8) -> Vec<u8> {
        let registers = self.registers.lock();
        let mut frame = Vec::with_capacity(20);
        frame.extend_from_slice(&[0x55, 0x71]);
        frame.extend_from_slice(&u16::from(start).to_le_bytes());
        for offset in 0..8u8 {
            let value = registers
                .get(&start.wrapping_add(offset))
                .copied()
                .unwrap_or(0);
            frame.extend_from_slice(&value.to_le_bytes());
        }
        frame
    }

    fn maybe_corrupt(&self, frame: &mut [u8]) {
        use rand::Rng;

        let probability = self.config.corruption_probability;
        if probability <= 0.0 || frame.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() < probability {
            let idx = rng.gen_range(0..frame.len());
            frame[idx] = rng.gen();
        }
    }
}

/// Emulated WIT BLE 5.0 sensor
#[derive(Clone)]
pub struct VirtualSensor {
    shared: Arc<SensorShared>,
    streamer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl VirtualSensor {
    /// Create a sensor at `address`
    pub fn new(address: &str, config: VirtualSensorConfig) -> Self {
        let mut registers = HashMap::new();
        registers.insert(REG_RATE, i16::from(config.rate.code()));
        registers.insert(REG_VERSION, 0x1E);
        registers.insert(REG_VERSION + 1, 0x01);

        Self {
            shared: Arc::new(SensorShared {
                address: address.to_string(),
                config,
                ready: AtomicBool::new(false),
                sink: SinkSlot::new(),
                registers: Mutex::new(registers),
                ticks: AtomicU64::new(0),
                stats: Mutex::new(TransportStats::default()),
            }),
            streamer: Arc::new(Mutex::new(None)),
        }
    }

    /// Current register value
    pub fn register(&self, reg: u8) -> Option<i16> {
        self.shared.registers.lock().get(&reg).copied()
    }

    /// Current output rate
    pub fn rate(&self) -> ReturnRate {
        self.shared.rate()
    }

    /// Data frames produced so far
    pub fn frames_sent(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    fn start_streaming(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                let period = Duration::from_secs_f64(1.0 / shared.rate().hz());
                tokio::time::sleep(period).await;
                if !shared.ready.load(Ordering::SeqCst) {
                    break;
                }
                let mut frame = shared.data_frame();
                shared.maybe_corrupt(&mut frame);
                shared.deliver(&frame);
            }
        });
        if let Some(previous) = self.streamer.lock().replace(handle) {
            previous.abort();
        }
    }

    fn handle_command(&self, reg: u8, value: u16) {
        match reg {
            REG_READ => {
                let shared = Arc::clone(&self.shared);
                let start = value as u8;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(shared.config.response_delay_ms))
                        .await;
                    let frame = shared.register_frame(start);
                    shared.deliver(&frame);
                });
            }
            REG_RATE => {
                if ReturnRate::from_code(value as u8).is_some() {
                    self.shared.registers.lock().insert(REG_RATE, value as i16);
                    tracing::debug!("Virtual sensor rate set to code {:#04x}", value);
                }
            }
            _ => {
                self.shared.registers.lock().insert(reg, value as i16);
            }
        }
    }
}

#[async_trait]
impl ByteChannel for VirtualSensor {
    async fn open(&self) -> Result<(), TransportError> {
        self.shared.ready.store(true, Ordering::SeqCst);
        if self.shared.config.streaming {
            self.start_streaming();
        }
        tracing::info!("Virtual sensor {} connected", self.shared.address);
        Ok(())
    }

    async fn close(&self) {
        self.shared.ready.store(false, Ordering::SeqCst);
        if let Some(handle) = self.streamer.lock().take() {
            handle.abort();
        }
    }

    fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        self.shared.stats.lock().record_sent(data.len());

        for command in data.chunks(5) {
            if let [0xFF, 0xAA, reg, lo, hi] = *command {
                self.handle_command(reg, u16::from_le_bytes([lo, hi]));
            }
        }
        Ok(())
    }

    fn set_sink(&self, sink: Option<Arc<dyn DataSink>>) {
        self.shared.sink.set(sink);
    }

    fn address(&self) -> &str {
        &self.shared.address
    }

    fn stats(&self) -> TransportStats {
        self.shared.stats.lock().clone()
    }
}

/// Build an 11-byte serial protocol frame (used by tests and benches)
pub fn serial_frame(kind: u8, values: [i16; 4]) -> Vec<u8> {
    let mut frame = vec![0x55, kind];
    for v in values {
        frame.extend_from_slice(&v.to_le_bytes());
    }
    let sum = sum8(&frame);
    frame.push(sum);
    frame
}
