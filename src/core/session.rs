//! Device session
//!
//! A [`DeviceSession`] owns the logical connection to one sensor:
//! - one bound [`ByteChannel`] (swappable only while closed)
//! - one [`ProtocolResolver`] decoding inbound bytes
//! - one [`TelemetryStore`] holding the latest decoded values
//! - one [`Correlator`] for single-flight send-and-wait
//!
//! Inbound chunks go through `receive`, in this order: raw-data
//! observers, the active capture (if any), the resolver, then the
//! telemetry store and its observers. One chunk is fully processed before
//! the next one starts.
//!
//! Closing a session cancels an in-flight send-and-wait, which then
//! returns its partial capture. Close waits for a chunk already being
//! processed, so no decoded value lands in the store after it is cleared.

use crate::core::correlator::{CaptureResult, Correlator, SingleFlight, WaitMode};
use crate::core::observer::{ObserverRegistry, SubscriptionId};
use crate::core::protocol::{Command, ProtocolResolver, ResolverStats};
use crate::core::state_machine::{SessionState, SessionStateMachine, StateError, StateTransition};
use crate::core::telemetry::TelemetryStore;
use crate::core::transport::{ByteChannel, DataSink, TransportError, TransportStats};
use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Raw byte observer
pub type RawObserver = dyn Fn(&[u8]) + Send + Sync;

/// Session error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `open` called without a bound channel
    #[error("No transport bound to session")]
    NoTransportBound,

    /// Operation requires an open session
    #[error("Session not open")]
    NotOpen,

    /// Operation requires a closed session
    #[error("Session already open")]
    AlreadyOpen,

    /// A send-and-wait is already in flight
    #[error("Send-and-wait already in flight")]
    Busy,

    /// Channel-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Lifecycle violation
    #[error(transparent)]
    State(#[from] StateError),
}

/// Session configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Heartbeat key; `None` uses the resolver's default
    pub heartbeat_key: Option<String>,
    /// Send-and-wait completion mode
    pub wait_mode: WaitMode,
    /// Concurrent send-and-wait policy
    pub single_flight: SingleFlight,
    /// Window used when a caller does not pick one
    pub default_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_key: None,
            wait_mode: WaitMode::Fixed,
            single_flight: SingleFlight::Queue,
            default_wait: Duration::from_millis(200),
        }
    }
}

impl SessionConfig {
    /// Override the heartbeat key
    pub fn with_heartbeat_key(mut self, key: impl Into<String>) -> Self {
        self.heartbeat_key = Some(key.into());
        self
    }

    /// Set the wait mode
    pub fn with_wait_mode(mut self, mode: WaitMode) -> Self {
        self.wait_mode = mode;
        self
    }

    /// Set the single-flight policy
    pub fn with_single_flight(mut self, policy: SingleFlight) -> Self {
        self.single_flight = policy;
        self
    }

    /// Set the default wait window
    pub fn with_default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    /// `requested`, or the default window
    pub fn wait_window(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default_wait)
    }
}

struct SessionInner {
    address: String,
    config: SessionConfig,
    lifecycle: Mutex<SessionStateMachine>,
    channel: RwLock<Option<Arc<dyn ByteChannel>>>,
    resolver: Mutex<Box<dyn ProtocolResolver>>,
    telemetry: TelemetryStore,
    correlator: Correlator,
    raw_observers: ObserverRegistry<RawObserver>,
    sent_observers: ObserverRegistry<RawObserver>,
    /// Serializes open and close
    transition: tokio::sync::Mutex<()>,
    /// Serializes inbound chunks. Each channel delivers from one task, so
    /// the only contender is `close_locked` waiting out a chunk in progress.
    receive_order: ReentrantMutex<()>,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        self.lifecycle.lock().state()
    }

    fn transition(&self, to: SessionState, reason: &str) {
        if let Err(e) = self.lifecycle.lock().transition(to, Some(reason)) {
            tracing::warn!("Session {}: {}", self.address, e);
        }
    }

    fn open_channel(&self) -> Result<Arc<dyn ByteChannel>, SessionError> {
        if self.state() != SessionState::Open {
            return Err(SessionError::NotOpen);
        }
        self.channel
            .read()
            .clone()
            .ok_or(SessionError::NoTransportBound)
    }

    async fn write(&self, channel: &Arc<dyn ByteChannel>, data: &[u8]) -> Result<(), SessionError> {
        tracing::debug!("Session {} TX {} bytes", self.address, data.len());
        channel.send(data).await?;
        self.sent_observers.notify(|observer| observer(data));
        Ok(())
    }

    fn receive(&self, data: &[u8]) {
        let _order = self.receive_order.lock();
        if self.state() == SessionState::Closed {
            return;
        }
        tracing::debug!("Session {} RX {} bytes", self.address, data.len());

        self.raw_observers.notify(|observer| observer(data));

        let capturing = self.correlator.append(data);

        let updates = self.resolver.lock().decode(data);
        for update in &updates {
            self.telemetry.set(&update.key, &update.value);
        }

        if capturing && self.config.wait_mode == WaitMode::UntilResponse {
            let resolver = self.resolver.lock();
            self.correlator
                .check_completion(|request, captured| resolver.response_complete(request, captured));
        }
    }

    /// Close with the transition lock already held
    async fn close_locked(&self, reason: &str) {
        if self.state() != SessionState::Open {
            return;
        }
        self.transition(SessionState::Closing, reason);
        self.correlator.cancel();
        self.resolver.lock().on_close();

        let channel = self.channel.read().clone();
        if let Some(channel) = channel {
            channel.set_sink(None);
            channel.close().await;
        }

        {
            let _order = self.receive_order.lock();
            self.telemetry.clear();
            self.transition(SessionState::Closed, reason);
        }
        tracing::info!("Session {} closed ({})", self.address, reason);
    }
}

/// Delivery sink installed on the bound channel while the session is open
struct SessionSink {
    session: Weak<SessionInner>,
}

impl DataSink for SessionSink {
    fn on_data(&self, data: &[u8]) {
        if let Some(inner) = self.session.upgrade() {
            inner.receive(data);
        }
    }

    fn on_channel_lost(&self) {
        let Some(inner) = self.session.upgrade() else {
            return;
        };
        tracing::warn!("Session {}: channel lost", inner.address);
        inner.correlator.cancel();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _transition = inner.transition.lock().await;
                    inner.close_locked("channel lost").await;
                });
            }
            Err(_) => tracing::warn!(
                "Session {}: no runtime to finish close after channel loss",
                inner.address
            ),
        }
    }
}

/// Logical connection to one sensor
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("address", &self.inner.address)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl DeviceSession {
    /// Create a closed session with no channel bound
    pub fn new(
        address: impl Into<String>,
        resolver: Box<dyn ProtocolResolver>,
        config: SessionConfig,
    ) -> Self {
        let heartbeat_key = config
            .heartbeat_key
            .clone()
            .or_else(|| resolver.heartbeat_key().map(String::from));

        Self {
            inner: Arc::new(SessionInner {
                address: address.into(),
                config,
                lifecycle: Mutex::new(SessionStateMachine::new()),
                channel: RwLock::new(None),
                resolver: Mutex::new(resolver),
                telemetry: TelemetryStore::new(heartbeat_key),
                correlator: Correlator::new(),
                raw_observers: ObserverRegistry::new(),
                sent_observers: ObserverRegistry::new(),
                transition: tokio::sync::Mutex::new(()),
                receive_order: ReentrantMutex::new(()),
            }),
        }
    }

    /// Create a closed session bound to `channel`, addressed like it
    pub fn with_channel(
        channel: Arc<dyn ByteChannel>,
        resolver: Box<dyn ProtocolResolver>,
        config: SessionConfig,
    ) -> Self {
        let session = Self::new(channel.address(), resolver, config);
        *session.inner.channel.write() = Some(channel);
        session
    }

    /// Bind (or replace) the channel. Only allowed while closed.
    pub fn bind_channel(&self, channel: Arc<dyn ByteChannel>) -> Result<(), SessionError> {
        if self.state() != SessionState::Closed {
            return Err(SessionError::AlreadyOpen);
        }
        *self.inner.channel.write() = Some(channel);
        Ok(())
    }

    /// Device address
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Whether the session is open
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Lifecycle transitions so far
    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.lifecycle.lock().history().to_vec()
    }

    /// Acquire the channel and start decoding.
    ///
    /// An already open session is closed first.
    pub async fn open(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;

        let channel = inner
            .channel
            .read()
            .clone()
            .ok_or(SessionError::NoTransportBound)?;

        if inner.state() == SessionState::Open {
            inner.close_locked("reopen").await;
        }

        inner
            .lifecycle
            .lock()
            .transition(SessionState::Opening, Some("open requested"))?;

        channel.set_sink(Some(Arc::new(SessionSink {
            session: Arc::downgrade(inner),
        })));

        if let Err(e) = channel.open().await {
            channel.set_sink(None);
            inner.transition(SessionState::Closed, "open failed");
            tracing::warn!("Session {} failed to open: {}", inner.address, e);
            return Err(e.into());
        }

        let priming = inner.resolver.lock().on_open();
        inner.transition(SessionState::Open, "channel ready");
        tracing::info!(
            "Session {} open ({})",
            inner.address,
            inner.resolver.lock().name()
        );

        for frame in priming {
            if let Err(e) = inner.write(&channel, &frame).await {
                tracing::warn!("Session {}: priming write failed: {}", inner.address, e);
            }
        }
        Ok(())
    }

    /// Release the channel. No-op when already closed.
    pub async fn close(&self) {
        let _transition = self.inner.transition.lock().await;
        self.inner.close_locked("close requested").await;
    }

    /// Forward already-encoded bytes to the channel
    pub async fn send_fire_and_forget(&self, data: &[u8]) -> Result<(), SessionError> {
        let channel = self.inner.open_channel()?;
        self.inner.write(&channel, data).await
    }

    /// Encode `command` with the session's resolver and send it
    pub async fn send_command(&self, command: &Command) -> Result<(), SessionError> {
        let bytes = self.encode(command);
        self.send_fire_and_forget(&bytes).await
    }

    /// Encode a command without sending it
    pub fn encode(&self, command: &Command) -> Bytes {
        self.inner.resolver.lock().encode(command)
    }

    /// Send bytes and capture everything that arrives within `timeout`.
    ///
    /// Single-flight: depending on [`SessionConfig::single_flight`] a
    /// concurrent call waits its turn or fails with [`SessionError::Busy`].
    pub async fn send_and_wait(
        &self,
        data: &[u8],
        timeout: Duration,
    ) -> Result<CaptureResult, SessionError> {
        let inner = &self.inner;
        let capture = inner
            .correlator
            .begin(Bytes::copy_from_slice(data), inner.config.single_flight)
            .await
            .ok_or(SessionError::Busy)?;

        // Checked after the capture is active so a racing close cancels it
        let channel = inner.open_channel()?;
        inner.write(&channel, data).await?;

        let outcome = capture.wait(timeout, inner.config.wait_mode).await;
        let result = capture.finish(outcome);
        tracing::debug!(
            "Session {} captured {} bytes ({:?})",
            inner.address,
            result.bytes.len(),
            result.outcome
        );
        Ok(result)
    }

    /// Encode `command` and [`send_and_wait`](Self::send_and_wait) it
    pub async fn exchange(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<CaptureResult, SessionError> {
        let bytes = self.encode(command);
        self.send_and_wait(&bytes, timeout).await
    }

    /// Run a send-and-wait on a background task and hand the result to
    /// `on_complete` exactly once
    pub fn async_send_and_wait<F>(
        &self,
        data: &[u8],
        timeout: Duration,
        on_complete: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<CaptureResult, SessionError>) + Send + 'static,
    {
        let session = self.clone();
        let data = data.to_vec();
        tokio::spawn(async move {
            let result = session.send_and_wait(&data, timeout).await;
            on_complete(result);
        })
    }

    /// Telemetry store of this session
    pub fn telemetry(&self) -> &TelemetryStore {
        &self.inner.telemetry
    }

    /// Latest value of a telemetry key
    pub fn get_telemetry(&self, key: &str) -> Option<String> {
        self.inner.telemetry.get(key)
    }

    /// Subscribe to raw inbound chunks
    pub fn on_raw_data<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.raw_observers.register(Arc::new(observer))
    }

    /// Subscribe to bytes successfully written to the channel
    pub fn on_sent<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.inner.sent_observers.register(Arc::new(observer))
    }

    /// Subscribe to heartbeat key updates
    pub fn on_heartbeat<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&TelemetryStore) + Send + Sync + 'static,
    {
        self.inner.telemetry.on_heartbeat(Arc::new(observer))
    }

    /// Subscribe to every telemetry update
    pub fn on_any_key<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.inner.telemetry.on_any_key(Arc::new(observer))
    }

    /// Drop a subscription of any kind. Unknown handles are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let raw = self.inner.raw_observers.remove(id);
        let sent = self.inner.sent_observers.remove(id);
        let telemetry = self.inner.telemetry.unsubscribe(id);
        raw | sent | telemetry
    }

    /// Decoder counters
    pub fn resolver_stats(&self) -> ResolverStats {
        self.inner.resolver.lock().stats()
    }

    /// Traffic counters of the bound channel
    pub fn transport_stats(&self) -> Option<TransportStats> {
        self.inner.channel.read().as_ref().map(|c| c.stats())
    }
}
