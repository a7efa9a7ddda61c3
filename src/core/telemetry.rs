//! Keyed telemetry store
//!
//! Latest decoded value per key, with change notification. Writes replace
//! the whole value under a short lock; observers run after the lock is
//! released, so an observer may read the store freely.

use crate::core::observer::{ObserverRegistry, SubscriptionId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Any-key observer, called with `(key, value)`
pub type KeyObserver = dyn Fn(&str, &str) + Send + Sync;

/// Heartbeat observer, called with the store after the heartbeat key changed
pub type HeartbeatObserver = dyn Fn(&TelemetryStore) + Send + Sync;

/// Live key to value map of decoded sensor readings
pub struct TelemetryStore {
    values: RwLock<HashMap<String, String>>,
    heartbeat_key: Option<String>,
    key_observers: ObserverRegistry<KeyObserver>,
    heartbeat_observers: ObserverRegistry<HeartbeatObserver>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for TelemetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStore")
            .field("keys", &self.values.read().len())
            .field("heartbeat_key", &self.heartbeat_key)
            .finish()
    }
}

impl TelemetryStore {
    /// Create an empty store with an optional heartbeat key
    pub fn new(heartbeat_key: Option<String>) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            heartbeat_key,
            key_observers: ObserverRegistry::new(),
            heartbeat_observers: ObserverRegistry::new(),
        }
    }

    /// Key whose update marks the end of a record
    pub fn heartbeat_key(&self) -> Option<&str> {
        self.heartbeat_key.as_deref()
    }

    /// Upsert a value, then notify any-key and (for the heartbeat key)
    /// heartbeat observers
    pub fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());

        self.key_observers.notify(|observer| observer(key, value));

        if self.heartbeat_key.as_deref() == Some(key) {
            self.heartbeat_observers.notify(|observer| observer(self));
        }
    }

    /// Latest value for `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    /// Latest value parsed as `f64`
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.read().get(key).and_then(|v| v.parse().ok())
    }

    /// Sorted copy of every key and value
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of keys held
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Drop every value. Observers stay registered.
    pub fn clear(&self) {
        self.values.write().clear();
    }

    /// Subscribe to every update
    pub fn on_any_key(&self, observer: Arc<KeyObserver>) -> SubscriptionId {
        self.key_observers.register(observer)
    }

    /// Subscribe to heartbeat updates
    pub fn on_heartbeat(&self, observer: Arc<HeartbeatObserver>) -> SubscriptionId {
        self.heartbeat_observers.register(observer)
    }

    /// Remove a subscription made with [`on_any_key`](Self::on_any_key) or
    /// [`on_heartbeat`](Self::on_heartbeat). Unknown handles are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.key_observers.remove(id) | self.heartbeat_observers.remove(id)
    }
}
