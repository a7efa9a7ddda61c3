//! Event fan-out registries
//!
//! An [`ObserverRegistry`] holds subscribers in registration order, each
//! under an opaque [`SubscriptionId`] handed out at registration. Removal
//! goes by handle, so two identical closures stay independently removable.
//!
//! Notification works on a snapshot of the list:
//! - a subscriber added during a pass is not called in that pass
//! - a subscriber removed during a pass is not called after its removal
//! - the registry lock is never held while a subscriber runs, so
//!   subscribers may register or remove from inside a callback

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Handle identifying one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw handle value
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Ordered, concurrently mutable list of subscribers
pub struct ObserverRegistry<F: ?Sized> {
    entries: RwLock<Vec<(SubscriptionId, Arc<F>)>>,
}

impl<F: ?Sized> Default for ObserverRegistry<F> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> ObserverRegistry<F> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber at the end of the notification order
    pub fn register(&self, observer: Arc<F>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.entries.write().push((id, observer));
        id
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Whether `id` is currently registered
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.read().iter().any(|(entry, _)| *entry == id)
    }

    /// Number of subscribers
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every subscriber
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Call `invoke` for each subscriber, in registration order
    pub fn notify(&self, mut invoke: impl FnMut(&F)) {
        let snapshot: Vec<(SubscriptionId, Arc<F>)> = self.entries.read().clone();
        for (id, observer) in snapshot {
            if self.contains(id) {
                invoke(&observer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Callback = dyn Fn(&str) + Send + Sync;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<Callback> {
        let log = Arc::clone(log);
        Arc::new(move |msg: &str| log.lock().push(format!("{}:{}", tag, msg)))
    }

    #[test]
    fn test_registration_order() {
        let registry: ObserverRegistry<Callback> = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register(recorder(&log, "a"));
        registry.register(recorder(&log, "b"));
        registry.notify(|f| f("x"));

        assert_eq!(*log.lock(), vec!["a:x", "b:x"]);
    }

    #[test]
    fn test_identical_subscribers_removed_independently() {
        let registry: ObserverRegistry<Callback> = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = registry.register(recorder(&log, "same"));
        let _second = registry.register(recorder(&log, "same"));

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        assert_eq!(registry.len(), 1);

        registry.notify(|f| f("x"));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_remove_during_notification_skips_removed() {
        let registry: Arc<ObserverRegistry<Callback>> = Arc::new(ObserverRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let reg = Arc::clone(&registry);
        let slot = Arc::clone(&victim_slot);
        let killer_log = Arc::clone(&log);
        registry.register(Arc::new(move |_msg: &str| {
            killer_log.lock().push("killer".to_string());
            if let Some(id) = slot.lock().take() {
                reg.remove(id);
            }
        }));
        let victim = registry.register(recorder(&log, "victim"));
        *victim_slot.lock() = Some(victim);

        registry.notify(|f| f("x"));
        assert_eq!(*log.lock(), vec!["killer"]);
        assert!(!registry.contains(victim));
    }

    #[test]
    fn test_added_during_notification_waits_for_next_pass() {
        let registry: Arc<ObserverRegistry<Callback>> = Arc::new(ObserverRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let reg = Arc::clone(&registry);
        let inner_log = Arc::clone(&log);
        let added = Arc::new(Mutex::new(false));
        registry.register(Arc::new(move |_msg: &str| {
            let mut added = added.lock();
            if !*added {
                *added = true;
                reg.register(recorder(&inner_log, "late"));
            }
        }));

        registry.notify(|f| f("first"));
        assert!(log.lock().is_empty());

        registry.notify(|f| f("second"));
        assert_eq!(*log.lock(), vec!["late:second"]);
    }

    #[test]
    fn test_remove_and_readd_skipped_for_current_notify() {
        let registry: Arc<ObserverRegistry<Callback>> = Arc::new(ObserverRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let target = recorder(&log, "t");

        let target_id = Arc::new(Mutex::new(None));
        let reg = Arc::clone(&registry);
        let readd = Arc::clone(&target);
        let id_slot = Arc::clone(&target_id);
        registry.register(Arc::new(move |_msg: &str| {
            if let Some(id) = id_slot.lock().take() {
                reg.remove(id);
                reg.register(Arc::clone(&readd));
            }
        }));
        *target_id.lock() = Some(registry.register(target));

        registry.notify(|f| f("x"));
        assert!(log.lock().is_empty());

        log.lock().clear();
        registry.notify(|f| f("y"));
        assert_eq!(*log.lock(), vec!["t:y"]);
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        let a: ObserverRegistry<Callback> = ObserverRegistry::new();
        let b: ObserverRegistry<Callback> = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id_a = a.register(recorder(&log, "a"));
        let id_b = b.register(recorder(&log, "b"));
        assert_ne!(id_a, id_b);
        assert!(!a.remove(id_b));
    }
}
