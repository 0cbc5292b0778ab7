use crate::messages::MqttMessage;
use crate::topics::TopicFilter;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

/// A callback invoked for each inbound message matching a subscription.
pub type MessageCallback = Arc<dyn Fn(&MqttMessage) + Send + Sync>;

/// An opaque handle identifying one registered callback.
///
/// The registry owns the callback lifetime; dropping the handle does not
/// unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

struct Subscription {
    id: u64,
    filter: TopicFilter,
    callback: MessageCallback,
}

/// Registered callbacks, kept in registration order.
#[derive(Default)]
pub(crate) struct SubscriptionStore {
    entries: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl SubscriptionStore {
    pub fn insert(&self, filter: TopicFilter, callback: MessageCallback) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push(Subscription {
            id,
            filter,
            callback,
        });
        SubscriptionHandle(id)
    }

    /// Remove a callback; idempotent. Returns the filter of the removed entry.
    pub fn remove(&self, handle: SubscriptionHandle) -> Option<TopicFilter> {
        let mut entries = self.entries.lock().unwrap();
        let index = entries.iter().position(|entry| entry.id == handle.0)?;
        Some(entries.remove(index).filter)
    }

    /// True when at least one remaining entry covers the given pattern.
    pub fn covers(&self, pattern: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|entry| entry.filter.pattern == pattern)
    }

    /// Invoke every matching callback, in registration order.
    ///
    /// The callbacks are cloned out of the lock first: a callback is free to
    /// subscribe or unsubscribe while being dispatched to.
    pub fn dispatch(&self, message: &MqttMessage) {
        let matching: Vec<MessageCallback> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|entry| entry.filter.accept(message))
                .map(|entry| entry.callback.clone())
                .collect()
        };
        for callback in matching {
            callback(message);
        }
    }

    /// The distinct patterns to re-establish on the broker after a reconnect.
    pub fn patterns(&self) -> Vec<TopicFilter> {
        let entries = self.entries.lock().unwrap();
        let mut patterns: Vec<TopicFilter> = Vec::new();
        for entry in entries.iter() {
            if !patterns.iter().any(|p| p.pattern == entry.filter.pattern) {
                patterns.push(entry.filter.clone());
            }
        }
        patterns
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}
