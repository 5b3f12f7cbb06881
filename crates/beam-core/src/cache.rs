//! Shared device cache with change subscriptions.
//!
//! The cache is the one mutable resource shared between the motion layer and
//! the poller: axes publish their `target` when a move starts, the poller
//! publishes `value` and `status` after every poll, and subscribers (the poll
//! workers) get a callback whenever a key they watch changes.
//!
//! Semantics are deliberately simple: last writer wins, reads are eventually
//! consistent, no multi-key transactions.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Key under which a moveable publishes its last requested target.
pub const KEY_TARGET: &str = "target";
/// Key carrying a device's poll interval in seconds.
pub const KEY_POLLINTERVAL: &str = "pollinterval";
/// Key carrying the last polled value.
pub const KEY_VALUE: &str = "value";
/// Key carrying the last polled status.
pub const KEY_STATUS: &str = "status";

/// One change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheUpdate {
    /// Device namespace.
    pub device: String,
    /// Key within the device namespace.
    pub key: String,
    /// New value.
    pub value: Value,
}

/// Callback invoked synchronously on every matching `put`.
///
/// Callbacks must not block; they typically flip a flag and wake a task.
pub type CacheCallback = Arc<dyn Fn(&CacheUpdate) + Send + Sync>;

/// Handle returned by [`Cache::subscribe`], used for unsubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Stored value plus the time it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Stored value.
    pub value: Value,
    /// Write time.
    pub updated: Instant,
}

/// Key-value store with per-key subscriptions.
pub trait Cache: Send + Sync {
    /// Latest entry for `device/key`.
    fn get(&self, device: &str, key: &str) -> Option<CacheEntry>;

    /// Store a value and notify subscribers of `device/key`.
    fn put(&self, device: &str, key: &str, value: Value);

    /// Register `callback` for changes of `device/key`.
    fn subscribe(&self, device: &str, key: &str, callback: CacheCallback) -> SubscriptionId;

    /// Remove a subscription; unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

fn cache_key(device: &str, key: &str) -> String {
    format!("{}/{}", device.to_lowercase(), key.to_lowercase())
}

/// In-process [`Cache`] implementation.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    callbacks: Mutex<HashMap<String, Vec<(SubscriptionId, CacheCallback)>>>,
    next_id: AtomicU64,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("entries", &self.entries.read().len())
            .field("subscriptions", &self.callbacks.lock().len())
            .finish()
    }
}

impl Cache for InMemoryCache {
    fn get(&self, device: &str, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(&cache_key(device, key)).cloned()
    }

    fn put(&self, device: &str, key: &str, value: Value) {
        let full_key = cache_key(device, key);
        self.entries.write().insert(
            full_key.clone(),
            CacheEntry {
                value: value.clone(),
                updated: Instant::now(),
            },
        );

        // Callbacks run without any lock held so they may touch the cache.
        let callbacks: Vec<CacheCallback> = self
            .callbacks
            .lock()
            .get(&full_key)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        if callbacks.is_empty() {
            return;
        }
        let update = CacheUpdate {
            device: device.to_string(),
            key: key.to_string(),
            value,
        };
        for callback in callbacks {
            callback(&update);
        }
    }

    fn subscribe(&self, device: &str, key: &str, callback: CacheCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .entry(cache_key(device, key))
            .or_default()
            .push((id, callback));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut callbacks = self.callbacks.lock();
        for subs in callbacks.values_mut() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        callbacks.retain(|_, subs| !subs.is_empty());
    }
}
