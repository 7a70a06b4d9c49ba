//! Resource cache with change notification.
//!
//! Entries are keyed by URI. Every put or effective remove notifies the
//! registered [`ChangeListener`] after the internal lock has been released,
//! so listeners may read the cache (or write to it) from inside the callback.

use crate::lock;
use serde_json::Value;
use skein_core::{embedded_validator, uri, Bundle, CacheEntry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Receives the keys touched by a cache mutation.
pub trait ChangeListener: Send + Sync {
    fn resources_changed(&self, cache: &ResourceCache, uris: &[String]);
}

/// URI-keyed store of the last known body and validator of each resource.
pub struct ResourceCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    listener: Option<Arc<dyn ChangeListener>>,
}

impl ResourceCache {
    /// A cache that notifies nobody.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            listener: None,
        }
    }

    pub fn with_listener(listener: Arc<dyn ChangeListener>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            listener: Some(listener),
        }
    }

    pub fn get(&self, uri: &str) -> Option<CacheEntry> {
        lock(&self.entries).get(uri).cloned()
    }

    pub fn body(&self, uri: &str) -> Option<Value> {
        lock(&self.entries).get(uri).map(|entry| entry.body.clone())
    }

    pub fn validator(&self, uri: &str) -> Option<String> {
        lock(&self.entries)
            .get(uri)
            .and_then(|entry| entry.validator.clone())
    }

    pub fn has(&self, uri: &str) -> bool {
        lock(&self.entries).contains_key(uri)
    }

    /// Store `body` under `uri`, replacing any previous entry, then notify.
    ///
    /// Without an explicit validator, one embedded in the body is used, but
    /// only for URIs without a query: an expanded body carries the validator
    /// of the plain resource, not of the view.
    pub fn put(&self, uri: &str, body: Value, validator: Option<String>) {
        let validator = validator.or_else(|| {
            if uri::has_query(uri) {
                None
            } else {
                embedded_validator(&body)
            }
        });
        lock(&self.entries).insert(uri.to_string(), CacheEntry::new(uri, body, validator));
        self.notify(&[uri.to_string()]);
    }

    /// Drop `uri` and its expanded counterpart.
    ///
    /// Returns true if anything was removed. Listeners hear about each key
    /// that was actually present, once, after both are gone.
    pub fn remove(&self, uri: &str) -> bool {
        let mut keys = vec![uri.to_string()];
        if !uri::is_expanded(uri) {
            keys.push(uri::expanded(uri));
        }

        let removed: Vec<String> = {
            let mut entries = lock(&self.entries);
            keys.into_iter()
                .filter(|key| entries.remove(key).is_some())
                .collect()
        };

        if removed.is_empty() {
            return false;
        }
        self.notify(&removed);
        true
    }

    /// Drop every entry without notifying.
    pub fn clear(&self) {
        let mut entries = lock(&self.entries);
        let count = entries.len();
        entries.clear();
        tracing::debug!(count, "Resource cache cleared");
    }

    pub fn uris(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Current body of every URI in `uris`, in order.
    pub fn bundle(&self, uris: &[String]) -> Bundle {
        let entries = lock(&self.entries);
        let mut bundle = Bundle::new();
        for uri in uris {
            bundle.insert(uri.clone(), entries.get(uri).map(|e| e.body.clone()));
        }
        bundle
    }

    /// Notify the listener that `uris` changed without mutating anything.
    pub fn notify(&self, uris: &[String]) {
        if let Some(listener) = &self.listener {
            listener.resources_changed(self, uris);
        }
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("len", &self.len())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}
