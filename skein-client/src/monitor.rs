//! Monitor subscriptions.
//!
//! A monitor watches a fixed list of URIs and receives a [`Bundle`] of their
//! current cached values whenever any of them changes.

use crate::cache::{ChangeListener, ResourceCache};
use crate::lock;
use skein_core::{Bundle, MonitorId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Invoked with the monitor's bundle after each relevant cache change.
pub type MonitorCallback = Arc<dyn Fn(&Bundle) + Send + Sync>;

/// Whether a monitor polls regardless of push health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollMode {
    /// Poll only while push is unhealthy.
    #[default]
    Never,
    /// Always poll, at the configured default interval.
    Default,
    /// Always poll, at this interval.
    Every(Duration),
}

impl PollMode {
    pub fn is_forced(&self) -> bool {
        !matches!(self, PollMode::Never)
    }

    /// Poll interval, falling back to `default` unless a specific, non-zero
    /// one was asked for.
    pub fn interval(&self, default: Duration) -> Duration {
        match self {
            PollMode::Every(interval) if !interval.is_zero() => *interval,
            PollMode::Every(_) | PollMode::Never | PollMode::Default => default,
        }
    }
}

/// Handle on a registered monitor.
#[derive(Clone, PartialEq, Eq)]
pub struct Monitor {
    id: MonitorId,
    uris: Arc<[String]>,
    poll: PollMode,
}

impl Monitor {
    pub fn id(&self) -> MonitorId {
        self.id
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn poll(&self) -> PollMode {
        self.poll
    }

    pub(crate) fn shared_uris(&self) -> Arc<[String]> {
        Arc::clone(&self.uris)
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.id)
            .field("uris", &self.uris)
            .field("poll", &self.poll)
            .finish()
    }
}

struct Registered {
    monitor: Monitor,
    callback: MonitorCallback,
}

/// Registered monitors, in registration order.
pub struct MonitorRegistry {
    next_id: AtomicU64,
    monitors: Mutex<BTreeMap<MonitorId, Registered>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            monitors: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, uris: Vec<String>, callback: MonitorCallback, poll: PollMode) -> Monitor {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let monitor = Monitor {
            id,
            uris: uris.into(),
            poll,
        };
        lock(&self.monitors).insert(
            id,
            Registered {
                monitor: monitor.clone(),
                callback,
            },
        );
        tracing::debug!(monitor_id = id, uris = ?monitor.uris, "Monitor registered");
        monitor
    }

    /// Returns false when `id` was not registered.
    pub fn unregister(&self, id: MonitorId) -> bool {
        let removed = lock(&self.monitors).remove(&id).is_some();
        if removed {
            tracing::debug!(monitor_id = id, "Monitor removed");
        }
        removed
    }

    pub fn contains(&self, id: MonitorId) -> bool {
        lock(&self.monitors).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.monitors).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.monitors).is_empty()
    }

    /// Every registered monitor, in registration order.
    pub fn snapshot(&self) -> Vec<Monitor> {
        lock(&self.monitors)
            .values()
            .map(|registered| registered.monitor.clone())
            .collect()
    }

    /// Deliver the current bundle to one monitor, if it is still registered.
    pub fn deliver(&self, cache: &ResourceCache, id: MonitorId) {
        let target = lock(&self.monitors)
            .get(&id)
            .map(|registered| (registered.monitor.shared_uris(), Arc::clone(&registered.callback)));
        if let Some((uris, callback)) = target {
            callback(&cache.bundle(&uris));
        }
    }
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeListener for MonitorRegistry {
    fn resources_changed(&self, cache: &ResourceCache, uris: &[String]) {
        // Snapshot under the lock; callbacks run without it so they can
        // create or remove monitors.
        let affected: Vec<(MonitorId, Arc<[String]>, MonitorCallback)> = lock(&self.monitors)
            .values()
            .filter(|registered| registered.monitor.uris.iter().any(|u| uris.contains(u)))
            .map(|registered| {
                (
                    registered.monitor.id,
                    registered.monitor.shared_uris(),
                    Arc::clone(&registered.callback),
                )
            })
            .collect();

        for (id, watched, callback) in affected {
            // A callback may have removed a later monitor.
            if !self.contains(id) {
                continue;
            }
            callback(&cache.bundle(&watched));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (Arc<MonitorRegistry>, ResourceCache) {
        let registry = Arc::new(MonitorRegistry::new());
        let cache = ResourceCache::with_listener(registry.clone());
        (registry, cache)
    }

    fn recording() -> (Arc<Mutex<Vec<Bundle>>>, MonitorCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: MonitorCallback = Arc::new(move |bundle: &Bundle| {
            sink.lock().unwrap().push(bundle.clone());
        });
        (seen, callback)
    }

    fn uris(list: &[&str]) -> Vec<String> {
        list.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_change_delivers_full_bundle() {
        let (registry, cache) = setup();
        let (seen, callback) = recording();
        registry.register(uris(&["/a", "/b"]), callback, PollMode::Never);

        cache.put("/b", json!(2), None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].to_value(), json!({ "/a": null, "/b": 2 }));
    }

    #[test]
    fn test_unrelated_change_is_ignored() {
        let (registry, cache) = setup();
        let (seen, callback) = recording();
        registry.register(uris(&["/a"]), callback, PollMode::Never);

        cache.put("/z", json!(1), None);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_notification_follows_registration_order() {
        let (registry, cache) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.register(
                uris(&["/a"]),
                Arc::new(move |_: &Bundle| order.lock().unwrap().push(label)),
                PollMode::Never,
            );
        }

        cache.put("/a", json!(1), None);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (registry, cache) = setup();
        let (seen, callback) = recording();
        let monitor = registry.register(uris(&["/a"]), callback, PollMode::Never);

        assert!(registry.unregister(monitor.id()));
        assert!(!registry.unregister(monitor.id()));
        cache.put("/a", json!(1), None);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_callback_may_remove_later_monitor() {
        let (registry, cache) = setup();
        let (seen, callback) = recording();
        let victim_id = Arc::new(AtomicU64::new(0));

        let remover = {
            let registry = Arc::downgrade(&registry);
            let victim_id = Arc::clone(&victim_id);
            Arc::new(move |_: &Bundle| {
                if let Some(registry) = registry.upgrade() {
                    registry.unregister(victim_id.load(Ordering::SeqCst));
                }
            })
        };
        registry.register(uris(&["/a"]), remover, PollMode::Never);
        let victim = registry.register(uris(&["/a"]), callback, PollMode::Never);
        victim_id.store(victim.id(), Ordering::SeqCst);

        cache.put("/a", json!(1), None);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_poll_mode_interval() {
        let default = Duration::from_secs(10);
        assert_eq!(PollMode::Never.interval(default), default);
        assert_eq!(PollMode::Default.interval(default), default);
        assert_eq!(
            PollMode::Every(Duration::from_secs(2)).interval(default),
            Duration::from_secs(2)
        );
        assert_eq!(PollMode::Every(Duration::ZERO).interval(default), default);
        assert!(!PollMode::Never.is_forced());
        assert!(PollMode::Default.is_forced());
    }
}
