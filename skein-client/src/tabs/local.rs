//! In-process tab hub.
//!
//! Stands in for the browser's per-origin broadcast channel and lock
//! manager when several clients ("tabs") share one process: every client
//! built with the same [`LocalTabHub`] sees the others' messages and
//! contends for the same advisory locks.

use crate::lock;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use skein_core::{AdvisoryLocks, LockGuard, TabBus, TabId, TabMessage};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Envelope {
    from: TabId,
    message: TabMessage,
}

/// Shared broadcast channel plus advisory lock table.
#[derive(Clone)]
pub struct LocalTabHub {
    tx: broadcast::Sender<Envelope>,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalTabHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` messages are buffered per subscriber before it starts lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        lock(&self.held).contains(name)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalTabHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TabBus for LocalTabHub {
    fn broadcast(&self, from: &TabId, message: TabMessage) {
        let kind = message.kind();
        match self.tx.send(Envelope {
            from: from.clone(),
            message,
        }) {
            Ok(receivers) => debug!(tab_id = %from, kind, receivers, "Tab message sent"),
            Err(_) => debug!(tab_id = %from, kind, "No tabs listening"),
        }
    }

    fn subscribe(&self, me: &TabId) -> BoxStream<'static, TabMessage> {
        let me = me.clone();
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(move |received| {
                let message = match received {
                    Ok(envelope) if envelope.from != me => Some(envelope.message),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(tab_id = %me, skipped, "Tab lagged, messages were dropped");
                        None
                    }
                };
                std::future::ready(message)
            })
            .boxed()
    }
}

impl AdvisoryLocks for LocalTabHub {
    fn try_acquire(&self, name: &str) -> Option<LockGuard> {
        if !lock(&self.held).insert(name.to_string()) {
            return None;
        }
        let held = Arc::clone(&self.held);
        let name = name.to_string();
        Some(LockGuard::new(move || {
            lock(&held).remove(&name);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tab_does_not_hear_itself() {
        let hub = LocalTabHub::new();
        let a = TabId::from("a");
        let b = TabId::from("b");
        let mut a_inbox = hub.subscribe(&a);
        let mut b_inbox = hub.subscribe(&b);

        hub.broadcast(&a, TabMessage::looking_for_owner(a.clone()));

        assert_eq!(
            b_inbox.next().await,
            Some(TabMessage::looking_for_owner(a.clone()))
        );
        let nothing = tokio::time::timeout(Duration::from_millis(20), a_inbox.next()).await;
        assert!(nothing.is_err());
    }

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let hub = LocalTabHub::new();
        let guard = hub.try_acquire("push-ownership").unwrap();
        assert!(hub.try_acquire("push-ownership").is_none());
        assert!(hub.try_acquire("other").is_some());

        guard.release();
        assert!(!hub.is_held("push-ownership"));
        assert!(hub.try_acquire("push-ownership").is_some());
    }

    #[test]
    fn test_dropped_guard_releases() {
        let hub = LocalTabHub::new();
        drop(hub.try_acquire("push-ownership"));
        assert!(!hub.is_held("push-ownership"));
    }
}
