//! Push-event channel.
//!
//! The owner tab keeps one connection to the server's event stream, applies
//! each batch to its cache and relays the batch to the other tabs, which
//! apply it the same way. Push health gates the cache fast path and
//! fallback polling.

use crate::client::Inner;
use crate::lock;
use crate::tabs::TabRole;
use futures_util::future::join_all;
use futures_util::StreamExt;
use skein_core::uri;
use skein_core::{ChangeKind, ChangeNotification, EventBatch, TabMessage};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

/// Receives every pushed notification.
pub type EventCallback = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

/// Follow role and owner health changes and apply relayed batches until the
/// client goes away.
pub(crate) async fn supervise(
    inner: Weak<Inner>,
    mut role: watch::Receiver<TabRole>,
    mut owner_health: watch::Receiver<bool>,
    mut relayed: mpsc::UnboundedReceiver<EventBatch>,
) {
    loop {
        tokio::select! {
            changed = role.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = role.borrow_and_update().clone();
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.role_changed(&current, *owner_health.borrow());
            }
            changed = owner_health.changed() => {
                if changed.is_err() {
                    break;
                }
                let healthy = *owner_health.borrow_and_update();
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.role_changed(&role.borrow().clone(), healthy);
            }
            batch = relayed.recv() => {
                let Some(batch) = batch else {
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                tracing::trace!(tab_id = %inner.tab_id, events = batch.events.len(), "Relayed batch");
                let refresh = inner.apply_batch(&batch);
                inner.spawn_refresh(refresh);
            }
        }
    }
}

impl Inner {
    /// A deferring tab is exactly as healthy as its owner says it is.
    pub(crate) fn role_changed(self: &Arc<Self>, role: &TabRole, owner_healthy: bool) {
        match role {
            TabRole::Owner => self.start_push(),
            TabRole::DeferringToOwner(_) => {
                self.stop_push();
                self.set_push_healthy(owner_healthy);
            }
            TabRole::Unowned | TabRole::SeekingOwnership => {
                self.stop_push();
                self.set_push_healthy(false);
            }
        }
    }

    fn start_push(self: &Arc<Self>) {
        let mut task = lock(&self.push_task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        // Unhealthy until this tab's own connection is up.
        self.set_push_healthy(false);
        *task = Some(tokio::spawn(run_connection(Arc::downgrade(self))));
    }

    pub(crate) fn stop_push(&self) {
        if let Some(task) = lock(&self.push_task).take() {
            task.abort();
            tracing::debug!(tab_id = %self.tab_id, "Push channel closed");
        }
    }

    /// Parse, apply and relay one message from the event stream.
    fn handle_push_message(self: &Arc<Self>, text: &str) {
        let batch = match EventBatch::parse(text) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(tab_id = %self.tab_id, error = %err, "Malformed push message");
                return;
            }
        };
        let refresh = self.apply_batch(&batch);
        self.bus.broadcast(&self.tab_id, TabMessage::Events(batch));
        self.spawn_refresh(refresh);
    }

    /// Apply a batch to the cache. Returns the URIs that must be re-read.
    pub(crate) fn apply_batch(&self, batch: &EventBatch) -> Vec<String> {
        let on_event = lock(&self.on_event).clone();
        let mut refresh: Vec<String> = Vec::new();
        let want = |target: &str, refresh: &mut Vec<String>| {
            let cached = self.cache.has(target) || self.cache.has(&uri::expanded(target));
            if cached && !refresh.iter().any(|u| u == target) {
                refresh.push(target.to_string());
            }
        };

        for notification in &batch.events {
            if let Some(callback) = &on_event {
                callback(notification);
            }
            let origin = notification.uri();
            if origin.is_empty() {
                tracing::debug!(message_id = %notification.message_id, "Notification without origin");
                continue;
            }

            let kind = notification.kind();
            match (kind, &notification.body) {
                (ChangeKind::Removed, _) => {
                    self.cache.remove(origin);
                }
                (_, Some(body)) => self.cache.put(origin, body.clone(), None),
                (_, None) => want(origin, &mut refresh),
            }

            if matches!(kind, ChangeKind::Created | ChangeKind::Removed) {
                if let Some(parent) = uri::parent_collection(origin) {
                    want(&parent, &mut refresh);
                }
            }
        }
        refresh
    }

    fn spawn_refresh(self: &Arc<Self>, uris: Vec<String>) {
        if uris.is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            join_all(uris.iter().map(|uri| inner.refresh_cached(uri))).await;
        });
    }
}

async fn run_connection(inner: Weak<Inner>) {
    let Some(reconnect) = inner.upgrade().map(|i| i.config.reconnect.clone()) else {
        return;
    };
    let mut backoff = reconnect.initial_ms;

    loop {
        let Some((events, token, tab_id)) = inner
            .upgrade()
            .map(|i| (Arc::clone(&i.events), i.session.token(), i.tab_id.clone()))
        else {
            return;
        };

        match events.connect(token).await {
            Ok(mut stream) => {
                tracing::info!(%tab_id, "Push channel connected");
                backoff = reconnect.initial_ms;
                match inner.upgrade() {
                    Some(inner) => inner.set_push_healthy(true),
                    None => return,
                }

                while let Some(message) = stream.next().await {
                    match message {
                        Ok(text) => match inner.upgrade() {
                            Some(inner) => inner.handle_push_message(&text),
                            None => return,
                        },
                        Err(err) => {
                            tracing::warn!(%tab_id, error = %err, "Push channel failed");
                            break;
                        }
                    }
                }
                tracing::info!(%tab_id, "Push channel disconnected");
            }
            Err(err) => {
                tracing::warn!(%tab_id, error = %err, "Push channel connect failed");
            }
        }

        match inner.upgrade() {
            Some(inner) => inner.set_push_healthy(false),
            None => return,
        }

        let delay = jittered_backoff(backoff, reconnect.jitter_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        backoff = next_backoff(backoff, reconnect.multiplier, reconnect.max_ms);
    }
}

fn next_backoff(current_ms: u64, multiplier: f64, max_ms: u64) -> u64 {
    let next = (current_ms as f64 * multiplier) as u64;
    next.min(max_ms)
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    base_ms.saturating_add(nanos % jitter_ms)
}
