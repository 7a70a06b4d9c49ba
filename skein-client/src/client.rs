//! The client facade.
//!
//! A [`Client`] is one tab: its own cache, monitors, session and election
//! task. Clients built over the same [`LocalTabHub`] coordinate push
//! ownership with each other.

use crate::cache::ResourceCache;
use crate::executor::{EnvelopeAdapter, IdentityAdapter, ReadOutcome, RequestExecutor, ResponseAdapter};
use crate::limiter::ConcurrencyLimiter;
use crate::loading::LoadingRegistry;
use crate::lock;
use crate::monitor::{Monitor, MonitorCallback, MonitorRegistry, PollMode};
use crate::mutate::{MutationResponse, UploadHandle};
use crate::poll::{PollReason, PollScheduler};
use crate::push::{self, EventCallback};
use crate::session::{SessionCallback, SessionStore};
use crate::sse::SseEventSource;
use crate::storage::MemoryStorage;
use crate::tabs::{ElectionConfig, LocalTabHub, TabCoordinator, TabPorts, TabRole};
use crate::transport::ReqwestTransport;
use bytes::Bytes;
use futures_util::future::{join_all, FutureExt};
use serde_json::Value;
use skein_core::ports::Method;
use skein_core::{
    AdvisoryLocks, Bundle, ChangeNotification, ClientConfig, ClientError, ClientResult, EventSource, HttpTransport,
    KeyValueStorage, LoginOutcome, MonitorId, Session, TabBus, TabId, UserInfo,
};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shared state behind every [`Client`] clone.
pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    pub(crate) tab_id: TabId,
    pub(crate) cache: ResourceCache,
    pub(crate) monitors: Arc<MonitorRegistry>,
    pub(crate) polls: PollScheduler,
    pub(crate) loading: LoadingRegistry,
    pub(crate) limiter: ConcurrencyLimiter,
    pub(crate) executor: RequestExecutor,
    pub(crate) session: SessionStore,
    pub(crate) coordinator: TabCoordinator,
    pub(crate) bus: Arc<dyn TabBus>,
    pub(crate) events: Arc<dyn EventSource>,
    pub(crate) push_healthy: watch::Sender<bool>,
    pub(crate) on_event: Mutex<Option<EventCallback>>,
    pub(crate) push_task: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Cached, de-duplicated, push-synchronized access to a resource API.
///
/// Cheap to clone; clones share everything. Must be built inside a tokio
/// runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn tab_id(&self) -> &TabId {
        &self.inner.tab_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.inner.cache
    }

    /// Current body of `uri`.
    ///
    /// With `cache_ok` and a healthy push connection a cached body is
    /// returned without a request (after one runtime yield). Otherwise the
    /// read joins any in-flight read of the same URI, or starts one.
    pub async fn get(&self, uri: &str, cache_ok: bool) -> ClientResult<Value> {
        self.inner.get(uri, cache_ok).await
    }

    /// Uncached read: no cache lookup, no validator, no de-duplication.
    pub async fn raw_get(&self, uri: &str) -> ClientResult<Value> {
        self.inner.raw_get(uri).await
    }

    pub async fn post(&self, uri: &str, body: &Value) -> ClientResult<MutationResponse> {
        self.inner.mutate(Method::POST, uri, Some(body)).await
    }

    pub async fn put(&self, uri: &str, body: &Value) -> ClientResult<MutationResponse> {
        self.inner.mutate(Method::PUT, uri, Some(body)).await
    }

    pub async fn patch(&self, uri: &str, body: &Value) -> ClientResult<MutationResponse> {
        self.inner.mutate(Method::PATCH, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> ClientResult<MutationResponse> {
        self.inner.mutate(Method::DELETE, uri, None).await
    }

    /// Delete each URI in turn. Returns the one accepted task, if any.
    pub async fn delete_many(&self, uris: &[String]) -> ClientResult<Option<MutationResponse>> {
        self.inner.delete_many(uris).await
    }

    pub fn upload(&self, uri: &str, body: Bytes, content_type: &str) -> UploadHandle {
        self.inner.upload(uri, body, content_type)
    }

    pub fn create_monitor(
        &self,
        uris: Vec<String>,
        callback: impl Fn(&Bundle) + Send + Sync + 'static,
        poll: PollMode,
    ) -> Monitor {
        self.inner.create_monitor(uris, Arc::new(callback), poll)
    }

    /// Replace `old` with a monitor over `uris`, keeping its poll mode.
    pub fn update_monitor(
        &self,
        old: &Monitor,
        uris: Vec<String>,
        callback: impl Fn(&Bundle) + Send + Sync + 'static,
    ) -> Monitor {
        self.inner.rm_monitor(old);
        self.inner.create_monitor(uris, Arc::new(callback), old.poll())
    }

    /// Stop and unregister. Removing twice is harmless.
    pub fn rm_monitor(&self, monitor: &Monitor) {
        self.inner.rm_monitor(monitor);
    }

    /// Resolves once no reads are in flight.
    pub async fn wait_for_fetches(&self) {
        self.inner.loading.wait_drained().await;
    }

    /// Diagnostics: whether a poll task is running for `monitor`.
    #[doc(hidden)]
    pub fn is_polling(&self, monitor: &Monitor) -> bool {
        self.inner.polls.is_polling(monitor.id())
    }

    #[doc(hidden)]
    pub fn poll_reason(&self, monitor: &Monitor) -> Option<PollReason> {
        self.inner.polls.reason(monitor.id())
    }

    pub async fn login(&self, identifier: &str, secret: &str) -> ClientResult<LoginOutcome> {
        self.inner.login(identifier, secret).await
    }

    pub async fn logout(&self) {
        self.inner.logout().await;
    }

    /// Load a persisted session without contacting the server.
    pub fn restore_session(&self) -> bool {
        self.inner.session.restore()
    }

    /// Confirm a restored session with the server.
    pub async fn test_restored_session(&self) -> bool {
        self.inner.test_restored_session().await
    }

    pub fn session_expired(&self) {
        self.inner.session_expired();
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.session.current()
    }

    pub fn user(&self) -> Option<UserInfo> {
        self.inner.session.user()
    }

    /// Called once per session when the server rejects its credential.
    pub fn set_on_session_expired(&self, callback: impl Fn() + Send + Sync + 'static) {
        let callback: SessionCallback = Arc::new(callback);
        self.inner.session.set_on_expired(callback);
    }

    pub fn set_on_logout(&self, callback: impl Fn() + Send + Sync + 'static) {
        let callback: SessionCallback = Arc::new(callback);
        self.inner.session.set_on_logout(callback);
    }

    /// Called with every pushed notification, whether received directly or relayed.
    pub fn set_on_event(&self, callback: impl Fn(&ChangeNotification) + Send + Sync + 'static) {
        let callback: EventCallback = Arc::new(callback);
        *lock(&self.inner.on_event) = Some(callback);
    }

    pub fn role(&self) -> TabRole {
        self.inner.coordinator.role()
    }

    /// Diagnostics: follow role changes.
    #[doc(hidden)]
    pub fn subscribe_role(&self) -> watch::Receiver<TabRole> {
        self.inner.coordinator.subscribe()
    }

    pub fn is_push_healthy(&self) -> bool {
        *self.inner.push_healthy.borrow()
    }

    #[doc(hidden)]
    pub fn subscribe_push_health(&self) -> watch::Receiver<bool> {
        self.inner.push_healthy.subscribe()
    }

    /// Leave the tab group: announce `out`, give up push ownership, stop
    /// polling and background tasks.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("tab_id", &self.inner.tab_id)
            .field("role", &self.inner.coordinator.role())
            .field("cached", &self.inner.cache.len())
            .field("monitors", &self.inner.monitors.len())
            .finish()
    }
}

// ============================================================================
// READS AND MONITORS
// ============================================================================

impl Inner {
    pub(crate) fn is_push_healthy(&self) -> bool {
        *self.push_healthy.borrow()
    }

    pub(crate) async fn get(self: &Arc<Self>, uri: &str, cache_ok: bool) -> ClientResult<Value> {
        if cache_ok && self.is_push_healthy() {
            if let Some(body) = self.cache.body(uri) {
                tokio::task::yield_now().await;
                self.cache.notify(&[uri.to_string()]);
                return Ok(self.cache.body(uri).unwrap_or(body));
            }
        }

        let read = self.loading.join_or_start(uri, |generation| {
            let inner = Arc::clone(self);
            let uri = uri.to_string();
            let task = tokio::spawn(async move {
                let result = inner.limiter.run(inner.fetch(&uri)).await;
                inner.loading.settle(&uri, generation);
                result
            });
            async move {
                task.await
                    .unwrap_or_else(|err| Err(ClientError::Network(format!("read task failed: {}", err))))
            }
            .boxed()
        });
        read.await
    }

    /// One conditional read of `uri`, applied to the cache.
    async fn fetch(self: &Arc<Self>, uri: &str) -> ClientResult<Value> {
        let epoch = self.session.epoch();
        let token = self.session.token();
        let validator = self.cache.validator(uri);

        let outcome = match self
            .executor
            .read(uri, token.as_deref(), validator.as_deref())
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(uri, error = %err, "Read failed");
                return Err(err);
            }
        };

        match outcome {
            ReadOutcome::Fresh { body, validator } => {
                if self.session.epoch() == epoch {
                    self.cache.put(uri, body.clone(), validator);
                } else {
                    // Belongs to the identity that was current when the read began.
                    tracing::debug!(uri, "Not caching read from a previous session");
                }
                Ok(body)
            }
            ReadOutcome::NotModified => match self.cache.body(uri) {
                Some(body) => {
                    self.cache.notify(&[uri.to_string()]);
                    Ok(body)
                }
                None => Err(ClientError::Http { status: 304 }),
            },
            ReadOutcome::NotFound => {
                tracing::debug!(uri, "Resource gone");
                self.cache.remove(uri);
                Err(ClientError::Http { status: 404 })
            }
            ReadOutcome::Unauthorized => {
                self.session_expired();
                Err(ClientError::AuthExpired)
            }
            ReadOutcome::Failed { status } => {
                tracing::debug!(uri, status, "Read rejected");
                Err(ClientError::Http { status })
            }
        }
    }

    async fn raw_get(self: &Arc<Self>, uri: &str) -> ClientResult<Value> {
        let token = self.session.token();
        let outcome = self
            .limiter
            .run(self.executor.read(uri, token.as_deref(), None))
            .await?;
        match outcome {
            ReadOutcome::Fresh { body, .. } => Ok(body),
            ReadOutcome::NotModified => Err(ClientError::Http { status: 304 }),
            ReadOutcome::NotFound => Err(ClientError::Http { status: 404 }),
            ReadOutcome::Unauthorized => {
                self.session_expired();
                Err(ClientError::AuthExpired)
            }
            ReadOutcome::Failed { status } => Err(ClientError::Http { status }),
        }
    }

    /// Re-read `uri` and its expanded form, bypassing the cache, if either is cached.
    pub(crate) async fn refresh_cached(self: &Arc<Self>, uri: &str) {
        let keys = [uri.to_string(), skein_core::uri::expanded(uri)];
        let reads = keys
            .iter()
            .filter(|key| self.cache.has(key))
            .map(|key| async move {
                if let Err(err) = self.get(key, false).await {
                    tracing::debug!(uri = %key, error = %err, "Refresh failed");
                }
            });
        join_all(reads).await;
    }

    pub(crate) fn create_monitor(
        self: &Arc<Self>,
        uris: Vec<String>,
        callback: MonitorCallback,
        poll: PollMode,
    ) -> Monitor {
        let monitor = self.monitors.register(uris, callback, poll);

        // A cached body is only current while push is healthy.
        let healthy = self.is_push_healthy();
        let to_read: Vec<String> = monitor
            .uris()
            .iter()
            .filter(|uri| !(healthy && self.cache.has(uri)))
            .cloned()
            .collect();
        if to_read.is_empty() {
            let weak = Arc::downgrade(self);
            let id = monitor.id();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                if let Some(inner) = weak.upgrade() {
                    inner.monitors.deliver(&inner.cache, id);
                }
            });
        } else {
            for uri in to_read {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = inner.get(&uri, true).await {
                        tracing::warn!(uri = %uri, error = %err, "Initial monitor read failed");
                    }
                });
            }
        }

        if poll.is_forced() {
            self.start_poll(&monitor, PollReason::Forced);
        } else if !self.is_push_healthy() {
            self.start_poll(&monitor, PollReason::PushFallback);
        }
        monitor
    }

    pub(crate) fn rm_monitor(&self, monitor: &Monitor) {
        self.polls.stop(monitor.id());
        self.monitors.unregister(monitor.id());
    }

    pub(crate) fn start_poll(self: &Arc<Self>, monitor: &Monitor, reason: PollReason) {
        let period = monitor.poll().interval(self.config.default_poll_interval());
        let weak = Arc::downgrade(self);
        let uris = monitor.shared_uris();
        let id = monitor.id();
        self.polls.start(id, period, reason, move || {
            let weak = weak.clone();
            let uris = Arc::clone(&uris);
            async move {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                if !inner.monitors.contains(id) {
                    return false;
                }
                inner.poll_tick(id, &uris).await;
                true
            }
        });
    }

    async fn poll_tick(self: &Arc<Self>, id: MonitorId, uris: &[String]) {
        tracing::trace!(monitor_id = id, "Poll tick");
        let reads = uris.iter().map(|uri| async move {
            if let Err(err) = self.get(uri, false).await {
                tracing::warn!(monitor_id = id, uri = %uri, error = %err, "Poll read failed");
            }
        });
        join_all(reads).await;
    }

    /// Start fallback polling for every monitor not already polling.
    pub(crate) fn push_lost(self: &Arc<Self>) {
        let mut started = 0;
        for monitor in self.monitors.snapshot() {
            if !self.polls.is_polling(monitor.id()) {
                self.start_poll(&monitor, PollReason::PushFallback);
                started += 1;
            }
        }
        tracing::info!(tab_id = %self.tab_id, polls = started, "Push unhealthy, polling");
    }

    /// Stop fallback polls; forced polls keep running.
    pub(crate) fn push_restored(&self) {
        let stopped = self.polls.stop_reason(PollReason::PushFallback);
        tracing::info!(tab_id = %self.tab_id, polls = stopped.len(), "Push healthy");
    }

    pub(crate) fn set_push_healthy(self: &Arc<Self>, healthy: bool) {
        let changed = self.push_healthy.send_if_modified(|current| {
            if *current == healthy {
                return false;
            }
            *current = healthy;
            true
        });
        if !changed {
            return;
        }
        if healthy {
            self.push_restored();
        } else {
            self.push_lost();
        }
    }

    async fn shutdown(self: &Arc<Self>) {
        self.coordinator.shutdown().await;
        self.stop_push();
        self.polls.stop_all();
        if let Some(task) = lock(&self.supervisor).take() {
            task.abort();
        }
        self.push_healthy.send_replace(false);
        tracing::info!(tab_id = %self.tab_id, "Client shut down");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.push_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.supervisor).take() {
            task.abort();
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles a [`Client`]. Every port has a production default.
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    events: Option<Arc<dyn EventSource>>,
    bus: Option<Arc<dyn TabBus>>,
    locks: Option<Arc<dyn AdvisoryLocks>>,
    session_storage: Option<Arc<dyn KeyValueStorage>>,
    shared_storage: Option<Arc<dyn KeyValueStorage>>,
    adapter: Option<Arc<dyn ResponseAdapter>>,
    tab_id: Option<TabId>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            events: None,
            bus: None,
            locks: None,
            session_storage: None,
            shared_storage: None,
            adapter: None,
            tab_id: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn event_source(mut self, events: Arc<dyn EventSource>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use `hub` as both tab bus and lock manager.
    pub fn hub(mut self, hub: &LocalTabHub) -> Self {
        self.bus = Some(Arc::new(hub.clone()));
        self.locks = Some(Arc::new(hub.clone()));
        self
    }

    pub fn tab_bus(mut self, bus: Arc<dyn TabBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn AdvisoryLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Per-tab storage for the session.
    pub fn session_storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.session_storage = Some(storage);
        self
    }

    /// Storage shared by all tabs, for the push-owner marker.
    pub fn shared_storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.shared_storage = Some(storage);
        self
    }

    pub fn response_adapter(mut self, adapter: Arc<dyn ResponseAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn tab_id(mut self, tab_id: TabId) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    pub fn build(self) -> ClientResult<Client> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&config)?),
        };
        let events: Arc<dyn EventSource> = match self.events {
            Some(events) => events,
            None => Arc::new(SseEventSource::new(&config)?),
        };
        let adapter: Arc<dyn ResponseAdapter> = match (self.adapter, &config.envelope_key) {
            (Some(adapter), _) => adapter,
            (None, Some(key)) => Arc::new(EnvelopeAdapter::new(key.clone())),
            (None, None) => Arc::new(IdentityAdapter),
        };
        let (bus, locks): (Arc<dyn TabBus>, Arc<dyn AdvisoryLocks>) = match (self.bus, self.locks) {
            (Some(bus), Some(locks)) => (bus, locks),
            (bus, locks) => {
                let hub = LocalTabHub::new();
                (
                    bus.unwrap_or_else(|| Arc::new(hub.clone())),
                    locks.unwrap_or_else(|| Arc::new(hub)),
                )
            }
        };
        let session_storage = self
            .session_storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let shared_storage = self
            .shared_storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let tab_id = self.tab_id.unwrap_or_else(TabId::generate);
        let (push_healthy, health_rx) = watch::channel(false);

        let (coordinator, relayed) = TabCoordinator::spawn(
            tab_id.clone(),
            TabPorts {
                bus: Arc::clone(&bus),
                locks,
                shared: shared_storage,
            },
            ElectionConfig::from_client_config(&config),
            health_rx,
        );
        let role = coordinator.subscribe();
        let owner_health = coordinator.subscribe_owner_health();
        let monitors = Arc::new(MonitorRegistry::new());

        let inner = Arc::new(Inner {
            cache: ResourceCache::with_listener(monitors.clone()),
            monitors,
            polls: PollScheduler::new(),
            loading: LoadingRegistry::new(),
            limiter: ConcurrencyLimiter::new(config.max_concurrent_reads),
            executor: RequestExecutor::new(transport, adapter),
            session: SessionStore::new(session_storage),
            coordinator,
            bus,
            events,
            push_healthy,
            on_event: Mutex::new(None),
            push_task: Mutex::new(None),
            supervisor: Mutex::new(None),
            tab_id,
            config,
        });

        let supervisor = tokio::spawn(push::supervise(
            Arc::downgrade(&inner),
            role,
            owner_health,
            relayed,
        ));
        *lock(&inner.supervisor) = Some(supervisor);
        tracing::debug!(tab_id = %inner.tab_id, "Client started");

        Ok(Client { inner })
    }
}
