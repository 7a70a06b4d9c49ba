//! SKEIN Test Utilities
//!
//! Shared test infrastructure for the SKEIN workspace:
//! - A scripted HTTP transport that records and gates requests
//! - A scripted push-event source
//! - Proptest generators for URIs and event batches
//! - Fixtures for configs and canned responses

pub use skein_core::{
    ChangeNotification, ClientConfig, ClientError, ClientResult, EventBatch, HttpRequest,
    HttpResponse, TabId, TabMessage,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use http::Method;
use serde_json::Value;
use skein_core::{EventSource, EventStream, HttpTransport};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

#[derive(Debug, Clone)]
enum MockReply {
    Respond(HttpResponse),
    Fail(String),
}

/// Scripted [`HttpTransport`].
///
/// Replies are queued per method and URI; the last queued reply repeats.
/// Unscripted requests get a 404. Every request is recorded before it
/// waits on the gate, so tests can observe reads that are still in flight.
pub struct MockTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<MockReply>>>,
    requests: Mutex<Vec<HttpRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    gate: watch::Sender<bool>,
    latency: Mutex<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            gate,
            latency: Mutex::new(Duration::ZERO),
        }
    }

    fn push_reply(&self, method: Method, uri: &str, reply: MockReply) {
        lock(&self.routes)
            .entry((method, uri.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// Queue `response` for `method uri`.
    pub fn on(&self, method: Method, uri: &str, response: HttpResponse) {
        self.push_reply(method, uri, MockReply::Respond(response));
    }

    pub fn on_get(&self, uri: &str, response: HttpResponse) {
        self.on(Method::GET, uri, response);
    }

    pub fn on_get_json(&self, uri: &str, status: u16, body: Value) {
        self.on_get(uri, HttpResponse::json(status, &body));
    }

    /// Queue a transport failure (no response) for `method uri`.
    pub fn fail(&self, method: Method, uri: &str, message: &str) {
        self.push_reply(method, uri, MockReply::Fail(message.to_string()));
    }

    /// Hold every response until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        lock(&self.requests).last().cloned()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Number of `method uri` requests seen so far.
    pub fn count(&self, method: &Method, uri: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|request| request.method == *method && request.uri == uri)
            .count()
    }

    pub fn gets(&self, uri: &str) -> usize {
        self.count(&Method::GET, uri)
    }

    pub fn clear_requests(&self) {
        lock(&self.requests).clear();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously outstanding requests seen.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, method: &Method, uri: &str) -> MockReply {
        let mut routes = lock(&self.routes);
        match routes.get_mut(&(method.clone(), uri.to_string())) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or(MockReply::Respond(HttpResponse::new(404))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or(MockReply::Respond(HttpResponse::new(404))),
            None => MockReply::Respond(HttpResponse::new(404)),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> ClientResult<HttpResponse> {
        let method = request.method.clone();
        let uri = request.uri.clone();
        lock(&self.requests).push(request);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let reply = self.next_reply(&method, &uri);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match reply {
            MockReply::Respond(response) => Ok(response),
            MockReply::Fail(message) => Err(ClientError::Network(message)),
        }
    }
}

// ============================================================================
// SCRIPTED EVENT SOURCE
// ============================================================================

/// [`EventSource`] whose stream is fed by the test.
#[derive(Default)]
pub struct ScriptedEventSource {
    sender: Mutex<Option<mpsc::UnboundedSender<ClientResult<String>>>>,
    tokens: Mutex<Vec<Option<String>>>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl ScriptedEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts fail.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Deliver a raw message on the open stream. False when nobody is connected.
    pub fn push_raw(&self, text: &str) -> bool {
        match lock(&self.sender).as_ref() {
            Some(sender) => sender.send(Ok(text.to_string())).is_ok(),
            None => false,
        }
    }

    pub fn push(&self, batch: &EventBatch) -> bool {
        match serde_json::to_string(batch) {
            Ok(text) => self.push_raw(&text),
            Err(_) => false,
        }
    }

    /// Fail the open stream with a transport error.
    pub fn break_stream(&self, message: &str) {
        if let Some(sender) = lock(&self.sender).take() {
            let _ = sender.send(Err(ClientError::Network(message.to_string())));
        }
    }

    /// End the open stream cleanly.
    pub fn disconnect(&self) {
        lock(&self.sender).take();
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.sender)
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Tokens presented on each connection attempt.
    pub fn tokens(&self) -> Vec<Option<String>> {
        lock(&self.tokens).clone()
    }
}

#[async_trait]
impl EventSource for ScriptedEventSource {
    async fn connect(&self, token: Option<String>) -> ClientResult<EventStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        lock(&self.tokens).push(token);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::Network("connection refused".to_string()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        *lock(&self.sender) = Some(sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    /// Resource path of one to four segments, e.g. `/chassis/1/fans`.
    pub fn arb_path() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z][a-z0-9]{0,7}", 1..5)
            .prop_map(|segments| format!("/{}", segments.join("/")))
    }

    pub fn arb_message_id() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("ResourceEvent.1.0.ResourceChanged".to_string()),
            Just("ResourceEvent.1.0.ResourceCreated".to_string()),
            Just("ResourceEvent.1.0.ResourceRemoved".to_string()),
            Just("Alert.1.0.StatusChange".to_string()),
        ]
    }

    pub fn arb_notification() -> impl Strategy<Value = ChangeNotification> {
        (arb_message_id(), arb_path(), prop::option::of(any::<u32>())).prop_map(
            |(message_id, uri, revision)| {
                let notification = ChangeNotification::new(message_id, uri);
                match revision {
                    Some(revision) => {
                        notification.with_body(serde_json::json!({ "Revision": revision }))
                    }
                    None => notification,
                }
            },
        )
    }

    pub fn arb_batch() -> impl Strategy<Value = EventBatch> {
        prop::collection::vec(arb_notification(), 0..6).prop_map(EventBatch::new)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use serde_json::json;

    /// Config with timings short enough for real-clock tests.
    pub fn fast_config() -> ClientConfig {
        let mut config = ClientConfig {
            api_base_url: "http://bmc.test".to_string(),
            election_timeout_ms: 40,
            election_max_attempts: 3,
            owner_check_interval_ms: 200,
            default_poll_interval_ms: 60_000,
            ..ClientConfig::default()
        };
        config.reconnect.initial_ms = 10;
        config.reconnect.max_ms = 40;
        config.reconnect.jitter_ms = 0;
        config
    }

    pub fn login_response(token: &str, username: &str) -> HttpResponse {
        HttpResponse::json(
            200,
            &json!({
                "token": token,
                "username": username,
                "email": format!("{}@example.com", username),
                "role": "Administrator",
            }),
        )
    }

    pub fn whoami_response(username: &str) -> HttpResponse {
        HttpResponse::json(
            200,
            &json!({
                "username": username,
                "email": format!("{}@example.com", username),
                "role": "Administrator",
            }),
        )
    }

    /// A member resource body carrying an embedded validator.
    pub fn widget(id: u32, revision: u32) -> Value {
        json!({
            "@odata.id": format!("/widgets/{}", id),
            "@odata.etag": format!("W/\"{}\"", revision),
            "Id": id.to_string(),
            "Revision": revision,
        })
    }

    pub fn collection(members: &[u32]) -> Value {
        json!({
            "@odata.id": "/widgets",
            "Members@odata.count": members.len(),
            "Members": members
                .iter()
                .map(|id| json!({ "@odata.id": format!("/widgets/{}", id) }))
                .collect::<Vec<_>>(),
        })
    }

    pub fn changed(uri: &str) -> ChangeNotification {
        ChangeNotification::new("ResourceEvent.1.0.ResourceChanged", uri)
    }

    pub fn created(uri: &str) -> ChangeNotification {
        ChangeNotification::new("ResourceEvent.1.0.ResourceCreated", uri)
    }

    pub fn removed(uri: &str) -> ChangeNotification {
        ChangeNotification::new("ResourceEvent.1.0.ResourceRemoved", uri)
    }
}

// ============================================================================
// TESTS
// ============================================================================
