//! Port traits: the seams between the client runtime and its environment.
//!
//! Production adapters live in `skein-client`; mocks live in
//! `skein-test-utils`. Everything here is environment-neutral so the
//! coordination and caching algorithms can run against in-process fakes.

use crate::error::{ClientResult, StorageError};
use crate::event::{TabId, TabMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::Value;

pub use http::{HeaderMap, Method};

// ============================================================================
// HTTP
// ============================================================================

/// An outbound HTTP request. `uri` may be relative to the transport's base URL.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Add a header. Values that are not valid header text are skipped.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_json(mut self, body: &Value) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(body.to_string()));
        self
    }

    pub fn with_body(self, body: Bytes, content_type: &str) -> Self {
        let mut request = self.with_header(CONTENT_TYPE, content_type);
        request.body = Some(body);
        request
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A received HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        let mut response = Self::new(status);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response.body = Bytes::from(body.to_string());
        response
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decode the body as JSON. An empty body decodes to `null`.
    pub fn body_json(&self) -> Result<Value, serde_json::Error> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body)
    }
}

/// Sends HTTP requests.
///
/// Implementations return `Err(ClientError::Network)` only when no response
/// was received; every status code, including failures, is an `Ok` response.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> ClientResult<HttpResponse>;
}

// ============================================================================
// PUSH EVENTS
// ============================================================================

/// Stream of raw push message payloads. Ends when the connection closes.
pub type EventStream = BoxStream<'static, ClientResult<String>>;

/// Opens the server's push-event stream.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self, token: Option<String>) -> ClientResult<EventStream>;
}

// ============================================================================
// CROSS-TAB COORDINATION
// ============================================================================

/// Named broadcast channel shared by every tab of an origin.
///
/// A tab never receives its own broadcasts.
pub trait TabBus: Send + Sync {
    fn broadcast(&self, from: &TabId, message: TabMessage);

    /// Messages from every other tab, starting now.
    fn subscribe(&self, me: &TabId) -> BoxStream<'static, TabMessage>;
}

/// Held advisory lock. Released on drop.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Process-wide advisory locks with "if available" semantics.
pub trait AdvisoryLocks: Send + Sync {
    /// Acquire `name` without waiting. `None` when another holder has it.
    fn try_acquire(&self, name: &str) -> Option<LockGuard>;
}

// ============================================================================
// STORAGE
// ============================================================================

/// String key/value storage (per-tab session storage, or shared storage).
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::ETAG;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_empty_body_decodes_to_null() {
        let response = HttpResponse::new(204);
        assert_eq!(response.body_json().unwrap(), Value::Null);
    }

    #[test]
    fn test_json_response() {
        let response = HttpResponse::json(200, &json!({ "a": 1 })).with_header(ETAG, "\"v1\"");
        assert!(response.is_success());
        assert_eq!(response.header("etag"), Some("\"v1\""));
        assert_eq!(response.body_json().unwrap(), json!({ "a": 1 }));
    }

    #[test]
    fn test_request_with_json_sets_content_type() {
        let request = HttpRequest::new(Method::POST, "/widgets").with_json(&json!({ "n": 1 }));
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.body.as_deref(), Some(br#"{"n":1}"#.as_slice()));
    }

    #[test]
    fn test_lock_guard_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let guard = LockGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        guard.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&count);
        drop(LockGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
