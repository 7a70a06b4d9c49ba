//! Outbound request construction and response classification.
//!
//! The executor knows nothing about the cache or the session; it builds the
//! request, sends it through the transport and classifies the answer. The
//! client applies the side effects of each [`ReadOutcome`].

use bytes::Bytes;
use serde_json::Value;
use skein_core::ports::{HttpRequest, HttpResponse, HttpTransport, Method};
use skein_core::ClientResult;
use std::sync::Arc;

pub(crate) mod headers {
    use http::header::HeaderName;

    pub use http::header::{ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH, LOCATION};

    pub const REQUESTED_WITH: HeaderName = HeaderName::from_static("x-requested-with");
    pub const REQUESTED_WITH_VALUE: &str = "XMLHttpRequest";
    /// Session token header some servers answer a login with.
    pub const AUTH_TOKEN: &str = "x-auth-token";
}

/// Reshapes successful read bodies before they are cached.
pub trait ResponseAdapter: Send + Sync {
    fn adapt(&self, uri: &str, body: Value) -> Value;
}

/// Caches bodies exactly as received.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAdapter;

impl ResponseAdapter for IdentityAdapter {
    fn adapt(&self, _uri: &str, body: Value) -> Value {
        body
    }
}

/// Unwraps `{ "<key>": <body> }` envelopes. Other bodies pass through.
#[derive(Debug, Clone)]
pub struct EnvelopeAdapter {
    key: String,
}

impl EnvelopeAdapter {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl ResponseAdapter for EnvelopeAdapter {
    fn adapt(&self, _uri: &str, body: Value) -> Value {
        match body {
            Value::Object(mut map) if map.contains_key(&self.key) => {
                map.remove(&self.key).unwrap_or(Value::Null)
            }
            other => other,
        }
    }
}

/// Classified result of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// 2xx with a decoded, adapted body.
    Fresh {
        body: Value,
        validator: Option<String>,
    },
    /// 304: the cached representation is still current.
    NotModified,
    /// 404: the resource is gone.
    NotFound,
    /// 401: the session is no longer valid.
    Unauthorized,
    /// Any other non-success status.
    Failed { status: u16 },
}

/// Builds and sends HTTP requests with the client's standard headers.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    adapter: Arc<dyn ResponseAdapter>,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>, adapter: Arc<dyn ResponseAdapter>) -> Self {
        Self { transport, adapter }
    }

    /// Request carrying the headers every call sends.
    pub fn request(&self, method: Method, uri: &str, token: Option<&str>) -> HttpRequest {
        let mut request = HttpRequest::new(method, uri)
            .with_header(headers::REQUESTED_WITH, headers::REQUESTED_WITH_VALUE)
            .with_header(headers::ACCEPT, "application/json");
        if let Some(token) = token {
            request = request.with_header(
                headers::AUTHORIZATION,
                &format!("Bearer {}", token),
            );
        }
        request
    }

    pub fn read_request(
        &self,
        uri: &str,
        token: Option<&str>,
        validator: Option<&str>,
    ) -> HttpRequest {
        let request = self.request(Method::GET, uri, token);
        match validator {
            Some(validator) => request.with_header(headers::IF_NONE_MATCH, validator),
            None => request,
        }
    }

    /// Conditional GET of `uri`.
    ///
    /// `Err` means no usable answer: a transport failure, or a 2xx whose body
    /// is not JSON.
    pub async fn read(
        &self,
        uri: &str,
        token: Option<&str>,
        validator: Option<&str>,
    ) -> ClientResult<ReadOutcome> {
        let request = self.read_request(uri, token, validator);
        let response = self.transport.send(request).await?;
        self.classify(uri, response)
    }

    fn classify(&self, uri: &str, response: HttpResponse) -> ClientResult<ReadOutcome> {
        let outcome = match response.status {
            304 => ReadOutcome::NotModified,
            404 => ReadOutcome::NotFound,
            401 => ReadOutcome::Unauthorized,
            _ if response.is_success() => {
                let validator = response.header(headers::ETAG.as_str()).map(str::to_string);
                let body = self.adapter.adapt(uri, response.body_json()?);
                ReadOutcome::Fresh { body, validator }
            }
            status => ReadOutcome::Failed { status },
        };
        Ok(outcome)
    }

    /// Send a request with a JSON body (or none). The response is returned unclassified.
    pub async fn write(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<&Value>,
    ) -> ClientResult<HttpResponse> {
        let mut request = self.request(method, uri, token);
        if let Some(body) = body {
            request = request.with_json(body);
        }
        self.transport.send(request).await
    }

    /// Send raw bytes. Used for uploads.
    pub async fn write_bytes(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Bytes,
        content_type: &str,
    ) -> ClientResult<HttpResponse> {
        let request = self
            .request(method, uri, token)
            .with_body(body, content_type);
        self.transport.send(request).await
    }
}
