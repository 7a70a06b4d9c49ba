//! Cached resource representations.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::Duration;

/// Body field that carries an embedded cache validator.
pub const VALIDATOR_FIELD: &str = "@odata.etag";

/// One cached resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Cache key. Expanded and plain URIs are distinct keys.
    pub uri: String,
    /// Last body observed for this URI.
    pub body: Value,
    /// Most recent server-supplied validator for exactly this URI.
    pub validator: Option<String>,
    /// When this entry was written.
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(uri: impl Into<String>, body: Value, validator: Option<String>) -> Self {
        Self {
            uri: uri.into(),
            body,
            validator,
            cached_at: Utc::now(),
        }
    }

    /// How long ago this entry was written.
    pub fn staleness(&self) -> Duration {
        let now = Utc::now();
        if now > self.cached_at {
            (now - self.cached_at).to_std().unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        }
    }
}

/// Extract the validator a server embedded in a resource body.
pub fn embedded_validator(body: &Value) -> Option<String> {
    body.get(VALIDATOR_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Snapshot of the current cached value of every URI a monitor watches.
///
/// Entries keep the monitor's URI order. Uncached URIs map to `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bundle {
    entries: Vec<(String, Option<Value>)>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uri: impl Into<String>, body: Option<Value>) {
        let uri = uri.into();
        if let Some(slot) = self.entries.iter_mut().find(|(key, _)| *key == uri) {
            slot.1 = body;
        } else {
            self.entries.push((uri, body));
        }
    }

    /// Current body for `uri`; `None` when the URI is absent or uncached.
    pub fn get(&self, uri: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(key, _)| key == uri)
            .and_then(|(_, body)| body.as_ref())
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries.iter().any(|(key, _)| key == uri)
    }

    /// True when every URI has a cached body.
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|(_, body)| body.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.entries
            .iter()
            .map(|(uri, body)| (uri.as_str(), body.as_ref()))
    }

    /// JSON object form, uncached URIs rendered as `null`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (uri, body) in &self.entries {
            map.insert(uri.clone(), body.clone().unwrap_or(Value::Null));
        }
        Value::Object(map)
    }
}
