//! Push-event and inter-tab message types.
//!
//! The push stream delivers `{ "Events": [...] }` batches. The owner tab
//! relays each batch verbatim over the tab bus, next to the election
//! messages defined in [`TabMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// TAB IDENTITY
// ============================================================================

/// Identity of one tab (client instance). Compared during leader election.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(String);

impl TabId {
    /// Generate a fresh, process-lifetime unique identity (UUIDv7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TabId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// PUSH EVENTS
// ============================================================================

/// Link to the resource a notification is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLink {
    #[serde(rename = "@odata.id")]
    pub id: String,
}

/// What happened to the origin resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Changed,
    Removed,
}

/// One entry of a pushed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "MessageId", default)]
    pub message_id: String,
    #[serde(rename = "OriginOfCondition")]
    pub origin: ResourceLink,
    /// Full new representation, when the server includes it.
    #[serde(rename = "Body", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChangeNotification {
    /// Notification about `uri` with the given message id and no body.
    pub fn new(message_id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            origin: ResourceLink { id: uri.into() },
            body: None,
            extra: Map::new(),
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn uri(&self) -> &str {
        &self.origin.id
    }

    /// Classify by message id suffix (`...ResourceRemoved`, `...ResourceCreated`).
    pub fn kind(&self) -> ChangeKind {
        if self.message_id.contains("ResourceRemoved") {
            ChangeKind::Removed
        } else if self.message_id.contains("ResourceCreated") {
            ChangeKind::Created
        } else {
            ChangeKind::Changed
        }
    }
}

/// A pushed batch of change notifications.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(rename = "Events", default)]
    pub events: Vec<ChangeNotification>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventBatch {
    pub fn new(events: Vec<ChangeNotification>) -> Self {
        Self {
            events,
            extra: Map::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ============================================================================
// TAB BUS MESSAGES
// ============================================================================

/// Messages exchanged between tabs.
///
/// Wire form: `{ "lookingForSseOwner": true, "id" }`, `{ "iOwnSse": true, "id" }`,
/// `{ "out": true, "id" }`, `{ "sseHealthy": bool, "id" }`, or a raw
/// [`EventBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TabMessage {
    LookingForOwner {
        #[serde(rename = "lookingForSseOwner")]
        looking_for_owner: bool,
        id: TabId,
    },
    IOwn {
        #[serde(rename = "iOwnSse")]
        i_own: bool,
        id: TabId,
    },
    Out {
        out: bool,
        id: TabId,
    },
    /// The owner's push connection went up or down.
    PushHealth {
        #[serde(rename = "sseHealthy")]
        healthy: bool,
        id: TabId,
    },
    Events(EventBatch),
}

impl TabMessage {
    pub fn looking_for_owner(id: TabId) -> Self {
        Self::LookingForOwner {
            looking_for_owner: true,
            id,
        }
    }

    pub fn i_own(id: TabId) -> Self {
        Self::IOwn { i_own: true, id }
    }

    pub fn out(id: TabId) -> Self {
        Self::Out { out: true, id }
    }

    pub fn push_health(id: TabId, healthy: bool) -> Self {
        Self::PushHealth { healthy, id }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LookingForOwner { .. } => "looking_for_owner",
            Self::IOwn { .. } => "i_own",
            Self::Out { .. } => "out",
            Self::PushHealth { .. } => "push_health",
            Self::Events(_) => "events",
        }
    }
}
