//! SKEIN Core - Data Types and Ports
//!
//! Pure data structures, the error taxonomy, configuration and the port
//! traits the client runtime is written against. No I/O happens here.

pub mod config;
pub mod error;
pub mod event;
pub mod ports;
pub mod resource;
pub mod session;
pub mod uri;

pub use config::{ClientConfig, LogConfig, ReconnectConfig};
pub use error::{ClientError, ClientResult, ConfigError, StorageError};
pub use event::{ChangeKind, ChangeNotification, EventBatch, ResourceLink, TabId, TabMessage};
pub use ports::{
    AdvisoryLocks, EventSource, EventStream, HttpRequest, HttpResponse, HttpTransport,
    KeyValueStorage, LockGuard, TabBus,
};
pub use resource::{embedded_validator, Bundle, CacheEntry, VALIDATOR_FIELD};
pub use session::{LoginOutcome, LoginRequest, Session, UserInfo};

/// Identifier of a monitor, unique for the lifetime of one client.
pub type MonitorId = u64;

/// Shared key holding the tab id of the current push owner.
pub const PUSH_OWNER_KEY: &str = "push-owner";
