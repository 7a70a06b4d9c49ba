//! SKEIN Client - Resource Cache and Push Runtime
//!
//! A client for resource APIs that addresses every resource by URI:
//! - one cached JSON body per URI, with validators for conditional reads
//! - at most one read in flight per URI, and a cap on reads overall
//! - monitors that receive bundles whenever their URIs change
//! - a push event stream owned by one tab, relayed to the others, with
//!   polling as the fallback while push is unavailable
//! - session lifecycle with one-shot expiry handling

pub mod cache;
pub mod client;
pub mod executor;
pub mod limiter;
pub mod loading;
pub mod monitor;
pub mod mutate;
pub mod poll;
pub mod push;
pub mod session;
pub mod sse;
pub mod storage;
pub mod tabs;
pub mod telemetry;
pub mod transport;

pub use cache::{ChangeListener, ResourceCache};
pub use client::{Client, ClientBuilder};
pub use executor::{EnvelopeAdapter, IdentityAdapter, ReadOutcome, RequestExecutor, ResponseAdapter};
pub use limiter::ConcurrencyLimiter;
pub use loading::LoadingRegistry;
pub use monitor::{Monitor, MonitorCallback, MonitorRegistry, PollMode};
pub use mutate::{MutationResponse, UploadHandle};
pub use poll::{PollReason, PollScheduler};
pub use push::EventCallback;
pub use session::{SessionCallback, SessionStore};
pub use sse::{SseDecoder, SseEventSource};
pub use storage::{FileStorage, MemoryStorage};
pub use tabs::{ElectionConfig, LocalTabHub, TabCoordinator, TabPorts, TabRole};
pub use telemetry::init_tracing;
pub use transport::ReqwestTransport;

pub use skein_core::{Bundle, ChangeNotification, ClientConfig, ClientError, ClientResult, EventBatch, TabId};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
