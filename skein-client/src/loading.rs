//! De-duplication of in-flight reads.
//!
//! At most one pending read exists per URI. Later callers join the shared
//! future of the first one and settle with the same outcome.

use crate::lock;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use skein_core::ClientResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

/// Shared handle on one outbound read.
pub type PendingRead = Shared<BoxFuture<'static, ClientResult<Value>>>;

struct Pending {
    generation: u64,
    read: PendingRead,
}

/// URI-keyed registry of in-flight reads.
pub struct LoadingRegistry {
    pending: Mutex<HashMap<String, Pending>>,
    next_generation: AtomicU64,
    in_flight: watch::Sender<usize>,
}

impl LoadingRegistry {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            pending: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            in_flight,
        }
    }

    /// Join the pending read for `uri`, or register a new one built by `start`.
    ///
    /// `start` receives the generation it must later pass to [`settle`](Self::settle).
    /// It runs under the registry lock and must not block.
    pub fn join_or_start<F>(&self, uri: &str, start: F) -> PendingRead
    where
        F: FnOnce(u64) -> BoxFuture<'static, ClientResult<Value>>,
    {
        let mut pending = lock(&self.pending);
        if let Some(existing) = pending.get(uri) {
            tracing::trace!(uri, "Joining pending read");
            return existing.read.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let read = start(generation).shared();
        pending.insert(
            uri.to_string(),
            Pending {
                generation,
                read: read.clone(),
            },
        );
        self.in_flight.send_replace(pending.len());
        read
    }

    /// Forget the pending read for `uri` if it is still `generation`.
    ///
    /// A newer read registered after a `clear` is left alone.
    pub fn settle(&self, uri: &str, generation: u64) {
        let mut pending = lock(&self.pending);
        if pending.get(uri).map(|p| p.generation) == Some(generation) {
            pending.remove(uri);
            self.in_flight.send_replace(pending.len());
        }
    }

    /// Forget every pending read. Reads already running still settle their callers.
    pub fn clear(&self) {
        let mut pending = lock(&self.pending);
        pending.clear();
        self.in_flight.send_replace(0);
    }

    pub fn is_pending(&self, uri: &str) -> bool {
        lock(&self.pending).contains_key(uri)
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once no reads are pending.
    pub async fn wait_drained(&self) {
        let mut in_flight = self.in_flight.subscribe();
        // The sender lives as long as `self`, so this cannot fail while borrowed.
        let _ = in_flight.wait_for(|count| *count == 0).await;
    }
}

impl Default for LoadingRegistry {
    fn default() -> Self {
        Self::new()
    }
}
