//! Clients wired to scripted ports.

#![allow(dead_code)]

use serde_json::Value;
use skein_client::{Client, LocalTabHub, MemoryStorage};
use skein_core::{Bundle, ClientConfig, KeyValueStorage};
use skein_test_utils::fixtures::{self, fast_config};
use skein_test_utils::{MockTransport, ScriptedEventSource};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

pub struct Tab {
    pub client: Client,
    pub transport: Arc<MockTransport>,
    pub events: Arc<ScriptedEventSource>,
}

/// Tabs sharing one hub, one marker store and one server.
pub struct Browser {
    pub hub: LocalTabHub,
    pub shared: Arc<MemoryStorage>,
    pub transport: Arc<MockTransport>,
}

impl Browser {
    /// Server that accepts every login with token `tok-1`.
    pub fn new() -> Self {
        let browser = Self::bare();
        browser.transport.on(
            http::Method::POST,
            "/login",
            fixtures::login_response("tok-1", "admin"),
        );
        browser
    }

    /// Server with nothing scripted.
    pub fn bare() -> Self {
        Self {
            hub: LocalTabHub::new(),
            shared: Arc::new(MemoryStorage::new()),
            transport: Arc::new(MockTransport::new()),
        }
    }

    pub fn tab(&self) -> Tab {
        self.tab_with(fast_config(), Arc::new(MemoryStorage::new()))
    }

    pub fn tab_with(&self, config: ClientConfig, session: Arc<dyn KeyValueStorage>) -> Tab {
        let events = Arc::new(ScriptedEventSource::new());
        let client = Client::builder(config)
            .transport(self.transport.clone())
            .event_source(events.clone())
            .hub(&self.hub)
            .shared_storage(self.shared.clone())
            .session_storage(session)
            .build()
            .expect("client builds");
        Tab {
            client,
            transport: self.transport.clone(),
            events,
        }
    }
}

/// One tab on its own.
pub fn tab() -> Tab {
    Browser::new().tab()
}

/// Log in and wait until the tab is the healthy push owner.
pub async fn owner() -> Tab {
    let tab = tab();
    login(&tab).await;
    until_push_healthy(&tab.client).await;
    tab
}

pub async fn login(tab: &Tab) {
    let outcome = tab.client.login("admin", "secret").await.expect("login");
    assert!(outcome.is_success(), "login rejected: {:?}", outcome);
}

pub async fn until_push_healthy(client: &Client) {
    let mut health = client.subscribe_push_health();
    timeout(Duration::from_secs(5), health.wait_for(|healthy| *healthy))
        .await
        .expect("push became healthy")
        .expect("client alive");
}

/// Wait for `condition`, checking every few milliseconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Records every bundle a monitor receives.
#[derive(Clone, Default)]
pub struct Recorder {
    bundles: Arc<Mutex<Vec<Bundle>>>,
}

impl Recorder {
    pub fn callback(&self) -> impl Fn(&Bundle) + Send + Sync + 'static {
        let bundles = Arc::clone(&self.bundles);
        move |bundle: &Bundle| bundles.lock().unwrap().push(bundle.clone())
    }

    pub fn count(&self) -> usize {
        self.bundles.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Bundle> {
        self.bundles.lock().unwrap().last().cloned()
    }

    pub fn last_value(&self) -> Option<Value> {
        self.last().map(|bundle| bundle.to_value())
    }
}
