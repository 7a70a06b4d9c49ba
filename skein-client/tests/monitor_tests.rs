//! Monitors: initial delivery, change notification, polling.

use skein_client::{MemoryStorage, PollMode, PollReason};
use skein_core::uri;
use skein_test_utils::fixtures::{collection, fast_config, widget};
use std::sync::Arc;
use std::time::Duration;

#[path = "support/harness.rs"]
mod harness;
use harness::{eventually, login, owner, tab, until_push_healthy, Browser, Recorder};

#[tokio::test]
async fn test_monitor_reads_only_uncached_uris() {
    let tab = owner().await;
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 1));
    tab.transport.on_get_json("/widgets/2", 200, widget(2, 1));
    tab.client.get("/widgets/1", false).await.unwrap();

    let recorder = Recorder::default();
    let _monitor = tab.client.create_monitor(
        vec!["/widgets/1".to_string(), "/widgets/2".to_string()],
        recorder.callback(),
        PollMode::Never,
    );

    eventually("a complete bundle", || {
        recorder.last().is_some_and(|bundle| bundle.is_complete())
    })
    .await;
    let bundle = recorder.last().unwrap();
    assert_eq!(bundle.get("/widgets/1"), Some(&widget(1, 1)));
    assert_eq!(bundle.get("/widgets/2"), Some(&widget(2, 1)));
    assert_eq!(tab.transport.gets("/widgets/1"), 1);
    assert_eq!(tab.transport.gets("/widgets/2"), 1);
}

#[tokio::test]
async fn test_fully_cached_monitor_delivers_after_yield() {
    let tab = owner().await;
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 1));
    tab.client.get("/widgets/1", false).await.unwrap();

    let recorder = Recorder::default();
    let _monitor = tab.client.create_monitor(
        vec!["/widgets/1".to_string()],
        recorder.callback(),
        PollMode::Never,
    );
    assert_eq!(recorder.count(), 0);

    eventually("the initial bundle", || recorder.count() == 1).await;
    assert_eq!(tab.transport.gets("/widgets/1"), 1);
}

#[tokio::test]
async fn test_removed_monitor_is_not_called() {
    let tab = owner().await;
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 1));
    let recorder = Recorder::default();
    let monitor = tab.client.create_monitor(
        vec!["/widgets/1".to_string()],
        recorder.callback(),
        PollMode::Never,
    );
    eventually("the initial bundle", || recorder.count() == 1).await;

    tab.client.rm_monitor(&monitor);
    tab.client.rm_monitor(&monitor);
    tab.client.cache().put("/widgets/1", widget(1, 2), None);

    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn test_cache_changes_reach_monitor_in_one_bundle() {
    let tab = owner().await;
    tab.transport.on_get_json("/widgets", 200, collection(&[1]));
    let recorder = Recorder::default();
    let _monitor = tab.client.create_monitor(
        vec!["/widgets".to_string()],
        recorder.callback(),
        PollMode::Never,
    );
    eventually("the initial bundle", || recorder.count() == 1).await;

    tab.client.cache().put("/widgets", collection(&[1, 2]), None);
    assert_eq!(recorder.count(), 2);
    assert_eq!(
        recorder.last().unwrap().get("/widgets"),
        Some(&collection(&[1, 2]))
    );
}

#[tokio::test]
async fn test_delete_nulls_plain_and_expanded_keys() {
    let tab = owner().await;
    let expanded = uri::expanded("/widgets/1");
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 1));
    tab.transport.on_get_json(&expanded, 200, widget(1, 1));
    tab.transport.on(
        http::Method::DELETE,
        "/widgets/1",
        skein_core::HttpResponse::new(204),
    );

    let recorder = Recorder::default();
    let _monitor = tab.client.create_monitor(
        vec!["/widgets/1".to_string(), expanded.clone()],
        recorder.callback(),
        PollMode::Never,
    );
    eventually("a complete bundle", || {
        recorder.last().is_some_and(|bundle| bundle.is_complete())
    })
    .await;

    tab.client.delete("/widgets/1").await.unwrap();

    let bundle = recorder.last().unwrap();
    assert_eq!(bundle.get("/widgets/1"), None);
    assert_eq!(bundle.get(&expanded), None);
    assert!(bundle.contains("/widgets/1") && bundle.contains(&expanded));
}

#[tokio::test]
async fn test_monitor_rereads_cached_uri_while_push_is_down() {
    let tab = tab();
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 1));
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 2));
    tab.client.get("/widgets/1", false).await.unwrap();
    assert!(!tab.client.is_push_healthy());

    let recorder = Recorder::default();
    let _monitor = tab.client.create_monitor(
        vec!["/widgets/1".to_string()],
        recorder.callback(),
        PollMode::Never,
    );

    eventually("the refreshed body", || {
        recorder
            .last()
            .is_some_and(|bundle| bundle.get("/widgets/1") == Some(&widget(1, 2)))
    })
    .await;
    assert_eq!(tab.transport.gets("/widgets/1"), 2);
}

#[tokio::test]
async fn test_zero_interval_monitor_polls_at_default() {
    let mut config = fast_config();
    config.default_poll_interval_ms = 30;
    let tab = Browser::new().tab_with(config, Arc::new(MemoryStorage::new()));
    login(&tab).await;
    until_push_healthy(&tab.client).await;
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 1));
    let monitor = tab.client.create_monitor(
        vec!["/widgets/1".to_string()],
        |_| {},
        PollMode::Every(Duration::ZERO),
    );
    assert_eq!(tab.client.poll_reason(&monitor), Some(PollReason::Forced));

    eventually("polled reads", || tab.transport.gets("/widgets/1") >= 3).await;
    tab.client.rm_monitor(&monitor);
}

#[tokio::test]
async fn test_monitor_polls_while_push_is_down() {
    let tab = tab();
    let monitor = tab.client.create_monitor(
        vec!["/widgets/1".to_string()],
        |_| {},
        PollMode::Never,
    );
    assert!(tab.client.is_polling(&monitor));
    assert_eq!(tab.client.poll_reason(&monitor), Some(PollReason::PushFallback));

    login(&tab).await;
    until_push_healthy(&tab.client).await;
    eventually("fallback polling to stop", || !tab.client.is_polling(&monitor)).await;
}

#[tokio::test]
async fn test_monitor_without_poll_mode_is_quiet_when_push_healthy() {
    let tab = owner().await;
    let monitor = tab.client.create_monitor(
        vec!["/widgets/1".to_string()],
        |_| {},
        PollMode::Never,
    );
    assert!(!tab.client.is_polling(&monitor));
}

#[tokio::test]
async fn test_forced_poll_keeps_reading() {
    let tab = owner().await;
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 1));
    let monitor = tab.client.create_monitor(
        vec!["/widgets/1".to_string()],
        |_| {},
        PollMode::Every(Duration::from_millis(30)),
    );
    assert_eq!(tab.client.poll_reason(&monitor), Some(PollReason::Forced));

    eventually("three polled reads", || tab.transport.gets("/widgets/1") >= 3).await;
    tab.client.rm_monitor(&monitor);
    assert!(!tab.client.is_polling(&monitor));
}

#[tokio::test]
async fn test_update_monitor_keeps_poll_mode() {
    let tab = owner().await;
    let old = tab.client.create_monitor(
        vec!["/widgets/1".to_string()],
        |_| {},
        PollMode::Every(Duration::from_secs(60)),
    );

    let new = tab
        .client
        .update_monitor(&old, vec!["/widgets/2".to_string()], |_| {});

    assert!(!tab.client.is_polling(&old));
    assert!(tab.client.is_polling(&new));
    assert_eq!(new.poll(), old.poll());
    assert_eq!(new.uris(), &["/widgets/2".to_string()][..]);
}
