//! Push ownership across tabs sharing one hub.

use skein_client::{PollMode, PollReason, TabRole};
use skein_core::{KeyValueStorage, PUSH_OWNER_KEY};
use std::time::Duration;

#[path = "support/harness.rs"]
mod harness;
use harness::{eventually, login, until_push_healthy, Browser, Tab};

async fn role_matches(tab: &Tab, what: &str, predicate: impl FnMut(&TabRole) -> bool) {
    let mut role = tab.client.subscribe_role();
    let reached = tokio::time::timeout(Duration::from_secs(5), role.wait_for(predicate)).await;
    assert!(matches!(reached, Ok(Ok(_))), "timed out waiting for {}", what);
}

#[tokio::test]
async fn test_lone_tab_takes_ownership() {
    let browser = Browser::new();
    let tab = browser.tab();
    login(&tab).await;

    role_matches(&tab, "ownership", TabRole::is_owner).await;
    until_push_healthy(&tab.client).await;
    assert_eq!(tab.events.connect_count(), 1);
    assert_eq!(tab.events.tokens(), vec![Some("tok-1".to_string())]);
}

#[tokio::test]
async fn test_later_tabs_defer_to_owner() {
    let browser = Browser::new();
    let first = browser.tab();
    login(&first).await;
    role_matches(&first, "ownership", TabRole::is_owner).await;
    until_push_healthy(&first.client).await;

    let second = browser.tab();
    let third = browser.tab();
    login(&second).await;
    login(&third).await;

    let owner_id = first.client.tab_id().clone();
    for tab in [&second, &third] {
        role_matches(tab, "deferral", |role| role.owner() == Some(&owner_id)).await;
        until_push_healthy(&tab.client).await;
        assert_eq!(tab.events.connect_count(), 0);
    }
    assert_eq!(first.events.connect_count(), 1);
}

#[tokio::test]
async fn test_simultaneous_logins_elect_one_owner() {
    let browser = Browser::new();
    let tabs: Vec<Tab> = (0..3).map(|_| browser.tab()).collect();
    futures_util::future::join_all(tabs.iter().map(login)).await;

    eventually("one owner and two followers", || {
        let owners = tabs.iter().filter(|t| t.client.role().is_owner()).count();
        let deferring = tabs
            .iter()
            .filter(|t| matches!(t.client.role(), TabRole::DeferringToOwner(_)))
            .count();
        owners == 1 && deferring == 2
    })
    .await;
    for tab in &tabs {
        until_push_healthy(&tab.client).await;
    }
    let connects: usize = tabs.iter().map(|t| t.events.connect_count()).sum();
    assert_eq!(connects, 1);
}

#[tokio::test]
async fn test_shutdown_hands_ownership_over() {
    let browser = Browser::new();
    let first = browser.tab();
    login(&first).await;
    role_matches(&first, "ownership", TabRole::is_owner).await;
    let second = browser.tab();
    login(&second).await;
    role_matches(&second, "deferral", |role| role.owner().is_some()).await;

    first.client.shutdown().await;

    role_matches(&second, "takeover", TabRole::is_owner).await;
    until_push_healthy(&second.client).await;
    assert_eq!(
        browser.shared.get(PUSH_OWNER_KEY),
        Some(second.client.tab_id().to_string())
    );
    assert!(!first.client.is_push_healthy());
}

#[tokio::test]
async fn test_logout_gives_up_ownership() {
    let browser = Browser::new();
    let first = browser.tab();
    login(&first).await;
    role_matches(&first, "ownership", TabRole::is_owner).await;
    let second = browser.tab();
    login(&second).await;
    role_matches(&second, "deferral", |role| role.owner().is_some()).await;

    first.client.logout().await;

    role_matches(&first, "release", |role| *role == TabRole::Unowned).await;
    role_matches(&second, "takeover", TabRole::is_owner).await;
    assert!(browser.shared.get(PUSH_OWNER_KEY).is_some());
}

#[tokio::test]
async fn test_dropped_owner_is_replaced() {
    let browser = Browser::new();
    let first = browser.tab();
    login(&first).await;
    role_matches(&first, "ownership", TabRole::is_owner).await;
    let second = browser.tab();
    login(&second).await;
    role_matches(&second, "deferral", |role| role.owner().is_some()).await;

    drop(first);

    role_matches(&second, "takeover", TabRole::is_owner).await;
}

#[tokio::test]
async fn test_follower_polls_while_owner_stream_is_down() {
    let browser = Browser::new();
    let owner = browser.tab();
    login(&owner).await;
    role_matches(&owner, "ownership", TabRole::is_owner).await;
    until_push_healthy(&owner.client).await;
    let follower = browser.tab();
    login(&follower).await;
    role_matches(&follower, "deferral", |role| role.owner().is_some()).await;
    until_push_healthy(&follower.client).await;

    owner.events.set_refuse(true);
    owner.events.break_stream("connection reset");

    eventually("follower to notice the outage", || !follower.client.is_push_healthy()).await;
    assert!(matches!(follower.client.role(), TabRole::DeferringToOwner(_)));
    let monitor = follower
        .client
        .create_monitor(vec!["/widgets/1".to_string()], |_| {}, PollMode::Never);
    assert!(follower.client.is_polling(&monitor));
    assert_eq!(follower.client.poll_reason(&monitor), Some(PollReason::PushFallback));

    owner.events.set_refuse(false);
    until_push_healthy(&follower.client).await;
    eventually("fallback poll to stop", || !follower.client.is_polling(&monitor)).await;
    assert_eq!(follower.events.connect_count(), 0);
}
