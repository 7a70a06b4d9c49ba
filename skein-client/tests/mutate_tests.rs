//! Writes: refresh after success, task responses, uploads.

use bytes::Bytes;
use serde_json::json;
use skein_client::ClientError;
use skein_core::HttpResponse;
use skein_test_utils::fixtures::widget;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[path = "support/harness.rs"]
mod harness;
use harness::{eventually, owner};

fn accepted(task: &str) -> HttpResponse {
    HttpResponse::json(202, &json!({ "@odata.id": task }))
        .with_header(http::header::LOCATION, task)
}

#[tokio::test]
async fn test_patch_rereads_cached_target() {
    let tab = owner().await;
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 1));
    tab.transport.on_get_json("/widgets/1", 200, widget(1, 2));
    tab.transport
        .on(http::Method::PATCH, "/widgets/1", HttpResponse::new(204));
    tab.client.get("/widgets/1", false).await.unwrap();

    let response = tab
        .client
        .patch("/widgets/1", &json!({"Name": "renamed"}))
        .await
        .unwrap();

    assert_eq!(response.status, 204);
    assert_eq!(tab.transport.gets("/widgets/1"), 2);
    assert_eq!(tab.client.cache().body("/widgets/1"), Some(widget(1, 2)));
}

#[tokio::test]
async fn test_post_to_uncached_uri_makes_no_read() {
    let tab = owner().await;
    tab.transport
        .on(http::Method::POST, "/widgets", HttpResponse::json(201, &widget(3, 1)));

    let response = tab.client.post("/widgets", &json!({"Name": "new"})).await.unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.body, widget(3, 1));
    assert_eq!(tab.transport.gets("/widgets"), 0);
}

#[tokio::test]
async fn test_accepted_mutation_returns_task() {
    let tab = owner().await;
    tab.transport.on(
        http::Method::POST,
        "/Systems/1/Actions/Reset",
        accepted("/TaskService/Tasks/4"),
    );

    let response = tab
        .client
        .post("/Systems/1/Actions/Reset", &json!({"ResetType": "On"}))
        .await
        .unwrap();

    assert!(response.is_accepted());
    assert_eq!(response.task(), Some("/TaskService/Tasks/4"));
}

#[tokio::test]
async fn test_rejected_mutation_is_http_error() {
    let tab = owner().await;
    tab.transport
        .on(http::Method::PUT, "/widgets/1", HttpResponse::new(409));

    let err = tab.client.put("/widgets/1", &json!({})).await.unwrap_err();
    assert_eq!(err, ClientError::Http { status: 409 });
    assert!(tab.client.session().is_some());
}

#[tokio::test]
async fn test_unauthorized_mutation_expires_session() {
    let tab = owner().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    tab.client.set_on_session_expired(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    tab.transport
        .on(http::Method::DELETE, "/widgets/1", HttpResponse::new(401));

    let err = tab.client.delete("/widgets/1").await.unwrap_err();

    assert_eq!(err, ClientError::AuthExpired);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(tab.client.session().is_none());
}

#[tokio::test]
async fn test_delete_many_returns_the_single_task() {
    let tab = owner().await;
    tab.transport
        .on(http::Method::DELETE, "/widgets/1", HttpResponse::new(204));
    tab.transport
        .on(http::Method::DELETE, "/widgets/2", accepted("/TaskService/Tasks/9"));

    let task = tab
        .client
        .delete_many(&["/widgets/1".to_string(), "/widgets/2".to_string()])
        .await
        .unwrap();

    assert_eq!(task.and_then(|t| t.location), Some("/TaskService/Tasks/9".to_string()));
}

#[tokio::test]
async fn test_delete_many_with_two_tasks_is_unsupported() {
    let tab = owner().await;
    for id in 1..=2 {
        tab.transport.on(
            http::Method::DELETE,
            &format!("/widgets/{}", id),
            accepted(&format!("/TaskService/Tasks/{}", id)),
        );
    }

    let err = tab
        .client
        .delete_many(&["/widgets/1".to_string(), "/widgets/2".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::NotImplemented(_)));
}

#[tokio::test]
async fn test_delete_many_without_tasks() {
    let tab = owner().await;
    tab.transport
        .on(http::Method::DELETE, "/widgets/1", HttpResponse::new(204));

    let task = tab
        .client
        .delete_many(&["/widgets/1".to_string()])
        .await
        .unwrap();
    assert!(task.is_none());
}

#[tokio::test]
async fn test_upload_sends_bytes() {
    let tab = owner().await;
    tab.transport.on(
        http::Method::POST,
        "/UpdateService/upload",
        accepted("/TaskService/Tasks/2"),
    );

    let handle = tab.client.upload(
        "/UpdateService/upload",
        Bytes::from_static(b"\x7fELF firmware"),
        "application/octet-stream",
    );
    let response = handle.finish().await.unwrap();

    assert_eq!(response.task(), Some("/TaskService/Tasks/2"));
    let request = tab.transport.last_request().unwrap();
    assert_eq!(request.body, Some(Bytes::from_static(b"\x7fELF firmware")));
    assert_eq!(request.header("content-type"), Some("application/octet-stream"));
}

#[tokio::test]
async fn test_aborted_upload_reports_aborted() {
    let tab = owner().await;
    tab.transport.hold();

    let handle = tab.client.upload(
        "/UpdateService/upload",
        Bytes::from_static(b"image"),
        "application/octet-stream",
    );
    eventually("the upload to start", || tab.transport.in_flight() == 1).await;
    handle.abort();

    assert_eq!(handle.finish().await, Err(ClientError::Aborted));
    tab.transport.release();
}
