//! Collector endpoint tests: upload, long-poll watch and session reads.
//!
//! These run the real router in-process through `axum_test::TestServer`.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::{fixtures, mocks::FailingBlobStore, setup::TestContext};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn server(ctx: &TestContext) -> TestServer {
    TestServer::new(ctx.router.clone()).expect("Failed to create test server")
}

#[tokio::test]
async fn test_upload_returns_counts() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    let response = server
        .post("/upload")
        .json(&fixtures::upload_body("s-counts", fixtures::attributes(2)))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["ok"], true);
    assert_eq!(body["count"], 2);
    // key plus type, id and sessionId for each attribute
    assert_eq!(body["attrCount"], 8);
}

#[tokio::test]
async fn test_upload_without_payload_is_rejected() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    let response = server
        .post("/upload")
        .json(&json!({"sessionId": "s1"}))
        .expect_failure()
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "NO_PAYLOAD");

    let response = server
        .post("/upload")
        .json(&json!({"sessionId": "s1", "payload": {"key": "k"}}))
        .expect_failure()
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_defaults_session_and_skips_non_objects() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    let response = server
        .post("/upload")
        .json(&json!({"payload": [1, "two", {"type": "ctx", "id": "d", "key": "k", "value": 3}]}))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["count"], 1);

    let session: Value = server.get("/sessions/defSession").await.json();
    assert_eq!(session["sessionId"], "defSession");
    assert_eq!(session["attributes"]["ctx"]["d"]["k"], 3);
}

#[tokio::test]
async fn test_upload_query_overrides_body_session() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    server
        .post("/upload?sessionId=from-query")
        .json(&fixtures::upload_body("from-body", fixtures::attributes(1)))
        .await
        .assert_status_ok();

    server.get("/sessions/from-query").await.assert_status_ok();
    server
        .get("/sessions/from-body")
        .expect_failure()
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_accumulates_last_write_wins() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    for value in [80, 75] {
        server
            .post("/api/v1/attrstream/upload")
            .json(&json!({
                "sessionId": "s-lww",
                "clientId": "relay-7",
                "payload": [fixtures::attribute("ctx", "dev-1", "battery", json!(value))],
            }))
            .await
            .assert_status_ok();
    }

    let response = server.get("/api/v1/attrstream/sessions/s-lww").await;
    response.assert_status_ok();
    let session: Value = response.json();
    assert_eq!(session["clientId"], "relay-7");
    assert_eq!(session["uploadCount"], 2);
    assert_eq!(session["attributes"]["ctx"]["dev-1"]["battery"], 75);
}

#[tokio::test]
async fn test_upload_persists_merged_request() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    server
        .post("/upload?projectId=sa")
        .json(&fixtures::upload_body("s-blob", fixtures::attributes(1)))
        .await
        .assert_status_ok();

    let blobs = ctx.store.blobs("s-blob").await;
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0]["projectId"], "sa");
    assert_eq!(blobs[0]["sessionId"], "s-blob");
    assert_eq!(blobs[0]["payload"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_store_failure_is_500() {
    let ctx = TestContext::with_store(Arc::new(FailingBlobStore));
    let server = server(&ctx);

    let response = server
        .post("/upload")
        .json(&fixtures::upload_body("s-fail", fixtures::attributes(1)))
        .expect_failure()
        .await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.json::<Value>()["code"], "STORE_001");

    server
        .get("/sessions/s-fail")
        .expect_failure()
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_watch_receives_uploaded_attributes() {
    let ctx = TestContext::new();
    let server = server(&ctx);
    ctx.fanout().subscribe("w1");

    server
        .post("/upload")
        .json(&fixtures::upload_body("s-watch", fixtures::attributes(3)))
        .await
        .assert_status_ok();

    let response = server.get("/watch?watch-id=w1").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["ok"], true);

    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|item| item["sessionId"] == "s-watch"));
    assert_eq!(items[0]["key"], "k0");
    assert_eq!(items[2]["key"], "k2");

    // Drained by the first response.
    let again: Value = server.get("/watch?watch-id=w1").await.json();
    assert_eq!(again["items"], json!([]));
}

#[tokio::test]
async fn test_watch_waits_for_publish() {
    let ctx = TestContext::with_config(api::ApiConfig {
        watch_max_wait_ms: 5_000,
        ..integration_tests::setup::test_api_config()
    });
    let server = server(&ctx);

    let (watch, _) = tokio::join!(async { server.get("/watch?id=live").await }, async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        server
            .post("/upload")
            .json(&fixtures::upload_body("s-live", fixtures::attributes(1)))
            .await
    });

    let body: Value = watch.json();
    assert_eq!(body["items"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_watch_times_out_empty() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    let started = std::time::Instant::now();
    let body: Value = server.get("/watch?id=quiet").await.json();

    assert_eq!(body, json!({"ok": true, "items": []}));
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_each_watcher_gets_a_copy() {
    let ctx = TestContext::new();
    let server = server(&ctx);
    ctx.fanout().subscribe("a");
    ctx.fanout().subscribe("b");

    server
        .post("/upload")
        .json(&fixtures::upload_body("s-copies", fixtures::attributes(2)))
        .await
        .assert_status_ok();

    let a: Value = server.get("/watch?id=a").await.json();
    let b: Value = server
        .post("/api/v1/attrstream/watch")
        .json(&json!({"watch-id": "b", "session-id": "ignored"}))
        .await
        .json();

    assert_eq!(a["items"].as_array().map(Vec::len), Some(2));
    assert_eq!(a["items"], b["items"]);
}

#[tokio::test]
async fn test_default_watch_id() {
    let ctx = TestContext::new();
    let server = server(&ctx);
    ctx.fanout().subscribe("defId");

    server
        .post("/upload")
        .json(&fixtures::upload_body("s-def", fixtures::attributes(1)))
        .await
        .assert_status_ok();

    let body: Value = server.get("/watch").await.json();
    assert_eq!(body["items"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_unknown_paths_are_404() {
    let ctx = TestContext::new();
    let server = server(&ctx);

    let response = server.get("/does/not/exist").expect_failure().await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["code"], "ROUTE_404");

    let response = server.get("/sessions/never-seen").expect_failure().await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["code"], "SESSION_404");
}
