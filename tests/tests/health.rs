//! Tests for health and metrics endpoints.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::{fixtures, setup::TestContext};
use serde_json::Value;

/// /health reports every component plus watcher and session counts
#[tokio::test]
async fn test_health_endpoint_structure() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: Value = response.json();
    let status = body["status"].as_str().unwrap_or("");
    assert!(
        status == "healthy" || status == "degraded",
        "Status should be serving, got '{}'",
        status
    );

    let components = body["components"].as_array().expect("components array");
    let names: Vec<&str> = components.iter().filter_map(|c| c["name"].as_str()).collect();
    assert_eq!(names, vec!["upstream", "store"]);
    assert!(body.get("watchers").is_some());
    assert!(body.get("sessions").is_some());
}

/// Readiness follows the store
#[tokio::test]
async fn test_ready_endpoint() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    server.get("/health/ready").await.assert_status(StatusCode::OK);
}

/// Liveness is always OK while serving
#[tokio::test]
async fn test_live_endpoint() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    server.get("/health/live").await.assert_status(StatusCode::OK);
}

/// /metrics counts uploads
#[tokio::test]
async fn test_metrics_endpoint_counts_uploads() {
    let ctx = TestContext::new();
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    server
        .post("/upload")
        .json(&fixtures::upload_body("s-metrics", fixtures::attributes(3)))
        .await
        .assert_status_ok();

    let body: Value = server.get("/metrics").await.json();
    assert!(body["upload_requests"].as_u64().unwrap_or(0) >= 1);
    assert!(body["attributes_received"].as_u64().unwrap_or(0) >= 3);
    assert!(body.get("timestamp").is_some());
}
