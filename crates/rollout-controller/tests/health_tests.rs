//! Health and metrics endpoint integration tests.
//!
//! Tests the public endpoints using the `TestRolloutServer` harness.

use rc_test_utils::TestRolloutServer;

/// Test that health endpoint returns 200 and healthy status.
#[tokio::test]
async fn test_health_endpoint_returns_200() -> Result<(), anyhow::Error> {
    let server = TestRolloutServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", server.url()))
        .send()
        .await?;

    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "healthy");

    Ok(())
}

/// Test that health endpoint returns JSON content type.
#[tokio::test]
async fn test_health_endpoint_returns_json() -> Result<(), anyhow::Error> {
    let server = TestRolloutServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", server.url()))
        .send()
        .await?;

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok());

    assert!(
        content_type.is_some_and(|ct| ct.contains("application/json")),
        "Expected application/json content type, got {:?}",
        content_type
    );

    Ok(())
}

/// Health must not need a webhook key.
#[tokio::test]
async fn test_health_ignores_authorization() -> Result<(), anyhow::Error> {
    let server = TestRolloutServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", server.url()))
        .bearer_auth("not-a-key")
        .send()
        .await?;

    assert_eq!(response.status(), 200);

    Ok(())
}

/// Test that non-existent routes return 404.
#[tokio::test]
async fn test_unknown_route_returns_404() -> Result<(), anyhow::Error> {
    let server = TestRolloutServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/nonexistent", server.url()))
        .send()
        .await?;

    assert_eq!(response.status(), 404);

    Ok(())
}

/// The webhook route only accepts POST.
#[tokio::test]
async fn test_get_update_returns_405() -> Result<(), anyhow::Error> {
    let server = TestRolloutServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/update", server.url()))
        .send()
        .await?;

    assert_eq!(response.status(), 405);

    Ok(())
}

/// Test that the metrics endpoint exposes HTTP request counters.
#[tokio::test]
async fn test_metrics_endpoint_renders_prometheus_text() -> Result<(), anyhow::Error> {
    let server = TestRolloutServer::spawn().await?;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{}/metrics", server.url()))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let body = response.text().await?;
    assert!(
        body.contains("rc_http_requests_total"),
        "Expected HTTP request counter in metrics output, got:\n{}",
        body
    );

    Ok(())
}
