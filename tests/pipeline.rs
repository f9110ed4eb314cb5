//! End-to-end pipeline tests: a real gateway instance proxying to a real
//! upstream over ephemeral listeners, driven with reqwest.

use axum::routing::{any, get, post};
use axum::{Json, Router};
use meshgate::auth::Authenticator;
use meshgate::config::{GatewayConfig, PathLimit, ServiceConfig};
use meshgate::{build_app, Gateway, GatewayState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Minimal upstream standing in for a backend service.
async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route(
            "/api/v1/svc/ping",
            get(|| async { Json(serde_json::json!({"pong": true})) }),
        )
        .route(
            "/api/v1/svc/echo",
            post(|body: String| async move { body }),
        )
        .route(
            "/api/v1/svc/headers",
            any(|headers: axum::http::HeaderMap| async move {
                let forwarded = headers
                    .get("x-forwarded-for")
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let request_id = headers
                    .get("x-gateway-request-id")
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let user_id = headers
                    .get("x-user-id")
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                Json(serde_json::json!({
                    "forwarded_for": forwarded,
                    "request_id": request_id,
                    "user_id": user_id,
                }))
            }),
        )
        .route(
            "/api/v1/svc/boom",
            get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn base_config(upstream: Option<SocketAddr>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.jwt_secret = "integration-test-secret".to_string();
    if let Some(upstream) = upstream {
        config.services.insert(
            "svc".to_string(),
            ServiceConfig {
                prefix: "/api/v1/svc".to_string(),
                instances: vec![upstream.to_string()],
                rate_limit: None,
            },
        );
    }
    config
}

/// Boot a gateway and serve it on an ephemeral port. The `Gateway` is
/// returned to keep its background tasks alive for the test's lifetime.
async fn spawn_gateway(config: GatewayConfig, background: bool) -> (SocketAddr, GatewayState, Gateway) {
    let mut gateway = Gateway::new(config).await.unwrap();
    if background {
        gateway.start_background();
    }
    let state = gateway.state();
    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state, gateway)
}

fn issue_token(roles: &[&str]) -> String {
    let authenticator = Authenticator::new(
        "integration-test-secret",
        "HS256",
        Duration::from_secs(1800),
        Duration::from_secs(3600),
    );
    let roles: Vec<String> = roles.iter().map(|r| r.to_string()).collect();
    authenticator.issue_access("u1", "alice", &roles).unwrap()
}

#[tokio::test]
async fn happy_path_proxies_to_upstream() {
    let upstream = spawn_upstream().await;
    let (addr, _state, _gateway) = spawn_gateway(base_config(Some(upstream)), true).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .bearer_auth(issue_token(&["trader"]))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|h| h.to_str().ok()),
        Some("99")
    );
    assert!(response.headers().contains_key("x-gateway-request-id"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"pong": true}));
}

#[tokio::test]
async fn upstream_sees_injected_headers() {
    let upstream = spawn_upstream().await;
    let (addr, _state, _gateway) = spawn_gateway(base_config(Some(upstream)), true).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/v1/svc/headers", addr))
        .bearer_auth(issue_token(&["trader"]))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();

    assert_eq!(body["user_id"], "u1");
    assert_ne!(body["request_id"], "");
    assert_ne!(body["forwarded_for"], "");
}

#[tokio::test]
async fn request_body_is_forwarded() {
    let upstream = spawn_upstream().await;
    let (addr, _state, _gateway) = spawn_gateway(base_config(Some(upstream)), true).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/v1/svc/echo", addr))
        .bearer_auth(issue_token(&["trader"]))
        .body("hello upstream")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello upstream");
}

#[tokio::test]
async fn routing_miss_is_shaped_not_found() {
    let upstream = spawn_upstream().await;
    let (addr, _state, _gateway) = spawn_gateway(base_config(Some(upstream)), true).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/nope", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
    assert_eq!(body["status_code"], 404);
    assert!(!body["request_id"].as_str().unwrap().is_empty());

    // Same shape for unrouted /api paths that enter the pipeline.
    let response = client
        .get(format!("http://{}/api/v1/unknown/x", addr))
        .bearer_auth(issue_token(&["trader"]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let upstream = spawn_upstream().await;
    let (addr, _state, _gateway) = spawn_gateway(base_config(Some(upstream)), true).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "missing_token");
}

#[tokio::test]
async fn rate_limit_denies_third_request() {
    let upstream = spawn_upstream().await;
    let mut config = base_config(Some(upstream));
    config.rate_limit.default_limit = 2;
    config.rate_limit.window = Duration::from_secs(60);
    let (addr, _state, _gateway) = spawn_gateway(config, true).await;

    let client = reqwest::Client::new();
    let token = issue_token(&["trader"]);
    for _ in 0..2 {
        let response = client
            .get(format!("http://{}/api/v1/svc/ping", addr))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let response = client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|h| h.to_str().ok()),
        Some("60")
    );
    assert_eq!(
        response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|h| h.to_str().ok()),
        Some("0")
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "too_many_requests");
}

#[tokio::test]
async fn per_path_override_beats_default() {
    let upstream = spawn_upstream().await;
    let mut config = base_config(Some(upstream));
    config.rate_limit.default_limit = 100;
    if let Some(svc) = config.services.get_mut("svc") {
        svc.rate_limit = Some(PathLimit {
            limit: 1,
            window_seconds: 60,
        });
    }
    let (addr, _state, _gateway) = spawn_gateway(config, true).await;

    let client = reqwest::Client::new();
    let token = issue_token(&["trader"]);
    let first = client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let second = client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 429);
}

#[tokio::test]
async fn circuit_trips_after_connection_failures() {
    // Reserve a port, then free it so connections are refused.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let mut config = GatewayConfig::default();
    config.auth.jwt_secret = "integration-test-secret".to_string();
    config.balancer.circuit_threshold = 5;
    config.services.insert(
        "svc".to_string(),
        ServiceConfig {
            prefix: "/api/v1/svc".to_string(),
            instances: vec![dead_addr.to_string()],
            rate_limit: None,
        },
    );
    let (addr, _state, _gateway) = spawn_gateway(config, true).await;

    let client = reqwest::Client::new();
    let token = issue_token(&["trader"]);
    for _ in 0..5 {
        let response = client
            .get(format!("http://{}/api/v1/svc/ping", addr))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "upstream_failed");
    }

    // Circuit is open: the instance is no longer eligible.
    let response = client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "upstream_unavailable");
}

#[tokio::test]
async fn upstream_5xx_passes_through_and_counts_as_failure() {
    let upstream = spawn_upstream().await;
    let (addr, state, _gateway) = spawn_gateway(base_config(Some(upstream)), true).await;

    let client = reqwest::Client::new();
    let token = issue_token(&["trader"]);
    let response = client
        .get(format!("http://{}/api/v1/svc/boom", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "boom");

    let snapshot = state.metrics.snapshot();
    let svc = &snapshot.services["svc"];
    assert_eq!(svc.total_requests, 1);
    assert!(svc.success_rate < 1.0);
}

#[tokio::test]
async fn expired_registration_yields_service_unavailable() {
    let upstream = spawn_upstream().await;
    let mut config = base_config(Some(upstream));
    config.registry.instance_ttl = Duration::from_millis(500);
    config.registry.heartbeat_interval = Duration::from_millis(150);
    // No background tasks: heartbeats stop after registration.
    let (addr, _state, _gateway) = spawn_gateway(config, false).await;

    let client = reqwest::Client::new();
    let token = issue_token(&["trader"]);

    let response = client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let response = client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "upstream_unavailable");
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
    let upstream = spawn_upstream().await;
    let (addr, _state, _gateway) = spawn_gateway(base_config(Some(upstream)), true).await;

    let client = reqwest::Client::new();
    let health: serde_json::Value = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["services"]["svc"].as_array().unwrap().len() == 1);

    // Drive one request so the snapshot has content.
    client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .bearer_auth(issue_token(&["trader"]))
        .send()
        .await
        .unwrap();

    let metrics: serde_json::Value = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(metrics["gateway"]["total_requests"].as_u64().unwrap() >= 1);
    assert!(metrics["services"]["svc"]["total_requests"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn admin_surface_requires_admin_role() {
    let (addr, _state, _gateway) = spawn_gateway(base_config(None), true).await;
    let client = reqwest::Client::new();

    let mut instance = HashMap::new();
    instance.insert("name".to_string(), serde_json::json!("late-svc"));
    instance.insert("host".to_string(), serde_json::json!("127.0.0.1"));
    instance.insert("port".to_string(), serde_json::json!(9105));

    // Trader is rejected.
    let response = client
        .post(format!("http://{}/admin/services/register", addr))
        .bearer_auth(issue_token(&["trader"]))
        .json(&instance)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Admin registers, /health reflects it, then unregisters.
    let response = client
        .post(format!("http://{}/admin/services/register", addr))
        .bearer_auth(issue_token(&["admin"]))
        .json(&instance)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let health: serde_json::Value = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(health["services"]["late-svc"].is_array());

    let response = client
        .delete(format!("http://{}/admin/services/late-svc", addr))
        .bearer_auth(issue_token(&["admin"]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["removed_instances"], 1);
}

#[tokio::test]
async fn refresh_endpoint_issues_usable_pair() {
    let upstream = spawn_upstream().await;
    let (addr, _state, _gateway) = spawn_gateway(base_config(Some(upstream)), true).await;

    let authenticator = Authenticator::new(
        "integration-test-secret",
        "HS256",
        Duration::from_secs(1800),
        Duration::from_secs(3600),
    );
    let pair = authenticator
        .issue_pair("u1", "alice", &["trader".to_string()])
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/api/v1/auth/refresh", addr))
        .json(&serde_json::json!({"refresh_token": pair.refresh_token}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let fresh: serde_json::Value = response.json().await.unwrap();
    let access = fresh["access_token"].as_str().unwrap();

    let response = client
        .get(format!("http://{}/api/v1/svc/ping", addr))
        .bearer_auth(access)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Presenting an access token to the refresh endpoint is rejected.
    let response = client
        .post(format!("http://{}/api/v1/auth/refresh", addr))
        .json(&serde_json::json!({"refresh_token": fresh["access_token"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "wrong_token_type");
}
