//! Gateway core
//!
//! Composes authentication, rate limiting, routing, load balancing,
//! proxying and metrics into the HTTP request pipeline, and exposes the
//! health, metrics, admin and WebSocket surfaces. Every failure inside the
//! pipeline is shaped into a JSON error response here; nothing escapes to
//! the transport.

use crate::auth::{Authenticator, TokenPair, UserContext};
use crate::balancer::{LoadBalancer, UpstreamOutcome};
use crate::balancer::circuit::CircuitBreakerConfig;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::events::EventBus;
use crate::metrics::MetricsCollector;
use crate::ratelimit::{rate_limit_key, RateDecision, RateLimiter, RateLimitPolicy};
use crate::registry::{InstanceSummary, ServiceInstance, ServiceRegistry};
use crate::router::ServiceRouter;
use crate::store::{MemoryStore, RedisStore, SharedStoreRef};
use crate::ws::WsBus;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path as AxumPath, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Maximum request body the proxy will buffer.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<ServiceRouter>,
    pub registry: Arc<ServiceRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub rate_limiter: Arc<RateLimiter>,
    pub authenticator: Arc<Authenticator>,
    pub metrics: Arc<MetricsCollector>,
    pub events: Arc<EventBus>,
    pub ws: Arc<WsBus>,
    pub http_client: reqwest::Client,
}

/// JSON body of every client-facing error.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub status_code: u16,
    pub request_id: String,
}

fn shape_error(err: &GatewayError, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        error: err.to_string(),
        code: err.code().to_string(),
        status_code: err.status_code(),
        request_id: request_id.to_string(),
    };
    let mut response = (status, Json(body)).into_response();
    if let GatewayError::TooManyRequests { retry_after, .. } = err {
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("Retry-After", value);
        }
    }
    response
}

fn attach_rate_headers(mut response: Response, decision: &RateDecision) -> Response {
    let headers = response.headers_mut();
    let pairs = [
        ("X-RateLimit-Limit", decision.limit.to_string()),
        ("X-RateLimit-Remaining", decision.remaining.to_string()),
        ("X-RateLimit-Reset", decision.reset_at.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    response
}

/// First X-Forwarded-For segment, else X-Real-IP, else the socket peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    peer.ip().to_string()
}

#[derive(Default)]
struct PipelineContext {
    service: Option<String>,
    decision: Option<RateDecision>,
    user: Option<UserContext>,
}

/// Main proxy handler: the request pipeline.
async fn proxy_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let started = state.metrics.record_start();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut ctx = PipelineContext::default();
    let outcome = run_pipeline(&state, peer, request, &request_id, &mut ctx).await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(mut response) => {
            state.metrics.record_complete(
                ctx.service.as_deref(),
                method.as_str(),
                &path,
                response.status().as_u16(),
                elapsed,
            );
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert("X-Gateway-Request-Id", value);
            }
            match &ctx.decision {
                Some(decision) => attach_rate_headers(response, decision),
                None => response,
            }
        }
        Err(err) => {
            log::warn!(
                "request {} {} failed: {} ({})",
                method,
                path,
                err,
                request_id
            );
            state.metrics.record_error(err.code());
            state.metrics.record_complete(
                ctx.service.as_deref(),
                method.as_str(),
                &path,
                err.status_code(),
                elapsed,
            );
            let response = shape_error(&err, &request_id);
            match &ctx.decision {
                Some(decision) => attach_rate_headers(response, decision),
                None => response,
            }
        }
    }
}

async fn run_pipeline(
    state: &GatewayState,
    peer: SocketAddr,
    request: Request,
    request_id: &str,
    ctx: &mut PipelineContext,
) -> Result<Response> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(|q| q.to_string());
    let headers = request.headers().clone();
    let ip = client_ip(&headers, peer);

    // Authenticate first so the rate-limit key can include the user id.
    ctx.user = state.authenticator.authenticate(&headers, &path)?;

    let key = rate_limit_key(&ip, ctx.user.as_ref().map(|u| u.user_id.as_str()));
    let decision = state.rate_limiter.admit(&key, &path).await;
    ctx.decision = Some(decision);
    if !decision.allowed {
        return Err(GatewayError::TooManyRequests {
            limit: decision.limit,
            retry_after: decision.retry_after,
            reset_at: decision.reset_at,
        });
    }

    let service = state
        .router
        .route(&path)
        .ok_or_else(|| GatewayError::NotFound("no route".to_string()))?;
    ctx.service = Some(service.clone());

    let instance = state.balancer.select(&service).await?;
    let instance_id = instance.id();

    // Body is only read for methods that carry one.
    let carries_body = method == Method::POST || method == Method::PUT || method == Method::PATCH;
    let body = if carries_body {
        let bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| GatewayError::BadRequest(format!("body read failed: {}", e)))?;
        Some(bytes)
    } else {
        None
    };

    let forwarded = tokio::time::timeout(
        state.config.request_timeout,
        forward_request(
            &state.http_client,
            &instance,
            &method,
            &path,
            query.as_deref(),
            &headers,
            body,
            &ip,
            request_id,
            ctx.user.as_ref(),
        ),
    )
    .await;

    match forwarded {
        Err(_) => {
            state
                .balancer
                .report(&service, &instance_id, UpstreamOutcome::Timeout);
            Err(GatewayError::UpstreamTimeout)
        }
        Ok(Err(err)) => {
            let outcome = if matches!(err, GatewayError::UpstreamTimeout) {
                UpstreamOutcome::Timeout
            } else {
                UpstreamOutcome::Failure
            };
            state.balancer.report(&service, &instance_id, outcome);
            Err(err)
        }
        Ok(Ok(response)) => {
            let outcome = if response.status().is_server_error() {
                UpstreamOutcome::Failure
            } else {
                UpstreamOutcome::Success
            };
            state.balancer.report(&service, &instance_id, outcome);
            Ok(response)
        }
    }
}

/// Forward one request to the chosen instance and convert the reply.
#[allow(clippy::too_many_arguments)]
async fn forward_request(
    client: &reqwest::Client,
    instance: &ServiceInstance,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Option<bytes::Bytes>,
    client_ip: &str,
    request_id: &str,
    user: Option<&UserContext>,
) -> Result<Response> {
    let mut url = format!("{}{}", instance.url(), path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }

    let mut upstream_headers = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if name == axum::http::header::HOST || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            upstream_headers.insert(name, value);
        }
    }

    // Append this hop to X-Forwarded-For.
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip.to_string(),
    };
    if let Ok(value) = reqwest::header::HeaderValue::from_str(&forwarded_for) {
        upstream_headers.insert("X-Forwarded-For", value);
    }
    upstream_headers.insert(
        "X-Forwarded-Proto",
        reqwest::header::HeaderValue::from_static("http"),
    );
    if let Ok(value) = reqwest::header::HeaderValue::from_str(request_id) {
        upstream_headers.insert("X-Gateway-Request-Id", value);
    }
    if let Some(user) = user {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user.user_id) {
            upstream_headers.insert("X-User-Id", value);
        }
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user.roles.join(",")) {
            upstream_headers.insert("X-User-Roles", value);
        }
    }

    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| GatewayError::BadRequest(format!("unsupported method {}", method)))?;
    let mut builder = client
        .request(reqwest_method, &url)
        .headers(upstream_headers);
    if let Some(body) = body {
        builder = builder.body(body);
    }

    let upstream = builder.send().await.map_err(|err| {
        if err.is_timeout() {
            GatewayError::UpstreamTimeout
        } else {
            GatewayError::UpstreamFailed(err.to_string())
        }
    })?;

    let status = upstream.status();
    let response_headers = upstream.headers().clone();
    let bytes = upstream
        .bytes()
        .await
        .map_err(|err| GatewayError::UpstreamFailed(format!("body read: {}", err)))?;

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in response_headers.iter() {
        if name == reqwest::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder
        .body(Body::from(bytes))
        .map_err(|err| GatewayError::Internal(format!("response build: {}", err)))
}

/// Health endpoint: registry snapshot plus a timestamp.
async fn health_handler(State(state): State<GatewayState>) -> Response {
    match state.registry.healthy_services().await {
        Ok(healthy) => {
            let services: HashMap<String, Vec<InstanceSummary>> = healthy
                .iter()
                .map(|(name, instances)| {
                    (
                        name.clone(),
                        instances.iter().map(InstanceSummary::from).collect(),
                    )
                })
                .collect();
            Json(serde_json::json!({
                "status": "healthy",
                "services": services,
                "timestamp": chrono::Utc::now().timestamp(),
            }))
            .into_response()
        }
        Err(err) => shape_error(&err, &uuid::Uuid::new_v4().to_string()),
    }
}

/// Metrics endpoint: the collector snapshot.
async fn metrics_handler(State(state): State<GatewayState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

fn require_admin(state: &GatewayState, headers: &HeaderMap) -> Result<UserContext> {
    // Admin endpoints are never public, whatever the allowlist says.
    let user = state
        .authenticator
        .authenticate(headers, "/admin")?
        .ok_or(GatewayError::AuthRequired)?;
    if !user.has_role("admin") {
        return Err(GatewayError::Forbidden("admin role required".to_string()));
    }
    Ok(user)
}

/// Admin: register a service instance.
async fn admin_register_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(instance): Json<ServiceInstance>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    if let Err(err) = require_admin(&state, &headers) {
        return shape_error(&err, &request_id);
    }
    let id = instance.id();
    match state.registry.register(instance).await {
        Ok(()) => Json(serde_json::json!({
            "message": "service registered",
            "id": id,
        }))
        .into_response(),
        Err(err) => shape_error(&err, &request_id),
    }
}

/// Admin: unregister every instance of a service.
async fn admin_unregister_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    if let Err(err) = require_admin(&state, &headers) {
        return shape_error(&err, &request_id);
    }
    match state.registry.unregister_service(&name).await {
        Ok(removed) => Json(serde_json::json!({
            "message": "service unregistered",
            "removed_instances": removed,
        }))
        .into_response(),
        Err(err) => shape_error(&err, &request_id),
    }
}

/// Admin: registry, event-bus and WebSocket statistics.
async fn admin_stats_handler(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    if let Err(err) = require_admin(&state, &headers) {
        return shape_error(&err, &request_id);
    }
    match state.registry.stats().await {
        Ok(registry) => Json(serde_json::json!({
            "registry": registry,
            "events": state.events.stats(),
            "websocket": state.ws.stats(),
        }))
        .into_response(),
        Err(err) => shape_error(&err, &request_id),
    }
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

/// Exchange a refresh token for a fresh pair.
async fn refresh_handler(
    State(state): State<GatewayState>,
    Json(body): Json<RefreshRequest>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    match state.authenticator.refresh(&body.refresh_token) {
        Ok(pair) => Json::<TokenPair>(pair).into_response(),
        Err(err) => shape_error(&GatewayError::Unauthorized(err), &request_id),
    }
}

/// WebSocket upgrade; the fabric drives the socket from here on.
async fn ws_upgrade_handler(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let connection_id = params
        .get("connection_id")
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let bus = state.ws.clone();
    ws.on_upgrade(move |socket| bus.handle_socket(socket, connection_id))
}

async fn fallback_handler() -> Response {
    shape_error(
        &GatewayError::NotFound("no route".to_string()),
        &uuid::Uuid::new_v4().to_string(),
    )
}

/// Build the axum application for a prepared state.
pub fn build_app(state: GatewayState) -> AxumRouter {
    let cors = if state.config.debug {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    AxumRouter::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/auth/refresh", post(refresh_handler))
        .route("/admin/services/register", post(admin_register_handler))
        .route("/admin/services/:name", delete(admin_unregister_handler))
        .route("/admin/stats", get(admin_stats_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/api/*path", any(proxy_handler))
        .fallback(fallback_handler)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .into_inner(),
        )
        .with_state(state)
}

/// The composition root: builds every subsystem, wires them together and
/// owns the background tasks.
pub struct Gateway {
    state: GatewayState,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Construct all components from configuration. Uses the Redis store
    /// when a URL is configured and reachable, otherwise the in-memory
    /// store with a warning.
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store: SharedStoreRef = match &config.registry.store_url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    log::error!(
                        "shared store unreachable ({}), continuing on in-memory store",
                        err
                    );
                    Arc::new(MemoryStore::new())
                }
            },
            None => Arc::new(MemoryStore::new()),
        };

        let registry = Arc::new(ServiceRegistry::new(store.clone(), config.registry.clone()));
        let balancer = Arc::new(LoadBalancer::new(
            config.balancer.strategy,
            config.balancer.healthcheck_enabled,
            CircuitBreakerConfig {
                failure_threshold: config.balancer.circuit_threshold,
                cooldown: config.balancer.circuit_cooldown,
                max_cooldown: config.balancer.circuit_cooldown * 10,
                half_open_max: config.balancer.half_open_max,
            },
            registry.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit, Some(store.clone())));
        let authenticator = Arc::new(Authenticator::new(
            &config.auth.jwt_secret,
            &config.auth.jwt_algorithm,
            config.auth.access_ttl,
            config.auth.refresh_ttl,
        ));
        let metrics = Arc::new(
            MetricsCollector::new(config.slow_request_threshold)
                .with_persistence(store.clone(), shutdown_rx.clone()),
        );
        let router = Arc::new(ServiceRouter::new());
        let events = Arc::new(EventBus::new(store.clone(), config.service_name.clone()));
        let ws = Arc::new(WsBus::new(authenticator.clone(), Some(store.clone())));

        // Seed routes, per-path limits and static instances.
        for (name, service) in &config.services {
            router.add_prefix(&service.prefix, name)?;
            if let Some(limit) = service.rate_limit {
                rate_limiter.set_path_limit(
                    &service.prefix,
                    RateLimitPolicy {
                        limit: limit.limit,
                        window: Duration::from_secs(limit.window_seconds),
                    },
                );
            }
            for (host, port) in service.instance_addrs()? {
                registry
                    .register(ServiceInstance::new(name.clone(), host, port))
                    .await?;
            }
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| GatewayError::Internal(format!("http client: {}", err)))?;

        let state = GatewayState {
            config: Arc::new(config),
            router,
            registry,
            balancer,
            rate_limiter,
            authenticator,
            metrics,
            events,
            ws,
            http_client,
        };

        Ok(Self {
            state,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    pub fn state(&self) -> GatewayState {
        self.state.clone()
    }

    /// Start background loops: registry heartbeat and sweep, event
    /// consumer, WebSocket sweep and pub/sub listener.
    pub fn start_background(&mut self) {
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks
            .extend(self.state.registry.spawn_background(shutdown.clone()));
        self.tasks
            .push(self.state.events.spawn_consumer(shutdown.clone()));
        self.tasks.extend(self.state.ws.spawn_background(shutdown));
        log::info!("gateway background tasks started");
    }

    /// Serve until ctrl-c, then shut down in order: stop accepting, cancel
    /// background loops, close WebSocket connections.
    pub async fn serve(mut self) -> Result<()> {
        self.start_background();
        let addr = self.state.config.listen_addr()?;
        let app = build_app(self.state());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("gateway listening on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutdown signal received");
        })
        .await
        .map_err(|err| GatewayError::Internal(format!("server: {}", err)))?;

        self.stop().await;
        Ok(())
    }

    /// Cancel background tasks and close open WebSocket connections.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.state.ws.close_all();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                log::warn!("background task did not stop in time");
            }
        }
        log::info!("gateway stopped");
    }
}
