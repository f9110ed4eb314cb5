//! Gateway configuration
//!
//! Options are merged at startup from an optional JSON config file and the
//! environment; environment values win. Per-service entries seed the router
//! prefix table, the static registry entries and per-path rate limits.

use crate::balancer::LoadBalancingStrategy;
use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Top-level gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway listening host
    pub host: String,
    /// Gateway listening port
    pub port: u16,
    /// Debug mode (permissive CORS, verbose errors)
    pub debug: bool,
    /// Logical name of this process, used for event consumer groups
    pub service_name: String,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Load balancer and circuit breaker configuration
    pub balancer: BalancerConfig,
    /// Service registry configuration
    pub registry: RegistryConfig,
    /// Requests slower than this are logged at warn level
    pub slow_request_threshold: Duration,
    /// Per-request upstream timeout
    pub request_timeout: Duration,
    /// Statically configured services: name -> prefix/instances
    pub services: HashMap<String, ServiceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            debug: false,
            service_name: "api-gateway".to_string(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            balancer: BalancerConfig::default(),
            registry: RegistryConfig::default(),
            slow_request_threshold: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            services: HashMap::new(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// JWT signing secret
    pub jwt_secret: String,
    /// Signing algorithm name (HS256 by default)
    pub jwt_algorithm: String,
    /// Access token lifetime
    pub access_ttl: Duration,
    /// Refresh token lifetime
    pub refresh_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_else(|_| {
                use rand::Rng;
                use rand::rngs::OsRng;
                let mut rng = OsRng;
                let secret: String = (0..32)
                    .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
                    .collect();
                log::warn!("JWT_SECRET not set, using randomly generated secret. Set JWT_SECRET environment variable in production!");
                secret
            }),
            jwt_algorithm: "HS256".to_string(),
            access_ttl: Duration::from_secs(30 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Rate limiter backing store selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStore {
    Memory,
    Shared,
}

impl FromStr for RateLimitStore {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(RateLimitStore::Memory),
            "shared" => Ok(RateLimitStore::Shared),
            other => Err(GatewayError::BadRequest(format!(
                "unknown rate limit store: {}",
                other
            ))),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Maximum requests per window for paths without an override
    pub default_limit: u32,
    /// Time window for rate limiting
    pub window: Duration,
    /// Where window state lives
    pub store: RateLimitStore,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: 100,
            window: Duration::from_secs(60),
            store: RateLimitStore::Memory,
        }
    }
}

/// Load balancer and circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Instance selection strategy
    pub strategy: LoadBalancingStrategy,
    /// Whether registry health gates instance eligibility
    pub healthcheck_enabled: bool,
    /// Consecutive failures before a circuit opens
    pub circuit_threshold: u32,
    /// Base cooldown while a circuit is open
    pub circuit_cooldown: Duration,
    /// Concurrent trial requests allowed in half-open state
    pub half_open_max: u32,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            healthcheck_enabled: true,
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
            half_open_max: 1,
        }
    }
}

/// Service registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Shared store URL; None runs against the in-memory store
    pub store_url: Option<String>,
    /// Instance TTL; heartbeats must arrive within this window
    pub instance_ttl: Duration,
    /// Interval between heartbeats for locally registered instances
    pub heartbeat_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            instance_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Statically configured service entry
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// URL path prefix routed to this service
    pub prefix: String,
    /// Static instances as "host:port" pairs
    #[serde(default)]
    pub instances: Vec<String>,
    /// Per-prefix rate limit override
    #[serde(default)]
    pub rate_limit: Option<PathLimit>,
}

/// Per-path rate limit override
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PathLimit {
    pub limit: u32,
    pub window_seconds: u64,
}

impl ServiceConfig {
    /// Parse the configured "host:port" instance entries.
    pub fn instance_addrs(&self) -> Result<Vec<(String, u16)>> {
        self.instances
            .iter()
            .map(|s| {
                let (host, port) = s.rsplit_once(':').ok_or_else(|| {
                    GatewayError::ValidationFailed(format!("bad instance address: {}", s))
                })?;
                let port = port.parse::<u16>().map_err(|e| {
                    GatewayError::ValidationFailed(format!("bad instance port {}: {}", s, e))
                })?;
                Ok((host.to_string(), port))
            })
            .collect()
    }
}

/// On-disk configuration file shape. Every field is optional; the
/// environment fills in or overrides whatever the file leaves out.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    debug: Option<bool>,
    service_name: Option<String>,
    jwt_secret: Option<String>,
    jwt_algorithm: Option<String>,
    jwt_access_ttl_seconds: Option<u64>,
    jwt_refresh_ttl_seconds: Option<u64>,
    rate_limit_enabled: Option<bool>,
    rate_limit_default_limit: Option<u32>,
    rate_limit_window_seconds: Option<u64>,
    rate_limit_store: Option<String>,
    lb_algorithm: Option<String>,
    lb_healthcheck_enabled: Option<bool>,
    circuit_threshold: Option<u32>,
    circuit_cooldown_seconds: Option<u64>,
    registry_store_url: Option<String>,
    registry_instance_ttl_seconds: Option<u64>,
    registry_heartbeat_interval_seconds: Option<u64>,
    slow_request_threshold_seconds: Option<f64>,
    request_timeout_seconds: Option<u64>,
    #[serde(default)]
    services: HashMap<String, ServiceConfig>,
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("ignoring unparseable {}={}", name, raw);
                None
            }
        },
        Err(_) => None,
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

impl GatewayConfig {
    /// Load configuration: defaults, then the optional file, then the
    /// environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                serde_json::from_str::<FileConfig>(&raw)
                    .map_err(|e| GatewayError::ValidationFailed(format!("config file: {}", e)))?
            }
            None => FileConfig::default(),
        };

        let mut cfg = GatewayConfig::default();

        if let Some(v) = file.host {
            cfg.host = v;
        }
        if let Some(v) = file.port {
            cfg.port = v;
        }
        if let Some(v) = file.debug {
            cfg.debug = v;
        }
        if let Some(v) = file.service_name {
            cfg.service_name = v;
        }
        if let Some(v) = file.jwt_secret {
            cfg.auth.jwt_secret = v;
        }
        if let Some(v) = file.jwt_algorithm {
            cfg.auth.jwt_algorithm = v;
        }
        if let Some(v) = file.jwt_access_ttl_seconds {
            cfg.auth.access_ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.jwt_refresh_ttl_seconds {
            cfg.auth.refresh_ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.rate_limit_enabled {
            cfg.rate_limit.enabled = v;
        }
        if let Some(v) = file.rate_limit_default_limit {
            cfg.rate_limit.default_limit = v;
        }
        if let Some(v) = file.rate_limit_window_seconds {
            cfg.rate_limit.window = Duration::from_secs(v);
        }
        if let Some(v) = file.rate_limit_store {
            cfg.rate_limit.store = v.parse()?;
        }
        if let Some(v) = file.lb_algorithm {
            cfg.balancer.strategy = v.parse()?;
        }
        if let Some(v) = file.lb_healthcheck_enabled {
            cfg.balancer.healthcheck_enabled = v;
        }
        if let Some(v) = file.circuit_threshold {
            cfg.balancer.circuit_threshold = v;
        }
        if let Some(v) = file.circuit_cooldown_seconds {
            cfg.balancer.circuit_cooldown = Duration::from_secs(v);
        }
        if let Some(v) = file.registry_store_url {
            cfg.registry.store_url = Some(v);
        }
        if let Some(v) = file.registry_instance_ttl_seconds {
            cfg.registry.instance_ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.registry_heartbeat_interval_seconds {
            cfg.registry.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.slow_request_threshold_seconds {
            cfg.slow_request_threshold = Duration::from_secs_f64(v);
        }
        if let Some(v) = file.request_timeout_seconds {
            cfg.request_timeout = Duration::from_secs(v);
        }
        cfg.services = file.services;

        cfg.apply_env();
        Ok(cfg)
    }

    /// Overlay recognized environment variables.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("GATEWAY_HOST") {
            self.host = v;
        }
        if let Some(v) = env_parse::<u16>("GATEWAY_PORT") {
            self.port = v;
        }
        if let Some(v) = env_bool("GATEWAY_DEBUG") {
            self.debug = v;
        }
        if let Ok(v) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Ok(v) = std::env::var("JWT_ALGORITHM") {
            self.auth.jwt_algorithm = v;
        }
        if let Some(v) = env_parse::<u64>("JWT_ACCESS_TTL_SECONDS") {
            self.auth.access_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("JWT_REFRESH_TTL_SECONDS") {
            self.auth.refresh_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_bool("RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = v;
        }
        if let Some(v) = env_parse::<u32>("RATE_LIMIT_DEFAULT_LIMIT") {
            self.rate_limit.default_limit = v;
        }
        if let Some(v) = env_parse::<u64>("RATE_LIMIT_WINDOW_SECONDS") {
            self.rate_limit.window = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<RateLimitStore>("RATE_LIMIT_STORE") {
            self.rate_limit.store = v;
        }
        if let Some(v) = env_parse::<LoadBalancingStrategy>("LB_ALGORITHM") {
            self.balancer.strategy = v;
        }
        if let Some(v) = env_bool("LB_HEALTHCHECK_ENABLED") {
            self.balancer.healthcheck_enabled = v;
        }
        if let Some(v) = env_parse::<u32>("CIRCUIT_THRESHOLD") {
            self.balancer.circuit_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("CIRCUIT_COOLDOWN_SECONDS") {
            self.balancer.circuit_cooldown = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("REGISTRY_STORE_URL") {
            if !v.is_empty() {
                self.registry.store_url = Some(v);
            }
        }
        if let Some(v) = env_parse::<u64>("REGISTRY_INSTANCE_TTL_SECONDS") {
            self.registry.instance_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("REGISTRY_HEARTBEAT_INTERVAL_SECONDS") {
            self.registry.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<f64>("SLOW_REQUEST_THRESHOLD_SECONDS") {
            self.slow_request_threshold = Duration::from_secs_f64(v);
        }
        if let Some(v) = env_parse::<u64>("REQUEST_TIMEOUT_SECONDS") {
            self.request_timeout = Duration::from_secs(v);
        }
    }

    /// Socket address the gateway binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| GatewayError::ValidationFailed(format!("listen address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.rate_limit.default_limit, 100);
        assert_eq!(cfg.registry.instance_ttl, Duration::from_secs(30));
        assert!(cfg.registry.heartbeat_interval < cfg.registry.instance_ttl);
        assert_eq!(cfg.balancer.circuit_threshold, 5);
    }

    #[test]
    fn test_file_merge() {
        let raw = r#"{
            "port": 9090,
            "rate_limit_default_limit": 10,
            "services": {
                "user": {
                    "prefix": "/api/v1/users",
                    "instances": ["127.0.0.1:9001"],
                    "rate_limit": { "limit": 5, "window_seconds": 30 }
                }
            }
        }"#;
        let file: FileConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(file.port, Some(9090));
        let svc = &file.services["user"];
        assert_eq!(svc.prefix, "/api/v1/users");
        assert_eq!(svc.instance_addrs().unwrap().len(), 1);
        assert_eq!(svc.rate_limit.unwrap().limit, 5);
    }

    #[test]
    fn test_rate_limit_store_parse() {
        assert_eq!(
            "shared".parse::<RateLimitStore>().unwrap(),
            RateLimitStore::Shared
        );
        assert!("bogus".parse::<RateLimitStore>().is_err());
    }
}
