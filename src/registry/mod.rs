//! Service registry
//!
//! Durable, TTL-backed registry of service instances built on the shared
//! store. Each instance writes a record hash plus a heartbeat key with a
//! shorter TTL; liveness is simply "the heartbeat key still exists". A
//! local cache lets reads degrade to a best-effort snapshot while the store
//! is down, and backs the heartbeat and expiry loops without re-querying.

use crate::config::RegistryConfig;
use crate::error::{GatewayError, Result};
use crate::store::SharedStoreRef;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const SERVICE_PREFIX: &str = "services";
const HEARTBEAT_PREFIX: &str = "heartbeat";

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Lifecycle status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Starting,
    Stopping,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Stopping => "stopping",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "unhealthy" => ServiceStatus::Unhealthy,
            "starting" => ServiceStatus::Starting,
            "stopping" => ServiceStatus::Stopping,
            _ => ServiceStatus::Healthy,
        }
    }
}

/// A registered (host, port) endpoint of a named service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default = "default_status")]
    pub status: ServiceStatus,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub registered_at: f64,
    #[serde(default)]
    pub last_heartbeat: f64,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_status() -> ServiceStatus {
    ServiceStatus::Healthy
}

fn default_weight() -> u32 {
    1
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let now = unix_now();
        Self {
            name: name.into(),
            host: host.into(),
            port,
            version: default_version(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            status: ServiceStatus::Healthy,
            weight: 1,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    /// Unique instance id, also the key suffix in the store.
    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.name, self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), self.name.clone());
        fields.insert("host".to_string(), self.host.clone());
        fields.insert("port".to_string(), self.port.to_string());
        fields.insert("version".to_string(), self.version.clone());
        fields.insert(
            "tags".to_string(),
            serde_json::to_string(&self.tags).unwrap_or_else(|_| "[]".to_string()),
        );
        fields.insert(
            "metadata".to_string(),
            serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_string()),
        );
        fields.insert("status".to_string(), self.status.as_str().to_string());
        fields.insert("weight".to_string(), self.weight.to_string());
        fields.insert("registered_at".to_string(), self.registered_at.to_string());
        fields.insert("last_heartbeat".to_string(), self.last_heartbeat.to_string());
        fields
    }

    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let get = |k: &str| fields.get(k).cloned();
        Some(Self {
            name: get("name")?,
            host: get("host")?,
            port: get("port")?.parse().ok()?,
            version: get("version").unwrap_or_else(default_version),
            tags: get("tags")
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
            metadata: get("metadata")
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
            status: get("status")
                .map(|s| ServiceStatus::parse(&s))
                .unwrap_or(ServiceStatus::Healthy),
            weight: get("weight").and_then(|w| w.parse().ok()).unwrap_or(1),
            registered_at: get("registered_at")
                .and_then(|t| t.parse().ok())
                .unwrap_or_default(),
            last_heartbeat: get("last_heartbeat")
                .and_then(|t| t.parse().ok())
                .unwrap_or_default(),
        })
    }
}

/// Compact instance view served by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub status: &'static str,
    pub version: String,
}

impl From<&ServiceInstance> for InstanceSummary {
    fn from(instance: &ServiceInstance) -> Self {
        Self {
            id: instance.id(),
            host: instance.host.clone(),
            port: instance.port,
            status: instance.status.as_str(),
            version: instance.version.clone(),
        }
    }
}

/// Registry totals, served by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_instances: usize,
    pub services: HashMap<String, Vec<InstanceSummary>>,
}

/// Service registry backed by the shared store.
pub struct ServiceRegistry {
    store: SharedStoreRef,
    config: RegistryConfig,
    local: RwLock<HashMap<String, ServiceInstance>>,
}

impl ServiceRegistry {
    pub fn new(store: SharedStoreRef, config: RegistryConfig) -> Self {
        Self {
            store,
            config,
            local: RwLock::new(HashMap::new()),
        }
    }

    fn service_key(id: &str) -> String {
        format!("{}:{}", SERVICE_PREFIX, id)
    }

    fn heartbeat_key(id: &str) -> String {
        format!("{}:{}", HEARTBEAT_PREFIX, id)
    }

    /// Register an instance, overwriting any record with the same id. The
    /// record hash lives twice as long as the heartbeat so that discovery
    /// can still report the instance as unhealthy after its heartbeat lapses.
    pub async fn register(&self, mut instance: ServiceInstance) -> Result<()> {
        if instance.weight == 0 {
            return Err(GatewayError::ValidationFailed(
                "instance weight must be at least 1".to_string(),
            ));
        }
        let now = unix_now();
        instance.last_heartbeat = now;
        if instance.registered_at == 0.0 {
            instance.registered_at = now;
        }
        let id = instance.id();

        self.store
            .hset_all(&Self::service_key(&id), &instance.to_fields())
            .await?;
        self.store
            .expire(&Self::service_key(&id), self.config.instance_ttl * 2)
            .await?;
        self.store
            .set(
                &Self::heartbeat_key(&id),
                &now.to_string(),
                Some(self.config.instance_ttl),
            )
            .await?;

        self.local.write().insert(id.clone(), instance);
        log::info!("registered service instance {}", id);
        Ok(())
    }

    /// Remove one instance by id.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        self.store.delete(&Self::service_key(id)).await?;
        self.store.delete(&Self::heartbeat_key(id)).await?;
        self.local.write().remove(id);
        log::info!("unregistered service instance {}", id);
        Ok(())
    }

    /// Remove every instance of a named service.
    pub async fn unregister_service(&self, service_name: &str) -> Result<usize> {
        let pattern = format!("{}:{}:*", SERVICE_PREFIX, service_name);
        let keys = self.store.scan_keys(&pattern).await?;
        let mut removed = 0;
        for key in keys {
            if let Some(id) = key.strip_prefix(&format!("{}:", SERVICE_PREFIX)) {
                self.unregister(id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Refresh the heartbeat for a registered instance. Fails with NotFound
    /// once the record has expired; the instance must re-register.
    pub async fn heartbeat(&self, id: &str) -> Result<()> {
        if !self.store.exists(&Self::service_key(id)).await? {
            self.local.write().remove(id);
            return Err(GatewayError::NotFound(format!(
                "service instance {} has expired",
                id
            )));
        }

        let now = unix_now();
        self.store
            .set(
                &Self::heartbeat_key(id),
                &now.to_string(),
                Some(self.config.instance_ttl),
            )
            .await?;
        self.store
            .hset_field(&Self::service_key(id), "last_heartbeat", &now.to_string())
            .await?;

        if let Some(instance) = self.local.write().get_mut(id) {
            instance.last_heartbeat = now;
        }
        Ok(())
    }

    /// All instances of a named service. An instance is healthy iff its
    /// heartbeat key is still live. Falls back to the local cache when the
    /// store is unreachable.
    pub async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let pattern = format!("{}:{}:*", SERVICE_PREFIX, service_name);
        let keys = match self.store.scan_keys(&pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!(
                    "store unavailable, serving {} discovery from local cache: {}",
                    service_name,
                    err
                );
                return Ok(self
                    .local
                    .read()
                    .values()
                    .filter(|i| i.name == service_name)
                    .cloned()
                    .collect());
            }
        };

        let mut instances = Vec::new();
        for key in keys {
            let fields = self.store.hget_all(&key).await?;
            if fields.is_empty() {
                continue;
            }
            let Some(mut instance) = ServiceInstance::from_fields(&fields) else {
                log::warn!("skipping unparseable service record at {}", key);
                continue;
            };
            let alive = self
                .store
                .exists(&Self::heartbeat_key(&instance.id()))
                .await?;
            instance.status = if alive {
                ServiceStatus::Healthy
            } else {
                ServiceStatus::Unhealthy
            };
            instances.push(instance);
        }
        Ok(instances)
    }

    /// All healthy instances across all services, grouped by name.
    pub async fn healthy_services(&self) -> Result<HashMap<String, Vec<ServiceInstance>>> {
        let keys = match self.store.scan_keys(&format!("{}:*", SERVICE_PREFIX)).await {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!("store unavailable, serving health snapshot from cache: {}", err);
                let mut by_name: HashMap<String, Vec<ServiceInstance>> = HashMap::new();
                for instance in self.local.read().values() {
                    by_name
                        .entry(instance.name.clone())
                        .or_default()
                        .push(instance.clone());
                }
                return Ok(by_name);
            }
        };

        let mut by_name: HashMap<String, Vec<ServiceInstance>> = HashMap::new();
        for key in keys {
            let fields = self.store.hget_all(&key).await?;
            if fields.is_empty() {
                continue;
            }
            let Some(mut instance) = ServiceInstance::from_fields(&fields) else {
                continue;
            };
            if !self
                .store
                .exists(&Self::heartbeat_key(&instance.id()))
                .await?
            {
                continue;
            }
            instance.status = ServiceStatus::Healthy;
            by_name
                .entry(instance.name.clone())
                .or_default()
                .push(instance);
        }
        Ok(by_name)
    }

    /// Aggregate counts plus per-service instance summaries.
    pub async fn stats(&self) -> Result<RegistryStats> {
        let healthy = self.healthy_services().await?;
        let total_instances = healthy.values().map(Vec::len).sum();
        let services = healthy
            .iter()
            .map(|(name, instances)| {
                (
                    name.clone(),
                    instances.iter().map(InstanceSummary::from).collect(),
                )
            })
            .collect();
        Ok(RegistryStats {
            total_services: healthy.len(),
            total_instances,
            services,
        })
    }

    /// Delete records whose heartbeat key has expired.
    async fn expiry_sweep(&self) -> Result<()> {
        let keys = self.store.scan_keys(&format!("{}:*", SERVICE_PREFIX)).await?;
        for key in keys {
            let Some(id) = key.strip_prefix(&format!("{}:", SERVICE_PREFIX)) else {
                continue;
            };
            if !self.store.exists(&Self::heartbeat_key(id)).await? {
                self.store.delete(&key).await?;
                self.local.write().remove(id);
                log::info!("expired service instance {}", id);
            }
        }
        Ok(())
    }

    /// Spawn the heartbeat loop and the expiry sweep. Both run until the
    /// shutdown signal flips; transient errors are logged and retried.
    pub fn spawn_background(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let registry = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(registry.config.heartbeat_interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let ids: Vec<String> = registry.local.read().keys().cloned().collect();
                            for id in ids {
                                if let Err(err) = registry.heartbeat(&id).await {
                                    log::warn!("heartbeat for {} failed: {}", id, err);
                                }
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let sweep = {
            let registry = Arc::clone(self);
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Err(err) = registry.expiry_sweep().await {
                                log::warn!("expiry sweep failed: {}", err);
                                tokio::time::sleep(Duration::from_secs(5)).await;
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        vec![heartbeat, sweep]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_registry(ttl: Duration) -> ServiceRegistry {
        let config = RegistryConfig {
            store_url: None,
            instance_ttl: ttl,
            heartbeat_interval: ttl / 3,
        };
        ServiceRegistry::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_register_then_discover() {
        let registry = test_registry(Duration::from_secs(30));
        let instance = ServiceInstance::new("user", "127.0.0.1", 9001);
        registry.register(instance.clone()).await.unwrap();

        let found = registry.discover("user").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), instance.id());
        assert_eq!(found[0].status, ServiceStatus::Healthy);
        assert_eq!(found[0].host, "127.0.0.1");
        assert_eq!(found[0].port, 9001);
    }

    #[tokio::test]
    async fn test_register_rejects_zero_weight() {
        let registry = test_registry(Duration::from_secs(30));
        let mut instance = ServiceInstance::new("user", "h", 1);
        instance.weight = 0;
        assert!(registry.register(instance).await.is_err());
    }

    #[tokio::test]
    async fn test_register_overwrites_same_id() {
        let registry = test_registry(Duration::from_secs(30));
        let mut instance = ServiceInstance::new("user", "127.0.0.1", 9001);
        registry.register(instance.clone()).await.unwrap();
        instance.version = "2.0.0".to_string();
        registry.register(instance).await.unwrap();

        let found = registry.discover("user").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, "2.0.0");
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = test_registry(Duration::from_secs(30));
        let instance = ServiceInstance::new("user", "127.0.0.1", 9001);
        let id = instance.id();
        registry.register(instance).await.unwrap();
        registry.unregister(&id).await.unwrap();
        assert!(registry.discover("user").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_alive() {
        let registry = test_registry(Duration::from_millis(100));
        let instance = ServiceInstance::new("user", "127.0.0.1", 9001);
        let id = instance.id();
        registry.register(instance).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            registry.heartbeat(&id).await.unwrap();
            let found = registry.discover("user").await.unwrap();
            assert_eq!(found[0].status, ServiceStatus::Healthy);
        }
    }

    #[tokio::test]
    async fn test_missed_heartbeats_mark_unhealthy() {
        let registry = test_registry(Duration::from_millis(50));
        let instance = ServiceInstance::new("user", "127.0.0.1", 9001);
        registry.register(instance).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let found = registry.discover("user").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].status, ServiceStatus::Unhealthy);

        let healthy = registry.healthy_services().await.unwrap();
        assert!(healthy.get("user").is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_after_expiry_is_not_found() {
        let registry = test_registry(Duration::from_millis(30));
        let instance = ServiceInstance::new("user", "127.0.0.1", 9001);
        let id = instance.id();
        registry.register(instance).await.unwrap();

        // Both the heartbeat and the record (2x ttl) must lapse.
        tokio::time::sleep(Duration::from_millis(90)).await;
        let err = registry.heartbeat(&id).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_expiry_sweep_removes_record() {
        let registry = test_registry(Duration::from_millis(40));
        let instance = ServiceInstance::new("user", "127.0.0.1", 9001);
        registry.register(instance).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.expiry_sweep().await.unwrap();
        assert!(registry.discover("user").await.unwrap().is_empty());
        assert!(registry.local.read().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_service_removes_all_instances() {
        let registry = test_registry(Duration::from_secs(30));
        registry
            .register(ServiceInstance::new("user", "a", 1))
            .await
            .unwrap();
        registry
            .register(ServiceInstance::new("user", "b", 2))
            .await
            .unwrap();
        registry
            .register(ServiceInstance::new("order", "c", 3))
            .await
            .unwrap();

        let removed = registry.unregister_service("user").await.unwrap();
        assert_eq!(removed, 2);
        assert!(registry.discover("user").await.unwrap().is_empty());
        assert_eq!(registry.discover("order").await.unwrap().len(), 1);
    }
}
