//! Load balancer
//!
//! Chooses a healthy instance for a service using the configured strategy
//! and tracks per-instance outcomes through a circuit breaker. Candidates
//! are sorted by (host, port) before the strategy runs so identical state
//! yields identical selection sequences across processes.

pub mod circuit;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use crate::error::{GatewayError, Result};
use crate::registry::{ServiceInstance, ServiceRegistry, ServiceStatus};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Instance selection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    Weighted,
    LeastConnections,
}

impl FromStr for LoadBalancingStrategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "round_robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "weighted" => Ok(LoadBalancingStrategy::Weighted),
            "least_connections" => Ok(LoadBalancingStrategy::LeastConnections),
            other => Err(GatewayError::BadRequest(format!(
                "unknown load balancing strategy: {}",
                other
            ))),
        }
    }
}

/// Result of one upstream attempt, reported back after the proxy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    Success,
    Failure,
    Timeout,
}

struct InstanceState {
    breaker: CircuitBreaker,
    in_flight: u32,
}

struct ServiceState {
    cursor: usize,
    instances: HashMap<String, InstanceState>,
}

impl ServiceState {
    fn new() -> Self {
        Self {
            cursor: 0,
            instances: HashMap::new(),
        }
    }
}

/// Load balancer over registry-discovered instances.
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    healthcheck_enabled: bool,
    breaker_config: CircuitBreakerConfig,
    registry: Arc<ServiceRegistry>,
    services: DashMap<String, Mutex<ServiceState>>,
}

impl LoadBalancer {
    pub fn new(
        strategy: LoadBalancingStrategy,
        healthcheck_enabled: bool,
        breaker_config: CircuitBreakerConfig,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            strategy,
            healthcheck_enabled,
            breaker_config,
            registry,
            services: DashMap::new(),
        }
    }

    /// Select one eligible instance of `service_name`, or `UpstreamUnavailable`
    /// when none qualifies. The chosen instance's in-flight count and circuit
    /// slot are taken; the caller must follow up with [`LoadBalancer::report`].
    pub async fn select(&self, service_name: &str) -> Result<ServiceInstance> {
        let mut candidates = self.registry.discover(service_name).await?;
        if self.healthcheck_enabled {
            candidates.retain(|i| i.status == ServiceStatus::Healthy);
        }
        candidates.sort_by(|a, b| (a.host.as_str(), a.port).cmp(&(b.host.as_str(), b.port)));

        if candidates.is_empty() {
            return Err(GatewayError::UpstreamUnavailable(service_name.to_string()));
        }

        let now = Instant::now();
        let entry = self
            .services
            .entry(service_name.to_string())
            .or_insert_with(|| Mutex::new(ServiceState::new()));
        let mut state = entry.lock();

        for instance in &candidates {
            state
                .instances
                .entry(instance.id())
                .or_insert_with(|| InstanceState {
                    breaker: CircuitBreaker::new(self.breaker_config.clone()),
                    in_flight: 0,
                });
        }

        let eligible: Vec<&ServiceInstance> = candidates
            .iter()
            .filter(|i| {
                state
                    .instances
                    .get(&i.id())
                    .map(|s| s.breaker.is_selectable(now))
                    .unwrap_or(false)
            })
            .collect();

        if eligible.is_empty() {
            return Err(GatewayError::UpstreamUnavailable(service_name.to_string()));
        }

        let chosen = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let index = state.cursor % eligible.len();
                state.cursor = state.cursor.wrapping_add(1);
                eligible[index].clone()
            }
            LoadBalancingStrategy::Weighted => {
                use rand::Rng;
                let total: u64 = eligible.iter().map(|i| i.weight.max(1) as u64).sum();
                let mut target = rand::thread_rng().gen_range(0..total);
                let mut pick = eligible[0];
                for &instance in &eligible {
                    let weight = instance.weight.max(1) as u64;
                    if target < weight {
                        pick = instance;
                        break;
                    }
                    target -= weight;
                }
                pick.clone()
            }
            LoadBalancingStrategy::LeastConnections => {
                let min_in_flight = eligible
                    .iter()
                    .map(|i| {
                        state
                            .instances
                            .get(&i.id())
                            .map(|s| s.in_flight)
                            .unwrap_or(0)
                    })
                    .min()
                    .unwrap_or(0);
                let tied: Vec<&&ServiceInstance> = eligible
                    .iter()
                    .filter(|i| {
                        state
                            .instances
                            .get(&i.id())
                            .map(|s| s.in_flight)
                            .unwrap_or(0)
                            == min_in_flight
                    })
                    .collect();
                let index = state.cursor % tied.len();
                state.cursor = state.cursor.wrapping_add(1);
                (*tied[index]).clone()
            }
        };

        let chosen_state = state
            .instances
            .get_mut(&chosen.id())
            .ok_or_else(|| GatewayError::Internal("instance state missing".to_string()))?;
        if !chosen_state.breaker.acquire(now) {
            // Lost the half-open slot between the filter and the pick.
            return Err(GatewayError::UpstreamUnavailable(service_name.to_string()));
        }
        chosen_state.in_flight += 1;

        Ok(chosen)
    }

    /// Report the outcome of an upstream attempt started by `select`.
    pub fn report(&self, service_name: &str, instance_id: &str, outcome: UpstreamOutcome) {
        let Some(entry) = self.services.get(service_name) else {
            return;
        };
        let mut state = entry.lock();
        let Some(instance) = state.instances.get_mut(instance_id) else {
            return;
        };
        instance.in_flight = instance.in_flight.saturating_sub(1);
        match outcome {
            UpstreamOutcome::Success => instance.breaker.record_success(),
            UpstreamOutcome::Failure | UpstreamOutcome::Timeout => {
                instance.breaker.record_failure(Instant::now())
            }
        }
    }

    /// Current circuit state for an instance, if tracked.
    pub fn circuit_state(&self, service_name: &str, instance_id: &str) -> Option<CircuitState> {
        let entry = self.services.get(service_name)?;
        let state = entry.lock();
        state.instances.get(instance_id).map(|s| s.breaker.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;

    async fn registry_with(instances: &[(&str, &str, u16, u32)]) -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new(
            Arc::new(MemoryStore::new()),
            RegistryConfig::default(),
        ));
        for (name, host, port, weight) in instances {
            let mut instance = ServiceInstance::new(*name, *host, *port);
            instance.weight = *weight;
            registry.register(instance).await.unwrap();
        }
        registry
    }

    fn breaker_config(threshold: u32, cooldown: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown,
            max_cooldown: Duration::from_secs(600),
            half_open_max: 1,
        }
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let registry = registry_with(&[
            ("svc", "a.example", 9001, 1),
            ("svc", "b.example", 9001, 1),
            ("svc", "c.example", 9001, 1),
        ])
        .await;
        let lb = LoadBalancer::new(
            LoadBalancingStrategy::RoundRobin,
            true,
            CircuitBreakerConfig::default(),
            registry,
        );

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..9 {
            let instance = lb.select("svc").await.unwrap();
            *counts.entry(instance.id()).or_insert(0) += 1;
            lb.report("svc", &instance.id(), UpstreamOutcome::Success);
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 3));
    }

    #[tokio::test]
    async fn test_selection_order_is_deterministic() {
        let registry = registry_with(&[
            ("svc", "b.example", 9001, 1),
            ("svc", "a.example", 9002, 1),
            ("svc", "a.example", 9001, 1),
        ])
        .await;
        let lb = LoadBalancer::new(
            LoadBalancingStrategy::RoundRobin,
            true,
            CircuitBreakerConfig::default(),
            registry,
        );

        let first = lb.select("svc").await.unwrap();
        let second = lb.select("svc").await.unwrap();
        let third = lb.select("svc").await.unwrap();
        assert_eq!(first.id(), "svc:a.example:9001");
        assert_eq!(second.id(), "svc:a.example:9002");
        assert_eq!(third.id(), "svc:b.example:9001");
    }

    #[tokio::test]
    async fn test_no_instances() {
        let registry = registry_with(&[]).await;
        let lb = LoadBalancer::new(
            LoadBalancingStrategy::RoundRobin,
            true,
            CircuitBreakerConfig::default(),
            registry,
        );
        let err = lb.select("ghost").await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_circuit_trip_excludes_sole_instance() {
        let registry = registry_with(&[("svc", "a.example", 9001, 1)]).await;
        let lb = LoadBalancer::new(
            LoadBalancingStrategy::RoundRobin,
            true,
            breaker_config(3, Duration::from_secs(60)),
            registry,
        );

        for _ in 0..3 {
            let instance = lb.select("svc").await.unwrap();
            lb.report("svc", &instance.id(), UpstreamOutcome::Failure);
        }
        assert_eq!(
            lb.circuit_state("svc", "svc:a.example:9001"),
            Some(CircuitState::Open)
        );
        let err = lb.select("svc").await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_circuit_trip_prefers_other_instance() {
        let registry = registry_with(&[
            ("svc", "a.example", 9001, 1),
            ("svc", "b.example", 9001, 1),
        ])
        .await;
        let lb = LoadBalancer::new(
            LoadBalancingStrategy::RoundRobin,
            true,
            breaker_config(2, Duration::from_secs(60)),
            registry,
        );

        let mut failures = 0;
        while failures < 2 {
            let instance = lb.select("svc").await.unwrap();
            if instance.id() == "svc:a.example:9001" {
                lb.report("svc", &instance.id(), UpstreamOutcome::Failure);
                failures += 1;
            } else {
                lb.report("svc", &instance.id(), UpstreamOutcome::Success);
            }
        }
        assert_eq!(
            lb.circuit_state("svc", "svc:a.example:9001"),
            Some(CircuitState::Open)
        );

        for _ in 0..4 {
            let instance = lb.select("svc").await.unwrap();
            assert_eq!(instance.id(), "svc:b.example:9001");
            lb.report("svc", &instance.id(), UpstreamOutcome::Success);
        }
    }

    #[tokio::test]
    async fn test_half_open_trial_after_cooldown() {
        let registry = registry_with(&[("svc", "a.example", 9001, 1)]).await;
        let lb = LoadBalancer::new(
            LoadBalancingStrategy::RoundRobin,
            true,
            breaker_config(1, Duration::from_millis(30)),
            registry,
        );

        let instance = lb.select("svc").await.unwrap();
        lb.report("svc", &instance.id(), UpstreamOutcome::Timeout);
        assert!(lb.select("svc").await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let trial = lb.select("svc").await.unwrap();
        assert_eq!(
            lb.circuit_state("svc", &trial.id()),
            Some(CircuitState::HalfOpen)
        );
        // Second concurrent trial is refused while the first is in flight.
        assert!(lb.select("svc").await.is_err());

        lb.report("svc", &trial.id(), UpstreamOutcome::Success);
        assert_eq!(
            lb.circuit_state("svc", &trial.id()),
            Some(CircuitState::Closed)
        );
        assert!(lb.select("svc").await.is_ok());
    }

    #[tokio::test]
    async fn test_least_connections_prefers_idle() {
        let registry = registry_with(&[
            ("svc", "a.example", 9001, 1),
            ("svc", "b.example", 9001, 1),
        ])
        .await;
        let lb = LoadBalancer::new(
            LoadBalancingStrategy::LeastConnections,
            true,
            CircuitBreakerConfig::default(),
            registry,
        );

        // First selection goes somewhere and stays in flight.
        let busy = lb.select("svc").await.unwrap();
        // The next selections must avoid the busy instance.
        let other = lb.select("svc").await.unwrap();
        assert_ne!(busy.id(), other.id());
        lb.report("svc", &other.id(), UpstreamOutcome::Success);

        let again = lb.select("svc").await.unwrap();
        assert_eq!(again.id(), other.id());
    }

    #[tokio::test]
    async fn test_weighted_respects_weights() {
        let registry = registry_with(&[
            ("svc", "a.example", 9001, 1),
            ("svc", "b.example", 9001, 9),
        ])
        .await;
        let lb = LoadBalancer::new(
            LoadBalancingStrategy::Weighted,
            true,
            CircuitBreakerConfig::default(),
            registry,
        );

        let mut heavy = 0;
        for _ in 0..200 {
            let instance = lb.select("svc").await.unwrap();
            if instance.host == "b.example" {
                heavy += 1;
            }
            lb.report("svc", &instance.id(), UpstreamOutcome::Success);
        }
        // Expected around 180 of 200; allow generous slack.
        assert!(heavy > 120, "heavy instance chosen only {} times", heavy);
    }
}
