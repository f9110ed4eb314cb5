//! Request metrics
//!
//! Per-request timing, status and path tallies with per-service rollups.
//! Response time samples live in a bounded ring (last 1000 per service) so
//! the p95 is window-limited by construction. Completed requests can
//! additionally be appended to a capped store stream; that path is fed
//! through a bounded channel and drops records rather than ever blocking a
//! request.

use crate::store::SharedStoreRef;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

const SAMPLE_RING_CAPACITY: usize = 1000;
const METRICS_STREAM: &str = "metrics:requests";
const METRICS_STREAM_MAXLEN: usize = 100_000;
const MINUTES_RETAINED: u64 = 24 * 60;
const HOURS_RETAINED: u64 = 30 * 24;
const TOP_PATHS: usize = 10;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Default)]
struct ServiceMetrics {
    total: u64,
    success: u64,
    failure: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
    samples: VecDeque<f64>,
}

impl ServiceMetrics {
    fn record(&mut self, status: u16, elapsed_ms: f64) {
        self.total += 1;
        if status < 400 {
            self.success += 1;
        } else {
            self.failure += 1;
        }
        self.total_ms += elapsed_ms;
        if self.total == 1 || elapsed_ms < self.min_ms {
            self.min_ms = elapsed_ms;
        }
        if elapsed_ms > self.max_ms {
            self.max_ms = elapsed_ms;
        }
        if self.samples.len() == SAMPLE_RING_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed_ms);
    }

    fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((sorted.len() as f64) * 0.95).floor() as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            total_requests: self.total,
            success_rate: if self.total == 0 {
                0.0
            } else {
                self.success as f64 / self.total as f64 * 100.0
            },
            avg_response_ms: if self.total == 0 {
                0.0
            } else {
                self.total_ms / self.total as f64
            },
            p95_response_ms: self.p95(),
            min_response_ms: self.min_ms,
            max_response_ms: self.max_ms,
        }
    }
}

#[derive(Default, Clone, Copy)]
struct WindowTally {
    requests: u64,
    errors: u64,
}

/// One completed request, as persisted to the metrics stream.
struct RequestRecord {
    timestamp: u64,
    method: String,
    path: String,
    status: u16,
    elapsed_ms: f64,
    service: String,
}

impl RequestRecord {
    fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("timestamp".to_string(), self.timestamp.to_string());
        fields.insert("method".to_string(), self.method.clone());
        fields.insert("path".to_string(), self.path.clone());
        fields.insert("status_code".to_string(), self.status.to_string());
        fields.insert("response_time_ms".to_string(), format!("{:.3}", self.elapsed_ms));
        fields.insert("service_name".to_string(), self.service.clone());
        fields
    }
}

/// Per-service rollup in the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub total_requests: u64,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub min_response_ms: f64,
    pub max_response_ms: f64,
}

/// Gateway-level counters in the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub error_rate: f64,
}

/// Full snapshot served by `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub gateway: GatewaySnapshot,
    pub services: HashMap<String, ServiceSnapshot>,
    pub errors: HashMap<String, u64>,
    /// Most-requested paths, busiest first
    pub top_paths: Vec<PathTally>,
    pub timestamp: u64,
}

/// Request count for one path.
#[derive(Debug, Clone, Serialize)]
pub struct PathTally {
    pub path: String,
    pub requests: u64,
}

/// Collector shared across the request pipeline.
pub struct MetricsCollector {
    start_time: Instant,
    slow_threshold: Duration,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    services: DashMap<String, ServiceMetrics>,
    error_counts: DashMap<String, u64>,
    path_counts: DashMap<String, u64>,
    minute_stats: Mutex<BTreeMap<u64, WindowTally>>,
    hour_stats: Mutex<BTreeMap<u64, WindowTally>>,
    persist_tx: Option<mpsc::Sender<RequestRecord>>,
}

impl MetricsCollector {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            slow_threshold,
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            services: DashMap::new(),
            error_counts: DashMap::new(),
            path_counts: DashMap::new(),
            minute_stats: Mutex::new(BTreeMap::new()),
            hour_stats: Mutex::new(BTreeMap::new()),
            persist_tx: None,
        }
    }

    /// Enable best-effort persistence of completed requests to the shared
    /// store. The writer task drains a bounded channel and logs failures.
    pub fn with_persistence(
        mut self,
        store: SharedStoreRef,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestRecord>(1024);
        self.persist_tx = Some(tx);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    record = rx.recv() => {
                        let Some(record) = record else { break };
                        if let Err(err) = store
                            .stream_append(METRICS_STREAM, &record.to_fields(), METRICS_STREAM_MAXLEN)
                            .await
                        {
                            log::debug!("metrics persistence skipped: {}", err);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        self
    }

    /// Mark the start of request handling.
    pub fn record_start(&self) -> Instant {
        Instant::now()
    }

    /// Record a completed request.
    pub fn record_complete(
        &self,
        service: Option<&str>,
        method: &str,
        path: &str,
        status: u16,
        elapsed: Duration,
    ) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        if let Some(service) = service {
            self.services
                .entry(service.to_string())
                .or_default()
                .record(status, elapsed_ms);
        }

        *self.path_counts.entry(path.to_string()).or_insert(0) += 1;
        self.tally_windows(status >= 400);

        if elapsed > self.slow_threshold {
            log::warn!(
                "slow request: {} {} took {:.3}s",
                method,
                path,
                elapsed.as_secs_f64()
            );
        }

        if let Some(tx) = &self.persist_tx {
            let record = RequestRecord {
                timestamp: unix_now(),
                method: method.to_string(),
                path: path.to_string(),
                status,
                elapsed_ms,
                service: service.unwrap_or("").to_string(),
            };
            if tx.try_send(record).is_err() {
                log::debug!("metrics persistence channel full, dropping record");
            }
        }
    }

    /// Record a shaped pipeline error by its machine code.
    pub fn record_error(&self, code: &str) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        *self.error_counts.entry(code.to_string()).or_insert(0) += 1;
    }

    fn tally_windows(&self, is_error: bool) {
        let now = unix_now();
        let minute = now / 60;
        let hour = now / 3600;

        {
            let mut minutes = self.minute_stats.lock();
            let tally = minutes.entry(minute).or_default();
            tally.requests += 1;
            if is_error {
                tally.errors += 1;
            }
            let cutoff = minute.saturating_sub(MINUTES_RETAINED);
            while let Some((&oldest, _)) = minutes.first_key_value() {
                if oldest >= cutoff {
                    break;
                }
                minutes.pop_first();
            }
        }
        {
            let mut hours = self.hour_stats.lock();
            let tally = hours.entry(hour).or_default();
            tally.requests += 1;
            if is_error {
                tally.errors += 1;
            }
            let cutoff = hour.saturating_sub(HOURS_RETAINED);
            while let Some((&oldest, _)) = hours.first_key_value() {
                if oldest >= cutoff {
                    break;
                }
                hours.pop_first();
            }
        }
    }

    /// Point-in-time view of all counters and rollups.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = unix_now();
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_errors = self.total_errors.load(Ordering::Relaxed);

        let requests_per_minute = {
            let minutes = self.minute_stats.lock();
            minutes.get(&(now / 60)).map(|t| t.requests).unwrap_or(0)
        };
        let requests_per_hour = {
            let hours = self.hour_stats.lock();
            hours.get(&(now / 3600)).map(|t| t.requests).unwrap_or(0)
        };

        let services = self
            .services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        let errors = self
            .error_counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let mut top_paths: Vec<PathTally> = self
            .path_counts
            .iter()
            .map(|entry| PathTally {
                path: entry.key().clone(),
                requests: *entry.value(),
            })
            .collect();
        top_paths.sort_by(|a, b| b.requests.cmp(&a.requests).then_with(|| a.path.cmp(&b.path)));
        top_paths.truncate(TOP_PATHS);

        MetricsSnapshot {
            gateway: GatewaySnapshot {
                uptime_seconds: self.start_time.elapsed().as_secs_f64(),
                total_requests,
                total_errors,
                requests_per_minute,
                requests_per_hour,
                error_rate: if total_requests == 0 {
                    0.0
                } else {
                    total_errors as f64 / total_requests as f64 * 100.0
                },
            },
            services,
            errors,
            top_paths,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_rollup() {
        let metrics = MetricsCollector::new(Duration::from_secs(1));
        metrics.record_complete(Some("user"), "GET", "/api/v1/users", 200, Duration::from_millis(10));
        metrics.record_complete(Some("user"), "GET", "/api/v1/users", 200, Duration::from_millis(30));
        metrics.record_complete(Some("user"), "GET", "/api/v1/users", 500, Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        let user = &snapshot.services["user"];
        assert_eq!(user.total_requests, 3);
        assert!((user.success_rate - 66.666).abs() < 0.1);
        assert!((user.avg_response_ms - 20.0).abs() < 0.5);
        assert!(user.min_response_ms <= 10.5);
        assert!(user.max_response_ms >= 29.0);
    }

    #[test]
    fn test_p95_index() {
        let mut service = ServiceMetrics::default();
        for i in 1..=100 {
            service.record(200, i as f64);
        }
        // floor(0.95 * 100) = 95 -> the 96th sorted value.
        assert_eq!(service.p95(), 96.0);
    }

    #[test]
    fn test_sample_ring_is_bounded() {
        let mut service = ServiceMetrics::default();
        for i in 0..(SAMPLE_RING_CAPACITY + 500) {
            service.record(200, i as f64);
        }
        assert_eq!(service.samples.len(), SAMPLE_RING_CAPACITY);
        assert_eq!(service.total, (SAMPLE_RING_CAPACITY + 500) as u64);
    }

    #[test]
    fn test_error_counters() {
        let metrics = MetricsCollector::new(Duration::from_secs(1));
        metrics.record_error("not_found");
        metrics.record_error("not_found");
        metrics.record_error("upstream_timeout");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors["not_found"], 2);
        assert_eq!(snapshot.errors["upstream_timeout"], 1);
        assert_eq!(snapshot.gateway.total_errors, 3);
    }

    #[test]
    fn test_window_tallies() {
        let metrics = MetricsCollector::new(Duration::from_secs(1));
        for _ in 0..5 {
            metrics.record_complete(Some("svc"), "GET", "/x", 200, Duration::from_millis(1));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gateway.requests_per_minute, 5);
        assert_eq!(snapshot.gateway.requests_per_hour, 5);
        assert_eq!(snapshot.gateway.total_requests, 5);
    }

    #[test]
    fn test_path_tallies_busiest_first() {
        let metrics = MetricsCollector::new(Duration::from_secs(1));
        for _ in 0..3 {
            metrics.record_complete(Some("svc"), "GET", "/api/v1/a", 200, Duration::from_millis(1));
        }
        metrics.record_complete(Some("svc"), "GET", "/api/v1/b", 200, Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.top_paths.len(), 2);
        assert_eq!(snapshot.top_paths[0].path, "/api/v1/a");
        assert_eq!(snapshot.top_paths[0].requests, 3);
        assert_eq!(snapshot.top_paths[1].path, "/api/v1/b");
        assert_eq!(snapshot.top_paths[1].requests, 1);
    }

    #[test]
    fn test_top_paths_is_bounded() {
        let metrics = MetricsCollector::new(Duration::from_secs(1));
        for i in 0..(TOP_PATHS + 5) {
            metrics.record_complete(
                Some("svc"),
                "GET",
                &format!("/api/v1/p{}", i),
                200,
                Duration::from_millis(1),
            );
        }
        assert_eq!(metrics.snapshot().top_paths.len(), TOP_PATHS);
    }
}
