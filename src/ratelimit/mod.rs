//! Rate limiter
//!
//! Sliding-window admission keyed by client identity, with per-path-prefix
//! policy overrides resolved longest-prefix first. Window state lives either
//! in process or in the shared store; the shared backend carries an
//! in-process twin it falls back to whenever the store is unreachable, so a
//! store outage loosens cross-instance coordination instead of dropping
//! admission control entirely.

use crate::config::{RateLimitConfig, RateLimitStore};
use crate::error::Result;
use crate::store::{SharedStoreRef, WindowReply};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Admission policy for one path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
}

/// Outcome of an admission check, carried through to the response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the window can admit again; meaningful when denied
    pub retry_after: u64,
    /// Unix timestamp when the current window resets
    pub reset_at: u64,
}

impl RateDecision {
    fn unlimited(limit: u32, window: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            retry_after: 0,
            reset_at: unix_secs() + window.as_secs(),
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-process sliding windows, one timestamp deque per key. The per-key
/// mutex makes the trim/count/insert sequence atomic.
struct MemoryWindows {
    buckets: DashMap<String, Arc<Mutex<VecDeque<u64>>>>,
}

impl MemoryWindows {
    fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    fn check(&self, key: &str, limit: u32, window: Duration, now_ms: u64) -> WindowReply {
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone();

        let mut timestamps = bucket.lock();
        let horizon = now_ms.saturating_sub(window.as_millis() as u64);
        while timestamps.front().map(|&t| t <= horizon).unwrap_or(false) {
            timestamps.pop_front();
        }

        let current = timestamps.len() as u32;
        if current < limit {
            timestamps.push_back(now_ms);
            WindowReply {
                allowed: true,
                remaining: limit - current - 1,
            }
        } else {
            WindowReply {
                allowed: false,
                remaining: 0,
            }
        }
    }
}

/// Sliding-window rate limiter with per-path policies.
pub struct RateLimiter {
    enabled: bool,
    default_policy: RateLimitPolicy,
    /// Sorted longest-prefix-first, lexicographic within a length
    path_policies: RwLock<Vec<(String, RateLimitPolicy)>>,
    store: Option<SharedStoreRef>,
    local: MemoryWindows,
}

impl RateLimiter {
    /// Build a limiter. `store` is consulted when the configuration selects
    /// the shared backend; the in-process windows are always kept as the
    /// fallback.
    pub fn new(config: &RateLimitConfig, store: Option<SharedStoreRef>) -> Self {
        let store = match config.store {
            RateLimitStore::Shared => store,
            RateLimitStore::Memory => None,
        };
        Self {
            enabled: config.enabled,
            default_policy: RateLimitPolicy {
                limit: config.default_limit,
                window: config.window,
            },
            path_policies: RwLock::new(Vec::new()),
            store,
            local: MemoryWindows::new(),
        }
    }

    /// Add or replace the policy for a path prefix.
    pub fn set_path_limit(&self, prefix: impl Into<String>, policy: RateLimitPolicy) {
        let prefix = prefix.into();
        let mut policies = self.path_policies.write();
        policies.retain(|(p, _)| *p != prefix);
        policies.push((prefix, policy));
        policies.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    /// Remove a path prefix override.
    pub fn remove_path_limit(&self, prefix: &str) {
        self.path_policies.write().retain(|(p, _)| p != prefix);
    }

    /// Longest-prefix policy resolution, falling back to the default.
    pub fn policy_for(&self, path: &str) -> RateLimitPolicy {
        let policies = self.path_policies.read();
        for (prefix, policy) in policies.iter() {
            if path.starts_with(prefix.as_str()) {
                return *policy;
            }
        }
        self.default_policy
    }

    /// Evaluate the applicable policy for `key` on `path`.
    pub async fn admit(&self, key: &str, path: &str) -> RateDecision {
        let policy = self.policy_for(path);
        if !self.enabled {
            return RateDecision::unlimited(policy.limit, policy.window);
        }

        let now_ms = unix_millis();
        let store_key = format!("ratelimit:{}", key);

        let reply = match &self.store {
            Some(store) => {
                match store
                    .sliding_window_incr(&store_key, policy.limit, policy.window, now_ms)
                    .await
                {
                    Ok(reply) => reply,
                    Err(err) => {
                        log::warn!(
                            "shared rate limit check failed, falling back to in-memory: {}",
                            err
                        );
                        self.local.check(&store_key, policy.limit, policy.window, now_ms)
                    }
                }
            }
            None => self.local.check(&store_key, policy.limit, policy.window, now_ms),
        };

        let window_secs = policy.window.as_secs().max(1);
        RateDecision {
            allowed: reply.allowed,
            limit: policy.limit,
            remaining: reply.remaining,
            retry_after: if reply.allowed { 0 } else { window_secs },
            reset_at: unix_secs() + window_secs,
        }
    }
}

/// Derive the admission key from client ip and optional user id.
pub fn rate_limit_key(client_ip: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user) => format!("{}:{}", client_ip, user),
        None => client_ip.to_string(),
    }
}
