//! Shared store client
//!
//! Thin adapter over the external key-value + stream + pub/sub store that
//! the registry, rate limiter, event bus and WebSocket fabric coordinate
//! through. The trait has two implementations: a Redis adapter and an
//! in-memory fake. Connection failures surface as `StoreUnavailable` and
//! callers degrade per their own rules rather than crashing.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One entry read from a stream by a consumer group member.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Store-assigned entry id, used for acknowledgement
    pub id: String,
    /// Flat field map as written by `stream_append`
    pub fields: HashMap<String, String>,
}

/// One message delivered to a pattern subscriber.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Outcome of the atomic sliding-window check.
#[derive(Debug, Clone, Copy)]
pub struct WindowReply {
    /// Whether the request was admitted into the window
    pub allowed: bool,
    /// Admissions left in the current window after this call
    pub remaining: u32,
}

/// Shared store operations. All async; every failure is `StoreUnavailable`.
#[async_trait::async_trait]
pub trait SharedStore: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<()>;

    async fn hset_field(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Returns an empty map when the key does not exist.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// List keys matching a glob pattern. Used by the registry sweep; the
    /// key space for these patterns is small and namespaced.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Atomic sliding-window admission: drop timestamps outside the window,
    /// admit and record `now_ms` if the cardinality is below `limit`.
    /// The three steps are indivisible per key.
    async fn sliding_window_incr(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: u64,
    ) -> Result<WindowReply>;

    /// Append to a stream, trimming it to roughly `maxlen` entries.
    /// Returns the assigned entry id.
    async fn stream_append(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
        maxlen: usize,
    ) -> Result<String>;

    /// Create a consumer group at the start of a stream. Creating a group
    /// that already exists is not an error.
    async fn group_create(&self, stream: &str, group: &str) -> Result<()>;

    /// Read new entries for a consumer group, blocking up to `block`.
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge a delivered entry for a group.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()>;

    /// Fire-and-forget publish on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to all channels matching a glob pattern. The receiver is
    /// fed by a background task for the life of the subscription.
    async fn psubscribe(&self, pattern: &str) -> Result<mpsc::Receiver<PubSubMessage>>;
}

pub type SharedStoreRef = Arc<dyn SharedStore>;

/// Glob match supporting `*` wildcards, enough for the namespaced key
/// patterns used here (`services:*`, `ws:*`, `services:name:*`).
pub(crate) fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*'
    true
}
