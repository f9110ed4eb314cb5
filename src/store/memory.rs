//! In-memory shared store
//!
//! A faithful single-process stand-in for the external store: TTLs are
//! honored lazily on read, streams keep per-group delivery cursors, and
//! pub/sub rides a broadcast channel. This is the seam the property and
//! integration tests run against, and the fallback when no store URL is
//! configured.

use super::{glob_match, PubSubMessage, SharedStore, StreamEntry, WindowReply};
use crate::error::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

#[derive(Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

struct StoredStream {
    entries: VecDeque<(u64, StreamEntry)>,
    next_seq: u64,
    /// group -> sequence number of the last delivered entry
    group_cursors: HashMap<String, u64>,
    acked: HashSet<(String, String)>,
}

impl StoredStream {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
            group_cursors: HashMap::new(),
            acked: HashSet::new(),
        }
    }
}

/// In-memory implementation of [`SharedStore`].
pub struct MemoryStore {
    strings: DashMap<String, Expiring<String>>,
    hashes: DashMap<String, Expiring<HashMap<String, String>>>,
    windows: DashMap<String, Arc<Mutex<VecDeque<u64>>>>,
    streams: Mutex<HashMap<String, StoredStream>>,
    pubsub_tx: broadcast::Sender<PubSubMessage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (pubsub_tx, _) = broadcast::channel(1024);
        Self {
            strings: DashMap::new(),
            hashes: DashMap::new(),
            windows: DashMap::new(),
            streams: Mutex::new(HashMap::new()),
            pubsub_tx,
        }
    }

    fn live_string(&self, key: &str) -> Option<String> {
        let entry = self.strings.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.strings.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_string(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.strings
            .insert(key.to_string(), Expiring::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.windows.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.live_string(key).is_some() {
            return Ok(true);
        }
        if let Some(entry) = self.hashes.get(key) {
            if !entry.is_expired() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        // Overwrites preserve an existing TTL, matching HSET on a live key.
        let expires_at = self
            .hashes
            .get(key)
            .filter(|e| !e.is_expired())
            .and_then(|e| e.expires_at);
        self.hashes.insert(
            key.to_string(),
            Expiring {
                value: fields.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn hset_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(HashMap::new(), None));
        if entry.is_expired() {
            entry.value.clear();
            entry.expires_at = None;
        }
        entry.value.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        match self.hashes.get(key) {
            Some(entry) if !entry.is_expired() => Ok(entry.value.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let at = Instant::now() + ttl;
        if let Some(mut entry) = self.strings.get_mut(key) {
            entry.expires_at = Some(at);
        }
        if let Some(mut entry) = self.hashes.get_mut(key) {
            entry.expires_at = Some(at);
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = Vec::new();
        for entry in self.strings.iter() {
            if !entry.is_expired() && glob_match(pattern, entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        for entry in self.hashes.iter() {
            if !entry.is_expired() && glob_match(pattern, entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn sliding_window_incr(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: u64,
    ) -> Result<WindowReply> {
        let bucket = self
            .windows
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
            Ok(WindowReply {
                allowed: true,
                remaining: limit - current - 1,
            })
        } else {
            Ok(WindowReply {
                allowed: false,
                remaining: 0,
            })
        }
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
        maxlen: usize,
    ) -> Result<String> {
        let mut streams = self.streams.lock();
        let state = streams
            .entry(stream.to_string())
            .or_insert_with(StoredStream::new);

        let seq = state.next_seq;
        state.next_seq += 1;
        let id = format!("{}-0", seq);
        state.entries.push_back((
            seq,
            StreamEntry {
                id: id.clone(),
                fields: fields.clone(),
            },
        ));
        while state.entries.len() > maxlen {
            state.entries.pop_front();
        }
        Ok(id)
    }

    async fn group_create(&self, stream: &str, group: &str) -> Result<()> {
        let mut streams = self.streams.lock();
        let state = streams
            .entry(stream.to_string())
            .or_insert_with(StoredStream::new);
        state.group_cursors.entry(group.to_string()).or_insert(0);
        Ok(())
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut streams = self.streams.lock();
                if let Some(state) = streams.get_mut(stream) {
                    let cursor = *state.group_cursors.entry(group.to_string()).or_insert(0);
                    let fresh: Vec<StreamEntry> = state
                        .entries
                        .iter()
                        .filter(|(seq, _)| *seq > cursor)
                        .take(count)
                        .map(|(_, e)| e.clone())
                        .collect();
                    if !fresh.is_empty() {
                        let last_seq = state
                            .entries
                            .iter()
                            .filter(|(seq, _)| *seq > cursor)
                            .take(count)
                            .map(|(seq, _)| *seq)
                            .max()
                            .unwrap_or(cursor);
                        state.group_cursors.insert(group.to_string(), last_seq);
                        return Ok(fresh);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream) {
            state
                .acked
                .insert((group.to_string(), entry_id.to_string()));
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No subscribers is fine; the send result is irrelevant.
        let _ = self.pubsub_tx.send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        let (tx, rx) = mpsc::channel(256);
        let mut source = self.pubsub_tx.subscribe();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(msg) => {
                        if glob_match(&pattern, &msg.channel) && tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("pubsub subscriber lagged, dropped {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}
