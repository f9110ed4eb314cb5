//! Redis-backed shared store
//!
//! Adapter over a Redis deployment using the async connection manager, which
//! reconnects on its own after transient failures. The sliding-window check
//! runs as a single server-side Lua script so the three steps stay atomic
//! per key across gateway instances.

use super::{PubSubMessage, SharedStore, StreamEntry, WindowReply};
use crate::error::{GatewayError, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, 0, now_ms - window_ms)
local current = redis.call('ZCARD', key)

if current < limit then
    redis.call('ZADD', key, now_ms, now_ms)
    redis.call('PEXPIRE', key, window_ms)
    return {1, limit - current - 1}
else
    return {0, 0}
end
"#;

fn store_err(err: redis::RedisError) -> GatewayError {
    GatewayError::StoreUnavailable(err.to_string())
}

/// Redis implementation of [`SharedStore`].
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    window_script: redis::Script,
}

impl RedisStore {
    /// Connect to the store. Fails fast when the deployment is unreachable
    /// so the composition root can decide how to degrade.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = client.get_connection_manager().await.map_err(store_err)?;
        log::info!("connected to shared store at {}", url);
        Ok(Self {
            client,
            conn,
            window_script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

#[async_trait::async_trait]
impl SharedStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs())
                .await
                .map_err(store_err),
            None => conn.set::<_, _, ()>(key, value).await.map_err(store_err),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(store_err)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(store_err)
    }

    async fn hset_all(&self, key: &str, fields: &HashMap<String, String>) -> Result<()> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(key, &pairs)
            .await
            .map_err(store_err)
    }

    async fn hset_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(store_err)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(store_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64)
            .await
            .map_err(store_err)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.keys(pattern).await.map_err(store_err)
    }

    async fn sliding_window_incr(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: u64,
    ) -> Result<WindowReply> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .window_script
            .key(key)
            .arg(limit)
            .arg(window.as_millis() as u64)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        let allowed = reply.first().copied().unwrap_or(0) == 1;
        let remaining = reply.get(1).copied().unwrap_or(0).max(0) as u32;
        Ok(WindowReply { allowed, remaining })
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
        maxlen: usize,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        conn.xadd_maxlen(stream, StreamMaxlen::Approx(maxlen), "*", &pairs)
            .await
            .map_err(store_err)
    }

    async fn group_create(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, "0")
            .await
        {
            Ok(()) => Ok(()),
            // The group surviving a restart is the normal case.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(store_err)?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::new();
                for (name, value) in id.map {
                    if let Ok(text) = redis::from_redis_value::<String>(value) {
                        fields.insert(name, text);
                    }
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, ()>(stream, group, &[entry_id])
            .await
            .map_err(store_err)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(store_err)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(store_err)?;
        pubsub.psubscribe(pattern).await.map_err(store_err)?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("dropping non-text pubsub payload on {}: {}", channel, e);
                        continue;
                    }
                };
                if tx.send(PubSubMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
            log::debug!("pubsub listener task exiting");
        });
        Ok(rx)
    }
}
