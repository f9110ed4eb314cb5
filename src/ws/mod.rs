//! WebSocket message bus
//!
//! Authenticated WebSocket connections with per-connection topic
//! subscriptions, permission-checked subscribes, local fan-out and
//! cross-instance fan-out over the shared store's pub/sub. The connection
//! table and the topic index are guarded by a single mutex held only for
//! map operations; actual sends go through a per-connection channel drained
//! by one writer task per socket.

use crate::auth::{Authenticator, UserContext};
use crate::error::{GatewayError, Result};
use crate::store::SharedStoreRef;
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
const SEND_QUEUE_CAPACITY: usize = 128;
const WS_CHANNEL_PREFIX: &str = "ws:";

/// Message delivered to topic subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub topic: Option<String>,
    pub payload: serde_json::Value,
    pub sender_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WsMessage {
    fn topic_message(topic: &str, payload: serde_json::Value, sender_id: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: "topic_message".to_string(),
            topic: Some(topic.to_string()),
            payload,
            sender_id: sender_id.map(|s| s.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Envelope used on the cross-instance pub/sub channel. `origin` lets the
/// publishing instance ignore its own broadcast, which was already fanned
/// out locally.
#[derive(Debug, Serialize, Deserialize)]
struct CrossInstanceEnvelope {
    origin: String,
    message: WsMessage,
}

/// Inbound client frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Authenticate {
        token: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Heartbeat,
}

struct Connection {
    user: Option<UserContext>,
    connected_at: DateTime<Utc>,
    last_heartbeat: Instant,
    subscriptions: HashSet<String>,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct WsTables {
    connections: HashMap<String, Connection>,
    /// topic -> subscribed connection ids
    subscriptions: HashMap<String, HashSet<String>>,
}

/// Statistics served by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct WsStats {
    pub uptime_seconds: f64,
    pub current_connections: usize,
    pub total_connections_ever: u64,
    pub total_messages: u64,
    pub active_topics: usize,
}

/// WebSocket fabric shared across the gateway.
pub struct WsBus {
    authenticator: Arc<Authenticator>,
    store: Option<SharedStoreRef>,
    origin: String,
    tables: Mutex<WsTables>,
    public_topics: HashSet<String>,
    started_at: Instant,
    total_connections: AtomicU64,
    total_messages: AtomicU64,
}

impl WsBus {
    pub fn new(authenticator: Arc<Authenticator>, store: Option<SharedStoreRef>) -> Self {
        let public_topics = ["system", "announcements", "general"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        Self {
            authenticator,
            store,
            origin: uuid::Uuid::new_v4().to_string(),
            tables: Mutex::new(WsTables::default()),
            public_topics,
            started_at: Instant::now(),
            total_connections: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
        }
    }

    /// Drive one accepted socket until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, connection_id: String) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<String>(SEND_QUEUE_CAPACITY);

        // Single writer per socket; it also emits the close frame when the
        // connection is dropped from the table.
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        {
            let mut tables = self.tables.lock();
            tables.connections.insert(
                connection_id.clone(),
                Connection {
                    user: None,
                    connected_at: Utc::now(),
                    last_heartbeat: Instant::now(),
                    subscriptions: HashSet::new(),
                    tx: tx.clone(),
                },
            );
        }
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("ws connection established: {}", connection_id);

        self.send_frame(
            &connection_id,
            serde_json::json!({
                "type": "connection_established",
                "connection_id": connection_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    self.touch(&connection_id);
                    self.handle_frame(&connection_id, &text).await;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    self.touch(&connection_id);
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(Message::Binary(_)) => {
                    self.touch(&connection_id);
                    self.send_error(&connection_id, "unknown_message_type", "binary frames are not supported");
                }
            }
        }

        self.disconnect(&connection_id);
        // The writer drains and closes once every sender is gone.
        drop(tx);
        let _ = writer.await;
        log::info!("ws connection closed: {}", connection_id);
    }

    async fn handle_frame(&self, connection_id: &str, text: &str) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => {
                let kind = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t.to_string()));
                match kind {
                    Some(kind) => {
                        self.send_error(
                            connection_id,
                            "unknown_message_type",
                            &format!("unknown message type: {}", kind),
                        );
                    }
                    None => {
                        self.send_error(connection_id, "bad_request", "malformed message");
                    }
                }
                return;
            }
        };

        match frame {
            ClientFrame::Authenticate { token } => self.authenticate(connection_id, &token),
            ClientFrame::Subscribe { topic } => {
                if let Err(err) = self.subscribe(connection_id, &topic) {
                    self.send_error(connection_id, err.code(), &err.to_string());
                }
            }
            ClientFrame::Unsubscribe { topic } => {
                self.unsubscribe(connection_id, &topic);
            }
            ClientFrame::Publish { topic, payload } => {
                if !self.can_publish(connection_id, &topic) {
                    self.send_error(
                        connection_id,
                        "auth_required",
                        "authenticate before publishing to non-public topics",
                    );
                    return;
                }
                self.publish(&topic, payload, Some(connection_id)).await;
            }
            ClientFrame::Heartbeat => {
                self.send_frame(
                    connection_id,
                    serde_json::json!({
                        "type": "heartbeat_ack",
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                );
            }
        }
    }

    fn authenticate(&self, connection_id: &str, token: &str) {
        match self.authenticator.verify_access(token) {
            Ok(user) => {
                let user_id = user.user_id.clone();
                let roles = user.roles.clone();
                if let Some(conn) = self.tables.lock().connections.get_mut(connection_id) {
                    conn.user = Some(user);
                }
                log::info!("ws connection {} authenticated as {}", connection_id, user_id);
                self.send_frame(
                    connection_id,
                    serde_json::json!({
                        "type": "auth_success",
                        "user_id": user_id,
                        "roles": roles,
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                );
            }
            Err(err) => {
                self.send_frame(
                    connection_id,
                    serde_json::json!({
                        "type": "auth_error",
                        "code": err.code(),
                        "message": err.to_string(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                );
            }
        }
    }

    /// Whether `topic` is subscribable by the connection's current identity.
    fn permits_subscription(&self, user: Option<&UserContext>, topic: &str) -> bool {
        if self.public_topics.contains(topic) {
            return true;
        }
        let Some(user) = user else {
            return false;
        };
        if let Some(owner) = topic.strip_prefix("user:") {
            return owner == user.user_id;
        }
        if let Some(role) = topic.strip_prefix("role:") {
            return user.has_role(role);
        }
        if let Some(permission) = topic.strip_prefix("permission:") {
            return user.has_permission(permission);
        }
        false
    }

    fn can_publish(&self, connection_id: &str, topic: &str) -> bool {
        if self.public_topics.contains(topic) {
            return true;
        }
        self.tables
            .lock()
            .connections
            .get(connection_id)
            .map(|c| c.user.is_some())
            .unwrap_or(false)
    }

    /// Subscribe a connection to a topic after the permission check.
    pub fn subscribe(&self, connection_id: &str, topic: &str) -> Result<()> {
        {
            let mut tables = self.tables.lock();
            let Some(conn) = tables.connections.get(connection_id) else {
                return Err(GatewayError::NotFound(connection_id.to_string()));
            };
            if !self.permits_subscription(conn.user.as_ref(), topic) {
                log::warn!(
                    "ws subscription denied: {} -> {}",
                    connection_id,
                    topic
                );
                return Err(GatewayError::SubscriptionDenied(topic.to_string()));
            }
            tables
                .subscriptions
                .entry(topic.to_string())
                .or_default()
                .insert(connection_id.to_string());
            if let Some(conn) = tables.connections.get_mut(connection_id) {
                conn.subscriptions.insert(topic.to_string());
            }
        }
        log::debug!("ws subscribe: {} -> {}", connection_id, topic);
        self.send_frame(
            connection_id,
            serde_json::json!({
                "type": "subscription_confirmed",
                "topic": topic,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        Ok(())
    }

    /// Drop a connection's subscription to a topic.
    pub fn unsubscribe(&self, connection_id: &str, topic: &str) {
        {
            let mut tables = self.tables.lock();
            if let Some(subscribers) = tables.subscriptions.get_mut(topic) {
                subscribers.remove(connection_id);
                if subscribers.is_empty() {
                    tables.subscriptions.remove(topic);
                }
            }
            if let Some(conn) = tables.connections.get_mut(connection_id) {
                conn.subscriptions.remove(topic);
            }
        }
        self.send_frame(
            connection_id,
            serde_json::json!({
                "type": "unsubscription_confirmed",
                "topic": topic,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
    }

    /// Publish to a topic: local fan-out (excluding the sender) plus a
    /// cross-instance broadcast when a store is configured. Returns the
    /// number of local deliveries.
    pub async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        sender_id: Option<&str>,
    ) -> usize {
        let message = WsMessage::topic_message(topic, payload, sender_id);
        self.total_messages.fetch_add(1, Ordering::Relaxed);

        let delivered = self.distribute_local(&message, sender_id);

        if let Some(store) = &self.store {
            let envelope = CrossInstanceEnvelope {
                origin: self.origin.clone(),
                message: message.clone(),
            };
            match serde_json::to_string(&envelope) {
                Ok(raw) => {
                    let channel = format!("{}{}", WS_CHANNEL_PREFIX, topic);
                    if let Err(err) = store.publish(&channel, &raw).await {
                        log::warn!("cross-instance ws publish skipped: {}", err);
                    }
                }
                Err(err) => log::warn!("ws envelope serialization failed: {}", err),
            }
        }
        delivered
    }

    fn distribute_local(&self, message: &WsMessage, exclude: Option<&str>) -> usize {
        let Some(topic) = message.topic.as_deref() else {
            return 0;
        };
        let Ok(raw) = serde_json::to_string(message) else {
            return 0;
        };

        // Collect receivers under the lock, send after releasing it.
        let targets: Vec<mpsc::Sender<String>> = {
            let tables = self.tables.lock();
            match tables.subscriptions.get(topic) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|id| Some(id.as_str()) != exclude)
                    .filter_map(|id| tables.connections.get(id).map(|c| c.tx.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.try_send(raw.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Remove a connection and all its subscriptions.
    pub fn disconnect(&self, connection_id: &str) {
        let mut tables = self.tables.lock();
        if let Some(conn) = tables.connections.remove(connection_id) {
            for topic in &conn.subscriptions {
                if let Some(subscribers) = tables.subscriptions.get_mut(topic) {
                    subscribers.remove(connection_id);
                    if subscribers.is_empty() {
                        tables.subscriptions.remove(topic);
                    }
                }
            }
            log::debug!(
                "ws connection {} removed, connected since {}",
                connection_id,
                conn.connected_at.to_rfc3339()
            );
        }
    }

    fn touch(&self, connection_id: &str) {
        if let Some(conn) = self.tables.lock().connections.get_mut(connection_id) {
            conn.last_heartbeat = Instant::now();
        }
    }

    fn send_frame(&self, connection_id: &str, frame: serde_json::Value) {
        let tx = {
            let tables = self.tables.lock();
            tables.connections.get(connection_id).map(|c| c.tx.clone())
        };
        if let Some(tx) = tx {
            if tx.try_send(frame.to_string()).is_err() {
                log::warn!("ws send queue full or closed for {}", connection_id);
            }
        }
    }

    fn send_error(&self, connection_id: &str, code: &str, message: &str) {
        self.send_frame(
            connection_id,
            serde_json::json!({
                "type": "error",
                "code": code,
                "message": message,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
    }

    pub fn stats(&self) -> WsStats {
        let tables = self.tables.lock();
        WsStats {
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            current_connections: tables.connections.len(),
            total_connections_ever: self.total_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            active_topics: tables.subscriptions.len(),
        }
    }

    /// Spawn the heartbeat sweep and, when a store is configured, the
    /// cross-instance pub/sub listener.
    pub fn spawn_background(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        {
            let bus = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(HEARTBEAT_SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let stale: Vec<String> = {
                                let tables = bus.tables.lock();
                                tables
                                    .connections
                                    .iter()
                                    .filter(|(_, c)| c.last_heartbeat.elapsed() > HEARTBEAT_TIMEOUT)
                                    .map(|(id, _)| id.clone())
                                    .collect()
                            };
                            for id in stale {
                                log::info!("ws heartbeat timeout, disconnecting {}", id);
                                bus.disconnect(&id);
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        if let Some(store) = self.store.clone() {
            let bus = Arc::clone(self);
            let mut shutdown = shutdown;
            tasks.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let mut rx = match store.psubscribe(&format!("{}*", WS_CHANNEL_PREFIX)).await {
                        Ok(rx) => rx,
                        Err(err) => {
                            log::warn!("ws pubsub subscribe failed: {}", err);
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                                _ = shutdown.changed() => break,
                            }
                        }
                    };
                    loop {
                        tokio::select! {
                            msg = rx.recv() => {
                                let Some(msg) = msg else { break };
                                let envelope: CrossInstanceEnvelope =
                                    match serde_json::from_str(&msg.payload) {
                                        Ok(envelope) => envelope,
                                        Err(err) => {
                                            log::warn!("dropping malformed ws envelope: {}", err);
                                            continue;
                                        }
                                    };
                                if envelope.origin == bus.origin {
                                    continue;
                                }
                                let exclude = envelope.message.sender_id.clone();
                                bus.distribute_local(&envelope.message, exclude.as_deref());
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                }
            }));
        }

        tasks
    }

    /// Close every connection, typically during shutdown. Dropping the send
    /// side makes each writer task emit its close frame.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.tables.lock().connections.keys().cloned().collect();
        for id in ids {
            self.disconnect(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_bus(store: Option<SharedStoreRef>) -> Arc<WsBus> {
        let authenticator = Arc::new(Authenticator::new(
            "test-secret-for-unit-tests",
            "HS256",
            Duration::from_secs(1800),
            Duration::from_secs(3600),
        ));
        Arc::new(WsBus::new(authenticator, store))
    }

    impl WsBus {
        /// Register a connection without a real socket; the receiver sees
        /// exactly what the writer task would send.
        fn register_test_connection(
            &self,
            id: &str,
            user: Option<UserContext>,
        ) -> mpsc::Receiver<String> {
            let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
            self.tables.lock().connections.insert(
                id.to_string(),
                Connection {
                    user,
                    connected_at: Utc::now(),
                    last_heartbeat: Instant::now(),
                    subscriptions: HashSet::new(),
                    tx,
                },
            );
            rx
        }
    }

    fn trader_context(user_id: &str) -> UserContext {
        UserContext {
            user_id: user_id.to_string(),
            username: format!("{}-name", user_id),
            roles: vec!["trader".to_string()],
            permissions: vec!["trading:read".to_string()],
        }
    }

    fn next_frame(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        let raw = rx.try_recv().expect("expected a frame");
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_public_topic_subscription_without_auth() {
        let bus = test_bus(None);
        let mut rx = bus.register_test_connection("c1", None);
        bus.subscribe("c1", "system").unwrap();
        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "subscription_confirmed");
        assert_eq!(frame["topic"], "system");
    }

    #[tokio::test]
    async fn test_private_topic_requires_auth() {
        let bus = test_bus(None);
        let _rx = bus.register_test_connection("c1", None);
        let err = bus.subscribe("c1", "user:u1").unwrap_err();
        assert_eq!(err.code(), "subscription_denied");
    }

    #[tokio::test]
    async fn test_permission_predicate() {
        let bus = test_bus(None);
        let user = trader_context("u1");

        assert!(bus.permits_subscription(Some(&user), "user:u1"));
        assert!(!bus.permits_subscription(Some(&user), "user:u2"));
        assert!(bus.permits_subscription(Some(&user), "role:trader"));
        assert!(!bus.permits_subscription(Some(&user), "role:admin"));
        assert!(bus.permits_subscription(Some(&user), "permission:trading:read"));
        assert!(!bus.permits_subscription(Some(&user), "permission:system:admin"));
        assert!(bus.permits_subscription(None, "announcements"));
        assert!(!bus.permits_subscription(None, "private-topic"));
    }

    #[tokio::test]
    async fn test_publish_excludes_sender() {
        let bus = test_bus(None);
        let mut rx_a = bus.register_test_connection("a", None);
        let mut rx_b = bus.register_test_connection("b", None);
        bus.subscribe("a", "system").unwrap();
        bus.subscribe("b", "system").unwrap();
        // Drain confirmations.
        let _ = next_frame(&mut rx_a);
        let _ = next_frame(&mut rx_b);

        let delivered = bus
            .publish("system", serde_json::json!({"text": "hi"}), Some("a"))
            .await;
        assert_eq!(delivered, 1);

        let frame = next_frame(&mut rx_b);
        assert_eq!(frame["type"], "topic_message");
        assert_eq!(frame["topic"], "system");
        assert_eq!(frame["payload"]["text"], "hi");
        assert_eq!(frame["sender_id"], "a");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = test_bus(None);
        let mut rx = bus.register_test_connection("c1", None);
        bus.subscribe("c1", "general").unwrap();
        let _ = next_frame(&mut rx);

        bus.unsubscribe("c1", "general");
        let _ = next_frame(&mut rx); // unsubscription_confirmed

        bus.publish("general", serde_json::json!({}), None).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.stats().active_topics, 0);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_subscriptions() {
        let bus = test_bus(None);
        let _rx = bus.register_test_connection("c1", Some(trader_context("u1")));
        bus.subscribe("c1", "user:u1").unwrap();
        bus.subscribe("c1", "system").unwrap();
        assert_eq!(bus.stats().active_topics, 2);

        bus.disconnect("c1");
        let stats = bus.stats();
        assert_eq!(stats.current_connections, 0);
        assert_eq!(stats.active_topics, 0);
    }

    #[tokio::test]
    async fn test_cross_instance_fanout() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let bus_a = test_bus(Some(store.clone()));
        let bus_b = test_bus(Some(store));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = bus_b.spawn_background(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut rx = bus_b.register_test_connection("remote", None);
        bus_b.subscribe("remote", "system").unwrap();
        let _ = next_frame(&mut rx);

        bus_a
            .publish("system", serde_json::json!({"text": "cross"}), Some("local"))
            .await;

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no cross-instance delivery")
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["payload"]["text"], "cross");

        let _ = shutdown_tx.send(true);
        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_origin_instance_skips_own_broadcast() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let bus = test_bus(Some(store));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = bus.spawn_background(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut rx = bus.register_test_connection("sub", None);
        bus.subscribe("sub", "system").unwrap();
        let _ = next_frame(&mut rx);

        bus.publish("system", serde_json::json!({"n": 1}), None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Exactly one local delivery, no echo through pub/sub.
        let first = rx.try_recv();
        assert!(first.is_ok());
        assert!(rx.try_recv().is_err());

        let _ = shutdown_tx.send(true);
        for task in tasks {
            task.abort();
        }
    }
}
