//! Event bus
//!
//! Durable at-least-once event fabric over the shared store's stream
//! support. Publishing appends to one capped stream and writes a detail
//! record with longer retention for replay. Each process consumes through
//! its own consumer group, skips events it published itself, and dispatches
//! to registered handlers sequentially with per-handler timeout and
//! exponential-backoff retries. Handlers must be idempotent; exhausted
//! retries are recorded and the entry is acknowledged so one poisoned event
//! cannot block the stream.

use crate::error::{GatewayError, Result};
use crate::store::{SharedStoreRef, StreamEntry};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const EVENT_STREAM: &str = "events";
const EVENT_STREAM_MAXLEN: usize = 1_000_000;
const EVENT_DETAIL_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const RESULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const READ_BATCH: usize = 10;
const READ_BLOCK: Duration = Duration::from_secs(1);

/// Immutable domain event as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default)]
    pub producer_service: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DomainEvent {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            payload,
            occurred_at: Utc::now(),
            version: 1,
            correlation_id: None,
            causation_id: None,
            producer_service: String::new(),
            metadata: HashMap::new(),
        }
    }

    fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("event_id".to_string(), self.event_id.clone());
        fields.insert("event_type".to_string(), self.event_type.clone());
        fields.insert("aggregate_id".to_string(), self.aggregate_id.clone());
        fields.insert("aggregate_type".to_string(), self.aggregate_type.clone());
        fields.insert("payload".to_string(), self.payload.to_string());
        fields.insert("occurred_at".to_string(), self.occurred_at.to_rfc3339());
        fields.insert("version".to_string(), self.version.to_string());
        if let Some(id) = &self.correlation_id {
            fields.insert("correlation_id".to_string(), id.clone());
        }
        if let Some(id) = &self.causation_id {
            fields.insert("causation_id".to_string(), id.clone());
        }
        fields.insert("producer_service".to_string(), self.producer_service.clone());
        fields.insert(
            "metadata".to_string(),
            serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_string()),
        );
        fields
    }

    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let get = |k: &str| fields.get(k).cloned();
        Some(Self {
            event_id: get("event_id")?,
            event_type: get("event_type")?,
            aggregate_id: get("aggregate_id").unwrap_or_default(),
            aggregate_type: get("aggregate_type").unwrap_or_default(),
            payload: get("payload")
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or(serde_json::Value::Null),
            occurred_at: get("occurred_at")
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            version: get("version").and_then(|v| v.parse().ok()).unwrap_or(1),
            correlation_id: get("correlation_id"),
            causation_id: get("causation_id"),
            producer_service: get("producer_service").unwrap_or_default(),
            metadata: get("metadata")
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default(),
        })
    }
}

/// Application hook invoked for matching events.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

struct HandlerRegistration {
    handler_id: String,
    handler: Arc<dyn EventHandler>,
    max_retries: u32,
    timeout: Duration,
}

/// Counters exposed by [`EventBus::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct EventBusStats {
    pub service_name: String,
    pub published_events: u64,
    pub processed_events: u64,
    pub failed_events: u64,
    pub registered_handlers: HashMap<String, usize>,
}

/// Event bus bound to one service process.
pub struct EventBus {
    store: SharedStoreRef,
    service_name: String,
    handlers: RwLock<HashMap<String, Vec<HandlerRegistration>>>,
    processing: Mutex<HashSet<String>>,
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl EventBus {
    pub fn new(store: SharedStoreRef, service_name: impl Into<String>) -> Self {
        Self {
            store,
            service_name: service_name.into(),
            handlers: RwLock::new(HashMap::new()),
            processing: Mutex::new(HashSet::new()),
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn group(&self) -> String {
        format!("service_{}", self.service_name)
    }

    /// Register an in-process handler for an event type.
    pub fn register_handler(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        max_retries: u32,
        timeout: Duration,
    ) {
        let event_type = event_type.into();
        let mut handlers = self.handlers.write();
        let list = handlers.entry(event_type.clone()).or_default();
        let handler_id = format!("{}_{}_{}", self.service_name, event_type, list.len());
        log::info!("registered event handler {}", handler_id);
        list.push(HandlerRegistration {
            handler_id,
            handler,
            max_retries,
            timeout,
        });
    }

    /// Publish an event: append to the shared stream and write the detail
    /// record. Fails fast when the store is down; nothing is buffered.
    pub async fn publish(&self, mut event: DomainEvent) -> Result<String> {
        event.producer_service = self.service_name.clone();
        let fields = event.to_fields();

        self.store
            .stream_append(EVENT_STREAM, &fields, EVENT_STREAM_MAXLEN)
            .await
            .map_err(|err| GatewayError::PublishFailed(err.to_string()))?;

        let detail_key = format!("event:{}", event.event_id);
        self.store
            .hset_all(&detail_key, &fields)
            .await
            .map_err(|err| GatewayError::PublishFailed(err.to_string()))?;
        self.store
            .expire(&detail_key, EVENT_DETAIL_TTL)
            .await
            .map_err(|err| GatewayError::PublishFailed(err.to_string()))?;

        self.published.fetch_add(1, Ordering::Relaxed);
        log::info!("published event {}#{}", event.event_type, event.event_id);
        Ok(event.event_id)
    }

    /// Read back a published event's detail record, e.g. for manual replay.
    pub async fn get_event(&self, event_id: &str) -> Result<Option<DomainEvent>> {
        let fields = self.store.hget_all(&format!("event:{}", event_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(DomainEvent::from_fields(&fields))
    }

    pub fn stats(&self) -> EventBusStats {
        let handlers = self.handlers.read();
        EventBusStats {
            service_name: self.service_name.clone(),
            published_events: self.published.load(Ordering::Relaxed),
            processed_events: self.processed.load(Ordering::Relaxed),
            failed_events: self.failed.load(Ordering::Relaxed),
            registered_handlers: handlers
                .iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect(),
        }
    }

    /// Spawn the consumer loop for this process's group. Runs until the
    /// shutdown signal flips; store errors back off and retry.
    pub fn spawn_consumer(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let consumer = format!(
                "{}_{}",
                bus.service_name,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if let Err(err) = bus.store.group_create(EVENT_STREAM, &bus.group()).await {
                    log::warn!("consumer group create failed: {}", err);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
                let group = bus.group();
                tokio::select! {
                    batch = bus.store.group_read(
                        EVENT_STREAM,
                        &group,
                        &consumer,
                        READ_BATCH,
                        READ_BLOCK,
                    ) => {
                        match batch {
                            Ok(entries) => {
                                for entry in entries {
                                    bus.process_entry(entry).await;
                                }
                            }
                            Err(err) => {
                                log::warn!("event consumer read failed: {}", err);
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            log::debug!("event consumer {} exiting", consumer);
        })
    }

    async fn process_entry(&self, entry: StreamEntry) {
        let Some(event) = DomainEvent::from_fields(&entry.fields) else {
            log::warn!("acking unparseable event entry {}", entry.id);
            self.ack_entry(&entry.id).await;
            return;
        };

        // Skip events this process published; other group members in other
        // processes still see their own copy.
        if event.producer_service == self.service_name {
            self.ack_entry(&entry.id).await;
            return;
        }

        let registrations: Vec<(String, Arc<dyn EventHandler>, u32, Duration)> = {
            let handlers = self.handlers.read();
            match handlers.get(&event.event_type) {
                Some(list) => list
                    .iter()
                    .map(|r| {
                        (
                            r.handler_id.clone(),
                            Arc::clone(&r.handler),
                            r.max_retries,
                            r.timeout,
                        )
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        if registrations.is_empty() {
            self.ack_entry(&entry.id).await;
            return;
        }

        // In-process duplicate suppression while the event is in flight.
        if !self.processing.lock().insert(event.event_id.clone()) {
            return;
        }

        for (handler_id, handler, max_retries, timeout) in registrations {
            self.execute_handler(&event, &handler_id, handler, max_retries, timeout)
                .await;
        }

        self.ack_entry(&entry.id).await;
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.processing.lock().remove(&event.event_id);
    }

    /// Run one handler with its timeout, retrying with exponential backoff.
    /// One handler's failure never affects the others.
    async fn execute_handler(
        &self,
        event: &DomainEvent,
        handler_id: &str,
        handler: Arc<dyn EventHandler>,
        max_retries: u32,
        timeout: Duration,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(timeout, handler.handle(event)).await;
            let error = match outcome {
                Ok(Ok(())) => {
                    log::debug!("handler {} completed for {}", handler_id, event.event_id);
                    return;
                }
                Ok(Err(err)) => GatewayError::HandlerError(format!("{}: {}", handler_id, err)),
                Err(_) => GatewayError::HandlerTimeout(handler_id.to_string()),
            };

            if attempt >= max_retries {
                log::error!(
                    "handler {} exhausted {} retries for event {}: {}",
                    handler_id,
                    max_retries,
                    event.event_id,
                    error
                );
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.record_failure(event, handler_id, &error, attempt).await;
                return;
            }

            let backoff = (RETRY_BASE * 2u32.saturating_pow(attempt)).min(RETRY_CAP);
            log::warn!(
                "handler {} failed for event {} (attempt {}): {}; retrying in {:?}",
                handler_id,
                event.event_id,
                attempt + 1,
                error,
                backoff
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn record_failure(
        &self,
        event: &DomainEvent,
        handler_id: &str,
        error: &GatewayError,
        retry_count: u32,
    ) {
        let key = format!("event_result:{}:{}", event.event_id, handler_id);
        let mut fields = HashMap::new();
        fields.insert("event_id".to_string(), event.event_id.clone());
        fields.insert("handler_id".to_string(), handler_id.to_string());
        fields.insert("status".to_string(), "failed".to_string());
        fields.insert("error".to_string(), error.to_string());
        fields.insert("retry_count".to_string(), retry_count.to_string());
        if let Err(err) = self.store.hset_all(&key, &fields).await {
            log::warn!("failed to record handler failure: {}", err);
            return;
        }
        let _ = self.store.expire(&key, RESULT_TTL).await;
    }

    async fn ack_entry(&self, entry_id: &str) {
        if let Err(err) = self.store.ack(EVENT_STREAM, &self.group(), entry_id).await {
            log::warn!("ack failed for entry {}: {}", entry_id, err);
        }
    }
}

/// Well-known event types used across the backend.
pub mod types {
    pub const USER_REGISTERED: &str = "user.registered";
    pub const USER_LOGIN: &str = "user.login";
    pub const USER_LOGOUT: &str = "user.logout";
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_FILLED: &str = "order.filled";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    pub const STRATEGY_STARTED: &str = "strategy.started";
    pub const STRATEGY_STOPPED: &str = "strategy.stopped";
}
