use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use super::consumer::ConsumerError;
use crate::domain::order::OrderEventPayload;

// ============================================================================
// Dispatcher - routes inbound messages to per-topic handlers
// ============================================================================
//
// Broker-agnostic: both consumers hand each raw message to `dispatch` and act
// on the returned `Delivery` (commit, redeliver or drop).
//
// ============================================================================

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("payload does not match the expected shape: {0}")]
    Decode(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}

/// A raw message as it came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    /// Event kind from the broker key/header, when present
    pub kind: Option<String>,
    pub payload: Vec<u8>,
    /// 1 on first delivery
    pub delivery_attempt: u32,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, kind: Option<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            kind,
            payload,
            delivery_attempt: 1,
        }
    }
}

/// Decoded event handed to handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub kind: String,
    pub data: Map<String, Value>,
}

impl ReceivedEvent {
    /// Event time from `timestamp`, or now if missing or unparsable.
    pub fn occurred_on(&self) -> DateTime<Utc> {
        self.get_str("timestamp")
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }

    pub fn order_payload(&self) -> Result<OrderEventPayload, HandlerError> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ReceivedEvent) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(ReceivedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: ReceivedEvent) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(ReceivedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Handled; commit the offset
    Ack,
    /// Handler failed; deliver again later
    Retry { reason: String },
    /// Cannot ever be handled; commit without handling
    Discard { reason: String },
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    started: bool,
}

#[derive(Default)]
pub struct Dispatcher {
    registry: RwLock<Registry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`, replacing any earlier one.
    pub async fn register(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConsumerError> {
        let mut registry = self.registry.write().await;
        if registry.started {
            return Err(ConsumerError::AlreadyStarted);
        }

        let topic = topic.into();
        if registry.handlers.insert(topic.clone(), handler).is_some() {
            tracing::warn!(topic = %topic, "Replacing existing handler for topic");
        } else {
            tracing::info!(topic = %topic, "Handler registered");
        }
        Ok(())
    }

    /// Freeze the registry and return the subscribed topics.
    pub async fn start(&self) -> Result<Vec<String>, ConsumerError> {
        let mut registry = self.registry.write().await;
        if registry.started {
            return Err(ConsumerError::AlreadyStarted);
        }
        if registry.handlers.is_empty() {
            return Err(ConsumerError::NoSubscriptions);
        }

        registry.started = true;
        let mut topics: Vec<String> = registry.handlers.keys().cloned().collect();
        topics.sort();
        Ok(topics)
    }

    pub async fn is_started(&self) -> bool {
        self.registry.read().await.started
    }

    /// Best-effort event kind for logs before the payload is decoded.
    pub fn kind_hint(message: &InboundMessage) -> String {
        message
            .kind
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                serde_json::from_slice::<Value>(&message.payload)
                    .ok()
                    .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub async fn dispatch(&self, message: &InboundMessage) -> Delivery {
        let handler = self.registry.read().await.handlers.get(&message.topic).cloned();
        let Some(handler) = handler else {
            tracing::warn!(topic = %message.topic, "No handler for topic, discarding message");
            return Delivery::Discard {
                reason: format!("no handler for topic {}", message.topic),
            };
        };

        let data = match serde_json::from_slice::<Value>(&message.payload) {
            Ok(Value::Object(data)) => data,
            Ok(other) => {
                tracing::warn!(
                    topic = %message.topic,
                    payload = %other,
                    "Payload is not a JSON object, discarding message"
                );
                return Delivery::Discard {
                    reason: "payload is not a JSON object".to_string(),
                };
            }
            Err(e) => {
                tracing::warn!(
                    topic = %message.topic,
                    error = %e,
                    "Undecodable payload, discarding message"
                );
                return Delivery::Discard {
                    reason: format!("undecodable payload: {}", e),
                };
            }
        };

        let kind = message
            .kind
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| data.get("type").and_then(Value::as_str).map(str::to_string));
        let Some(kind) = kind else {
            tracing::warn!(topic = %message.topic, "Message carries no event type, discarding");
            return Delivery::Discard {
                reason: "missing event type".to_string(),
            };
        };

        tracing::debug!(
            topic = %message.topic,
            event_type = %kind,
            attempt = message.delivery_attempt,
            "Dispatching event"
        );

        match handler.handle(ReceivedEvent { kind: kind.clone(), data }).await {
            Ok(()) => Delivery::Ack,
            Err(e) => {
                tracing::warn!(
                    topic = %message.topic,
                    event_type = %kind,
                    attempt = message.delivery_attempt,
                    error = %e,
                    "Handler failed, message will be redelivered"
                );
                Delivery::Retry {
                    reason: e.to_string(),
                }
            }
        }
    }
}
