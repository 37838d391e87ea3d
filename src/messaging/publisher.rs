use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::domain::order::DomainEvent;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("publisher is closed")]
    Closed,
}

impl PublishError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            PublishError::Serialization(_) => "serialization",
            PublishError::Transport(_) => "transport",
            PublishError::Timeout(_) => "timeout",
            PublishError::Unavailable(_) => "unavailable",
            PublishError::Connection(_) => "connection",
            PublishError::Closed => "closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("failed to flush pending events: {0}")]
    Flush(String),
    #[error("flush did not finish within {0:?}")]
    Timeout(Duration),
}

/// Outbound side of the event pipeline.
///
/// `publish` resolves only once the backend has accepted the event. A
/// publisher is shared behind an `Arc` and closed once by its owner at
/// shutdown; `close` must tolerate repeated calls.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &DomainEvent) -> Result<(), PublishError>;

    async fn close(&self) -> Result<(), CloseError>;

    /// Backend name for logs and metrics ("redpanda", "memory").
    fn backend(&self) -> &'static str;
}
