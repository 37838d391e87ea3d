use std::sync::Arc;

use super::memory::MemoryEventPublisher;
use super::publisher::EventPublisher;
use super::redpanda::RedpandaPublisher;
use crate::config::MessagingConfig;
use crate::metrics::Metrics;

/// The publisher chosen at start-up.
pub enum PublisherHandle {
    Broker(Arc<RedpandaPublisher>),
    Memory {
        publisher: Arc<MemoryEventPublisher>,
        /// The broker was enabled but could not be reached
        fallback: bool,
    },
}

impl PublisherHandle {
    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        match self {
            PublisherHandle::Broker(publisher) => publisher.clone() as Arc<dyn EventPublisher>,
            PublisherHandle::Memory { publisher, .. } => publisher.clone(),
        }
    }

    /// The in-process log, when events are not going to a broker.
    pub fn memory(&self) -> Option<Arc<MemoryEventPublisher>> {
        match self {
            PublisherHandle::Broker(_) => None,
            PublisherHandle::Memory { publisher, .. } => Some(publisher.clone()),
        }
    }

    pub fn is_broker(&self) -> bool {
        matches!(self, PublisherHandle::Broker(_))
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, PublisherHandle::Memory { fallback: true, .. })
    }
}

/// Pick the event publisher once for the life of the process.
///
/// A broker that cannot be reached is not fatal: the service keeps running
/// on the memory publisher and the error is logged.
pub async fn build_publisher(config: &MessagingConfig, metrics: Option<Arc<Metrics>>) -> PublisherHandle {
    if !config.enabled {
        tracing::info!("Broker disabled, events go to the memory publisher");
        return PublisherHandle::Memory {
            publisher: Arc::new(MemoryEventPublisher::new()),
            fallback: false,
        };
    }

    match RedpandaPublisher::connect(config).await {
        Ok(publisher) => {
            let publisher = match metrics {
                Some(metrics) => publisher.with_metrics(metrics),
                None => publisher,
            };
            PublisherHandle::Broker(Arc::new(publisher))
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                bootstrap_servers = %config.bootstrap_servers,
                "⚠️ Broker unreachable, falling back to memory publisher"
            );
            PublisherHandle::Memory {
                publisher: Arc::new(MemoryEventPublisher::new()),
                fallback: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disabled_broker_uses_memory() {
        let handle = build_publisher(&MessagingConfig::default(), None).await;

        assert!(!handle.is_broker());
        assert!(!handle.is_fallback());
        assert!(handle.memory().is_some());
        assert_eq!(handle.publisher().backend(), "memory");
    }

    #[tokio::test]
    async fn test_unreachable_broker_falls_back_to_memory() {
        let config = MessagingConfig {
            enabled: true,
            bootstrap_servers: "127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(300),
            connect_attempts: 1,
            ..MessagingConfig::default()
        };

        let handle = build_publisher(&config, None).await;

        assert!(handle.is_fallback());
        assert_eq!(handle.publisher().backend(), "memory");
    }
}
