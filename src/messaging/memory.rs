use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::publisher::{CloseError, EventPublisher, PublishError};
use crate::domain::order::DomainEvent;

// ============================================================================
// Memory Publisher
// ============================================================================
//
// Keeps every published event in an ordered in-process log. Used when the
// broker is disabled or unreachable at start-up, and by tests to observe
// what the order service emitted.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub event: DomainEvent,
}

#[derive(Default)]
pub struct MemoryEventPublisher {
    log: RwLock<Vec<PublishedEvent>>,
    closed: AtomicBool,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events in publication order.
    pub async fn events(&self) -> Vec<DomainEvent> {
        self.log.read().await.iter().map(|p| p.event.clone()).collect()
    }

    /// Events with the topic each was published to.
    pub async fn published(&self) -> Vec<PublishedEvent> {
        self.log.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.log.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, topic: &str, event: &DomainEvent) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::Closed);
        }

        let mut log = self.log.write().await;
        log.push(PublishedEvent {
            topic: topic.to_string(),
            event: event.clone(),
        });

        tracing::debug!(
            topic = %topic,
            event_type = %event.event_type(),
            order_id = event.payload().order_id,
            position = log.len(),
            "Event stored in memory log"
        );

        Ok(())
    }

    async fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let count = self.log.read().await.len();
        tracing::info!(events = count, "Memory publisher closed");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{Order, OrderEventKind};

    fn event(kind: OrderEventKind, id: i64) -> DomainEvent {
        let order = Order::create(format!("ORD-{}", id), 100, 10.0).unwrap().with_id(id);
        DomainEvent::for_order(kind, &order, None)
    }

    #[tokio::test]
    async fn test_events_kept_in_publish_order() {
        let publisher = MemoryEventPublisher::new();

        publisher.publish("orders", &event(OrderEventKind::Created, 1)).await.unwrap();
        publisher.publish("orders", &event(OrderEventKind::Paid, 1)).await.unwrap();
        publisher.publish("audit", &event(OrderEventKind::Created, 2)).await.unwrap();

        let kinds: Vec<_> = publisher.events().await.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![OrderEventKind::Created, OrderEventKind::Paid, OrderEventKind::Created]
        );

        let published = publisher.published().await;
        assert_eq!(published[2].topic, "audit");
        assert_eq!(publisher.len().await, 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_publish() {
        let publisher = MemoryEventPublisher::new();
        publisher.publish("orders", &event(OrderEventKind::Created, 1)).await.unwrap();

        publisher.close().await.unwrap();
        publisher.close().await.unwrap();

        let result = publisher.publish("orders", &event(OrderEventKind::Paid, 1)).await;
        assert!(matches!(result, Err(PublishError::Closed)));
        assert_eq!(publisher.len().await, 1);
    }
}
