use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dead_letter::{DeadLetter, DeadLetterQueue};
use super::dispatcher::{Delivery, Dispatcher, EventHandler, InboundMessage};
use crate::config::MessagingConfig;
use crate::domain::order::DomainEvent;
use crate::metrics::Metrics;
use crate::utils::RetryConfig;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer already started")]
    AlreadyStarted,
    #[error("no topic subscriptions registered")]
    NoSubscriptions,
    #[error("consumer is closed")]
    Closed,
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("failed to publish dead letter: {0}")]
    DeadLetter(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Inbound side of the event pipeline.
///
/// Handlers are registered before `start`; the receive loop runs on a
/// background task until `close`.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), ConsumerError>;

    async fn start(&self) -> Result<(), ConsumerError>;

    async fn close(&self) -> Result<(), ConsumerError>;
}

// ============================================================================
// Redelivery Policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    /// Deliveries allowed before the message is dead-lettered
    pub max_deliveries: u32,
    backoff: RetryConfig,
}

impl RedeliveryPolicy {
    pub fn new(max_deliveries: u32, initial_delay: Duration) -> Self {
        Self {
            max_deliveries: max_deliveries.max(1),
            backoff: RetryConfig {
                max_attempts: max_deliveries.max(1),
                initial_delay,
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
        }
    }

    pub fn from_config(config: &MessagingConfig) -> Self {
        Self::new(config.max_deliveries, config.redelivery_delay)
    }

    pub fn exhausted(&self, delivery_attempt: u32) -> bool {
        delivery_attempt >= self.max_deliveries
    }

    pub fn delay_before_redelivery(&self, failed_attempt: u32) -> Duration {
        self.backoff.delay_after(failed_attempt)
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500))
    }
}

// ============================================================================
// Shared settlement logic
// ============================================================================

/// What the receive loop should do with a message after dispatch.
#[derive(Debug, Clone)]
pub(crate) enum Settlement {
    Commit,
    Redeliver { delay: Duration },
    /// Out of deliveries. The loop must store the dead letter before it
    /// commits past the message.
    DeadLetter(DeadLetter),
}

pub(crate) struct ConsumerCore {
    pub(crate) dispatcher: Dispatcher,
    policy: RedeliveryPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl ConsumerCore {
    pub(crate) fn new(policy: RedeliveryPolicy, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            policy,
            metrics,
        }
    }

    pub(crate) async fn process(
        &self,
        message: &InboundMessage,
        first_failed_at: Option<DateTime<Utc>>,
    ) -> Settlement {
        match self.dispatcher.dispatch(message).await {
            Delivery::Ack => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_handled(&Dispatcher::kind_hint(message));
                }
                Settlement::Commit
            }
            Delivery::Discard { reason } => {
                tracing::debug!(topic = %message.topic, reason = %reason, "Message discarded");
                if let Some(metrics) = &self.metrics {
                    metrics.record_discarded(&message.topic);
                }
                Settlement::Commit
            }
            Delivery::Retry { reason } => {
                let kind = Dispatcher::kind_hint(message);

                if self.policy.exhausted(message.delivery_attempt) {
                    return Settlement::DeadLetter(self.dead_letter(message, &kind, &reason, first_failed_at));
                }

                if let Some(metrics) = &self.metrics {
                    metrics.record_redelivery(&kind);
                }
                Settlement::Redeliver {
                    delay: self.policy.delay_before_redelivery(message.delivery_attempt),
                }
            }
        }
    }

    pub(crate) fn dead_letter(
        &self,
        message: &InboundMessage,
        kind: &str,
        reason: &str,
        first_failed_at: Option<DateTime<Utc>>,
    ) -> DeadLetter {
        let entry = DeadLetter::new(message, kind, reason, first_failed_at.unwrap_or_else(Utc::now));

        tracing::error!(
            event_id = %entry.id,
            topic = %entry.topic,
            event_type = %entry.event_type,
            error = %entry.error_message,
            failure_count = entry.failure_count,
            "💀 Moving message to Dead Letter Queue"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_dlq_message(kind);
        }
        entry
    }
}

// ============================================================================
// Memory Consumer
// ============================================================================

struct Envelope {
    message: InboundMessage,
    first_failed_at: Option<DateTime<Utc>>,
}

/// Sending half of a [`MemoryEventConsumer`].
#[derive(Clone)]
pub struct MemoryInbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl MemoryInbox {
    pub fn send(&self, message: InboundMessage) -> Result<(), ConsumerError> {
        self.tx
            .send(Envelope {
                message,
                first_failed_at: None,
            })
            .map_err(|_| ConsumerError::Closed)
    }

    /// Enqueue `event` exactly as the broker publisher would frame it.
    pub fn send_event(&self, topic: &str, event: &DomainEvent) -> Result<(), ConsumerError> {
        let payload = event.to_bytes()?;
        self.send(InboundMessage::new(
            topic,
            Some(event.event_type().to_string()),
            payload,
        ))
    }
}

pub struct MemoryEventConsumer {
    core: Arc<ConsumerCore>,
    dlq: Arc<DeadLetterQueue>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryEventConsumer {
    pub fn new(policy: RedeliveryPolicy, dlq: Arc<DeadLetterQueue>, metrics: Option<Arc<Metrics>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(ConsumerCore::new(policy, metrics)),
            dlq,
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn inbox(&self) -> MemoryInbox {
        MemoryInbox { tx: self.tx.clone() }
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterQueue> {
        self.dlq.clone()
    }
}

#[async_trait]
impl EventConsumer for MemoryEventConsumer {
    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), ConsumerError> {
        self.core.dispatcher.register(topic, handler).await
    }

    async fn start(&self) -> Result<(), ConsumerError> {
        if self.cancel.is_cancelled() {
            return Err(ConsumerError::Closed);
        }

        let topics = self.core.dispatcher.start().await?;
        let mut rx = self.rx.lock().await.take().ok_or(ConsumerError::AlreadyStarted)?;

        let core = self.core.clone();
        let dlq = self.dlq.clone();
        let cancel = self.cancel.clone();
        let requeue = self.tx.clone();

        tracing::info!(topics = ?topics, "Memory consumer started");

        let handle = tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                match core.process(&envelope.message, envelope.first_failed_at).await {
                    Settlement::Commit => {}
                    Settlement::DeadLetter(entry) => {
                        dlq.add(entry).await;
                    }
                    Settlement::Redeliver { delay } => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }

                        let mut message = envelope.message;
                        message.delivery_attempt += 1;
                        let retry = Envelope {
                            message,
                            first_failed_at: envelope.first_failed_at.or_else(|| Some(Utc::now())),
                        };
                        if requeue.send(retry).is_err() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Memory consumer loop stopped");
        });

        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    async fn close(&self) -> Result<(), ConsumerError> {
        self.cancel.cancel();

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Memory consumer task ended abnormally");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{Order, OrderEventKind};
    use crate::messaging::dispatcher::{handler_fn, HandlerError};
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const TOPIC: &str = "order-event-topic";

    fn consumer(max_deliveries: u32) -> MemoryEventConsumer {
        MemoryEventConsumer::new(
            RedeliveryPolicy::new(max_deliveries, Duration::from_millis(5)),
            Arc::new(DeadLetterQueue::new()),
            None,
        )
    }

    fn created_event() -> DomainEvent {
        let order = Order::create("ORD-1", 100, 25.0).unwrap().with_id(1);
        DomainEvent::for_order(OrderEventKind::Created, &order, None)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// Handler failing the first `failures` calls, counting every call.
    fn flaky(calls: Arc<AtomicU32>, failures: u32) -> Arc<dyn EventHandler> {
        handler_fn(move |_event| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(HandlerError::failed("downstream unavailable"))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[test]
    fn test_redelivery_policy() {
        let policy = RedeliveryPolicy::new(3, Duration::from_millis(100));

        assert!(!policy.exhausted(1));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert_eq!(policy.delay_before_redelivery(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before_redelivery(2), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_event_handled_once() {
        let consumer = consumer(3);
        let calls = Arc::new(AtomicU32::new(0));
        consumer.subscribe(TOPIC, flaky(calls.clone(), 0)).await.unwrap();
        consumer.start().await.unwrap();

        consumer.inbox().send_event(TOPIC, &created_event()).unwrap();

        eventually(|| {
            let calls = calls.clone();
            async move { calls.load(Ordering::SeqCst) == 1 }
        })
        .await;
        consumer.close().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(consumer.dead_letters().is_empty().await);
    }

    #[tokio::test]
    async fn test_redelivered_until_handler_succeeds() {
        let consumer = consumer(5);
        let calls = Arc::new(AtomicU32::new(0));
        consumer.subscribe(TOPIC, flaky(calls.clone(), 2)).await.unwrap();
        consumer.start().await.unwrap();

        consumer.inbox().send_event(TOPIC, &created_event()).unwrap();

        eventually(|| {
            let calls = calls.clone();
            async move { calls.load(Ordering::SeqCst) == 3 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.close().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(consumer.dead_letters().is_empty().await);
    }

    #[tokio::test]
    async fn test_dead_lettered_after_max_deliveries() {
        let consumer = consumer(3);
        let calls = Arc::new(AtomicU32::new(0));
        consumer.subscribe(TOPIC, flaky(calls.clone(), u32::MAX)).await.unwrap();
        consumer.start().await.unwrap();

        consumer.inbox().send_event(TOPIC, &created_event()).unwrap();

        let dlq = consumer.dead_letters();
        eventually(|| {
            let dlq = dlq.clone();
            async move { dlq.len().await == 1 }
        })
        .await;
        consumer.close().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let entries = dlq.list(1).await;
        let entry = &entries[0];
        assert_eq!(entry.event_type, "order.created");
        assert_eq!(entry.failure_count, 3);
        assert!(entry.error_message.contains("downstream unavailable"));
    }

    #[tokio::test]
    async fn test_exhausted_message_settles_as_dead_letter() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let core = ConsumerCore::new(
            RedeliveryPolicy::new(2, Duration::from_millis(5)),
            Some(metrics.clone()),
        );
        let calls = Arc::new(AtomicU32::new(0));
        core.dispatcher.register(TOPIC, flaky(calls, u32::MAX)).await.unwrap();
        core.dispatcher.start().await.unwrap();

        let payload = created_event().to_bytes().unwrap();
        let mut message = InboundMessage::new(TOPIC, Some("order.created".to_string()), payload);

        let first = core.process(&message, None).await;
        assert!(matches!(first, Settlement::Redeliver { .. }));

        let first_failed_at = Utc::now();
        message.delivery_attempt = 2;
        let Settlement::DeadLetter(entry) = core.process(&message, Some(first_failed_at)).await else {
            panic!("expected a dead letter");
        };
        assert_eq!(entry.topic, TOPIC);
        assert_eq!(entry.dlq_topic(), "order-event-topic.dlq");
        assert_eq!(entry.failure_count, 2);
        assert_eq!(entry.first_failed_at, first_failed_at);

        let dlq_total = metrics
            .registry()
            .gather()
            .iter()
            .find(|m| m.name() == "dlq_messages_total")
            .map(|m| m.metric[0].counter.value.unwrap_or(0.0));
        assert_eq!(dlq_total, Some(1.0));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let consumer = consumer(3);
        assert!(matches!(consumer.start().await, Err(ConsumerError::NoSubscriptions)));

        let calls = Arc::new(AtomicU32::new(0));
        consumer.subscribe(TOPIC, flaky(calls.clone(), 0)).await.unwrap();
        consumer.start().await.unwrap();

        assert!(matches!(consumer.start().await, Err(ConsumerError::AlreadyStarted)));
        assert!(matches!(
            consumer.subscribe("audit", flaky(calls, 0)).await,
            Err(ConsumerError::AlreadyStarted)
        ));

        consumer.close().await.unwrap();
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_start_is_safe() {
        let consumer = consumer(3);
        consumer.close().await.unwrap();
        consumer.close().await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        consumer.subscribe(TOPIC, flaky(calls, 0)).await.unwrap();
        assert!(matches!(consumer.start().await, Err(ConsumerError::Closed)));
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_handler() {
        let consumer = consumer(3);
        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let (entered_flag, finished_flag) = (entered.clone(), finished.clone());
        consumer
            .subscribe(
                TOPIC,
                handler_fn(move |_event| {
                    let entered = entered_flag.clone();
                    let finished = finished_flag.clone();
                    async move {
                        entered.store(true, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        consumer.start().await.unwrap();

        consumer.inbox().send_event(TOPIC, &created_event()).unwrap();
        eventually(|| {
            let entered = entered.clone();
            async move { entered.load(Ordering::SeqCst) }
        })
        .await;

        consumer.close().await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }
}
