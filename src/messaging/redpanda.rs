use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
    Offset,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::consumer::{ConsumerCore, ConsumerError, EventConsumer, RedeliveryPolicy, Settlement};
use super::dead_letter::DeadLetter;
use super::dispatcher::{Dispatcher, EventHandler, InboundMessage};
use super::publisher::{CloseError, EventPublisher, PublishError};
use crate::config::MessagingConfig;
use crate::domain::order::DomainEvent;
use crate::metrics::Metrics;
use crate::utils::{
    retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, RetryConfig,
};

// ============================================================================
// Redpanda Publisher
// ============================================================================
//
// Kafka-protocol producer with acks=all. Each record is keyed by the event
// kind and carries an `event_type` header with the same value. Sends go
// through a circuit breaker that owns the publish deadline, so a send that
// hangs still counts as a failure and a dead broker soon fails fast.
//
// ============================================================================

const EVENT_TYPE_HEADER: &str = "event_type";

/// Frame `payload` the way every consumer expects: key and `event_type`
/// header both carry the event kind.
fn event_record<'a>(topic: &'a str, kind: &'a str, payload: &'a [u8]) -> FutureRecord<'a, str, [u8]> {
    FutureRecord::to(topic)
        .key(kind)
        .payload(payload)
        .headers(OwnedHeaders::new().insert(Header {
            key: EVENT_TYPE_HEADER,
            value: Some(kind),
        }))
}

pub struct RedpandaPublisher {
    producer: FutureProducer,
    circuit_breaker: CircuitBreaker,
    publish_timeout: Duration,
    close_timeout: Duration,
    closed: AtomicBool,
    metrics: Option<Arc<Metrics>>,
}

impl RedpandaPublisher {
    /// Create the producer and check the broker answers a metadata request.
    pub async fn connect(config: &MessagingConfig) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("message.timeout.ms", config.publish_timeout.as_millis().to_string())
            .create()
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        let retry = RetryConfig {
            max_attempts: config.connect_attempts,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        };
        let connect_timeout = config.connect_timeout;

        let brokers = retry_with_backoff(&retry, |attempt| {
            let producer = producer.clone();
            async move {
                tracing::debug!(attempt = attempt, "Fetching broker metadata");
                let metadata = tokio::task::spawn_blocking(move || {
                    producer
                        .client()
                        .fetch_metadata(None, connect_timeout)
                        .map(|m| m.brokers().len())
                })
                .await
                .map_err(|e| PublishError::Connection(e.to_string()))?;

                match metadata {
                    Ok(0) => Err(PublishError::Connection("no brokers in cluster metadata".to_string())),
                    Ok(count) => Ok(count),
                    Err(e) => Err(PublishError::Connection(e.to_string())),
                }
            }
        })
        .await
        .into_result()?;

        tracing::info!(
            bootstrap_servers = %config.bootstrap_servers,
            brokers = brokers,
            "✅ Connected to Redpanda"
        );

        Ok(Self {
            producer,
            circuit_breaker: CircuitBreaker::new(
                "redpanda-producer",
                CircuitBreakerConfig {
                    failure_threshold: 5,
                    open_for: Duration::from_secs(30),
                    success_threshold: 3,
                },
            ),
            publish_timeout: config.publish_timeout,
            close_timeout: config.close_timeout,
            closed: AtomicBool::new(false),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn report_circuit_state(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.update_circuit_breaker_state(self.circuit_breaker.state().await.code());
        }
    }
}

#[async_trait]
impl EventPublisher for RedpandaPublisher {
    async fn publish(&self, topic: &str, event: &DomainEvent) -> Result<(), PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }

        let payload = event.to_bytes()?;
        let kind = event.event_type();
        let started = Instant::now();

        let result = self
            .circuit_breaker
            .call_with_deadline(self.publish_timeout, async {
                self.producer
                    .send(event_record(topic, kind, &payload), Timeout::After(self.publish_timeout))
                    .await
                    .map_err(|(e, _)| e)
            })
            .await;

        self.report_circuit_state().await;

        match result {
            Ok(_delivery) => {
                tracing::debug!(
                    topic = %topic,
                    event_type = %kind,
                    order_id = event.payload().order_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Published to Redpanda"
                );
                Ok(())
            }
            Err(CircuitBreakerError::CircuitOpen) => {
                tracing::error!(topic = %topic, "Circuit breaker open - Redpanda unavailable");
                Err(PublishError::Unavailable("circuit breaker open".to_string()))
            }
            Err(CircuitBreakerError::TimedOut(deadline)) => {
                tracing::error!(
                    topic = %topic,
                    event_type = %kind,
                    timeout_ms = deadline.as_millis() as u64,
                    "Publish to Redpanda timed out"
                );
                Err(PublishError::Timeout(deadline))
            }
            Err(CircuitBreakerError::OperationFailed(e)) => {
                tracing::error!(
                    error = %e,
                    topic = %topic,
                    event_type = %kind,
                    "Failed to publish to Redpanda"
                );
                Err(match e {
                    KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => {
                        PublishError::Timeout(self.publish_timeout)
                    }
                    other => PublishError::Transport(other.to_string()),
                })
            }
        }
    }

    async fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let producer = self.producer.clone();
        let timeout = self.close_timeout;

        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| CloseError::Flush(e.to_string()))?;

        match flushed {
            Ok(()) => {
                tracing::info!("Redpanda producer flushed and closed");
                Ok(())
            }
            Err(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut)) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Producer flush timed out");
                Err(CloseError::Timeout(timeout))
            }
            Err(e) => Err(CloseError::Flush(e.to_string())),
        }
    }

    fn backend(&self) -> &'static str {
        "redpanda"
    }
}

// ============================================================================
// Redpanda Consumer
// ============================================================================
//
// Manual commits give at-least-once delivery: an offset is committed only
// after its handler succeeded, the message was discarded, or its dead letter
// reached `<topic>.dlq`. A failed message is retried by seeking its
// partition back to the same offset after a backoff delay. A message that
// cannot be sought back is dead-lettered, never skipped.
//
// ============================================================================

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(500);
/// Wait before retrying a message whose dead letter could not be published
const DEAD_LETTER_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Failure records untouched this long belong to a partition this member
/// no longer owns.
const FAILURE_IDLE_EXPIRY: Duration = Duration::from_secs(600);

const DLQ_ID_HEADER: &str = "dlq.id";
const DLQ_SOURCE_TOPIC_HEADER: &str = "dlq.source_topic";
const DLQ_ERROR_HEADER: &str = "dlq.error";
const DLQ_FAILURE_COUNT_HEADER: &str = "dlq.failure_count";
const DLQ_FIRST_FAILED_AT_HEADER: &str = "dlq.first_failed_at";

type OffsetKey = (String, i32, i64);

// ----------------------------------------------------------------------------
// Failure ledger
// ----------------------------------------------------------------------------

struct FailureRecord {
    deliveries: u32,
    first_failed_at: DateTime<Utc>,
    last_seen: Instant,
}

/// Failed deliveries per (topic, partition, offset).
#[derive(Default)]
struct FailureLedger {
    entries: HashMap<OffsetKey, FailureRecord>,
}

impl FailureLedger {
    fn lookup(&self, key: &OffsetKey) -> (u32, Option<DateTime<Utc>>) {
        self.entries
            .get(key)
            .map(|record| (record.deliveries, Some(record.first_failed_at)))
            .unwrap_or((0, None))
    }

    fn record_failure(&mut self, key: OffsetKey, deliveries: u32, first_failed_at: DateTime<Utc>) {
        self.entries.insert(
            key,
            FailureRecord {
                deliveries,
                first_failed_at,
                last_seen: Instant::now(),
            },
        );
    }

    fn forget(&mut self, key: &OffsetKey) {
        self.entries.remove(key);
    }

    /// A committed offset settles itself and every earlier offset of its partition.
    fn settle(&mut self, key: &OffsetKey) {
        let (topic, partition, offset) = key;
        self.entries
            .retain(|(t, p, o), _| !(t == topic && p == partition && o <= offset));
    }

    fn expire_idle(&mut self, max_idle: Duration) {
        let before = self.entries.len();
        self.entries.retain(|_, record| record.last_seen.elapsed() < max_idle);

        let expired = before - self.entries.len();
        if expired > 0 {
            tracing::debug!(expired = expired, "Dropped failure records for idle offsets");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ----------------------------------------------------------------------------
// Dead-letter producer
// ----------------------------------------------------------------------------

fn dead_letter_headers(entry: &DeadLetter) -> OwnedHeaders {
    let id = entry.id.to_string();
    let failure_count = entry.failure_count.to_string();
    let first_failed_at = entry.first_failed_at.to_rfc3339();

    OwnedHeaders::new()
        .insert(Header {
            key: EVENT_TYPE_HEADER,
            value: Some(entry.event_type.as_str()),
        })
        .insert(Header {
            key: DLQ_ID_HEADER,
            value: Some(id.as_str()),
        })
        .insert(Header {
            key: DLQ_SOURCE_TOPIC_HEADER,
            value: Some(entry.topic.as_str()),
        })
        .insert(Header {
            key: DLQ_ERROR_HEADER,
            value: Some(entry.error_message.as_str()),
        })
        .insert(Header {
            key: DLQ_FAILURE_COUNT_HEADER,
            value: Some(failure_count.as_str()),
        })
        .insert(Header {
            key: DLQ_FIRST_FAILED_AT_HEADER,
            value: Some(first_failed_at.as_str()),
        })
}

struct DeadLetterProducer {
    producer: FutureProducer,
    timeout: Duration,
    retry: RetryConfig,
}

impl DeadLetterProducer {
    fn new(config: &MessagingConfig) -> Result<Self, ConsumerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("message.timeout.ms", config.publish_timeout.as_millis().to_string())
            .create()
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;

        Ok(Self {
            producer,
            timeout: config.publish_timeout,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                multiplier: 2.0,
            },
        })
    }

    /// Publish `entry` to its `<topic>.dlq` topic, retrying with backoff.
    async fn send(&self, entry: &DeadLetter) -> Result<(), ConsumerError> {
        let topic = entry.dlq_topic();
        let headers = dead_letter_headers(entry);
        let topic_ref = topic.as_str();
        let headers_ref = &headers;
        let producer = &self.producer;
        let timeout = self.timeout;

        retry_with_backoff(&self.retry, move |_attempt| {
            let record = FutureRecord::to(topic_ref)
                .key(entry.event_type.as_str())
                .payload(entry.payload.as_str())
                .headers(headers_ref.clone());

            async move {
                match tokio::time::timeout(timeout, producer.send(record, Timeout::After(timeout))).await {
                    Ok(Ok(_delivery)) => Ok(()),
                    Ok(Err((e, _))) => Err(ConsumerError::DeadLetter(e.to_string())),
                    Err(_) => Err(ConsumerError::DeadLetter(format!(
                        "timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        })
        .await
        .into_result()?;

        tracing::warn!(
            event_id = %entry.id,
            dlq_topic = %topic,
            event_type = %entry.event_type,
            "Dead letter published"
        );
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Consumer
// ----------------------------------------------------------------------------

pub struct RedpandaConsumer {
    core: Arc<ConsumerCore>,
    consumer: Mutex<Option<StreamConsumer>>,
    dead_letters: Mutex<Option<DeadLetterProducer>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RedpandaConsumer {
    /// Dead letters go to `<topic>.dlq` on the same cluster.
    pub fn new(
        config: &MessagingConfig,
        policy: RedeliveryPolicy,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ConsumerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;

        Ok(Self {
            core: Arc::new(ConsumerCore::new(policy, metrics)),
            consumer: Mutex::new(Some(consumer)),
            dead_letters: Mutex::new(Some(DeadLetterProducer::new(config)?)),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }
}

fn header_value<H: Headers>(headers: &H, key: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.key == key)
        .and_then(|h| h.value)
        .map(|v| String::from_utf8_lossy(v).into_owned())
}

fn event_type_header<M: Message>(message: &M) -> Option<String> {
    let from_header = message
        .headers()
        .and_then(|headers| header_value(headers, EVENT_TYPE_HEADER));

    from_header.or_else(|| {
        message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    })
}

fn commit(
    consumer: &StreamConsumer,
    message: &BorrowedMessage<'_>,
    key: &OffsetKey,
    failures: &mut FailureLedger,
) {
    failures.settle(key);
    if let Err(e) = consumer.commit_message(message, CommitMode::Async) {
        tracing::warn!(
            error = %e,
            topic = %key.0,
            partition = key.1,
            offset = key.2,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}

/// Sleep for `delay`. Returns false if `cancel` fired first.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn seek_back(consumer: &StreamConsumer, key: &OffsetKey) -> Result<(), KafkaError> {
    let retry = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
    };

    retry_with_backoff(&retry, move |_attempt| async move {
        consumer.seek(&key.0, key.1, Offset::Offset(key.2), SEEK_TIMEOUT)
    })
    .await
    .into_result()
}

async fn consume_loop(
    consumer: StreamConsumer,
    core: Arc<ConsumerCore>,
    dead_letters: DeadLetterProducer,
    cancel: CancellationToken,
) {
    let mut failures = FailureLedger::default();

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = consumer.recv() => received,
        };

        let message = match received {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Error receiving from Redpanda");
                if !pause(&cancel, RECV_ERROR_BACKOFF).await {
                    break;
                }
                continue;
            }
        };

        failures.expire_idle(FAILURE_IDLE_EXPIRY);

        let key: OffsetKey = (message.topic().to_string(), message.partition(), message.offset());
        let (previous_failures, first_failed_at) = failures.lookup(&key);

        let inbound = InboundMessage {
            topic: key.0.clone(),
            kind: event_type_header(&message),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            delivery_attempt: previous_failures + 1,
        };

        let delay = match core.process(&inbound, first_failed_at).await {
            Settlement::Commit => {
                commit(&consumer, &message, &key, &mut failures);
                continue;
            }
            Settlement::DeadLetter(entry) => match dead_letters.send(&entry).await {
                Ok(()) => {
                    commit(&consumer, &message, &key, &mut failures);
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        event_id = %entry.id,
                        dlq_topic = %entry.dlq_topic(),
                        "Failed to publish dead letter, leaving offset uncommitted"
                    );
                    DEAD_LETTER_RETRY_DELAY
                }
            },
            Settlement::Redeliver { delay } => delay,
        };

        let first_failed_at = first_failed_at.unwrap_or_else(Utc::now);
        failures.record_failure(key.clone(), inbound.delivery_attempt, first_failed_at);

        if !pause(&cancel, delay).await {
            break;
        }

        let Err(e) = seek_back(&consumer, &key).await else {
            continue;
        };

        // Without the seek the next commit on this partition would skip the offset.
        tracing::error!(
            error = %e,
            topic = %key.0,
            partition = key.1,
            offset = key.2,
            "Failed to seek back for redelivery, dead-lettering message"
        );
        let entry = core.dead_letter(
            &inbound,
            &Dispatcher::kind_hint(&inbound),
            &format!("redelivery seek failed: {}", e),
            Some(first_failed_at),
        );
        match dead_letters.send(&entry).await {
            Ok(()) => commit(&consumer, &message, &key, &mut failures),
            Err(dlq_error) => {
                failures.forget(&key);
                tracing::error!(
                    error = %dlq_error,
                    topic = %key.0,
                    partition = key.1,
                    offset = key.2,
                    event_type = %entry.event_type,
                    payload = %entry.payload,
                    "Message could not be redelivered or dead-lettered, replay manually"
                );
            }
        }
    }

    tracing::info!("Redpanda consumer loop stopped");
}

#[async_trait]
impl EventConsumer for RedpandaConsumer {
    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<(), ConsumerError> {
        self.core.dispatcher.register(topic, handler).await
    }

    async fn start(&self) -> Result<(), ConsumerError> {
        if self.cancel.is_cancelled() {
            return Err(ConsumerError::Closed);
        }

        let topics = self.core.dispatcher.start().await?;
        let consumer = self
            .consumer
            .lock()
            .await
            .take()
            .ok_or(ConsumerError::AlreadyStarted)?;
        let dead_letters = self
            .dead_letters
            .lock()
            .await
            .take()
            .ok_or(ConsumerError::AlreadyStarted)?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;

        tracing::info!(topics = ?topics, manual_commit = true, "🎧 Redpanda consumer started");

        let handle = tokio::spawn(consume_loop(
            consumer,
            self.core.clone(),
            dead_letters,
            self.cancel.clone(),
        ));
        *self.worker.lock().await = Some(handle);
        Ok(())
    }

    async fn close(&self) -> Result<(), ConsumerError> {
        self.cancel.cancel();

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Redpanda consumer task ended abnormally");
            }
        }

        // Dropping an unstarted consumer releases its connections too.
        self.consumer.lock().await.take();
        self.dead_letters.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{OwnedMessage, Timestamp};

    const TOPIC: &str = "order-event-topic";

    fn unreachable_broker() -> MessagingConfig {
        MessagingConfig {
            enabled: true,
            bootstrap_servers: "127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(300),
            connect_attempts: 1,
            ..MessagingConfig::default()
        }
    }

    fn owned_message(key: Option<&str>, headers: Option<OwnedHeaders>) -> OwnedMessage {
        OwnedMessage::new(
            Some(br#"{"type":"order.paid"}"#.to_vec()),
            key.map(|k| k.as_bytes().to_vec()),
            TOPIC.to_string(),
            Timestamp::NotAvailable,
            0,
            42,
            headers,
        )
    }

    fn key(partition: i32, offset: i64) -> OffsetKey {
        (TOPIC.to_string(), partition, offset)
    }

    #[tokio::test]
    async fn test_connect_fails_for_unreachable_broker() {
        let result = RedpandaPublisher::connect(&unreachable_broker()).await;
        assert!(matches!(result, Err(PublishError::Connection(_))));
    }

    #[tokio::test]
    async fn test_consumer_close_before_start() {
        let consumer = RedpandaConsumer::new(&unreachable_broker(), RedeliveryPolicy::default(), None).unwrap();

        consumer.close().await.unwrap();
        consumer.close().await.unwrap();
        assert!(matches!(consumer.start().await, Err(ConsumerError::Closed)));
    }

    // ========================================================================
    // Record framing
    // ========================================================================

    #[test]
    fn test_event_record_key_and_header_carry_kind() {
        let payload = br#"{"type":"order.paid"}"#;
        let record = event_record(TOPIC, "order.paid", payload);

        assert_eq!(record.topic, TOPIC);
        assert_eq!(record.key, Some("order.paid"));
        assert_eq!(record.payload, Some(&payload[..]));

        let headers = record.headers.as_ref().unwrap();
        assert_eq!(header_value(headers, EVENT_TYPE_HEADER).as_deref(), Some("order.paid"));
    }

    #[test]
    fn test_event_type_read_from_header_then_key() {
        let headers = OwnedHeaders::new().insert(Header {
            key: EVENT_TYPE_HEADER,
            value: Some("order.paid"),
        });
        let with_header = owned_message(Some("order.created"), Some(headers));
        assert_eq!(event_type_header(&with_header).as_deref(), Some("order.paid"));

        let key_only = owned_message(Some("order.shipped"), None);
        assert_eq!(event_type_header(&key_only).as_deref(), Some("order.shipped"));

        let bare = owned_message(None, None);
        assert_eq!(event_type_header(&bare), None);
    }

    #[test]
    fn test_dead_letter_headers() {
        let mut inbound = InboundMessage::new(TOPIC, Some("order.created".to_string()), b"{}".to_vec());
        inbound.delivery_attempt = 5;
        let entry = DeadLetter::new(&inbound, "order.created", "smtp down", Utc::now());

        let headers = dead_letter_headers(&entry);

        assert_eq!(entry.dlq_topic(), "order-event-topic.dlq");
        assert_eq!(header_value(&headers, EVENT_TYPE_HEADER).as_deref(), Some("order.created"));
        assert_eq!(header_value(&headers, DLQ_SOURCE_TOPIC_HEADER).as_deref(), Some(TOPIC));
        assert_eq!(header_value(&headers, DLQ_ERROR_HEADER).as_deref(), Some("smtp down"));
        assert_eq!(header_value(&headers, DLQ_FAILURE_COUNT_HEADER).as_deref(), Some("5"));
        assert_eq!(header_value(&headers, DLQ_ID_HEADER), Some(entry.id.to_string()));
        assert_eq!(
            header_value(&headers, DLQ_FIRST_FAILED_AT_HEADER),
            Some(entry.first_failed_at.to_rfc3339())
        );
    }

    // ========================================================================
    // Failure ledger
    // ========================================================================

    #[test]
    fn test_failure_ledger_counts_and_forgets() {
        let mut ledger = FailureLedger::default();
        let first_failed_at = Utc::now();

        assert_eq!(ledger.lookup(&key(0, 7)), (0, None));

        ledger.record_failure(key(0, 7), 2, first_failed_at);
        assert_eq!(ledger.lookup(&key(0, 7)), (2, Some(first_failed_at)));

        ledger.forget(&key(0, 7));
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn test_commit_settles_earlier_offsets_of_partition_only() {
        let mut ledger = FailureLedger::default();
        let now = Utc::now();

        ledger.record_failure(key(0, 5), 1, now);
        ledger.record_failure(key(0, 9), 1, now);
        ledger.record_failure(key(0, 12), 1, now);
        ledger.record_failure(key(1, 3), 1, now);
        ledger.record_failure(("audit".to_string(), 0, 2), 1, now);

        ledger.settle(&key(0, 9));

        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.lookup(&key(0, 5)), (0, None));
        assert_eq!(ledger.lookup(&key(0, 9)), (0, None));
        assert_eq!(ledger.lookup(&key(0, 12)).0, 1);
        assert_eq!(ledger.lookup(&key(1, 3)).0, 1);
    }

    #[tokio::test]
    async fn test_pause_waits_unless_cancelled() {
        let cancel = CancellationToken::new();

        let started = Instant::now();
        assert!(pause(&cancel, Duration::from_millis(30)).await);
        assert!(started.elapsed() >= Duration::from_millis(30));

        cancel.cancel();
        let started = Instant::now();
        assert!(!pause(&cancel, RECV_ERROR_BACKOFF).await);
        assert!(started.elapsed() < RECV_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_idle_failures_expire() {
        let mut ledger = FailureLedger::default();
        ledger.record_failure(key(0, 1), 1, Utc::now());
        tokio::time::sleep(Duration::from_millis(30)).await;
        ledger.record_failure(key(0, 2), 1, Utc::now());

        ledger.expire_idle(Duration::from_millis(20));

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.lookup(&key(0, 2)).0, 1);
    }
}
