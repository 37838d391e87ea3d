// ============================================================================
// Messaging - event publication and consumption
// ============================================================================
//
// Outbound: `EventPublisher` with a Redpanda (Kafka protocol) backend and an
// in-memory fallback, selected once by `factory::build_publisher`.
//
// Inbound: `EventConsumer` implementations share the `Dispatcher` and a
// redelivery policy that ends in a dead letter: `<topic>.dlq` on the broker,
// a bounded in-process queue for the memory consumer.
//
// ============================================================================

pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod factory;
pub mod memory;
pub mod publisher;
pub mod redpanda;

pub use consumer::{ConsumerError, EventConsumer, MemoryEventConsumer, MemoryInbox, RedeliveryPolicy};
pub use dead_letter::{dlq_topic_for, DeadLetter, DeadLetterQueue, DlqStats, DEFAULT_DLQ_CAPACITY};
pub use dispatcher::{
    handler_fn, Delivery, Dispatcher, EventHandler, HandlerError, InboundMessage, ReceivedEvent,
};
pub use factory::{build_publisher, PublisherHandle};
pub use memory::{MemoryEventPublisher, PublishedEvent};
pub use publisher::{CloseError, EventPublisher, PublishError};
pub use redpanda::{RedpandaConsumer, RedpandaPublisher};
