use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::domain::order::{
    DomainEvent, IllegalTransitionError, Order, OrderCommand, OrderEventKind, OrderRepository,
    OrderStatus, RepositoryError, ValidationError,
};
use crate::domain::user::{UserContact, UserDirectory};
use crate::messaging::{EventPublisher, PublishError};
use crate::metrics::Metrics;

/// Extra time the service allows a publisher past `publish_timeout`.
const PUBLISH_GUARD_GRACE: Duration = Duration::from_millis(250);

// ============================================================================
// Order Service - Application Layer
// ============================================================================
//
// Every command follows the same shape:
//   load -> transition -> persist -> publish (best effort) -> receipt
//
// Storage is the source of truth. Nothing is published unless the write
// succeeded, and a failed publish never fails the command; it is logged with
// the full event for manual replay and reported in the receipt.
//
// ============================================================================

#[derive(Debug, Error)]
pub enum OrderServiceError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransitionError),

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] RepositoryError),
}

/// Read model returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderView {
    pub id: i64,
    pub order_no: String,
    pub user_id: i64,
    pub amount: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id(),
            order_no: order.order_no().to_string(),
            user_id: order.user_id(),
            amount: order.amount(),
            status: order.status(),
            created_at: order.created_at(),
            updated_at: order.updated_at(),
        }
    }
}

/// What happened to the event built for a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDelivery {
    Published,
    Dropped { reason: String },
}

impl EventDelivery {
    pub fn is_published(&self) -> bool {
        matches!(self, EventDelivery::Published)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandReceipt {
    pub order: OrderView,
    pub event: EventDelivery,
}

/// `ORD` + Unix nanoseconds + 4-digit sequence.
#[derive(Default)]
struct OrderNumberGenerator {
    sequence: AtomicU64,
}

impl OrderNumberGenerator {
    fn next(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) % 10_000;
        format!("ORD{}{:04}", nanos, sequence)
    }
}

pub struct OrderService {
    repository: Arc<dyn OrderRepository>,
    publisher: Arc<dyn EventPublisher>,
    users: Option<Arc<dyn UserDirectory>>,
    topic: String,
    publish_timeout: Duration,
    order_numbers: OrderNumberGenerator,
    metrics: Option<Arc<Metrics>>,
}

impl OrderService {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        publisher: Arc<dyn EventPublisher>,
        topic: impl Into<String>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            publisher,
            users: None,
            topic: topic.into(),
            publish_timeout,
            order_numbers: OrderNumberGenerator::default(),
            metrics: None,
        }
    }

    /// Look up owners so events carry their email and name.
    pub fn with_users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub async fn create_order(&self, user_id: i64, amount: f64) -> Result<CommandReceipt, OrderServiceError> {
        let result = self.try_create(user_id, amount).await;
        self.record_command("create", result.is_ok());

        if let Err(e) = &result {
            tracing::warn!(user_id = user_id, amount = amount, error = %e, "Order creation rejected");
        }
        result
    }

    pub async fn pay_order(&self, order_id: i64) -> Result<CommandReceipt, OrderServiceError> {
        self.execute(order_id, OrderCommand::Pay).await
    }

    pub async fn ship_order(&self, order_id: i64) -> Result<CommandReceipt, OrderServiceError> {
        self.execute(order_id, OrderCommand::Ship).await
    }

    pub async fn deliver_order(&self, order_id: i64) -> Result<CommandReceipt, OrderServiceError> {
        self.execute(order_id, OrderCommand::Deliver).await
    }

    pub async fn cancel_order(&self, order_id: i64) -> Result<CommandReceipt, OrderServiceError> {
        self.execute(order_id, OrderCommand::Cancel).await
    }

    pub async fn refund_order(&self, order_id: i64) -> Result<CommandReceipt, OrderServiceError> {
        self.execute(order_id, OrderCommand::Refund).await
    }

    async fn try_create(&self, user_id: i64, amount: f64) -> Result<CommandReceipt, OrderServiceError> {
        if user_id <= 0 {
            return Err(OrderServiceError::InvalidCommand(format!(
                "user_id must be positive, got {}",
                user_id
            )));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(OrderServiceError::InvalidCommand(format!(
                "amount must be a positive number, got {}",
                amount
            )));
        }

        let order = Order::create(self.order_numbers.next(), user_id, amount)?;
        let order = self.repository.create(order).await?;

        tracing::info!(
            order_id = order.id(),
            order_no = %order.order_no(),
            user_id = user_id,
            amount = amount,
            "✅ Order created"
        );

        let event = self.publish_event(OrderEventKind::Created, &order).await;
        Ok(CommandReceipt {
            order: OrderView::from(&order),
            event,
        })
    }

    async fn execute(&self, order_id: i64, command: OrderCommand) -> Result<CommandReceipt, OrderServiceError> {
        let result = self.try_transition(order_id, command).await;
        self.record_command(command.as_str(), result.is_ok());

        if let Err(e) = &result {
            tracing::warn!(order_id = order_id, command = %command, error = %e, "Order command rejected");
        }
        result
    }

    async fn try_transition(&self, order_id: i64, command: OrderCommand) -> Result<CommandReceipt, OrderServiceError> {
        let mut order = self.load(order_id).await?;
        let from = order.status();

        order.apply(command)?;
        self.repository.update(&order).await?;

        tracing::info!(
            order_id = order_id,
            command = %command,
            from = %from,
            to = %order.status(),
            "Order transitioned"
        );

        let event = self.publish_event(command.event_kind(), &order).await;
        Ok(CommandReceipt {
            order: OrderView::from(&order),
            event,
        })
    }

    async fn load(&self, order_id: i64) -> Result<Order, OrderServiceError> {
        self.repository
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| OrderServiceError::NotFound(format!("id {}", order_id)))
    }

    // ========================================================================
    // Publication
    // ========================================================================

    async fn owner_contact(&self, user_id: i64) -> Option<UserContact> {
        let users = self.users.as_ref()?;

        match users.find_contact(user_id).await {
            Ok(contact) => contact,
            Err(e) => {
                tracing::warn!(
                    user_id = user_id,
                    error = %e,
                    "Owner lookup failed, publishing event without contact details"
                );
                None
            }
        }
    }

    async fn publish_event(&self, kind: OrderEventKind, order: &Order) -> EventDelivery {
        let owner = self.owner_contact(order.user_id()).await;
        let event = DomainEvent::for_order(kind, order, owner.as_ref());
        let started = Instant::now();

        // Publishers enforce `publish_timeout` themselves. The grace lets the
        // broker publisher count its own timeout before this guard drops it.
        let outcome = match tokio::time::timeout(
            self.publish_timeout + PUBLISH_GUARD_GRACE,
            self.publisher.publish(&self.topic, &event),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.publish_timeout)),
        };

        match outcome {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_published(
                        kind.as_str(),
                        self.publisher.backend(),
                        started.elapsed().as_secs_f64(),
                    );
                }
                tracing::debug!(
                    order_id = order.id(),
                    event_type = %kind,
                    backend = self.publisher.backend(),
                    "Order event published"
                );
                EventDelivery::Published
            }
            Err(e) => {
                let payload = event
                    .to_json()
                    .unwrap_or_else(|json_err| format!("<unserializable event: {}>", json_err));

                tracing::error!(
                    order_id = order.id(),
                    event_type = %kind,
                    topic = %self.topic,
                    error = %e,
                    event = %payload,
                    "Failed to publish order event (order state is saved, replay manually)"
                );

                if let Some(metrics) = &self.metrics {
                    metrics.record_publish_failure(kind.as_str(), e.reason());
                }
                EventDelivery::Dropped {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn record_command(&self, command: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_command(command, success);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_order(&self, order_id: i64) -> Result<OrderView, OrderServiceError> {
        self.load(order_id).await.map(|order| OrderView::from(&order))
    }

    pub async fn get_order_by_no(&self, order_no: &str) -> Result<OrderView, OrderServiceError> {
        self.repository
            .find_by_order_no(order_no)
            .await?
            .map(|order| OrderView::from(&order))
            .ok_or_else(|| OrderServiceError::NotFound(format!("order_no {}", order_no)))
    }

    pub async fn list_user_orders(&self, user_id: i64) -> Result<Vec<OrderView>, OrderServiceError> {
        Ok(views(self.repository.find_by_user_id(user_id).await?))
    }

    pub async fn list_orders(&self) -> Result<Vec<OrderView>, OrderServiceError> {
        Ok(views(self.repository.find_all().await?))
    }

    pub async fn list_orders_by_status(&self, status: OrderStatus) -> Result<Vec<OrderView>, OrderServiceError> {
        Ok(views(self.repository.find_by_status(status).await?))
    }
}

fn views(orders: Vec<Order>) -> Vec<OrderView> {
    orders.iter().map(OrderView::from).collect()
}
