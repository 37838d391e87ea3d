use async_trait::async_trait;

use super::aggregate::Order;
use super::value_objects::OrderStatus;

// ============================================================================
// Order Repository - Storage boundary consumed by the application service
// ============================================================================
//
// Lookups return `Ok(None)` for a missing row; `Err` is reserved for real
// storage failures. Implementations must make `update` atomic per order.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Order number already exists: {0}")]
    DuplicateOrderNo(String),

    #[error("Order {0} does not exist")]
    Missing(i64),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Store a new order and return it with its assigned id.
    async fn create(&self, order: Order) -> Result<Order, RepositoryError>;

    async fn update(&self, order: &Order) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Order>, RepositoryError>;

    async fn find_by_order_no(&self, order_no: &str) -> Result<Option<Order>, RepositoryError>;

    async fn find_by_user_id(&self, user_id: i64) -> Result<Vec<Order>, RepositoryError>;

    async fn find_all(&self) -> Result<Vec<Order>, RepositoryError>;

    async fn find_by_status(&self, status: OrderStatus) -> Result<Vec<Order>, RepositoryError>;
}
