use super::commands::OrderCommand;
use super::value_objects::OrderStatus;

// ============================================================================
// Order Business Rule Errors
// ============================================================================

/// Malformed input for a new order. User-correctable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Order number cannot be empty")]
    EmptyOrderNo,

    #[error("Invalid user id: {0}")]
    InvalidUserId(i64),

    #[error("Invalid order amount: {0}")]
    InvalidAmount(f64),
}

/// A command the state machine does not allow from the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Cannot {command} order in status {current}")]
pub struct IllegalTransitionError {
    pub command: OrderCommand,
    pub current: OrderStatus,
}
