use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::commands::OrderCommand;
use super::errors::{IllegalTransitionError, ValidationError};
use super::value_objects::OrderStatus;

// ============================================================================
// Order Aggregate - Domain Logic
// ============================================================================
//
// Pure state machine. No storage or messaging concerns live here; the
// application service loads, persists and publishes around it.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    // Identity (id is assigned by the repository, 0 until persisted)
    id: i64,
    order_no: String,

    // Current State
    user_id: i64,
    amount: f64,
    status: OrderStatus,

    // Audit Trail
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new `PENDING` order after validating its inputs.
    pub fn create(
        order_no: impl Into<String>,
        user_id: i64,
        amount: f64,
    ) -> Result<Self, ValidationError> {
        let order_no = order_no.into();

        if order_no.trim().is_empty() {
            return Err(ValidationError::EmptyOrderNo);
        }
        if user_id <= 0 {
            return Err(ValidationError::InvalidUserId(user_id));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(ValidationError::InvalidAmount(amount));
        }

        let now = Utc::now();
        Ok(Self {
            id: 0,
            order_no,
            user_id,
            amount,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    /// Rebuild an order read back from storage.
    pub fn from_parts(
        id: i64,
        order_no: String,
        user_id: i64,
        amount: f64,
        status: OrderStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            order_no,
            user_id,
            amount,
            status,
            created_at,
            updated_at,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn pay(&mut self) -> Result<(), IllegalTransitionError> {
        self.apply(OrderCommand::Pay)
    }

    pub fn ship(&mut self) -> Result<(), IllegalTransitionError> {
        self.apply(OrderCommand::Ship)
    }

    pub fn deliver(&mut self) -> Result<(), IllegalTransitionError> {
        self.apply(OrderCommand::Deliver)
    }

    pub fn cancel(&mut self) -> Result<(), IllegalTransitionError> {
        self.apply(OrderCommand::Cancel)
    }

    pub fn refund(&mut self) -> Result<(), IllegalTransitionError> {
        self.apply(OrderCommand::Refund)
    }

    /// Apply a command. On failure the order is left untouched.
    pub fn apply(&mut self, command: OrderCommand) -> Result<(), IllegalTransitionError> {
        let next = command
            .target_from(self.status)
            .ok_or(IllegalTransitionError {
                command,
                current: self.status,
            })?;

        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn order_no(&self) -> &str {
        &self.order_no
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    pub fn is_paid(&self) -> bool {
        self.status == OrderStatus::Paid
    }

    pub fn can_cancel(&self) -> bool {
        OrderCommand::Cancel.target_from(self.status).is_some()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_order() -> Order {
        Order::create("ORD-TEST-001", 100, 99.99).unwrap()
    }

    fn order_in(status: OrderStatus) -> Order {
        let now = Utc::now();
        Order::from_parts(1, "ORD-TEST-001".to_string(), 100, 10.0, status, now, now)
    }

    #[test]
    fn test_create_order() {
        let order = create_test_order();

        assert_eq!(order.id(), 0);
        assert_eq!(order.order_no(), "ORD-TEST-001");
        assert_eq!(order.user_id(), 100);
        assert_eq!(order.amount(), 99.99);
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.created_at(), order.updated_at());
        assert!(order.is_pending());
        assert!(order.can_cancel());
    }

    #[test]
    fn test_create_rejects_invalid_input() {
        assert_eq!(
            Order::create("", 100, 1.0).unwrap_err(),
            ValidationError::EmptyOrderNo
        );
        assert_eq!(
            Order::create("   ", 100, 1.0).unwrap_err(),
            ValidationError::EmptyOrderNo
        );
        assert_eq!(
            Order::create("ORD-1", 0, 1.0).unwrap_err(),
            ValidationError::InvalidUserId(0)
        );
        assert_eq!(
            Order::create("ORD-1", -5, 1.0).unwrap_err(),
            ValidationError::InvalidUserId(-5)
        );
        assert!(matches!(
            Order::create("ORD-1", 100, 0.0).unwrap_err(),
            ValidationError::InvalidAmount(_)
        ));
        assert!(matches!(
            Order::create("ORD-1", 100, -1.0).unwrap_err(),
            ValidationError::InvalidAmount(_)
        ));
        assert!(matches!(
            Order::create("ORD-1", 100, f64::NAN).unwrap_err(),
            ValidationError::InvalidAmount(_)
        ));
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut order = create_test_order();

        order.pay().unwrap();
        assert!(order.is_paid());

        order.ship().unwrap();
        assert_eq!(order.status(), OrderStatus::Shipped);

        order.deliver().unwrap();
        assert_eq!(order.status(), OrderStatus::Delivered);
        assert!(order.updated_at() >= order.created_at());
    }

    #[test]
    fn test_cancel_only_from_pending() {
        let mut order = create_test_order();
        order.cancel().unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);

        let mut paid = order_in(OrderStatus::Paid);
        let err = paid.cancel().unwrap_err();
        assert_eq!(err.command, OrderCommand::Cancel);
        assert_eq!(err.current, OrderStatus::Paid);
        assert_eq!(paid.status(), OrderStatus::Paid);
    }

    #[test]
    fn test_refund_from_paid_and_shipped() {
        let mut paid = order_in(OrderStatus::Paid);
        paid.refund().unwrap();
        assert_eq!(paid.status(), OrderStatus::Refunded);

        let mut shipped = order_in(OrderStatus::Shipped);
        shipped.refund().unwrap();
        assert_eq!(shipped.status(), OrderStatus::Refunded);

        let mut pending = create_test_order();
        assert!(pending.refund().is_err());
    }

    #[test]
    fn test_pay_twice_fails() {
        let mut order = create_test_order();
        order.pay().unwrap();

        let err = order.pay().unwrap_err();
        assert_eq!(err.to_string(), "Cannot pay order in status PAID");
        assert_eq!(order.status(), OrderStatus::Paid);
    }

    #[test]
    fn test_illegal_transitions_leave_order_unchanged() {
        for status in OrderStatus::ALL {
            for command in OrderCommand::ALL {
                if command.target_from(status).is_some() {
                    continue;
                }

                let mut order = order_in(status);
                let before = order.clone();

                let err = order.apply(command).unwrap_err();
                assert_eq!(err, IllegalTransitionError { command, current: status });
                assert_eq!(order, before);
            }
        }
    }
}
