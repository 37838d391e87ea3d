use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::aggregate::Order;
use super::value_objects::OrderStatus;
use crate::domain::user::UserContact;

// ============================================================================
// Order Events - Domain Events for Order Aggregate
// ============================================================================
//
// Wire format (JSON, one object per message):
//
//   {"type":"order.paid","timestamp":"2024-02-11T10:00:00Z","order_id":1,
//    "order_no":"ORD...","user_id":100,"total_amount":99.99,"status":"PAID"}
//
// `user_email` / `user_name` are present only when the owner is known.
// The broker key and `event_type` header carry the same value as `type`.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderEventKind {
    #[serde(rename = "order.created")]
    Created,
    #[serde(rename = "order.paid")]
    Paid,
    #[serde(rename = "order.shipped")]
    Shipped,
    #[serde(rename = "order.delivered")]
    Delivered,
    #[serde(rename = "order.cancelled")]
    Cancelled,
    #[serde(rename = "order.refunded")]
    Refunded,
}

impl OrderEventKind {
    pub const ALL: [OrderEventKind; 6] = [
        OrderEventKind::Created,
        OrderEventKind::Paid,
        OrderEventKind::Shipped,
        OrderEventKind::Delivered,
        OrderEventKind::Cancelled,
        OrderEventKind::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventKind::Created => "order.created",
            OrderEventKind::Paid => "order.paid",
            OrderEventKind::Shipped => "order.shipped",
            OrderEventKind::Delivered => "order.delivered",
            OrderEventKind::Cancelled => "order.cancelled",
            OrderEventKind::Refunded => "order.refunded",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for OrderEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order snapshot carried by every order event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEventPayload {
    pub order_id: i64,
    pub order_no: String,
    pub user_id: i64,
    pub total_amount: f64,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// Immutable record of a completed order transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    kind: OrderEventKind,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    payload: OrderEventPayload,
}

impl DomainEvent {
    /// Build an event describing `order` as it is now.
    pub fn for_order(kind: OrderEventKind, order: &Order, owner: Option<&UserContact>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload: OrderEventPayload {
                order_id: order.id(),
                order_no: order.order_no().to_string(),
                user_id: order.user_id(),
                total_amount: order.amount(),
                status: order.status(),
                user_email: owner.map(|o| o.email.clone()),
                user_name: owner.map(|o| o.name.clone()),
            },
        }
    }

    pub fn kind(&self) -> OrderEventKind {
        self.kind
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &OrderEventPayload {
        &self.payload
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paid_order() -> Order {
        let mut order = Order::create("ORD-20240211001", 100, 99.99)
            .unwrap()
            .with_id(1001);
        order.pay().unwrap();
        order
    }

    #[test]
    fn test_event_carries_order_state() {
        let order = paid_order();
        let event = DomainEvent::for_order(OrderEventKind::Paid, &order, None);

        assert_eq!(event.event_type(), "order.paid");
        assert_eq!(event.payload().order_id, 1001);
        assert_eq!(event.payload().order_no, "ORD-20240211001");
        assert_eq!(event.payload().user_id, 100);
        assert_eq!(event.payload().total_amount, 99.99);
        assert_eq!(event.payload().status, order.status());
    }

    #[test]
    fn test_wire_format_fields() {
        let owner = UserContact {
            email: "user@example.com".to_string(),
            name: "Alice".to_string(),
        };
        let event = DomainEvent::for_order(OrderEventKind::Paid, &paid_order(), Some(&owner));

        let value: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();

        assert_eq!(value["type"], "order.paid");
        assert_eq!(value["order_id"], 1001);
        assert_eq!(value["order_no"], "ORD-20240211001");
        assert_eq!(value["user_id"], 100);
        assert_eq!(value["total_amount"], 99.99);
        assert_eq!(value["status"], "PAID");
        assert_eq!(value["user_email"], "user@example.com");
        assert_eq!(value["user_name"], "Alice");

        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_contact_fields_omitted_when_unknown() {
        let event = DomainEvent::for_order(OrderEventKind::Paid, &paid_order(), None);
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert!(value.get("user_email").is_none());
        assert!(value.get("user_name").is_none());
    }

    #[test]
    fn test_event_roundtrip() {
        let event = DomainEvent::for_order(OrderEventKind::Paid, &paid_order(), None);

        let decoded = DomainEvent::from_slice(&event.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.event_type(), event.event_type());
        assert_eq!(decoded.payload().order_no, event.payload().order_no);
        assert_eq!(decoded.payload().user_id, event.payload().user_id);
        assert_eq!(decoded.payload().total_amount, event.payload().total_amount);
        assert_eq!(decoded.payload().status, event.payload().status);
        assert_eq!(decoded.occurred_at(), event.occurred_at());
    }

    #[test]
    fn test_event_kind_names() {
        for kind in OrderEventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(OrderEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(OrderEventKind::parse("order.lost"), None);
    }
}
