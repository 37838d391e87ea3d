use std::fmt;

use super::events::OrderEventKind;
use super::value_objects::OrderStatus;

// ============================================================================
// Order Commands - State transitions a caller can request
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderCommand {
    Pay,
    Ship,
    Deliver,
    Cancel,
    Refund,
}

impl OrderCommand {
    pub const ALL: [OrderCommand; 5] = [
        OrderCommand::Pay,
        OrderCommand::Ship,
        OrderCommand::Deliver,
        OrderCommand::Cancel,
        OrderCommand::Refund,
    ];

    /// The transition table: the status this command leads to from `current`,
    /// or `None` when the command is not allowed there.
    pub fn target_from(&self, current: OrderStatus) -> Option<OrderStatus> {
        use OrderStatus::*;

        match (self, current) {
            (OrderCommand::Pay, Pending) => Some(Paid),
            (OrderCommand::Cancel, Pending) => Some(Cancelled),
            (OrderCommand::Ship, Paid) => Some(Shipped),
            (OrderCommand::Refund, Paid | Shipped) => Some(Refunded),
            (OrderCommand::Deliver, Shipped) => Some(Delivered),
            _ => None,
        }
    }

    /// Event emitted once this command has been applied and persisted.
    pub fn event_kind(&self) -> OrderEventKind {
        match self {
            OrderCommand::Pay => OrderEventKind::Paid,
            OrderCommand::Ship => OrderEventKind::Shipped,
            OrderCommand::Deliver => OrderEventKind::Delivered,
            OrderCommand::Cancel => OrderEventKind::Cancelled,
            OrderCommand::Refund => OrderEventKind::Refunded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderCommand::Pay => "pay",
            OrderCommand::Ship => "ship",
            OrderCommand::Deliver => "deliver",
            OrderCommand::Cancel => "cancel",
            OrderCommand::Refund => "refund",
        }
    }
}

impl fmt::Display for OrderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_exactly_the_documented_one() {
        use OrderStatus::*;

        let allowed = [
            (OrderCommand::Pay, Pending, Paid),
            (OrderCommand::Cancel, Pending, Cancelled),
            (OrderCommand::Ship, Paid, Shipped),
            (OrderCommand::Refund, Paid, Refunded),
            (OrderCommand::Refund, Shipped, Refunded),
            (OrderCommand::Deliver, Shipped, Delivered),
        ];

        for command in OrderCommand::ALL {
            for status in OrderStatus::ALL {
                let expected = allowed
                    .iter()
                    .find(|(c, from, _)| *c == command && *from == status)
                    .map(|(_, _, to)| *to);
                assert_eq!(
                    command.target_from(status),
                    expected,
                    "{} from {}",
                    command,
                    status
                );
            }
        }
    }

    #[test]
    fn test_terminal_statuses_allow_nothing() {
        for status in OrderStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for command in OrderCommand::ALL {
                assert!(command.target_from(status).is_none());
            }
        }
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(OrderCommand::Pay.event_kind().as_str(), "order.paid");
        assert_eq!(OrderCommand::Refund.event_kind().as_str(), "order.refunded");
    }
}
