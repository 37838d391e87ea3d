pub mod order_service;

pub use order_service::{CommandReceipt, EventDelivery, OrderService, OrderServiceError, OrderView};
