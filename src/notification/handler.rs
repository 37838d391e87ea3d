use async_trait::async_trait;
use std::sync::Arc;

use super::mail::{MailService, OrderConfirmation};
use crate::domain::order::OrderEventKind;
use crate::messaging::{EventHandler, HandlerError, ReceivedEvent};

/// Reacts to order events from the broker.
///
/// Only `order.created` has a side effect (the confirmation mail). Mail
/// failures never fail the handler, so they do not cause redelivery.
pub struct OrderNotificationHandler {
    mail: Option<Arc<dyn MailService>>,
}

impl OrderNotificationHandler {
    pub fn new(mail: Option<Arc<dyn MailService>>) -> Self {
        Self { mail }
    }

    async fn on_created(&self, event: &ReceivedEvent) -> Result<(), HandlerError> {
        let Some(mail) = &self.mail else {
            tracing::info!("Mail service disabled, skipping order confirmation");
            return Ok(());
        };

        let payload = event.order_payload()?;
        let Some(email) = payload.user_email.as_deref() else {
            tracing::info!(
                order_id = payload.order_id,
                "Order has no owner email, skipping confirmation"
            );
            return Ok(());
        };
        let name = payload.user_name.as_deref().unwrap_or("customer");

        match mail
            .send_order_confirmation_mail(email, name, &OrderConfirmation::from(&payload))
            .await
        {
            Ok(()) => tracing::info!(
                order_id = payload.order_id,
                order_no = %payload.order_no,
                "Order confirmation mail sent"
            ),
            Err(e) => tracing::error!(
                order_id = payload.order_id,
                error = %e,
                "Failed to send order confirmation mail (order processing unaffected)"
            ),
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for OrderNotificationHandler {
    async fn handle(&self, event: ReceivedEvent) -> Result<(), HandlerError> {
        tracing::info!(
            event_type = %event.kind,
            order_id = ?event.get_i64("order_id"),
            occurred_on = %event.occurred_on(),
            "Handling order event"
        );

        match OrderEventKind::parse(&event.kind) {
            Some(OrderEventKind::Created) => self.on_created(&event).await?,
            Some(OrderEventKind::Paid) => {
                tracing::info!("Order paid: fulfilment and marketing updates can start")
            }
            Some(OrderEventKind::Shipped) => tracing::info!("Order shipped: tracking can be shared"),
            Some(OrderEventKind::Delivered) => tracing::info!("Order delivered"),
            Some(OrderEventKind::Cancelled) => {
                tracing::info!("Order cancelled: inventory rollback can start")
            }
            Some(OrderEventKind::Refunded) => tracing::info!("Order refunded: settle with payments"),
            None => tracing::warn!(event_type = %event.kind, "Unknown order event type"),
        }

        Ok(())
    }
}
