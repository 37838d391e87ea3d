use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::order::OrderEventPayload;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid email address: {0}")]
    InvalidAddress(String),
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

/// Order details rendered into a confirmation mail.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderConfirmation {
    pub order_id: i64,
    pub order_no: String,
    pub total_amount: f64,
    pub status: String,
}

impl From<&OrderEventPayload> for OrderConfirmation {
    fn from(payload: &OrderEventPayload) -> Self {
        Self {
            order_id: payload.order_id,
            order_no: payload.order_no.clone(),
            total_amount: payload.total_amount,
            status: payload.status.to_string(),
        }
    }
}

#[async_trait]
pub trait MailService: Send + Sync {
    async fn send_order_confirmation_mail(
        &self,
        user_email: &str,
        user_name: &str,
        order: &OrderConfirmation,
    ) -> Result<(), MailError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Renders confirmation mails and writes them to the log instead of an
/// SMTP server.
#[derive(Default)]
pub struct LoggingMailService {
    sent: RwLock<Vec<SentMail>>,
}

impl LoggingMailService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.read().await.clone()
    }
}

fn is_valid_email(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

fn render_confirmation(user_name: &str, order: &OrderConfirmation) -> String {
    format!(
        "Hello {},\n\nThank you for your order.\n\nOrder number: {}\nOrder id: {}\nTotal: {:.2}\nStatus: {}\n",
        user_name, order.order_no, order.order_id, order.total_amount, order.status
    )
}

#[async_trait]
impl MailService for LoggingMailService {
    async fn send_order_confirmation_mail(
        &self,
        user_email: &str,
        user_name: &str,
        order: &OrderConfirmation,
    ) -> Result<(), MailError> {
        if !is_valid_email(user_email) {
            return Err(MailError::InvalidAddress(user_email.to_string()));
        }

        let mail = SentMail {
            to: user_email.to_string(),
            subject: format!("Order confirmation - {}", order.order_no),
            body: render_confirmation(user_name, order),
        };

        tracing::info!(
            to = %mail.to,
            subject = %mail.subject,
            order_id = order.order_id,
            "📧 Order confirmation mail"
        );
        tracing::debug!(body = %mail.body, "Mail body");

        self.sent.write().await.push(mail);
        Ok(())
    }
}
