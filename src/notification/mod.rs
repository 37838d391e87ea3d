// ============================================================================
// Notification - consumer-side reactions to order events
// ============================================================================

pub mod handler;
pub mod mail;

pub use handler::OrderNotificationHandler;
pub use mail::{LoggingMailService, MailError, MailService, OrderConfirmation, SentMail};
