use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use order_events::application::OrderService;
use order_events::config::AppConfig;
use order_events::domain::user::UserContact;
use order_events::messaging::{build_publisher, EventConsumer, RedeliveryPolicy, RedpandaConsumer};
use order_events::metrics::{self, Metrics};
use order_events::notification::{LoggingMailService, MailService, OrderNotificationHandler};
use order_events::persistence::{InMemoryOrderRepository, InMemoryUserDirectory};

const DEMO_USER_ID: i64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter, e.g. RUST_LOG=debug
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,order_events=debug")),
        )
        .init();

    tracing::info!("🚀 Starting order events service");

    let config = AppConfig::from_env()?;
    tracing::info!(
        broker_enabled = config.messaging.enabled,
        bootstrap_servers = %config.messaging.bootstrap_servers,
        topic = %config.messaging.topic,
        "Configuration loaded"
    );

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    if let Some(port) = config.metrics_port {
        let server_metrics = metrics.clone();
        std::thread::spawn(move || {
            let system = actix_web::rt::System::new();
            if let Err(e) = system.block_on(metrics::start_metrics_server(server_metrics, port)) {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    // === 2. Storage ===
    let repository = Arc::new(InMemoryOrderRepository::new());
    let users = Arc::new(InMemoryUserDirectory::new());
    users
        .insert(
            DEMO_USER_ID,
            UserContact {
                email: "demo.user@example.com".to_string(),
                name: "Demo User".to_string(),
            },
        )
        .await;

    // === 3. Publisher (falls back to memory when the broker is down) ===
    let handle = build_publisher(&config.messaging, Some(metrics.clone())).await;
    let publisher = handle.publisher();
    tracing::info!(
        backend = publisher.backend(),
        fallback = handle.is_fallback(),
        "Event publisher ready"
    );

    // === 4. Consumer (only with a live broker) ===
    let consumer = if handle.is_broker() {
        let mail: Option<Arc<dyn MailService>> = if config.mail_enabled {
            Some(Arc::new(LoggingMailService::new()))
        } else {
            None
        };

        let consumer = RedpandaConsumer::new(
            &config.messaging,
            RedeliveryPolicy::from_config(&config.messaging),
            Some(metrics.clone()),
        )?;
        consumer
            .subscribe(&config.messaging.topic, Arc::new(OrderNotificationHandler::new(mail)))
            .await?;
        consumer.start().await?;
        Some(consumer)
    } else {
        tracing::info!("Broker not available, event consumer not started");
        None
    };

    // === 5. Order lifecycle demo ===
    let service = OrderService::new(
        repository.clone(),
        publisher.clone(),
        config.messaging.topic.clone(),
        config.messaging.publish_timeout,
    )
    .with_users(users)
    .with_metrics(metrics.clone());

    tracing::info!("📝 Demonstrating order lifecycle");

    let delivered = service.create_order(DEMO_USER_ID, 99.99).await?.order.id;
    service.pay_order(delivered).await?;
    service.ship_order(delivered).await?;
    service.deliver_order(delivered).await?;

    let cancelled = service.create_order(DEMO_USER_ID, 25.50).await?.order.id;
    service.cancel_order(cancelled).await?;

    let refunded = service.create_order(DEMO_USER_ID, 42.00).await?.order.id;
    service.pay_order(refunded).await?;
    service.refund_order(refunded).await?;

    if let Err(e) = service.cancel_order(delivered).await {
        tracing::info!(error = %e, "Illegal transition rejected as expected");
    }

    for order in service.list_orders().await? {
        tracing::info!(
            order_id = order.id,
            order_no = %order.order_no,
            status = %order.status,
            "Order summary"
        );
    }

    if let Some(memory) = handle.memory() {
        tracing::info!(events = memory.len().await, "Events held in memory publisher");
    }

    // === 6. Run until Ctrl+C ===
    tracing::info!("⏳ Running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    if let Some(consumer) = consumer {
        consumer.close().await?;
    }
    if let Err(e) = publisher.close().await {
        tracing::warn!(error = %e, "Publisher did not close cleanly");
    }

    tracing::info!("👋 Stopped");
    Ok(())
}
