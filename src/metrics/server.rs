use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

use super::Metrics;
use crate::utils::CircuitState;

/// Serve /metrics and /health until the server stops.
/// Runs its own actix system, so call it from a dedicated thread.
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(metrics.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(metrics: web::Data<Arc<Metrics>>) -> impl Responder {
    let encoder = TextEncoder::new();
    let families = metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

async fn health_handler(metrics: web::Data<Arc<Metrics>>) -> impl Responder {
    HttpResponse::Ok().json(health_status(&metrics))
}

/// An open producer circuit means events are being dropped, so the service
/// reports itself degraded while commands keep working.
fn health_status(metrics: &Metrics) -> serde_json::Value {
    let breaker = CircuitState::from_code(metrics.circuit_breaker_state.get()).unwrap_or(CircuitState::Closed);
    let status = match breaker {
        CircuitState::Open => "degraded",
        CircuitState::Closed | CircuitState::HalfOpen => "healthy",
    };

    serde_json::json!({
        "status": status,
        "service": "order-events",
        "circuit_breaker": breaker.as_str()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_reports_circuit_state() {
        let metrics = Metrics::new().unwrap();

        let health = health_status(&metrics);
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["circuit_breaker"], "closed");

        metrics.update_circuit_breaker_state(CircuitState::Open.code());
        let health = health_status(&metrics);
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["circuit_breaker"], "open");

        metrics.update_circuit_breaker_state(CircuitState::HalfOpen.code());
        assert_eq!(health_status(&metrics)["circuit_breaker"], "half_open");
    }
}
