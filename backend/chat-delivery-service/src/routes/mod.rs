pub mod conversations;
pub mod messages;
pub mod notifications;
pub mod wsroute;

use crate::metrics;
use actix_web::{get, web, HttpResponse};

#[get("/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

#[get("/metrics")]
pub async fn prometheus_metrics() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::gather_text())
}

/// Every HTTP and WebSocket route of the service
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health).service(prometheus_metrics);
    messages::configure(cfg);
    conversations::configure(cfg);
    notifications::configure(cfg);
    cfg.service(wsroute::ws_handler);
}
