use actix_web::{middleware::Logger, web, App, HttpServer};
use chat_delivery_service::{
    clock::SystemClock,
    config, db, error, logging, metrics, routes,
    services::{Backends, CoreSettings, MessagingCore},
    state::AppState,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let backends = match &cfg.database_url {
        Some(url) => {
            let pool = db::init_pool(url, cfg.db_max_connections)
                .await
                .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| error::AppError::StartServer(format!("migrations: {e}")))?;
            Backends::postgres(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store (data is lost on restart)");
            Backends::in_memory()
        }
    };

    let core = MessagingCore::new(backends, Arc::new(SystemClock), CoreSettings::from(&*cfg));
    let state = AppState::new(core.clone(), cfg.clone());

    // Expire subscriptions of clients that vanished without closing
    let sweep_every = Duration::from_secs(cfg.subscription_sweep_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            ticker.tick().await;
            metrics::set_fanout_lanes(core.dispatcher().active_lanes());
            match core.sweep_expired().await {
                Ok(0) => {}
                Ok(notified) => tracing::debug!(notified, "expired subscriptions swept"),
                Err(e) => tracing::error!(error = %e, "subscription sweep failed"),
            }
        }
    });

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting chat-delivery-service");

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind REST: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("REST server: {e}")))
}
