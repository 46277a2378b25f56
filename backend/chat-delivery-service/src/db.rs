use crate::error::AppError;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::info;

const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_delivery_core",
    include_str!("../migrations/0001_delivery_core.sql"),
)];

/// Build a deadpool-postgres pool and verify it can reach the database.
pub async fn init_pool(database_url: &str, max_connections: usize) -> Result<Pool, AppError> {
    let pg_config: PgConfig = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
    let pool = Pool::builder(mgr)
        .max_size(max_connections)
        .build()
        .map_err(|e| AppError::StartServer(format!("db pool: {e}")))?;

    let verify = async {
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok::<(), AppError>(())
    };
    tokio::time::timeout(Duration::from_secs(5), verify)
        .await
        .map_err(|_| AppError::Unavailable("database connect timed out".into()))??;

    info!(max_connections, "database pool created and verified");
    Ok(pool)
}

/// Apply bundled migrations that have not run yet.
pub async fn run_migrations(pool: &Pool) -> Result<(), AppError> {
    let mut client = pool.get().await?;
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                 version TEXT PRIMARY KEY,
                 applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
             )",
        )
        .await?;

    for (version, sql) in MIGRATIONS {
        let tx = client.transaction().await?;
        // Serializes concurrent starters on the same database.
        tx.batch_execute("LOCK TABLE schema_migrations IN EXCLUSIVE MODE")
            .await?;
        let applied = tx
            .query_opt(
                "SELECT 1 FROM schema_migrations WHERE version = $1",
                &[version],
            )
            .await?
            .is_some();
        if !applied {
            tx.batch_execute(sql).await?;
            tx.execute(
                "INSERT INTO schema_migrations (version) VALUES ($1)",
                &[version],
            )
            .await?;
            info!(version, "applied migration");
        }
        tx.commit().await?;
    }
    Ok(())
}
