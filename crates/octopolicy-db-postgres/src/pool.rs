//! Connection pool for the policy store.

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info};

use crate::config::PostgresConfig;
use crate::error::Result;

pub async fn connect(config: &PostgresConfig) -> Result<PgPool> {
    info!(
        url = %config.redacted_url(),
        max_connections = config.max_connections,
        "Connecting to PostgreSQL"
    );

    let pool = PoolOptions::<Postgres>::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.url)
        .await?;

    debug!(size = pool.size(), "PostgreSQL pool ready");
    Ok(pool)
}

/// Round-trips `SELECT 1`.
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx_core::query::query("SELECT 1").execute(pool).await?;
    Ok(())
}
