//! Persistence capabilities.
//!
//! Two capability traits (`SnapshotStore`, `MetricStore`), each with a
//! Postgres implementation and an in-memory implementation. The snapshot and
//! metric tables are the only shared mutable state in the system; all access
//! goes through these traits.

pub mod metrics;
pub mod snapshots;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// One pool shared by both stores.
pub async fn connect_pool(database_url: &str) -> eyre::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(60))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;
    info!("Connected to PostgreSQL");
    Ok(pool)
}
