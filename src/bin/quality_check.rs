// Standalone data-quality check.
//
// Runs the five-check validator once against the configured database and
// prints the report as JSON. Exit code mirrors the status: 0 healthy,
// 1 degraded, 2 critical. Usable directly from cron or CI health probes.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use whale_pulse::config::Settings;
use whale_pulse::quality::{DataQualityValidator, QualityThresholds};
use whale_pulse::store;
use whale_pulse::store::metrics::PgMetricStore;
use whale_pulse::store::snapshots::PgSnapshotStore;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let settings = Settings::from_env()?;

    let pool = store::connect_pool(&settings.database_url).await?;
    let snapshots = Arc::new(PgSnapshotStore::new(pool.clone()).await?);
    let metrics = Arc::new(PgMetricStore::new(pool).await?);

    let validator = DataQualityValidator::new(
        snapshots,
        metrics,
        settings.network.clone(),
        QualityThresholds {
            density_healthy: settings.density_healthy,
            density_degraded: settings.density_degraded,
            outlier_change_pct: settings.outlier_change_pct,
            lst_rate_lower: settings.lst_rate_lower,
            lst_rate_upper: settings.lst_rate_upper,
        },
    );

    let report = validator.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    std::process::exit(report.overall_status.exit_code());
}
