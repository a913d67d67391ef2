// Whale Pulse service entry point.
//
// Wires the collaborators together (constructor injection, no globals
// besides the runtime) and hands them to the orchestrator. Configuration
// errors are fatal here: the process refuses to start rather than run with
// a nonsense analysis surface.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use whale_pulse::accumulation::{AccumulationCalculator, CalculatorSettings};
use whale_pulse::config::Settings;
use whale_pulse::notifier::{NatsSink, Notifier};
use whale_pulse::price::{PriceProvider, PriceSource};
use whale_pulse::quality::{DataQualityValidator, QualityThresholds};
use whale_pulse::rpc::multicall::{BalanceReader, MulticallBatcher};
use whale_pulse::rpc::RpcClient;
use whale_pulse::scheduler::Orchestrator;
use whale_pulse::snapshot_job::SnapshotJob;
use whale_pulse::store;
use whale_pulse::store::metrics::{MetricStore, PgMetricStore};
use whale_pulse::store::snapshots::{PgSnapshotStore, SnapshotStore};
use whale_pulse::whales::{WhaleListProvider, WhaleSource};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    info!(
        network = %settings.network,
        top_n = settings.top_n,
        lookback_hours = settings.lookback_hours,
        snapshot_interval_hours = settings.snapshot_interval_hours,
        analysis_interval_hours = settings.analysis_interval_hours,
        "whale-pulse starting"
    );

    // ── Chain access ────────────────────────────────────────────────────
    let rpc = Arc::new(RpcClient::new(
        &settings.rpc_url,
        Duration::from_secs(settings.rpc_timeout_secs),
    )?);
    let reader: Arc<dyn BalanceReader> =
        Arc::new(MulticallBatcher::new(rpc, settings.chunk_size));
    let whales: Arc<dyn WhaleSource> = Arc::new(WhaleListProvider::new(
        reader.clone(),
        settings.candidates_path.clone(),
        settings.min_balance_wei,
    ));

    // ── Prices ──────────────────────────────────────────────────────────
    let prices: Arc<dyn PriceSource> = Arc::new(PriceProvider::new(
        &settings.price_api_url,
        Duration::from_secs(settings.http_timeout_secs),
    )?);

    // ── Persistence ─────────────────────────────────────────────────────
    let pool = store::connect_pool(&settings.database_url).await?;
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(PgSnapshotStore::new(pool.clone()).await?);
    let metrics: Arc<dyn MetricStore> = Arc::new(PgMetricStore::new(pool).await?);

    // ── Alerts ──────────────────────────────────────────────────────────
    let sink = Arc::new(NatsSink::connect(&settings.nats_url, &settings.network).await?);
    let notifier = Arc::new(Notifier::new(sink));

    // ── Jobs ────────────────────────────────────────────────────────────
    let snapshot_job = Arc::new(SnapshotJob::new(
        whales.clone(),
        reader.clone(),
        snapshots.clone(),
        settings.network.clone(),
        settings.top_n,
    ));
    let validator = Arc::new(DataQualityValidator::new(
        snapshots.clone(),
        metrics.clone(),
        settings.network.clone(),
        QualityThresholds {
            density_healthy: settings.density_healthy,
            density_degraded: settings.density_degraded,
            outlier_change_pct: settings.outlier_change_pct,
            lst_rate_lower: settings.lst_rate_lower,
            lst_rate_upper: settings.lst_rate_upper,
        },
    ));
    let calculator = Arc::new(AccumulationCalculator::new(
        whales,
        reader,
        prices,
        snapshots,
        metrics,
        CalculatorSettings::from_settings(&settings),
    ));

    let orchestrator = Arc::new(Orchestrator {
        snapshot_job,
        validator,
        calculator,
        notifier,
        snapshot_interval_hours: settings.snapshot_interval_hours,
        analysis_interval_hours: settings.analysis_interval_hours,
    });
    let handles = orchestrator.spawn();
    info!("scheduler running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, cancelling jobs");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
