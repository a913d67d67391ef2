//! Accumulation metric persistence. Append-only.

use crate::types::{addr_key, AccumulationMetric, QualityStatus, Tag};
use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use tracing::info;

#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Append one metric row, returning its id.
    async fn save_metric(&self, metric: &AccumulationMetric) -> eyre::Result<i64>;

    async fn get_latest(&self, network: &str) -> eyre::Result<Option<AccumulationMetric>>;

    /// All metrics with `computed_at >= since`, oldest first.
    async fn get_since(
        &self,
        network: &str,
        since: DateTime<Utc>,
    ) -> eyre::Result<Vec<AccumulationMetric>>;
}

// ─── Postgres ────────────────────────────────────────────────────────────────

pub struct PgMetricStore {
    pool: PgPool,
}

impl PgMetricStore {
    pub async fn new(pool: PgPool) -> eyre::Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> eyre::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accumulation_metric (
                id                        BIGSERIAL PRIMARY KEY,
                computed_at               TIMESTAMPTZ NOT NULL,
                lookback_hours            INTEGER NOT NULL,
                network                   TEXT NOT NULL,
                analyzed_count            INTEGER NOT NULL,
                score_native_pct          NUMERIC,
                score_lst_adjusted_pct    NUMERIC,
                total_weth_as_eth         NUMERIC NOT NULL,
                total_steth_as_eth        NUMERIC NOT NULL,
                steth_rate_used           NUMERIC NOT NULL,
                accumulators_count        INTEGER NOT NULL,
                distributors_count        INTEGER NOT NULL,
                neutral_count             INTEGER NOT NULL,
                concentration_gini        NUMERIC,
                mad_threshold_pct         NUMERIC,
                is_anomaly                BOOLEAN NOT NULL,
                top_anomaly_address       TEXT,
                lst_migration_count       INTEGER NOT NULL,
                price_change_lookback_pct NUMERIC,
                data_quality_status       TEXT NOT NULL,
                data_quality_score        DOUBLE PRECISION NOT NULL,
                quality_warnings_count    INTEGER NOT NULL,
                tags                      JSONB NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_metric_network_computed \
             ON accumulation_metric (network, computed_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        info!("Metric schema initialized");
        Ok(())
    }
}

const METRIC_COLUMNS: &str = "computed_at, lookback_hours, network, analyzed_count, \
     score_native_pct, score_lst_adjusted_pct, total_weth_as_eth, total_steth_as_eth, \
     steth_rate_used, accumulators_count, distributors_count, neutral_count, \
     concentration_gini, mad_threshold_pct, is_anomaly, top_anomaly_address, \
     lst_migration_count, price_change_lookback_pct, data_quality_status, \
     data_quality_score, quality_warnings_count, tags";

fn tags_json(tags: &[Tag]) -> serde_json::Value {
    serde_json::Value::Array(
        tags.iter()
            .map(|t| serde_json::Value::String(t.label().to_string()))
            .collect(),
    )
}

fn row_to_metric(row: &sqlx::postgres::PgRow) -> eyre::Result<AccumulationMetric> {
    let status: String = row.try_get("data_quality_status")?;
    let status = match status.as_str() {
        "healthy" => QualityStatus::Healthy,
        "degraded" => QualityStatus::Degraded,
        "critical" => QualityStatus::Critical,
        other => eyre::bail!("corrupt data_quality_status {other}"),
    };

    let top_anomaly: Option<String> = row.try_get("top_anomaly_address")?;
    let top_anomaly_address = top_anomaly
        .map(|s| {
            s.parse::<Address>()
                .map_err(|e| eyre::eyre!("corrupt top_anomaly_address {s}: {e}"))
        })
        .transpose()?;

    let tags_value: serde_json::Value = row.try_get("tags")?;
    let tags = tags_value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().and_then(Tag::from_label))
                .collect()
        })
        .unwrap_or_default();

    Ok(AccumulationMetric {
        computed_at: row.try_get("computed_at")?,
        lookback_hours: row.try_get::<i32, _>("lookback_hours")? as u32,
        network: row.try_get("network")?,
        analyzed_count: row.try_get::<i32, _>("analyzed_count")? as u32,
        score_native_pct: row.try_get::<Option<Decimal>, _>("score_native_pct")?,
        score_lst_adjusted_pct: row.try_get::<Option<Decimal>, _>("score_lst_adjusted_pct")?,
        total_weth_as_eth: row.try_get("total_weth_as_eth")?,
        total_steth_as_eth: row.try_get("total_steth_as_eth")?,
        steth_rate_used: row.try_get("steth_rate_used")?,
        accumulators_count: row.try_get::<i32, _>("accumulators_count")? as u32,
        distributors_count: row.try_get::<i32, _>("distributors_count")? as u32,
        neutral_count: row.try_get::<i32, _>("neutral_count")? as u32,
        concentration_gini: row.try_get::<Option<Decimal>, _>("concentration_gini")?,
        mad_threshold_pct: row.try_get::<Option<Decimal>, _>("mad_threshold_pct")?,
        is_anomaly: row.try_get("is_anomaly")?,
        top_anomaly_address,
        lst_migration_count: row.try_get::<i32, _>("lst_migration_count")? as u32,
        price_change_lookback_pct: row.try_get::<Option<Decimal>, _>("price_change_lookback_pct")?,
        tags,
        data_quality_status: status,
        data_quality_score: row.try_get("data_quality_score")?,
        quality_warnings_count: row.try_get::<i32, _>("quality_warnings_count")? as u32,
    })
}

#[async_trait]
impl MetricStore for PgMetricStore {
    async fn save_metric(&self, metric: &AccumulationMetric) -> eyre::Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO accumulation_metric (computed_at, lookback_hours, network, \
             analyzed_count, score_native_pct, score_lst_adjusted_pct, total_weth_as_eth, \
             total_steth_as_eth, steth_rate_used, accumulators_count, distributors_count, \
             neutral_count, concentration_gini, mad_threshold_pct, is_anomaly, \
             top_anomaly_address, lst_migration_count, price_change_lookback_pct, \
             data_quality_status, data_quality_score, quality_warnings_count, tags) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21, $22) \
             RETURNING id",
        )
        .bind(metric.computed_at)
        .bind(metric.lookback_hours as i32)
        .bind(&metric.network)
        .bind(metric.analyzed_count as i32)
        .bind(metric.score_native_pct)
        .bind(metric.score_lst_adjusted_pct)
        .bind(metric.total_weth_as_eth)
        .bind(metric.total_steth_as_eth)
        .bind(metric.steth_rate_used)
        .bind(metric.accumulators_count as i32)
        .bind(metric.distributors_count as i32)
        .bind(metric.neutral_count as i32)
        .bind(metric.concentration_gini)
        .bind(metric.mad_threshold_pct)
        .bind(metric.is_anomaly)
        .bind(metric.top_anomaly_address.as_ref().map(addr_key))
        .bind(metric.lst_migration_count as i32)
        .bind(metric.price_change_lookback_pct)
        .bind(metric.data_quality_status.as_str())
        .bind(metric.data_quality_score)
        .bind(metric.quality_warnings_count as i32)
        .bind(tags_json(&metric.tags))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_latest(&self, network: &str) -> eyre::Result<Option<AccumulationMetric>> {
        let row = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM accumulation_metric \
             WHERE network = $1 ORDER BY computed_at DESC LIMIT 1"
        ))
        .bind(network)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_metric).transpose()
    }

    async fn get_since(
        &self,
        network: &str,
        since: DateTime<Utc>,
    ) -> eyre::Result<Vec<AccumulationMetric>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM accumulation_metric \
             WHERE network = $1 AND computed_at >= $2 ORDER BY computed_at ASC"
        ))
        .bind(network)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_metric).collect()
    }
}

// ─── In-memory ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryMetricStore {
    rows: RwLock<Vec<AccumulationMetric>>,
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn save_metric(&self, metric: &AccumulationMetric) -> eyre::Result<i64> {
        let mut rows = self.rows.write();
        rows.push(metric.clone());
        Ok(rows.len() as i64)
    }

    async fn get_latest(&self, network: &str) -> eyre::Result<Option<AccumulationMetric>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|m| m.network == network)
            .max_by_key(|m| m.computed_at)
            .cloned())
    }

    async fn get_since(
        &self,
        network: &str,
        since: DateTime<Utc>,
    ) -> eyre::Result<Vec<AccumulationMetric>> {
        let mut out: Vec<AccumulationMetric> = self
            .rows
            .read()
            .iter()
            .filter(|m| m.network == network && m.computed_at >= since)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.computed_at);
        Ok(out)
    }
}
