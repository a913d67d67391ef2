//! Accumulation analysis kernel.
//!
//! The async half gathers inputs (whale union, balance batches, historical
//! snapshots, prices); `analyze` is the pure half that turns them into an
//! `AccumulationMetric`. Balance deltas stay in integer Wei or exact Decimal
//! throughout; floats never touch balance math.

pub mod stats;
pub mod tags;

use crate::config::Settings;
use crate::price::PriceSource;
use crate::rpc::multicall::{BalanceReader, STETH_ADDRESS, WETH_ADDRESS};
use crate::store::metrics::MetricStore;
use crate::store::snapshots::SnapshotStore;
use crate::types::{
    wei_to_eth, AccumulationMetric, BalanceSnapshot, MigrationEvent, QualityReport, QualityStatus,
};
use crate::whales::WhaleSource;
use alloy_primitives::{Address, I256, U256};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tags::{assign_tags, TagContext, TagRules};
use tracing::{info, warn};

/// Price context window for the divergence tag.
const PRICE_CONTEXT_HOURS: i64 = 48;

const PRICE_ASSET: &str = "ETH";

#[derive(Debug, Clone)]
pub struct CalculatorSettings {
    pub network: String,
    pub top_n: usize,
    pub lookback_hours: u32,
    pub snapshot_tolerance_hours: u32,
    pub neutral_band_pct: Decimal,
    pub mad_k: Decimal,
    pub gas_tolerance_wei: U256,
    pub rules: TagRules,
}

impl CalculatorSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            network: settings.network.clone(),
            top_n: settings.top_n,
            lookback_hours: settings.lookback_hours,
            snapshot_tolerance_hours: settings.snapshot_tolerance_hours,
            neutral_band_pct: settings.neutral_band_pct,
            mad_k: settings.mad_k,
            gas_tolerance_wei: settings.gas_tolerance_wei,
            rules: TagRules {
                min_whales: settings.min_whales,
                organic_accumulation_fraction: settings.organic_accumulation_fraction,
                gini_concentration_threshold: settings.gini_concentration_threshold,
                divergence_price_pct: settings.divergence_price_pct,
                divergence_score_pct: settings.divergence_score_pct,
                mad_k: settings.mad_k,
                depeg_threshold: Decimal::new(98, 2),
            },
        }
    }
}

pub struct AccumulationCalculator {
    whales: Arc<dyn WhaleSource>,
    reader: Arc<dyn BalanceReader>,
    prices: Arc<dyn PriceSource>,
    snapshots: Arc<dyn SnapshotStore>,
    metrics: Arc<dyn MetricStore>,
    cfg: CalculatorSettings,
}

/// Everything `analyze` looks at, gathered ahead of time so the math itself
/// has no suspension points.
pub struct AnalysisInputs {
    pub now: DateTime<Utc>,
    /// Union of the current top-N and the historical top-N at `now - H`.
    pub union: Vec<Address>,
    pub native_now: HashMap<Address, Option<U256>>,
    pub weth_now: HashMap<Address, Option<U256>>,
    pub steth_now: HashMap<Address, Option<U256>>,
    pub historical: HashMap<Address, BalanceSnapshot>,
    pub steth_rate: Decimal,
    pub price_now: Option<Decimal>,
    pub price_lookback: Option<Decimal>,
}

impl AccumulationCalculator {
    pub fn new(
        whales: Arc<dyn WhaleSource>,
        reader: Arc<dyn BalanceReader>,
        prices: Arc<dyn PriceSource>,
        snapshots: Arc<dyn SnapshotStore>,
        metrics: Arc<dyn MetricStore>,
        cfg: CalculatorSettings,
    ) -> Self {
        Self {
            whales,
            reader,
            prices,
            snapshots,
            metrics,
            cfg,
        }
    }

    /// Run one analysis and persist the metric. The caller is responsible for
    /// not invoking this on a critical quality report; it is rejected here as
    /// a second line of defence.
    pub async fn compute(&self, report: &QualityReport) -> eyre::Result<AccumulationMetric> {
        if report.overall_status == QualityStatus::Critical {
            eyre::bail!("analysis blocked: data quality is critical");
        }

        let now = Utc::now();
        let inputs = self.gather(now).await?;
        let metric = analyze(&inputs, &self.cfg, report);

        let id = self.metrics.save_metric(&metric).await?;
        info!(
            id,
            analyzed = metric.analyzed_count,
            score_native = ?metric.score_native_pct,
            score_lst = ?metric.score_lst_adjusted_pct,
            anomaly = metric.is_anomaly,
            tags = metric.tags.len(),
            "accumulation metric persisted"
        );
        Ok(metric)
    }

    async fn gather(&self, now: DateTime<Utc>) -> eyre::Result<AnalysisInputs> {
        let lookback = Duration::hours(self.cfg.lookback_hours as i64);

        // Step A: union of current and historical top-N. Analysing only the
        // current set would hide whales that sold their way out of the top.
        let current = self.whales.get_top_whales(self.cfg.top_n).await?;
        let historical_top = self
            .snapshots
            .get_addresses_in_top_at_time(
                &self.cfg.network,
                now - lookback,
                self.cfg.top_n as u32,
                self.cfg.snapshot_tolerance_hours,
            )
            .await?;

        let union: Vec<Address> = current
            .iter()
            .map(|w| w.address)
            .chain(historical_top.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        // Step B: balance batches and historical snapshots.
        let (native_now, weth_now, steth_now) = futures::future::join3(
            self.balances_or_unread(None, &union),
            self.balances_or_unread(Some(WETH_ADDRESS), &union),
            self.balances_or_unread(Some(STETH_ADDRESS), &union),
        )
        .await;

        let historical = self
            .snapshots
            .get_snapshots_batch_at_time(
                &self.cfg.network,
                &union,
                now - lookback,
                self.cfg.snapshot_tolerance_hours,
            )
            .await?;

        let steth_rate = self.prices.get_steth_eth_rate().await;
        let price_now = self.prices.get_current_price(PRICE_ASSET).await;
        let price_lookback = self
            .prices
            .get_historical_price(PRICE_ASSET, now - Duration::hours(PRICE_CONTEXT_HOURS))
            .await;

        Ok(AnalysisInputs {
            now,
            union,
            native_now,
            weth_now,
            steth_now,
            historical,
            steth_rate,
            price_now,
            price_lookback,
        })
    }

    /// A total batch failure degrades to all-unread instead of aborting the
    /// run: the metric then carries `Insufficient Data` rather than nothing.
    async fn balances_or_unread(
        &self,
        token: Option<Address>,
        addresses: &[Address],
    ) -> HashMap<Address, Option<U256>> {
        let result = match token {
            None => self.reader.get_native_balances(addresses, None).await,
            Some(token) => self.reader.get_token_balances(token, addresses, None).await,
        };
        match result {
            Ok(map) => map,
            Err(e) => {
                warn!(?token, error = %e, "balance batch failed entirely");
                addresses.iter().map(|a| (*a, None)).collect()
            }
        }
    }
}

/// Steps C–J over pre-gathered inputs.
pub fn analyze(
    inputs: &AnalysisInputs,
    cfg: &CalculatorSettings,
    report: &QualityReport,
) -> AccumulationMetric {
    let rate = inputs.steth_rate;
    let quality_degraded = report.overall_status == QualityStatus::Degraded;

    let mut sum_native_now = Decimal::ZERO;
    let mut sum_native_hist = Decimal::ZERO;
    let mut both_present = 0u32;

    let mut sum_wealth_now = Decimal::ZERO;
    let mut sum_wealth_hist = Decimal::ZERO;
    let mut wealth_population = 0u32;

    let mut total_weth = Decimal::ZERO;
    let mut total_steth_as_eth = Decimal::ZERO;

    let mut deltas: Vec<(Address, Decimal)> = Vec::new();
    let mut accumulators = 0u32;
    let mut distributors = 0u32;
    let mut neutral = 0u32;

    let mut migrations: Vec<MigrationEvent> = Vec::new();
    let mut gini_population: Vec<U256> = Vec::new();

    for addr in &inputs.union {
        let native_now = inputs.native_now.get(addr).copied().flatten();
        let weth_now = inputs.weth_now.get(addr).copied().flatten();
        let steth_now = inputs.steth_now.get(addr).copied().flatten();
        let hist = inputs.historical.get(addr);

        if let Some(balance) = native_now {
            gini_population.push(balance);
        }
        if let Some(weth) = weth_now {
            total_weth += wei_to_eth(weth);
        }
        if let Some(steth) = steth_now {
            total_steth_as_eth += wei_to_eth(steth) * rate;
        }

        let (Some(now_wei), Some(hist_snap)) = (native_now, hist) else {
            continue;
        };

        // Step C/D: summed scores over addresses with both values present.
        let now_eth = wei_to_eth(now_wei);
        let hist_eth = wei_to_eth(hist_snap.native_balance);
        sum_native_now += now_eth;
        sum_native_hist += hist_eth;
        both_present += 1;

        // MVP aggregation: historical LST is taken as the current holdings on
        // both sides, so LST only shifts the baseline, not the delta.
        if let (Some(weth), Some(steth)) = (weth_now, steth_now) {
            let lst_eth = wei_to_eth(weth) + wei_to_eth(steth) * rate;
            sum_wealth_now += now_eth + lst_eth;
            sum_wealth_hist += hist_eth + lst_eth;
            wealth_population += 1;
        }

        // Step E: per-whale direction. A zero historical balance has no
        // defined percentage change and is left unclassified.
        if hist_eth > Decimal::ZERO {
            let delta_pct = (now_eth - hist_eth) / hist_eth * Decimal::ONE_HUNDRED;
            if delta_pct.abs() < cfg.neutral_band_pct {
                neutral += 1;
            } else if delta_pct > Decimal::ZERO {
                accumulators += 1;
            } else {
                distributors += 1;
            }
            deltas.push((*addr, delta_pct));
        }

        // Step H: migration detection, strictly on snapshot LST values.
        if let Some(event) = detect_migration(
            *addr,
            now_wei,
            hist_snap.native_balance,
            weth_now,
            hist_snap.weth_balance,
            steth_now,
            hist_snap.steth_balance,
            rate,
            cfg.gas_tolerance_wei,
        ) {
            migrations.push(event);
        }
    }

    let analyzed_count = deltas.len() as u32;
    debug_assert_eq!(accumulators + distributors + neutral, analyzed_count);

    let score_native_pct = pct_change(sum_native_now, sum_native_hist, both_present);
    let score_lst_adjusted_pct = pct_change(sum_wealth_now, sum_wealth_hist, wealth_population);

    // Step F: MAD anomaly detection.
    let delta_values: Vec<Decimal> = deltas.iter().map(|(_, d)| *d).collect();
    let center = stats::median(&delta_values);
    let mad_value = center.and_then(|m| stats::mad(&delta_values, m));

    let (is_anomaly, top_anomaly_address) = match (center, mad_value) {
        (Some(m), Some(mad)) => {
            let threshold = cfg.mad_k * mad;
            let mut outliers: Vec<(Address, Decimal)> = deltas
                .iter()
                .map(|(a, d)| (*a, (*d - m).abs()))
                .filter(|(_, dev)| {
                    // MAD of zero means the bulk of the population moved in
                    // lockstep; any deviation from it is then anomalous.
                    if mad.is_zero() {
                        *dev > Decimal::ZERO
                    } else {
                        *dev > threshold
                    }
                })
                .collect();
            outliers.sort_by(|a, b| b.1.cmp(&a.1));

            match outliers.first() {
                Some((addr, _)) => (true, Some(*addr)),
                None if quality_degraded => {
                    // Forced anomaly on degraded input: surface the largest
                    // deviation so the anomaly field always names an address.
                    let top = deltas
                        .iter()
                        .max_by_key(|(_, d)| (*d - m).abs())
                        .map(|(a, _)| *a);
                    (top.is_some(), top)
                }
                None => (false, None),
            }
        }
        _ => (false, None),
    };

    let concentration_gini = stats::gini(&gini_population);

    // Step I: price context.
    let price_change_lookback_pct = match (inputs.price_now, inputs.price_lookback) {
        (Some(now), Some(then)) if !then.is_zero() => {
            Some((now - then) / then * Decimal::ONE_HUNDRED)
        }
        _ => None,
    };

    // Step J: tags.
    let ctx = TagContext {
        analyzed_count,
        accumulators_count: accumulators,
        score_native_pct,
        score_lst_adjusted_pct,
        concentration_gini,
        mad_threshold_pct: mad_value,
        is_anomaly,
        lst_migration_count: migrations.len() as u32,
        price_change_lookback_pct,
        steth_rate_used: rate,
        quality_degraded,
    };
    let tags = assign_tags(&ctx, &cfg.rules);

    AccumulationMetric {
        computed_at: inputs.now,
        lookback_hours: cfg.lookback_hours,
        network: cfg.network.clone(),
        analyzed_count,
        score_native_pct,
        score_lst_adjusted_pct,
        total_weth_as_eth: total_weth,
        total_steth_as_eth,
        steth_rate_used: rate,
        accumulators_count: accumulators,
        distributors_count: distributors,
        neutral_count: neutral,
        concentration_gini,
        mad_threshold_pct: mad_value,
        is_anomaly,
        top_anomaly_address,
        lst_migration_count: migrations.len() as u32,
        price_change_lookback_pct,
        tags,
        data_quality_status: report.overall_status,
        data_quality_score: report.overall_score,
        quality_warnings_count: report.warnings_count(),
    }
}

fn pct_change(now: Decimal, hist: Decimal, population: u32) -> Option<Decimal> {
    if population == 0 || hist.is_zero() {
        return None;
    }
    Some((now - hist) / hist * Decimal::ONE_HUNDRED)
}

/// Signed Wei difference. `None` only for magnitudes beyond I256, which no
/// real balance reaches.
fn wei_delta(now: U256, hist: U256) -> Option<I256> {
    if now >= hist {
        I256::try_from(now - hist).ok()
    } else {
        I256::try_from(hist - now).ok().map(|v| -v)
    }
}

/// Scale an integer Wei delta by the stETH/ETH rate, truncating back to Wei.
fn scale_by_rate(delta: I256, rate: Decimal) -> Option<I256> {
    let magnitude = Decimal::from_str_exact(&delta.unsigned_abs().to_string()).ok()?;
    let scaled = (magnitude * rate).trunc().to_u128()?;
    let scaled = I256::try_from(U256::from(scaled)).ok()?;
    Some(if delta.is_negative() { -scaled } else { scaled })
}

/// Step H predicate, entirely in integer Wei: native down, LST up, net wealth
/// change inside gas tolerance. A whale with unknown historical LST balances
/// is skipped: a missing read must never fabricate a migration.
#[allow(clippy::too_many_arguments)]
fn detect_migration(
    address: Address,
    native_now: U256,
    native_hist: U256,
    weth_now: Option<U256>,
    weth_hist: Option<U256>,
    steth_now: Option<U256>,
    steth_hist: Option<U256>,
    rate: Decimal,
    gas_tolerance_wei: U256,
) -> Option<MigrationEvent> {
    let (weth_now, weth_hist) = (weth_now?, weth_hist?);
    let (steth_now, steth_hist) = (steth_now?, steth_hist?);

    let eth_delta = wei_delta(native_now, native_hist)?;
    let weth_delta = wei_delta(weth_now, weth_hist)?;
    let steth_delta = scale_by_rate(wei_delta(steth_now, steth_hist)?, rate)?;

    let lst_delta = weth_delta.checked_add(steth_delta)?;
    let net_delta = eth_delta.checked_add(lst_delta)?;

    if eth_delta < I256::ZERO
        && lst_delta > I256::ZERO
        && net_delta.unsigned_abs() < gas_tolerance_wei
    {
        Some(MigrationEvent {
            address,
            eth_delta_wei: eth_delta,
            lst_delta_wei: lst_delta,
            net_delta_wei: net_delta,
        })
    } else {
        None
    }
}
