//! Data-quality circuit breaker.
//!
//! Five independent checks over the last 24 hours of stored data. The window
//! is loaded up front; every check is a pure function over the loaded rows,
//! so the whole report is unit-testable without a database.
//!
//! Severity mapping: any critical check makes the report critical; the
//! overall score is the mean of the five sub-scores (healthy 100,
//! degraded 50, critical 0).

use crate::store::metrics::MetricStore;
use crate::store::snapshots::SnapshotStore;
use crate::types::{AccumulationMetric, BalanceSnapshot, CheckResult, QualityReport, QualityStatus};
use alloy_primitives::{Address, U256};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Validation window. Density expects one row per whale per hour in here.
const WINDOW_HOURS: i64 = 24;

/// Assumed inter-block time for the drift check.
const SECONDS_PER_BLOCK: i64 = 12;

/// Drift is reported as a percentage of this reference window (12 minutes).
const DRIFT_REFERENCE_SECS: i64 = 720;

/// How many recent (instant, block) pairs feed the drift check.
const DRIFT_SAMPLE: usize = 20;

/// Max addresses listed per issue message.
const ISSUE_ADDRESS_CAP: usize = 5;

#[derive(Debug, Clone)]
pub struct QualityThresholds {
    pub density_healthy: f64,
    pub density_degraded: f64,
    pub outlier_change_pct: Decimal,
    pub lst_rate_lower: Decimal,
    pub lst_rate_upper: Decimal,
}

pub struct DataQualityValidator {
    snapshots: Arc<dyn SnapshotStore>,
    metrics: Arc<dyn MetricStore>,
    network: String,
    thresholds: QualityThresholds,
}

impl DataQualityValidator {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        metrics: Arc<dyn MetricStore>,
        network: String,
        thresholds: QualityThresholds,
    ) -> Self {
        Self {
            snapshots,
            metrics,
            network,
            thresholds,
        }
    }

    pub async fn run(&self) -> eyre::Result<QualityReport> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> eyre::Result<QualityReport> {
        let from = now - Duration::hours(WINDOW_HOURS);
        let snapshots = self
            .snapshots
            .get_snapshots_in_window(&self.network, from, now)
            .await?;
        let metrics = self.metrics.get_since(&self.network, from).await?;

        let report = evaluate(&snapshots, &metrics, &self.thresholds, now);
        info!(
            status = %report.overall_status,
            score = report.overall_score,
            warnings = report.warnings_count(),
            "data quality report"
        );
        Ok(report)
    }
}

/// Run all five checks over pre-loaded window data.
pub fn evaluate(
    snapshots: &[BalanceSnapshot],
    metrics: &[AccumulationMetric],
    thresholds: &QualityThresholds,
    now: DateTime<Utc>,
) -> QualityReport {
    let by_address = group_by_address(snapshots);

    let checks = vec![
        check_density(snapshots, &by_address, thresholds),
        check_precision(&by_address),
        check_time_drift(snapshots),
        check_outliers(&by_address, thresholds.outlier_change_pct),
        check_lst_rates(metrics, thresholds),
    ];

    let overall_status = checks
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(QualityStatus::Healthy);
    let overall_score = checks.iter().map(|c| c.score).sum::<f64>() / checks.len() as f64;

    QualityReport {
        overall_status,
        overall_score,
        checks,
        generated_at: now,
    }
}

fn group_by_address(snapshots: &[BalanceSnapshot]) -> BTreeMap<Address, Vec<&BalanceSnapshot>> {
    let mut map: BTreeMap<Address, Vec<&BalanceSnapshot>> = BTreeMap::new();
    for s in snapshots {
        map.entry(s.address).or_default().push(s);
    }
    for series in map.values_mut() {
        series.sort_by_key(|s| s.snapshot_instant);
    }
    map
}

fn result(name: &'static str, status: QualityStatus, issues: Vec<String>) -> CheckResult {
    CheckResult {
        name,
        status,
        score: status.sub_score(),
        issues,
    }
}

/// Check 1, row density: actual rows / (unique whales × window hours).
fn check_density(
    snapshots: &[BalanceSnapshot],
    by_address: &BTreeMap<Address, Vec<&BalanceSnapshot>>,
    thresholds: &QualityThresholds,
) -> CheckResult {
    let unique = by_address.len();
    if unique == 0 {
        return result(
            "snapshot_density",
            QualityStatus::Critical,
            vec!["no snapshots in the last 24h".to_string()],
        );
    }

    let expected = (unique as f64) * WINDOW_HOURS as f64;
    let ratio = snapshots.len() as f64 / expected;

    let status = if ratio >= thresholds.density_healthy {
        QualityStatus::Healthy
    } else if ratio >= thresholds.density_degraded {
        QualityStatus::Degraded
    } else {
        QualityStatus::Critical
    };

    let issues = if status == QualityStatus::Healthy {
        Vec::new()
    } else {
        vec![format!(
            "snapshot density {ratio:.2} over {unique} whales (expected >= {:.2})",
            thresholds.density_healthy
        )]
    };
    result("snapshot_density", status, issues)
}

/// Check 2, precision integrity: whales with at least one zero-balance row.
/// A real whale going to exactly zero is rare; a cluster of zeros usually
/// means truncated reads upstream.
fn check_precision(by_address: &BTreeMap<Address, Vec<&BalanceSnapshot>>) -> CheckResult {
    let offenders: Vec<Address> = by_address
        .iter()
        .filter(|(_, series)| series.iter().any(|s| s.native_balance == U256::ZERO))
        .map(|(addr, _)| *addr)
        .collect();

    let status = match offenders.len() {
        0 => QualityStatus::Healthy,
        1..=5 => QualityStatus::Degraded,
        _ => QualityStatus::Critical,
    };

    let issues = if offenders.is_empty() {
        Vec::new()
    } else {
        vec![format!(
            "{} whales with zero-balance snapshots: {}",
            offenders.len(),
            format_addresses(&offenders)
        )]
    };
    result("precision_integrity", status, issues)
}

/// Check 3, wall-clock drift against block numbers. Expected elapsed time
/// between two snapshot instants is block_delta × 12 s; drift is the
/// deviation as a percentage of a 720 s reference window.
fn check_time_drift(snapshots: &[BalanceSnapshot]) -> CheckResult {
    // One (instant, block) pair per distinct instant.
    let mut by_instant: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
    for s in snapshots {
        let entry = by_instant.entry(s.snapshot_instant).or_insert(s.block_height);
        if s.block_height > *entry {
            *entry = s.block_height;
        }
    }

    let pairs: Vec<(DateTime<Utc>, u64)> = by_instant
        .into_iter()
        .rev()
        .take(DRIFT_SAMPLE)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    if pairs.len() < 2 {
        // Not enough samples to measure drift.
        return result("time_drift", QualityStatus::Healthy, Vec::new());
    }

    let mut drifts: Vec<f64> = Vec::with_capacity(pairs.len() - 1);
    for window in pairs.windows(2) {
        let (t1, b1) = window[0];
        let (t2, b2) = window[1];
        let expected_secs = (b2.saturating_sub(b1)) as i64 * SECONDS_PER_BLOCK;
        let actual_secs = (t2 - t1).num_seconds();
        let drift_pct =
            (actual_secs - expected_secs).abs() as f64 / DRIFT_REFERENCE_SECS as f64 * 100.0;
        drifts.push(drift_pct);
    }

    let avg = drifts.iter().sum::<f64>() / drifts.len() as f64;
    let max = drifts.iter().cloned().fold(0.0f64, f64::max);

    let status = if avg < 5.0 {
        QualityStatus::Healthy
    } else if avg < 10.0 {
        QualityStatus::Degraded
    } else {
        QualityStatus::Critical
    };

    let issues = if status == QualityStatus::Healthy {
        Vec::new()
    } else {
        vec![format!(
            "block-time drift avg {avg:.1}% max {max:.1}% of {DRIFT_REFERENCE_SECS}s window"
        )]
    };
    result("time_drift", status, issues)
}

/// Check 4, statistical outliers: per-hour balance change above the
/// threshold between consecutive snapshots of one whale.
fn check_outliers(
    by_address: &BTreeMap<Address, Vec<&BalanceSnapshot>>,
    outlier_change_pct: Decimal,
) -> CheckResult {
    let mut violations = 0usize;
    let mut offenders: Vec<Address> = Vec::new();

    for (addr, series) in by_address {
        if series.len() < 2 {
            continue;
        }
        let mut flagged = false;
        for window in series.windows(2) {
            let (prev, next) = (window[0], window[1]);
            if prev.native_balance == U256::ZERO {
                continue; // zeros are the precision check's business
            }
            let secs = (next.snapshot_instant - prev.snapshot_instant).num_seconds();
            if secs <= 0 {
                continue;
            }
            let (Some(prev_d), Some(next_d)) = (
                crate::types::wei_to_decimal(prev.native_balance),
                crate::types::wei_to_decimal(next.native_balance),
            ) else {
                continue;
            };
            let change_pct = ((next_d - prev_d).abs() / prev_d) * Decimal::ONE_HUNDRED;
            let hours = Decimal::from(secs) / Decimal::from(3600);
            let Some(per_hour) = change_pct.checked_div(hours) else {
                continue;
            };
            if per_hour > outlier_change_pct {
                violations += 1;
                flagged = true;
            }
        }
        if flagged {
            offenders.push(*addr);
        }
    }

    let status = match violations {
        0 => QualityStatus::Healthy,
        1..=3 => QualityStatus::Degraded,
        _ => QualityStatus::Critical,
    };

    let issues = if violations == 0 {
        Vec::new()
    } else {
        vec![format!(
            "{violations} per-hour changes above {outlier_change_pct}%: {}",
            format_addresses(&offenders)
        )]
    };
    result("statistical_outliers", status, issues)
}

/// Check 5, every stored stETH/ETH rate in the window must sit inside the
/// hard validity bounds.
fn check_lst_rates(metrics: &[AccumulationMetric], thresholds: &QualityThresholds) -> CheckResult {
    let violations: Vec<Decimal> = metrics
        .iter()
        .map(|m| m.steth_rate_used)
        .filter(|rate| *rate < thresholds.lst_rate_lower || *rate > thresholds.lst_rate_upper)
        .collect();

    let status = match violations.len() {
        0 => QualityStatus::Healthy,
        1..=2 => QualityStatus::Degraded,
        _ => QualityStatus::Critical,
    };

    let issues = if violations.is_empty() {
        Vec::new()
    } else {
        vec![format!(
            "{} stored stETH/ETH rates outside [{}, {}], worst {}",
            violations.len(),
            thresholds.lst_rate_lower,
            thresholds.lst_rate_upper,
            violations
                .iter()
                .max_by(|a, b| {
                    let da = (Decimal::ONE - **a).abs();
                    let db = (Decimal::ONE - **b).abs();
                    da.cmp(&db)
                })
                .unwrap_or(&Decimal::ONE)
        )]
    };
    result("lst_rate_consistency", status, issues)
}

fn format_addresses(addresses: &[Address]) -> String {
    let shown: Vec<String> = addresses
        .iter()
        .take(ISSUE_ADDRESS_CAP)
        .map(|a| a.to_string())
        .collect();
    if addresses.len() > ISSUE_ADDRESS_CAP {
        format!("{} (+{} more)", shown.join(", "), addresses.len() - ISSUE_ADDRESS_CAP)
    } else {
        shown.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn thresholds() -> QualityThresholds {
        QualityThresholds {
            density_healthy: 0.85,
            density_degraded: 0.70,
            outlier_change_pct: dec!(50),
            lst_rate_lower: dec!(0.90),
            lst_rate_upper: dec!(1.10),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap()
    }

    fn snap(addr: Address, hours_ago: i64, native_eth: u64) -> BalanceSnapshot {
        let instant = t0() - Duration::hours(hours_ago);
        BalanceSnapshot {
            address: addr,
            snapshot_instant: instant,
            // Consistent 12 s blocks: 300 blocks per hour.
            block_height: 22_000_000 - (hours_ago as u64) * 300,
            native_balance: U256::from(native_eth) * U256::from(10u64).pow(U256::from(18u64)),
            weth_balance: None,
            steth_balance: None,
            rank: 1,
            network: "ethereum".to_string(),
        }
    }

    fn metric_with_rate(rate: Decimal, hours_ago: i64) -> AccumulationMetric {
        AccumulationMetric {
            computed_at: t0() - Duration::hours(hours_ago),
            lookback_hours: 24,
            network: "ethereum".to_string(),
            analyzed_count: 0,
            score_native_pct: None,
            score_lst_adjusted_pct: None,
            total_weth_as_eth: Decimal::ZERO,
            total_steth_as_eth: Decimal::ZERO,
            steth_rate_used: rate,
            accumulators_count: 0,
            distributors_count: 0,
            neutral_count: 0,
            concentration_gini: None,
            mad_threshold_pct: None,
            is_anomaly: false,
            top_anomaly_address: None,
            lst_migration_count: 0,
            price_change_lookback_pct: None,
            tags: Vec::new(),
            data_quality_status: QualityStatus::Healthy,
            data_quality_score: 100.0,
            quality_warnings_count: 0,
        }
    }

    const A1: Address = address!("1111111111111111111111111111111111111111");
    const A2: Address = address!("2222222222222222222222222222222222222222");

    /// Full hourly coverage for two whales: everything healthy.
    fn dense_snapshots() -> Vec<BalanceSnapshot> {
        let mut rows = Vec::new();
        for h in 0..24 {
            rows.push(snap(A1, h, 1000));
            rows.push(snap(A2, h, 2000));
        }
        rows
    }

    #[test]
    fn clean_window_is_healthy() {
        let report = evaluate(&dense_snapshots(), &[], &thresholds(), t0());
        assert_eq!(report.overall_status, QualityStatus::Healthy);
        assert_eq!(report.overall_score, 100.0);
        assert_eq!(report.warnings_count(), 0);
        assert_eq!(report.checks.len(), 5);
    }

    #[test]
    fn empty_window_is_critical() {
        let report = evaluate(&[], &[], &thresholds(), t0());
        assert_eq!(report.overall_status, QualityStatus::Critical);
        assert!(report.top_issue().unwrap().contains("no snapshots"));
    }

    #[test]
    fn sixty_percent_density_is_critical() {
        // 2 whales × 24h expected, only ~60% of rows present.
        let mut rows = Vec::new();
        for h in 0..24 {
            rows.push(snap(A1, h, 1000));
            if h < 5 {
                rows.push(snap(A2, h, 2000));
            }
        }
        let report = evaluate(&rows, &[], &thresholds(), t0());
        let density = report
            .checks
            .iter()
            .find(|c| c.name == "snapshot_density")
            .unwrap();
        assert_eq!(density.status, QualityStatus::Critical);
        assert_eq!(report.overall_status, QualityStatus::Critical);
    }

    #[test]
    fn mid_density_is_degraded() {
        // 37 rows over 2 whales × 24h = 0.77, inside the degraded band.
        let mut rows = Vec::new();
        for h in 0..24 {
            rows.push(snap(A1, h, 1000));
            if h < 13 {
                rows.push(snap(A2, h, 2000));
            }
        }
        let report = evaluate(&rows, &[], &thresholds(), t0());
        let density = report
            .checks
            .iter()
            .find(|c| c.name == "snapshot_density")
            .unwrap();
        assert_eq!(density.status, QualityStatus::Degraded);
    }

    #[test]
    fn zero_balances_degrade_then_critical() {
        // One whale with a zero row: degraded.
        let mut rows = dense_snapshots();
        rows.retain(|s| !(s.address == A1 && s.snapshot_instant == t0() - Duration::hours(3)));
        rows.push(snap(A1, 3, 0));
        let report = evaluate(&rows, &[], &thresholds(), t0());
        let precision = report
            .checks
            .iter()
            .find(|c| c.name == "precision_integrity")
            .unwrap();
        assert_eq!(precision.status, QualityStatus::Degraded);

        // Six distinct whales with zeros: critical.
        let mut rows = dense_snapshots();
        for i in 0..6u8 {
            let mut bytes = [0u8; 20];
            bytes[19] = 0xa0 + i;
            rows.push(snap(Address::from(bytes), 2, 0));
        }
        let report = evaluate(&rows, &[], &thresholds(), t0());
        let precision = report
            .checks
            .iter()
            .find(|c| c.name == "precision_integrity")
            .unwrap();
        assert_eq!(precision.status, QualityStatus::Critical);
    }

    #[test]
    fn block_drift_detected() {
        // Blocks advance half as fast as wall time claims: each hour apart in
        // time but only 150 blocks apart → expected 1800 s vs actual 3600 s,
        // drift = 1800/720 = 250% per step.
        let mut rows = Vec::new();
        for h in 0..24 {
            let mut s = snap(A1, h, 1000);
            s.block_height = 22_000_000 - (h as u64) * 150;
            rows.push(s);
        }
        let report = evaluate(&rows, &[], &thresholds(), t0());
        let drift = report.checks.iter().find(|c| c.name == "time_drift").unwrap();
        assert_eq!(drift.status, QualityStatus::Critical);
        assert!(!drift.issues.is_empty());
    }

    #[test]
    fn single_snapshot_cannot_drift() {
        let rows = vec![snap(A1, 1, 1000)];
        let report = evaluate(&rows, &[], &thresholds(), t0());
        let drift = report.checks.iter().find(|c| c.name == "time_drift").unwrap();
        assert_eq!(drift.status, QualityStatus::Healthy);
    }

    #[test]
    fn hourly_jump_flags_outlier() {
        let mut rows = dense_snapshots();
        // A1 doubles between two consecutive hours: 100%/h > 50%/h.
        rows.retain(|s| !(s.address == A1 && s.snapshot_instant == t0() - Duration::hours(1)));
        let mut jump = snap(A1, 1, 2000);
        jump.block_height = 22_000_000 - 300;
        rows.push(jump);

        let report = evaluate(&rows, &[], &thresholds(), t0());
        let outliers = report
            .checks
            .iter()
            .find(|c| c.name == "statistical_outliers")
            .unwrap();
        assert_eq!(outliers.status, QualityStatus::Degraded);
        assert!(outliers.issues[0].contains("0x1111"));
    }

    #[test]
    fn out_of_band_rates_flagged() {
        let metrics = vec![
            metric_with_rate(dec!(0.999), 6),
            metric_with_rate(dec!(0.85), 3), // outside hard bounds
        ];
        let report = evaluate(&dense_snapshots(), &metrics, &thresholds(), t0());
        let lst = report
            .checks
            .iter()
            .find(|c| c.name == "lst_rate_consistency")
            .unwrap();
        assert_eq!(lst.status, QualityStatus::Degraded);

        let metrics: Vec<AccumulationMetric> =
            (0..3).map(|h| metric_with_rate(dec!(1.2), h)).collect();
        let report = evaluate(&dense_snapshots(), &metrics, &thresholds(), t0());
        let lst = report
            .checks
            .iter()
            .find(|c| c.name == "lst_rate_consistency")
            .unwrap();
        assert_eq!(lst.status, QualityStatus::Critical);
    }

    #[test]
    fn overall_score_is_mean_of_checks() {
        // One degraded check (precision), four healthy: (4*100 + 50) / 5 = 90.
        // The zero sits at the oldest hour so the outlier check stays quiet.
        let mut rows = dense_snapshots();
        rows.retain(|s| !(s.address == A1 && s.snapshot_instant == t0() - Duration::hours(23)));
        rows.push(snap(A1, 23, 0));
        let report = evaluate(&rows, &[], &thresholds(), t0());
        assert_eq!(report.overall_status, QualityStatus::Degraded);
        assert!((report.overall_score - 90.0).abs() < f64::EPSILON);
    }
}
