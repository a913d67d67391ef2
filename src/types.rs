// Core domain types
//
// Persistent entities (balance snapshots, accumulation metrics), the
// transient quality report, and the small value objects shared between
// components.

use alloy_primitives::{Address, I256, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One persisted balance observation: (address, instant) is the identity.
///
/// Rows with a failed native read are never constructed; the snapshot job
/// skips those addresses entirely. LST reads may individually fail and are
/// stored as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub address: Address,
    pub snapshot_instant: DateTime<Utc>,
    pub block_height: u64,
    /// Native balance in Wei. Non-negative by construction (U256).
    pub native_balance: U256,
    /// WETH balance in Wei. `None` = read failed at snapshot time.
    pub weth_balance: Option<U256>,
    /// stETH balance in Wei. `None` = read failed at snapshot time.
    pub steth_balance: Option<U256>,
    /// Position in the top-N at this instant, 1 = largest.
    pub rank: u32,
    pub network: String,
}

/// One row per analysis run. Immutable after write.
#[derive(Debug, Clone)]
pub struct AccumulationMetric {
    pub computed_at: DateTime<Utc>,
    pub lookback_hours: u32,
    pub network: String,
    /// Number of union addresses with both current and historical native
    /// balances, the population that gets classified, so
    /// accumulators + distributors + neutral always equals this.
    pub analyzed_count: u32,
    pub score_native_pct: Option<Decimal>,
    pub score_lst_adjusted_pct: Option<Decimal>,
    pub total_weth_as_eth: Decimal,
    pub total_steth_as_eth: Decimal,
    pub steth_rate_used: Decimal,
    pub accumulators_count: u32,
    pub distributors_count: u32,
    pub neutral_count: u32,
    pub concentration_gini: Option<Decimal>,
    /// MAD of the per-whale Δ% population, in percentage points.
    /// The anomaly cut-off is `mad_k` times this value.
    pub mad_threshold_pct: Option<Decimal>,
    pub is_anomaly: bool,
    pub top_anomaly_address: Option<Address>,
    pub lst_migration_count: u32,
    pub price_change_lookback_pct: Option<Decimal>,
    pub tags: Vec<Tag>,
    pub data_quality_status: QualityStatus,
    pub data_quality_score: f64,
    pub quality_warnings_count: u32,
}

/// A whale as produced by the list provider: balance already read, rank
/// assigned after the sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhaleEntry {
    pub address: Address,
    pub native_balance: U256,
    pub rank: u32,
}

/// A detected native → LST rotation. All deltas in signed Wei.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationEvent {
    pub address: Address,
    pub eth_delta_wei: I256,
    pub lst_delta_wei: I256,
    pub net_delta_wei: I256,
}

// ─── Data quality ────────────────────────────────────────────────────────────

/// Severity of a quality check (and of the report as a whole).
///
/// Variant order matters: `max` over statuses yields the worst one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
    Healthy,
    Degraded,
    Critical,
}

impl QualityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityStatus::Healthy => "healthy",
            QualityStatus::Degraded => "degraded",
            QualityStatus::Critical => "critical",
        }
    }

    /// Sub-score contributed to the overall mean.
    pub fn sub_score(&self) -> f64 {
        match self {
            QualityStatus::Healthy => 100.0,
            QualityStatus::Degraded => 50.0,
            QualityStatus::Critical => 0.0,
        }
    }

    /// Process exit code for the standalone validator binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            QualityStatus::Healthy => 0,
            QualityStatus::Degraded => 1,
            QualityStatus::Critical => 2,
        }
    }
}

impl std::fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single validator check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: QualityStatus,
    pub score: f64,
    pub issues: Vec<String>,
}

/// Full validator output. Transient; serializable to JSON for audit.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub overall_status: QualityStatus,
    /// Mean of the five check scores, in [0, 100].
    pub overall_score: f64,
    pub checks: Vec<CheckResult>,
    pub generated_at: DateTime<Utc>,
}

impl QualityReport {
    /// Total number of issues across all checks.
    pub fn warnings_count(&self) -> u32 {
        self.checks.iter().map(|c| c.issues.len() as u32).sum()
    }

    /// First issue of the worst check, for the diagnostic alert.
    pub fn top_issue(&self) -> Option<&str> {
        self.checks
            .iter()
            .max_by_key(|c| c.status)
            .and_then(|c| c.issues.first())
            .map(String::as_str)
    }
}

// ─── Tags ────────────────────────────────────────────────────────────────────

/// Closed tag vocabulary attached to a metric. Deduplicated by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    OrganicAccumulation,
    ConcentratedSignal,
    BullishDivergence,
    LstMigration,
    HighConviction,
    DepegRisk,
    AnomalyAlert,
    DataQualityWarning,
    InsufficientData,
}

impl Tag {
    pub fn label(&self) -> &'static str {
        match self {
            Tag::OrganicAccumulation => "Organic Accumulation",
            Tag::ConcentratedSignal => "Concentrated Signal",
            Tag::BullishDivergence => "Bullish Divergence",
            Tag::LstMigration => "LST Migration",
            Tag::HighConviction => "High Conviction",
            Tag::DepegRisk => "Depeg Risk",
            Tag::AnomalyAlert => "Anomaly Alert",
            Tag::DataQualityWarning => "Data Quality Warning",
            Tag::InsufficientData => "Insufficient Data",
        }
    }

    pub fn from_label(s: &str) -> Option<Tag> {
        match s {
            "Organic Accumulation" => Some(Tag::OrganicAccumulation),
            "Concentrated Signal" => Some(Tag::ConcentratedSignal),
            "Bullish Divergence" => Some(Tag::BullishDivergence),
            "LST Migration" => Some(Tag::LstMigration),
            "High Conviction" => Some(Tag::HighConviction),
            "Depeg Risk" => Some(Tag::DepegRisk),
            "Anomaly Alert" => Some(Tag::AnomalyAlert),
            "Data Quality Warning" => Some(Tag::DataQualityWarning),
            "Insufficient Data" => Some(Tag::InsufficientData),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Canonical lowercase key used for DB storage and equality.
/// Human-facing output uses the checksummed `Display` of `Address` instead.
pub fn addr_key(address: &Address) -> String {
    format!("{address:#x}")
}

/// Convert a Wei balance to ETH as a Decimal.
///
/// Decimal holds 28-29 significant digits, which covers every realistic
/// balance (the entire ETH supply is ~1.2e26 Wei). Balances beyond the
/// Decimal range are clamped to MAX with a warning rather than wrapping.
pub fn wei_to_eth(raw: U256) -> Decimal {
    let s = raw.to_string();
    let d = match Decimal::from_str_exact(&s) {
        Ok(d) => d,
        Err(_) => {
            warn!(raw = %s, "Wei value exceeds Decimal range, clamping");
            return Decimal::MAX;
        }
    };
    // Decimal::new(1, scale) is 10^(-scale); multiplying shifts the point.
    d.checked_mul(Decimal::new(1, 18)).unwrap_or(Decimal::MAX)
}

/// Convert a Wei balance to a raw (unshifted) Decimal. `None` when the value
/// does not fit in Decimal's 28 significant digits.
pub fn wei_to_decimal(raw: U256) -> Option<Decimal> {
    Decimal::from_str_exact(&raw.to_string()).ok()
}
