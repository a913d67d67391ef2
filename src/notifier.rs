//! Alert formatting and delivery.
//!
//! Formatting is pure; delivery is a single fire-and-forget NATS publish.
//! Publish failures are logged and never retried synchronously; the next
//! analysis tick will produce a fresh message anyway.

use crate::types::{AccumulationMetric, QualityReport, QualityStatus};
use async_trait::async_trait;
use eyre::WrapErr;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// The single outbound surface: deliver one text message somewhere.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, text: String);
}

/// NATS-backed delivery, one subject per network.
pub struct NatsSink {
    client: async_nats::Client,
    subject: String,
}

impl NatsSink {
    pub async fn connect(nats_url: &str, network: &str) -> eyre::Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .wrap_err("NATS connect failed")?;
        info!(url = nats_url, "NATS connected for alerts");
        Ok(Self {
            client,
            subject: format!("whales.alerts.{network}"),
        })
    }
}

#[async_trait]
impl AlertSink for NatsSink {
    async fn send(&self, text: String) {
        if let Err(e) = self
            .client
            .publish(self.subject.clone(), text.into_bytes().into())
            .await
        {
            warn!(error = %e, subject = %self.subject, "failed to publish alert");
        }
    }
}

pub struct Notifier {
    sink: Arc<dyn AlertSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self { sink }
    }

    pub async fn notify_metric(&self, metric: &AccumulationMetric, report: &QualityReport) {
        self.sink.send(format_metric_message(metric, report)).await;
    }

    pub async fn notify_quality_critical(&self, report: &QualityReport) {
        self.sink.send(format_critical_message(report)).await;
    }

    pub async fn notify_status_change(&self, from: QualityStatus, to: QualityStatus, score: f64) {
        self.sink
            .send(format!(
                "Data quality changed: {from} -> {to} (score {score:.0})"
            ))
            .await;
    }
}

fn fmt_pct(value: Option<Decimal>) -> String {
    match value {
        Some(v) if v.is_sign_negative() => format!("{v:.2}%"),
        Some(v) => format!("+{v:.2}%"),
        None => "n/a".to_string(),
    }
}

fn fmt_opt(value: Option<Decimal>, places: usize) -> String {
    match value {
        Some(v) => format!("{v:.places$}"),
        None => "n/a".to_string(),
    }
}

/// One short human-readable message per metric: the two scores, direction
/// counts, concentration, tags and a one-line interpretation.
pub fn format_metric_message(metric: &AccumulationMetric, report: &QualityReport) -> String {
    let tags = if metric.tags.is_empty() {
        "none".to_string()
    } else {
        metric
            .tags
            .iter()
            .map(|t| t.label())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut lines = vec![
        format!(
            "Whale accumulation report — {} ({}h lookback)",
            metric.network, metric.lookback_hours
        ),
        format!(
            "Score: {} native | {} LST-adjusted",
            fmt_pct(metric.score_native_pct),
            fmt_pct(metric.score_lst_adjusted_pct)
        ),
        format!(
            "Whales: {} analysed — {} accumulating / {} distributing / {} flat",
            metric.analyzed_count,
            metric.accumulators_count,
            metric.distributors_count,
            metric.neutral_count
        ),
        format!(
            "Gini: {} | stETH/ETH: {:.4}",
            fmt_opt(metric.concentration_gini, 3),
            metric.steth_rate_used
        ),
        format!("Tags: {tags}"),
        format!(
            "Data quality: {} (score {:.0}, {} warnings)",
            report.overall_status, report.overall_score, metric.quality_warnings_count
        ),
        interpret(metric),
    ];

    if let Some(addr) = metric.top_anomaly_address {
        lines.insert(5, format!("Top anomaly: {addr}"));
    }

    lines.join("\n")
}

fn interpret(metric: &AccumulationMetric) -> String {
    let direction = match metric.score_native_pct {
        Some(s) if s > Decimal::new(2, 1) => "whales are net accumulating",
        Some(s) if s < Decimal::new(-2, 1) => "whales are net distributing",
        Some(_) => "no clear collective direction",
        None => "insufficient data for a collective score",
    };
    let caveat = if metric.is_anomaly {
        " — driven by an outlier, treat with caution"
    } else {
        ""
    };
    format!("Read: {direction}{caveat}.")
}

/// The single operator-facing message for a critical tick. No market signal
/// is ever emitted alongside it.
pub fn format_critical_message(report: &QualityReport) -> String {
    let top_issue = report.top_issue().unwrap_or("no issue details");
    format!(
        "Data quality CRITICAL (score {:.0}) — analysis suspended, no signal emitted.\n\
         Top issue: {top_issue}\n\
         Remediation: check the snapshot job, RPC endpoint and price feed, then re-run the validator.",
        report.overall_score
    )
}
