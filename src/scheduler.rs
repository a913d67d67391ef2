//! Job scheduling and gating.
//!
//! Two long-lived tasks: the hourly snapshot (first run immediately at
//! startup) and the periodic analysis. Each task is a sequential loop, so a
//! job can never overlap itself; the two jobs may run concurrently with each
//! other. The analysis tick runs the validator first and gates on its
//! status.

use crate::accumulation::AccumulationCalculator;
use crate::notifier::Notifier;
use crate::quality::DataQualityValidator;
use crate::snapshot_job::SnapshotJob;
use crate::types::QualityStatus;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

pub struct Orchestrator {
    pub snapshot_job: Arc<SnapshotJob>,
    pub validator: Arc<DataQualityValidator>,
    pub calculator: Arc<AccumulationCalculator>,
    pub notifier: Arc<Notifier>,
    pub snapshot_interval_hours: u32,
    pub analysis_interval_hours: u32,
}

impl Orchestrator {
    /// Spawn both job loops. The returned handles live for the process
    /// lifetime; aborting them cancels the jobs between runs.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![self.clone().spawn_snapshot_loop(), self.spawn_analysis_loop()]
    }

    fn spawn_snapshot_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(
                self.snapshot_interval_hours as u64 * 3600,
            ));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately: one snapshot at startup,
            // and a failure there must not abort the process.
            loop {
                tick.tick().await;
                match self.snapshot_job.run().await {
                    Ok(summary) => info!(
                        whales = summary.whales,
                        written = summary.written,
                        block = summary.block_height,
                        "snapshot job finished"
                    ),
                    Err(e) => error!(error = %e, "snapshot job failed"),
                }
            }
        })
    }

    fn spawn_analysis_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(
                self.analysis_interval_hours as u64 * 3600,
            ));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Swallow the immediate tick: analysis waits a full interval so
            // the snapshot table has something to say.
            tick.tick().await;

            let mut last_status: Option<QualityStatus> = None;
            loop {
                tick.tick().await;
                last_status = self.analysis_tick(last_status).await;
            }
        })
    }

    /// One gated analysis pass. Returns the quality status observed, for
    /// change detection across ticks.
    pub async fn analysis_tick(&self, last_status: Option<QualityStatus>) -> Option<QualityStatus> {
        let report = match self.validator.run().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "data quality validation failed, skipping analysis");
                return last_status;
            }
        };

        if let Some(previous) = last_status {
            if previous != report.overall_status {
                self.notifier
                    .notify_status_change(previous, report.overall_status, report.overall_score)
                    .await;
            }
        }

        match report.overall_status {
            QualityStatus::Critical => {
                // Circuit breaker open: no metric, one diagnostic alert.
                warn!(
                    score = report.overall_score,
                    "data quality critical — analysis aborted"
                );
                self.notifier.notify_quality_critical(&report).await;
            }
            QualityStatus::Healthy | QualityStatus::Degraded => {
                match self.calculator.compute(&report).await {
                    Ok(metric) => self.notifier.notify_metric(&metric, &report).await,
                    Err(e) => error!(error = %e, "accumulation analysis failed"),
                }
            }
        }

        Some(report.overall_status)
    }
}
