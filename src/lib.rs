// Whale Pulse
//
// Collective whale accumulation analysis: hourly balance snapshots of the
// top Ethereum holders, a data-quality circuit breaker, and an LST-corrected
// accumulation score with diagnostic tags.

pub mod accumulation;
pub mod config;
pub mod notifier;
pub mod price;
pub mod quality;
pub mod rpc;
pub mod scheduler;
pub mod snapshot_job;
pub mod store;
pub mod types;
pub mod whales;

// Re-export commonly used items for consumers and tests
pub use accumulation::{analyze, AccumulationCalculator, AnalysisInputs, CalculatorSettings};
pub use config::Settings;
pub use quality::{DataQualityValidator, QualityThresholds};
pub use types::{
    AccumulationMetric, BalanceSnapshot, MigrationEvent, QualityReport, QualityStatus, Tag,
    WhaleEntry,
};
