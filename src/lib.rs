//! Ananya - privacy-preserving interaction analysis and aggregation
//!
//! Raw learner interactions go in; two things come out. A deterministic adaptation
//! decision for the tutoring loop, and noised, group-size-gated aggregates for
//! instructors. Session identity is cut off at the anonymizer and never persisted.
//!
//! ## Pipeline
//! Interaction -> `anonymizer` -> `extractor` -> `engine` ->
//! { decision to caller, signal to `aggregator`, entry to `audit` }
//!
//! The `orchestrator` drives that flow per session and `daemon` serves it over a
//! Unix socket.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

pub mod aggregator;
pub mod anonymizer;
pub mod audit;
pub mod config;
pub mod content;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod model;
pub mod orchestrator;

pub use aggregator::{AggregateReport, Aggregator, AnalyticsQuery, FlushOutcome, TimeWindow};
pub use anonymizer::{Anonymizer, SessionIdentity};
pub use audit::{AuditLogger, AuditSink, IncidentKind, IncidentLog};
pub use config::Config;
pub use content::{ContentCatalog, ContentMetadata, InMemoryCatalog};
pub use engine::{BiasEngine, Evaluation, Evaluator, Policy};
pub use error::{Error, Result as AnanyaResult};
pub use model::{
    ActionType, AdaptationAction, AdaptationDecision, BiasSignal, BiasType, FeatureSummary, Interaction,
    SessionFingerprint,
};
pub use orchestrator::Orchestrator;

/// Create the data directory, default config and audit database
pub fn init(data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

    let config_path = data_dir.join("config.toml");
    if !config_path.exists() {
        Config::default()
            .save(&config_path)
            .context("Failed to write default config")?;
        info!("Created default config at {:?}", config_path);
    }

    let audit_path = data_dir.join(daemon::AUDIT_DB);
    AuditLogger::open(&audit_path).context("Failed to create audit database")?;

    info!("Ananya initialized at {:?}", data_dir);
    Ok(())
}
