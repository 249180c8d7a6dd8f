//! Logging setup and metrics recording.
//!
//! This module provides:
//! - Structured logging with a configurable level, pretty or JSON output
//! - Counters and histograms for the learning engine's decision points
//!
//! Metrics go through the `metrics` facade; without an installed recorder
//! they are no-ops.

use anyhow::Result;
use tracing_subscriber::prelude::*;

use crate::config::ObservabilityConfig;
use crate::template_scorer::MatchDecision;

/// Initialize structured logging with tracing and configuration
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        format!("form_layout_learner={}", config.log_level.to_lowercase()).parse()?,
    );

    let initialized = if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .try_init()
    };

    if initialized.is_ok() {
        tracing::info!(
            log_level = %config.log_level,
            json = config.json_logs,
            "Tracing initialized with structured logging"
        );
    }
    Ok(())
}

/// Which locator strategy produced a rectangle ("none" when nothing did)
pub fn record_locator_hit(strategy: &'static str) {
    metrics::counter!("locator_hits_total", "strategy" => strategy).increment(1);
}

/// Outcome of selecting a layout for a scan
pub fn record_layout_match(decision: Option<MatchDecision>, score: f64) {
    let outcome = decision.map(|d| d.as_str()).unwrap_or("none");
    metrics::counter!("layout_matches_total", "outcome" => outcome).increment(1);
    metrics::histogram!("layout_match_score").record(score);
}

pub fn record_aggregation(records: usize, fields: usize) {
    metrics::counter!("layout_aggregations_total").increment(1);
    metrics::histogram!("layout_aggregation_records").record(records as f64);
    metrics::histogram!("layout_aggregation_fields").record(fields as f64);
}

/// Correction outcomes: "recorded", "no_correction" or "empty_issuer_key"
pub fn record_correction_outcome(outcome: &'static str) {
    metrics::counter!("correction_outcomes_total", "outcome" => outcome).increment(1);
}

pub fn record_product_matches(items: usize, matched: usize) {
    metrics::counter!("product_items_total").increment(items as u64);
    metrics::counter!("product_matches_total").increment(matched as u64);
}
