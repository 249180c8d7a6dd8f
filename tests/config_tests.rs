//! # Configuration Tests
//!
//! Loading engine configuration from `LAYOUT_*` environment variables.

use form_layout_learner::{LearningConfig, LearningError};
use std::env;

const VARS: [&str; 5] = [
    "LAYOUT_APPLY_THRESHOLD",
    "LAYOUT_MIN_RECORDS",
    "LAYOUT_LOG_LEVEL",
    "LAYOUT_LOG_FORMAT",
    "LAYOUT_CACHE_CAPACITY",
];

fn clear_vars() {
    for var in VARS {
        env::remove_var(var);
    }
}

// Environment variables are process-wide, so every scenario runs in one test.
#[test]
fn test_config_from_env() {
    clear_vars();
    let defaults = LearningConfig::from_env().unwrap();
    assert_eq!(defaults, LearningConfig::default());
    assert!(defaults.validate().is_ok());

    env::set_var("LAYOUT_APPLY_THRESHOLD", "0.8");
    env::set_var("LAYOUT_MIN_RECORDS", "3");
    env::set_var("LAYOUT_LOG_LEVEL", "debug");
    env::set_var("LAYOUT_LOG_FORMAT", "JSON");
    env::set_var("LAYOUT_CACHE_CAPACITY", "0");
    let config = LearningConfig::from_env().unwrap();
    assert_eq!(config.scoring.apply_threshold, 0.8);
    assert_eq!(config.aggregation.min_records, 3);
    assert_eq!(config.observability.log_level, "debug");
    assert!(config.observability.json_logs);
    assert_eq!(config.cache.similarity_capacity, 0);
    assert!(config.validate().is_ok());
    assert!(config.summary().contains("min_records=3"));

    env::set_var("LAYOUT_MIN_RECORDS", "many");
    let err = LearningConfig::from_env().unwrap_err();
    assert!(matches!(err, LearningError::Config(_)));
    assert!(err.to_string().starts_with("[CONFIG]"));

    env::set_var("LAYOUT_MIN_RECORDS", "2");
    env::set_var("LAYOUT_APPLY_THRESHOLD", "0.3");
    let config = LearningConfig::from_env().unwrap();
    // apply below confirm
    assert!(config.validate().is_err());

    clear_vars();
}
