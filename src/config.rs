//! # Unified Engine Configuration
//!
//! Every weight, threshold and empirically tuned constant of the learning engine
//! lives here, grouped per component. Each section has defaults, a `validate()`
//! method, and the whole configuration can be loaded from `LAYOUT_*`
//! environment variables.

use crate::errors::error_logging::log_config_error;
use crate::errors::{LearningError, LearningResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Weights and thresholds for scoring known layouts against a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Weight of the geometric (IoU) signal
    pub iou_weight: f64,
    /// Weight of the textual (issuer key) signal
    pub text_weight: f64,
    /// Minimum score to apply a layout to the form
    pub apply_threshold: f64,
    /// Minimum score to offer a non-destructive, fill-empty-fields-only suggestion
    pub confirm_threshold: f64,
    /// Minimum length of whole-scan tokens used as issuer candidates
    pub min_token_len: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            iou_weight: 0.7,
            text_weight: 0.3,
            apply_threshold: 0.65,
            confirm_threshold: 0.45,
            min_token_len: 4,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> LearningResult<()> {
        if self.iou_weight < 0.0 || self.text_weight < 0.0 {
            return Err(LearningError::Config(
                "Scoring weights cannot be negative".to_string(),
            ));
        }
        if self.iou_weight + self.text_weight <= 0.0 {
            return Err(LearningError::Config(
                "At least one scoring weight must be positive".to_string(),
            ));
        }
        check_unit("apply_threshold", self.apply_threshold)?;
        check_unit("confirm_threshold", self.confirm_threshold)?;
        if self.confirm_threshold > self.apply_threshold {
            return Err(LearningError::Config(
                "confirm_threshold cannot be greater than apply_threshold".to_string(),
            ));
        }
        if self.min_token_len == 0 {
            return Err(LearningError::Config(
                "min_token_len must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Thresholds used by the region locator cascade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// fuzzy_contains threshold when locating single words of a multi-word value
    pub word_fuzzy_threshold: f64,
    /// A fuzzy word match must lie within this many fragment heights of the running centroid
    pub vertical_proximity_factor: f64,
    /// ... and within this fraction of the image width horizontally
    pub horizontal_proximity_ratio: f64,
    /// Edit-distance search accepts up to this fraction of the word length
    pub max_edit_ratio: f64,
    /// At least ceil(words / divisor) words must be located for a union
    pub word_quorum_divisor: usize,
    /// fuzzy_contains threshold for the whole-string strategy
    pub whole_string_threshold: f64,
    /// Minimum normalized length of the value for the whole-string strategy
    pub whole_string_min_len: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            word_fuzzy_threshold: 0.4,
            vertical_proximity_factor: 2.0,
            horizontal_proximity_ratio: 0.5,
            max_edit_ratio: 0.6,
            word_quorum_divisor: 3,
            whole_string_threshold: 0.5,
            whole_string_min_len: 3,
        }
    }
}

impl LocatorConfig {
    pub fn validate(&self) -> LearningResult<()> {
        check_unit("word_fuzzy_threshold", self.word_fuzzy_threshold)?;
        check_unit("whole_string_threshold", self.whole_string_threshold)?;
        check_unit("horizontal_proximity_ratio", self.horizontal_proximity_ratio)?;
        check_unit("max_edit_ratio", self.max_edit_ratio)?;
        if self.vertical_proximity_factor <= 0.0 {
            return Err(LearningError::Config(
                "vertical_proximity_factor must be positive".to_string(),
            ));
        }
        if self.word_quorum_divisor == 0 {
            return Err(LearningError::Config(
                "word_quorum_divisor must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// When and how records are aggregated into layouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Minimum number of correction records before a layout is built
    pub min_records: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { min_records: 2 }
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> LearningResult<()> {
        if self.min_records == 0 {
            return Err(LearningError::Config(
                "min_records must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shift estimation between a learned layout and a new scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Assumed normalized page margin where the first fragment would start on an unshifted scan
    pub assumed_margin: f64,
    /// Clamp for the margin-based fallback offset, per axis
    pub max_fallback_shift: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            assumed_margin: 0.05,
            max_fallback_shift: 0.2,
        }
    }
}

impl AlignmentConfig {
    pub fn validate(&self) -> LearningResult<()> {
        check_unit("assumed_margin", self.assumed_margin)?;
        check_unit("max_fallback_shift", self.max_fallback_shift)?;
        Ok(())
    }
}

/// Line-item description matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMatchConfig {
    /// Minimum similarity to pair a detected item with a stored one
    pub min_similarity: f64,
    /// Above this similarity stored numerics replace non-empty detected ones
    pub overwrite_similarity: f64,
}

impl Default for ProductMatchConfig {
    fn default() -> Self {
        Self {
            min_similarity: 0.7,
            overwrite_similarity: 0.9,
        }
    }
}

impl ProductMatchConfig {
    pub fn validate(&self) -> LearningResult<()> {
        check_unit("min_similarity", self.min_similarity)?;
        check_unit("overwrite_similarity", self.overwrite_similarity)?;
        if self.overwrite_similarity < self.min_similarity {
            return Err(LearningError::Config(
                "overwrite_similarity cannot be lower than min_similarity".to_string(),
            ));
        }
        Ok(())
    }
}

/// Similarity cache sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached similarity pairs (0 disables caching)
    pub similarity_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_capacity: 4096,
        }
    }
}

/// Logging setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level for this crate (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> LearningResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(LearningError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        Ok(())
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    pub scoring: ScoringConfig,
    pub locator: LocatorConfig,
    pub aggregation: AggregationConfig,
    pub alignment: AlignmentConfig,
    pub products: ProductMatchConfig,
    pub cache: CacheConfig,
    pub observability: ObservabilityConfig,
}

impl LearningConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> LearningResult<Self> {
        let mut config = Self::default();

        config.scoring.iou_weight = env_or("LAYOUT_IOU_WEIGHT", config.scoring.iou_weight)?;
        config.scoring.text_weight = env_or("LAYOUT_TEXT_WEIGHT", config.scoring.text_weight)?;
        config.scoring.apply_threshold =
            env_or("LAYOUT_APPLY_THRESHOLD", config.scoring.apply_threshold)?;
        config.scoring.confirm_threshold =
            env_or("LAYOUT_CONFIRM_THRESHOLD", config.scoring.confirm_threshold)?;

        config.locator.vertical_proximity_factor = env_or(
            "LAYOUT_LOCATOR_VERTICAL_FACTOR",
            config.locator.vertical_proximity_factor,
        )?;
        config.locator.horizontal_proximity_ratio = env_or(
            "LAYOUT_LOCATOR_HORIZONTAL_RATIO",
            config.locator.horizontal_proximity_ratio,
        )?;

        config.aggregation.min_records =
            env_or("LAYOUT_MIN_RECORDS", config.aggregation.min_records)?;

        config.products.min_similarity =
            env_or("LAYOUT_PRODUCT_MIN_SIMILARITY", config.products.min_similarity)?;
        config.products.overwrite_similarity = env_or(
            "LAYOUT_PRODUCT_OVERWRITE_SIMILARITY",
            config.products.overwrite_similarity,
        )?;

        config.cache.similarity_capacity =
            env_or("LAYOUT_CACHE_CAPACITY", config.cache.similarity_capacity)?;

        if let Ok(level) = env::var("LAYOUT_LOG_LEVEL") {
            config.observability.log_level = level;
        }
        config.observability.json_logs = env::var("LAYOUT_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(config)
    }

    /// Validate all configuration sections
    pub fn validate(&self) -> LearningResult<()> {
        self.scoring.validate()?;
        self.locator.validate()?;
        self.aggregation.validate()?;
        self.alignment.validate()?;
        self.products.validate()?;
        self.observability.validate()?;
        Ok(())
    }

    /// Get a summary of the current configuration for logging
    pub fn summary(&self) -> String {
        format!(
            "Configuration: weights=(iou {:.2}, text {:.2}), thresholds=(apply {:.2}, confirm {:.2}), min_records={}, cache_capacity={}, log_level={}",
            self.scoring.iou_weight,
            self.scoring.text_weight,
            self.scoring.apply_threshold,
            self.scoring.confirm_threshold,
            self.aggregation.min_records,
            self.cache.similarity_capacity,
            self.observability.log_level
        )
    }
}

fn check_unit(name: &str, value: f64) -> LearningResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(LearningError::Config(format!(
            "{} must be between 0.0 and 1.0, got {}",
            name, value
        )));
    }
    Ok(())
}

fn env_or<T: FromStr>(name: &str, default: T) -> LearningResult<T> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            let error = LearningError::Config(format!("{} must be a valid number", name));
            log_config_error(&error, name, "from_env");
            error
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validation() {
        let config = LearningConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scoring.apply_threshold, 0.65);
        assert_eq!(config.aggregation.min_records, 2);
    }

    #[test]
    fn test_scoring_config_validation() {
        let mut config = ScoringConfig::default();

        config.iou_weight = -0.1;
        assert!(config.validate().is_err());
        config.iou_weight = 0.7;

        config.confirm_threshold = 0.9;
        assert!(config.validate().is_err());
        config.confirm_threshold = 0.45;

        config.iou_weight = 0.0;
        config.text_weight = 0.0;
        assert!(config.validate().is_err());
        config.text_weight = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_locator_config_validation() {
        let mut config = LocatorConfig::default();
        assert!(config.validate().is_ok());

        config.word_quorum_divisor = 0;
        assert!(config.validate().is_err());
        config.word_quorum_divisor = 3;

        config.vertical_proximity_factor = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_product_config_validation() {
        let mut config = ProductMatchConfig::default();
        config.overwrite_similarity = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_observability_config_validation() {
        let mut config = ObservabilityConfig::default();
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
        config.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_summary_mentions_thresholds() {
        let summary = LearningConfig::default().summary();
        assert!(summary.contains("apply 0.65"));
        assert!(summary.contains("min_records=2"));
    }
}
