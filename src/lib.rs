//! # Form Layout Learner
//!
//! Learns, per document issuer, where the key fields of a recurring paper form
//! sit on the page (provider, tax id, document number, date, line-item rows
//! and columns) from user corrections to automated text extraction, and reuses
//! that layout to populate the same fields on future scans.

pub mod aggregator;
pub mod alignment;
pub mod cache;
pub mod config;
pub mod engine;
pub mod errors;
pub mod geometry;
pub mod model;
pub mod observability;
pub mod product_matcher;
pub mod region_locator;
pub mod store;
pub mod template_scorer;
pub mod text_processing;

// Re-export types for easier access
pub use config::LearningConfig;
pub use engine::{merge_suggestions, CorrectionOutcome, FormField, FormState, LearningEngine, Suggestion};
pub use errors::{LearningError, LearningResult};
pub use geometry::{NormalizedRect, PixelRect, StoredRect};
pub use model::{FieldId, FinalValues, IssuerKey, IssuerLayout, ScanObservation};
pub use store::{InMemoryStore, LayoutStore};
pub use template_scorer::MatchDecision;
