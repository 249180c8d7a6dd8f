//! # Template Scorer
//!
//! Scores every known issuer layout against the current scan and selects the
//! best one. The score blends a geometric signal (how well the layout's field
//! rectangles overlap the fields detected on this scan) with a textual signal
//! (whether anything on the scan looks like the layout's issuer key):
//!
//! `score = (iou_weight * iou + text_weight * text) / (iou_weight + text_weight)`
//!
//! Ties are broken deterministically: higher total field confidence, then
//! higher version, then the lexicographically smaller issuer key.

use crate::cache::SharedSimilarityCache;
use crate::config::ScoringConfig;
use crate::model::{IssuerLayout, ScanObservation};
use crate::text_processing::{digits_only, fuzzy_contains, normalize, numeric_ratio, ratio};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// What the caller may do with the best layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDecision {
    /// Score reached the apply threshold: populate fields from the layout
    Apply,
    /// Score reached only the confirm threshold: fill empty fields only
    Confirm,
}

impl MatchDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchDecision::Apply => "apply",
            MatchDecision::Confirm => "confirm",
        }
    }
}

/// Score breakdown of one layout against one scan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutScore {
    pub score: f64,
    pub iou: f64,
    pub text: f64,
}

/// The selected layout with its score
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutMatch {
    pub layout: IssuerLayout,
    pub score: LayoutScore,
    pub decision: MatchDecision,
}

/// Normalized issuer candidates of a scan: every detected field value plus
/// every long-enough token of the whole recognized text
pub fn build_candidates(scan: &ScanObservation, min_token_len: usize) -> BTreeSet<String> {
    let mut candidates = BTreeSet::new();

    for guess in scan.fields.values() {
        candidates.insert(normalize(&guess.text));
    }
    for item in &scan.line_items {
        for value in [&item.description, &item.units, &item.price, &item.amount] {
            candidates.insert(normalize(value));
        }
    }
    for fragment in &scan.fragments {
        for token in fragment.text.split_whitespace() {
            if token.chars().count() >= min_token_len {
                candidates.insert(normalize(token));
            }
        }
    }

    candidates.retain(|c| !c.is_empty());
    candidates
}

/// Jaccard overlap of the sets of digits appearing in two strings
fn digit_overlap(a: &str, b: &str) -> f64 {
    let ga: BTreeSet<char> = digits_only(a).chars().collect();
    let gb: BTreeSet<char> = digits_only(b).chars().collect();
    let union = ga.union(&gb).count();
    if union == 0 {
        return 0.0;
    }
    ga.intersection(&gb).count() as f64 / union as f64
}

pub struct TemplateScorer {
    config: ScoringConfig,
    cache: Option<SharedSimilarityCache>,
}

impl TemplateScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            cache: None,
        }
    }

    /// Share a similarity cache across scoring runs
    pub fn with_cache(mut self, cache: SharedSimilarityCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    fn cached_ratio(&self, a: &str, b: &str) -> f64 {
        match &self.cache {
            Some(cache) => {
                cache.get_or_insert_with((a.to_string(), b.to_string()), || ratio(a, b))
            }
            None => ratio(a, b),
        }
    }

    /// Textual evidence that a single candidate names the issuer
    pub fn candidate_score(&self, candidate: &str, key: &str) -> f64 {
        if candidate.is_empty() || key.is_empty() {
            return 0.0;
        }
        if candidate == key {
            return 1.0;
        }

        let len_c = candidate.chars().count() as f64;
        let len_k = key.chars().count() as f64;
        if candidate.contains(key) || key.contains(candidate) {
            return 0.8 + 0.15 * (len_c.min(len_k) / len_c.max(len_k));
        }

        if numeric_ratio(candidate) >= 0.5 && numeric_ratio(key) >= 0.5 {
            return 0.6 + 0.3 * digit_overlap(candidate, key);
        }

        if fuzzy_contains(candidate, key, 0.5) {
            return 0.5 + 0.2 * self.cached_ratio(candidate, key);
        }

        0.0
    }

    /// Strongest single candidate signal
    pub fn text_score(&self, candidates: &BTreeSet<String>, key: &str) -> f64 {
        candidates
            .iter()
            .map(|c| self.candidate_score(c, key))
            .fold(0.0, f64::max)
    }

    /// Mean IoU over fields present both in the layout and on the scan
    pub fn iou_score(&self, layout: &IssuerLayout, scan: &ScanObservation) -> f64 {
        if scan.image.is_empty() {
            return 0.0;
        }
        let overlaps: Vec<f64> = layout
            .fields
            .iter()
            .filter_map(|(field, stored)| {
                let detected = scan.detected_rect(*field)?;
                Some(stored.rect.to_pixels(scan.image).iou(&detected))
            })
            .collect();
        if overlaps.is_empty() {
            0.0
        } else {
            overlaps.iter().sum::<f64>() / overlaps.len() as f64
        }
    }

    pub fn score(
        &self,
        layout: &IssuerLayout,
        scan: &ScanObservation,
        candidates: &BTreeSet<String>,
    ) -> LayoutScore {
        let iou = self.iou_score(layout, scan);
        let text = self.text_score(candidates, layout.key.as_str());
        let weights = self.config.iou_weight + self.config.text_weight;
        let score = if weights > 0.0 {
            (self.config.iou_weight * iou + self.config.text_weight * text) / weights
        } else {
            0.0
        };
        LayoutScore { score, iou, text }
    }

    /// Decision for a score, `None` below the confirm threshold
    pub fn decide(&self, score: f64) -> Option<MatchDecision> {
        if score >= self.config.apply_threshold {
            Some(MatchDecision::Apply)
        } else if score >= self.config.confirm_threshold {
            Some(MatchDecision::Confirm)
        } else {
            None
        }
    }

    /// Rank all active layouts, best first
    pub fn rank<'a>(
        &self,
        layouts: &'a [IssuerLayout],
        scan: &ScanObservation,
    ) -> Vec<(&'a IssuerLayout, LayoutScore)> {
        let candidates = build_candidates(scan, self.config.min_token_len);
        trace!(candidates = candidates.len(), "Built issuer candidates");

        let mut ranked: Vec<(&IssuerLayout, LayoutScore)> = layouts
            .iter()
            .filter(|l| l.active)
            .map(|l| (l, self.score(l, scan, &candidates)))
            .collect();
        ranked.sort_by(|a, b| compare_ranked(b, a));

        for (layout, score) in &ranked {
            trace!(
                issuer_key = %layout.key,
                score = score.score,
                iou = score.iou,
                text = score.text,
                "Scored layout"
            );
        }
        ranked
    }

    /// Best layout whose score reaches at least the confirm threshold
    pub fn best(&self, layouts: &[IssuerLayout], scan: &ScanObservation) -> Option<LayoutMatch> {
        let ranked = self.rank(layouts, scan);
        let (layout, score) = ranked.into_iter().next()?;
        match self.decide(score.score) {
            Some(decision) => {
                debug!(
                    issuer_key = %layout.key,
                    score = score.score,
                    decision = decision.as_str(),
                    "Selected layout"
                );
                Some(LayoutMatch {
                    layout: layout.clone(),
                    score,
                    decision,
                })
            }
            None => {
                debug!(
                    issuer_key = %layout.key,
                    score = score.score,
                    "Best layout below confirm threshold"
                );
                None
            }
        }
    }
}

impl Default for TemplateScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

/// Ascending order: a "greater" entry is the better one. Only identical
/// scores fall through to the tie-break, which keeps the order total.
fn compare_ranked(a: &(&IssuerLayout, LayoutScore), b: &(&IssuerLayout, LayoutScore)) -> Ordering {
    let (la, sa) = a;
    let (lb, sb) = b;
    sa.score
        .total_cmp(&sb.score)
        .then_with(|| la.total_confidence().total_cmp(&lb.total_confidence()))
        .then_with(|| la.version.cmp(&lb.version))
        .then_with(|| lb.key.cmp(&la.key))
}
