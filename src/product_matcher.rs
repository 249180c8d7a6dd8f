//! Reuse of recurring line-item numerics
//!
//! An issuer tends to send the same products over and over, with slightly
//! different recognized descriptions each time. Detected items are paired
//! greedily with previously finalized items of the same issuer and their
//! units, price and amount are copied over when the pairing is convincing.

use crate::cache::SharedSimilarityCache;
use crate::config::ProductMatchConfig;
use crate::model::LineItem;
use crate::text_processing::{normalize_description, ratio};
use tracing::debug;

/// One pairing of a current item with a stored one
#[derive(Debug, Clone, PartialEq)]
pub struct ProductMatch {
    pub current_index: usize,
    pub stored_index: usize,
    pub similarity: f64,
    /// Number of numeric fields copied from the stored item
    pub copied: usize,
}

pub struct ProductMatcher {
    config: ProductMatchConfig,
    cache: Option<SharedSimilarityCache>,
}

impl ProductMatcher {
    pub fn new(config: ProductMatchConfig) -> Self {
        Self {
            config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: SharedSimilarityCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Similarity of two descriptions after normalization
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let a = normalize_description(a);
        let b = normalize_description(b);
        match &self.cache {
            Some(cache) => cache.get_or_insert_with((a.clone(), b.clone()), || ratio(&a, &b)),
            None => ratio(&a, &b),
        }
    }

    /// Pair and fill `current` from `stored`
    ///
    /// Each current item, in order, takes the most similar stored item not
    /// yet used, provided the similarity reaches the minimum. Descriptions are
    /// never overwritten and unmatched stored items are not added.
    pub fn apply(&self, current: &mut [LineItem], stored: &[LineItem]) -> Vec<ProductMatch> {
        let mut used = vec![false; stored.len()];
        let mut matches = Vec::new();

        for (current_index, item) in current.iter_mut().enumerate() {
            if item.description.trim().is_empty() {
                continue;
            }
            let best = stored
                .iter()
                .enumerate()
                .filter(|(i, _)| !used[*i])
                .map(|(i, s)| (i, self.similarity(&item.description, &s.description)))
                .filter(|(_, sim)| *sim >= self.config.min_similarity)
                .fold(None, |best: Option<(usize, f64)>, candidate| match best {
                    Some(b) if b.1 >= candidate.1 => Some(b),
                    _ => Some(candidate),
                });

            let Some((stored_index, similarity)) = best else {
                continue;
            };
            used[stored_index] = true;

            let copied = self.copy_numerics(item, &stored[stored_index], similarity);
            debug!(
                current = %item.description,
                stored = %stored[stored_index].description,
                similarity,
                copied,
                "Matched line item"
            );
            matches.push(ProductMatch {
                current_index,
                stored_index,
                similarity,
                copied,
            });
        }

        crate::observability::record_product_matches(current.len(), matches.len());
        matches
    }

    fn copy_numerics(&self, target: &mut LineItem, source: &LineItem, similarity: f64) -> usize {
        let overwrite = similarity > self.config.overwrite_similarity;
        let mut copied = 0;
        for (dst, src) in [
            (&mut target.units, &source.units),
            (&mut target.price, &source.price),
            (&mut target.amount, &source.amount),
        ] {
            if src.trim().is_empty() {
                continue;
            }
            if overwrite || dst.trim().is_empty() {
                if dst.as_str() != src.as_str() {
                    *dst = src.clone();
                }
                copied += 1;
            }
        }
        copied
    }
}

impl Default for ProductMatcher {
    fn default() -> Self {
        Self::new(ProductMatchConfig::default())
    }
}
