//! # Region Locator
//!
//! Maps a corrected text value back to the image rectangle it most plausibly
//! came from. Recognized text is noisy (merged and split tokens, misread
//! characters), so location runs an ordered chain of strategies, from the
//! tightest to the loosest, and the first strategy that answers wins:
//!
//! 1. [`ExtractorEcho`]: the value equals what the extractor produced, reuse its rectangle
//! 2. [`ExactFragment`]: smallest fragment whose normalized text equals the value
//! 3. [`MultiWordUnion`]: locate words independently and take their envelope
//! 4. [`WholeStringFuzzy`]: first fragment fuzzily containing the whole value
//! 5. [`ExtractorFallback`]: the extractor's rectangle, whatever its text
//!
//! The last two are low-confidence; rectangles they produce are stored with the
//! fallback marker.

use crate::config::LocatorConfig;
use crate::geometry::{envelope, ImageSize, PixelRect};
use crate::model::{FieldGuess, FieldId, OcrFragment};
use crate::text_processing::{edit_distance, fuzzy_contains, normalize, split_words};
use tracing::{debug, trace};

/// Everything a strategy may look at
#[derive(Debug, Clone, Copy)]
pub struct LocateRequest<'a> {
    pub field: FieldId,
    /// Corrected value to locate
    pub target: &'a str,
    pub fragments: &'a [OcrFragment],
    /// What the extractor originally proposed for this field
    pub extracted: Option<&'a FieldGuess>,
    pub image: ImageSize,
}

/// A rectangle found by one of the strategies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Located {
    pub rect: PixelRect,
    pub strategy: &'static str,
    pub low_confidence: bool,
}

/// One link of the locator chain
pub trait LocateStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rectangles from this strategy are flagged as fallback when stored
    fn low_confidence(&self) -> bool {
        false
    }

    fn locate(&self, request: &LocateRequest<'_>) -> Option<PixelRect>;
}

/// Value unchanged from extraction: keep the extractor's rectangle
pub struct ExtractorEcho;

impl LocateStrategy for ExtractorEcho {
    fn name(&self) -> &'static str {
        "extractor_echo"
    }

    fn locate(&self, request: &LocateRequest<'_>) -> Option<PixelRect> {
        let guess = request.extracted?;
        if guess.text.trim() == request.target.trim() {
            guess.rect
        } else {
            None
        }
    }
}

/// Fragments whose normalized text equals the normalized value; smallest wins
pub struct ExactFragment;

impl LocateStrategy for ExactFragment {
    fn name(&self) -> &'static str {
        "exact_fragment"
    }

    fn locate(&self, request: &LocateRequest<'_>) -> Option<PixelRect> {
        let target = normalize(request.target);
        smallest_exact(request.fragments, &target)
    }
}

fn smallest_exact(fragments: &[OcrFragment], normalized: &str) -> Option<PixelRect> {
    if normalized.is_empty() {
        return None;
    }
    fragments
        .iter()
        .filter(|f| normalize(&f.text) == normalized)
        .map(|f| f.rect)
        .min_by(|a, b| a.area().total_cmp(&b.area()))
}

/// Locate each word of a multi-word value and return their envelope
pub struct MultiWordUnion {
    config: LocatorConfig,
}

impl MultiWordUnion {
    pub fn new(config: LocatorConfig) -> Self {
        Self { config }
    }

    fn near_centroid(&self, rect: &PixelRect, centroid: Option<(f64, f64)>, image: ImageSize) -> bool {
        let Some((cx, cy)) = centroid else {
            return true;
        };
        let (fx, fy) = rect.center();
        let vertical_ok = (fy - cy).abs() < self.config.vertical_proximity_factor * rect.height;
        let horizontal_ok =
            (fx - cx).abs() < self.config.horizontal_proximity_ratio * image.width as f64;
        vertical_ok && horizontal_ok
    }

    fn locate_word(
        &self,
        word: &str,
        fragments: &[(String, &OcrFragment)],
        centroid: Option<(f64, f64)>,
        image: ImageSize,
    ) -> Option<(PixelRect, &'static str)> {
        // (a) exact normalized match
        let exact = fragments
            .iter()
            .filter(|(norm, _)| norm == word)
            .map(|(_, f)| f.rect)
            .min_by(|a, b| a.area().total_cmp(&b.area()));
        if let Some(rect) = exact {
            return Some((rect, "exact"));
        }

        // (b) fuzzy containment, gated by proximity to words already located
        let fuzzy = fragments.iter().find(|(_, f)| {
            fuzzy_contains(&f.text, word, self.config.word_fuzzy_threshold)
                && self.near_centroid(&f.rect, centroid, image)
        });
        if let Some((_, f)) = fuzzy {
            return Some((f.rect, "fuzzy"));
        }

        // (c) closest fragment by edit distance, within a length-relative budget
        let max_distance =
            (self.config.max_edit_ratio * word.chars().count() as f64).floor() as usize;
        fragments
            .iter()
            .map(|(norm, f)| (edit_distance(norm, word), f.rect))
            .filter(|(distance, _)| *distance <= max_distance)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, rect)| (rect, "edit_distance"))
    }
}

impl LocateStrategy for MultiWordUnion {
    fn name(&self) -> &'static str {
        "multi_word_union"
    }

    fn locate(&self, request: &LocateRequest<'_>) -> Option<PixelRect> {
        let words = split_words(request.target);
        if words.len() < 2 {
            return None;
        }

        let fragments: Vec<(String, &OcrFragment)> = request
            .fragments
            .iter()
            .map(|f| (normalize(&f.text), f))
            .filter(|(norm, _)| !norm.is_empty())
            .collect();

        let mut located: Vec<PixelRect> = Vec::new();
        for word in &words {
            let centroid = centroid(&located);
            if let Some((rect, how)) = self.locate_word(word, &fragments, centroid, request.image) {
                trace!(field = %request.field, word = %word, how = how, "Located word");
                located.push(rect);
            }
        }

        let quorum = words.len().div_ceil(self.config.word_quorum_divisor);
        if located.len() >= quorum {
            debug!(
                field = %request.field,
                words = words.len(),
                located = located.len(),
                "Multi-word union reached quorum"
            );
            envelope(located.iter())
        } else {
            None
        }
    }
}

fn centroid(rects: &[PixelRect]) -> Option<(f64, f64)> {
    if rects.is_empty() {
        return None;
    }
    let n = rects.len() as f64;
    let (sx, sy) = rects.iter().fold((0.0, 0.0), |(sx, sy), r| {
        let (cx, cy) = r.center();
        (sx + cx, sy + cy)
    });
    Some((sx / n, sy / n))
}

/// First fragment that fuzzily contains the whole value
pub struct WholeStringFuzzy {
    threshold: f64,
    min_len: usize,
}

impl WholeStringFuzzy {
    pub fn new(threshold: f64, min_len: usize) -> Self {
        Self { threshold, min_len }
    }
}

impl LocateStrategy for WholeStringFuzzy {
    fn name(&self) -> &'static str {
        "whole_string_fuzzy"
    }

    fn low_confidence(&self) -> bool {
        true
    }

    fn locate(&self, request: &LocateRequest<'_>) -> Option<PixelRect> {
        if normalize(request.target).chars().count() < self.min_len {
            return None;
        }
        request
            .fragments
            .iter()
            .filter(|f| !normalize(&f.text).is_empty())
            .find(|f| fuzzy_contains(&f.text, request.target, self.threshold))
            .map(|f| f.rect)
    }
}

/// Whatever rectangle the extractor proposed for the field
pub struct ExtractorFallback;

impl LocateStrategy for ExtractorFallback {
    fn name(&self) -> &'static str {
        "extractor_fallback"
    }

    fn low_confidence(&self) -> bool {
        true
    }

    fn locate(&self, request: &LocateRequest<'_>) -> Option<PixelRect> {
        request.extracted.and_then(|g| g.rect)
    }
}

/// Ordered chain of locate strategies
pub struct RegionLocator {
    strategies: Vec<Box<dyn LocateStrategy>>,
}

impl RegionLocator {
    /// The standard cascade
    pub fn new(config: LocatorConfig) -> Self {
        let whole = WholeStringFuzzy::new(config.whole_string_threshold, config.whole_string_min_len);
        Self::with_strategies(vec![
            Box::new(ExtractorEcho),
            Box::new(ExactFragment),
            Box::new(MultiWordUnion::new(config)),
            Box::new(whole),
            Box::new(ExtractorFallback),
        ])
    }

    /// A custom chain, tried in the given order
    pub fn with_strategies(strategies: Vec<Box<dyn LocateStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run the chain; `None` means the field is absent on this scan
    pub fn locate(&self, request: &LocateRequest<'_>) -> Option<Located> {
        if request.target.trim().is_empty() {
            return None;
        }
        for strategy in &self.strategies {
            if let Some(rect) = strategy.locate(request) {
                if rect.area() <= 0.0 {
                    continue;
                }
                debug!(
                    field = %request.field,
                    strategy = strategy.name(),
                    "Located field region"
                );
                crate::observability::record_locator_hit(strategy.name());
                return Some(Located {
                    rect,
                    strategy: strategy.name(),
                    low_confidence: strategy.low_confidence(),
                });
            }
        }
        debug!(field = %request.field, "No region found for corrected value");
        crate::observability::record_locator_hit("none");
        None
    }
}

impl Default for RegionLocator {
    fn default() -> Self {
        Self::new(LocatorConfig::default())
    }
}
