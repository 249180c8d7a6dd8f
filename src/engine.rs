//! # Learning Engine
//!
//! Facade tying the components together around a [`LayoutStore`]:
//!
//! - learning: [`LearningEngine::record_correction_if_any`] turns a finalized
//!   document into a correction record and re-aggregates the issuer's layout
//! - matching: [`LearningEngine::best_layout_for`] and
//!   [`LearningEngine::suggest`] pick a layout for a new scan, align it and
//!   derive field values, line-item rows and recurring numerics
//! - population: [`merge_suggestions`] applies a suggestion to form state
//!   without ever touching a user-edited field

use crate::aggregator::{build_record, is_genuine_correction, TemplateAggregator};
use crate::alignment::{aligned_layout, Alignment, AlignmentCorrector, Offset};
use crate::cache::create_shared_similarity_cache;
use crate::config::LearningConfig;
use crate::errors::error_logging::log_storage_error;
use crate::errors::LearningResult;
use crate::geometry::{NormalizedRect, PixelRect};
use crate::model::{
    CorrectionRecord, FieldId, FinalValues, IssuerKey, IssuerLayout, LineItem, OcrFragment,
    ScanObservation,
};
use crate::product_matcher::{ProductMatch, ProductMatcher};
use crate::region_locator::RegionLocator;
use crate::store::LayoutStore;
use crate::template_scorer::{LayoutMatch, MatchDecision, TemplateScorer};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of offering a finalized document for learning
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionOutcome {
    /// A record was stored; `layout` is the re-aggregated layout, if enough records exist
    Recorded {
        record: CorrectionRecord,
        layout: Option<IssuerLayout>,
    },
    /// Final values match the extraction, nothing to learn
    NoCorrection,
    /// Neither tax id nor provider yields a usable issuer key
    EmptyIssuerKey,
}

impl CorrectionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionOutcome::Recorded { .. } => "recorded",
            CorrectionOutcome::NoCorrection => "no_correction",
            CorrectionOutcome::EmptyIssuerKey => "empty_issuer_key",
        }
    }
}

/// Everything the engine proposes for a scan
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub issuer_key: IssuerKey,
    pub layout_version: u32,
    pub score: f64,
    pub decision: MatchDecision,
    pub alignment: Alignment,
    /// Layout rectangles shifted onto this scan
    pub regions: BTreeMap<FieldId, NormalizedRect>,
    /// Suggested header values
    pub fields: BTreeMap<FieldId, String>,
    /// Indices of the detected line items inside the product row region
    pub line_item_rows: Vec<usize>,
    /// Those line items, with recurring numerics filled in
    pub line_items: Vec<LineItem>,
    pub product_matches: Vec<ProductMatch>,
}

/// One form field as the user sees it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormField {
    pub value: String,
    /// Set once the user typed into the field
    pub user_edited: bool,
}

/// Form state a suggestion is merged into
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormState {
    pub fields: BTreeMap<FieldId, FormField>,
    pub line_items: Vec<LineItem>,
}

/// Whether a suggested value may replace what the field holds
pub fn should_overwrite(field: &FormField, decision: MatchDecision) -> bool {
    if field.user_edited {
        return false;
    }
    match decision {
        MatchDecision::Apply => true,
        MatchDecision::Confirm => field.value.trim().is_empty(),
    }
}

/// Apply a suggestion to the form; returns the fields that changed
///
/// Line items are only filled when the form has none yet.
pub fn merge_suggestions(form: &mut FormState, suggestion: &Suggestion) -> Vec<FieldId> {
    let mut changed = Vec::new();
    for (field, value) in &suggestion.fields {
        if value.trim().is_empty() {
            continue;
        }
        let slot = form.fields.entry(*field).or_default();
        if should_overwrite(slot, suggestion.decision) && slot.value != *value {
            slot.value = value.clone();
            changed.push(*field);
        }
    }
    if form.line_items.iter().all(LineItem::is_blank) && !suggestion.line_items.is_empty() {
        form.line_items = suggestion.line_items.clone();
    }
    changed
}

/// Text of fragments whose center lies inside `rect`, in reading order
fn text_in_region(fragments: &[OcrFragment], rect: &PixelRect) -> String {
    let mut inside: Vec<&OcrFragment> = fragments
        .iter()
        .filter(|f| {
            let (cx, cy) = f.rect.center();
            cx >= rect.left && cx <= rect.right() && cy >= rect.top && cy <= rect.bottom()
        })
        .collect();
    inside.sort_by(|a, b| {
        a.rect
            .top
            .total_cmp(&b.rect.top)
            .then(a.rect.left.total_cmp(&b.rect.left))
    });
    inside
        .iter()
        .map(|f| f.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct LearningEngine {
    store: Arc<dyn LayoutStore>,
    config: LearningConfig,
    locator: RegionLocator,
    scorer: TemplateScorer,
    alignment: AlignmentCorrector,
    aggregator: TemplateAggregator,
    products: ProductMatcher,
    key_locks: Mutex<HashMap<IssuerKey, Arc<Mutex<()>>>>,
}

impl LearningEngine {
    pub fn new(store: Arc<dyn LayoutStore>, config: LearningConfig) -> LearningResult<Self> {
        config.validate()?;

        let mut scorer = TemplateScorer::new(config.scoring.clone());
        let mut products = ProductMatcher::new(config.products.clone());
        if config.cache.similarity_capacity > 0 {
            let cache = create_shared_similarity_cache(config.cache.similarity_capacity);
            scorer = scorer.with_cache(cache.clone());
            products = products.with_cache(cache);
        }

        Ok(Self {
            store,
            locator: RegionLocator::new(config.locator.clone()),
            scorer,
            alignment: AlignmentCorrector::new(config.alignment.clone()),
            aggregator: TemplateAggregator::new(config.aggregation.clone()),
            products,
            config,
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LayoutStore> {
        &self.store
    }

    fn key_lock(&self, key: &IssuerKey) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the key's entry once no other caller holds or waits on its lock
    fn release_key_lock(&self, key: &IssuerKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock();
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    /// Best active layout for a scan, if one reaches the confirm threshold
    pub fn best_layout_for(&self, scan: &ScanObservation) -> LearningResult<Option<LayoutMatch>> {
        let layouts = self.store.list_layouts().inspect_err(|e| {
            log_storage_error(e, "list_layouts", None);
        })?;
        let best = self.scorer.best(&layouts, scan);
        match &best {
            Some(found) => {
                crate::observability::record_layout_match(Some(found.decision), found.score.score)
            }
            None => crate::observability::record_layout_match(None, 0.0),
        }
        Ok(best)
    }

    pub fn alignment_offset(&self, layout: &IssuerLayout, scan: &ScanObservation) -> Alignment {
        self.alignment.compute(layout, scan)
    }

    pub fn aligned_rect(
        &self,
        layout: &IssuerLayout,
        field: FieldId,
        offset: Offset,
    ) -> Option<NormalizedRect> {
        crate::alignment::aligned_rect(layout, field, offset)
    }

    /// Learn from a finalized document if the user corrected anything
    ///
    /// Finalized line items are remembered for the issuer whenever the key is
    /// usable, correction or not. Recording and re-aggregation for one key
    /// run under that key's lock.
    pub fn record_correction_if_any(
        &self,
        scan: &ScanObservation,
        final_values: &FinalValues,
    ) -> LearningResult<CorrectionOutcome> {
        let key = final_values.issuer_key();
        let outcome = self.record_for_key(key, scan, final_values)?;
        crate::observability::record_correction_outcome(outcome.as_str());
        Ok(outcome)
    }

    fn record_for_key(
        &self,
        key: Option<IssuerKey>,
        scan: &ScanObservation,
        final_values: &FinalValues,
    ) -> LearningResult<CorrectionOutcome> {
        let corrected = is_genuine_correction(scan, final_values);
        let Some(key) = key else {
            if corrected {
                warn!("Correction detected but no usable issuer key, nothing learned");
                return Ok(CorrectionOutcome::EmptyIssuerKey);
            }
            return Ok(CorrectionOutcome::NoCorrection);
        };

        let lock = self.key_lock(&key);
        let outcome = {
            let _guard = lock.lock();
            self.record_locked(&key, scan, final_values, corrected)
        };
        self.release_key_lock(&key, lock);
        outcome
    }

    fn record_locked(
        &self,
        key: &IssuerKey,
        scan: &ScanObservation,
        final_values: &FinalValues,
        corrected: bool,
    ) -> LearningResult<CorrectionOutcome> {
        if !final_values.line_items.is_empty() {
            self.remember_line_items(key, final_values.line_items.clone())?;
        }
        if !corrected {
            debug!(issuer_key = %key, "Final values match extraction, nothing to learn");
            return Ok(CorrectionOutcome::NoCorrection);
        }

        let mut record = build_record(key.clone(), scan, final_values, &self.locator, Utc::now());
        let record_id = self.store.save_record(record.clone()).inspect_err(|e| {
            log_storage_error(e, "save_record", Some(key.as_str()));
        })?;
        record.id = Some(record_id);

        let records = self.store.list_records(key).inspect_err(|e| {
            log_storage_error(e, "list_records", Some(key.as_str()));
        })?;
        let previous = self.store.find_layout(key)?;

        let layout = match self.aggregator.aggregate(key, &records, previous.as_ref()) {
            Some(mut layout) => {
                let layout_id = self.store.save_layout(layout.clone()).inspect_err(|e| {
                    log_storage_error(e, "save_layout", Some(key.as_str()));
                })?;
                layout.id = Some(layout_id);
                Some(layout)
            }
            None => None,
        };

        info!(
            issuer_key = %key,
            record_id = record_id.0,
            records = records.len(),
            layout_version = layout.as_ref().map(|l| l.version),
            "Recorded correction"
        );
        Ok(CorrectionOutcome::Recorded { record, layout })
    }

    /// Header values read off the aligned layout
    fn suggested_fields(
        &self,
        layout: &IssuerLayout,
        regions: &BTreeMap<FieldId, NormalizedRect>,
        scan: &ScanObservation,
    ) -> BTreeMap<FieldId, String> {
        let mut fields = BTreeMap::new();
        for field in FieldId::ANCHORS {
            if let Some(value) = layout.values.get(&field) {
                fields.insert(field, value.clone());
                continue;
            }
            let Some(region) = regions.get(&field) else {
                continue;
            };
            let text = text_in_region(&scan.fragments, &region.to_pixels(scan.image));
            if !text.is_empty() {
                fields.insert(field, text);
            }
        }
        fields
    }

    /// Detected line items that fall inside the aligned product row region
    fn line_item_rows(
        &self,
        regions: &BTreeMap<FieldId, NormalizedRect>,
        scan: &ScanObservation,
    ) -> Vec<usize> {
        let Some(row) = regions.get(&FieldId::ProductRow) else {
            return (0..scan.line_items.len()).collect();
        };
        let row = row.to_pixels(scan.image);
        scan.line_items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.rect.map(|r| r.intersects(&row)).unwrap_or(false))
            .map(|(i, _)| i)
            .collect()
    }

    /// Full suggestion for a scan, or `None` when no layout is good enough
    pub fn suggest(&self, scan: &ScanObservation) -> LearningResult<Option<Suggestion>> {
        let Some(found) = self.best_layout_for(scan)? else {
            return Ok(None);
        };
        let layout = &found.layout;
        let alignment = self.alignment_offset(layout, scan);
        let regions = aligned_layout(layout, alignment.offset);

        let fields = self.suggested_fields(layout, &regions, scan);
        let line_item_rows = self.line_item_rows(&regions, scan);
        let mut line_items: Vec<LineItem> = line_item_rows
            .iter()
            .map(|i| scan.line_items[*i].clone())
            .collect();
        let product_matches = self.fill_line_items(&layout.key, &mut line_items)?;

        debug!(
            issuer_key = %layout.key,
            fields = fields.len(),
            rows = line_item_rows.len(),
            matched = product_matches.len(),
            "Built suggestion"
        );

        Ok(Some(Suggestion {
            issuer_key: layout.key.clone(),
            layout_version: layout.version,
            score: found.score.score,
            decision: found.decision,
            alignment,
            regions,
            fields,
            line_item_rows,
            line_items,
            product_matches,
        }))
    }

    /// Fill recurring numerics from the issuer's last finalized line items
    pub fn fill_line_items(
        &self,
        key: &IssuerKey,
        items: &mut [LineItem],
    ) -> LearningResult<Vec<ProductMatch>> {
        let stored = self.store.line_items(key)?;
        if stored.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.products.apply(items, &stored))
    }

    pub fn remember_line_items(&self, key: &IssuerKey, items: Vec<LineItem>) -> LearningResult<()> {
        let items: Vec<LineItem> = items.into_iter().filter(|i| !i.is_blank()).collect();
        self.store.save_line_items(key, items).inspect_err(|e| {
            log_storage_error(e, "save_line_items", Some(key.as_str()));
        })
    }
}
