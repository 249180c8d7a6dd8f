//! # Template Aggregation
//!
//! Learning only happens from genuine corrections: a finalized document turns
//! into a [`CorrectionRecord`] when the user changed something the extractor
//! produced. Once an issuer has enough records, [`TemplateAggregator`] folds
//! them into a new [`IssuerLayout`] by taking, per field and per coordinate,
//! the median of every contributing rectangle.
//!
//! Aggregation is a pure function of the record set: the same records always
//! produce the same rectangles and confidences.

use crate::config::AggregationConfig;
use crate::geometry::{envelope, median, NormalizedRect, PixelRect, StoredRect};
use crate::model::{
    CorrectionRecord, FieldId, FieldSample, FinalValues, IssuerKey, IssuerLayout, LineItem,
    ScanObservation,
};
use crate::region_locator::{LocateRequest, RegionLocator};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Whether the finalized values differ from what was extracted
///
/// A header field counts only when the extractor produced a non-blank value
/// and the trimmed final value is different. Line items count when any row
/// differs positionally, or the final list has extra non-blank rows.
pub fn is_genuine_correction(scan: &ScanObservation, final_values: &FinalValues) -> bool {
    let header_changed = FieldId::ANCHORS.iter().any(|field| {
        let extracted = scan.field_text(*field).unwrap_or("").trim();
        let finalized = final_values.field(*field).unwrap_or("").trim();
        !extracted.is_empty() && extracted != finalized
    });

    header_changed || line_items_changed(&scan.line_items, &final_values.line_items)
}

fn line_items_changed(detected: &[LineItem], finalized: &[LineItem]) -> bool {
    let differs = detected
        .iter()
        .zip(finalized.iter())
        .any(|(d, f)| !d.same_values(f));
    let extra = finalized
        .iter()
        .skip(detected.len())
        .any(|item| !item.is_blank());
    differs || extra
}

/// Column rectangles of the numeric line-item fields
///
/// Column `i` spans horizontally from the leftmost to the rightmost `i`-th
/// numeric element over all lines, and vertically over the whole row region.
fn product_columns(items: &[LineItem], row: Option<&PixelRect>) -> BTreeMap<FieldId, PixelRect> {
    let mut columns = BTreeMap::new();
    for (index, field) in FieldId::PRODUCT_COLUMNS.iter().enumerate() {
        let cells: Vec<PixelRect> = items
            .iter()
            .filter_map(|item| item.numeric_rects.get(index).copied())
            .collect();
        let Some(cells_env) = envelope(&cells) else {
            continue;
        };
        let (top, bottom) = match row {
            Some(r) => (r.top, r.bottom()),
            None => (cells_env.top, cells_env.bottom()),
        };
        columns.insert(
            *field,
            PixelRect::new(cells_env.left, top, cells_env.width, bottom - top),
        );
    }
    columns
}

/// Build the record for a corrected document
///
/// Header fields with a non-empty final value are located on the scan; a
/// value that cannot be located is kept without a rectangle. Line-item regions
/// come from the detected line rectangles.
pub fn build_record(
    key: IssuerKey,
    scan: &ScanObservation,
    final_values: &FinalValues,
    locator: &RegionLocator,
    created_at: DateTime<Utc>,
) -> CorrectionRecord {
    let mut fields = BTreeMap::new();

    for field in FieldId::ANCHORS {
        let Some(text) = final_values.field(field) else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        let request = LocateRequest {
            field,
            target: text,
            fragments: &scan.fragments,
            extracted: scan.fields.get(&field),
            image: scan.image,
        };
        let rect = locator.locate(&request).and_then(|located| {
            NormalizedRect::from_pixels(&located.rect, scan.image)
                .map(|rect| StoredRect::new(rect, located.low_confidence))
        });
        fields.insert(
            field,
            FieldSample {
                rect,
                text: text.trim().to_string(),
            },
        );
    }

    let row_rects: Vec<PixelRect> = scan.line_items.iter().filter_map(|i| i.rect).collect();
    let row = envelope(&row_rects);
    if let Some(rect) = row.and_then(|r| NormalizedRect::from_pixels(&r, scan.image)) {
        fields.insert(
            FieldId::ProductRow,
            FieldSample {
                rect: Some(StoredRect::new(rect, false)),
                text: String::new(),
            },
        );
    }
    for (field, column) in product_columns(&scan.line_items, row.as_ref()) {
        if let Some(rect) = NormalizedRect::from_pixels(&column, scan.image) {
            fields.insert(
                field,
                FieldSample {
                    rect: Some(StoredRect::new(rect, false)),
                    text: String::new(),
                },
            );
        }
    }

    debug!(
        issuer_key = %key,
        fields = fields.len(),
        located = fields.values().filter(|s| s.rect.is_some()).count(),
        "Built correction record"
    );

    CorrectionRecord {
        id: None,
        key,
        fields,
        image_ref: scan.image_ref.clone(),
        created_at,
    }
}

pub struct TemplateAggregator {
    config: AggregationConfig,
}

impl TemplateAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn min_records(&self) -> usize {
        self.config.min_records
    }

    /// Fold an issuer's records into a new layout
    ///
    /// Returns `None` below the minimum record count. `previous` is the
    /// currently active layout for the key, if any; the result's version
    /// follows it.
    pub fn aggregate(
        &self,
        key: &IssuerKey,
        records: &[CorrectionRecord],
        previous: Option<&IssuerLayout>,
    ) -> Option<IssuerLayout> {
        let mut records: Vec<&CorrectionRecord> =
            records.iter().filter(|r| &r.key == key).collect();
        if records.len() < self.config.min_records {
            debug!(
                issuer_key = %key,
                records = records.len(),
                min_records = self.config.min_records,
                "Not enough records to aggregate"
            );
            return None;
        }
        records.sort_by(|a, b| a.id.cmp(&b.id).then(a.created_at.cmp(&b.created_at)));

        let total = records.len() as f64;
        let mut fields = BTreeMap::new();
        let mut confidence = BTreeMap::new();

        for field in FieldId::ALL {
            let samples: Vec<StoredRect> = records
                .iter()
                .filter_map(|r| r.fields.get(&field).and_then(|s| s.rect))
                .collect();
            if samples.is_empty() {
                continue;
            }
            let coord = |f: fn(&NormalizedRect) -> f64| -> Option<f64> {
                median(&samples.iter().map(|s| f(&s.rect)).collect::<Vec<_>>())
            };
            let learned = match (
                coord(NormalizedRect::x),
                coord(NormalizedRect::y),
                coord(NormalizedRect::w),
                coord(NormalizedRect::h),
            ) {
                (Some(x), Some(y), Some(w), Some(h)) => NormalizedRect::new(x, y, w, h),
                _ => None,
            };
            let Some(learned) = learned else {
                warn!(issuer_key = %key, field = %field, "Median rectangle out of range, skipping field");
                continue;
            };
            let fallback_votes = samples.iter().filter(|s| s.fallback).count();
            let fallback = fallback_votes * 2 > samples.len();

            fields.insert(field, StoredRect::new(learned, fallback));
            confidence.insert(field, samples.len() as f64 / total);
        }

        let values = latest_constant_values(&records);
        let record_ids: BTreeSet<_> = records.iter().filter_map(|r| r.id).collect();
        let version = previous.map(|p| p.version + 1).unwrap_or(0);

        info!(
            issuer_key = %key,
            records = records.len(),
            fields = fields.len(),
            version,
            "Aggregated issuer layout"
        );
        crate::observability::record_aggregation(records.len(), fields.len());

        Some(IssuerLayout {
            id: None,
            key: key.clone(),
            fields,
            confidence,
            values,
            version,
            record_ids,
            active: true,
        })
    }
}

impl Default for TemplateAggregator {
    fn default() -> Self {
        Self::new(AggregationConfig::default())
    }
}

/// Most recent non-empty text of each issuer-constant field
fn latest_constant_values(records: &[&CorrectionRecord]) -> BTreeMap<FieldId, String> {
    let mut ordered: Vec<&&CorrectionRecord> = records.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let mut values = BTreeMap::new();
    for record in ordered {
        for (field, sample) in &record.fields {
            if field.is_issuer_constant() && !sample.text.trim().is_empty() {
                values.insert(*field, sample.text.clone());
            }
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::ImageSize;
    use crate::model::{FieldGuess, OcrFragment, RecordId};
    use chrono::TimeZone;

    fn record(id: u64, key: &str, fields: &[(FieldId, (f64, f64, f64, f64))]) -> CorrectionRecord {
        CorrectionRecord {
            id: Some(RecordId(id)),
            key: IssuerKey::from_raw(key).unwrap(),
            fields: fields
                .iter()
                .map(|(f, (x, y, w, h))| {
                    (
                        *f,
                        FieldSample {
                            rect: Some(StoredRect::new(
                                NormalizedRect::new(*x, *y, *w, *h).unwrap(),
                                false,
                            )),
                            text: String::new(),
                        },
                    )
                })
                .collect(),
            image_ref: String::new(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, id as u32).unwrap(),
        }
    }

    fn assert_rect(rect: NormalizedRect, expected: (f64, f64, f64, f64)) {
        assert!((rect.x() - expected.0).abs() < 1e-9, "x = {}", rect.x());
        assert!((rect.y() - expected.1).abs() < 1e-9, "y = {}", rect.y());
        assert!((rect.w() - expected.2).abs() < 1e-9, "w = {}", rect.w());
        assert!((rect.h() - expected.3).abs() < 1e-9, "h = {}", rect.h());
    }

    #[test]
    fn test_median_per_coordinate() {
        let records = vec![
            record(1, "b12345678", &[(FieldId::DocNumber, (0.10, 0.10, 0.20, 0.05))]),
            record(2, "b12345678", &[(FieldId::DocNumber, (0.12, 0.09, 0.19, 0.05))]),
            record(3, "b12345678", &[(FieldId::DocNumber, (0.50, 0.50, 0.50, 0.50))]),
        ];
        let key = IssuerKey::from_raw("b12345678").unwrap();
        let layout = TemplateAggregator::default()
            .aggregate(&key, &records, None)
            .unwrap();
        assert_rect(layout.rect(FieldId::DocNumber).unwrap(), (0.12, 0.10, 0.20, 0.05));
        assert_eq!(layout.version, 0);
        assert_eq!(layout.record_ids.len(), 3);
    }

    #[test]
    fn test_two_records_produce_layout_one_does_not() {
        let records = vec![
            record(1, "b12345678", &[(FieldId::TaxId, (0.05, 0.05, 0.10, 0.03))]),
            record(2, "b12345678", &[(FieldId::TaxId, (0.06, 0.04, 0.11, 0.03))]),
            record(3, "a11111111", &[(FieldId::TaxId, (0.06, 0.04, 0.11, 0.03))]),
        ];
        let aggregator = TemplateAggregator::default();

        let key = IssuerKey::from_raw("b12345678").unwrap();
        let layout = aggregator.aggregate(&key, &records, None).unwrap();
        assert_rect(layout.rect(FieldId::TaxId).unwrap(), (0.055, 0.045, 0.105, 0.03));
        assert_eq!(layout.confidence[&FieldId::TaxId], 1.0);

        let other = IssuerKey::from_raw("a11111111").unwrap();
        assert!(aggregator.aggregate(&other, &records, None).is_none());
    }

    #[test]
    fn test_aggregation_is_deterministic_and_versioned() {
        let records = vec![
            record(2, "b12345678", &[(FieldId::TaxId, (0.06, 0.04, 0.11, 0.03))]),
            record(
                1,
                "b12345678",
                &[
                    (FieldId::TaxId, (0.05, 0.05, 0.10, 0.03)),
                    (FieldId::DocDate, (0.70, 0.05, 0.10, 0.03)),
                ],
            ),
        ];
        let key = IssuerKey::from_raw("b12345678").unwrap();
        let aggregator = TemplateAggregator::default();
        let first = aggregator.aggregate(&key, &records, None).unwrap();
        let second = aggregator.aggregate(&key, &records, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.confidence[&FieldId::DocDate], 0.5);

        let next = aggregator.aggregate(&key, &records, Some(&first)).unwrap();
        assert_eq!(next.version, first.version + 1);
    }

    #[test]
    fn test_latest_constant_values() {
        let mut old = record(1, "b12345678", &[]);
        old.fields.insert(
            FieldId::Provider,
            FieldSample {
                rect: None,
                text: "Distribuciones Norte".to_string(),
            },
        );
        let mut new = record(2, "b12345678", &[]);
        new.fields.insert(
            FieldId::Provider,
            FieldSample {
                rect: None,
                text: "Distribuciones Norte S.L.".to_string(),
            },
        );
        new.fields.insert(
            FieldId::DocNumber,
            FieldSample {
                rect: None,
                text: "A-001".to_string(),
            },
        );
        let key = IssuerKey::from_raw("b12345678").unwrap();
        let layout = TemplateAggregator::default()
            .aggregate(&key, &[new, old], None)
            .unwrap();
        assert_eq!(layout.values[&FieldId::Provider], "Distribuciones Norte S.L.");
        assert!(!layout.values.contains_key(&FieldId::DocNumber));
        assert!(layout.fields.is_empty());
    }

    fn scan() -> ScanObservation {
        let mut scan = ScanObservation::new(ImageSize::new(1000, 1000));
        scan.fields.insert(
            FieldId::TaxId,
            FieldGuess::new("B1234S678", Some(PixelRect::new(50.0, 50.0, 100.0, 30.0))),
        );
        scan.fragments
            .push(OcrFragment::new("B12345678", PixelRect::new(52.0, 48.0, 98.0, 30.0)));
        scan.line_items = vec![LineItem::new("Leche", "2", "0,95", "1,90")];
        scan
    }

    #[test]
    fn test_genuine_correction_predicate() {
        let scan = scan();
        let mut final_values = FinalValues {
            fields: BTreeMap::from([(FieldId::TaxId, "B1234S678 ".to_string())]),
            line_items: scan.line_items.clone(),
        };
        assert!(!is_genuine_correction(&scan, &final_values));

        final_values
            .fields
            .insert(FieldId::TaxId, "B12345678".to_string());
        assert!(is_genuine_correction(&scan, &final_values));

        // extractor had nothing: filling the field in is not a correction
        final_values
            .fields
            .insert(FieldId::TaxId, "B1234S678".to_string());
        final_values
            .fields
            .insert(FieldId::DocDate, "01/03/2024".to_string());
        assert!(!is_genuine_correction(&scan, &final_values));

        final_values.line_items[0].amount = "1,95".to_string();
        assert!(is_genuine_correction(&scan, &final_values));

        final_values.line_items = scan.line_items.clone();
        final_values.line_items.push(LineItem::default());
        assert!(!is_genuine_correction(&scan, &final_values));
        final_values
            .line_items
            .push(LineItem::new("Pan", "1", "", ""));
        assert!(is_genuine_correction(&scan, &final_values));
    }

    #[test]
    fn test_build_record_locates_corrected_fields() {
        let mut scan = scan();
        scan.line_items = vec![
            LineItem {
                rect: Some(PixelRect::new(50.0, 400.0, 900.0, 30.0)),
                numeric_rects: vec![
                    PixelRect::new(600.0, 400.0, 40.0, 30.0),
                    PixelRect::new(700.0, 400.0, 60.0, 30.0),
                    PixelRect::new(850.0, 400.0, 80.0, 30.0),
                ],
                ..LineItem::new("Leche", "2", "0,95", "1,90")
            },
            LineItem {
                rect: Some(PixelRect::new(50.0, 440.0, 900.0, 30.0)),
                numeric_rects: vec![
                    PixelRect::new(590.0, 440.0, 40.0, 30.0),
                    PixelRect::new(710.0, 440.0, 60.0, 30.0),
                ],
                ..LineItem::new("Pan", "1", "1,20", "")
            },
        ];
        let final_values = FinalValues {
            fields: BTreeMap::from([
                (FieldId::TaxId, "B12345678".to_string()),
                (FieldId::DocNumber, "not on the page".to_string()),
            ]),
            line_items: Vec::new(),
        };
        let key = final_values.issuer_key().unwrap();
        let record = build_record(
            key,
            &scan,
            &final_values,
            &RegionLocator::default(),
            Utc::now(),
        );

        let tax = record.fields[&FieldId::TaxId].rect.unwrap();
        assert!(!tax.fallback);
        assert_rect(tax.rect, (0.052, 0.048, 0.098, 0.03));

        let doc = &record.fields[&FieldId::DocNumber];
        assert!(doc.rect.is_none());
        assert_eq!(doc.text, "not on the page");

        assert_rect(record.rect(FieldId::ProductRow).unwrap(), (0.05, 0.40, 0.90, 0.07));
        assert_rect(record.rect(FieldId::ProductUnits).unwrap(), (0.59, 0.40, 0.05, 0.07));
        assert_rect(record.rect(FieldId::ProductPrice).unwrap(), (0.70, 0.40, 0.07, 0.07));
        assert_rect(record.rect(FieldId::ProductAmount).unwrap(), (0.85, 0.40, 0.08, 0.07));
    }
}
