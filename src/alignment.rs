//! Shift correction between a learned layout and a new scan
//!
//! The same form is rarely photographed at exactly the same position. Each
//! anchor field found both in the layout and on the scan votes for a
//! translation; the per-axis median of the votes is applied to every learned
//! rectangle so one badly detected anchor cannot drag the rest along.

use crate::config::AlignmentConfig;
use crate::geometry::{median, NormalizedRect};
use crate::model::{FieldId, IssuerLayout, ScanObservation};
use std::collections::BTreeMap;
use tracing::debug;

/// Translation in normalized units
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Offset {
    pub dx: f64,
    pub dy: f64,
}

impl Offset {
    pub const ZERO: Offset = Offset { dx: 0.0, dy: 0.0 };

    pub fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }

    /// Per-axis median of a set of deltas
    pub fn median_of(deltas: &[Offset]) -> Option<Offset> {
        let xs: Vec<f64> = deltas.iter().map(|d| d.dx).collect();
        let ys: Vec<f64> = deltas.iter().map(|d| d.dy).collect();
        Some(Offset::new(median(&xs)?, median(&ys)?))
    }
}

/// How an offset was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSource {
    /// Median over this many anchors
    Anchors(usize),
    /// Estimated from the first fragment against the assumed page margin
    Margin,
    /// Nothing to estimate from
    None,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    pub offset: Offset,
    pub source: OffsetSource,
}

pub struct AlignmentCorrector {
    config: AlignmentConfig,
}

impl AlignmentCorrector {
    pub fn new(config: AlignmentConfig) -> Self {
        Self { config }
    }

    /// Anchor deltas (detected center minus layout center) for anchors present on both sides
    pub fn anchor_deltas(&self, layout: &IssuerLayout, scan: &ScanObservation) -> Vec<Offset> {
        FieldId::ANCHORS
            .iter()
            .filter_map(|field| {
                let learned = layout.rect(*field)?;
                let detected = scan.detected_rect(*field)?;
                let detected = NormalizedRect::from_pixels(&detected, scan.image)?;
                let (lx, ly) = learned.center();
                let (sx, sy) = detected.center();
                Some(Offset::new(sx - lx, sy - ly))
            })
            .collect()
    }

    /// Offset estimated from the first recognized fragment's distance to the assumed margin
    fn margin_offset(&self, scan: &ScanObservation) -> Option<Offset> {
        let first = scan.fragments.first()?;
        let rect = NormalizedRect::from_pixels(&first.rect, scan.image)?;
        let limit = self.config.max_fallback_shift;
        Some(Offset::new(
            (rect.x() - self.config.assumed_margin).clamp(-limit, limit),
            (rect.y() - self.config.assumed_margin).clamp(-limit, limit),
        ))
    }

    pub fn compute(&self, layout: &IssuerLayout, scan: &ScanObservation) -> Alignment {
        let deltas = self.anchor_deltas(layout, scan);
        let alignment = if let Some(offset) = Offset::median_of(&deltas) {
            Alignment {
                offset,
                source: OffsetSource::Anchors(deltas.len()),
            }
        } else if let Some(offset) = self.margin_offset(scan) {
            Alignment {
                offset,
                source: OffsetSource::Margin,
            }
        } else {
            Alignment {
                offset: Offset::ZERO,
                source: OffsetSource::None,
            }
        };

        debug!(
            issuer_key = %layout.key,
            dx = alignment.offset.dx,
            dy = alignment.offset.dy,
            source = ?alignment.source,
            "Computed alignment offset"
        );
        alignment
    }
}

impl Default for AlignmentCorrector {
    fn default() -> Self {
        Self::new(AlignmentConfig::default())
    }
}

/// A learned rectangle shifted by `offset`, kept inside the page
pub fn aligned_rect(layout: &IssuerLayout, field: FieldId, offset: Offset) -> Option<NormalizedRect> {
    layout
        .rect(field)
        .map(|rect| rect.translated(offset.dx, offset.dy))
}

/// Every learned rectangle shifted by `offset`
pub fn aligned_layout(layout: &IssuerLayout, offset: Offset) -> BTreeMap<FieldId, NormalizedRect> {
    layout
        .fields
        .iter()
        .map(|(field, stored)| (*field, stored.rect.translated(offset.dx, offset.dy)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ImageSize, PixelRect, StoredRect};
    use crate::model::{FieldGuess, IssuerKey, OcrFragment};

    fn layout_with(fields: &[(FieldId, (f64, f64, f64, f64))]) -> IssuerLayout {
        IssuerLayout {
            id: None,
            key: IssuerKey::from_raw("b12345678").unwrap(),
            fields: fields
                .iter()
                .map(|(f, (x, y, w, h))| {
                    (
                        *f,
                        StoredRect::new(NormalizedRect::new(*x, *y, *w, *h).unwrap(), false),
                    )
                })
                .collect(),
            confidence: BTreeMap::new(),
            values: BTreeMap::new(),
            version: 0,
            record_ids: Default::default(),
            active: true,
        }
    }

    #[test]
    fn test_median_ignores_outlier_anchor() {
        let deltas = [
            Offset::new(0.01, 0.02),
            Offset::new(0.015, 0.018),
            Offset::new(0.30, -0.25),
        ];
        let offset = Offset::median_of(&deltas).unwrap();
        assert!((offset.dx - 0.015).abs() < 1e-12);
        assert!((offset.dy - 0.018).abs() < 1e-12);
        assert!(Offset::median_of(&[]).is_none());
    }

    #[test]
    fn test_compute_from_anchors() {
        let layout = layout_with(&[
            (FieldId::TaxId, (0.10, 0.10, 0.10, 0.02)),
            (FieldId::DocDate, (0.60, 0.10, 0.10, 0.02)),
            (FieldId::ProductRow, (0.05, 0.40, 0.90, 0.30)),
        ]);
        let mut scan = ScanObservation::new(ImageSize::new(1000, 1000));
        scan.fields.insert(
            FieldId::TaxId,
            FieldGuess::new("B12345678", Some(PixelRect::new(120.0, 130.0, 100.0, 20.0))),
        );
        scan.fields.insert(
            FieldId::DocDate,
            FieldGuess::new("01/02/2024", Some(PixelRect::new(620.0, 130.0, 100.0, 20.0))),
        );

        let corrector = AlignmentCorrector::default();
        let alignment = corrector.compute(&layout, &scan);
        assert_eq!(alignment.source, OffsetSource::Anchors(2));
        assert!((alignment.offset.dx - 0.02).abs() < 1e-9);
        assert!((alignment.offset.dy - 0.03).abs() < 1e-9);

        let row = aligned_rect(&layout, FieldId::ProductRow, alignment.offset).unwrap();
        assert!((row.x() - 0.07).abs() < 1e-9);
        assert!((row.y() - 0.43).abs() < 1e-9);
    }

    #[test]
    fn test_margin_fallback_is_clamped() {
        let layout = layout_with(&[(FieldId::ProductRow, (0.05, 0.40, 0.90, 0.30))]);
        let mut scan = ScanObservation::new(ImageSize::new(1000, 1000));
        scan.fragments
            .push(OcrFragment::new("ALBARAN", PixelRect::new(80.0, 600.0, 100.0, 20.0)));

        let alignment = AlignmentCorrector::default().compute(&layout, &scan);
        assert_eq!(alignment.source, OffsetSource::Margin);
        assert!((alignment.offset.dx - 0.03).abs() < 1e-9);
        assert!((alignment.offset.dy - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_no_evidence_means_no_shift() {
        let layout = layout_with(&[(FieldId::ProductRow, (0.05, 0.40, 0.90, 0.30))]);
        let scan = ScanObservation::new(ImageSize::new(1000, 1000));
        let alignment = AlignmentCorrector::default().compute(&layout, &scan);
        assert_eq!(alignment.source, OffsetSource::None);
        assert_eq!(alignment.offset, Offset::ZERO);
    }

    #[test]
    fn test_aligned_layout_stays_on_page() {
        let layout = layout_with(&[(FieldId::ProductRow, (0.05, 0.40, 0.90, 0.30))]);
        let shifted = aligned_layout(&layout, Offset::new(0.5, -0.9));
        let row = shifted[&FieldId::ProductRow];
        assert!((row.x() - 0.10).abs() < 1e-9);
        assert_eq!(row.y(), 0.0);
        assert!(aligned_rect(&layout, FieldId::TaxId, Offset::ZERO).is_none());
    }
}
