//! Core data model of the layout learning engine
//!
//! Scans arrive as [`ScanObservation`]s (recognized fragments plus the
//! extractor's best-effort field guesses). A finalized document whose values
//! differ from the extraction becomes a [`CorrectionRecord`]; records for one
//! [`IssuerKey`] are aggregated into an [`IssuerLayout`].

use crate::geometry::{ImageSize, NormalizedRect, PixelRect, StoredRect};
use crate::text_processing::normalize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Tracked fields of the recurring form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldId {
    Provider,
    TaxId,
    DocNumber,
    DocDate,
    ProductRow,
    ProductUnits,
    ProductPrice,
    ProductAmount,
}

impl FieldId {
    pub const ALL: [FieldId; 8] = [
        FieldId::Provider,
        FieldId::TaxId,
        FieldId::DocNumber,
        FieldId::DocDate,
        FieldId::ProductRow,
        FieldId::ProductUnits,
        FieldId::ProductPrice,
        FieldId::ProductAmount,
    ];

    /// Header fields used to estimate the shift between a layout and a scan
    pub const ANCHORS: [FieldId; 4] = [
        FieldId::Provider,
        FieldId::TaxId,
        FieldId::DocNumber,
        FieldId::DocDate,
    ];

    /// Numeric line-item columns, in the order numeric elements appear on a line
    pub const PRODUCT_COLUMNS: [FieldId; 3] = [
        FieldId::ProductUnits,
        FieldId::ProductPrice,
        FieldId::ProductAmount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldId::Provider => "provider",
            FieldId::TaxId => "tax_id",
            FieldId::DocNumber => "doc_number",
            FieldId::DocDate => "doc_date",
            FieldId::ProductRow => "product_row",
            FieldId::ProductUnits => "product_units",
            FieldId::ProductPrice => "product_price",
            FieldId::ProductAmount => "product_amount",
        }
    }

    pub fn is_anchor(&self) -> bool {
        Self::ANCHORS.contains(self)
    }

    /// Fields whose value is the same on every document of an issuer
    pub fn is_issuer_constant(&self) -> bool {
        matches!(self, FieldId::Provider | FieldId::TaxId)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldId {
    type Err = crate::errors::LearningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldId::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s.trim())
            .ok_or_else(|| crate::errors::LearningError::Format(format!("unknown field id '{}'", s)))
    }
}

/// Normalized identity of a document issuer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssuerKey(String);

impl IssuerKey {
    /// Normalize a raw identity string; `None` when nothing usable remains
    pub fn from_raw(raw: &str) -> Option<Self> {
        let key = normalize(raw);
        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    /// Derive the key from a tax id, falling back to the provider name
    pub fn derive(tax_id: Option<&str>, provider: Option<&str>) -> Option<Self> {
        tax_id
            .and_then(Self::from_raw)
            .or_else(|| provider.and_then(Self::from_raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssuerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned identifier of a correction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

/// Store-assigned identifier of a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayoutId(pub u64);

/// A recognized text string with its rectangle in image coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrFragment {
    pub text: String,
    pub rect: PixelRect,
}

impl OcrFragment {
    pub fn new(text: impl Into<String>, rect: PixelRect) -> Self {
        Self {
            text: text.into(),
            rect,
        }
    }
}

/// The extractor's best-effort guess for one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGuess {
    pub text: String,
    #[serde(default)]
    pub rect: Option<PixelRect>,
}

impl FieldGuess {
    pub fn new(text: impl Into<String>, rect: Option<PixelRect>) -> Self {
        Self {
            text: text.into(),
            rect,
        }
    }
}

/// One line of the document's item table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub amount: String,
    /// Rectangle of the whole line, when detected
    #[serde(default)]
    pub rect: Option<PixelRect>,
    /// Rectangles of the numeric elements on the line, left to right
    #[serde(default)]
    pub numeric_rects: Vec<PixelRect>,
}

impl LineItem {
    pub fn new(
        description: impl Into<String>,
        units: impl Into<String>,
        price: impl Into<String>,
        amount: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            units: units.into(),
            price: price.into(),
            amount: amount.into(),
            ..Self::default()
        }
    }

    /// Same visible values (rectangles are not compared)
    pub fn same_values(&self, other: &LineItem) -> bool {
        self.description.trim() == other.description.trim()
            && self.units.trim() == other.units.trim()
            && self.price.trim() == other.price.trim()
            && self.amount.trim() == other.amount.trim()
    }

    pub fn is_blank(&self) -> bool {
        self.description.trim().is_empty()
            && self.units.trim().is_empty()
            && self.price.trim().is_empty()
            && self.amount.trim().is_empty()
    }
}

/// Everything the recognizer produced for one prepared image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanObservation {
    pub image: ImageSize,
    #[serde(default)]
    pub fragments: Vec<OcrFragment>,
    /// Extractor guesses for header fields
    #[serde(default)]
    pub fields: BTreeMap<FieldId, FieldGuess>,
    /// Detected line items
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    /// Reference to the stored image this scan came from
    #[serde(default)]
    pub image_ref: String,
}

impl ScanObservation {
    pub fn new(image: ImageSize) -> Self {
        Self {
            image,
            fragments: Vec::new(),
            fields: BTreeMap::new(),
            line_items: Vec::new(),
            image_ref: String::new(),
        }
    }

    /// Text of every fragment, in recognition order
    pub fn full_text(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn field_text(&self, field: FieldId) -> Option<&str> {
        self.fields.get(&field).map(|g| g.text.as_str())
    }

    pub fn detected_rect(&self, field: FieldId) -> Option<PixelRect> {
        self.fields.get(&field).and_then(|g| g.rect)
    }
}

/// Values of the document as the user finalized them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalValues {
    #[serde(default)]
    pub fields: BTreeMap<FieldId, String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

impl FinalValues {
    pub fn field(&self, field: FieldId) -> Option<&str> {
        self.fields.get(&field).map(|s| s.as_str())
    }

    /// Issuer identity of the finalized document
    pub fn issuer_key(&self) -> Option<IssuerKey> {
        IssuerKey::derive(self.field(FieldId::TaxId), self.field(FieldId::Provider))
    }
}

/// One field of a correction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSample {
    pub rect: Option<StoredRect>,
    pub text: String,
}

/// One finalized, corrected observation of an issuer's document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    /// Assigned by the store on save
    pub id: Option<RecordId>,
    pub key: IssuerKey,
    pub fields: BTreeMap<FieldId, FieldSample>,
    pub image_ref: String,
    pub created_at: DateTime<Utc>,
}

impl CorrectionRecord {
    /// Normalized rectangle of a field, if one was located
    pub fn rect(&self, field: FieldId) -> Option<NormalizedRect> {
        self.fields
            .get(&field)
            .and_then(|s| s.rect)
            .map(|stored| stored.rect)
    }
}

/// The learned layout for one issuer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuerLayout {
    /// Assigned by the store on save
    pub id: Option<LayoutId>,
    pub key: IssuerKey,
    pub fields: BTreeMap<FieldId, StoredRect>,
    /// Fraction of contributing records that located each field
    pub confidence: BTreeMap<FieldId, f64>,
    /// Latest corrected text of issuer-constant fields (provider, tax id)
    #[serde(default)]
    pub values: BTreeMap<FieldId, String>,
    pub version: u32,
    pub record_ids: BTreeSet<RecordId>,
    pub active: bool,
}

impl IssuerLayout {
    pub fn rect(&self, field: FieldId) -> Option<NormalizedRect> {
        self.fields.get(&field).map(|stored| stored.rect)
    }

    /// Sum of per-field confidences, used to break score ties
    pub fn total_confidence(&self) -> f64 {
        self.confidence.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issuer_key_normalization() {
        let a = IssuerKey::from_raw("B-12.345.678").unwrap();
        let b = IssuerKey::from_raw(" b12345678 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "b12345678");
        assert!(IssuerKey::from_raw(" - / ").is_none());
    }

    #[test]
    fn test_issuer_key_prefers_tax_id() {
        let key = IssuerKey::derive(Some("B12345678"), Some("Distribuciones Norte")).unwrap();
        assert_eq!(key.as_str(), "b12345678");

        let key = IssuerKey::derive(Some("  "), Some("Distribuciones Norte S.L.")).unwrap();
        assert_eq!(key.as_str(), "distribucionesnortesl");

        assert!(IssuerKey::derive(None, Some("...")).is_none());
    }

    #[test]
    fn test_field_id_round_trip_names() {
        for field in FieldId::ALL {
            assert_eq!(field.as_str().parse::<FieldId>().unwrap(), field);
        }
        assert!("total".parse::<FieldId>().is_err());
    }

    #[test]
    fn test_field_id_serde_names() {
        let json = serde_json::to_string(&FieldId::TaxId).unwrap();
        assert_eq!(json, "\"tax_id\"");
    }

    #[test]
    fn test_line_item_comparison_ignores_whitespace() {
        let a = LineItem::new("Leche entera", "2", "0,95", "1,90");
        let b = LineItem::new(" Leche entera ", "2", "0,95 ", "1,90");
        assert!(a.same_values(&b));
        assert!(!a.is_blank());
        assert!(LineItem::default().is_blank());
    }
}
