//! Persistence of correction records, layouts and finalized line items
//!
//! [`LayoutStore`] is the interface the engine talks to. [`InMemoryStore`]
//! keeps everything behind a `parking_lot::RwLock` and can be written to or
//! read from a JSON snapshot file.

use crate::errors::error_logging::{log_malformed_rect, log_malformed_snapshot_value};
use crate::errors::{LearningError, LearningResult};
use crate::geometry::StoredRect;
use crate::model::{
    CorrectionRecord, FieldId, FieldSample, IssuerKey, IssuerLayout, LayoutId, LineItem, RecordId,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

/// Storage used by the learning engine
pub trait LayoutStore: Send + Sync {
    /// All records of one issuer
    fn list_records(&self, key: &IssuerKey) -> LearningResult<Vec<CorrectionRecord>>;

    /// Every layout, active or superseded
    fn list_layouts(&self) -> LearningResult<Vec<IssuerLayout>>;

    fn save_record(&self, record: CorrectionRecord) -> LearningResult<RecordId>;

    /// Store a layout as the active one for its key, deactivating the previous one
    fn save_layout(&self, layout: IssuerLayout) -> LearningResult<LayoutId>;

    /// Active layout of one issuer
    fn find_layout(&self, key: &IssuerKey) -> LearningResult<Option<IssuerLayout>>;

    /// Line items of the issuer's most recently finalized document
    fn line_items(&self, key: &IssuerKey) -> LearningResult<Vec<LineItem>>;

    fn save_line_items(&self, key: &IssuerKey, items: Vec<LineItem>) -> LearningResult<()>;
}

#[derive(Default)]
struct StoreState {
    records: Vec<CorrectionRecord>,
    layouts: Vec<IssuerLayout>,
    line_items: HashMap<IssuerKey, Vec<LineItem>>,
    next_record_id: u64,
    next_layout_id: u64,
}

/// Store holding everything in memory
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.state.read().records.len()
    }

    /// Write the store to a JSON file
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_snapshot_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;
        info!(path = %path.display(), "Saved store snapshot");
        Ok(())
    }

    /// Read a store from a JSON file; a missing file yields an empty store
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(Self::new());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot from {}", path.display()))?;
        let store = Self::from_snapshot_json(&json)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
        info!(
            path = %path.display(),
            records = store.record_count(),
            "Loaded store snapshot"
        );
        Ok(store)
    }

    pub fn to_snapshot_json(&self) -> LearningResult<String> {
        let state = self.state.read();
        let snapshot = Snapshot {
            records: state.records.iter().map(RecordEntry::from).collect(),
            layouts: state.layouts.iter().map(LayoutEntry::from).collect(),
            line_items: state
                .line_items
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Parse a snapshot. Malformed values and unknown fields are dropped with a
    /// warning; a record or layout is skipped only when it cannot be used at all.
    pub fn from_snapshot_json(json: &str) -> LearningResult<Self> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        let mut state = StoreState::default();

        for entry in snapshot.records {
            if let Some(record) = entry.into_record() {
                if let Some(id) = record.id {
                    state.next_record_id = state.next_record_id.max(id.0);
                }
                state.records.push(record);
            }
        }
        for entry in snapshot.layouts {
            if let Some(layout) = entry.into_layout() {
                if let Some(id) = layout.id {
                    state.next_layout_id = state.next_layout_id.max(id.0);
                }
                state.layouts.push(layout);
            }
        }
        for (raw_key, items) in snapshot.line_items {
            match IssuerKey::from_raw(&raw_key) {
                Some(key) => {
                    state.line_items.insert(key, items);
                }
                None => warn!(key = %raw_key, "Skipping line items with empty issuer key"),
            }
        }

        Ok(Self {
            state: RwLock::new(state),
        })
    }
}

impl LayoutStore for InMemoryStore {
    fn list_records(&self, key: &IssuerKey) -> LearningResult<Vec<CorrectionRecord>> {
        let state = self.state.read();
        Ok(state
            .records
            .iter()
            .filter(|r| &r.key == key)
            .cloned()
            .collect())
    }

    fn list_layouts(&self) -> LearningResult<Vec<IssuerLayout>> {
        Ok(self.state.read().layouts.clone())
    }

    fn save_record(&self, mut record: CorrectionRecord) -> LearningResult<RecordId> {
        let mut state = self.state.write();
        state.next_record_id += 1;
        let id = RecordId(state.next_record_id);
        record.id = Some(id);
        debug!(issuer_key = %record.key, record_id = id.0, "Saved correction record");
        state.records.push(record);
        Ok(id)
    }

    fn save_layout(&self, mut layout: IssuerLayout) -> LearningResult<LayoutId> {
        let mut state = self.state.write();
        if state
            .layouts
            .iter()
            .any(|l| l.key == layout.key && l.active && l.version >= layout.version)
        {
            return Err(LearningError::Storage(format!(
                "layout version {} for '{}' is not newer than the active one",
                layout.version, layout.key
            )));
        }
        for previous in state.layouts.iter_mut().filter(|l| l.key == layout.key) {
            previous.active = false;
        }
        state.next_layout_id += 1;
        let id = LayoutId(state.next_layout_id);
        layout.id = Some(id);
        layout.active = true;
        debug!(
            issuer_key = %layout.key,
            layout_id = id.0,
            version = layout.version,
            "Saved layout"
        );
        state.layouts.push(layout);
        Ok(id)
    }

    fn find_layout(&self, key: &IssuerKey) -> LearningResult<Option<IssuerLayout>> {
        let state = self.state.read();
        Ok(state
            .layouts
            .iter()
            .find(|l| &l.key == key && l.active)
            .cloned())
    }

    fn line_items(&self, key: &IssuerKey) -> LearningResult<Vec<LineItem>> {
        Ok(self
            .state
            .read()
            .line_items
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    fn save_line_items(&self, key: &IssuerKey, items: Vec<LineItem>) -> LearningResult<()> {
        self.state.write().line_items.insert(key.clone(), items);
        Ok(())
    }
}

// Snapshot file layout. Rectangles stay raw strings and every other value is
// read leniently, so a single bad value only drops its own field.

#[derive(Serialize, Deserialize)]
struct Snapshot {
    #[serde(default, deserialize_with = "lenient_vec")]
    records: Vec<RecordEntry>,
    #[serde(default, deserialize_with = "lenient_vec")]
    layouts: Vec<LayoutEntry>,
    #[serde(default, deserialize_with = "lenient_map")]
    line_items: BTreeMap<String, Vec<LineItem>>,
}

#[derive(Serialize, Deserialize)]
struct SampleEntry {
    #[serde(default, deserialize_with = "lenient")]
    rect: Option<String>,
    #[serde(default)]
    text: String,
}

#[derive(Serialize, Deserialize)]
struct RecordEntry {
    #[serde(default, deserialize_with = "lenient")]
    id: Option<u64>,
    key: String,
    #[serde(default, deserialize_with = "lenient_map")]
    fields: BTreeMap<String, SampleEntry>,
    #[serde(default)]
    image_ref: String,
    #[serde(default, deserialize_with = "lenient")]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct LayoutEntry {
    #[serde(default, deserialize_with = "lenient")]
    id: Option<u64>,
    key: String,
    #[serde(default, deserialize_with = "lenient_map")]
    fields: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "lenient_map")]
    confidence: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "lenient_map")]
    values: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "lenient")]
    version: Option<u32>,
    #[serde(default, deserialize_with = "lenient_vec")]
    record_ids: Vec<u64>,
    #[serde(default, deserialize_with = "lenient")]
    active: Option<bool>,
}

fn from_snapshot_value<T: DeserializeOwned>(value: &Value, context: &str) -> Option<T> {
    match T::deserialize(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            log_malformed_snapshot_value(&value.to_string(), context, &e);
            None
        }
    }
}

/// Optional value that degrades to `None` when it has the wrong shape
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(from_snapshot_value(&value, "value"))
}

/// List that keeps only its readable entries
fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let values = Vec::<Value>::deserialize(deserializer)?;
    Ok(values
        .iter()
        .filter_map(|value| from_snapshot_value(value, "list entry"))
        .collect())
}

/// Map that keeps only its readable entries
fn lenient_map<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let values = BTreeMap::<String, Value>::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .filter_map(|(name, value)| from_snapshot_value(&value, &name).map(|v| (name, v)))
        .collect())
}

fn parse_field(raw: &str, context: &str) -> Option<FieldId> {
    match raw.parse::<FieldId>() {
        Ok(field) => Some(field),
        Err(e) => {
            warn!(field = %raw, context, error = %e, "Skipping unknown field");
            None
        }
    }
}

fn parse_rect(raw: &str, field: FieldId, context: &str) -> Option<StoredRect> {
    match raw.parse::<StoredRect>() {
        Ok(rect) => Some(rect),
        Err(_) => {
            log_malformed_rect(raw, field.as_str(), context);
            None
        }
    }
}

impl From<&CorrectionRecord> for RecordEntry {
    fn from(record: &CorrectionRecord) -> Self {
        Self {
            id: record.id.map(|id| id.0),
            key: record.key.as_str().to_string(),
            fields: record
                .fields
                .iter()
                .map(|(field, sample)| {
                    (
                        field.as_str().to_string(),
                        SampleEntry {
                            rect: sample.rect.map(|r| r.encode()),
                            text: sample.text.clone(),
                        },
                    )
                })
                .collect(),
            image_ref: record.image_ref.clone(),
            created_at: Some(record.created_at),
        }
    }
}

impl RecordEntry {
    fn into_record(self) -> Option<CorrectionRecord> {
        let Some(key) = IssuerKey::from_raw(&self.key) else {
            warn!(key = %self.key, "Skipping record with empty issuer key");
            return None;
        };
        let Some(created_at) = self.created_at else {
            warn!(key = %self.key, "Skipping record without a valid timestamp");
            return None;
        };
        let mut fields = BTreeMap::new();
        for (raw_field, sample) in self.fields {
            let Some(field) = parse_field(&raw_field, "record") else {
                continue;
            };
            let rect = sample
                .rect
                .as_deref()
                .and_then(|raw| parse_rect(raw, field, "record"));
            fields.insert(
                field,
                FieldSample {
                    rect,
                    text: sample.text,
                },
            );
        }
        Some(CorrectionRecord {
            id: self.id.map(RecordId),
            key,
            fields,
            image_ref: self.image_ref,
            created_at,
        })
    }
}

impl From<&IssuerLayout> for LayoutEntry {
    fn from(layout: &IssuerLayout) -> Self {
        let names = |m: &BTreeMap<FieldId, f64>| -> BTreeMap<String, f64> {
            m.iter().map(|(f, v)| (f.as_str().to_string(), *v)).collect()
        };
        Self {
            id: layout.id.map(|id| id.0),
            key: layout.key.as_str().to_string(),
            fields: layout
                .fields
                .iter()
                .map(|(f, r)| (f.as_str().to_string(), r.encode()))
                .collect(),
            confidence: names(&layout.confidence),
            values: layout
                .values
                .iter()
                .map(|(f, v)| (f.as_str().to_string(), v.clone()))
                .collect(),
            version: Some(layout.version),
            record_ids: layout.record_ids.iter().map(|id| id.0).collect(),
            active: Some(layout.active),
        }
    }
}

impl LayoutEntry {
    fn into_layout(self) -> Option<IssuerLayout> {
        let Some(key) = IssuerKey::from_raw(&self.key) else {
            warn!(key = %self.key, "Skipping layout with empty issuer key");
            return None;
        };
        let Some(version) = self.version else {
            warn!(key = %self.key, "Skipping layout without a valid version");
            return None;
        };
        let mut fields = BTreeMap::new();
        for (raw_field, raw_rect) in &self.fields {
            let Some(field) = parse_field(raw_field, "layout") else {
                continue;
            };
            if let Some(rect) = parse_rect(raw_rect, field, "layout") {
                fields.insert(field, rect);
            }
        }
        // confidence only for fields that survived parsing
        let confidence = self
            .confidence
            .iter()
            .filter_map(|(raw, v)| raw.parse::<FieldId>().ok().map(|f| (f, *v)))
            .filter(|(f, v)| fields.contains_key(f) && (0.0..=1.0).contains(v))
            .collect();
        let values = self
            .values
            .iter()
            .filter_map(|(raw, v)| parse_field(raw, "layout values").map(|f| (f, v.clone())))
            .collect();

        Some(IssuerLayout {
            id: self.id.map(LayoutId),
            key,
            fields,
            confidence,
            values,
            version,
            record_ids: self.record_ids.into_iter().map(RecordId).collect(),
            active: self.active.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::NormalizedRect;
    use std::collections::BTreeSet;

    fn key(raw: &str) -> IssuerKey {
        IssuerKey::from_raw(raw).unwrap()
    }

    fn layout(raw_key: &str, version: u32) -> IssuerLayout {
        IssuerLayout {
            id: None,
            key: key(raw_key),
            fields: BTreeMap::from([(
                FieldId::TaxId,
                StoredRect::new(NormalizedRect::new(0.1, 0.1, 0.2, 0.05).unwrap(), false),
            )]),
            confidence: BTreeMap::from([(FieldId::TaxId, 1.0)]),
            values: BTreeMap::new(),
            version,
            record_ids: BTreeSet::new(),
            active: true,
        }
    }

    fn record(raw_key: &str) -> CorrectionRecord {
        CorrectionRecord {
            id: None,
            key: key(raw_key),
            fields: BTreeMap::from([(
                FieldId::TaxId,
                FieldSample {
                    rect: Some(StoredRect::new(
                        NormalizedRect::new(0.1, 0.1, 0.2, 0.05).unwrap(),
                        true,
                    )),
                    text: "B12345678".to_string(),
                },
            )]),
            image_ref: "scan-1.jpg".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_ids_are_assigned_in_order() {
        let store = InMemoryStore::new();
        let a = store.save_record(record("b1")).unwrap();
        let b = store.save_record(record("b1")).unwrap();
        store.save_record(record("c2")).unwrap();
        assert!(a < b);
        assert_eq!(store.list_records(&key("b1")).unwrap().len(), 2);
    }

    #[test]
    fn test_save_layout_supersedes_previous() {
        let store = InMemoryStore::new();
        store.save_layout(layout("b1", 0)).unwrap();
        store.save_layout(layout("b1", 1)).unwrap();
        store.save_layout(layout("c2", 0)).unwrap();

        let all = store.list_layouts().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all.iter().filter(|l| l.key == key("b1") && l.active).count(), 1);
        assert_eq!(store.find_layout(&key("b1")).unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_stale_layout_version_is_rejected() {
        let store = InMemoryStore::new();
        store.save_layout(layout("b1", 3)).unwrap();
        let err = store.save_layout(layout("b1", 3)).unwrap_err();
        assert!(matches!(err, LearningError::Storage(_)));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = InMemoryStore::new();
        store.save_record(record("b1")).unwrap();
        store.save_layout(layout("b1", 0)).unwrap();
        store
            .save_line_items(&key("b1"), vec![LineItem::new("Leche", "2", "0,95", "1,90")])
            .unwrap();

        let json = store.to_snapshot_json().unwrap();
        assert!(json.contains("0.100000,0.100000,0.200000,0.050000|fallback"));

        let loaded = InMemoryStore::from_snapshot_json(&json).unwrap();
        assert_eq!(loaded.list_records(&key("b1")).unwrap(), store.list_records(&key("b1")).unwrap());
        assert_eq!(loaded.find_layout(&key("b1")).unwrap(), store.find_layout(&key("b1")).unwrap());
        assert_eq!(loaded.line_items(&key("b1")).unwrap().len(), 1);

        // ids keep increasing after a reload
        let next = loaded.save_record(record("b1")).unwrap();
        assert_eq!(next, RecordId(2));
    }

    #[test]
    fn test_malformed_rect_drops_only_that_field() {
        let json = r#"{
            "layouts": [{
                "id": 1,
                "key": "B1",
                "fields": {
                    "tax_id": "0.1,0.1,0.2,0.05",
                    "doc_date": "0.1,abc,0.2,0.05",
                    "totals": "0.1,0.1,0.2,0.05"
                },
                "confidence": {"tax_id": 1.0, "doc_date": 1.0},
                "version": 2,
                "active": true
            }]
        }"#;
        let store = InMemoryStore::from_snapshot_json(json).unwrap();
        let layout = store.find_layout(&key("b1")).unwrap().unwrap();
        assert_eq!(layout.fields.len(), 1);
        assert!(layout.fields.contains_key(&FieldId::TaxId));
        assert!(!layout.confidence.contains_key(&FieldId::DocDate));
        assert_eq!(layout.version, 2);
    }

    #[test]
    fn test_bad_numbers_degrade_to_absent_values() {
        let json = r#"{
            "records": [
                {
                    "id": 3,
                    "key": "B1",
                    "fields": {"tax_id": {"rect": "0.1,0.1,0.2,0.05", "text": "B1"}},
                    "created_at": "2024-03-01T10:00:00Z"
                },
                {"id": 4, "key": "B1", "created_at": "yesterday"},
                {"id": "five", "key": "B1", "created_at": "2024-03-02T10:00:00Z"}
            ],
            "layouts": [
                {
                    "id": 1,
                    "key": "B1",
                    "fields": {"tax_id": "0.1,0.1,0.2,0.05", "doc_date": "0.5,0.1,0.2,0.05"},
                    "confidence": {"tax_id": "n/a", "doc_date": 1.5},
                    "version": 2,
                    "record_ids": [3, "x"],
                    "active": true
                },
                {"id": 2, "key": "C2", "version": "latest", "active": true}
            ],
            "line_items": {"b1": "none", "c2": [{"description": "Pan"}]}
        }"#;
        let store = InMemoryStore::from_snapshot_json(json).unwrap();

        // the record with a bad timestamp is unusable, the bad id only loses the id
        let records = store.list_records(&key("b1")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, Some(RecordId(3)));
        assert!(records[0].fields[&FieldId::TaxId].rect.is_some());
        assert_eq!(records[1].id, None);

        let layout = store.find_layout(&key("b1")).unwrap().unwrap();
        assert_eq!(layout.fields.len(), 2);
        assert!(layout.confidence.is_empty());
        assert_eq!(layout.record_ids, BTreeSet::from([RecordId(3)]));
        assert!(store.find_layout(&key("c2")).unwrap().is_none());

        assert!(store.line_items(&key("b1")).unwrap().is_empty());
        assert_eq!(store.line_items(&key("c2")).unwrap()[0].description, "Pan");
    }

    #[test]
    fn test_invalid_json_is_format_error() {
        let err = InMemoryStore::from_snapshot_json("not json").err().unwrap();
        assert!(matches!(err, LearningError::Format(_)));
    }
}
