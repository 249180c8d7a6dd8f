//! # Store Snapshot Tests
//!
//! Saving the in-memory store to disk and loading it back, including
//! snapshots edited or corrupted outside the engine.

use chrono::Utc;
use form_layout_learner::geometry::NormalizedRect;
use form_layout_learner::model::{CorrectionRecord, FieldSample, LineItem};
use form_layout_learner::{FieldId, InMemoryStore, IssuerKey, LayoutStore, StoredRect};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn record(key: &IssuerKey, rect: (f64, f64, f64, f64), fallback: bool) -> CorrectionRecord {
    let (x, y, w, h) = rect;
    CorrectionRecord {
        id: None,
        key: key.clone(),
        fields: BTreeMap::from([(
            FieldId::DocDate,
            FieldSample {
                rect: Some(StoredRect::new(
                    NormalizedRect::new(x, y, w, h).unwrap(),
                    fallback,
                )),
                text: "01/03/2024".to_string(),
            },
        )]),
        image_ref: "albaran-0001.jpg".to_string(),
        created_at: Utc::now(),
    }
}

#[test]
fn test_snapshot_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("layouts.json");
    let key = IssuerKey::from_raw("B12345678").unwrap();

    let store = InMemoryStore::new();
    store
        .save_record(record(&key, (0.7, 0.05, 0.2, 0.03), false))
        .unwrap();
    store
        .save_record(record(&key, (0.71, 0.06, 0.2, 0.03), true))
        .unwrap();
    store
        .save_line_items(&key, vec![LineItem::new("Pan", "2", "1,10", "2,20")])
        .unwrap();
    store.save_snapshot(&path).unwrap();

    let loaded = InMemoryStore::load_snapshot(&path).unwrap();
    let records = loaded.list_records(&key).unwrap();
    assert_eq!(records, store.list_records(&key).unwrap());
    assert!(records[1].fields[&FieldId::DocDate].rect.unwrap().fallback);
    assert_eq!(loaded.line_items(&key).unwrap()[0].amount, "2,20");
}

#[test]
fn test_missing_snapshot_starts_empty() {
    let dir = TempDir::new().unwrap();
    let store = InMemoryStore::load_snapshot(dir.path().join("absent.json")).unwrap();
    assert_eq!(store.record_count(), 0);
    assert!(store.list_layouts().unwrap().is_empty());
}

#[test]
fn test_corrupted_rectangle_only_drops_its_field() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("layouts.json");
    std::fs::write(
        &path,
        r#"{
            "records": [{
                "id": 7,
                "key": "b12345678",
                "fields": {
                    "doc_date": {"rect": "0.7,0.05,0.2", "text": "01/03/2024"},
                    "tax_id": {"rect": "0.050000,0.050000,0.100000,0.030000|fallback", "text": "B12345678"}
                },
                "created_at": "2024-03-01T10:00:00Z"
            }]
        }"#,
    )
    .unwrap();

    let store = InMemoryStore::load_snapshot(&path).unwrap();
    let key = IssuerKey::from_raw("b12345678").unwrap();
    let records = store.list_records(&key).unwrap();
    assert_eq!(records.len(), 1);

    let date = &records[0].fields[&FieldId::DocDate];
    assert!(date.rect.is_none());
    assert_eq!(date.text, "01/03/2024");
    assert!(records[0].fields[&FieldId::TaxId].rect.unwrap().fallback);

    // new ids continue after the highest loaded one
    let id = store
        .save_record(record(&key, (0.7, 0.05, 0.2, 0.03), false))
        .unwrap();
    assert_eq!(id.0, 8);
}

#[test]
fn test_unparseable_snapshot_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("layouts.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = InMemoryStore::load_snapshot(&path).err().unwrap();
    assert!(err.to_string().contains("Failed to parse snapshot"));
}
