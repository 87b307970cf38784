//! Deterministic demo data for an empty store.

use chrono::Utc;
use livegrid_core::RecordData;
use livegrid_sync::storage::{RecordStore, StoreError};
use serde_json::{json, Value};

fn pick<'a>(options: &[&'a str], i: u64, salt: u64) -> &'a str {
    let idx = (i.wrapping_mul(2_654_435_761).wrapping_add(salt) >> 7) % options.len() as u64;
    options[idx as usize]
}

/// Row `i` of the seed table. Same `i`, same row.
pub fn seed_row(i: u64) -> RecordData {
    let row = json!({
        "title": format!("Item {i}"),
        "status": pick(&["draft", "in_review", "published", "archived"], i, 1),
        "score": ((i * 37) % 1000) as f64 / 10.0,
        "category": pick(&["ad", "social", "banner", "email", "landing"], i, 2),
        "created_by": format!("seed_{}", i % 10),
        "assignee": format!("person_{}", i % 5),
        "priority": pick(&["low", "medium", "high"], i, 3),
        "tags": [pick(&["summer", "sale", "test", "promo"], i, 4)],
        "comments": format!("Some notes for {i}"),
        "approved": i % 5 == 0,
        "type": pick(&["creative", "copy", "video"], i, 5),
        "owner": format!("owner_{}", i % 7),
        "size": (i * 13) % 100,
        "color": pick(&["red", "blue", "green", "yellow"], i, 6),
        "source": pick(&["inhouse", "agency", "partner"], i, 7),
        "rating": i % 5 + 1,
        "location": pick(&["US", "EU", "APAC"], i, 8),
        "notes": format!("Notes {i}"),
        "active": i % 5 != 1,
        "meta": { "index": i, "rand": ((i * 7919) % 10_000) as f64 / 10_000.0 },
    });
    match row {
        Value::Object(map) => map,
        _ => RecordData::new(),
    }
}

/// Insert `count` seed rows in batches unless the store already has rows.
///
/// Returns the number of rows inserted.
pub fn seed_if_empty(store: &dyn RecordStore, count: u64, batch: usize) -> Result<u64, StoreError> {
    let existing = store.count()?;
    if existing > 0 {
        log::info!("Store already holds {existing} records; skipping seed");
        return Ok(0);
    }

    log::info!("Seeding {count} rows (batch {batch})");
    let batch = batch.max(1) as u64;
    let mut inserted = 0u64;
    while inserted < count {
        let upper = (inserted + batch).min(count);
        let rows = (inserted + 1..=upper).map(seed_row).collect();
        store.insert_batch(rows, Utc::now())?;
        inserted = upper;
        if inserted % 5000 == 0 {
            log::info!("Inserted {inserted}/{count}");
        }
    }
    log::info!("Seeding complete");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use livegrid_sync::storage::{MemoryStore, RocksStore, StoreConfig};

    #[test]
    fn test_seed_row_is_deterministic() {
        assert_eq!(seed_row(17), seed_row(17));
        assert_ne!(seed_row(17), seed_row(18));

        let row = seed_row(3);
        assert_eq!(row["title"], json!("Item 3"));
        assert_eq!(row["created_by"], json!("seed_3"));
        assert_eq!(row["meta"]["index"], json!(3));
        assert_eq!(row.len(), 20);
    }

    #[test]
    fn test_seed_if_empty_batches() {
        let store = MemoryStore::new();
        assert_eq!(seed_if_empty(&store, 2_500, 1_000).unwrap(), 2_500);
        assert_eq!(store.count().unwrap(), 2_500);

        let tail = store.scan_after(Some(2_499), 10).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, 2_500);
        assert_eq!(tail[0].field("title"), Some(&json!("Item 2500")));
    }

    #[test]
    fn test_seed_skipped_when_populated() {
        let store = MemoryStore::new();
        store.insert(seed_row(1), Utc::now()).unwrap();
        assert_eq!(seed_if_empty(&store, 100, 10).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_seed_into_rocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(seed_if_empty(&store, 120, 50).unwrap(), 120);
        assert_eq!(store.count().unwrap(), 120);
    }
}
