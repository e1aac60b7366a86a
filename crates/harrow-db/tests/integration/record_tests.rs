use std::collections::BTreeMap;

use harrow_core::models::{ExtractedRecord, UpsertOutcome, WorkUnit};
use harrow_core::traits::Sink;

use crate::common::setup_test_db;

fn record(key: &str, page: u64, price: &str) -> ExtractedRecord {
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), "Oak Table".to_string());
    fields.insert("price".to_string(), price.to_string());
    ExtractedRecord::new(key, page, fields)
}

#[tokio::test]
async fn upsert_reports_insert_update_and_unchanged() {
    let (db, _container) = setup_test_db().await;
    let repo = db.record_repo();

    let first = record("http://site.test/item/1", 3, "120");
    assert_eq!(repo.upsert(&first).await.unwrap(), UpsertOutcome::Inserted);
    assert_eq!(repo.upsert(&first).await.unwrap(), UpsertOutcome::Unchanged);

    let repriced = record("http://site.test/item/1", 3, "99");
    assert_eq!(repo.upsert(&repriced).await.unwrap(), UpsertOutcome::Updated);

    let moved = record("http://site.test/item/1", 4, "99");
    assert_eq!(repo.upsert(&moved).await.unwrap(), UpsertOutcome::Updated);

    assert_eq!(repo.count().await.unwrap(), 1);
    let stored = repo.get("http://site.test/item/1").await.unwrap().unwrap();
    assert_eq!(stored, moved);
    assert!(stored.completed);
}

#[tokio::test]
async fn concurrent_upserts_on_one_key_leave_one_row() {
    let (db, _container) = setup_test_db().await;
    let repo = db.record_repo();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move { repo.upsert(&record("http://site.test/item/7", 1, "5")).await })
        })
        .collect();

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() == UpsertOutcome::Inserted {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn pages_track_completion() {
    let (db, _container) = setup_test_db().await;
    let repo = db.record_repo();

    assert!(!repo.is_page_done(2).await.unwrap());
    repo.mark_page_done(2, 50).await.unwrap();
    repo.mark_page_done(2, 50).await.unwrap();
    repo.mark_page_done(4, 50).await.unwrap();
    assert!(repo.is_page_done(2).await.unwrap());

    let unit = WorkUnit {
        range_start: 0,
        range_end: 6,
        page_size: 50,
    };
    assert_eq!(repo.list_pending(&unit).await.unwrap(), vec![0, 1, 3, 5]);

    let empty = WorkUnit {
        range_start: 6,
        range_end: 6,
        page_size: 50,
    };
    assert!(repo.list_pending(&empty).await.unwrap().is_empty());
}
