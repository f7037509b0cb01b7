mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use std::sync::Arc;

use common::{category, dispatcher, drain, fast_retry, transaction, MemoryLog, COLLECTION};
use txn_search_indexer::config::IndexSettings;
use txn_search_indexer::index::{MemoryIndex, SearchIndex};
use txn_search_indexer::models::IndexedTransaction;
use txn_search_indexer::{DeleteMode, Dispatcher, WorkerMetrics};

#[tokio::test]
async fn category_edit_reaches_every_referencing_transaction_only() {
    let (dispatcher, index, metrics) = dispatcher(DeleteMode::Overwrite);
    let log = MemoryLog::new();
    // A and B reference category 3, E references category 4
    log.publish(0, &transaction(1, 3, "Food", 10.0, "create"));
    log.publish(0, &transaction(2, 3, "Food", 20.0, "create"));
    log.publish(0, &transaction(5, 4, "Rent", 500.0, "create"));
    drain(&dispatcher, &mut log.consumer(0)).await.unwrap();

    let get = |id| {
        let index = index.clone();
        async move { index.get_document(COLLECTION, id).await.unwrap().unwrap() }
    };
    let (a, b, e) = (get(1).await, get(2).await, get(5).await);
    let writes_before = index.write_requests();
    let refreshes_before = index.refresh_requests();

    log.publish(0, &category(3, json!({"category_name": "Groceries"})));
    drain(&dispatcher, &mut log.consumer(0)).await.unwrap();

    let renamed = |doc: &IndexedTransaction| IndexedTransaction {
        category_name: "Groceries".to_string(),
        ..doc.clone()
    };
    assert_eq!(get(1).await, renamed(&a));
    assert_eq!(get(2).await, renamed(&b));
    assert_eq!(get(5).await, e);

    // one update-by-query, preceded by one refresh
    assert_eq!(index.write_requests() - writes_before, 1);
    assert_eq!(index.refresh_requests() - refreshes_before, 1);
    assert_eq!(metrics.snapshot().category_fanouts, 1);
    assert_eq!(metrics.snapshot().category_documents_updated, 2);
}

#[tokio::test]
async fn logo_fields_are_patched_together() {
    let (dispatcher, index, _) = dispatcher(DeleteMode::Overwrite);
    let log = MemoryLog::new();
    log.publish(0, &transaction(1, 3, "Food", 10.0, "create"));
    log.publish(
        0,
        &category(
            3,
            json!({"category_logo_hash_id": "h2", "category_logo": "basket.png", "category_name": ""}),
        ),
    );
    drain(&dispatcher, &mut log.consumer(0)).await.unwrap();

    let doc = index.get_document(COLLECTION, 1).await.unwrap().unwrap();
    assert_eq!(doc.category_name, "Food");
    assert_eq!(doc.category_logo_hash_id, "h2");
    assert_eq!(doc.category_logo, "basket.png");
}

#[tokio::test]
async fn empty_category_edit_issues_no_writes_and_is_committed() {
    let (dispatcher, index, metrics) = dispatcher(DeleteMode::Overwrite);
    let log = MemoryLog::new();
    let offset = log.publish(
        0,
        &category(
            3,
            json!({"category_name": "", "category_logo_hash_id": "", "category_logo": ""}),
        ),
    );

    assert_eq!(drain(&dispatcher, &mut log.consumer(0)).await.unwrap(), 1);
    assert_eq!(index.write_requests(), 0);
    assert_eq!(index.refresh_requests(), 0);
    assert_eq!(log.commits(), vec![offset]);
    assert_eq!(metrics.snapshot().category_noops, 1);
}

#[tokio::test]
async fn category_edit_with_no_matching_documents_succeeds() {
    let (dispatcher, _, metrics) = dispatcher(DeleteMode::Overwrite);
    let log = MemoryLog::new();
    log.publish(0, &category(99, json!({"category_name": "Travel"})));

    assert_eq!(drain(&dispatcher, &mut log.consumer(0)).await.unwrap(), 1);
    assert_eq!(metrics.snapshot().category_documents_updated, 0);
    assert_eq!(metrics.snapshot().committed, 1);
}

#[tokio::test]
async fn category_edit_is_a_single_request_without_pre_refresh() {
    let index = Arc::new(MemoryIndex::new());
    let settings = IndexSettings {
        collection: COLLECTION.to_string(),
        refresh_before_fanout: false,
        ..IndexSettings::default()
    };
    let dispatcher = Dispatcher::new(
        index.clone(),
        &settings,
        fast_retry(3),
        Arc::new(WorkerMetrics::default()),
    );
    let log = MemoryLog::new();
    log.publish(0, &transaction(1, 3, "Food", 10.0, "create"));
    log.publish(0, &category(3, json!({"category_name": "Groceries"})));

    assert_eq!(drain(&dispatcher, &mut log.consumer(0)).await.unwrap(), 2);
    assert_eq!(index.write_requests(), 2);
    assert_eq!(index.refresh_requests(), 0);
    let doc = index.get_document(COLLECTION, 1).await.unwrap().unwrap();
    assert_eq!(doc.category_name, "Groceries");
}
