//! In-process index with the same write semantics as the HTTP one.
//!
//! Used by tests and local runs. Write and refresh requests are counted, and
//! write failures can be queued to exercise retry paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::error::{IndexerError, Result};
use crate::index::{FieldMatch, FieldPatch, SearchIndex};
use crate::models::{IndexedTransaction, TransactionId};

type Collection = BTreeMap<TransactionId, Value>;

#[derive(Debug, Default)]
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, Collection>>,
    write_requests: AtomicU64,
    refresh_requests: AtomicU64,
    queued_failures: Mutex<VecDeque<IndexerError>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of write requests received, failed ones included.
    pub fn write_requests(&self) -> u64 {
        self.write_requests.load(Ordering::SeqCst)
    }

    pub fn refresh_requests(&self) -> u64 {
        self.refresh_requests.load(Ordering::SeqCst)
    }

    /// The next write request fails with `error` instead of being applied.
    pub async fn fail_next(&self, error: IndexerError) {
        self.queued_failures.lock().await.push_back(error);
    }

    pub async fn documents(&self, collection: &str) -> Vec<IndexedTransaction> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn len(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(collection).map_or(0, |docs| docs.len())
    }

    async fn begin_write(&self) -> Result<()> {
        self.write_requests.fetch_add(1, Ordering::SeqCst);
        match self.queued_failures.lock().await.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn to_document(operation: &'static str, document: &IndexedTransaction) -> Result<Value> {
    serde_json::to_value(document)
        .map_err(|e| IndexerError::permanent(operation, format!("unencodable document: {}", e)))
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn put_document(
        &self,
        collection: &str,
        id: TransactionId,
        document: &IndexedTransaction,
    ) -> Result<()> {
        self.begin_write().await?;
        let value = to_document("put_document", document)?;
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id, value);
        Ok(())
    }

    async fn patch_document(
        &self,
        collection: &str,
        id: TransactionId,
        patch: &FieldPatch,
        upsert: &IndexedTransaction,
    ) -> Result<()> {
        self.begin_write().await?;
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        match docs.get_mut(&id).and_then(Value::as_object_mut) {
            Some(existing) => patch.apply_to(existing),
            None => {
                docs.insert(id, to_document("patch_document", upsert)?);
            }
        }
        Ok(())
    }

    async fn update_by_query(
        &self,
        collection: &str,
        query: &FieldMatch,
        patch: &FieldPatch,
    ) -> Result<u64> {
        self.begin_write().await?;
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut updated = 0;
        for doc in docs.values_mut().filter_map(Value::as_object_mut) {
            if query.matches(doc) {
                patch.apply_to(doc);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn refresh(&self, _collection: &str) -> Result<()> {
        self.refresh_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_document(
        &self,
        collection: &str,
        id: TransactionId,
    ) -> Result<Option<IndexedTransaction>> {
        let collections = self.collections.read().await;
        let Some(value) = collections.get(collection).and_then(|docs| docs.get(&id)) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| IndexerError::permanent("get_document", format!("unexpected document: {}", e)))
    }
}
