//! Search index abstraction.
//!
//! The worker needs four things from the index: keyed full-document upsert,
//! a keyed merge patch, one server-side partial update over every document
//! matching a field, and an explicit refresh. `ElasticIndex` talks to an
//! Elasticsearch-compatible HTTP API; `MemoryIndex` keeps documents in process.

pub mod elastic;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{IndexedTransaction, TransactionId};

pub use elastic::ElasticIndex;
pub use memory::MemoryIndex;

/// Field assignments applied on top of existing documents. Fields not named
/// here are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FieldPatch(BTreeMap<String, Value>);

impl FieldPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    pub fn with(mut self, field: &str, value: Value) -> Self {
        self.set(field, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overwrites the patched fields on a JSON document.
    pub fn apply_to(&self, document: &mut Map<String, Value>) {
        for (field, value) in &self.0 {
            document.insert(field.clone(), value.clone());
        }
    }
}

/// Exact match on a single document field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMatch {
    pub field: String,
    pub value: Value,
}

impl FieldMatch {
    pub fn new(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn matches(&self, document: &Map<String, Value>) -> bool {
        document.get(&self.field) == Some(&self.value)
    }
}

/// Operations the worker issues against the index. Every write returns only
/// after the index acknowledged it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Creates the collection with its mapping when it does not exist yet.
    async fn ensure_collection(&self, collection: &str) -> Result<()>;

    /// Creates or fully replaces the document stored under `id`.
    async fn put_document(
        &self,
        collection: &str,
        id: TransactionId,
        document: &IndexedTransaction,
    ) -> Result<()>;

    /// Applies `patch` to the document under `id`, or stores `upsert` when the
    /// document does not exist.
    async fn patch_document(
        &self,
        collection: &str,
        id: TransactionId,
        patch: &FieldPatch,
        upsert: &IndexedTransaction,
    ) -> Result<()>;

    /// Applies `patch` to every document matching `query` in one request.
    /// Returns the number of documents updated.
    async fn update_by_query(
        &self,
        collection: &str,
        query: &FieldMatch,
        patch: &FieldPatch,
    ) -> Result<u64>;

    /// Makes every acknowledged write visible to subsequent reads.
    async fn refresh(&self, collection: &str) -> Result<()>;

    async fn get_document(
        &self,
        collection: &str,
        id: TransactionId,
    ) -> Result<Option<IndexedTransaction>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_overwrites_only_named_fields() {
        let patch = FieldPatch::new()
            .with("category_name", json!("Groceries"))
            .with("category_logo", json!("cart.png"));
        let mut doc = json!({
            "id": 1,
            "category_name": "Food",
            "category_logo": "fork.png",
            "sum": 12.5
        });
        patch.apply_to(doc.as_object_mut().unwrap());
        assert_eq!(
            doc,
            json!({
                "id": 1,
                "category_name": "Groceries",
                "category_logo": "cart.png",
                "sum": 12.5
            })
        );
        assert_eq!(patch.len(), 2);
        assert_eq!(
            patch.fields().collect::<Vec<_>>(),
            vec!["category_logo", "category_name"]
        );
    }

    #[test]
    fn field_match_compares_json_values() {
        let query = FieldMatch::new("category_id", 3);
        let hit = json!({"category_id": 3});
        let miss = json!({"category_id": 4});
        let absent = json!({"id": 3});
        assert!(query.matches(hit.as_object().unwrap()));
        assert!(!query.matches(miss.as_object().unwrap()));
        assert!(!query.matches(absent.as_object().unwrap()));
    }
}
