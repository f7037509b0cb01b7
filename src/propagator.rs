//! Denormalizes category edits into every transaction document that
//! references the category, with one update-by-query per edit regardless of
//! how many documents match. Unless disabled, the collection is refreshed
//! first so documents written moments earlier are matched too; an edit then
//! costs two requests.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::index::{FieldMatch, FieldPatch, SearchIndex};
use crate::metrics::WorkerMetrics;
use crate::models::document::{
    CATEGORY_ID_FIELD, CATEGORY_LOGO_FIELD, CATEGORY_LOGO_HASH_ID_FIELD, CATEGORY_NAME_FIELD,
};
use crate::models::CategoryEvent;
use crate::retry::{with_backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// The event carried no non-empty field; nothing was sent.
    Skipped,
    Applied { updated: u64 },
}

/// Partial update built from the non-empty denormalized fields of the event.
pub fn category_patch(event: &CategoryEvent) -> FieldPatch {
    let mut patch = FieldPatch::new();
    for (field, value) in [
        (CATEGORY_NAME_FIELD, &event.category_name),
        (CATEGORY_LOGO_HASH_ID_FIELD, &event.category_logo_hash_id),
        (CATEGORY_LOGO_FIELD, &event.category_logo),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            patch.set(field, Value::String(value.to_string()));
        }
    }
    patch
}

#[derive(Clone)]
pub struct CategoryPropagator {
    index: Arc<dyn SearchIndex>,
    collection: String,
    retry: RetryPolicy,
    metrics: Arc<WorkerMetrics>,
    refresh_first: bool,
}

impl CategoryPropagator {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        collection: impl Into<String>,
        retry: RetryPolicy,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            index,
            collection: collection.into(),
            retry,
            metrics,
            refresh_first: true,
        }
    }

    pub fn refresh_first(mut self, enabled: bool) -> Self {
        self.refresh_first = enabled;
        self
    }

    pub async fn apply_category_change(&self, event: &CategoryEvent) -> Result<FanOut> {
        let patch = category_patch(event);
        if patch.is_empty() {
            self.metrics.record_category_noop();
            tracing::debug!(
                category_id = event.category_id,
                "Category event carries no changes, skipping"
            );
            return Ok(FanOut::Skipped);
        }

        // update-by-query only sees documents visible to search
        if self.refresh_first {
            with_backoff(&self.retry, &self.metrics, "refresh", || {
                self.index.refresh(&self.collection)
            })
            .await?;
        }

        let query = FieldMatch::new(CATEGORY_ID_FIELD, event.category_id);
        let updated = with_backoff(&self.retry, &self.metrics, "update_by_query", || {
            self.index.update_by_query(&self.collection, &query, &patch)
        })
        .await?;

        self.metrics.record_category_fanout(updated);
        let fields: Vec<&str> = patch.fields().collect();
        tracing::info!(
            category_id = event.category_id,
            fields = ?fields,
            updated,
            "Propagated category change"
        );
        Ok(FanOut::Applied { updated })
    }
}
