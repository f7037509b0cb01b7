//! Applies transaction change events to the index.
//!
//! The transaction id is the document id, so create/update is a plain
//! overwrite and redelivery converges to the same document. Delete is a
//! status transition to `reverted`, never a removal.

use std::sync::Arc;

use serde_json::json;

use crate::error::Result;
use crate::index::{FieldPatch, SearchIndex};
use crate::metrics::WorkerMetrics;
use crate::models::document::STATUS_FIELD;
use crate::models::{DocumentStatus, IndexedTransaction, TransactionAction, TransactionEvent};
use crate::retry::{with_backoff, RetryPolicy};

/// How a delete event reaches the index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeleteMode {
    /// Overwrite the whole document with the delete payload and `status=reverted`.
    /// Fields the delete payload omits are written empty.
    #[default]
    Overwrite,
    /// Patch only `status` on the existing document; the payload is stored in
    /// full only when no document exists yet.
    MergeStatus,
}

impl DeleteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteMode::Overwrite => "overwrite",
            DeleteMode::MergeStatus => "merge-status",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "overwrite" => Some(DeleteMode::Overwrite),
            "merge-status" | "merge_status" => Some(DeleteMode::MergeStatus),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct TransactionIndexer {
    index: Arc<dyn SearchIndex>,
    collection: String,
    delete_mode: DeleteMode,
    retry: RetryPolicy,
    metrics: Arc<WorkerMetrics>,
}

impl TransactionIndexer {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        collection: impl Into<String>,
        delete_mode: DeleteMode,
        retry: RetryPolicy,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            index,
            collection: collection.into(),
            delete_mode,
            retry,
            metrics,
        }
    }

    pub async fn apply(&self, event: &TransactionEvent) -> Result<()> {
        match event.action {
            TransactionAction::Create | TransactionAction::Update => self.upsert(event).await,
            TransactionAction::Delete => self.revert(event).await,
        }
    }

    /// Writes the event as a `finished` document, replacing any previous one.
    pub async fn upsert(&self, event: &TransactionEvent) -> Result<()> {
        let document = IndexedTransaction::from_event(event, DocumentStatus::Finished);
        with_backoff(&self.retry, &self.metrics, "put_document", || {
            self.index.put_document(&self.collection, event.id, &document)
        })
        .await?;

        self.metrics.record_upserted();
        tracing::debug!(
            id = event.id,
            action = event.action.as_str(),
            "Indexed transaction"
        );
        Ok(())
    }

    /// Marks the transaction `reverted` according to the configured delete mode.
    pub async fn revert(&self, event: &TransactionEvent) -> Result<()> {
        let document = IndexedTransaction::from_event(event, DocumentStatus::Reverted);
        match self.delete_mode {
            DeleteMode::Overwrite => {
                with_backoff(&self.retry, &self.metrics, "put_document", || {
                    self.index.put_document(&self.collection, event.id, &document)
                })
                .await?;
            }
            DeleteMode::MergeStatus => {
                let patch =
                    FieldPatch::new().with(STATUS_FIELD, json!(DocumentStatus::Reverted.as_str()));
                with_backoff(&self.retry, &self.metrics, "patch_document", || {
                    self.index
                        .patch_document(&self.collection, event.id, &patch, &document)
                })
                .await?;
            }
        }

        self.metrics.record_reverted();
        tracing::debug!(
            id = event.id,
            mode = self.delete_mode.as_str(),
            "Reverted transaction"
        );
        Ok(())
    }
}
