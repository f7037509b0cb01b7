//! The per-partition processing loop: decode, route, apply, then commit.
//!
//! A message is committed only after its effect is confirmed by the index, or
//! after it has been judged undecodable. Index failures return before the
//! commit, so the message is delivered again when the partition resumes.
//!
//! The consumer keeps its partition claimed for as long as a message is being
//! applied. If the claim lapses, the write in progress and any retry still to
//! come are dropped and the message stays uncommitted for the next owner.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::Instrument;

use crate::config::IndexSettings;
use crate::error::{IndexerError, Result};
use crate::index::SearchIndex;
use crate::indexer::TransactionIndexer;
use crate::metrics::WorkerMetrics;
use crate::models::DomainEvent;
use crate::propagator::CategoryPropagator;
use crate::retry::RetryPolicy;
use crate::topic::{Delivery, LogConsumer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Undecodable or unroutable; committed without touching the index.
    Skipped,
}

#[derive(Clone)]
pub struct Dispatcher {
    transactions: TransactionIndexer,
    categories: CategoryPropagator,
    metrics: Arc<WorkerMetrics>,
}

impl Dispatcher {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        settings: &IndexSettings,
        retry: RetryPolicy,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            transactions: TransactionIndexer::new(
                index.clone(),
                settings.collection.clone(),
                settings.delete_mode,
                retry.clone(),
                metrics.clone(),
            ),
            categories: CategoryPropagator::new(
                index,
                settings.collection.clone(),
                retry,
                metrics.clone(),
            )
            .refresh_first(settings.refresh_before_fanout),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    pub async fn route(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::Transaction(ev) => self.transactions.apply(ev).await,
            DomainEvent::Category(ev) => self.categories.apply_category_change(ev).await.map(|_| ()),
        }
    }

    /// Processes one delivery and commits it. Any error returned means the
    /// delivery was not committed.
    ///
    /// Losing the partition mid-message drops the routing future, so no
    /// further write attempt starts.
    pub async fn handle<C>(&self, consumer: &mut C, delivery: &Delivery) -> Result<Outcome>
    where
        C: LogConsumer + ?Sized,
    {
        self.metrics.record_received();
        let outcome = match DomainEvent::decode(&delivery.payload) {
            Ok(event) => {
                tokio::select! {
                    routed = self.route(&event) => routed?,
                    lost = consumer.hold_partition() => {
                        self.metrics.record_lease_lost();
                        tracing::warn!(error = %lost, "Abandoning message, partition no longer owned");
                        return Err(lost);
                    }
                }
                Outcome::Applied
            }
            Err(e) if e.is_message_local() => {
                self.skip(consumer, delivery, &e).await?;
                Outcome::Skipped
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = consumer.commit(delivery).await {
            if matches!(e, IndexerError::LeaseLost(_)) {
                self.metrics.record_lease_lost();
            }
            return Err(e);
        }
        self.metrics.record_committed();
        Ok(outcome)
    }

    async fn skip<C>(&self, consumer: &mut C, delivery: &Delivery, error: &IndexerError) -> Result<()>
    where
        C: LogConsumer + ?Sized,
    {
        match error {
            IndexerError::Routing(_) => self.metrics.record_routing_error(),
            _ => self.metrics.record_decode_error(),
        }
        tracing::warn!(
            error = %error,
            key = delivery.key.as_deref().unwrap_or(""),
            "Skipping message"
        );
        if consumer.dead_letter(delivery, error).await? {
            self.metrics.record_dead_lettered();
        }
        Ok(())
    }

    /// Polls and handles messages until shutdown is signalled or a
    /// non-message-local error occurs.
    pub async fn run<C>(&self, consumer: &mut C, shutdown: &mut watch::Receiver<bool>) -> Result<()>
    where
        C: LogConsumer + ?Sized,
    {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let polled = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                polled = consumer.poll() => polled,
            };
            let delivery = match polled {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => return Err(self.consume_failed(e)),
            };

            let span = tracing::info_span!(
                "message",
                partition = delivery.partition,
                offset = %delivery.offset
            );
            if let Err(e) = self.handle(consumer, &delivery).instrument(span).await {
                return Err(match e {
                    IndexerError::Consume(_) => self.consume_failed(e),
                    other => other,
                });
            }
        }
    }

    fn consume_failed(&self, error: IndexerError) -> IndexerError {
        self.metrics.record_consume_error();
        tracing::error!(error = %error, "Log consume failed");
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::models::{ChangeEnvelope, EntityType};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedConsumer {
        queue: VecDeque<Delivery>,
        committed: Vec<String>,
        dead_lettered: Vec<String>,
        dead_letter_enabled: bool,
        /// The partition is taken away this long into handling a message.
        lease_lost_after: Option<Duration>,
        reject_commits: bool,
    }

    #[async_trait]
    impl LogConsumer for ScriptedConsumer {
        async fn poll(&mut self) -> Result<Option<Delivery>> {
            Ok(self.queue.pop_front())
        }

        async fn hold_partition(&mut self) -> IndexerError {
            match self.lease_lost_after {
                Some(after) => {
                    tokio::time::sleep(after).await;
                    IndexerError::LeaseLost("changes:0".into())
                }
                None => std::future::pending().await,
            }
        }

        async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
            if self.reject_commits {
                return Err(IndexerError::LeaseLost("changes:0".into()));
            }
            self.committed.push(delivery.offset.clone());
            Ok(())
        }

        async fn dead_letter(&mut self, delivery: &Delivery, _error: &IndexerError) -> Result<bool> {
            if self.dead_letter_enabled {
                self.dead_lettered.push(delivery.offset.clone());
            }
            Ok(self.dead_letter_enabled)
        }
    }

    fn delivery(offset: &str, payload: Vec<u8>) -> Delivery {
        Delivery {
            partition: 0,
            offset: offset.to_string(),
            key: None,
            payload,
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<MemoryIndex>, Arc<WorkerMetrics>) {
        let index = Arc::new(MemoryIndex::new());
        let metrics = Arc::new(WorkerMetrics::default());
        let dispatcher = Dispatcher::new(
            index.clone(),
            &IndexSettings::default(),
            RetryPolicy::default(),
            metrics.clone(),
        );
        (dispatcher, index, metrics)
    }

    #[tokio::test]
    async fn bad_message_is_dead_lettered_and_committed() {
        let (dispatcher, index, metrics) = dispatcher();
        let mut consumer = ScriptedConsumer {
            dead_letter_enabled: true,
            ..Default::default()
        };

        let outcome = dispatcher
            .handle(&mut consumer, &delivery("1-0", b"{oops".to_vec()))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(consumer.dead_lettered, vec!["1-0"]);
        assert_eq!(consumer.committed, vec!["1-0"]);
        assert_eq!(index.write_requests(), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.committed, 1);
    }

    #[tokio::test]
    async fn index_failure_leaves_message_uncommitted() {
        let (dispatcher, index, _) = dispatcher();
        index
            .fail_next(IndexerError::permanent("put_document", "mapper_parsing_exception"))
            .await;
        let envelope = ChangeEnvelope::new(
            EntityType::Transactions,
            json!({"id": 1, "sum": 10.0, "action": "create"}),
        );
        let mut consumer = ScriptedConsumer::default();

        let err = dispatcher
            .handle(&mut consumer, &delivery("1-0", envelope.to_bytes().unwrap()))
            .await
            .unwrap_err();
        assert!(!err.is_message_local());
        assert!(consumer.committed.is_empty());
    }

    fn create(id: i64) -> Vec<u8> {
        ChangeEnvelope::new(
            EntityType::Transactions,
            json!({"id": id, "sum": 10.0, "action": "create"}),
        )
        .to_bytes()
        .unwrap()
    }

    #[tokio::test]
    async fn lost_partition_stops_writes_and_commit() {
        let index = Arc::new(MemoryIndex::new());
        let metrics = Arc::new(WorkerMetrics::default());
        let retry = RetryPolicy {
            max_attempts: 3,
            schedule: vec![Duration::from_millis(200)],
        };
        let dispatcher =
            Dispatcher::new(index.clone(), &IndexSettings::default(), retry, metrics.clone());
        index
            .fail_next(IndexerError::retriable("put_document", "timeout"))
            .await;
        let mut consumer = ScriptedConsumer {
            lease_lost_after: Some(Duration::from_millis(20)),
            ..Default::default()
        };

        let err = dispatcher
            .handle(&mut consumer, &delivery("1-0", create(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::LeaseLost(_)));
        assert!(consumer.committed.is_empty());
        assert_eq!(metrics.snapshot().leases_lost, 1);

        // the retry that was waiting on its backoff never runs
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(index.write_requests(), 1);
        assert!(index.get_document("transactions", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_commit_is_reported_as_lost_partition() {
        let (dispatcher, index, metrics) = dispatcher();
        let mut consumer = ScriptedConsumer {
            reject_commits: true,
            ..Default::default()
        };

        let err = dispatcher
            .handle(&mut consumer, &delivery("1-0", create(1)))
            .await
            .unwrap_err();
        assert!(err.is_restartable());
        assert_eq!(index.write_requests(), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.leases_lost, 1);
        assert_eq!(snapshot.committed, 0);
    }

    #[tokio::test]
    async fn run_returns_when_shutdown_is_signalled() {
        let (dispatcher, _, _) = dispatcher();
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let mut consumer = ScriptedConsumer::default();
        consumer.queue.push_back(delivery("1-0", b"{}".to_vec()));

        dispatcher.run(&mut consumer, &mut rx).await.unwrap();
        assert!(consumer.committed.is_empty());
    }
}
