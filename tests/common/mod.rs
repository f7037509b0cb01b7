//! Shared helpers for integration tests: an in-process change log, event
//! builders and a wired-up dispatcher over `MemoryIndex`.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use txn_search_indexer::config::IndexSettings;
use txn_search_indexer::index::MemoryIndex;
use txn_search_indexer::models::{ChangeEnvelope, EntityType};
use txn_search_indexer::retry::RetryPolicy;
use txn_search_indexer::topic::{Delivery, LogConsumer};
use txn_search_indexer::{DeleteMode, Dispatcher, IndexerError, Result, WorkerMetrics};

pub const COLLECTION: &str = "transactions";

#[derive(Default)]
struct LogState {
    partitions: BTreeMap<u32, Vec<Delivery>>,
    /// Index of the first uncommitted entry per partition.
    committed: BTreeMap<u32, usize>,
    commit_log: Vec<String>,
    dead_letters: Vec<(String, String)>,
    dead_letter_enabled: bool,
    failing_polls: usize,
    lease_losses: usize,
    lease_lost_after: Duration,
    next_offset: u64,
}

/// A partitioned log held in memory. Consumers resume from the first
/// uncommitted entry, so anything not committed is delivered again.
#[derive(Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dead_letters() -> Self {
        let log = Self::default();
        log.state.lock().unwrap().dead_letter_enabled = true;
        log
    }

    pub fn publish_raw(&self, partition: u32, payload: &[u8]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_offset += 1;
        let offset = format!("{}-0", state.next_offset);
        state.partitions.entry(partition).or_default().push(Delivery {
            partition,
            offset: offset.clone(),
            key: None,
            payload: payload.to_vec(),
        });
        offset
    }

    pub fn publish(&self, partition: u32, envelope: &ChangeEnvelope) -> String {
        self.publish_raw(partition, &envelope.to_bytes().unwrap())
    }

    /// The next `n` polls fail with a consume error.
    pub fn fail_polls(&self, n: usize) {
        self.state.lock().unwrap().failing_polls = n;
    }

    /// The next `n` messages being handled lose their partition `after` into
    /// handling.
    pub fn lose_leases(&self, n: usize, after: Duration) {
        let mut state = self.state.lock().unwrap();
        state.lease_losses = n;
        state.lease_lost_after = after;
    }

    pub fn consumer(&self, partition: u32) -> MemoryConsumer {
        MemoryConsumer {
            log: self.clone(),
            partition,
        }
    }

    /// Offsets in the order they were committed.
    pub fn commits(&self) -> Vec<String> {
        self.state.lock().unwrap().commit_log.clone()
    }

    pub fn pending(&self, partition: u32) -> usize {
        let state = self.state.lock().unwrap();
        let total = state.partitions.get(&partition).map_or(0, Vec::len);
        total - state.committed.get(&partition).copied().unwrap_or(0)
    }

    /// (offset, error) pairs written to the dead-letter stream.
    pub fn dead_letters(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().dead_letters.clone()
    }
}

pub struct MemoryConsumer {
    log: MemoryLog,
    partition: u32,
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn poll(&mut self) -> Result<Option<Delivery>> {
        let next = {
            let mut state = self.log.state.lock().unwrap();
            if state.failing_polls > 0 {
                state.failing_polls -= 1;
                return Err(IndexerError::Consume("connection reset by peer".into()));
            }
            let cursor = state.committed.get(&self.partition).copied().unwrap_or(0);
            state
                .partitions
                .get(&self.partition)
                .and_then(|entries| entries.get(cursor))
                .cloned()
        };
        if next.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(next)
    }

    async fn hold_partition(&mut self) -> IndexerError {
        let lost_after = {
            let mut state = self.log.state.lock().unwrap();
            if state.lease_losses > 0 {
                state.lease_losses -= 1;
                Some(state.lease_lost_after)
            } else {
                None
            }
        };
        match lost_after {
            Some(after) => {
                tokio::time::sleep(after).await;
                IndexerError::LeaseLost(format!("partition {}", self.partition))
            }
            None => std::future::pending().await,
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        let mut state = self.log.state.lock().unwrap();
        let cursor = state.committed.get(&self.partition).copied().unwrap_or(0);
        let expected = state
            .partitions
            .get(&self.partition)
            .and_then(|entries| entries.get(cursor))
            .map(|d| d.offset.clone());
        if expected.as_deref() != Some(delivery.offset.as_str()) {
            return Err(IndexerError::Consume(format!(
                "commit of {} out of order",
                delivery.offset
            )));
        }
        state.committed.insert(self.partition, cursor + 1);
        state.commit_log.push(delivery.offset.clone());
        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery, error: &IndexerError) -> Result<bool> {
        let mut state = self.log.state.lock().unwrap();
        if !state.dead_letter_enabled {
            return Ok(false);
        }
        state
            .dead_letters
            .push((delivery.offset.clone(), error.to_string()));
        Ok(true)
    }
}

/// Handles messages until the partition is drained or a message fails.
pub async fn drain(dispatcher: &Dispatcher, consumer: &mut MemoryConsumer) -> Result<usize> {
    let mut handled = 0;
    while let Some(delivery) = consumer.poll().await? {
        dispatcher.handle(consumer, &delivery).await?;
        handled += 1;
    }
    Ok(handled)
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        schedule: vec![Duration::from_millis(1), Duration::from_millis(2)],
    }
}

pub fn dispatcher(mode: DeleteMode) -> (Dispatcher, Arc<MemoryIndex>, Arc<WorkerMetrics>) {
    dispatcher_with_retry(mode, fast_retry(3))
}

pub fn dispatcher_with_retry(
    mode: DeleteMode,
    retry: RetryPolicy,
) -> (Dispatcher, Arc<MemoryIndex>, Arc<WorkerMetrics>) {
    let index = Arc::new(MemoryIndex::new());
    let metrics = Arc::new(WorkerMetrics::default());
    let settings = IndexSettings {
        collection: COLLECTION.to_string(),
        delete_mode: mode,
        ..IndexSettings::default()
    };
    let dispatcher = Dispatcher::new(index.clone(), &settings, retry, metrics.clone());
    (dispatcher, index, metrics)
}

pub fn transaction(id: i64, category_id: i64, category_name: &str, sum: f64, action: &str) -> ChangeEnvelope {
    ChangeEnvelope::new(
        EntityType::Transactions,
        json!({
            "id": id,
            "account_id": 7,
            "category_id": category_id,
            "category_name": category_name,
            "type": "expense",
            "description": "groceries",
            "name": format!("Transaction {}", id),
            "sum": sum,
            "currency_id": 1,
            "account_type": "card",
            "date": "2024-03-01",
            "action": action,
        }),
    )
}

pub fn category(category_id: i64, fields: Value) -> ChangeEnvelope {
    let mut payload = json!({ "category_id": category_id, "action": "update" });
    if let (Some(target), Some(extra)) = (payload.as_object_mut(), fields.as_object()) {
        for (k, v) in extra {
            target.insert(k.clone(), v.clone());
        }
    }
    ChangeEnvelope::new(EntityType::Categories, payload)
}

/// Waits up to two seconds for `check` to hold.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
