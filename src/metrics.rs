//! Process-wide counters for every outcome and error class, plus the state of
//! each partition loop. Exposed through the status server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Connecting,
    Consuming,
    Restarting,
    Stopped,
    Failed,
}

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    received: AtomicU64,
    committed: AtomicU64,
    decode_errors: AtomicU64,
    routing_errors: AtomicU64,
    dead_lettered: AtomicU64,
    index_retries: AtomicU64,
    index_failures: AtomicU64,
    consume_errors: AtomicU64,
    leases_lost: AtomicU64,
    documents_upserted: AtomicU64,
    documents_reverted: AtomicU64,
    category_fanouts: AtomicU64,
    category_documents_updated: AtomicU64,
    category_noops: AtomicU64,
    partitions: RwLock<BTreeMap<u32, PartitionState>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub committed: u64,
    pub decode_errors: u64,
    pub routing_errors: u64,
    pub dead_lettered: u64,
    pub index_retries: u64,
    pub index_failures: u64,
    pub consume_errors: u64,
    pub leases_lost: u64,
    pub documents_upserted: u64,
    pub documents_reverted: u64,
    pub category_fanouts: u64,
    pub category_documents_updated: u64,
    pub category_noops: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub partitions: BTreeMap<u32, PartitionState>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl WorkerMetrics {
    pub fn record_received(&self) {
        bump(&self.received);
    }

    pub fn record_committed(&self) {
        bump(&self.committed);
    }

    pub fn record_decode_error(&self) {
        bump(&self.decode_errors);
    }

    pub fn record_routing_error(&self) {
        bump(&self.routing_errors);
    }

    pub fn record_dead_lettered(&self) {
        bump(&self.dead_lettered);
    }

    pub fn record_index_retry(&self) {
        bump(&self.index_retries);
    }

    pub fn record_index_failure(&self) {
        bump(&self.index_failures);
    }

    pub fn record_consume_error(&self) {
        bump(&self.consume_errors);
    }

    pub fn record_lease_lost(&self) {
        bump(&self.leases_lost);
    }

    pub fn record_upserted(&self) {
        bump(&self.documents_upserted);
    }

    pub fn record_reverted(&self) {
        bump(&self.documents_reverted);
    }

    pub fn record_category_fanout(&self, documents: u64) {
        bump(&self.category_fanouts);
        self.category_documents_updated
            .fetch_add(documents, Ordering::Relaxed);
    }

    pub fn record_category_noop(&self) {
        bump(&self.category_noops);
    }

    pub async fn set_partition_state(&self, partition: u32, state: PartitionState) {
        self.partitions.write().await.insert(partition, state);
    }

    pub async fn partition_state(&self, partition: u32) -> Option<PartitionState> {
        self.partitions.read().await.get(&partition).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            received: load(&self.received),
            committed: load(&self.committed),
            decode_errors: load(&self.decode_errors),
            routing_errors: load(&self.routing_errors),
            dead_lettered: load(&self.dead_lettered),
            index_retries: load(&self.index_retries),
            index_failures: load(&self.index_failures),
            consume_errors: load(&self.consume_errors),
            leases_lost: load(&self.leases_lost),
            documents_upserted: load(&self.documents_upserted),
            documents_reverted: load(&self.documents_reverted),
            category_fanouts: load(&self.category_fanouts),
            category_documents_updated: load(&self.category_documents_updated),
            category_noops: load(&self.category_noops),
        }
    }

    pub async fn report(&self) -> StatusReport {
        StatusReport {
            counters: self.snapshot(),
            partitions: self.partitions.read().await.clone(),
        }
    }
}
