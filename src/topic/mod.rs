//! The partitioned change log.
//!
//! A topic `T` with `P` partitions is `P` Redis streams `T:0 .. T:P-1`. Every
//! event for one entity is published to the partition picked from its key, so
//! one partition loop sees that entity's events in order.

pub mod lease;
pub mod redis_stream;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{IndexerError, Result};

pub use redis_stream::{RedisStreamConsumer, RedisStreamProducer};

/// One message pulled from a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub partition: u32,
    /// Position within the partition; what `commit` acknowledges.
    pub offset: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// A consumer bound to one partition.
///
/// `poll` never hands out a new message while the previous one is neither
/// committed nor abandoned by dropping the consumer; uncommitted messages are
/// delivered again to the next consumer of the partition.
#[async_trait]
pub trait LogConsumer: Send {
    /// Waits a bounded time for the next message. `Ok(None)` when none arrived.
    async fn poll(&mut self) -> Result<Option<Delivery>>;

    /// Advances the partition past `delivery`.
    async fn commit(&mut self, delivery: &Delivery) -> Result<()>;

    /// Keeps the partition claimed while a message is being handled. The future
    /// resolves only once ownership can no longer be vouched for, with the
    /// error to abandon the message with; it is dropped when handling ends.
    async fn hold_partition(&mut self) -> IndexerError {
        std::future::pending().await
    }

    /// Copies a message that is about to be skipped to the dead-letter topic.
    /// Returns false when no dead-letter topic is configured.
    async fn dead_letter(&mut self, _delivery: &Delivery, _error: &IndexerError) -> Result<bool> {
        Ok(false)
    }

    /// Gives up the partition so another worker can take it over.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn stream_key(topic: &str, partition: u32) -> String {
    format!("{}:{}", topic, partition)
}

/// Stable partition for an entity key: the first 8 bytes of its SHA-256, modulo
/// the partition count.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}
