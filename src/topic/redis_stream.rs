use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use crate::config::LogSettings;
use crate::error::{IndexerError, Result};
use crate::models::ChangeEnvelope;
use crate::topic::lease::{lease_key, LeaseStatus, PartitionLease};
use crate::topic::{partition_for, stream_key, Delivery, LogConsumer};

const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";

async fn open_connection(url: &str) -> redis::RedisResult<ConnectionManager> {
    let client = redis::Client::open(url)?;
    ConnectionManager::new(client).await
}

/// Connects to the first broker that accepts a connection.
pub async fn connect_any(brokers: &[String]) -> Result<ConnectionManager> {
    let mut last_error = None;
    for url in brokers {
        match open_connection(url).await {
            Ok(conn) => {
                tracing::debug!(broker = %url, "Connected to log broker");
                return Ok(conn);
            }
            Err(e) => {
                tracing::warn!(broker = %url, error = %e, "Log broker unreachable");
                last_error = Some(e);
            }
        }
    }
    Err(IndexerError::Consume(match last_error {
        Some(e) => format!("no log broker reachable: {}", e),
        None => "no log broker configured".to_string(),
    }))
}

/// Consumer-group reader for one partition stream.
///
/// The consumer name is fixed per partition, and only the lease holder reads,
/// so entries left unacknowledged by a crashed owner are the first thing the
/// next owner sees.
pub struct RedisStreamConsumer {
    conn: ConnectionManager,
    partition: u32,
    stream: String,
    group: String,
    consumer: String,
    poll: Duration,
    dead_letter_stream: Option<String>,
    lease: PartitionLease,
    read_pending: bool,
}

impl RedisStreamConsumer {
    pub async fn connect(settings: &LogSettings, partition: u32, owner: &str) -> Result<Self> {
        let mut conn = connect_any(&settings.brokers).await?;
        let stream = stream_key(&settings.topic, partition);

        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&stream, &settings.group, "0")
            .await;
        match created {
            Ok(()) => tracing::info!(stream = %stream, group = %settings.group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            conn,
            partition,
            consumer: format!("{}-p{}", settings.group, partition),
            lease: PartitionLease::new(
                lease_key(&settings.topic, &settings.group, partition),
                owner.to_string(),
                settings.lease_ttl,
            ),
            stream,
            group: settings.group.clone(),
            poll: settings.poll,
            dead_letter_stream: settings.dead_letter_topic.clone(),
            read_pending: true,
        })
    }
}

#[async_trait]
impl LogConsumer for RedisStreamConsumer {
    async fn poll(&mut self) -> Result<Option<Delivery>> {
        match self.lease.hold(&mut self.conn).await? {
            LeaseStatus::Unavailable => {
                tokio::time::sleep(self.poll).await;
                return Ok(None);
            }
            LeaseStatus::Acquired => self.read_pending = true,
            LeaseStatus::Held => {}
        }

        // "0" replays this consumer's pending entries; ">" asks for new ones
        let id = if self.read_pending { "0" } else { ">" };
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        if !self.read_pending {
            options = options.block(self.poll.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[id], &options)
            .await?;
        let entry = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next());

        match entry {
            Some(entry) => Ok(Some(Delivery {
                partition: self.partition,
                key: entry.get(KEY_FIELD),
                payload: entry.get(PAYLOAD_FIELD).unwrap_or_default(),
                offset: entry.id,
            })),
            None => {
                if self.read_pending {
                    tracing::debug!(stream = %self.stream, "Pending entries drained");
                    self.read_pending = false;
                }
                Ok(None)
            }
        }
    }

    /// Renews the lease on its schedule while a message is in flight. A renewal
    /// that is refused, fails, or takes longer than a third of the TTL means the
    /// lease may already have expired, so the message is abandoned.
    async fn hold_partition(&mut self) -> IndexerError {
        loop {
            let Some(renew_at) = self.lease.renew_at() else {
                return IndexerError::LeaseLost(self.stream.clone());
            };
            tokio::time::sleep_until(tokio::time::Instant::from_std(renew_at)).await;

            let budget = self.lease.ttl() / 3;
            match tokio::time::timeout(budget, self.lease.hold(&mut self.conn)).await {
                Ok(Ok(LeaseStatus::Held)) => {}
                Ok(Ok(_)) => return IndexerError::LeaseLost(self.stream.clone()),
                Ok(Err(e)) => {
                    return IndexerError::LeaseLost(format!("{}: renewal failed: {}", self.stream, e))
                }
                Err(_) => {
                    return IndexerError::LeaseLost(format!("{}: renewal timed out", self.stream))
                }
            }
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        let acked = self
            .lease
            .acknowledge(&mut self.conn, &self.stream, &self.group, &delivery.offset)
            .await?;
        if !acked {
            return Err(IndexerError::LeaseLost(self.stream.clone()));
        }
        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery, error: &IndexerError) -> Result<bool> {
        let Some(dead_letter_stream) = &self.dead_letter_stream else {
            return Ok(false);
        };
        let _: String = redis::cmd("XADD")
            .arg(dead_letter_stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(delivery.payload.as_slice())
            .arg("error")
            .arg(error.to_string())
            .arg("source_stream")
            .arg(&self.stream)
            .arg("source_id")
            .arg(&delivery.offset)
            .query_async(&mut self.conn)
            .await?;
        Ok(true)
    }

    async fn close(&mut self) -> Result<()> {
        self.lease.release(&mut self.conn).await
    }
}

/// Publishes envelopes to the partition owning their entity key.
pub struct RedisStreamProducer {
    conn: ConnectionManager,
    topic: String,
    partitions: u32,
}

impl RedisStreamProducer {
    pub async fn connect(settings: &LogSettings) -> Result<Self> {
        Ok(Self {
            conn: connect_any(&settings.brokers).await?,
            topic: settings.topic.clone(),
            partitions: settings.partitions,
        })
    }

    /// Returns the partition and the offset the entry was stored at.
    pub async fn publish(&mut self, key: &str, envelope: &ChangeEnvelope) -> Result<(u32, String)> {
        let partition = partition_for(key, self.partitions);
        let payload = envelope.to_bytes()?;
        let offset: String = redis::cmd("XADD")
            .arg(stream_key(&self.topic, partition))
            .arg("*")
            .arg(KEY_FIELD)
            .arg(key)
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut self.conn)
            .await?;
        Ok((partition, offset))
    }
}
