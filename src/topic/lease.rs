//! Exclusive partition ownership across worker instances.
//!
//! A lease is a Redis key holding the owner id with a TTL. It is taken with
//! `SET NX PX`, renewed and released only by its owner. Acknowledgements go
//! through the lease too, so a worker that lost its partition cannot ack.

use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::Result;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const ACK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) ~= ARGV[1] then
    return -1
end
return redis.call("XACK", KEYS[2], ARGV[2], ARGV[3])
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Newly taken; the previous owner may have left unacknowledged messages.
    Acquired,
    Held,
    Unavailable,
}

pub struct PartitionLease {
    key: String,
    owner: String,
    ttl: Duration,
    renew_at: Option<Instant>,
}

pub fn lease_key(topic: &str, group: &str, partition: u32) -> String {
    format!("{}:{}:lease:{}", topic, group, partition)
}

impl PartitionLease {
    pub fn new(key: String, owner: String, ttl: Duration) -> Self {
        Self {
            key,
            owner,
            ttl,
            renew_at: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.renew_at.is_some()
    }

    /// When the held lease is next due for renewal.
    pub fn renew_at(&self) -> Option<Instant> {
        self.renew_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Renewal happens once a third of the TTL has passed.
    fn renewal_due(&self, now: Instant) -> bool {
        match self.renew_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Takes the lease, renews it when due, or reports it unavailable.
    pub async fn hold(&mut self, conn: &mut ConnectionManager) -> Result<LeaseStatus> {
        let now = Instant::now();
        if !self.renewal_due(now) {
            return Ok(LeaseStatus::Held);
        }
        let ttl_ms = self.ttl.as_millis() as u64;

        let status = if self.is_held() {
            let renewed: i64 = Script::new(RENEW_SCRIPT)
                .key(&self.key)
                .arg(&self.owner)
                .arg(ttl_ms)
                .invoke_async(conn)
                .await?;
            if renewed == 1 {
                LeaseStatus::Held
            } else {
                tracing::warn!(lease = %self.key, "Partition lease lost");
                LeaseStatus::Unavailable
            }
        } else {
            let taken: Option<String> = redis::cmd("SET")
                .arg(&self.key)
                .arg(&self.owner)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(conn)
                .await?;
            if taken.is_some() {
                tracing::info!(lease = %self.key, owner = %self.owner, "Partition lease acquired");
                LeaseStatus::Acquired
            } else {
                LeaseStatus::Unavailable
            }
        };

        self.renew_at = match status {
            LeaseStatus::Unavailable => None,
            _ => Some(now + self.ttl / 3),
        };
        Ok(status)
    }

    /// Acknowledges `id` in one round trip with the ownership check, so the
    /// ack cannot land after the lease has passed to another owner. Returns
    /// false, and forgets the lease, when this owner no longer holds it.
    pub async fn acknowledge(
        &mut self,
        conn: &mut ConnectionManager,
        stream: &str,
        group: &str,
        id: &str,
    ) -> Result<bool> {
        let acked: i64 = Script::new(ACK_SCRIPT)
            .key(&self.key)
            .key(stream)
            .arg(&self.owner)
            .arg(group)
            .arg(id)
            .invoke_async(conn)
            .await?;
        if acked < 0 {
            tracing::warn!(lease = %self.key, id, "Partition lease lost before acknowledgement");
            self.renew_at = None;
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn release(&mut self, conn: &mut ConnectionManager) -> Result<()> {
        if !self.is_held() {
            return Ok(());
        }
        self.renew_at = None;
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.owner)
            .invoke_async(conn)
            .await?;
        tracing::info!(lease = %self.key, "Partition lease released");
        Ok(())
    }
}
