//! Keeps one partition loop alive.
//!
//! Retriable index failures that outlast the retry policy, and a lost partition
//! lease, pause the partition for `restart_delay` and reconnect, which delivers
//! the unfinished message again. Permanent index failures and log failures stop
//! the partition for good.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::metrics::{PartitionState, WorkerMetrics};
use crate::topic::LogConsumer;

pub struct PartitionSupervisor {
    partition: u32,
    dispatcher: Dispatcher,
    metrics: Arc<WorkerMetrics>,
    restart_delay: Duration,
}

impl PartitionSupervisor {
    pub fn new(partition: u32, dispatcher: Dispatcher, restart_delay: Duration) -> Self {
        Self {
            partition,
            metrics: dispatcher.metrics().clone(),
            dispatcher,
            restart_delay,
        }
    }

    /// Runs until shutdown or a fatal error. `connect` opens a fresh consumer
    /// for the partition on every (re)start.
    pub async fn run<C, F, Fut>(self, mut connect: F, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        C: LogConsumer,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let partition = self.partition;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.metrics
                .set_partition_state(partition, PartitionState::Connecting)
                .await;

            let result = match connect(partition).await {
                Ok(mut consumer) => {
                    self.metrics
                        .set_partition_state(partition, PartitionState::Consuming)
                        .await;
                    tracing::info!(partition, "Partition loop started");
                    let result = self.dispatcher.run(&mut consumer, &mut shutdown).await;
                    if let Err(e) = consumer.close().await {
                        tracing::warn!(partition, error = %e, "Failed to release partition");
                    }
                    result
                }
                Err(e) => {
                    self.metrics.record_consume_error();
                    Err(e)
                }
            };

            match result {
                Ok(()) => break,
                Err(e) if e.is_restartable() => {
                    self.metrics
                        .set_partition_state(partition, PartitionState::Restarting)
                        .await;
                    tracing::warn!(
                        partition,
                        class = e.class(),
                        error = %e,
                        delay_secs = self.restart_delay.as_secs(),
                        "Partition paused"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.restart_delay) => {}
                    }
                }
                Err(e) => {
                    self.metrics
                        .set_partition_state(partition, PartitionState::Failed)
                        .await;
                    tracing::error!(
                        partition,
                        class = e.class(),
                        error = %e,
                        "Partition stopped"
                    );
                    return Err(e);
                }
            }
        }

        self.metrics
            .set_partition_state(partition, PartitionState::Stopped)
            .await;
        tracing::info!(partition, "Partition loop stopped");
        Ok(())
    }
}
