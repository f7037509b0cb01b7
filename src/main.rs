use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use txn_search_indexer::index::{ElasticIndex, SearchIndex};
use txn_search_indexer::retry::with_backoff;
use txn_search_indexer::server;
use txn_search_indexer::topic::RedisStreamConsumer;
use txn_search_indexer::{Config, Dispatcher, PartitionSupervisor, WorkerMetrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    init_tracing();
    info!("Starting transaction search indexer...");

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        topic = %config.log.topic,
        partitions = config.log.partitions,
        group = %config.log.group,
        collection = %config.index.collection,
        delete_mode = config.index.delete_mode.as_str(),
        "Configuration loaded"
    );

    let metrics = Arc::new(WorkerMetrics::default());
    let index: Arc<dyn SearchIndex> =
        Arc::new(ElasticIndex::new(&config.index).context("failed to build index client")?);
    with_backoff(&config.retry, &metrics, "ensure_collection", || {
        index.ensure_collection(&config.index.collection)
    })
    .await
    .context("search index is not ready")?;
    info!(collection = %config.index.collection, "Index collection ready");

    let dispatcher = Dispatcher::new(index, &config.index, config.retry.clone(), metrics.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let owner = Uuid::new_v4().to_string();
    let log = Arc::new(config.log.clone());
    info!(owner = %owner, "Worker instance registered");

    let mut partitions = Vec::with_capacity(config.log.partitions as usize);
    for partition in 0..config.log.partitions {
        let supervisor =
            PartitionSupervisor::new(partition, dispatcher.clone(), config.restart_delay);
        let log = log.clone();
        let owner = owner.clone();
        let connect = move |p: u32| {
            let log = log.clone();
            let owner = owner.clone();
            async move { RedisStreamConsumer::connect(&log, p, &owner).await }
        };
        partitions.push(tokio::spawn(supervisor.run(connect, shutdown_rx.clone())));
    }

    let status = (config.status_port != 0).then(|| {
        tokio::spawn(server::serve(
            config.status_port,
            metrics.clone(),
            shutdown_rx.clone(),
        ))
    });

    let all_stopped = futures::future::join_all(partitions);
    tokio::pin!(all_stopped);
    let results = tokio::select! {
        results = &mut all_stopped => {
            warn!("Every partition has stopped");
            results
        }
        _ = shutdown_signal() => {
            info!("Shutting down gracefully...");
            let _ = shutdown_tx.send(true);
            (&mut all_stopped).await
        }
    };
    let _ = shutdown_tx.send(true);

    if let Some(status) = status {
        match status.await {
            Ok(Err(e)) => error!("Status server error: {}", e),
            Err(e) => error!("Status server task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    let mut failed = 0;
    for (partition, result) in results.into_iter().enumerate() {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(_)) => failed += 1,
            Err(e) => {
                error!(partition, "Partition task failed: {}", e);
                failed += 1;
            }
        }
    }
    info!(snapshot = ?metrics.snapshot(), "Indexer stopped");

    if failed > 0 {
        anyhow::bail!("{} partition(s) stopped on errors", failed);
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "txn_search_indexer=info,tower_http=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
