// Operator tool: publish one change envelope to the change log
// Usage: cargo run --bin publish_event -- --type transactions --payload '{"id":1,"action":"create"}'

use anyhow::Context;
use clap::Parser;
use serde_json::Value;

use txn_search_indexer::models::{ChangeEnvelope, DomainEvent};
use txn_search_indexer::topic::RedisStreamProducer;
use txn_search_indexer::Config;

#[derive(Parser, Debug)]
#[command(name = "publish_event", about = "Publish one change envelope to the change log")]
struct Args {
    /// Envelope type: "transactions" or "categories"
    #[arg(long = "type")]
    kind: String,

    /// Event payload as JSON
    #[arg(long)]
    payload: String,

    /// Partition key; defaults to the entity key of the event
    #[arg(long)]
    key: Option<String>,

    /// Publish without validating, e.g. to exercise dead-lettering
    #[arg(long)]
    raw: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load environment variables
    dotenv::dotenv().ok();
    let config = Config::from_env().context("failed to load configuration")?;

    let payload = match serde_json::from_str::<Value>(&args.payload) {
        Ok(value) => value,
        Err(_) if args.raw => Value::String(args.payload.clone()),
        Err(e) => anyhow::bail!("payload is not valid JSON: {}", e),
    };
    let envelope = ChangeEnvelope {
        kind: args.kind,
        payload,
    };

    let key = if args.raw {
        args.key.unwrap_or_else(|| "raw".to_string())
    } else {
        let event = DomainEvent::decode(&envelope.to_bytes()?)
            .context("envelope would be rejected by the indexer (use --raw to send anyway)")?;
        args.key.unwrap_or_else(|| event.partition_key())
    };

    let mut producer = RedisStreamProducer::connect(&config.log)
        .await
        .context("failed to connect to the change log")?;
    let (partition, offset) = producer.publish(&key, &envelope).await?;

    println!("✅ Published {} event", envelope.kind);
    println!("🔑 Key: {}", key);
    println!("📦 Stream: {}:{} @ {}", config.log.topic, partition, offset);

    Ok(())
}
