//! Pushes a few messages, consumes each one and shows the queue is drained.
//!
//! Uses the backend from the `LEASEMQ_*` environment (Redis by default). Run
//! with `LEASEMQ_BACKEND=memory` to try it without a server.

use std::time::Duration;

use leasemq::{config::Config, MessageQueue};
use tracing_subscriber::EnvFilter;

const QUEUE: &str = "demo";

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let queue = MessageQueue::connect_with()
        .config(Config::load()?)
        .call()
        .await?;

    for payload in ["order-1", "order-2", "order-3"] {
        let id = queue.push(QUEUE, payload).await?;
        tracing::info!(%id, payload, "pushed");
    }

    loop {
        let message = match queue.pull(QUEUE, Duration::from_secs(10)).await {
            Ok(message) => message,
            Err(e) if e.is_queue_empty() => {
                tracing::info!("{e}");
                break;
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            id = %message.id,
            payload = %String::from_utf8_lossy(&message.payload),
            retry_count = message.retry_count,
            "pulled"
        );

        if let Some(receipt) = message.receipt() {
            queue.ack(&message.id, receipt).await?;
            tracing::info!(id = %message.id, "acknowledged");
        }
    }

    queue.close().await?;

    Ok(())
}
