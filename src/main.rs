// src/main.rs

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use llama_relay::{
    ChannelFactory, ConnectionManager, MessageHandler, Publisher, RelayConfig,
    SubscriptionRegistry,
};

/// Stand-in for the frontend: prints each reply the worker publishes.
struct ReplyPrinter;

#[async_trait]
impl MessageHandler for ReplyPrinter {
    async fn on_message(&self, queue: &str, body: &[u8]) {
        match std::str::from_utf8(body) {
            Ok(text) => println!("[{}] {}", queue, text),
            Err(_) => println!("[{}] {} bytes of non-UTF-8 data", queue, body.len()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = RelayConfig::load()?;
    info!(
        host = %config.host,
        port = config.port,
        request_queue = %config.request_queue,
        reply_queue = %config.reply_queue,
        "Starting llama-relay"
    );

    // The connection gates startup: without a broker there is no relay.
    let connection = Arc::new(ConnectionManager::new(&config));
    connection.get_connection().await?;

    let channels = Arc::new(ChannelFactory::new(Arc::clone(&connection)));
    let registry = SubscriptionRegistry::new(Arc::clone(&channels));
    let publisher = Publisher::new(channels);

    let handler: Arc<dyn MessageHandler> = Arc::new(ReplyPrinter);
    registry
        .register(Arc::clone(&handler), &config.reply_queue)
        .await?;

    // Any command-line arguments become one prompt; with none, the process
    // just listens for replies.
    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if !prompt.is_empty() {
        publisher.send(&prompt, &config.request_queue).await?;
    }

    info!("Relay running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    registry.close().await;
    if let Err(close_error) = connection.close().await {
        warn!(error = %close_error, "Failed to close broker connection");
    }

    Ok(())
}
