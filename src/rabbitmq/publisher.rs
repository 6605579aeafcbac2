// src/rabbitmq/publisher.rs

use std::sync::Arc;

use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use tracing::{info, warn};

use super::channel::ChannelFactory;
use super::errors::{RelayError, Result};
use super::retry::RetryPolicy;

/// Publishes prompt and reply text to a queue over a short-lived channel.
///
/// Bodies go out as raw UTF-8 through the default exchange, with no
/// envelope, no correlation id and no content type: the worker on the far
/// side reads plain text. Replies therefore cannot be matched to requests,
/// which limits each queue pair to one request/response exchange in flight
/// at a time.
pub struct Publisher {
    channels: Arc<ChannelFactory>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(channels: Arc<ChannelFactory>) -> Self {
        Self {
            channels,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the default retry policy used for publishes.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sends `message` to `queue`, declaring the queue first. The channel
    /// opened for the publish is released whether or not the publish
    /// succeeds. Delivery is non-mandatory: a message sent while nobody
    /// consumes simply waits in the queue.
    pub async fn send(&self, message: &str, queue: &str) -> Result<()> {
        if queue.is_empty() {
            return Err(RelayError::InvalidArgument(
                "queue name is empty".to_string(),
            ));
        }

        let channel = self.channels.create_channel().await?;
        let outcome = self.publish(&channel, message, queue).await;

        if let Err(close_error) = channel.close(0, "publish finished").await {
            warn!(queue, error = %close_error, "Failed to close publish channel");
        }

        outcome
    }

    async fn publish(&self, channel: &Channel, message: &str, queue: &str) -> Result<()> {
        self.channels.declare_queue(channel, queue).await?;

        let payload = message.as_bytes();
        self.retry
            .execute("basic.publish", || async {
                channel
                    .basic_publish(
                        "",
                        queue,
                        BasicPublishOptions::default(),
                        payload,
                        BasicProperties::default(),
                    )
                    .await
                    .map(|_confirm| ())
                    .map_err(|publish_error| RelayError::Publish {
                        queue: queue.to_string(),
                        source: publish_error,
                    })
            })
            .await?;

        info!(queue, bytes = payload.len(), "Published message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::rabbitmq::connection::ConnectionManager;

    fn offline_publisher() -> Publisher {
        let config = RelayConfig::default();
        let connection = Arc::new(ConnectionManager::new(&config));
        Publisher::new(Arc::new(ChannelFactory::new(connection)))
    }

    #[tokio::test]
    async fn send_rejects_an_empty_queue_name() {
        let publisher = offline_publisher();
        let result = publisher.send("hello", "").await;
        assert!(matches!(result, Err(RelayError::InvalidArgument(_))));
    }
}
