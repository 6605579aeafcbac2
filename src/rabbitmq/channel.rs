// src/rabbitmq/channel.rs

use std::sync::Arc;

use lapin::options::QueueDeclareOptions;
use lapin::types::FieldTable;
use lapin::Channel;
use tracing::debug;

use super::connection::ConnectionManager;
use super::errors::{RelayError, Result};
use super::retry::RetryPolicy;

/// Opens channels on the managed connection and declares queues with the
/// relay's fixed policy: non-durable, non-exclusive, no auto-delete and no
/// extra arguments. Queued messages are not expected to survive a broker
/// restart.
pub struct ChannelFactory {
    connection: Arc<ConnectionManager>,
    retry: RetryPolicy,
}

impl ChannelFactory {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the default retry policy used for channel opens and queue
    /// declarations.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Opens a fresh channel, re-establishing the underlying connection
    /// first if it has gone away.
    pub async fn create_channel(&self) -> Result<Channel> {
        let channel = self
            .retry
            .execute("channel.open", || async {
                let connection = self.connection.get_connection().await?;
                connection
                    .create_channel()
                    .await
                    .map_err(RelayError::Channel)
            })
            .await?;

        debug!(channel_id = channel.id(), "Opened channel");
        Ok(channel)
    }

    /// Declares `queue` on `channel`. The declaration is idempotent at the
    /// broker and is issued before every publish and every registration, so
    /// whichever side starts first creates the queue.
    pub async fn declare_queue(&self, channel: &Channel, queue: &str) -> Result<()> {
        self.retry
            .execute("queue.declare", || async {
                channel
                    .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
                    .await
                    .map_err(|error| RelayError::QueueDeclare {
                        queue: queue.to_string(),
                        source: error,
                    })?;
                Ok(())
            })
            .await?;

        debug!(queue, channel_id = channel.id(), "Queue declared");
        Ok(())
    }
}
