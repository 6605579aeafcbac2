// src/rabbitmq/connection.rs

use std::sync::Arc;
use std::time::Duration;

use lapin::{Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::RelayConfig;

use super::errors::{RelayError, Result};
use super::retry::RetryPolicy;

/// Owns the single broker connection for the process lifetime.
///
/// One manager is constructed during startup and injected as an `Arc` into
/// every component that talks to the broker; nothing else opens its own
/// connection. The lapin client does not recover a lost connection by
/// itself, so the manager does: `get_connection` hands out the live handle
/// and re-establishes it when the previous one has died.
pub struct ConnectionManager {
    uri: String,
    recovery_interval: Duration,
    retry: RetryPolicy,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionManager {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
            recovery_interval: config.recovery_interval(),
            retry: RetryPolicy::default(),
            connection: Mutex::new(None),
        }
    }

    /// Replaces the default retry policy (three attempts, exponential
    /// backoff) used when establishing the connection.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the shared connection, establishing or re-establishing it as
    /// needed. The first call gates process startup: exhausting the retry
    /// budget there is fatal and the caller should not start serving.
    ///
    /// When an established connection is found dead, the manager pauses for
    /// the recovery interval before dialing again, giving a restarting
    /// broker time to come back.
    pub async fn get_connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.connection.lock().await;

        if let Some(connection) = guard.as_ref() {
            if connection.status().connected() {
                return Ok(Arc::clone(connection));
            }
            warn!(
                recovery_interval_secs = self.recovery_interval.as_secs(),
                "Broker connection lost, reconnecting"
            );
            sleep(self.recovery_interval).await;
        }

        let connection = self.establish().await?;
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn establish(&self) -> Result<Arc<Connection>> {
        let connection = self
            .retry
            .execute("connection.open", || async {
                Connection::connect(&self.uri, ConnectionProperties::default())
                    .await
                    .map_err(RelayError::Connection)
            })
            .await?;

        info!("Connected to RabbitMQ");
        Ok(Arc::new(connection))
    }

    /// Gracefully closes the connection at process shutdown. Channels still
    /// open on it are closed by the broker as part of the handshake.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            info!("Closing RabbitMQ connection");
            connection
                .close(0, "llama-relay shutting down")
                .await
                .map_err(RelayError::Connection)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    // Nothing listens on port 1, so dials are refused immediately and the
    // test clock measures only the retry policy.
    fn unreachable_config() -> RelayConfig {
        RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn injected_retry_policy_replaces_the_default() {
        let manager =
            ConnectionManager::new(&unreachable_config()).with_retry_policy(RetryPolicy::new(1, 1));

        let started = Instant::now();
        let result = manager.get_connection().await;

        assert!(matches!(result, Err(RelayError::Connection(_))));
        // A single attempt fails without sleeping; the default policy would
        // have sat through two backoffs first.
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
