// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to connect to RabbitMQ: {0}")]
    Connection(#[source] LapinError),

    #[error("Failed to open channel: {0}")]
    Channel(#[source] LapinError),

    #[error("Failed to declare queue '{queue}': {source}")]
    QueueDeclare {
        queue: String,
        #[source]
        source: LapinError,
    },

    #[error("Failed to publish to queue '{queue}': {source}")]
    Publish {
        queue: String,
        #[source]
        source: LapinError,
    },

    #[error("Failed to start consumer on queue '{queue}': {source}")]
    Consume {
        queue: String,
        #[source]
        source: LapinError,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Subscription registry is closed")]
    RegistryClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

// Custom Result type for broker operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Whether another attempt at the same operation could succeed.
    /// Argument and configuration mistakes never become true on retry, and
    /// neither does a closed registry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Connection(source)
            | RelayError::Channel(source)
            | RelayError::QueueDeclare { source, .. }
            | RelayError::Publish { source, .. }
            | RelayError::Consume { source, .. } => is_transient(source),
            RelayError::InvalidArgument(_)
            | RelayError::RegistryClosed
            | RelayError::Config(_) => false,
        }
    }
}

/// Broker-unreachable and dropped-connection conditions. Protocol, parsing
/// and serialisation failures indicate a bug on one side of the wire and are
/// surfaced immediately instead of being retried.
pub(crate) fn is_transient(error: &LapinError) -> bool {
    matches!(
        error,
        LapinError::IOError(_)
            | LapinError::InvalidConnectionState(_)
            | LapinError::InvalidChannelState(_)
            | LapinError::MissingHeartbeatError
    )
}
