// src/rabbitmq/mod.rs
// Broker plumbing for the relay: connection lifecycle, channel and queue
// setup, consumer bookkeeping and publishing.

pub mod channel;
pub mod connection;
pub mod errors;
pub mod publisher;
pub mod registry;
pub mod retry;

// Re-export specific items to simplify imports elsewhere
pub use channel::ChannelFactory;
pub use connection::ConnectionManager;
pub use errors::{RelayError, Result};
pub use publisher::Publisher;
pub use registry::{MessageHandler, SubscriptionRegistry};
pub use retry::RetryPolicy;
