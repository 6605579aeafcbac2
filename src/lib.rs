//! Queue-fabric adapter between a prompt-submitting frontend and an
//! asynchronous Llama inference worker.
//!
//! The frontend publishes raw UTF-8 prompts to `frontend_to_backend` and
//! registers a [`MessageHandler`] on `backend_to_frontend` to receive the
//! worker's replies. This crate owns the broker plumbing for that exchange:
//! the process-wide connection and its recovery, channel and queue setup,
//! idempotent consumer registration, and publishing. Rendering, inference
//! and wiring live with the callers.
//!
//! Messages carry no correlation ids, so replies cannot be matched to
//! requests; keep a single request/response pair in flight per queue pair.

pub mod config;
pub mod rabbitmq;

pub use config::{RelayConfig, BACKEND_TO_FRONTEND_QUEUE, FRONTEND_TO_BACKEND_QUEUE};
pub use rabbitmq::channel::ChannelFactory;
pub use rabbitmq::connection::ConnectionManager;
pub use rabbitmq::errors::{RelayError, Result};
pub use rabbitmq::publisher::Publisher;
pub use rabbitmq::registry::{MessageHandler, SubscriptionRegistry};
pub use rabbitmq::retry::RetryPolicy;
