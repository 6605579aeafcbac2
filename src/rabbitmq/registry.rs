// src/rabbitmq/registry.rs

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::options::{BasicCancelOptions, BasicConsumeOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::ChannelFactory;
use super::errors::{RelayError, Result};

/// Callback invoked for every delivery on a queue the handler is registered
/// against. Implementations are shared across tasks, and one handler may be
/// registered on several queues at once.
///
/// Deliveries on a single subscription are handed over one at a time in
/// arrival order; the next delivery is not dispatched until `on_message`
/// returns. A slow handler therefore backs up its own queue, not the
/// process.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, queue: &str, body: &[u8]);
}

/// Identity of a registration: the `Arc` allocation, not the value behind
/// it. Two clones of one `Arc` are the same handler; two separate
/// allocations of equal handlers are different ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HandlerId(usize);

impl HandlerId {
    fn of(handler: &Arc<dyn MessageHandler>) -> Self {
        Self(Arc::as_ptr(handler) as *const () as usize)
    }
}

/// One active consumer binding: the queue, the channel that owns the
/// consumer, and the pump task feeding deliveries to the handler.
struct Subscription {
    queue: String,
    channel: Channel,
    consumer_tag: String,
    pump: JoinHandle<()>,
    /// Keeps the handler allocation alive for as long as the entry exists,
    /// so the address serving as its registry identity cannot be recycled
    /// by a later allocation.
    _handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    /// True once the binding can no longer deliver: the pump has exited or
    /// its channel has dropped.
    fn is_dead(&self) -> bool {
        self.pump.is_finished() || !self.channel.status().connected()
    }

    /// Detaches the consumer and releases the channel. Failures are logged
    /// and swallowed: teardown runs during unregister and shutdown, where no
    /// caller can act on them.
    async fn release(self, reason: &str) {
        if let Err(cancel_error) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(
                queue = %self.queue,
                error = %cancel_error,
                "Failed to cancel consumer during teardown"
            );
        }
        if let Err(close_error) = self.channel.close(0, reason).await {
            warn!(
                queue = %self.queue,
                error = %close_error,
                "Failed to close channel during teardown"
            );
        }

        // Cancelling the consumer ends its stream, so the pump normally
        // exits on its own; aborting covers the case where the broker calls
        // above failed on a dead channel.
        self.pump.abort();
        debug!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Subscription released");
    }
}

struct RegistryInner {
    handlers: HashMap<HandlerId, HashMap<String, Subscription>>,
    /// Per-handler critical sections for register and unregister. An entry
    /// outlives the handler's subscriptions and is dropped once nothing
    /// holds or waits on it.
    locks: HashMap<HandlerId, Arc<Mutex<()>>>,
    closed: bool,
}

impl RegistryInner {
    /// Drops a handler's bookkeeping once it has no subscriptions left.
    /// Callers hold exactly one clone of the handler's lock, so a strong
    /// count of two means nobody else is using or waiting on it; with a
    /// waiter present the entry stays, keeping everyone on the same lock.
    fn prune_handler(&mut self, id: HandlerId) {
        if self
            .handlers
            .get(&id)
            .map_or(false, |queues| queues.is_empty())
        {
            self.handlers.remove(&id);
        }
        if self.handlers.contains_key(&id) {
            return;
        }
        if self
            .locks
            .get(&id)
            .map_or(false, |lock| Arc::strong_count(lock) == 2)
        {
            self.locks.remove(&id);
        }
    }
}

/// Bookkeeping of active (handler, queue) subscriptions.
///
/// At most one subscription exists per (handler identity, queue) pair.
/// Re-registering a pair that is still live is a pass-through rather than an
/// error, since a second consumer would hand every message to the same
/// handler twice; a pair whose consumer has died is rebuilt instead. The
/// registry owns the channels it opens and releases them on unregister and
/// on close.
///
/// Mutations for one handler are serialized through that handler's own lock,
/// while the registry-wide lock only covers map bookkeeping and is never
/// held across broker calls. A registration riding out connection retries
/// therefore cannot stall other handlers' operations or `close`.
pub struct SubscriptionRegistry {
    channels: Arc<ChannelFactory>,
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(channels: Arc<ChannelFactory>) -> Self {
        Self {
            channels,
            inner: Mutex::new(RegistryInner {
                handlers: HashMap::new(),
                locks: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Starts consuming `queue` into `handler`. Idempotent per (handler,
    /// queue): registering a pair that already has a live subscription
    /// returns immediately with the existing one untouched, while a pair
    /// whose consumer has died is torn down and rebuilt.
    ///
    /// The handler's lock is held from before the broker setup until the
    /// subscription is recorded, so a concurrent register or unregister of
    /// the same handler either runs to completion first or observes this
    /// registration fully recorded.
    pub async fn register(&self, handler: Arc<dyn MessageHandler>, queue: &str) -> Result<()> {
        if queue.is_empty() {
            return Err(RelayError::InvalidArgument(
                "queue name is empty".to_string(),
            ));
        }

        let id = HandlerId::of(&handler);
        let key_lock = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(RelayError::RegistryClosed);
            }
            if let Some(subscription) = inner.handlers.get(&id).and_then(|queues| queues.get(queue))
            {
                if !subscription.is_dead() {
                    debug!(queue, handler = id.0, "Handler already registered, skipping");
                    return Ok(());
                }
            }
            Arc::clone(inner.locks.entry(id).or_default())
        };
        let _key_guard = key_lock.lock().await;

        // Second look under the handler lock: a concurrent register may have
        // recorded the pair while this call waited, and a binding whose pump
        // or channel died is replaced rather than passed through.
        let dead = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(RelayError::RegistryClosed);
            }
            let is_live = inner
                .handlers
                .get(&id)
                .and_then(|queues| queues.get(queue))
                .map_or(false, |subscription| !subscription.is_dead());
            if is_live {
                debug!(queue, handler = id.0, "Handler already registered, skipping");
                return Ok(());
            }
            inner
                .handlers
                .get_mut(&id)
                .and_then(|queues| queues.remove(queue))
        };
        if let Some(dead) = dead {
            warn!(
                queue,
                handler = id.0,
                "Replacing a subscription whose consumer died"
            );
            dead.release("replacing dead subscription").await;
        }

        let channel = match self.channels.create_channel().await {
            Ok(channel) => channel,
            Err(setup_error) => {
                self.inner.lock().await.prune_handler(id);
                return Err(setup_error);
            }
        };
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let consumer = match self.start_consumer(&channel, queue, &consumer_tag).await {
            Ok(consumer) => consumer,
            Err(setup_error) => {
                // The channel opened for this registration must not leak.
                if let Err(close_error) = channel.close(0, "registration failed").await {
                    warn!(
                        queue,
                        error = %close_error,
                        "Failed to close channel after failed registration"
                    );
                }
                self.inner.lock().await.prune_handler(id);
                return Err(setup_error);
            }
        };

        let pump = spawn_delivery_pump(
            consumer,
            channel.clone(),
            Arc::clone(&handler),
            queue.to_string(),
        );
        let subscription = Subscription {
            queue: queue.to_string(),
            channel,
            consumer_tag,
            pump,
            _handler: Arc::clone(&handler),
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                // close() ran while the binding was being set up; it must
                // not outlive the registry.
                drop(inner);
                warn!(
                    queue,
                    "Registry closed during registration, discarding subscription"
                );
                subscription.release("registry shutdown").await;
                return Err(RelayError::RegistryClosed);
            }
            inner
                .handlers
                .entry(id)
                .or_default()
                .insert(queue.to_string(), subscription);
        }

        info!(queue, handler = id.0, "Registered message handler");
        Ok(())
    }

    async fn start_consumer(
        &self,
        channel: &Channel,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Consumer> {
        self.channels.declare_queue(channel, queue).await?;

        // Auto-acknowledge: a message counts as processed the moment the
        // broker hands it over, and a handler failure does not trigger
        // redelivery.
        channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|consume_error| RelayError::Consume {
                queue: queue.to_string(),
                source: consume_error,
            })
    }

    /// Stops consumption for the (handler, queue) pair and releases its
    /// channel. Pairs that were never registered, or were already
    /// unregistered, are a no-op. The subscription leaves the map and the
    /// consumer is cancelled before its channel close begins.
    pub async fn unregister(&self, handler: &Arc<dyn MessageHandler>, queue: &str) -> Result<()> {
        let id = HandlerId::of(handler);

        let key_lock = {
            let inner = self.inner.lock().await;
            match inner.locks.get(&id) {
                Some(lock) => Arc::clone(lock),
                None => {
                    debug!(queue, "Unregister without a matching subscription, ignoring");
                    return Ok(());
                }
            }
        };
        // Waiting on the handler lock orders this call after any in-flight
        // register of the same handler, so a subscription recorded by that
        // register cannot slip past its own unregister.
        let _key_guard = key_lock.lock().await;

        let removed = {
            let mut inner = self.inner.lock().await;
            let removed = inner
                .handlers
                .get_mut(&id)
                .and_then(|queues| queues.remove(queue));
            inner.prune_handler(id);
            removed
        };
        let subscription = match removed {
            Some(subscription) => subscription,
            None => {
                debug!(queue, "Unregister without a matching subscription, ignoring");
                return Ok(());
            }
        };

        subscription.release("unregistering handler").await;
        info!(queue, handler = id.0, "Unregistered message handler");
        Ok(())
    }

    /// Releases every remaining subscription and marks the registry closed.
    /// Later registrations are refused; later unregistrations and repeated
    /// closes are no-ops.
    ///
    /// Close does not wait for in-flight registrations: it flips the closed
    /// flag and drains what has been recorded. A registration still setting
    /// up observes the flag before recording and discards its binding.
    pub async fn close(&self) {
        let handlers = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.locks.clear();
            std::mem::take(&mut inner.handlers)
        };

        let remaining = handlers.values().map(|queues| queues.len()).sum::<usize>();
        if remaining > 0 {
            info!(subscriptions = remaining, "Closing subscription registry");
        }
        for (_, queues) in handlers {
            for (_, subscription) in queues {
                subscription.release("registry shutdown").await;
            }
        }
    }

    /// True when the (handler, queue) pair currently has a subscription.
    pub async fn contains(&self, handler: &Arc<dyn MessageHandler>, queue: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .handlers
            .get(&HandlerId::of(handler))
            .map_or(false, |queues| queues.contains_key(queue))
    }

    /// Number of recorded subscriptions across all handlers.
    pub async fn subscription_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.handlers.values().map(|queues| queues.len()).sum()
    }
}

impl Drop for SubscriptionRegistry {
    /// Last-resort cleanup when the registry is dropped without `close`.
    /// Drop cannot run the async cancel and close round-trips, so it only
    /// aborts the pump tasks and leaves the channels for the broker to
    /// reclaim when the connection goes. Explicit `close` remains the
    /// proper shutdown path.
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.closed {
            return;
        }
        let leaked = inner
            .handlers
            .values()
            .map(|queues| queues.len())
            .sum::<usize>();
        if leaked == 0 {
            return;
        }
        warn!(
            subscriptions = leaked,
            "SubscriptionRegistry dropped without close(), aborting consumers"
        );
        for queues in inner.handlers.values() {
            for subscription in queues.values() {
                subscription.pump.abort();
            }
        }
    }
}

/// Drives one consumer stream, handing every delivery to the handler in
/// arrival order. Runs until the consumer is cancelled or the channel dies.
fn spawn_delivery_pump(
    mut consumer: Consumer,
    channel: Channel,
    handler: Arc<dyn MessageHandler>,
    queue: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    debug!(queue = %queue, bytes = delivery.data.len(), "Delivery received");
                    handler.on_message(&queue, &delivery.data).await;
                }
                Err(stream_error) => {
                    error!(queue = %queue, error = %stream_error, "Error receiving delivery");
                    if !channel.status().connected() {
                        warn!(queue = %queue, "Channel disconnected, consumer stopping");
                        break;
                    }
                }
            }
        }
        debug!(queue = %queue, "Consumer stream ended");
    })
}
