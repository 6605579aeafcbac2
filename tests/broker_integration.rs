// tests/broker_integration.rs
//
// End-to-end tests against a real broker. All of them are ignored by
// default; run with a local RabbitMQ instance and:
//
//     cargo test --test broker_integration -- --ignored

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::QueueDeleteOptions;
use tokio::sync::Notify;
use uuid::Uuid;

use llama_relay::{
    ChannelFactory, ConnectionManager, MessageHandler, Publisher, RelayConfig, RetryPolicy,
    SubscriptionRegistry,
};

/// Collects every delivery it sees and wakes anyone waiting on the count.
struct RecordingHandler {
    bodies: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    fn count(&self) -> usize {
        self.bodies.lock().unwrap().len()
    }

    fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }

    async fn wait_for(&self, expected: usize, deadline: Duration) -> bool {
        let started = tokio::time::Instant::now();
        while self.count() < expected {
            if started.elapsed() > deadline {
                return false;
            }
            let _ = tokio::time::timeout(Duration::from_millis(100), self.notify.notified()).await;
        }
        true
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_message(&self, _queue: &str, body: &[u8]) {
        self.bodies.lock().unwrap().push(body.to_vec());
        self.notify.notify_waiters();
    }
}

/// Consumes prompts and republishes them verbatim on the reply queue,
/// standing in for the inference worker.
struct EchoWorker {
    publisher: Arc<Publisher>,
    reply_queue: String,
}

#[async_trait]
impl MessageHandler for EchoWorker {
    async fn on_message(&self, _queue: &str, body: &[u8]) {
        let text = std::str::from_utf8(body).expect("prompt is UTF-8");
        self.publisher
            .send(text, &self.reply_queue)
            .await
            .expect("echo publish");
    }
}

async fn setup() -> (Arc<ConnectionManager>, Arc<ChannelFactory>) {
    let config = RelayConfig::from_env().expect("config from env");
    // A healthy broker never triggers the retries; the tighter policy keeps
    // a misconfigured run from sitting through the full default backoff.
    let retry = RetryPolicy::new(2, 1);
    let connection = Arc::new(ConnectionManager::new(&config).with_retry_policy(retry));
    connection.get_connection().await.expect("broker reachable");
    let channels = Arc::new(ChannelFactory::new(Arc::clone(&connection)).with_retry_policy(retry));
    (connection, channels)
}

fn test_queue(prefix: &str) -> String {
    format!("it_{}_{}", prefix, Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn connection_is_shared_and_reused() {
    let config = RelayConfig::from_env().expect("config from env");
    let manager = ConnectionManager::new(&config);

    let first = manager.get_connection().await.expect("first connect");
    let second = manager.get_connection().await.expect("second connect");
    assert!(Arc::ptr_eq(&first, &second));

    manager.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn publish_round_trip_delivers_the_reply() {
    let (connection, channels) = setup().await;
    let registry = SubscriptionRegistry::new(Arc::clone(&channels));
    let publisher =
        Arc::new(Publisher::new(Arc::clone(&channels)).with_retry_policy(RetryPolicy::new(2, 1)));

    let request_queue = test_queue("req");
    let reply_queue = test_queue("rep");

    let worker: Arc<dyn MessageHandler> = Arc::new(EchoWorker {
        publisher: Arc::clone(&publisher),
        reply_queue: reply_queue.clone(),
    });
    registry
        .register(Arc::clone(&worker), &request_queue)
        .await
        .expect("register worker");

    let frontend = RecordingHandler::new();
    let frontend_handler: Arc<dyn MessageHandler> = frontend.clone();
    registry
        .register(Arc::clone(&frontend_handler), &reply_queue)
        .await
        .expect("register frontend");

    publisher
        .send("hello", &request_queue)
        .await
        .expect("publish prompt");

    assert!(
        frontend.wait_for(1, Duration::from_secs(5)).await,
        "reply never arrived"
    );
    assert_eq!(frontend.bodies(), vec![b"hello".to_vec()]);

    registry.close().await;
    connection.close().await.expect("close connection");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn double_registration_delivers_each_message_once() {
    let (connection, channels) = setup().await;
    let registry = SubscriptionRegistry::new(Arc::clone(&channels));
    let publisher = Publisher::new(Arc::clone(&channels));

    let queue = test_queue("dup");
    let handler = RecordingHandler::new();
    let as_handler: Arc<dyn MessageHandler> = handler.clone();

    registry
        .register(Arc::clone(&as_handler), &queue)
        .await
        .expect("first register");
    registry
        .register(Arc::clone(&as_handler), &queue)
        .await
        .expect("second register");
    assert_eq!(registry.subscription_count().await, 1);

    publisher.send("once", &queue).await.expect("publish");

    assert!(handler.wait_for(1, Duration::from_secs(5)).await);
    // A duplicate consumer would deliver a second copy shortly after.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handler.count(), 1);

    registry.close().await;
    connection.close().await.expect("close connection");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn register_rebuilds_a_subscription_whose_consumer_died() {
    let (connection, channels) = setup().await;
    let registry = SubscriptionRegistry::new(Arc::clone(&channels));
    let publisher = Publisher::new(Arc::clone(&channels));

    let queue = test_queue("rebuild");
    let handler = RecordingHandler::new();
    let as_handler: Arc<dyn MessageHandler> = handler.clone();

    registry
        .register(Arc::clone(&as_handler), &queue)
        .await
        .expect("register");

    // Deleting the queue makes the broker cancel the consumer, ending the
    // delivery pump while the registry entry is still recorded.
    let admin = channels.create_channel().await.expect("admin channel");
    admin
        .queue_delete(&queue, QueueDeleteOptions::default())
        .await
        .expect("queue delete");
    admin.close(0, "admin done").await.expect("close admin");
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Re-registering the pair must notice the dead binding and stand up a
    // fresh consumer instead of passing through.
    registry
        .register(Arc::clone(&as_handler), &queue)
        .await
        .expect("re-register");
    assert_eq!(registry.subscription_count().await, 1);

    publisher.send("after rebuild", &queue).await.expect("publish");
    assert!(
        handler.wait_for(1, Duration::from_secs(5)).await,
        "delivery after rebuild never arrived"
    );

    registry.close().await;
    connection.close().await.expect("close connection");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn unregister_stops_delivery() {
    let (connection, channels) = setup().await;
    let registry = SubscriptionRegistry::new(Arc::clone(&channels));
    let publisher = Publisher::new(Arc::clone(&channels));

    let queue = test_queue("unreg");
    let handler = RecordingHandler::new();
    let as_handler: Arc<dyn MessageHandler> = handler.clone();

    registry
        .register(Arc::clone(&as_handler), &queue)
        .await
        .expect("register");

    publisher.send("first", &queue).await.expect("publish first");
    assert!(handler.wait_for(1, Duration::from_secs(5)).await);

    registry
        .unregister(&as_handler, &queue)
        .await
        .expect("unregister");
    assert!(!registry.contains(&as_handler, &queue).await);
    assert_eq!(registry.subscription_count().await, 0);

    // The queue still exists; the message just waits for a consumer that
    // never comes.
    publisher.send("second", &queue).await.expect("publish second");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handler.count(), 1);

    registry.close().await;
    connection.close().await.expect("close connection");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn one_handler_may_watch_several_queues() {
    let (connection, channels) = setup().await;
    let registry = SubscriptionRegistry::new(Arc::clone(&channels));
    let publisher = Publisher::new(Arc::clone(&channels));

    let first_queue = test_queue("multi_a");
    let second_queue = test_queue("multi_b");
    let handler = RecordingHandler::new();
    let as_handler: Arc<dyn MessageHandler> = handler.clone();

    registry
        .register(Arc::clone(&as_handler), &first_queue)
        .await
        .expect("register first");
    registry
        .register(Arc::clone(&as_handler), &second_queue)
        .await
        .expect("register second");
    assert_eq!(registry.subscription_count().await, 2);

    publisher.send("a", &first_queue).await.expect("publish a");
    publisher.send("b", &second_queue).await.expect("publish b");
    assert!(handler.wait_for(2, Duration::from_secs(5)).await);

    // Dropping one queue leaves the other subscription running.
    registry
        .unregister(&as_handler, &first_queue)
        .await
        .expect("unregister first");
    assert!(registry.contains(&as_handler, &second_queue).await);
    assert_eq!(registry.subscription_count().await, 1);

    registry.close().await;
    connection.close().await.expect("close connection");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn close_releases_every_subscription() {
    let (connection, channels) = setup().await;
    let registry = SubscriptionRegistry::new(Arc::clone(&channels));
    let publisher = Publisher::new(Arc::clone(&channels));

    let queue = test_queue("close");
    let handler = RecordingHandler::new();
    let as_handler: Arc<dyn MessageHandler> = handler.clone();

    registry
        .register(Arc::clone(&as_handler), &queue)
        .await
        .expect("register");

    registry.close().await;
    assert_eq!(registry.subscription_count().await, 0);

    // Messages published after close pile up unconsumed.
    publisher.send("orphan", &queue).await.expect("publish");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(handler.count(), 0);

    connection.close().await.expect("close connection");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn concurrent_registrations_of_distinct_pairs_both_land() {
    let (connection, channels) = setup().await;
    let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&channels)));

    let first_queue = test_queue("conc_a");
    let second_queue = test_queue("conc_b");
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();
    let first_handler: Arc<dyn MessageHandler> = first.clone();
    let second_handler: Arc<dyn MessageHandler> = second.clone();

    let (first_result, second_result) = tokio::join!(
        registry.register(Arc::clone(&first_handler), &first_queue),
        registry.register(Arc::clone(&second_handler), &second_queue),
    );
    first_result.expect("first register");
    second_result.expect("second register");

    assert_eq!(registry.subscription_count().await, 2);
    assert!(registry.contains(&first_handler, &first_queue).await);
    assert!(registry.contains(&second_handler, &second_queue).await);

    registry.close().await;
    connection.close().await.expect("close connection");
}
