use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relaymesh::broker::{Channel, Connector, DeliveryStream, ErrorCallback, MessageProperties};
use relaymesh::{
    queues, ActionRouter, ClientConfig, ConnectionConfig, ConnectionManager, HandlerError,
    MemoryBroker, Publisher, QueueDescriptor, RelayError, Request, ServiceClient, Worker,
    WorkerConfig,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

struct Harness {
    broker: MemoryBroker,
    connection: Arc<ConnectionManager>,
    client: ServiceClient,
}

impl Harness {
    fn new() -> Self {
        let broker = MemoryBroker::new();
        let config = ConnectionConfig {
            max_retries: 3,
            retry_delay_ms: 20,
            ..Default::default()
        };
        let connection = Arc::new(ConnectionManager::with_connector(config, Arc::new(broker.clone())));
        let client = ServiceClient::new(connection.clone(), ClientConfig::new("user-service"));
        Self {
            broker,
            connection,
            client,
        }
    }

    /// Start a worker on its own connection, as a sibling service would
    async fn spawn_worker(
        &self,
        queue: &'static str,
        router: ActionRouter,
    ) -> (Arc<Worker>, JoinHandle<relaymesh::Result<()>>) {
        let connection = Arc::new(ConnectionManager::with_connector(
            ConnectionConfig {
                max_retries: 3,
                retry_delay_ms: 20,
                ..Default::default()
            },
            Arc::new(self.broker.clone()),
        ));
        let worker = Arc::new(Worker::new(connection, WorkerConfig::new("otp-service")));
        let consumers = self.broker.consumer_count(queue);
        let serving = tokio::spawn({
            let worker = worker.clone();
            async move { worker.serve(queue, router).await }
        });
        while self.broker.consumer_count(queue) == consumers {
            tokio::task::yield_now().await;
        }
        (worker, serving)
    }
}

/// Where a [`FaultyChannel`] pulls the broker out from under its caller
#[derive(Clone, Copy, PartialEq, Eq)]
enum Fault {
    DuringPublish,
    AfterReplyConsume,
}

/// Memory connector whose first connection drops the broker once, mid-operation
struct FaultyConnector {
    broker: MemoryBroker,
    fault: Fault,
    armed: Arc<AtomicBool>,
}

impl FaultyConnector {
    fn manager(broker: &MemoryBroker, fault: Fault) -> Arc<ConnectionManager> {
        let connector = FaultyConnector {
            broker: broker.clone(),
            fault,
            armed: Arc::new(AtomicBool::new(true)),
        };
        let config = ConnectionConfig {
            max_retries: 3,
            retry_delay_ms: 20,
            ..Default::default()
        };
        Arc::new(ConnectionManager::with_connector(config, Arc::new(connector)))
    }
}

#[async_trait]
impl Connector for FaultyConnector {
    async fn connect(&self) -> relaymesh::Result<Arc<dyn Channel>> {
        Ok(Arc::new(FaultyChannel {
            inner: self.broker.connect().await?,
            broker: self.broker.clone(),
            fault: self.fault,
            armed: self.armed.clone(),
        }))
    }

    fn describe(&self) -> String {
        "faulty-memory://".to_string()
    }
}

struct FaultyChannel {
    inner: Arc<dyn Channel>,
    broker: MemoryBroker,
    fault: Fault,
    armed: Arc<AtomicBool>,
}

impl FaultyChannel {
    fn trip(&self, fault: Fault) -> bool {
        self.fault == fault && self.armed.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for FaultyChannel {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> relaymesh::Result<()> {
        self.inner.declare_queue(queue).await
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> relaymesh::Result<()> {
        if self.trip(Fault::DuringPublish) {
            self.broker.disconnect();
        }
        self.inner.publish(queue, body, properties).await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> relaymesh::Result<DeliveryStream> {
        let stream = self.inner.consume(queue, consumer_tag, no_ack).await?;
        if queue.contains(".replies.") && self.trip(Fault::AfterReplyConsume) {
            self.broker.disconnect();
        }
        Ok(stream)
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.inner.on_error(callback)
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

async fn otp_router(calls: Arc<AtomicUsize>) -> ActionRouter {
    let router = ActionRouter::new();
    router
        .register_function("verifyOTP", move |req: Request| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let otp = req.payload["otp"].as_str().unwrap_or_default();
                if otp.is_empty() {
                    return Err(HandlerError::new("INVALID_OTP", "otp is required"));
                }
                Ok(json!({ "valid": otp == "ab12cd" }))
            }
        })
        .await;
    router
}

#[tokio::test]
async fn verify_otp_round_trip() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let (worker, serving) = harness
        .spawn_worker(queues::OTP, otp_router(calls.clone()).await)
        .await;

    let reply = harness
        .client
        .call_with_timeout(
            queues::OTP,
            "verifyOTP",
            json!({"email": "a@b.com", "otp": "ab12cd", "role": "customer"}),
            Duration::from_millis(5000),
        )
        .await
        .unwrap();

    assert_eq!(reply, json!({"valid": true}));
    assert_eq!(harness.client.pending_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    worker.stop();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn handler_error_is_remote_not_timeout() {
    let harness = Harness::new();
    let (worker, _serving) = harness
        .spawn_worker(queues::OTP, otp_router(Arc::new(AtomicUsize::new(0))).await)
        .await;

    let err = harness
        .client
        .call_with_timeout(queues::OTP, "verifyOTP", json!({"email": "a@b.com"}), Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        RelayError::Remote { code, message } => {
            assert_eq!(code, "INVALID_OTP");
            assert_eq!(message, "otp is required");
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    let err = harness
        .client
        .call(queues::OTP, "resetOTP", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Remote { code, .. } if code == "ACTION_NOT_FOUND"));
    worker.stop();
}

#[tokio::test(start_paused = true)]
async fn timeouts_do_not_leak_pending_calls() {
    let harness = Harness::new();
    harness
        .connection
        .declare(&queues::descriptor(queues::OTP))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    for _ in 0..50 {
        let err = harness
            .client
            .call_with_timeout(queues::OTP, "verifyOTP", json!({}), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout { timeout_ms: 300 }));
    }

    assert!(started.elapsed() >= Duration::from_millis(300 * 50));
    assert_eq!(harness.client.pending_count(), 0);
    assert_eq!(harness.broker.queue_depth(queues::OTP), 50);
}

#[tokio::test(start_paused = true)]
async fn single_call_times_out_at_its_deadline() {
    let harness = Harness::new();
    harness
        .connection
        .declare(&queues::descriptor(queues::OTP))
        .await
        .unwrap();
    let timeout = Duration::from_millis(250);

    let started = tokio::time::Instant::now();
    let err = harness
        .client
        .call_with_timeout(queues::OTP, "verifyOTP", json!({}), timeout)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RelayError::Timeout { timeout_ms: 250 }));
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(elapsed < timeout + Duration::from_millis(50), "returned late after {elapsed:?}");
}

#[tokio::test]
async fn stale_replies_do_not_disturb_live_calls() {
    let harness = Harness::new();
    harness
        .connection
        .declare(&queues::descriptor(queues::OTP))
        .await
        .unwrap();

    let pending = harness
        .client
        .send(queues::OTP, "verifyOTP", json!({}), Duration::from_secs(5))
        .await
        .unwrap();

    // A reply nobody asked for, then the real one
    let channel = harness.connection.acquire_channel().await.unwrap();
    let stale = relaymesh::ReplyEnvelope::success(json!({"valid": false}), 0).unwrap();
    channel
        .publish(
            harness.client.reply_queue(),
            &stale.to_bytes().unwrap(),
            relaymesh::broker::MessageProperties::json().with_correlation_id("not-a-pending-call"),
        )
        .await
        .unwrap();
    let real = relaymesh::ReplyEnvelope::success(json!({"valid": true}), 0).unwrap();
    channel
        .publish(
            harness.client.reply_queue(),
            &real.to_bytes().unwrap(),
            relaymesh::broker::MessageProperties::json().with_correlation_id(pending.correlation_id()),
        )
        .await
        .unwrap();

    assert_eq!(pending.wait().await.unwrap(), json!({"valid": true}));
    assert_eq!(harness.client.pending_count(), 0);
}

#[tokio::test]
async fn concurrent_calls_only_see_their_own_reply() {
    let harness = Harness::new();
    let router = ActionRouter::new();
    router
        .register_function("lookup", |req: Request| async move {
            // The first request answers last
            let n = req.payload["n"].as_u64().unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(if n == 1 { 50 } else { 0 })).await;
            Ok(json!({ "n": n }))
        })
        .await;
    let (worker, _serving) = harness.spawn_worker(queues::USER_INFO, router).await;

    let first = harness
        .client
        .call(queues::USER_INFO, "lookup", json!({"n": 1}));
    let second = harness
        .client
        .call(queues::USER_INFO, "lookup", json!({"n": 2}));
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap(), json!({"n": 1}));
    assert_eq!(second.unwrap(), json!({"n": 2}));
    assert_eq!(harness.client.pending_count(), 0);
    worker.stop();
}

#[tokio::test]
async fn connection_loss_fails_pending_calls_then_recovers() {
    let harness = Harness::new();
    harness
        .connection
        .declare(&queues::descriptor(queues::OTP))
        .await
        .unwrap();

    let mut pending = Vec::new();
    for _ in 0..5 {
        pending.push(
            harness
                .client
                .send(queues::OTP, "verifyOTP", json!({"otp": "ab12cd"}), Duration::from_secs(30))
                .await
                .unwrap(),
        );
    }
    assert_eq!(harness.client.pending_count(), 5);

    harness.broker.disconnect();

    for call in pending {
        assert!(matches!(call.wait().await, Err(RelayError::ConnectionLost)));
    }
    assert_eq!(harness.client.pending_count(), 0);

    // The five orphaned requests are answered too; their replies are discarded
    let (worker, _serving) = harness
        .spawn_worker(queues::OTP, otp_router(Arc::new(AtomicUsize::new(0))).await)
        .await;
    let reply = harness
        .client
        .call(queues::OTP, "verifyOTP", json!({"otp": "ab12cd"}))
        .await
        .unwrap();

    assert_eq!(reply, json!({"valid": true}));
    assert_eq!(harness.connection.generation(), 2);
    worker.stop();
}

#[tokio::test]
async fn crashed_worker_request_is_redelivered_to_another() {
    let harness = Harness::new();

    let crashes = Arc::new(AtomicUsize::new(0));
    let crashing = ActionRouter::new();
    crashing
        .register_function("verifyOTP", {
            let crashes = crashes.clone();
            move |req: Request| {
                let crashes = crashes.clone();
                async move {
                    crashes.fetch_add(1, Ordering::SeqCst);
                    if !req.redelivered {
                        panic!("worker crashed mid-request");
                    }
                    Ok(Value::Null)
                }
            }
        })
        .await;
    // Subscribed first, so it receives the first delivery
    let (crashed, _crashed_serving) = harness.spawn_worker(queues::OTP, crashing).await;

    let healthy_calls = Arc::new(AtomicUsize::new(0));
    let (healthy, healthy_serving) = harness
        .spawn_worker(queues::OTP, otp_router(healthy_calls.clone()).await)
        .await;

    let reply = harness
        .client
        .call_with_timeout(queues::OTP, "verifyOTP", json!({"otp": "ab12cd"}), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(reply, json!({"valid": true}));
    assert_eq!(crashes.load(Ordering::SeqCst), 1);
    assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);

    crashed.stop();
    healthy.stop();
    healthy_serving.await.unwrap().unwrap();
    assert_eq!(harness.broker.unacked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn publish_while_disconnected_is_connection_failure() {
    let harness = Harness::new();
    let publisher = Publisher::new(harness.connection.clone());
    harness.broker.set_available(false);

    let err = publisher
        .publish(queues::NOTIFICATION, json!({"title": "Welcome"}))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::ConnectionFailure { attempts: 3, .. }));
    assert!(!harness.broker.has_queue(queues::NOTIFICATION));
}

#[tokio::test]
async fn connection_drop_during_publish_is_retriable() {
    let harness = Harness::new();
    let (worker, _serving) = harness
        .spawn_worker(queues::OTP, otp_router(Arc::new(AtomicUsize::new(0))).await)
        .await;
    let connection = FaultyConnector::manager(&harness.broker, Fault::DuringPublish);
    let client = ServiceClient::new(connection.clone(), ClientConfig::new("user-service"));

    let err = client
        .call_with_timeout(queues::OTP, "verifyOTP", json!({"otp": "ab12cd"}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::ConnectionLost), "got {err:?}");
    assert!(err.is_retriable());
    assert_eq!(client.pending_count(), 0);

    let reply = client
        .call_with_timeout(queues::OTP, "verifyOTP", json!({"otp": "ab12cd"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, json!({"valid": true}));
    assert_eq!(connection.generation(), 2);
    worker.stop();
}

#[tokio::test]
async fn connection_drop_during_event_publish_is_retriable() {
    let broker = MemoryBroker::new();
    let publisher = Publisher::new(FaultyConnector::manager(&broker, Fault::DuringPublish));

    let err = publisher
        .publish(queues::CREATE_NOTIFICATION, json!({"title": "Welcome"}))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::ConnectionFailure { attempts: 1, .. }), "got {err:?}");
    assert!(err.is_retriable());

    publisher
        .publish(queues::CREATE_NOTIFICATION, json!({"title": "Welcome"}))
        .await
        .unwrap();
    assert_eq!(broker.queue_depth(queues::CREATE_NOTIFICATION), 1);
}

#[tokio::test]
async fn reply_listener_follows_a_reconnect_during_setup() {
    let harness = Harness::new();
    let (worker, _serving) = harness
        .spawn_worker(queues::OTP, otp_router(Arc::new(AtomicUsize::new(0))).await)
        .await;
    let connection = FaultyConnector::manager(&harness.broker, Fault::AfterReplyConsume);
    let client = ServiceClient::new(connection.clone(), ClientConfig::new("user-service"));

    let reply = client
        .call_with_timeout(queues::OTP, "verifyOTP", json!({"otp": "ab12cd"}), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(reply, json!({"valid": true}));
    assert_eq!(connection.generation(), 2);
    assert!(harness.broker.has_queue(client.reply_queue()));
    assert_eq!(client.stats().await.listener_generation, Some(2));
    worker.stop();
}
