use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Delivery, DeliveryStream, MessageProperties};
use crate::connection::ConnectionManager;
use crate::error::{RelayError, Result};
use crate::message::{ErrorDescriptor, ReplyEnvelope, RequestEnvelope};
use crate::rpc::{Request, RequestHandler};
use crate::topology::{queues, QueueDescriptor};

/// Code replied when a request body cannot be decoded
pub const MALFORMED_REQUEST: &str = "MALFORMED_REQUEST";

/// Configuration for a request worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix for consumer tags
    pub worker_name: String,
    /// Maximum concurrent message processing per queue
    pub max_concurrent: usize,
    /// Consecutive failed (re)subscriptions tolerated before `serve` gives up
    pub max_resubscribe_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: "relaymesh-worker".to_string(),
            max_concurrent: 100,
            max_resubscribe_attempts: 3,
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            ..Default::default()
        }
    }
}

/// Worker operational status
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum WorkerStatus {
    Starting,
    /// Consuming and processing messages
    Running,
    ShuttingDown,
    Stopped,
    Error(String),
}

/// How a delivery is settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    /// Put back on the queue for another attempt
    Requeue,
    /// Discard; redelivering would fail the same way
    Reject,
}

/// Stops every `serve` loop of the worker it came from
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Consumes request queues and answers each request on its reply address.
///
/// A request is acknowledged only after its reply was published. If the
/// handler panics or the reply cannot be sent, the request goes back on the
/// queue and another consumer may pick it up, so handlers must tolerate
/// seeing the same request twice.
pub struct Worker {
    config: WorkerConfig,
    connection: Arc<ConnectionManager>,
    shutdown: Arc<watch::Sender<bool>>,
    status: Arc<RwLock<WorkerStatus>>,
}

impl Worker {
    pub fn new(connection: Arc<ConnectionManager>, config: WorkerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            connection,
            shutdown: Arc::new(shutdown),
            status: Arc::new(RwLock::new(WorkerStatus::Starting)),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn stop(&self) {
        self.handle().stop();
    }

    pub async fn status(&self) -> WorkerStatus {
        self.status.read().await.clone()
    }

    /// Serve a well-known queue until stopped.
    ///
    /// Returns `Ok(())` after [`Worker::stop`], or an error once the
    /// connection cannot be re-established.
    pub async fn serve<H>(&self, queue: &str, handler: H) -> Result<()>
    where
        H: RequestHandler + 'static,
    {
        self.serve_queue(queues::descriptor(queue), Arc::new(handler))
            .await
    }

    /// Serve an explicitly described queue with a shared handler
    pub async fn serve_queue(
        &self,
        queue: QueueDescriptor,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut in_flight = JoinSet::new();
        let mut failed_subscriptions = 0;

        let result = loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }

            let mut stream = match self.subscribe(&queue).await {
                Ok(stream) => {
                    failed_subscriptions = 0;
                    stream
                }
                Err(e @ RelayError::ConnectionFailure { .. }) => break Err(e),
                Err(e) => {
                    failed_subscriptions += 1;
                    warn!(queue = %queue.name, attempt = failed_subscriptions, error = %e, "Subscription failed");
                    if failed_subscriptions >= self.config.max_resubscribe_attempts {
                        break Err(e);
                    }
                    continue;
                }
            };

            *self.status.write().await = WorkerStatus::Running;
            info!(queue = %queue.name, handler = handler.name(), "Worker consuming");

            let stopped = loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow_and_update() {
                            break true;
                        }
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    next = stream.next() => match next {
                        Some(Ok(delivery)) => {
                            let permit = match permits.clone().acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break true,
                            };
                            let handler = handler.clone();
                            let connection = self.connection.clone();
                            let queue_name = queue.name.clone();
                            in_flight.spawn(async move {
                                process_delivery(delivery, handler, connection, &queue_name).await;
                                drop(permit);
                            });
                        }
                        Some(Err(e)) => {
                            warn!(queue = %queue.name, error = %e, "Consumer stream failed");
                            break false;
                        }
                        None => {
                            warn!(queue = %queue.name, "Consumer stream ended, resubscribing");
                            break false;
                        }
                    }
                }
            };

            if stopped {
                break Ok(());
            }
        };

        *self.status.write().await = WorkerStatus::ShuttingDown;
        while in_flight.join_next().await.is_some() {}

        *self.status.write().await = match &result {
            Ok(()) => WorkerStatus::Stopped,
            Err(e) => WorkerStatus::Error(e.to_string()),
        };
        match &result {
            Ok(()) => info!(queue = %queue.name, "Worker stopped"),
            Err(e) => error!(queue = %queue.name, error = %e, "Worker giving up"),
        }
        result
    }

    async fn subscribe(&self, queue: &QueueDescriptor) -> Result<DeliveryStream> {
        let channel = self.connection.acquire_channel().await?;
        self.connection.declare_on(&channel, queue).await?;
        let consumer_tag = format!(
            "{}-{}-{}",
            self.config.worker_name,
            queue.name,
            Uuid::new_v4().simple()
        );
        channel.consume(&queue.name, &consumer_tag, false).await
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle one request delivery from decode to settlement
async fn process_delivery(
    delivery: Delivery,
    handler: Arc<dyn RequestHandler>,
    connection: Arc<ConnectionManager>,
    queue: &str,
) {
    let started = Instant::now();
    let correlation_id = delivery.properties.correlation_id.clone();
    let reply_to = delivery.properties.reply_to.clone();

    let envelope = match RequestEnvelope::from_bytes(&delivery.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(queue, error = %e, "Malformed request");
            let settlement = match (&reply_to, &correlation_id) {
                (Some(reply_to), Some(_)) => {
                    let reply = ReplyEnvelope::failure(ErrorDescriptor::new(MALFORMED_REQUEST, e.to_string()));
                    match send_reply(&connection, reply_to, correlation_id.as_deref(), &reply).await {
                        Ok(()) => Settlement::Ack,
                        Err(_) => Settlement::Reject,
                    }
                }
                _ => Settlement::Reject,
            };
            settle(&delivery, settlement).await;
            return;
        }
    };

    let action = envelope.action.clone();
    debug!(queue, action = %action, correlation_id = ?correlation_id, "Processing request");

    let request = Request {
        action: envelope.action,
        payload: envelope.payload,
        correlation_id: correlation_id.clone(),
        redelivered: delivery.redelivered,
    };
    let outcome = tokio::spawn(async move { handler.handle(request).await }).await;
    let processing_time_ms = started.elapsed().as_millis() as u64;

    let reply = match outcome {
        Ok(Ok(data)) => ReplyEnvelope::Success {
            data,
            processing_time_ms,
        },
        Ok(Err(failure)) => {
            debug!(queue, action = %action, code = %failure.code, "Handler reported failure");
            ReplyEnvelope::failure(failure.into())
        }
        Err(crash) => {
            error!(queue, action = %action, error = %crash, "Handler crashed, requeueing request");
            settle(&delivery, Settlement::Requeue).await;
            return;
        }
    };

    let Some(reply_to) = reply_to else {
        debug!(queue, action = %action, "Request without reply address, nothing to answer");
        settle(&delivery, Settlement::Ack).await;
        return;
    };

    match send_reply(&connection, &reply_to, correlation_id.as_deref(), &reply).await {
        Ok(()) => {
            settle(&delivery, Settlement::Ack).await;
            debug!(queue, action = %action, processing_time_ms, "Request answered");
        }
        Err(e) => {
            warn!(queue, action = %action, error = %e, "Reply not sent, requeueing request");
            settle(&delivery, Settlement::Requeue).await;
        }
    }
}

async fn send_reply(
    connection: &ConnectionManager,
    reply_to: &str,
    correlation_id: Option<&str>,
    reply: &ReplyEnvelope,
) -> Result<()> {
    let body = reply.to_bytes()?;
    let mut properties = MessageProperties::json();
    if let Some(correlation_id) = correlation_id {
        properties = properties.with_correlation_id(correlation_id);
    }
    let channel = connection.acquire_channel().await?;
    channel.publish(reply_to, &body, properties).await
}

async fn settle(delivery: &Delivery, settlement: Settlement) {
    let result = match settlement {
        Settlement::Ack => delivery.ack().await,
        Settlement::Requeue => delivery.nack(true).await,
        Settlement::Reject => delivery.nack(false).await,
    };
    // The broker requeues whatever a dead channel left unsettled
    if let Err(e) = result {
        warn!(?settlement, error = %e, "Failed to settle delivery");
    }
}
