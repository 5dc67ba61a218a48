use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Delivery, DeliveryStream, MessageProperties};
use crate::connection::{ChannelHandle, ConnectionManager, DisconnectHandlerId};
use crate::error::{RelayError, Result};
use crate::message::{ReplyEnvelope, RequestEnvelope};
use crate::pending::{CallOutcome, PendingCalls};
use crate::topology::QueueDescriptor;

/// Configuration for a request/reply client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Prefix of the private reply queue and of log lines
    pub client_name: String,
    /// Timeout used by [`ServiceClient::call`]
    pub default_timeout: Duration,
    /// How often overdue calls nobody is waiting on are swept
    pub sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "relaymesh-client".to_string(),
            default_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            ..Default::default()
        }
    }
}

struct Listener {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Tasks {
    listener: Option<Listener>,
    sweeper: Option<JoinHandle<()>>,
}

struct ClientInner {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    reply_queue: String,
    pending: PendingCalls,
    tasks: Mutex<Tasks>,
    disconnect_handler: DisconnectHandlerId,
}

impl ClientInner {
    fn dispatch(&self, delivery: Delivery) {
        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            warn!(client = %self.config.client_name, "Discarding reply without correlation id");
            return;
        };

        let outcome: CallOutcome =
            ReplyEnvelope::from_bytes(&delivery.body).and_then(ReplyEnvelope::into_result);
        if let Err(RelayError::Malformed { reason }) = &outcome {
            warn!(correlation_id, reason = %reason, "Received undecodable reply");
        }

        if self.pending.resolve(correlation_id, outcome) {
            debug!(correlation_id, "Reply delivered");
        } else {
            debug!(correlation_id, "Discarding stale or duplicate reply");
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.connection
            .remove_disconnect_handler(self.disconnect_handler);
        let tasks = self.tasks.get_mut();
        if let Some(listener) = tasks.listener.take() {
            listener.task.abort();
        }
        if let Some(sweeper) = tasks.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Client for calling request/reply workers over the broker.
///
/// Every call gets a fresh correlation id and waits on a private reply
/// queue shared by all calls of this client. One listener task consumes that
/// queue and hands each reply to the call it belongs to; replies nobody is
/// waiting for are dropped. When the connection drops, every outstanding
/// call fails with [`RelayError::ConnectionLost`].
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use relaymesh::{ClientConfig, ConnectionManager, ServiceClient};
/// # async fn demo() -> relaymesh::Result<()> {
/// let connection = Arc::new(ConnectionManager::new("amqp://localhost:5672"));
/// let client = ServiceClient::new(connection, ClientConfig::new("user-service"));
/// let reply = client
///     .call("otp_queue", "verifyOTP", serde_json::json!({"otp": "ab12cd"}))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServiceClient {
    inner: Arc<ClientInner>,
}

impl ServiceClient {
    /// Create a client on top of a shared connection.
    ///
    /// Nothing is declared or consumed until the first call.
    pub fn new(connection: Arc<ConnectionManager>, config: ClientConfig) -> Self {
        let reply_queue = format!("{}.replies.{}", config.client_name, Uuid::new_v4().simple());
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let weak = weak.clone();
            let disconnect_handler = connection.on_disconnect(move |_| {
                if let Some(inner) = weak.upgrade() {
                    let failed = inner.pending.fail_all(|| RelayError::ConnectionLost);
                    if failed > 0 {
                        warn!(
                            client = %inner.config.client_name,
                            failed,
                            "Failed pending calls after connection loss"
                        );
                    }
                }
            });
            ClientInner {
                config,
                connection,
                reply_queue,
                pending: PendingCalls::new(),
                tasks: Mutex::new(Tasks::default()),
                disconnect_handler,
            }
        });

        info!(client = %inner.config.client_name, reply_queue = %inner.reply_queue, "Created service client");
        Self { inner }
    }

    /// Call `action` on the worker behind `queue` with the default timeout
    pub async fn call(
        &self,
        queue: &str,
        action: &str,
        payload: impl serde::Serialize,
    ) -> Result<Value> {
        self.call_with_timeout(queue, action, payload, self.inner.config.default_timeout)
            .await
    }

    /// Call with custom timeout
    pub async fn call_with_timeout(
        &self,
        queue: &str,
        action: &str,
        payload: impl serde::Serialize,
        timeout: Duration,
    ) -> Result<Value> {
        self.send(queue, action, payload, timeout).await?.wait().await
    }

    /// Publish a request and return a handle to its reply.
    ///
    /// Dropping the handle cancels the call.
    pub async fn send(
        &self,
        queue: &str,
        action: &str,
        payload: impl serde::Serialize,
        timeout: Duration,
    ) -> Result<PendingReply> {
        let body = RequestEnvelope::new(action, payload)?.to_bytes()?;
        let mut channel = self.ensure_listener().await?;
        // The connection dropped while the listener was being set up
        if !channel.is_open() {
            channel = self.ensure_listener().await?;
        }

        let (correlation_id, deadline, outcome) = self.inner.pending.register(timeout);
        let reply = PendingReply {
            inner: self.inner.clone(),
            correlation_id,
            deadline,
            timeout,
            outcome: Some(outcome),
        };

        let properties = MessageProperties::json()
            .with_correlation_id(reply.correlation_id.clone())
            .with_reply_to(self.inner.reply_queue.clone());
        channel
            .publish(queue, &body, properties)
            .await
            .map_err(|e| {
                if e.is_connection_level() {
                    warn!(queue, error = %e, "Connection dropped while sending request");
                    RelayError::ConnectionLost
                } else {
                    e
                }
            })?;

        debug!(
            client = %self.inner.config.client_name,
            queue,
            action,
            correlation_id = %reply.correlation_id,
            "Sent request"
        );
        Ok(reply)
    }

    /// Cancel a pending call; its waiter sees [`RelayError::Cancelled`]
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.inner.pending.cancel(correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Check if client is connected and healthy
    pub fn is_healthy(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Get client statistics
    pub async fn stats(&self) -> ClientStats {
        let listener_generation = self
            .inner
            .tasks
            .lock()
            .await
            .listener
            .as_ref()
            .filter(|l| !l.task.is_finished())
            .map(|l| l.generation);

        ClientStats {
            client_name: self.inner.config.client_name.clone(),
            reply_queue: self.inner.reply_queue.clone(),
            pending_calls: self.inner.pending.len(),
            default_timeout_ms: self.inner.config.default_timeout.as_millis() as u64,
            listener_generation,
            connection: self.inner.connection.stats(),
        }
    }

    /// Make sure exactly one reply listener runs on the current connection
    /// and return the channel it consumes on
    async fn ensure_listener(&self) -> Result<ChannelHandle> {
        let mut tasks = self.inner.tasks.lock().await;
        let channel = self.inner.connection.acquire_channel().await?;
        let generation = channel.generation();

        if let Some(listener) = &tasks.listener {
            if listener.generation == generation && !listener.task.is_finished() {
                return Ok(channel);
            }
        }
        if let Some(stale) = tasks.listener.take() {
            stale.task.abort();
        }

        self.inner
            .connection
            .declare_on(&channel, &QueueDescriptor::reply(self.inner.reply_queue.clone()))
            .await?;
        let consumer_tag = format!("{}-replies-{}", self.inner.config.client_name, generation);
        let stream = channel
            .consume(&self.inner.reply_queue, &consumer_tag, true)
            .await?;

        let task = tokio::spawn(listen(Arc::downgrade(&self.inner), stream, generation));
        tasks.listener = Some(Listener { generation, task });
        debug!(client = %self.inner.config.client_name, generation, "Reply listener started");

        if tasks.sweeper.is_none() {
            let interval = self.inner.config.sweep_interval;
            tasks.sweeper = Some(tokio::spawn(sweep(Arc::downgrade(&self.inner), interval)));
        }
        Ok(channel)
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("client_name", &self.inner.config.client_name)
            .field("reply_queue", &self.inner.reply_queue)
            .field("pending_calls", &self.inner.pending.len())
            .finish()
    }
}

async fn listen(client: Weak<ClientInner>, mut stream: DeliveryStream, generation: u64) {
    while let Some(next) = stream.next().await {
        let Some(inner) = client.upgrade() else {
            return;
        };
        match next {
            Ok(delivery) => inner.dispatch(delivery),
            Err(e) => {
                warn!(error = %e, generation, "Reply stream failed");
                break;
            }
        }
    }

    // Calls registered on a newer connection belong to a newer listener
    let Some(inner) = client.upgrade() else {
        return;
    };
    if inner.connection.generation() == generation {
        let failed = inner.pending.fail_all(|| RelayError::ConnectionLost);
        warn!(
            client = %inner.config.client_name,
            generation,
            failed,
            "Reply listener stopped"
        );
    }
}

async fn sweep(client: Weak<ClientInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let Some(inner) = client.upgrade() else {
            return;
        };
        let expired = inner.pending.expire_overdue(Instant::now());
        if expired > 0 {
            debug!(client = %inner.config.client_name, expired, "Cleaned up expired calls");
        }
    }
}

/// Handle to one in-flight call.
///
/// The pending entry is removed when the handle is dropped, whichever way
/// the call ends.
pub struct PendingReply {
    inner: Arc<ClientInner>,
    correlation_id: String,
    deadline: Instant,
    timeout: Duration,
    outcome: Option<tokio::sync::oneshot::Receiver<CallOutcome>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the reply, the deadline, or whatever ends the call first
    pub async fn wait(mut self) -> Result<Value> {
        let Some(mut outcome) = self.outcome.take() else {
            return Err(RelayError::Cancelled);
        };
        let timeout_ms = self.timeout.as_millis() as u64;

        match tokio::time::timeout_at(self.deadline, &mut outcome).await {
            Ok(Ok(result)) => result,
            // The slot is dropped only together with its map entry
            Ok(Err(_)) => Err(RelayError::ConnectionLost),
            Err(_) => {
                if self.inner.pending.remove(&self.correlation_id) {
                    debug!(correlation_id = %self.correlation_id, timeout_ms, "Call timed out");
                    return Err(RelayError::Timeout { timeout_ms });
                }
                // Resolved between the deadline firing and the removal
                outcome
                    .try_recv()
                    .unwrap_or(Err(RelayError::Timeout { timeout_ms }))
            }
        }
    }

    /// Give up on the call without waiting
    pub fn cancel(self) {
        if self.inner.pending.remove(&self.correlation_id) {
            debug!(correlation_id = %self.correlation_id, "Call cancelled");
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.correlation_id);
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Client statistics for monitoring
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientStats {
    pub client_name: String,
    pub reply_queue: String,
    pub pending_calls: usize,
    pub default_timeout_ms: u64,
    /// Connection generation the reply listener is bound to, if running
    pub listener_generation: Option<u64>,
    pub connection: crate::connection::ConnectionStats,
}
