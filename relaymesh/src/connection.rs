use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::broker::{AmqpConnector, Channel, Connector};
use crate::error::{RelayError, Result};
use crate::retry::BoundedRetry;
use crate::topology::{QueueDescriptor, Topology};

/// Configuration for the broker connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// AMQP broker URL (e.g., "amqp://localhost:5672")
    pub url: String,
    /// Name reported to the broker for this connection
    pub connection_name: String,
    /// Connection attempts per (re)connect round before giving up
    pub max_retries: u32,
    /// Delay between retry attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Channel prefetch count for load balancing
    pub prefetch_count: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connection_name: "relaymesh".to_string(),
            max_retries: 5,
            retry_delay_ms: 1_000,
            prefetch_count: 10,
        }
    }
}

impl ConnectionConfig {
    pub fn retry_policy(&self) -> BoundedRetry {
        BoundedRetry::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

/// Lifecycle of the single broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Connection dropped; the next `acquire_channel` reconnects
    Reconnecting,
    /// The last retry round hit the attempt cap
    Failed,
}

/// Callback fired whenever an established connection drops
pub type DisconnectHandler = Arc<dyn Fn(&RelayError) + Send + Sync>;

/// Registration returned by [`ConnectionManager::on_disconnect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisconnectHandlerId(u64);

/// Borrowed access to the live channel.
///
/// Hold it for one operation only; a reconnect invalidates it.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<dyn Channel>,
    generation: u64,
}

impl ChannelHandle {
    /// Connection generation this channel belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for ChannelHandle {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

struct ConnectionState {
    status: ConnectionStatus,
    channel: Option<Arc<dyn Channel>>,
    retry_count: u32,
    last_error: Option<String>,
    /// Bumped on every successful (re)connect
    generation: u64,
    connected_since: Option<DateTime<Utc>>,
}

struct Shared {
    state: RwLock<ConnectionState>,
    disconnect_handlers: Mutex<Vec<(DisconnectHandlerId, DisconnectHandler)>>,
    next_handler_id: AtomicU64,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.status, status)
        };
        if previous != status {
            info!(from = ?previous, to = ?status, "Broker connection state changed");
        }
    }

    /// Mark generation `generation` as lost and notify listeners once
    fn connection_lost(&self, generation: u64, error: RelayError) {
        {
            let mut state = self.state.write();
            if state.generation != generation || state.status != ConnectionStatus::Connected {
                return;
            }
            state.status = ConnectionStatus::Reconnecting;
            state.channel = None;
            state.connected_since = None;
            state.last_error = Some(error.to_string());
        }
        warn!(generation, error = %error, "Broker connection lost");

        let handlers: Vec<DisconnectHandler> = self
            .disconnect_handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(&error);
        }
    }
}

/// Owns the single logical connection and channel to the broker.
///
/// Every other component asks for a [`ChannelHandle`] per operation.
/// Concurrent callers that find the connection down wait for one shared
/// reconnect instead of racing their own.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    reconnect: tokio::sync::Mutex<()>,
    topology: Topology,
}

impl ConnectionManager {
    /// Create a connection manager for an AMQP broker with default configuration
    pub fn new(url: impl Into<String>) -> Self {
        let config = ConnectionConfig {
            url: url.into(),
            ..Default::default()
        };
        Self::with_config(config)
    }

    /// Create a connection manager for an AMQP broker
    pub fn with_config(config: ConnectionConfig) -> Self {
        let connector = AmqpConnector::new(
            config.url.clone(),
            config.connection_name.clone(),
            config.prefetch_count,
        );
        Self::with_connector(config, Arc::new(connector))
    }

    /// Create a connection manager over any transport
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState {
                    status: ConnectionStatus::Disconnected,
                    channel: None,
                    retry_count: 0,
                    last_error: None,
                    generation: 0,
                    connected_since: None,
                }),
                disconnect_handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(0),
            }),
            reconnect: tokio::sync::Mutex::new(()),
            topology: Topology::new(),
        }
    }

    /// Startup connect. Callers treat an error here as fatal.
    pub async fn connect(&self) -> Result<()> {
        self.acquire_channel().await.map(|_| ())
    }

    /// Return a usable channel, (re)connecting first if necessary
    pub async fn acquire_channel(&self) -> Result<ChannelHandle> {
        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        let _reconnect = self.reconnect.lock().await;
        // Another caller may have finished reconnecting while we waited
        if let Some(handle) = self.current() {
            return Ok(handle);
        }
        self.establish().await
    }

    /// Register a callback invoked whenever the connection drops
    pub fn on_disconnect<F>(&self, handler: F) -> DisconnectHandlerId
    where
        F: Fn(&RelayError) + Send + Sync + 'static,
    {
        let id = DisconnectHandlerId(self.shared.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .disconnect_handlers
            .lock()
            .push((id, Arc::new(handler)));
        id
    }

    /// Drop a callback registered with [`on_disconnect`](Self::on_disconnect)
    pub fn remove_disconnect_handler(&self, id: DisconnectHandlerId) {
        self.shared
            .disconnect_handlers
            .lock()
            .retain(|(registered, _)| *registered != id);
    }

    /// Assert a queue on the current connection (idempotent)
    pub async fn declare(&self, queue: &QueueDescriptor) -> Result<()> {
        let channel = self.acquire_channel().await?;
        self.declare_on(&channel, queue).await
    }

    /// Assert a queue on a channel the caller already holds, so the queue
    /// and whatever the caller does next share one connection
    pub async fn declare_on(&self, channel: &ChannelHandle, queue: &QueueDescriptor) -> Result<()> {
        self.topology
            .declare(&**channel, channel.generation(), queue)
            .await
    }

    #[cfg(test)]
    pub(crate) fn disconnect_handler_count(&self) -> usize {
        self.shared.disconnect_handlers.lock().len()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state.read().status
    }

    pub fn generation(&self) -> u64 {
        self.shared.state.read().generation
    }

    /// Check if connection is healthy
    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    /// Get connection statistics for monitoring
    pub fn stats(&self) -> ConnectionStats {
        let state = self.shared.state.read();
        ConnectionStats {
            status: state.status,
            is_connected: state.status == ConnectionStatus::Connected
                && state.channel.as_ref().is_some_and(|c| c.is_open()),
            retry_count: state.retry_count,
            last_error: state.last_error.clone(),
            generation: state.generation,
            connected_since: state.connected_since,
            target: self.connector.describe(),
        }
    }

    fn current(&self) -> Option<ChannelHandle> {
        let state = self.shared.state.read();
        match (&state.status, &state.channel) {
            (ConnectionStatus::Connected, Some(channel)) if channel.is_open() => Some(ChannelHandle {
                channel: channel.clone(),
                generation: state.generation,
            }),
            _ => None,
        }
    }

    async fn establish(&self) -> Result<ChannelHandle> {
        // A channel that died without reporting an error is still a loss
        let stale = {
            let state = self.shared.state.read();
            match (&state.status, &state.channel) {
                (ConnectionStatus::Connected, Some(channel)) => {
                    Some((state.generation, channel.clone()))
                }
                _ => None,
            }
        };
        if let Some((generation, channel)) = stale {
            self.shared.connection_lost(generation, RelayError::ChannelClosed);
            // Release the broker connection under the dead channel
            channel.close().await;
        }

        let target = self.connector.describe();
        let result = self
            .config
            .retry_policy()
            .run("broker", |attempt| {
                let connector = self.connector.clone();
                let shared = self.shared.clone();
                let target = target.clone();
                async move {
                    shared.set_status(ConnectionStatus::Connecting);
                    shared.state.write().retry_count = attempt - 1;
                    debug!(target = %target, attempt, "Connecting to broker");

                    connector.connect().await.map_err(|e| {
                        shared.state.write().last_error = Some(e.to_string());
                        e
                    })
                }
            })
            .await;

        match result {
            Ok(channel) => {
                let generation = {
                    let mut state = self.shared.state.write();
                    state.generation += 1;
                    state.channel = Some(channel.clone());
                    state.retry_count = 0;
                    state.last_error = None;
                    state.connected_since = Some(Utc::now());
                    state.generation
                };
                self.shared.set_status(ConnectionStatus::Connected);

                let weak: Weak<Shared> = Arc::downgrade(&self.shared);
                channel.on_error(Box::new(move |error| {
                    if let Some(shared) = weak.upgrade() {
                        shared.connection_lost(generation, error);
                    }
                }));

                info!(target = %target, generation, "Connected to broker");
                Ok(ChannelHandle { channel, generation })
            }
            Err(exhausted) => {
                self.shared.set_status(ConnectionStatus::Failed);
                error!(
                    target = %target,
                    attempts = exhausted.attempts,
                    "Giving up on broker connection"
                );
                Err(RelayError::ConnectionFailure {
                    attempts: exhausted.attempts,
                    reason: exhausted.last_error.to_string(),
                })
            }
        }
    }
}

/// Connection statistics for monitoring
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionStats {
    pub status: ConnectionStatus,
    pub is_connected: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub generation: u64,
    pub connected_since: Option<DateTime<Utc>>,
    pub target: String,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeliveryStream, ErrorCallback, MemoryBroker, MessageProperties};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn manager(broker: &MemoryBroker, max_retries: u32) -> Arc<ConnectionManager> {
        let config = ConnectionConfig {
            max_retries,
            retry_delay_ms: 50,
            ..Default::default()
        };
        Arc::new(ConnectionManager::with_connector(config, Arc::new(broker.clone())))
    }

    /// Channel whose liveness the test flips without the broker noticing
    struct FlakyChannel {
        inner: Arc<dyn Channel>,
        open: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Channel for FlakyChannel {
        async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()> {
            self.inner.declare_queue(queue).await
        }

        async fn publish(&self, queue: &str, body: &[u8], properties: MessageProperties) -> Result<()> {
            self.inner.publish(queue, body, properties).await
        }

        async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Result<DeliveryStream> {
            self.inner.consume(queue, consumer_tag, no_ack).await
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst) && self.inner.is_open()
        }

        fn on_error(&self, callback: ErrorCallback) {
            self.inner.on_error(callback)
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    struct FlakyConnector {
        broker: MemoryBroker,
        open: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self) -> Result<Arc<dyn Channel>> {
            self.open.store(true, Ordering::SeqCst);
            Ok(Arc::new(FlakyChannel {
                inner: self.broker.connect().await?,
                open: self.open.clone(),
            }))
        }

        fn describe(&self) -> String {
            "flaky-memory://".to_string()
        }
    }

    #[tokio::test]
    async fn test_connect_transitions_to_connected() {
        let broker = MemoryBroker::new();
        let connection = manager(&broker, 3);
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);

        connection.connect().await.unwrap();

        assert_eq!(connection.status(), ConnectionStatus::Connected);
        assert_eq!(connection.generation(), 1);
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_shares_one_connect() {
        let broker = MemoryBroker::new();
        let connection = manager(&broker, 3);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let connection = connection.clone();
            tasks.push(tokio::spawn(async move { connection.acquire_channel().await.map(|c| c.generation()) }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 1);
        }
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retry_ceiling() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let connection = manager(&broker, 4);

        let err = connection.connect().await.unwrap_err();

        assert!(matches!(err, RelayError::ConnectionFailure { attempts: 4, .. }));
        assert_eq!(connection.status(), ConnectionStatus::Failed);
        assert!(connection.stats().last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_round_is_recoverable() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let connection = manager(&broker, 2);
        assert!(connection.acquire_channel().await.is_err());

        broker.set_available(true);
        let channel = connection.acquire_channel().await.unwrap();

        assert!(channel.is_open());
        assert_eq!(connection.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_and_reconnects_lazily() {
        let broker = MemoryBroker::new();
        let connection = manager(&broker, 3);
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        connection.on_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        connection.connect().await.unwrap();
        assert!(connection.stats().connected_since.is_some());

        broker.disconnect();

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(connection.status(), ConnectionStatus::Reconnecting);
        assert!(connection.stats().connected_since.is_none());

        let channel = connection.acquire_channel().await.unwrap();
        assert_eq!(channel.generation(), 2);
        assert_eq!(connection.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_silently_dead_channel_is_closed_on_reconnect() {
        let broker = MemoryBroker::new();
        let open = Arc::new(AtomicBool::new(true));
        let connector = FlakyConnector {
            broker: broker.clone(),
            open: open.clone(),
        };
        let connection = ConnectionManager::with_connector(ConnectionConfig::default(), Arc::new(connector));
        connection.connect().await.unwrap();
        assert_eq!(broker.connection_count(), 1);

        open.store(false, Ordering::SeqCst);
        let channel = connection.acquire_channel().await.unwrap();

        assert_eq!(channel.generation(), 2);
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_removed_disconnect_handler_is_not_called() {
        let broker = MemoryBroker::new();
        let connection = manager(&broker, 3);
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let id = connection.on_disconnect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        connection.connect().await.unwrap();

        connection.remove_disconnect_handler(id);
        broker.disconnect();

        assert_eq!(connection.disconnect_handler_count(), 0);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_declare_is_reasserted_after_reconnect() {
        let broker = MemoryBroker::new();
        let connection = manager(&broker, 3);
        let queue = QueueDescriptor::durable("otp_queue");

        connection.declare(&queue).await.unwrap();
        connection.declare(&queue).await.unwrap();
        assert_eq!(broker.declare_count("otp_queue"), 1);

        broker.disconnect();
        connection.declare(&queue).await.unwrap();
        assert_eq!(broker.declare_count("otp_queue"), 2);
    }
}
