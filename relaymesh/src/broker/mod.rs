//! Broker transport seam.
//!
//! The connection manager and everything above it speak to the broker
//! through [`Connector`] and [`Channel`]. `amqp` implements them over lapin,
//! `memory` is an in-process broker with RabbitMQ-like delivery semantics.

pub mod amqp;
pub mod memory;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::error::{RelayError, Result};
use crate::topology::QueueDescriptor;

pub use amqp::{AmqpChannel, AmqpConnector};
pub use memory::MemoryBroker;

/// Content type stamped on every message the core publishes
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Broker-native metadata carried next to the JSON body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Links a reply to the request that caused it
    pub correlation_id: Option<String>,
    /// Queue the handler must publish its reply to
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    /// Broker keeps the message across a restart until acknowledged
    pub persistent: bool,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Acker for deliveries consumed in auto-ack mode
pub struct AutoAck;

#[async_trait]
impl Acknowledger for AutoAck {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// One message handed to a consumer
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Set when the broker delivered this message before
    pub redelivered: bool,
    pub acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer; ends when the channel goes away
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Callback fired when the underlying connection reports an error
pub type ErrorCallback = Box<dyn FnMut(RelayError) + Send + 'static>;

/// An open channel on a live broker connection
#[async_trait]
pub trait Channel: Send + Sync {
    /// Assert a queue; repeating an identical declaration is a no-op
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()>;

    /// Publish to a queue through the default exchange
    async fn publish(&self, queue: &str, body: &[u8], properties: MessageProperties) -> Result<()>;

    /// Start a consumer on a queue
    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Result<DeliveryStream>;

    fn is_open(&self) -> bool;

    /// Register a callback invoked once when the connection fails
    fn on_error(&self, callback: ErrorCallback);

    /// Close the channel and the connection under it. Safe to call on a
    /// channel that is already dead.
    async fn close(&self);
}

/// Opens connections to a broker
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Channel>>;

    /// Human readable target, used in logs
    fn describe(&self) -> String;
}
