//! lapin-backed transport.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Connection, ConnectionProperties,
};
use tracing::debug;

use super::{Acknowledger, Channel, Connector, Delivery, DeliveryStream, ErrorCallback, MessageProperties};
use crate::error::{RelayError, Result};
use crate::topology::{QueueDescriptor, ReplySemantics};

/// AMQP 0.9.1 delivery mode for messages the broker must write to disk
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// AMQP reply code for a normal shutdown
const REPLY_SUCCESS: u16 = 200;

/// Opens one lapin connection plus one channel per `connect()`
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
    connection_name: String,
    prefetch_count: u16,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>, connection_name: impl Into<String>, prefetch_count: u16) -> Self {
        Self {
            url: url.into(),
            connection_name: connection_name.into(),
            prefetch_count,
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Channel>> {
        debug!(url = %self.url, "Opening AMQP connection");

        let connection = Connection::connect(
            &self.url,
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into()),
        )
        .await?;

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await?;

        debug!(channel_id = channel.id(), "AMQP channel open");
        Ok(Arc::new(AmqpChannel { connection, channel }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// A lapin channel together with the connection that owns it
pub struct AmqpChannel {
    connection: Connection,
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()> {
        let rpc_reply = queue.reply_semantics == ReplySemantics::Rpc;
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: rpc_reply,
                    auto_delete: rpc_reply,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], properties: MessageProperties) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(&properties),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let stream = consumer.map(move |delivery| -> Result<Delivery> {
            let delivery = delivery?;
            let acker: Box<dyn Acknowledger> = if no_ack {
                Box::new(super::AutoAck)
            } else {
                Box::new(LapinAcker(delivery.acker))
            };
            Ok(Delivery {
                properties: from_basic_properties(&delivery.properties),
                redelivered: delivery.redelivered,
                acker,
                body: delivery.data,
            })
        });
        Ok(Box::pin(stream))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn on_error(&self, mut callback: ErrorCallback) {
        self.connection
            .on_error(move |error| callback(RelayError::Amqp(error)));
    }

    async fn close(&self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "superseded").await {
                debug!(error = %e, "Closing AMQP channel failed");
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(REPLY_SUCCESS, "superseded").await {
                debug!(error = %e, "Closing AMQP connection failed");
            }
        }
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.clone().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.clone().into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: basic.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: basic.reply_to().as_ref().map(|s| s.as_str().to_string()),
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        persistent: *basic.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
    }
}
