use std::sync::Arc;

use tracing::{debug, warn};

use crate::broker::MessageProperties;
use crate::connection::ConnectionManager;
use crate::error::{RelayError, Result};
use crate::message::EventEnvelope;
use crate::topology::queues;

/// Fire-and-forget publisher for persistent events.
///
/// No reply is expected. Delivery is guaranteed only as far as the broker
/// accepted the message; a broker outage surfaces as an error right away
/// instead of queueing locally.
#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Declare `queue` if needed and publish `payload` as a persistent message
    pub async fn publish(&self, queue: &str, payload: impl serde::Serialize) -> Result<()> {
        let body = serde_json::to_vec(&payload)?;
        let channel = self.connection.acquire_channel().await?;
        self.connection
            .declare_on(&channel, &queues::descriptor(queue))
            .await?;

        channel
            .publish(queue, &body, MessageProperties::json().persistent())
            .await
            .map_err(|e| {
                if e.is_connection_level() {
                    warn!(queue, error = %e, "Connection dropped while publishing event");
                    RelayError::ConnectionFailure {
                        attempts: 1,
                        reason: e.to_string(),
                    }
                } else {
                    e
                }
            })?;

        debug!(queue, bytes = body.len(), "Published event");
        Ok(())
    }

    pub async fn publish_event(&self, event: &EventEnvelope) -> Result<()> {
        self.publish(&event.queue, &event.payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Channel, Connector, MemoryBroker};
    use crate::connection::ConnectionConfig;
    use futures_util::StreamExt;
    use serde_json::json;

    fn setup(broker: &MemoryBroker) -> Publisher {
        let config = ConnectionConfig {
            max_retries: 3,
            retry_delay_ms: 100,
            ..Default::default()
        };
        let connection = ConnectionManager::with_connector(config, Arc::new(broker.clone()));
        Publisher::new(Arc::new(connection))
    }

    #[tokio::test]
    async fn test_publish_declares_and_persists() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker);

        let event = EventEnvelope::new(
            queues::CREATE_NOTIFICATION,
            json!({"userId": "u1", "type": "welcome"}),
        )
        .unwrap();
        publisher.publish_event(&event).await.unwrap();

        assert_eq!(broker.queue_depth(queues::CREATE_NOTIFICATION), 1);

        let channel = broker.connect().await.unwrap();
        let mut stream = channel
            .consume(queues::CREATE_NOTIFICATION, "reader", true)
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(delivery.properties.persistent);
        assert!(delivery.properties.reply_to.is_none());
        let body: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(body["type"], "welcome");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_while_disconnected_fails_fast() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker);
        publisher
            .publish(queues::NOTIFICATION_PREFERENCES, json!({"email": true}))
            .await
            .unwrap();

        broker.disconnect();
        broker.set_available(false);

        let err = publisher
            .publish(queues::NOTIFICATION_PREFERENCES, json!({"email": false}))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ConnectionFailure { attempts: 3, .. }));
        assert_eq!(broker.queue_depth(queues::NOTIFICATION_PREFERENCES), 1);
    }
}
