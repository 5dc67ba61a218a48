//! In-process broker with RabbitMQ-like delivery semantics.
//!
//! Queues are served round-robin to competing consumers, deliveries stay
//! unacked until settled, and unacked deliveries are requeued (flagged
//! `redelivered`) when their connection drops. Publishing to a queue that
//! does not exist drops the message, as the default exchange does.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Acknowledger, AutoAck, Channel, Connector, Delivery, DeliveryStream, ErrorCallback,
    MessageProperties,
};
use crate::error::{RelayError, Result};
use crate::topology::{QueueDescriptor, ReplySemantics};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    connection_id: u64,
    tag: String,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

struct MemoryQueue {
    descriptor: QueueDescriptor,
    /// Connection that owns an exclusive reply queue
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    declarations: usize,
}

struct Unacked {
    connection_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    next_connection_id: u64,
    next_delivery_tag: u64,
    connections: HashMap<u64, Vec<ErrorCallback>>,
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<u64, Unacked>,
}

impl BrokerState {
    /// Hand ready messages of `queue` to its live consumers
    fn pump(&mut self, queue: &str, broker: &Weak<Mutex<BrokerState>>) {
        let BrokerState {
            queues,
            unacked,
            next_delivery_tag,
            ..
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        loop {
            q.consumers.retain(|c| !c.tx.is_closed());
            if q.consumers.is_empty() {
                break;
            }
            let Some(message) = q.ready.pop_front() else {
                break;
            };

            let index = q.cursor % q.consumers.len();
            q.cursor = q.cursor.wrapping_add(1);
            let consumer = &q.consumers[index];

            let mut tag = None;
            let acker: Box<dyn Acknowledger> = if consumer.no_ack {
                Box::new(AutoAck)
            } else {
                *next_delivery_tag += 1;
                let delivery_tag = *next_delivery_tag;
                unacked.insert(
                    delivery_tag,
                    Unacked {
                        connection_id: consumer.connection_id,
                        queue: queue.to_string(),
                        message: message.clone(),
                    },
                );
                tag = Some(delivery_tag);
                Box::new(MemoryAcker {
                    broker: broker.clone(),
                    delivery_tag,
                })
            };

            let delivery = Delivery {
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
                acker,
            };

            if consumer.tx.send(Ok(delivery)).is_err() {
                debug!(consumer = %consumer.tag, "Consumer went away mid-delivery");
                if let Some(tag) = tag {
                    unacked.remove(&tag);
                }
                q.ready.push_front(message);
            }
        }
    }

    /// Tear down `dropped` connections and hand back their error callbacks
    fn drop_connections(
        &mut self,
        dropped: &[u64],
        broker: &Weak<Mutex<BrokerState>>,
    ) -> Vec<ErrorCallback> {
        let callbacks: Vec<ErrorCallback> = dropped
            .iter()
            .filter_map(|id| self.connections.remove(id))
            .flatten()
            .collect();

        self.queues
            .retain(|_, q| q.owner.map_or(true, |owner| !dropped.contains(&owner)));
        for q in self.queues.values_mut() {
            q.consumers.retain(|c| !dropped.contains(&c.connection_id));
        }

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| dropped.contains(&u.connection_id))
            .map(|(tag, _)| *tag)
            .collect();
        let mut orphaned: Vec<(u64, Unacked)> = tags
            .into_iter()
            .filter_map(|tag| self.unacked.remove(&tag).map(|u| (tag, u)))
            .collect();
        // Newest first so push_front restores publish order
        orphaned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, entry) in orphaned {
            self.requeue(entry, broker);
        }
        callbacks
    }

    fn requeue(&mut self, entry: Unacked, broker: &Weak<Mutex<BrokerState>>) {
        if let Some(q) = self.queues.get_mut(&entry.queue) {
            q.ready.push_front(StoredMessage {
                redelivered: true,
                ..entry.message
            });
            let name = entry.queue;
            self.pump(&name, broker);
        }
    }
}

/// In-process broker; cloning shares the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections
    pub fn set_available(&self, available: bool) {
        self.state.lock().refuse_connections = !available;
    }

    /// Drop every live connection as if the broker went away.
    ///
    /// Unacked deliveries are requeued, consumers are cancelled, exclusive
    /// queues are deleted and error callbacks fire.
    pub fn disconnect(&self) {
        let weak = Arc::downgrade(&self.state);
        let callbacks = {
            let mut state = self.state.lock();
            let dropped: Vec<u64> = state.connections.keys().copied().collect();
            let callbacks = state.drop_connections(&dropped, &weak);
            warn!(connections = dropped.len(), "Memory broker dropped all connections");
            callbacks
        };

        for mut callback in callbacks {
            callback(RelayError::Broker("connection reset by broker".to_string()));
        }
    }

    /// Messages waiting in `queue` that no consumer holds
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// How many times `queue` was declared against the broker
    pub fn declare_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.declarations)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>> {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return Err(RelayError::Broker("connection refused".to_string()));
        }
        state.next_connection_id += 1;
        let connection_id = state.next_connection_id;
        state.connections.insert(connection_id, Vec::new());

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            connection_id,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    connection_id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<()> {
        if state.connections.contains_key(&self.connection_id) {
            Ok(())
        } else {
            Err(RelayError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;

        match state.queues.get_mut(&queue.name) {
            Some(existing) => {
                if existing.descriptor != *queue {
                    return Err(RelayError::Broker(format!(
                        "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                        queue.name
                    )));
                }
                if existing.owner.is_some_and(|owner| owner != self.connection_id) {
                    return Err(RelayError::Broker(format!(
                        "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                        queue.name
                    )));
                }
                existing.declarations += 1;
            }
            None => {
                let owner = (queue.reply_semantics == ReplySemantics::Rpc).then_some(self.connection_id);
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        descriptor: queue.clone(),
                        owner,
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                        declarations: 1,
                    },
                );
            }
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], properties: MessageProperties) -> Result<()> {
        let weak = Arc::downgrade(&self.state);
        let mut state = self.state.lock();
        self.ensure_open(&state)?;

        match state.queues.get_mut(queue) {
            Some(q) => {
                q.ready.push_back(StoredMessage {
                    body: body.to_vec(),
                    properties,
                    redelivered: false,
                });
                state.pump(queue, &weak);
            }
            None => debug!(queue, "Unroutable message dropped"),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Result<DeliveryStream> {
        let weak = Arc::downgrade(&self.state);
        let mut state = self.state.lock();
        self.ensure_open(&state)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let q = state.queues.get_mut(queue).ok_or_else(|| {
            RelayError::Broker(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        q.consumers.push(ConsumerSlot {
            connection_id: self.connection_id,
            tag: consumer_tag.to_string(),
            no_ack,
            tx,
        });
        state.pump(queue, &weak);

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Box::pin(stream))
    }

    fn is_open(&self) -> bool {
        self.state.lock().connections.contains_key(&self.connection_id)
    }

    fn on_error(&self, mut callback: ErrorCallback) {
        let mut state = self.state.lock();
        if let Some(callbacks) = state.connections.get_mut(&self.connection_id) {
            callbacks.push(callback);
            return;
        }
        drop(state);
        callback(RelayError::ChannelClosed);
    }

    async fn close(&self) {
        let weak = Arc::downgrade(&self.state);
        // A deliberate close does not report an error
        let _callbacks = self.state.lock().drop_connections(&[self.connection_id], &weak);
        debug!(connection_id = self.connection_id, "Memory connection closed");
    }
}

struct MemoryAcker {
    broker: Weak<Mutex<BrokerState>>,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<()> {
        let state = self.broker.upgrade().ok_or(RelayError::ChannelClosed)?;
        let mut state = state.lock();
        let entry = state
            .unacked
            .remove(&self.delivery_tag)
            .ok_or(RelayError::ChannelClosed)?;
        if requeue {
            state.requeue(entry, &self.broker);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(requeue)
    }
}
