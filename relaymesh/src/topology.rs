//! Queue descriptors and the idempotent declaration registry.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use tracing::debug;

use crate::broker::Channel;
use crate::error::{RelayError, Result};

/// Whether a queue carries replies for a request/reply client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySemantics {
    None,
    /// Private reply queue: exclusive to its connection, deleted with it
    Rpc,
}

/// Immutable description of a queue this service depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub reply_semantics: ReplySemantics,
}

impl QueueDescriptor {
    /// Queue that survives a broker restart
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            reply_semantics: ReplySemantics::None,
        }
    }

    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            reply_semantics: ReplySemantics::None,
        }
    }

    /// Reply queue owned by a single client connection
    pub fn reply(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            reply_semantics: ReplySemantics::Rpc,
        }
    }
}

/// The fixed set of queues shared with sibling services.
pub mod queues {
    use super::QueueDescriptor;

    pub const OTP: &str = "otp_queue";
    pub const STORE_OTP: &str = "store_otp_queue";
    pub const VERIFY_OTP: &str = "verify_otp_queue";
    pub const GET_USER_BY_ID: &str = "get_user_by_id_queue";
    pub const USER_INFO: &str = "user_info_queue";
    pub const NOTIFICATION: &str = "notification_queue";
    pub const CREATE_NOTIFICATION: &str = "create_notification_queue";
    pub const NOTIFICATION_PREFERENCES: &str = "notification_preferences_queue";
    pub const GET_ALLOW_NOTIFICATION_PREFERENCES: &str = "get_allow_notification_preferences_queue";

    /// Descriptor for a well-known queue name; unknown names default to durable
    pub fn descriptor(name: &str) -> QueueDescriptor {
        match name {
            GET_USER_BY_ID | USER_INFO => QueueDescriptor::transient(name),
            _ => QueueDescriptor::durable(name),
        }
    }

    pub fn all() -> Vec<QueueDescriptor> {
        [
            OTP,
            STORE_OTP,
            VERIFY_OTP,
            GET_USER_BY_ID,
            USER_INFO,
            NOTIFICATION,
            CREATE_NOTIFICATION,
            NOTIFICATION_PREFERENCES,
            GET_ALLOW_NOTIFICATION_PREFERENCES,
        ]
        .into_iter()
        .map(descriptor)
        .collect()
    }
}

#[derive(Debug, Default)]
struct Declared {
    /// Connection generation the `asserted` set belongs to
    generation: u64,
    /// Every descriptor ever declared, used for conflict detection
    known: HashMap<String, QueueDescriptor>,
    /// Queues asserted on the current connection
    asserted: HashSet<String>,
}

/// Registry that asserts each queue once per connection generation.
///
/// Declaration is serialized, so concurrent declarations of the same queue
/// from a client and a worker resolve to a single broker round trip.
#[derive(Debug, Default)]
pub struct Topology {
    declared: Mutex<Declared>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert `queue` on `channel`; a no-op if already asserted in `generation`
    pub async fn declare(
        &self,
        channel: &dyn Channel,
        generation: u64,
        queue: &QueueDescriptor,
    ) -> Result<()> {
        let mut declared = self.declared.lock().await;

        if declared.generation != generation {
            declared.generation = generation;
            declared.asserted.clear();
        }

        if let Some(existing) = declared.known.get(&queue.name) {
            if existing != queue {
                return Err(RelayError::TopologyConflict {
                    queue: queue.name.clone(),
                });
            }
            if declared.asserted.contains(&queue.name) {
                return Ok(());
            }
        }

        channel.declare_queue(queue).await?;
        debug!(queue = %queue.name, durable = queue.durable, generation, "Declared queue");

        declared.known.insert(queue.name.clone(), queue.clone());
        declared.asserted.insert(queue.name.clone());
        Ok(())
    }

    /// Whether `name` has been asserted on the given connection generation
    #[cfg(test)]
    pub(crate) async fn is_declared(&self, name: &str, generation: u64) -> bool {
        let declared = self.declared.lock().await;
        declared.generation == generation && declared.asserted.contains(name)
    }
}
