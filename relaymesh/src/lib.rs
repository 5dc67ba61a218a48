//! # RelayMesh - correlated request/reply over RabbitMQ
//!
//! RelayMesh gives a service four things on top of a single broker
//! connection:
//!
//! - [`ConnectionManager`]: one connection and channel, bounded retry,
//!   serialized reconnects and disconnect notifications
//! - [`ServiceClient`]: request/reply calls with correlation ids, a shared
//!   reply listener, timeouts and cancellation
//! - [`Worker`]: consumes request queues and acks only once the reply is out
//! - [`Publisher`]: persistent fire-and-forget events
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relaymesh::{ActionRouter, ClientConfig, ConnectionManager, ServiceClient, Worker, WorkerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Arc::new(ConnectionManager::new("amqp://localhost:5672"));
//!     connection.connect().await?;
//!
//!     let router = ActionRouter::new();
//!     router.register_function("verifyOTP", |req| async move {
//!         let otp = req.payload["otp"].as_str().unwrap_or_default().to_owned();
//!         Ok(serde_json::json!({ "valid": otp == "ab12cd" }))
//!     }).await;
//!
//!     let worker = Arc::new(Worker::new(connection.clone(), WorkerConfig::new("otp-service")));
//!     let serving = tokio::spawn({
//!         let worker = worker.clone();
//!         async move { worker.serve("otp_queue", router).await }
//!     });
//!
//!     let client = ServiceClient::new(connection, ClientConfig::new("user-service"));
//!     let reply = client.call("otp_queue", "verifyOTP", serde_json::json!({ "otp": "ab12cd" })).await?;
//!     assert_eq!(reply["valid"], true);
//!
//!     worker.stop();
//!     serving.await??;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod client;
pub mod connection;
pub mod error;
pub mod message;
pub mod pending;
pub mod publisher;
pub mod retry;
pub mod rpc;
pub mod service;
pub mod topology;

pub use broker::MemoryBroker;
pub use client::{ClientConfig, ClientStats, PendingReply, ServiceClient};
pub use connection::{
    ChannelHandle, ConnectionConfig, ConnectionManager, ConnectionStats, ConnectionStatus,
    DisconnectHandlerId,
};
pub use error::{RelayError, Result};
pub use message::{ErrorDescriptor, EventEnvelope, ReplyEnvelope, RequestEnvelope};
pub use publisher::Publisher;
pub use retry::{BoundedRetry, RetryExhausted};
pub use rpc::{ActionRouter, FunctionHandler, HandlerError, HandlerResult, Request, RequestHandler};
pub use service::{Worker, WorkerConfig, WorkerHandle, WorkerStatus};
pub use topology::{queues, QueueDescriptor, ReplySemantics};
