use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::message::ErrorDescriptor;

/// Code replied when no handler is registered for an action
pub const ACTION_NOT_FOUND: &str = "ACTION_NOT_FOUND";
/// Code replied when a payload does not have the expected shape
pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Business failure returned by a handler.
///
/// Travels back to the caller as an error reply and surfaces there as
/// [`RelayError::Remote`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(INVALID_PAYLOAD, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl From<HandlerError> for ErrorDescriptor {
    fn from(error: HandlerError) -> Self {
        ErrorDescriptor::new(error.code, error.message)
    }
}

/// Lets handlers that call other services use `?` on client results
impl From<RelayError> for HandlerError {
    fn from(error: RelayError) -> Self {
        match error {
            RelayError::Remote { code, message } => Self::new(code, message),
            RelayError::Malformed { reason } => Self::invalid_payload(reason),
            other => Self::internal(other.to_string()),
        }
    }
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// A decoded request as seen by a handler
#[derive(Debug, Clone)]
pub struct Request {
    pub action: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    /// The broker delivered this request before; the handler may see it twice
    pub redelivered: bool,
}

impl Request {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
            correlation_id: None,
            redelivered: false,
        }
    }

    /// Deserialize payload to specific type
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| HandlerError::invalid_payload(e.to_string()))
    }
}

/// Trait for implementing request handlers
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request; the returned value becomes the reply's data
    async fn handle(&self, request: Request) -> HandlerResult;

    /// Get handler name for debugging
    fn name(&self) -> &str {
        "RequestHandler"
    }
}

/// Simple function-based handler
pub struct FunctionHandler<F> {
    name: String,
    handler: F,
}

impl<F> FunctionHandler<F> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for FunctionHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, request: Request) -> HandlerResult {
        (self.handler)(request).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Dispatches requests to per-action handlers.
///
/// One queue can carry several actions (`storeOTP` and `verifyOTP` share
/// `otp_queue`); the router picks the handler by the request's `action`.
#[derive(Default)]
pub struct ActionRouter {
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a specific action
    pub async fn register<H>(&self, action: impl Into<String>, handler: H)
    where
        H: RequestHandler + 'static,
    {
        let action = action.into();
        self.handlers
            .write()
            .await
            .insert(action.clone(), Arc::new(handler));
        info!(action = %action, "Registered handler");
    }

    /// Register a function-based handler
    pub async fn register_function<F, Fut>(&self, action: impl Into<String>, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let action = action.into();
        let handler = FunctionHandler::new(action.clone(), handler);
        self.register(action, handler).await;
    }

    /// Registered action names, sorted
    pub async fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        actions.sort();
        actions
    }
}

#[async_trait]
impl RequestHandler for ActionRouter {
    async fn handle(&self, request: Request) -> HandlerResult {
        let handler = self.handlers.read().await.get(&request.action).cloned();
        match handler {
            Some(handler) => handler.handle(request).await,
            None => {
                warn!(action = %request.action, "No handler found for action");
                Err(HandlerError::new(
                    ACTION_NOT_FOUND,
                    format!("No handler registered for action: {}", request.action),
                ))
            }
        }
    }

    fn name(&self) -> &str {
        "ActionRouter"
    }
}

impl std::fmt::Debug for ActionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRouter").finish_non_exhaustive()
    }
}
