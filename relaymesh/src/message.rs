//! JSON bodies exchanged over the broker.
//!
//! Correlation id and reply address travel as message properties, never in
//! these bodies.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

/// Body of an RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Operation the worker should run
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

impl RequestEnvelope {
    pub fn new(action: impl Into<String>, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(RelayError::malformed)
    }

    /// Deserialize payload to specific type
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(RelayError::malformed)
    }
}

/// Failure reported by a handler, delivered to the caller verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Machine readable code, e.g. `USER_NOT_FOUND`
    pub code: String,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Body of an RPC reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReplyEnvelope {
    /// Successful response
    Success {
        data: Value,
        /// Processing time in milliseconds
        #[serde(default)]
        processing_time_ms: u64,
    },
    /// Handler reported a failure
    Error { error: ErrorDescriptor },
}

impl ReplyEnvelope {
    pub fn success(data: impl Serialize, processing_time_ms: u64) -> Result<Self> {
        Ok(Self::Success {
            data: serde_json::to_value(data)?,
            processing_time_ms,
        })
    }

    pub fn failure(error: ErrorDescriptor) -> Self {
        Self::Error { error }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(RelayError::malformed)
    }

    /// Success data, or the handler's failure as [`RelayError::Remote`]
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Error { error } => Err(RelayError::Remote {
                code: error.code,
                message: error.message,
            }),
        }
    }
}

/// A durable, un-replied event
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub queue: String,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(queue: impl Into<String>, payload: impl Serialize) -> Result<Self> {
        Ok(Self {
            queue: queue.into(),
            payload: serde_json::to_value(payload)?,
        })
    }
}
