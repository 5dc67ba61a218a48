use thiserror::Error;

/// Result type alias for relaymesh operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error kinds surfaced by the messaging core.
///
/// Every failed `call()` resolves to exactly one of these, so callers can
/// decide whether a retry makes sense (see [`RelayError::is_retriable`]).
#[derive(Error, Debug)]
pub enum RelayError {
    /// Broker unreachable after the bounded retry policy gave up
    #[error("broker connection failed after {attempts} attempts: {reason}")]
    ConnectionFailure { attempts: u32, reason: String },

    /// Connection dropped while a call was waiting for its reply
    #[error("connection lost before a reply arrived")]
    ConnectionLost,

    /// No reply within the call deadline
    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The handler on the other side reported a failure
    #[error("remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    /// A message body could not be decoded
    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    /// The pending call was cancelled by its owner
    #[error("call cancelled")]
    Cancelled,

    /// A queue was redeclared with different properties
    #[error("queue '{queue}' already declared with different properties")]
    TopologyConflict { queue: String },

    /// The channel used for an operation is no longer open
    #[error("channel closed")]
    ChannelClosed,

    /// Broker refused an operation (non-AMQP transports)
    #[error("broker error: {0}")]
    Broker(String),

    /// Errors reported by the AMQP client
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Payload serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn malformed<T: ToString>(reason: T) -> Self {
        Self::Malformed {
            reason: reason.to_string(),
        }
    }

    /// Whether the caller may reasonably retry the same call.
    ///
    /// Remote errors are business failures and are not retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ConnectionLost
                | Self::ConnectionFailure { .. }
                | Self::ChannelClosed
        )
    }

    /// The channel or connection an operation ran on went away under it
    pub(crate) fn is_connection_level(&self) -> bool {
        match self {
            Self::ConnectionLost | Self::ChannelClosed => true,
            Self::Amqp(e) => matches!(
                e,
                lapin::Error::IOError(_)
                    | lapin::Error::InvalidChannelState(_)
                    | lapin::Error::InvalidConnectionState(_)
            ),
            _ => false,
        }
    }

    /// HTTP status an API layer should answer with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 504,
            Self::ConnectionLost | Self::ConnectionFailure { .. } | Self::ChannelClosed => 503,
            Self::Remote { code, .. } if code.ends_with("NOT_FOUND") => 404,
            Self::Remote { .. } => 422,
            Self::Malformed { .. } => 502,
            _ => 500,
        }
    }
}
