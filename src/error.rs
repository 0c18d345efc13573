use std::time::Duration;

use thiserror::Error;

/// Errors produced by the bus runtime.
///
/// Every variant carries owned strings so the error is `Clone`: a single
/// failed declaration is handed to every caller waiting on the same
/// memoized topology operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Transient broker connection failure. Drives retry/backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// Every configured endpoint failed during the initial connect.
    #[error("connection '{name}' failed after {attempts} attempts: {last_error}")]
    ConnectionExhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },

    /// Declaring or checking an exchange, queue or binding failed.
    #[error("failed to define {entity}: {reason}")]
    Declaration { entity: String, reason: String },

    /// The entity a check targeted does not exist on the broker.
    #[error("{0} does not exist")]
    NotFound(String),

    /// A publish was not confirmed within its timeout.
    #[error("publish to '{exchange}' timed out after {timeout:?}")]
    PublishTimeout { exchange: String, timeout: Duration },

    /// The broker refused a publish (nack or channel error).
    #[error("publish to '{exchange}' rejected: {reason}")]
    PublishRejected { exchange: String, reason: String },

    /// Channel-level failure.
    #[error("channel error: {0}")]
    Channel(String),

    /// A non-deferrable operation hit a resource that is not ready.
    #[error("{0} is not ready")]
    NotReady(String),

    /// The connection is closed and no connect is pending.
    #[error("connection '{0}' is closed")]
    Closed(String),

    /// The target was destroyed and cannot be used again.
    #[error("{0} has been destroyed")]
    Destroyed(String),

    /// The broker rejected an ack, nack or reject call.
    #[error("acknowledgement failed: {0}")]
    Ack(String),

    /// A consumer handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization of configuration failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An internal actor went away before answering.
    #[error("internal channel closed: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        // ---
        BusError::Serialization(err.to_string())
    }
}

impl BusError {
    /// Whether a retry may succeed without any configuration change.
    pub fn is_transient(&self) -> bool {
        // ---
        matches!(
            self,
            BusError::Connection(_) | BusError::Channel(_) | BusError::NotReady(_)
        )
    }
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;
