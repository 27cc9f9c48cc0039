//! Error types for the Redis bridge core

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the bridge core
#[derive(Debug, Error)]
pub enum Error {
    /// The pub/sub service could not be reached while opening a session
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection {
        /// Endpoint that was dialled (e.g. "redis://localhost:6379/0")
        endpoint: String,
        /// Failure reason reported by the transport
        reason: String,
    },

    /// Missing or invalid configuration option
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Timeout action outside the enumeration supported by the bridge mode
    #[error("Unhandled timeout action: {action} (supported for {mode}: {supported})")]
    UnhandledPolicy {
        /// The configured action
        action: String,
        /// Bridge mode the action was configured for
        mode: String,
        /// Comma-separated list of supported actions
        supported: String,
    },

    /// Reply payload (or configured encoding tag) is not understood by the converter
    #[error("Unsupported format '{format}': {reason}")]
    UnsupportedFormat {
        /// Encoding tag or payload kind
        format: String,
        /// What went wrong while decoding
        reason: String,
    },

    /// Transport failure after the session was opened
    #[error("Transport error: {0}")]
    Transport(String),

    /// A second call was started while a listener is still armed
    #[error("Call already in progress on session for channel '{0}'")]
    CallInProgress(String),

    /// The listener task ended without delivering a reply
    #[error("Listener terminated without reply: {0}")]
    ListenerTerminated(String),

    /// Invalid record data handed to a node
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build an `UnsupportedFormat` error
    pub fn unsupported(format: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::UnsupportedFormat {
            format: format.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error leaves the session usable for the next item
    ///
    /// Only resource-acquisition and configuration failures abort a run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::ConfigError(_) | Error::UnhandledPolicy { .. }
        )
    }
}
