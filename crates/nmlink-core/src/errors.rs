//! Error types for the nmlink control core
//!
//! Transport and lookup failures are errors at the multiplexer level. A
//! terminal reporting `success: false` is not: that arrives as data inside a
//! [`ControlResponse`](crate::protocol::ControlResponse) and only becomes a
//! [`ControlError::RemoteFailure`] when the caller asks for it.

// ----------------------------------------------------------------------------
// Control Errors
// ----------------------------------------------------------------------------

/// Errors surfaced by the channel, the multiplexer and the transfer engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("Relay channel is not connected")]
    NotConnected,

    #[error("No pending request for correlation id {correlation_id}")]
    NoMatchingRequest { correlation_id: String },

    #[error("Remote failure in module {module}: {reason}")]
    RemoteFailure { module: String, reason: String },

    #[error("Request {correlation_id} timed out after {duration_ms}ms")]
    Timeout {
        correlation_id: String,
        duration_ms: u64,
    },

    #[error("Channel closed before a response arrived: {reason}")]
    ChannelClosed { reason: String },

    #[error("Transfer init rejected: {reason}")]
    InitFailure { reason: String },

    #[error("Chunk {chunk_index} failed {attempts} times, transfer abandoned")]
    ChunkRetryExhausted { chunk_index: u32, attempts: u32 },

    #[error("Completion notice failed: {reason}")]
    CompletionFailure { reason: String },

    #[error("Invalid device target: {0}")]
    InvalidTarget(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid command argument: {0}")]
    InvalidCommand(String),
}

impl ControlError {
    /// Create a channel-closed error
    pub fn channel_closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed {
            reason: reason.into(),
        }
    }

    /// Create an invalid frame error
    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::InvalidFrame(message.into())
    }

    /// Whether this error came from the transport rather than the terminal
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Timeout { .. } | Self::ChannelClosed { .. }
        )
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = core::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(ControlError::NotConnected.is_transport());
        assert!(ControlError::channel_closed("gone").is_transport());
        assert!(!ControlError::InitFailure {
            reason: "disk full".to_string()
        }
        .is_transport());
    }

    #[test]
    fn test_error_display() {
        let err = ControlError::ChunkRetryExhausted {
            chunk_index: 4,
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Chunk 4 failed 3 times, transfer abandoned"
        );
    }
}
