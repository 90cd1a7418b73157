//! Error types for the relay channel

use nmlink_core::ControlError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised while setting up or driving the relay connection
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid relay URL {url}: {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("Failed to connect to relay {url}: {source}")]
    ConnectionFailed {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Relay {url} did not open within {waited_ms}ms")]
    OpenTimeout { url: String, waited_ms: u64 },

    #[error("Relay channel has been shut down")]
    ShutDown,

    #[error(transparent)]
    Control(#[from] ControlError),
}

pub type Result<T> = core::result::Result<T, RelayError>;
