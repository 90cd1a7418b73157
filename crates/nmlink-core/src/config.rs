//! Console configuration
//!
//! The relay address and reconnect delay drive the channel manager; the chunk
//! settings drive the transfer engine; the request settings drive the
//! multiplexer's optional deadlines.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ControlError, Result};

/// Default relay endpoint exposed by the console backend
pub const DEFAULT_RELAY_ADDRESS: &str = "ws://127.0.0.1:8000/ws/data/";

// ----------------------------------------------------------------------------
// Console Configuration
// ----------------------------------------------------------------------------

/// Configuration for one console connection to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// WebSocket URL of the relay
    pub relay_address: String,
    /// Delay before retrying a lost channel
    pub reconnect_delay_ms: u64,
    /// Size of each transfer slice
    pub chunk_size_bytes: usize,
    /// Consecutive failures tolerated per chunk
    pub max_chunk_retries: u32,
    /// Deadline applied to every correlated request (None = wait forever)
    pub request_timeout_ms: Option<u64>,
    /// How often expired requests are swept
    pub sweep_interval_ms: u64,
    /// Fail every pending request when the channel drops
    pub drain_pending_on_close: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            relay_address: DEFAULT_RELAY_ADDRESS.to_string(),
            reconnect_delay_ms: 5000,
            chunk_size_bytes: 1024,
            max_chunk_retries: 3,
            request_timeout_ms: None,
            sweep_interval_ms: 1000,
            drain_pending_on_close: true,
        }
    }
}

impl ConsoleConfig {
    /// Create a configuration targeting a specific relay
    pub fn with_relay(relay_address: impl Into<String>) -> Self {
        Self {
            relay_address: relay_address.into(),
            ..Self::default()
        }
    }

    /// Delay between a channel loss and the next connection attempt
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Default deadline for correlated requests
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Interval of the pending-request sweep
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Settings consumed by the transfer engine
    pub fn transfer(&self) -> TransferConfig {
        TransferConfig {
            chunk_size_bytes: self.chunk_size_bytes,
            max_chunk_retries: self.max_chunk_retries,
        }
    }

    /// Validate every field
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.relay_address).map_err(|e| {
            ControlError::Configuration(format!(
                "invalid relay address {}: {}",
                self.relay_address, e
            ))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ControlError::Configuration(format!(
                "relay address must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(ControlError::Configuration(
                "reconnect_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ControlError::Configuration(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(ControlError::Configuration(
                "request_timeout_ms must be greater than zero when set".to_string(),
            ));
        }
        self.transfer().validate()
    }
}

// ----------------------------------------------------------------------------
// Transfer Configuration
// ----------------------------------------------------------------------------

/// Chunking parameters for firmware pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Size of each transfer slice
    pub chunk_size_bytes: usize,
    /// Consecutive failures tolerated per chunk
    pub max_chunk_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        ConsoleConfig::default().transfer()
    }
}

impl TransferConfig {
    /// Validate chunking parameters
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_bytes == 0 {
            return Err(ControlError::Configuration(
                "chunk_size_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_chunk_retries == 0 {
            return Err(ControlError::Configuration(
                "max_chunk_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
