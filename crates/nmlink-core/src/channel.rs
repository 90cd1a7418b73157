//! Channel abstraction
//!
//! The multiplexer only needs a non-blocking send that fails fast when the
//! relay connection is down, plus the current connection state. The
//! WebSocket implementation lives in `nmlink-relay`.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::Result;

// ----------------------------------------------------------------------------
// Channel State
// ----------------------------------------------------------------------------

/// Connection state of the relay channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// A connection attempt is in flight
    Connecting,
    /// The channel is established and accepts sends
    Open,
    /// No live connection; a reconnect may be scheduled
    Closed,
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications emitted by a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel reached `Open`
    Opened,
    /// The channel was lost; a reconnect follows unless shut down
    Closed { reason: String },
}

// ----------------------------------------------------------------------------
// Channel Trait
// ----------------------------------------------------------------------------

/// Outbound half of the relay connection
pub trait Channel: Send + Sync {
    /// Transmit one text frame
    ///
    /// Fails with [`ControlError::NotConnected`](crate::ControlError::NotConnected)
    /// without performing any I/O unless the channel is `Open`.
    fn send(&self, frame: String) -> Result<()>;

    /// Current connection state
    fn state(&self) -> ChannelState;

    /// Whether sends are currently accepted
    fn is_connected(&self) -> bool {
        self.state().is_open()
    }
}
