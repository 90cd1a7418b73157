//! nmlink relay transport
//!
//! WebSocket implementation of [`nmlink_core::Channel`] with automatic
//! reconnection, and the [`ConsoleClient`] facade that runs the control core
//! on top of it.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod client;
pub mod error;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use channel::RelayChannel;
pub use client::ConsoleClient;
pub use error::{RelayError, Result};
