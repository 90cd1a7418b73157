//! Core identifier types
//!
//! Device addressing and correlation identifiers shared by the multiplexer,
//! the push dispatcher and the transfer engine.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::{ControlError, Result};

// ----------------------------------------------------------------------------
// Device Target
// ----------------------------------------------------------------------------

/// A remote antenna terminal as addressed through the relay
///
/// The relay multiplexes many terminals over one channel, so every command
/// carries the full target rather than relying on a "currently selected"
/// device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceTarget {
    /// Terminal serial number
    pub serial: String,
    /// Terminal network address as known to the relay
    pub address: String,
    /// Terminal UDP port as known to the relay
    pub port: u16,
}

impl DeviceTarget {
    /// Create a validated device target
    pub fn new(serial: impl Into<String>, address: impl Into<String>, port: u16) -> Result<Self> {
        let target = Self {
            serial: serial.into(),
            address: address.into(),
            port,
        };
        target.validate()?;
        Ok(target)
    }

    /// Check that every addressing field is usable
    pub fn validate(&self) -> Result<()> {
        if self.serial.trim().is_empty() {
            return Err(ControlError::InvalidTarget(
                "serial number cannot be empty".to_string(),
            ));
        }
        if self.address.trim().is_empty() {
            return Err(ControlError::InvalidTarget(format!(
                "terminal {} has no network address",
                self.serial
            )));
        }
        if self.port == 0 {
            return Err(ControlError::InvalidTarget(format!(
                "terminal {} has no port",
                self.serial
            )));
        }
        Ok(())
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.serial, self.address, self.port)
    }
}

// ----------------------------------------------------------------------------
// Correlation Identifiers
// ----------------------------------------------------------------------------

/// Tag attached to a request and echoed back in its response
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an identifier received on the wire
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Issues correlation identifiers as `req_<nonce>_<counter>`
///
/// The counter is monotonic for the lifetime of the generator. The nonce is
/// drawn once per generator so identifiers from an earlier process (whose
/// responses the relay may still deliver) cannot collide with fresh ones.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    nonce: u32,
    counter: AtomicU64,
}

impl CorrelationIdGenerator {
    /// Create a generator with a random nonce
    pub fn new() -> Self {
        Self::with_nonce(rand::random())
    }

    /// Create a generator with a fixed nonce
    pub fn with_nonce(nonce: u32) -> Self {
        Self {
            nonce,
            counter: AtomicU64::new(0),
        }
    }

    /// Issue the next identifier
    pub fn next_id(&self) -> CorrelationId {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        CorrelationId(format!("req_{:08x}_{}", self.nonce, sequence))
    }

    /// Number of identifiers issued so far
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
