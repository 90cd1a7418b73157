//! nmlink CLI configuration
//!
//! Settings come from, in increasing priority: built-in defaults, a TOML
//! file given with `--config`, and command line flags.
//!
//! ```toml
//! [console]
//! relay_address = "ws://console.example:8000/ws/data/"
//! reconnect_delay_ms = 5000
//!
//! [cli]
//! connect_timeout_secs = 10
//! ```

use std::path::Path;
use std::time::Duration;

use nmlink_core::ConsoleConfig;
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::error::{CliError, Result};

/// Response deadline used when neither the file nor the flags set one
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the CLI
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Relay, request and transfer settings
    pub console: ConsoleConfig,
    /// CLI-only settings
    pub cli: CliSettings,
}

/// Settings that only matter to the command line front end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    /// How long to wait for the relay before giving up
    pub connect_timeout_secs: u64,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Load from a TOML file, filling gaps with defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CliError::Config(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&text)
    }

    /// Parse TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply command line overrides and the CLI's response deadline default
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(relay) = &cli.relay {
            self.console.relay_address = relay.clone();
        }
        if let Some(secs) = cli.timeout {
            self.console.request_timeout_ms = Some(secs * 1000);
        }
        if self.console.request_timeout_ms.is_none() {
            self.console.request_timeout_ms = Some(DEFAULT_RESPONSE_TIMEOUT_SECS * 1000);
        }
        if let Some(secs) = cli.connect_timeout {
            self.cli.connect_timeout_secs = secs;
        }
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.console.validate()?;
        if self.cli.connect_timeout_secs == 0 {
            return Err(CliError::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.cli.connect_timeout_secs)
    }
}
