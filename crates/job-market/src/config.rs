//! Marketplace engine configuration.
//!
//! Loaded from the `[market]` table of the daemon config or built in code.
//! Every field has a default, so an empty table is a valid configuration
//! apart from the escrow custodian address, which must be set.

use std::path::Path;
use std::time::Duration;

use ledger_gateway::{Address, Amount};
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};

/// Tunables for the escrow coordinator, matcher, lifecycle and heartbeat
/// monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketConfig {
    /// Confirmations required before a lock counts as confirmed.
    pub required_confirmations: u32,
    /// Delay between confirmation polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Polls before a lock is declared timed out.
    pub max_poll_attempts: u32,
    /// Delay before the one-shot assignment re-check, in seconds.
    pub assignment_timeout_secs: u64,
    /// Reassignments a failed job gets before it stays failed.
    pub max_reassignments: u32,
    /// Price per hour used for the estimate when a job sets no ceiling.
    pub default_price_per_hour: f64,
    /// Custodian address that receives escrow locks.
    pub escrow_address: Option<Address>,
    /// Expected provider heartbeat interval, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeats before a provider is marked offline.
    pub missed_heartbeats: u32,
    /// Per-channel event buffer.
    pub event_buffer: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            required_confirmations: 3,
            poll_interval_ms: 2_000,
            max_poll_attempts: 60,
            assignment_timeout_secs: 30,
            max_reassignments: 3,
            default_price_per_hour: 1.0,
            escrow_address: None,
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
            event_buffer: 256,
        }
    }
}

impl MarketConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MarketError::config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| MarketError::config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Set the escrow custodian address.
    #[must_use]
    pub fn with_escrow_address(mut self, address: Address) -> Self {
        self.escrow_address = Some(address);
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.required_confirmations == 0 {
            return Err(MarketError::config(
                "required_confirmations must be greater than 0",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(MarketError::config("poll_interval_ms must be greater than 0"));
        }
        if self.max_poll_attempts == 0 {
            return Err(MarketError::config("max_poll_attempts must be greater than 0"));
        }
        if self.assignment_timeout_secs == 0 {
            return Err(MarketError::config(
                "assignment_timeout_secs must be greater than 0",
            ));
        }
        if !self.default_price_per_hour.is_finite() || self.default_price_per_hour <= 0.0 {
            return Err(MarketError::config(
                "default_price_per_hour must be a positive number",
            ));
        }
        if self.escrow_address.is_none() {
            return Err(MarketError::config("escrow_address must be set"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(MarketError::config(
                "heartbeat_interval_secs must be greater than 0",
            ));
        }
        if self.missed_heartbeats == 0 {
            return Err(MarketError::config("missed_heartbeats must be greater than 0"));
        }
        if self.event_buffer == 0 {
            return Err(MarketError::config("event_buffer must be greater than 0"));
        }
        Ok(())
    }

    /// Delay between confirmation polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// One-shot assignment re-check delay.
    #[must_use]
    pub const fn assignment_timeout(&self) -> Duration {
        Duration::from_secs(self.assignment_timeout_secs)
    }

    /// Expected heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence after which a provider is considered offline.
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.saturating_mul(self.missed_heartbeats as u64))
    }

    /// Default hourly price as an amount.
    #[must_use]
    pub fn default_price(&self) -> Amount {
        Amount::credits(self.default_price_per_hour)
    }

    /// The configured custodian address.
    ///
    /// # Errors
    ///
    /// Returns an error if no address is configured.
    pub fn custodian(&self) -> Result<&Address> {
        self.escrow_address
            .as_ref()
            .ok_or_else(|| MarketError::config("escrow_address must be set"))
    }
}
