//! Ledger identities and payer credentials.
//!
//! A ledger address is a 60-character identity made of uppercase ASCII
//! letters. Credentials are the payer's signing seed; they are handed to the
//! gateway as-is and never logged.

use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a ledger identity in characters.
pub const ADDRESS_LEN: usize = 60;

/// A validated ledger address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and validate an address.
    ///
    /// # Errors
    ///
    /// Returns error if the string is not exactly 60 uppercase ASCII letters.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != ADDRESS_LEN {
            return Err(LedgerError::invalid_address(format!(
                "address must be {ADDRESS_LEN} characters, got {}",
                s.len()
            )));
        }
        if let Some(bad) = s.chars().find(|c| !c.is_ascii_uppercase()) {
            return Err(LedgerError::invalid_address(format!(
                "address may only contain A-Z, found {bad:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Check whether a string is a well-formed address.
    #[must_use]
    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    /// Get the address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The payer's signing credential (seed).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayerCredential(String);

impl PayerCredential {
    /// Wrap a seed.
    ///
    /// # Errors
    ///
    /// Returns error if the seed is empty.
    pub fn new(seed: impl Into<String>) -> Result<Self> {
        let seed = seed.into();
        if seed.trim().is_empty() {
            return Err(LedgerError::invalid_address("payer credential is empty"));
        }
        Ok(Self(seed))
    }

    /// Expose the raw seed to a gateway implementation.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PayerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PayerCredential(<redacted>)")
    }
}
