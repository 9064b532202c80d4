//! Ledger amount representation.
//!
//! Amounts are stored as micro-credits internally so that cost arithmetic
//! stays in integers, with conversion to/from the decimal credit value the
//! marketplace quotes prices in.

use crate::error::{LedgerError, Result};
use crate::MICROS_PER_CREDIT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// An amount of ledger credits.
///
/// Internally stored as micro-credits (1 credit = 10^6 micros).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount {
    micros: u64,
}

impl Amount {
    /// Zero credits.
    pub const ZERO: Self = Self { micros: 0 };

    /// Maximum amount (`u64::MAX` micros).
    pub const MAX: Self = Self { micros: u64::MAX };

    /// Create an amount from micro-credits.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros }
    }

    /// Create an amount from a decimal credit value.
    ///
    /// Negative and non-finite inputs become zero; use [`Amount::try_credits`]
    /// where those must be rejected.
    #[must_use]
    pub fn credits(amount: f64) -> Self {
        if !amount.is_finite() || amount <= 0.0 {
            return Self::ZERO;
        }
        let micros = (amount * MICROS_PER_CREDIT as f64).round();
        if micros >= u64::MAX as f64 {
            Self::MAX
        } else {
            Self {
                micros: micros as u64,
            }
        }
    }

    /// Try to create an amount from a decimal credit value.
    ///
    /// # Errors
    ///
    /// Returns error if the amount is negative or not a finite number.
    pub fn try_credits(amount: f64) -> Result<Self> {
        if !amount.is_finite() {
            return Err(LedgerError::invalid_amount("amount must be a finite number"));
        }
        if amount < 0.0 {
            return Err(LedgerError::invalid_amount("amount must be non-negative"));
        }
        Ok(Self::credits(amount))
    }

    /// Get the amount in micro-credits.
    #[must_use]
    pub const fn micros(&self) -> u64 {
        self.micros
    }

    /// Get the amount in credits (decimal).
    #[must_use]
    pub fn as_credits(&self) -> f64 {
        self.micros as f64 / MICROS_PER_CREDIT as f64
    }

    /// Check if the amount is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.micros == 0
    }

    /// Multiply by a non-negative factor (e.g. a number of hours).
    ///
    /// Returns `None` if the factor is negative, not finite, or the result
    /// does not fit.
    #[must_use]
    pub fn checked_mul_f64(&self, factor: f64) -> Option<Self> {
        if !factor.is_finite() || factor < 0.0 {
            return None;
        }
        let product = (self.micros as f64 * factor).round();
        if product >= u64::MAX as f64 {
            return None;
        }
        Some(Self {
            micros: product as u64,
        })
    }

    /// Saturating addition.
    #[must_use]
    pub const fn saturating_add(&self, other: Self) -> Self {
        Self {
            micros: self.micros.saturating_add(other.micros),
        }
    }

    /// Saturating subtraction.
    #[must_use]
    pub const fn saturating_sub(&self, other: Self) -> Self {
        Self {
            micros: self.micros.saturating_sub(other.micros),
        }
    }

    /// Checked addition.
    #[must_use]
    pub const fn checked_add(&self, other: Self) -> Option<Self> {
        match self.micros.checked_add(other.micros) {
            Some(micros) => Some(Self { micros }),
            None => None,
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6} credits", self.as_credits())
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        self.saturating_add(other)
    }
}

impl Sub for Amount {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        self.saturating_sub(other)
    }
}

impl From<u64> for Amount {
    fn from(micros: u64) -> Self {
        Self::from_micros(micros)
    }
}
