//! Transaction references and submission receipts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a transaction on the ledger (the transaction hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(String);

impl TxRef {
    /// Create from a string.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the reference as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of escrow transaction submitted to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Funds moved from the payer into escrow custody.
    Lock,
    /// Escrowed funds paid out to the provider.
    Release,
    /// Escrowed funds returned to the payer.
    Refund,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => write!(f, "escrow_lock"),
            Self::Release => write!(f, "escrow_release"),
            Self::Refund => write!(f, "escrow_refund"),
        }
    }
}

/// Receipt returned by every submit call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Reference of the submitted transaction.
    pub tx_ref: TxRef,
    /// Confirmations observed at submission time (usually 0).
    pub confirmations: u32,
}

impl Submission {
    /// A fresh, unconfirmed submission.
    #[must_use]
    pub fn unconfirmed(tx_ref: TxRef) -> Self {
        Self {
            tx_ref,
            confirmations: 0,
        }
    }
}
