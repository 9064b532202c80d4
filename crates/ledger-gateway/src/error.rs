//! Error types for ledger gateway operations.

use thiserror::Error;

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur while talking to the ledger.
///
/// Every variant is either transient (worth retrying within a polling
/// budget) or permanent; see [`LedgerError::is_transient`].
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Invalid ledger address format.
    #[error("invalid address: {message}")]
    InvalidAddress {
        /// Description of the address error.
        message: String,
    },

    /// Invalid amount.
    #[error("invalid amount: {message}")]
    InvalidAmount {
        /// Description of the amount error.
        message: String,
    },

    /// The ledger rejected the transaction.
    #[error("transaction rejected: {reason}")]
    Rejected {
        /// Reason given by the ledger.
        reason: String,
    },

    /// Transaction reference unknown to the ledger.
    #[error("transaction not found: {tx_ref}")]
    TransactionNotFound {
        /// Transaction reference.
        tx_ref: String,
    },

    /// Network error (connection refused, reset, DNS).
    #[error("network error: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// RPC error reported by the ledger node.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// RPC error message.
        message: String,
    },

    /// Request did not complete in time.
    #[error("timeout: {operation} did not complete in {timeout_secs} seconds")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Timeout duration.
        timeout_secs: u64,
    },

    /// Malformed ledger response.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LedgerError {
    /// JSON-RPC code the ledger node uses for malformed identities.
    pub const RPC_INVALID_ADDRESS: i64 = -32010;

    /// JSON-RPC code for rejected transactions.
    pub const RPC_REJECTED: i64 = -32020;

    /// Create an invalid address error.
    #[must_use]
    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            message: message.into(),
        }
    }

    /// Create an invalid amount error.
    #[must_use]
    pub fn invalid_amount(message: impl Into<String>) -> Self {
        Self::InvalidAmount {
            message: message.into(),
        }
    }

    /// Create a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a rejected-transaction error.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Whether the failure may succeed if the same request is retried.
    ///
    /// Address and amount format failures are permanent. Network failures,
    /// timeouts and server-side RPC errors are transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::TransactionNotFound { .. } => true,
            Self::Rpc { code, .. } => *code != Self::RPC_INVALID_ADDRESS && *code != Self::RPC_REJECTED,
            Self::InvalidAddress { .. }
            | Self::InvalidAmount { .. }
            | Self::Rejected { .. }
            | Self::Json(_) => false,
        }
    }

    /// Whether the failure is a malformed input rather than a ledger fault.
    #[must_use]
    pub const fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress { .. }
                | Self::InvalidAmount { .. }
                | Self::Rpc {
                    code: Self::RPC_INVALID_ADDRESS,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_address_display() {
        let err = LedgerError::invalid_address("bad format");
        assert!(err.to_string().contains("bad format"));
    }

    #[test]
    fn test_network_errors_are_transient() {
        assert!(LedgerError::network("connection reset").is_transient());
        assert!(LedgerError::Timeout {
            operation: "submit_lock".to_string(),
            timeout_secs: 10,
        }
        .is_transient());
    }

    #[test]
    fn test_format_errors_are_permanent() {
        assert!(!LedgerError::invalid_address("short").is_transient());
        assert!(!LedgerError::invalid_amount("zero").is_transient());
        assert!(!LedgerError::rejected("insufficient balance").is_transient());
    }

    #[test]
    fn test_rpc_codes() {
        let server = LedgerError::Rpc {
            code: -32000,
            message: "node busy".to_string(),
        };
        assert!(server.is_transient());
        assert!(!server.is_invalid_input());

        let address = LedgerError::Rpc {
            code: LedgerError::RPC_INVALID_ADDRESS,
            message: "bad identity".to_string(),
        };
        assert!(!address.is_transient());
        assert!(address.is_invalid_input());
    }
}
