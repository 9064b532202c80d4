//! Error types for job-market.

use std::fmt;

use ledger_gateway::LedgerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobStatus;

/// Result type alias for marketplace operations.
pub type Result<T> = std::result::Result<T, MarketError>;

/// Stable classification of a [`MarketError`], suitable for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; nothing was changed.
    Validation,
    /// Unknown job, provider or escrow record.
    NotFound,
    /// The operation conflicts with the current state.
    Conflict,
    /// The caller is not allowed to act on this job.
    Forbidden,
    /// Confirmation polling ran out of attempts.
    Timeout,
    /// The ledger failed or rejected a transaction.
    Gateway,
    /// Snapshot persistence failed.
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Forbidden => "forbidden",
            Self::Timeout => "timeout",
            Self::Gateway => "gateway",
            Self::Storage => "storage",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in marketplace operations.
#[derive(Debug, Error)]
pub enum MarketError {
    /// Invalid input.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// What was wrong with the configuration.
        message: String,
    },

    /// Entity not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity type ("job", "provider", "escrow").
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The operation conflicts with existing state.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// Invalid job state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// The current state.
        from: JobStatus,
        /// The attempted target state.
        to: JobStatus,
    },

    /// The caller may not act on the job.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Why the caller was refused.
        message: String,
    },

    /// Escrow lock was not confirmed in time.
    #[error("escrow {escrow_id} not confirmed after {attempts} polls")]
    ConfirmationTimeout {
        /// The escrow record.
        escrow_id: String,
        /// Number of polls made.
        attempts: u32,
    },

    /// Escrow lock failed permanently while waiting for confirmations.
    #[error("escrow {escrow_id} failed: {reason}")]
    LockFailed {
        /// The escrow record.
        escrow_id: String,
        /// Failure description.
        reason: String,
    },

    /// Ledger gateway failure.
    #[error("ledger gateway error: {0}")]
    Gateway(#[source] LedgerError),

    /// Snapshot I/O or encoding failure.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },
}

impl MarketError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a forbidden error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Job not found.
    #[must_use]
    pub fn job_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "job",
            id: id.into(),
        }
    }

    /// Provider not found.
    #[must_use]
    pub fn provider_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "provider",
            id: id.into(),
        }
    }

    /// Escrow record not found.
    #[must_use]
    pub fn escrow_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "escrow",
            id: id.into(),
        }
    }

    /// Stable classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::Config { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } | Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::ConfirmationTimeout { .. } => ErrorKind::Timeout,
            Self::LockFailed { .. } | Self::Gateway(_) => ErrorKind::Gateway,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Gateway(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<LedgerError> for MarketError {
    fn from(e: LedgerError) -> Self {
        if e.is_invalid_input() {
            Self::Validation {
                message: e.to_string(),
            }
        } else {
            Self::Gateway(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(MarketError::validation("x"), ErrorKind::Validation ; "validation")]
    #[test_case(MarketError::config("x"), ErrorKind::Validation ; "config")]
    #[test_case(MarketError::job_not_found("j"), ErrorKind::NotFound ; "not found")]
    #[test_case(MarketError::conflict("x"), ErrorKind::Conflict ; "conflict")]
    #[test_case(MarketError::forbidden("x"), ErrorKind::Forbidden ; "forbidden")]
    #[test_case(MarketError::ConfirmationTimeout { escrow_id: "e".into(), attempts: 60 }, ErrorKind::Timeout ; "timeout")]
    #[test_case(MarketError::Gateway(LedgerError::network("down")), ErrorKind::Gateway ; "gateway")]
    fn test_error_kind(err: MarketError, kind: ErrorKind) {
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn test_invalid_transition_is_conflict() {
        let err = MarketError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "invalid state transition: COMPLETED -> RUNNING");
    }

    #[test]
    fn test_ledger_address_error_becomes_validation() {
        let err: MarketError = LedgerError::invalid_address("too short").into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_ledger_network_error_is_transient_gateway() {
        let err: MarketError = LedgerError::network("reset").into();
        assert_eq!(err.kind(), ErrorKind::Gateway);
        assert!(err.is_transient());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::NotFound).expect("serialize");
        assert_eq!(json, "\"not_found\"");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
