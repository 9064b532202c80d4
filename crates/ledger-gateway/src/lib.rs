//! # ledger-gateway
//!
//! The contract between the compute marketplace and the external ledger that
//! holds escrowed payments.
//!
//! This crate provides:
//! - Validated ledger addresses and payer credentials
//! - Fixed-point credit amounts
//! - The [`LedgerGateway`] trait (lock, release, refund, confirmation query)
//! - [`InMemoryLedger`], a simulated ledger with failure injection
//! - [`RpcLedger`], a JSON-RPC 2.0 client for a real ledger node
//!
//! ## Example
//!
//! ```rust,no_run
//! use ledger_gateway::{Address, Amount, InMemoryLedger, LedgerGateway, PayerCredential};
//!
//! # async fn example() -> ledger_gateway::Result<()> {
//! let ledger = InMemoryLedger::new();
//! let custodian = Address::parse(&"C".repeat(60))?;
//! let payer = PayerCredential::new("payer-seed")?;
//!
//! let submission = ledger
//!     .submit_lock(&payer, &custodian, Amount::credits(2.0), "job-1")
//!     .await?;
//! let confirmations = ledger.confirmations(&submission.tx_ref).await?;
//! println!("{} has {confirmations} confirmations", submission.tx_ref);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod amount;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod rpc;
pub mod submission;

pub use address::{Address, PayerCredential, ADDRESS_LEN};
pub use amount::Amount;
pub use error::{LedgerError, Result};
pub use gateway::{LedgerFuture, LedgerGateway};
pub use memory::{InMemoryLedger, LedgerOp, LedgerTransaction};
pub use rpc::RpcLedger;
pub use submission::{Submission, TransactionKind, TxRef};

/// Micro-credits per credit.
pub const MICROS_PER_CREDIT: u64 = 1_000_000;
