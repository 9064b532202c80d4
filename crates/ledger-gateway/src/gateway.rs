//! The ledger gateway contract.
//!
//! The escrow engine only needs four operations from the ledger. The trait is
//! dyn-compatible so the engine can hold an `Arc<dyn LedgerGateway>` chosen
//! at construction time.

use std::future::Future;
use std::pin::Pin;

use crate::address::{Address, PayerCredential};
use crate::amount::Amount;
use crate::error::Result;
use crate::submission::{Submission, TxRef};

/// Boxed future returned by gateway operations.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Submits and queries escrow transactions on the external ledger.
pub trait LedgerGateway: Send + Sync {
    /// Move `amount` from the payer into escrow custody at `payee`.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger rejects or cannot be reached.
    fn submit_lock<'a>(
        &'a self,
        payer: &'a PayerCredential,
        payee: &'a Address,
        amount: Amount,
        job_id: &'a str,
    ) -> LedgerFuture<'a, Submission>;

    /// Pay escrowed funds out to the provider.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger rejects or cannot be reached.
    fn submit_release<'a>(
        &'a self,
        payee: &'a Address,
        amount: Amount,
        job_id: &'a str,
    ) -> LedgerFuture<'a, Submission>;

    /// Return escrowed funds to the payer.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger rejects or cannot be reached.
    fn submit_refund<'a>(
        &'a self,
        payer: &'a Address,
        amount: Amount,
        job_id: &'a str,
    ) -> LedgerFuture<'a, Submission>;

    /// Current confirmation count of a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction is unknown or the ledger cannot be
    /// reached.
    fn confirmations<'a>(&'a self, tx_ref: &'a TxRef) -> LedgerFuture<'a, u32>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;
}
