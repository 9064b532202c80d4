//! In-memory ledger used by tests and local development.
//!
//! Transactions are recorded in a simulated ledger whose confirmation count
//! grows by a fixed step every time it is queried. Failures can be injected
//! per operation to exercise the engine's transient/permanent error handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::address::{Address, PayerCredential};
use crate::amount::Amount;
use crate::error::{LedgerError, Result};
use crate::gateway::{LedgerFuture, LedgerGateway};
use crate::submission::{Submission, TransactionKind, TxRef};

/// Gateway operation, used to target failure injection and call counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    /// `submit_lock`.
    Lock,
    /// `submit_release`.
    Release,
    /// `submit_refund`.
    Refund,
    /// `confirmations`.
    Confirmations,
}

/// A transaction recorded by the simulated ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Transaction reference.
    pub tx_ref: TxRef,
    /// Lock, release or refund.
    pub kind: TransactionKind,
    /// Job the transaction belongs to.
    pub job_id: String,
    /// Destination address.
    pub to: Address,
    /// Amount moved.
    pub amount: Amount,
    /// Confirmations observed so far.
    pub confirmations: u32,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    remaining: u32,
    transient: bool,
}

#[derive(Debug, Default)]
struct SimulatedLedger {
    transactions: HashMap<TxRef, LedgerTransaction>,
    failures: HashMap<LedgerOp, InjectedFailure>,
    calls: HashMap<LedgerOp, u32>,
    next_seq: u64,
}

impl SimulatedLedger {
    fn record_call(&mut self, op: LedgerOp) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        let Some(failure) = self.failures.get_mut(&op) else {
            return Ok(());
        };
        if failure.remaining == 0 {
            return Ok(());
        }
        failure.remaining -= 1;
        if failure.transient {
            Err(LedgerError::network(format!("injected transient failure on {op:?}")))
        } else {
            Err(LedgerError::rejected(format!("injected permanent failure on {op:?}")))
        }
    }
}

/// Simulated ledger gateway.
///
/// Cheap to clone; clones share the same simulated ledger.
#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<Mutex<SimulatedLedger>>,
    confirmation_step: u32,
    latency: Duration,
}

impl InMemoryLedger {
    /// Create a ledger whose transactions gain one confirmation per query.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedLedger::default())),
            confirmation_step: 1,
            latency: Duration::ZERO,
        }
    }

    /// Set how many confirmations a transaction gains per query.
    ///
    /// A step of zero makes transactions never confirm.
    #[must_use]
    pub fn with_confirmation_step(mut self, step: u32) -> Self {
        self.confirmation_step = step;
        self
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` calls of `op` fail.
    pub async fn fail_next(&self, op: LedgerOp, count: u32, transient: bool) {
        let mut state = self.state.lock().await;
        state.failures.insert(
            op,
            InjectedFailure {
                remaining: count,
                transient,
            },
        );
    }

    /// Number of calls made for an operation (including failed ones).
    pub async fn calls(&self, op: LedgerOp) -> u32 {
        let state = self.state.lock().await;
        state.calls.get(&op).copied().unwrap_or(0)
    }

    /// All recorded transactions for a job, oldest first.
    pub async fn transactions_for_job(&self, job_id: &str) -> Vec<LedgerTransaction> {
        let state = self.state.lock().await;
        let mut txs: Vec<_> = state
            .transactions
            .values()
            .filter(|tx| tx.job_id == job_id)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.submitted_at);
        txs
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    async fn submit(
        &self,
        op: LedgerOp,
        kind: TransactionKind,
        to: &Address,
        amount: Amount,
        job_id: &str,
    ) -> Result<Submission> {
        self.pause().await;
        if amount.is_zero() {
            return Err(LedgerError::invalid_amount("amount must be positive"));
        }

        let mut state = self.state.lock().await;
        state.record_call(op)?;

        state.next_seq += 1;
        let tx_ref = TxRef::from_string(format!("mem-{kind}-{:08}", state.next_seq));
        state.transactions.insert(
            tx_ref.clone(),
            LedgerTransaction {
                tx_ref: tx_ref.clone(),
                kind,
                job_id: job_id.to_string(),
                to: to.clone(),
                amount,
                confirmations: 0,
                submitted_at: Utc::now(),
            },
        );

        info!(
            tx_ref = %tx_ref,
            kind = %kind,
            job_id,
            amount = %amount,
            "simulated transaction submitted"
        );
        Ok(Submission::unconfirmed(tx_ref))
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerGateway for InMemoryLedger {
    fn submit_lock<'a>(
        &'a self,
        _payer: &'a PayerCredential,
        payee: &'a Address,
        amount: Amount,
        job_id: &'a str,
    ) -> LedgerFuture<'a, Submission> {
        Box::pin(self.submit(LedgerOp::Lock, TransactionKind::Lock, payee, amount, job_id))
    }

    fn submit_release<'a>(
        &'a self,
        payee: &'a Address,
        amount: Amount,
        job_id: &'a str,
    ) -> LedgerFuture<'a, Submission> {
        Box::pin(self.submit(
            LedgerOp::Release,
            TransactionKind::Release,
            payee,
            amount,
            job_id,
        ))
    }

    fn submit_refund<'a>(
        &'a self,
        payer: &'a Address,
        amount: Amount,
        job_id: &'a str,
    ) -> LedgerFuture<'a, Submission> {
        Box::pin(self.submit(
            LedgerOp::Refund,
            TransactionKind::Refund,
            payer,
            amount,
            job_id,
        ))
    }

    fn confirmations<'a>(&'a self, tx_ref: &'a TxRef) -> LedgerFuture<'a, u32> {
        Box::pin(async move {
            self.pause().await;
            let mut state = self.state.lock().await;
            state.record_call(LedgerOp::Confirmations)?;

            let step = self.confirmation_step;
            let tx = state
                .transactions
                .get_mut(tx_ref)
                .ok_or_else(|| LedgerError::TransactionNotFound {
                    tx_ref: tx_ref.to_string(),
                })?;
            tx.confirmations = tx.confirmations.saturating_add(step);

            debug!(tx_ref = %tx_ref, confirmations = tx.confirmations, "simulated confirmation query");
            Ok(tx.confirmations)
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLedger")
            .field("confirmation_step", &self.confirmation_step)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ADDRESS_LEN;

    fn address() -> Address {
        Address::parse(&"B".repeat(ADDRESS_LEN)).expect("valid address")
    }

    fn credential() -> PayerCredential {
        PayerCredential::new("seed").expect("credential")
    }

    #[tokio::test]
    async fn test_lock_then_confirmations_grow() {
        let ledger = InMemoryLedger::new();
        let submission = ledger
            .submit_lock(&credential(), &address(), Amount::credits(2.0), "job-1")
            .await
            .expect("should lock");
        assert_eq!(submission.confirmations, 0);

        let first = ledger.confirmations(&submission.tx_ref).await.expect("query");
        let second = ledger.confirmations(&submission.tx_ref).await.expect("query");
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_tx_refs_are_sequential() {
        let ledger = InMemoryLedger::new();
        let lock = ledger
            .submit_lock(&credential(), &address(), Amount::credits(1.0), "job-1")
            .await
            .expect("should lock");
        let refund = ledger
            .submit_refund(&address(), Amount::credits(1.0), "job-1")
            .await
            .expect("should refund");
        assert_eq!(lock.tx_ref.as_str(), "mem-escrow_lock-00000001");
        assert_eq!(refund.tx_ref.as_str(), "mem-escrow_refund-00000002");
    }

    #[tokio::test]
    async fn test_zero_step_never_confirms() {
        let ledger = InMemoryLedger::new().with_confirmation_step(0);
        let submission = ledger
            .submit_lock(&credential(), &address(), Amount::credits(1.0), "job-1")
            .await
            .expect("should lock");
        for _ in 0..5 {
            assert_eq!(ledger.confirmations(&submission.tx_ref).await.expect("query"), 0);
        }
    }

    #[tokio::test]
    async fn test_unknown_tx_ref() {
        let ledger = InMemoryLedger::new();
        let err = ledger
            .confirmations(&TxRef::from_string("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::TransactionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let ledger = InMemoryLedger::new();
        ledger.fail_next(LedgerOp::Release, 1, true).await;

        let err = ledger
            .submit_release(&address(), Amount::credits(1.0), "job-1")
            .await
            .unwrap_err();
        assert!(err.is_transient());

        ledger
            .submit_release(&address(), Amount::credits(1.0), "job-1")
            .await
            .expect("second attempt succeeds");
        assert_eq!(ledger.calls(LedgerOp::Release).await, 2);

        ledger.fail_next(LedgerOp::Refund, 1, false).await;
        let err = ledger
            .submit_refund(&address(), Amount::credits(1.0), "job-1")
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let ledger = InMemoryLedger::new();
        let err = ledger
            .submit_refund(&address(), Amount::ZERO, "job-1")
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn test_transactions_for_job() {
        let ledger = InMemoryLedger::new();
        ledger
            .submit_lock(&credential(), &address(), Amount::credits(1.0), "job-1")
            .await
            .expect("lock");
        ledger
            .submit_release(&address(), Amount::credits(1.0), "job-1")
            .await
            .expect("release");
        ledger
            .submit_lock(&credential(), &address(), Amount::credits(1.0), "job-2")
            .await
            .expect("lock");

        let txs = ledger.transactions_for_job("job-1").await;
        assert_eq!(txs.len(), 2);
        assert!(txs.iter().any(|tx| tx.kind == TransactionKind::Release));
    }
}
