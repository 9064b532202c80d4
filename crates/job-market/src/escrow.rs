//! Escrow coordination.
//!
//! Locks a job's payment on the ledger, polls the lock until it has enough
//! confirmations, and later releases the funds to the provider or refunds
//! them to the owner. Each job gets at most one LOCK record and at most one
//! settlement record (RELEASE or REFUND) over its whole lifetime.
//!
//! Every in-flight lock is watched by its own polling task, keyed by escrow
//! id. Callers can await the outcome with
//! [`EscrowCoordinator::wait_for_confirmation`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ledger_gateway::{Address, Amount, LedgerError, LedgerGateway, PayerCredential, TxRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MarketConfig;
use crate::error::{MarketError, Result};
use crate::events::{Channel, EventBroadcaster, EventType, MarketEvent};
use crate::store::MarketStore;

/// What an escrow record moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowKind {
    /// Owner funds into custody.
    Lock,
    /// Custody to the provider.
    Release,
    /// Custody back to the owner.
    Refund,
}

impl EscrowKind {
    /// Release or refund.
    #[must_use]
    pub const fn is_settlement(&self) -> bool {
        matches!(self, Self::Release | Self::Refund)
    }
}

impl fmt::Display for EscrowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => write!(f, "LOCK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Refund => write!(f, "REFUND"),
        }
    }
}

/// Ledger status of an escrow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Submitted (or reserved) but not yet confirmed.
    Pending,
    /// Accepted by the ledger.
    Confirmed,
    /// Will never confirm.
    Failed,
}

/// Why a lock will never confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum LockFailure {
    /// The poll budget ran out below the confirmation threshold.
    TimedOut {
        /// Polls made.
        attempts: u32,
    },
    /// The ledger reported a permanent error for the transaction.
    Rejected,
    /// The job or its record disappeared while polling.
    JobRemoved,
    /// The lock was never submitted, e.g. the process stopped mid-submission.
    Interrupted,
}

impl LockFailure {
    /// The error a caller sees for this failure.
    #[must_use]
    pub fn to_error(&self, escrow_id: &str, reason: Option<&str>) -> MarketError {
        match self {
            Self::TimedOut { attempts } => MarketError::ConfirmationTimeout {
                escrow_id: escrow_id.to_string(),
                attempts: *attempts,
            },
            _ => MarketError::LockFailed {
                escrow_id: escrow_id.to_string(),
                reason: reason.unwrap_or("lock failed").to_string(),
            },
        }
    }
}

/// A lock, release or refund tracked against a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowRecord {
    /// Record identifier.
    pub id: String,
    /// Job the funds belong to.
    pub job_id: String,
    /// Lock, release or refund.
    pub kind: EscrowKind,
    /// Amount moved.
    pub amount: Amount,
    /// Ledger status.
    pub status: RecordStatus,
    /// Confirmations observed; never decreases.
    pub confirmations: u32,
    /// Confirmations needed for a lock to count.
    pub required_confirmations: u32,
    /// Ledger transaction, once submitted.
    pub tx_ref: Option<TxRef>,
    /// Payee of a lock or release, payer of a refund.
    pub counterparty: Address,
    /// Last ledger error.
    pub error: Option<String>,
    /// Set when a lock reaches FAILED.
    #[serde(default)]
    pub failure: Option<LockFailure>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the record reached CONFIRMED or FAILED.
    pub completed_at: Option<DateTime<Utc>>,
}

impl EscrowRecord {
    fn new(
        job_id: &str,
        kind: EscrowKind,
        amount: Amount,
        counterparty: Address,
        required_confirmations: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            kind,
            amount,
            status: RecordStatus::Pending,
            confirmations: 0,
            required_confirmations,
            tx_ref: None,
            counterparty,
            error: None,
            failure: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Summary state of a job's escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowState {
    /// Lock confirmed, funds in custody.
    Locked,
    /// Funds paid to the provider.
    Released,
    /// Funds returned to the owner.
    Refunded,
    /// Lock waiting for confirmations.
    Pending,
    /// Lock timed out or was rejected.
    Failed,
}

/// Answer to [`EscrowCoordinator::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowStatus {
    /// The LOCK record.
    pub escrow_id: String,
    /// Summary state.
    pub state: EscrowState,
    /// Locked amount.
    pub amount: Amount,
    /// Lock confirmations (live from the ledger while pending).
    pub confirmations: u32,
    /// Confirmations needed.
    pub required_confirmations: u32,
    /// Lock transaction.
    pub tx_ref: Option<TxRef>,
    /// A reserved release or refund that the ledger has not accepted yet.
    pub pending_settlement: Option<EscrowKind>,
    /// Last error on the lock or pending settlement.
    pub error: Option<String>,
    /// Why the lock failed, when `state` is `Failed`.
    pub failure: Option<LockFailure>,
}

/// Returned by [`EscrowCoordinator::lock`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockReceipt {
    /// The new LOCK record.
    pub escrow_id: String,
    /// Lock transaction.
    pub tx_ref: TxRef,
}

/// Returned by release, refund and retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    /// The settlement record.
    pub escrow_id: String,
    /// Release or refund.
    pub kind: EscrowKind,
    /// Settlement transaction.
    pub tx_ref: TxRef,
}

/// How a confirmation polling task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// Threshold reached.
    Confirmed,
    /// Attempt budget exhausted.
    TimedOut {
        /// Polls made.
        attempts: u32,
    },
    /// Permanent ledger error, or the job disappeared.
    Failed {
        /// Failure cause.
        cause: LockFailure,
        /// Failure description.
        reason: String,
    },
    /// Polling was stopped by the coordinator.
    Cancelled,
}

/// Polling parameters.
#[derive(Debug, Clone)]
pub struct EscrowSettings {
    /// Confirmations needed.
    pub required_confirmations: u32,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Polls before timing out.
    pub max_poll_attempts: u32,
}

impl Default for EscrowSettings {
    fn default() -> Self {
        Self::from(&MarketConfig::default())
    }
}

impl From<&MarketConfig> for EscrowSettings {
    fn from(config: &MarketConfig) -> Self {
        Self {
            required_confirmations: config.required_confirmations,
            poll_interval: config.poll_interval(),
            max_poll_attempts: config.max_poll_attempts,
        }
    }
}

struct CoordinatorInner {
    store: Arc<MarketStore>,
    events: Arc<EventBroadcaster>,
    gateway: Arc<dyn LedgerGateway>,
    settings: EscrowSettings,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
    outcomes: Mutex<HashMap<String, watch::Sender<Option<LockOutcome>>>>,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes a settlement from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        set.lock().insert(id.to_string()).then(|| Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Locks, confirms, releases and refunds escrowed payments.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EscrowCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl EscrowCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<MarketStore>,
        events: Arc<EventBroadcaster>,
        gateway: Arc<dyn LedgerGateway>,
        settings: EscrowSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                events,
                gateway,
                settings,
                pollers: Mutex::new(HashMap::new()),
                outcomes: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Polling parameters.
    #[must_use]
    pub fn settings(&self) -> &EscrowSettings {
        &self.inner.settings
    }

    /// Lock `amount` for a job and start watching the lock for confirmations.
    ///
    /// # Errors
    ///
    /// - `Validation` if the amount is zero or the payee address is malformed
    /// - `NotFound` if the job does not exist
    /// - `Conflict` if the job already has a lock record
    /// - `Gateway` if the ledger refuses the submission; no record is kept
    pub async fn lock(
        &self,
        job_id: &str,
        payer: &PayerCredential,
        payee_address: &str,
        amount: Amount,
    ) -> Result<LockReceipt> {
        if amount.is_zero() {
            return Err(MarketError::validation("escrow amount must be positive"));
        }
        let payee = Address::parse(payee_address)?;
        let inner = &self.inner;
        if !inner.store.contains_job(job_id) {
            return Err(MarketError::job_not_found(job_id));
        }

        let record = EscrowRecord::new(
            job_id,
            EscrowKind::Lock,
            amount,
            payee.clone(),
            inner.settings.required_confirmations,
        );
        let record = inner.store.insert_escrow_checked(record, |existing| {
            if existing.iter().any(|r| r.kind == EscrowKind::Lock) {
                Err(MarketError::conflict(format!(
                    "escrow lock already exists for job {job_id}"
                )))
            } else {
                Ok(())
            }
        })?;
        self.emit(&record, "creating", None);

        let submission = match inner.gateway.submit_lock(payer, &payee, amount, job_id).await {
            Ok(submission) => submission,
            Err(e) => {
                warn!(job_id, escrow_id = %record.id, error = %e, "escrow lock submission failed");
                inner.store.remove_escrow(&record.id);
                self.emit(&record, "failed", Some(e.to_string()));
                return Err(e.into());
            }
        };

        let record = inner
            .store
            .update_escrow(&record.id, |r| {
                r.tx_ref = Some(submission.tx_ref.clone());
                r.confirmations = submission.confirmations;
            })
            .ok_or_else(|| MarketError::escrow_not_found(&record.id))?;

        info!(
            job_id,
            escrow_id = %record.id,
            tx_ref = %submission.tx_ref,
            amount = %amount,
            gateway = inner.gateway.name(),
            "escrow lock submitted"
        );
        self.emit(&record, "pending", None);
        self.start_polling(&record.id, job_id, submission.tx_ref.clone(), submission.confirmations);

        Ok(LockReceipt {
            escrow_id: record.id,
            tx_ref: submission.tx_ref,
        })
    }

    /// Wait until the lock's polling task ends.
    ///
    /// Returns immediately if the record is already confirmed or failed.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the attempt budget ran out
    /// - `Gateway` if the ledger failed the lock permanently
    /// - `Conflict` if polling was cancelled or is not running
    /// - `NotFound` if the record does not exist
    pub async fn wait_for_confirmation(&self, escrow_id: &str) -> Result<()> {
        let rx = self
            .inner
            .outcomes
            .lock()
            .get(escrow_id)
            .map(watch::Sender::subscribe);

        if let Some(mut rx) = rx {
            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .map(|outcome| outcome.clone())
                .ok()
                .flatten();
            if let Some(outcome) = outcome {
                return outcome_to_result(escrow_id, outcome);
            }
        }

        let record = self
            .inner
            .store
            .escrow(escrow_id)
            .ok_or_else(|| MarketError::escrow_not_found(escrow_id))?;
        match record.status {
            RecordStatus::Confirmed => Ok(()),
            RecordStatus::Failed => Err(record
                .failure
                .unwrap_or(LockFailure::Rejected)
                .to_error(escrow_id, record.error.as_deref())),
            RecordStatus::Pending => Err(MarketError::conflict(format!(
                "escrow {escrow_id} is not being polled"
            ))),
        }
    }

    /// Stop polling one lock. The record stays PENDING.
    ///
    /// Returns `false` if no task was running for it.
    pub fn cancel_polling(&self, escrow_id: &str) -> bool {
        let handle = self.inner.pollers.lock().remove(escrow_id);
        let Some(handle) = handle else {
            return false;
        };
        handle.abort();
        self.publish_outcome(escrow_id, LockOutcome::Cancelled);
        info!(escrow_id, "confirmation polling cancelled");
        true
    }

    /// Stop every polling task.
    pub fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = self.inner.pollers.lock().drain().collect();
        let count = handles.len();
        for (escrow_id, handle) in handles {
            handle.abort();
            self.publish_outcome(&escrow_id, LockOutcome::Cancelled);
        }
        if count > 0 {
            info!(count, "escrow coordinator stopped polling tasks");
        }
    }

    /// Number of locks currently being polled.
    #[must_use]
    pub fn active_polls(&self) -> usize {
        self.inner.pollers.lock().len()
    }

    /// Whether a lock is being polled.
    #[must_use]
    pub fn is_polling(&self, escrow_id: &str) -> bool {
        self.inner.pollers.lock().contains_key(escrow_id)
    }

    /// Restart polling for PENDING locks, e.g. after restoring a snapshot.
    ///
    /// Locks that never got a transaction reference are marked FAILED.
    /// Returns the number of tasks started.
    pub fn resume_polling(&self) -> usize {
        let mut started = 0;
        for record in self.pending_locks() {
            if self.is_polling(&record.id) {
                continue;
            }
            match record.tx_ref.clone() {
                Some(tx_ref) => {
                    self.start_polling(&record.id, &record.job_id, tx_ref, record.confirmations);
                    started += 1;
                }
                None => {
                    warn!(escrow_id = %record.id, job_id = %record.job_id, "lock was never submitted");
                    self.finish(
                        &record.id,
                        LockOutcome::Failed {
                            cause: LockFailure::Interrupted,
                            reason: "lock submission was interrupted".to_string(),
                        },
                    );
                }
            }
        }
        started
    }

    /// Pay the locked funds out to the provider.
    ///
    /// # Errors
    ///
    /// - `Conflict` if there is no confirmed lock, or the job was already
    ///   released or refunded
    /// - `Gateway` if the ledger call fails; the reservation stays PENDING
    ///   and can be finished with [`retry_settlement`](Self::retry_settlement)
    pub async fn release(
        &self,
        job_id: &str,
        payee: &Address,
        amount: Amount,
    ) -> Result<SettlementReceipt> {
        self.settle(job_id, EscrowKind::Release, payee, amount).await
    }

    /// Return the locked funds to the owner.
    ///
    /// # Errors
    ///
    /// Same as [`release`](Self::release).
    pub async fn refund(
        &self,
        job_id: &str,
        payer: &Address,
        amount: Amount,
    ) -> Result<SettlementReceipt> {
        self.settle(job_id, EscrowKind::Refund, payer, amount).await
    }

    /// Re-submit a reserved release or refund the ledger did not accept.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the job has no settlement record
    /// - `Conflict` if it is already confirmed or another submission is in
    ///   flight
    /// - `Gateway` if the ledger call fails again
    pub async fn retry_settlement(&self, job_id: &str) -> Result<SettlementReceipt> {
        let record = self
            .inner
            .store
            .settlement_record(job_id)
            .ok_or_else(|| MarketError::escrow_not_found(format!("settlement for job {job_id}")))?;
        if record.status != RecordStatus::Pending {
            return Err(MarketError::conflict(format!(
                "escrow already released or refunded for job {job_id}"
            )));
        }
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight, &record.id) else {
            return Err(MarketError::conflict(format!(
                "settlement for job {job_id} is already being submitted"
            )));
        };
        info!(job_id, escrow_id = %record.id, kind = %record.kind, "retrying settlement");
        self.submit_settlement(&record).await
    }

    /// Escrow summary for a job, or `None` if it never locked funds.
    ///
    /// While the lock is pending the ledger is asked for a live count.
    pub async fn status(&self, job_id: &str) -> Option<EscrowStatus> {
        let lock = self.inner.store.lock_record(job_id)?;
        let settlement = self.inner.store.settlement_record(job_id);

        let (state, pending_settlement) = match (lock.status, settlement.as_ref()) {
            (_, Some(s)) if s.status == RecordStatus::Confirmed => {
                let state = if s.kind == EscrowKind::Release {
                    EscrowState::Released
                } else {
                    EscrowState::Refunded
                };
                (state, None)
            }
            (RecordStatus::Confirmed, s) => (EscrowState::Locked, s.map(|s| s.kind)),
            (RecordStatus::Failed, _) => (EscrowState::Failed, None),
            (RecordStatus::Pending, _) => (EscrowState::Pending, None),
        };

        let mut confirmations = lock.confirmations;
        if state == EscrowState::Pending {
            if let Some(tx_ref) = &lock.tx_ref {
                match self.inner.gateway.confirmations(tx_ref).await {
                    Ok(live) => confirmations = confirmations.max(live),
                    Err(e) => debug!(job_id, error = %e, "live confirmation query failed"),
                }
            }
        }

        let error = settlement
            .as_ref()
            .filter(|s| s.status == RecordStatus::Pending)
            .and_then(|s| s.error.clone())
            .or(lock.error.clone());

        Some(EscrowStatus {
            escrow_id: lock.id,
            state,
            amount: lock.amount,
            confirmations,
            required_confirmations: lock.required_confirmations,
            tx_ref: lock.tx_ref,
            pending_settlement,
            error,
            failure: lock.failure,
        })
    }

    /// Locks still waiting for confirmations.
    #[must_use]
    pub fn pending_locks(&self) -> Vec<EscrowRecord> {
        self.inner
            .store
            .escrows_where(|r| r.kind == EscrowKind::Lock && r.status == RecordStatus::Pending)
    }

    /// Amount of the job's confirmed lock.
    #[must_use]
    pub fn locked_amount(&self, job_id: &str) -> Option<Amount> {
        self.inner
            .store
            .lock_record(job_id)
            .filter(|r| r.status == RecordStatus::Confirmed)
            .map(|r| r.amount)
    }

    /// Whether the job's lock is confirmed.
    #[must_use]
    pub fn has_confirmed_lock(&self, job_id: &str) -> bool {
        self.locked_amount(job_id).is_some()
    }

    async fn settle(
        &self,
        job_id: &str,
        kind: EscrowKind,
        counterparty: &Address,
        amount: Amount,
    ) -> Result<SettlementReceipt> {
        if amount.is_zero() {
            return Err(MarketError::validation("settlement amount must be positive"));
        }

        let record = EscrowRecord::new(
            job_id,
            kind,
            amount,
            counterparty.clone(),
            self.inner.settings.required_confirmations,
        );
        // Marked in flight before the record becomes visible to retries.
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight, &record.id) else {
            return Err(MarketError::conflict(format!(
                "settlement for job {job_id} is already being submitted"
            )));
        };
        let record = self.inner.store.insert_escrow_checked(record, |existing| {
            let locked = existing
                .iter()
                .any(|r| r.kind == EscrowKind::Lock && r.status == RecordStatus::Confirmed);
            if !locked {
                return Err(MarketError::conflict(format!(
                    "no confirmed escrow lock for job {job_id}"
                )));
            }
            if existing.iter().any(|r| r.kind.is_settlement()) {
                return Err(MarketError::conflict(format!(
                    "escrow already released or refunded for job {job_id}"
                )));
            }
            Ok(())
        })?;

        self.emit(&record, settling_label(kind), None);
        self.submit_settlement(&record).await
    }

    async fn submit_settlement(&self, record: &EscrowRecord) -> Result<SettlementReceipt> {
        let gateway = &self.inner.gateway;
        let result = match record.kind {
            EscrowKind::Release => {
                gateway
                    .submit_release(&record.counterparty, record.amount, &record.job_id)
                    .await
            }
            EscrowKind::Refund => {
                gateway
                    .submit_refund(&record.counterparty, record.amount, &record.job_id)
                    .await
            }
            EscrowKind::Lock => {
                return Err(MarketError::conflict("a lock is not a settlement"));
            }
        };

        match result {
            Ok(submission) => {
                let updated = self.inner.store.update_escrow(&record.id, |r| {
                    r.status = RecordStatus::Confirmed;
                    r.tx_ref = Some(submission.tx_ref.clone());
                    r.confirmations = r.confirmations.max(submission.confirmations);
                    r.error = None;
                    r.completed_at = Some(Utc::now());
                });
                info!(
                    job_id = %record.job_id,
                    escrow_id = %record.id,
                    kind = %record.kind,
                    tx_ref = %submission.tx_ref,
                    amount = %record.amount,
                    "escrow settled"
                );
                if let Some(updated) = updated {
                    self.emit(&updated, settled_label(record.kind), None);
                }
                Ok(SettlementReceipt {
                    escrow_id: record.id.clone(),
                    kind: record.kind,
                    tx_ref: submission.tx_ref,
                })
            }
            Err(e) => {
                warn!(
                    job_id = %record.job_id,
                    escrow_id = %record.id,
                    kind = %record.kind,
                    error = %e,
                    transient = e.is_transient(),
                    "settlement not accepted by ledger, payment pending"
                );
                let updated = self.inner.store.update_escrow(&record.id, |r| {
                    r.error = Some(e.to_string());
                });
                if let Some(updated) = updated {
                    self.emit(&updated, settling_label(record.kind), Some(e.to_string()));
                }
                Err(MarketError::Gateway(e))
            }
        }
    }

    fn start_polling(&self, escrow_id: &str, job_id: &str, tx_ref: TxRef, initial: u32) {
        let (tx, _) = watch::channel(None);
        self.inner.outcomes.lock().insert(escrow_id.to_string(), tx);

        let mut pollers = self.inner.pollers.lock();
        let this = self.clone();
        let escrow = escrow_id.to_string();
        let job = job_id.to_string();
        let handle = tokio::spawn(async move {
            let outcome = this.poll_confirmations(&escrow, &job, &tx_ref, initial).await;
            this.finish(&escrow, outcome);
        });
        pollers.insert(escrow_id.to_string(), handle);
    }

    async fn poll_confirmations(
        &self,
        escrow_id: &str,
        job_id: &str,
        tx_ref: &TxRef,
        initial: u32,
    ) -> LockOutcome {
        let settings = &self.inner.settings;
        let mut best = initial;

        for attempt in 1..=settings.max_poll_attempts {
            tokio::time::sleep(settings.poll_interval).await;

            if !self.inner.store.contains_job(job_id) {
                info!(job_id, escrow_id, "job no longer exists, stopping confirmation polling");
                return LockOutcome::Failed {
                    cause: LockFailure::JobRemoved,
                    reason: "job no longer exists".to_string(),
                };
            }

            match self.inner.gateway.confirmations(tx_ref).await {
                Ok(observed) => {
                    best = best.max(observed);
                    let Some(record) = self
                        .inner
                        .store
                        .update_escrow(escrow_id, |r| r.confirmations = r.confirmations.max(best))
                    else {
                        return LockOutcome::Failed {
                            cause: LockFailure::JobRemoved,
                            reason: "escrow record removed".to_string(),
                        };
                    };
                    debug!(
                        job_id,
                        escrow_id,
                        attempt,
                        confirmations = record.confirmations,
                        required = settings.required_confirmations,
                        "confirmation poll"
                    );
                    if record.confirmations >= settings.required_confirmations {
                        return LockOutcome::Confirmed;
                    }
                    self.emit(&record, "confirming", None);
                }
                Err(e) if e.is_transient() => {
                    warn!(job_id, escrow_id, attempt, error = %e, "transient ledger error while polling");
                }
                Err(e) => {
                    return LockOutcome::Failed {
                        cause: LockFailure::Rejected,
                        reason: permanent_reason(&e),
                    };
                }
            }
        }

        LockOutcome::TimedOut {
            attempts: settings.max_poll_attempts,
        }
    }

    fn finish(&self, escrow_id: &str, outcome: LockOutcome) {
        let updated = match &outcome {
            LockOutcome::Confirmed => self.inner.store.update_escrow(escrow_id, |r| {
                r.status = RecordStatus::Confirmed;
                r.completed_at = Some(Utc::now());
            }),
            LockOutcome::TimedOut { attempts } => {
                let reason = format!("not confirmed after {attempts} polls");
                self.inner.store.update_escrow(escrow_id, |r| {
                    r.status = RecordStatus::Failed;
                    r.error = Some(reason);
                    r.failure = Some(LockFailure::TimedOut {
                        attempts: *attempts,
                    });
                    r.completed_at = Some(Utc::now());
                })
            }
            LockOutcome::Failed { cause, reason } => {
                self.inner.store.update_escrow(escrow_id, |r| {
                    r.status = RecordStatus::Failed;
                    r.error = Some(reason.clone());
                    r.failure = Some(cause.clone());
                    r.completed_at = Some(Utc::now());
                })
            }
            LockOutcome::Cancelled => None,
        };

        if let Some(record) = &updated {
            match &outcome {
                LockOutcome::Confirmed => {
                    info!(job_id = %record.job_id, escrow_id, confirmations = record.confirmations, "escrow lock confirmed");
                    self.emit(record, "confirmed", None);
                }
                _ => {
                    warn!(job_id = %record.job_id, escrow_id, error = ?record.error, "escrow lock failed");
                    self.emit(record, "failed", record.error.clone());
                }
            }
        }

        self.inner.pollers.lock().remove(escrow_id);
        self.publish_outcome(escrow_id, outcome);
    }

    fn publish_outcome(&self, escrow_id: &str, outcome: LockOutcome) {
        if let Some(tx) = self.inner.outcomes.lock().remove(escrow_id) {
            tx.send_replace(Some(outcome));
        }
    }

    fn emit(&self, record: &EscrowRecord, status: &str, error: Option<String>) {
        let mut event = MarketEvent::new(EventType::EscrowUpdate)
            .job(&record.job_id)
            .status(status)
            .data(json!({
                "escrowId": record.id,
                "kind": record.kind,
                "amount": record.amount,
                "txRef": record.tx_ref,
                "error": error,
            }));
        if record.kind == EscrowKind::Lock {
            event = event.confirmations(record.confirmations, record.required_confirmations);
        }
        if let Some(job) = self.inner.store.job(&record.job_id) {
            event = event.revision(job.revision);
        }
        self.inner.events.publish(&Channel::job(&record.job_id), event);
    }
}

impl fmt::Debug for EscrowCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscrowCoordinator")
            .field("gateway", &self.inner.gateway.name())
            .field("settings", &self.inner.settings)
            .field("active_polls", &self.active_polls())
            .finish_non_exhaustive()
    }
}

fn outcome_to_result(escrow_id: &str, outcome: LockOutcome) -> Result<()> {
    match outcome {
        LockOutcome::Confirmed => Ok(()),
        LockOutcome::TimedOut { attempts } => {
            Err(LockFailure::TimedOut { attempts }.to_error(escrow_id, None))
        }
        LockOutcome::Failed { cause, reason } => Err(cause.to_error(escrow_id, Some(&reason))),
        LockOutcome::Cancelled => Err(MarketError::conflict(format!(
            "confirmation polling for escrow {escrow_id} was cancelled"
        ))),
    }
}

fn permanent_reason(e: &LedgerError) -> String {
    format!("ledger rejected confirmation query: {e}")
}

const fn settling_label(kind: EscrowKind) -> &'static str {
    match kind {
        EscrowKind::Refund => "refunding",
        _ => "releasing",
    }
}

const fn settled_label(kind: EscrowKind) -> &'static str {
    match kind {
        EscrowKind::Refund => "refunded",
        _ => "released",
    }
}
