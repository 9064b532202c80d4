//! Job lifecycle controller.
//!
//! Owns the job state machine:
//!
//! ```text
//! PENDING -> ASSIGNED -> RUNNING -> COMPLETED | FAILED
//!            ASSIGNED ------------> COMPLETED | FAILED
//! FAILED  -> PENDING   (bounded reassignment)
//! ```
//!
//! Submission locks escrow, a supervision task waits for the lock to
//! confirm and then asks the matcher for a provider. Worker reports drive
//! the rest. Terminal reports settle the escrow exactly once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use ledger_gateway::{Address, Amount, LedgerGateway};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MarketConfig;
use crate::error::{ErrorKind, MarketError, Result};
use crate::escrow::{EscrowCoordinator, EscrowKind, EscrowSettings, EscrowStatus, RecordStatus};
use crate::events::{Channel, EventBroadcaster, EventType, MarketEvent};
use crate::job::{
    clamp_progress, CompletionReport, Job, JobSpec, JobStatus, LogLine, MetricSample, Outcome,
    PaymentStatus, ProgressReport, ProgressUpdate,
};
use crate::matcher::ProviderMatcher;
use crate::provider::{Provider, ProviderRegistration};
use crate::settlement::{
    calculate_cost, elapsed_between, estimate_cost, estimate_time_remaining, settle_job,
    JobSettlementInput,
};
use crate::store::{Change, MarketStore};

#[derive(Debug)]
pub(crate) struct ControllerInner {
    pub(crate) config: MarketConfig,
    pub(crate) custodian: Address,
    pub(crate) store: Arc<MarketStore>,
    pub(crate) events: Arc<EventBroadcaster>,
    pub(crate) escrow: EscrowCoordinator,
    pub(crate) matcher: ProviderMatcher,
    pub(crate) timers: Mutex<HashMap<String, JoinHandle<()>>>,
    pub(crate) supervisors: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Drives jobs from submission to settlement.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct JobController {
    pub(crate) inner: Arc<ControllerInner>,
}

impl JobController {
    /// Create a controller with an empty store.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the configuration is invalid.
    pub fn new(config: MarketConfig, gateway: Arc<dyn LedgerGateway>) -> Result<Self> {
        Self::with_store(config, gateway, Arc::new(MarketStore::new()))
    }

    /// Create a controller over an existing store.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the configuration is invalid.
    pub fn with_store(
        config: MarketConfig,
        gateway: Arc<dyn LedgerGateway>,
        store: Arc<MarketStore>,
    ) -> Result<Self> {
        config.validate()?;
        let custodian = config.custodian()?.clone();
        let events = Arc::new(EventBroadcaster::new(config.event_buffer));
        let escrow = EscrowCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&events),
            gateway,
            EscrowSettings::from(&config),
        );
        let matcher = ProviderMatcher::new(Arc::clone(&store), Arc::clone(&events));

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                custodian,
                store,
                events,
                escrow,
                matcher,
                timers: Mutex::new(HashMap::new()),
                supervisors: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &MarketConfig {
        &self.inner.config
    }

    /// The underlying tables.
    #[must_use]
    pub fn store(&self) -> &Arc<MarketStore> {
        &self.inner.store
    }

    /// The event broadcaster.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.inner.events
    }

    /// The escrow coordinator.
    #[must_use]
    pub fn escrow(&self) -> &EscrowCoordinator {
        &self.inner.escrow
    }

    /// The provider matcher.
    #[must_use]
    pub fn matcher(&self) -> &ProviderMatcher {
        &self.inner.matcher
    }

    /// Subscribe to a channel.
    #[must_use]
    pub fn subscribe(&self, channel: Channel) -> tokio::sync::broadcast::Receiver<MarketEvent> {
        self.inner.events.subscribe(channel)
    }

    // ---- submission ----

    /// Create a job and lock its estimated cost in escrow.
    ///
    /// The job is returned PENDING. Assignment happens in the background once
    /// the lock has enough confirmations.
    ///
    /// # Errors
    ///
    /// - `Validation` for bad hours, price or owner address
    /// - `Gateway` if the ledger refuses the lock; the job is not kept
    pub async fn submit(&self, spec: JobSpec) -> Result<Job> {
        let inner = &self.inner;
        if spec.owner_id.trim().is_empty() {
            return Err(MarketError::validation("owner id must not be empty"));
        }
        let owner_address = Address::parse(&spec.owner_address)?;
        let max_price = spec
            .max_price_per_hour
            .map(|price| parse_price(price, "max price per hour"))
            .transpose()?;
        let price = max_price.unwrap_or_else(|| inner.config.default_price());
        let estimated_cost = estimate_cost(spec.compute_hours, price)?;

        let job = Job::new(
            spec.owner_id.as_str(),
            owner_address,
            spec.compute_hours,
            max_price,
            estimated_cost,
        );
        let created = json!({
            "ownerId": job.owner_id,
            "computeHours": job.compute_hours,
            "maxPricePerHour": job.max_price_per_hour,
            "estimatedCost": job.estimated_cost,
        });
        let job = inner.store.insert_job(
            job.clone(),
            &inner.events,
            vec![
                (
                    Channel::job(&job.id),
                    MarketEvent::new(EventType::JobCreated)
                        .status(JobStatus::Pending)
                        .data(created.clone()),
                ),
                (
                    Channel::Marketplace,
                    MarketEvent::new(EventType::JobCreated).data(created),
                ),
            ],
        )?;
        info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            estimated_cost = %job.estimated_cost,
            "job submitted"
        );

        let receipt = match inner
            .escrow
            .lock(&job.id, &spec.payer, inner.custodian.as_str(), estimated_cost)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "escrow lock failed, discarding job");
                inner.store.remove_job(&job.id);
                return Err(e);
            }
        };

        let (job, _) = inner.store.commit_job(&job.id, &inner.events, |j| {
            j.escrow_ref = Some(receipt.tx_ref.clone());
            Ok(Change::Commit(vec![(
                Channel::job(&j.id),
                MarketEvent::new(EventType::JobUpdated)
                    .status(j.status)
                    .data(json!({ "escrowId": receipt.escrow_id, "txRef": receipt.tx_ref })),
            )]))
        })?;

        self.supervise_lock(&job.id, receipt.escrow_id);
        Ok(job)
    }

    /// Wait for the lock to confirm, then assign. Runs in the background.
    fn supervise_lock(&self, job_id: &str, escrow_id: String) {
        let mut supervisors = self.inner.supervisors.lock();
        if supervisors.contains_key(job_id) {
            return;
        }
        let this = self.clone();
        let job = job_id.to_string();
        let handle = tokio::spawn(async move {
            match this.inner.escrow.wait_for_confirmation(&escrow_id).await {
                Ok(()) => {
                    this.try_assign(&job);
                }
                Err(e) => {
                    warn!(job_id = %job, escrow_id = %escrow_id, error = %e, "escrow lock not confirmed");
                    let message = format!("escrow lock not confirmed: {e}");
                    let recorded = this.inner.store.commit_job(&job, &this.inner.events, |j| {
                        j.error = Some(message.clone());
                        Ok(Change::Commit(vec![(
                            Channel::job(&j.id),
                            MarketEvent::new(EventType::JobUpdated)
                                .status(j.status)
                                .data(json!({ "error": message, "kind": e.kind() })),
                        )]))
                    });
                    if let Err(e) = recorded {
                        debug!(job_id = %job, error = %e, "could not record lock failure");
                    }
                }
            }
            this.inner.supervisors.lock().remove(&job);
        });
        supervisors.insert(job_id.to_string(), handle);
    }

    // ---- worker reports ----

    /// Record a progress report from the assigned worker.
    ///
    /// The first report with progress above zero moves the job to RUNNING.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the job does not exist
    /// - `Forbidden` if the worker is not assigned to the job
    /// - `Conflict` if the job is not ASSIGNED or RUNNING
    pub fn ingest_progress(&self, report: ProgressReport) -> Result<ProgressUpdate> {
        let inner = &self.inner;
        let progress = clamp_progress(report.progress);
        let job = self.job(&report.job_id)?;
        let provider = self.authorize(&job, &report.worker_id)?;

        let now = Utc::now();
        let mut started = false;
        let mut time_remaining_secs = None;
        let mut cost_so_far = None;

        let (job, _) = inner.store.commit_job(&job.id, &inner.events, |j| {
            if !j.status.is_active() {
                return Err(MarketError::conflict(format!(
                    "job {} is {}, progress is only accepted while ASSIGNED or RUNNING",
                    j.id, j.status
                )));
            }
            if j.provider_id.as_deref() != Some(provider.id.as_str()) {
                return Err(not_assigned(&report.worker_id, &j.id));
            }

            j.progress = progress;
            if let Some(operation) = &report.operation {
                j.current_operation = Some(operation.clone());
            }
            if j.status == JobStatus::Assigned && progress > 0 {
                j.transition_to(JobStatus::Running)?;
                j.started_at = Some(now);
                started = true;
            }

            let elapsed = j.started_at.map(|s| elapsed_between(s, now));
            time_remaining_secs = elapsed
                .and_then(|e| estimate_time_remaining(e, progress))
                .map(|d| d.as_secs_f64());
            cost_so_far = elapsed.map(|e| calculate_cost(e, provider.price_per_hour));

            let mut emit = vec![(
                Channel::job(&j.id),
                MarketEvent::new(EventType::JobProgress)
                    .status(j.status)
                    .data(json!({
                        "progress": progress,
                        "operation": j.current_operation,
                        "timeRemainingSecs": time_remaining_secs,
                        "costSoFar": cost_so_far,
                        "metrics": report.metrics.last(),
                    })),
            )];
            if !report.log_lines.is_empty() {
                emit.push((
                    Channel::job(&j.id),
                    MarketEvent::new(EventType::JobLogs).data(json!({ "lines": report.log_lines })),
                ));
            }
            Ok(Change::Commit(emit))
        })?;

        inner.store.append_metrics(&job.id, &report.metrics);
        inner.store.append_logs(&job.id, &report.log_lines);

        if started {
            info!(job_id = %job.id, provider_id = %provider.id, "job running");
        } else {
            debug!(job_id = %job.id, progress, "progress ingested");
        }

        Ok(ProgressUpdate {
            job,
            time_remaining_secs,
            cost_so_far,
        })
    }

    /// Record a terminal report from the assigned worker.
    ///
    /// Frees the provider, settles the escrow (release on success, refund on
    /// failure) and, for failures, hands the job to the reassignment policy.
    /// A report for a job that is already terminal returns it unchanged.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the job does not exist
    /// - `Forbidden` if the worker is not assigned to the job
    /// - `Conflict` if the job is still PENDING
    ///
    /// Ledger failures during settlement do not fail the call; they leave
    /// the job's payment pending.
    pub async fn complete(&self, report: CompletionReport) -> Result<Job> {
        let job = self.job(&report.job_id)?;
        let provider = self.authorize(&job, &report.worker_id)?;
        if job.status.is_terminal() {
            debug!(job_id = %job.id, "duplicate terminal report ignored");
            return Ok(job);
        }

        let reported_secs = report
            .metrics
            .as_ref()
            .and_then(|m| m.processing_time_seconds);
        self.finish_job(
            &job.id,
            &provider,
            report.status,
            report.result,
            report.error,
            reported_secs,
        )
        .await
    }

    pub(crate) async fn finish_job(
        &self,
        job_id: &str,
        provider: &Provider,
        outcome: Outcome,
        result: Option<serde_json::Value>,
        error: Option<String>,
        reported_secs: Option<f64>,
    ) -> Result<Job> {
        let inner = &self.inner;
        let now = Utc::now();
        let mut actual_cost = Amount::ZERO;

        let (job, changed) = inner.store.commit_job(job_id, &inner.events, |j| {
            if j.status.is_terminal() {
                return Ok(Change::Unchanged);
            }
            if j.provider_id.as_deref() != Some(provider.id.as_str()) {
                return Err(not_assigned(&provider.worker_id, &j.id));
            }

            let settlement = settle_job(&JobSettlementInput {
                job_id: j.id.clone(),
                started_at: j.started_at,
                finished_at: now,
                reported_duration_secs: reported_secs,
                rate_per_hour: provider.price_per_hour,
            })?;

            match outcome {
                Outcome::Completed => {
                    j.transition_to(JobStatus::Completed)?;
                    j.progress = 100;
                    j.result = result;
                    j.payment_status = PaymentStatus::ReleasePending;
                }
                Outcome::Failed => {
                    j.transition_to(JobStatus::Failed)?;
                    j.error = Some(error.unwrap_or_else(|| "job failed".to_string()));
                    j.payment_status = PaymentStatus::RefundPending;
                }
            }
            j.completed_at = Some(now);
            j.actual_cost = Some(settlement.actual_cost);
            j.actual_duration_secs = Some(settlement.duration_secs);
            actual_cost = settlement.actual_cost;

            let summary = json!({
                "success": outcome == Outcome::Completed,
                "providerId": provider.id,
                "actualCost": settlement.actual_cost,
                "durationSecs": settlement.duration_secs,
                "error": j.error,
                "result": j.result,
            });
            Ok(Change::Commit(vec![
                (
                    Channel::job(&j.id),
                    MarketEvent::new(EventType::JobCompleted)
                        .status(j.status)
                        .data(summary.clone()),
                ),
                (
                    Channel::user(&j.owner_id),
                    MarketEvent::new(EventType::JobCompletionNotification)
                        .status(j.status)
                        .data(summary),
                ),
            ]))
        })?;

        if !changed {
            return Ok(job);
        }

        info!(
            job_id,
            provider_id = %provider.id,
            status = %job.status,
            actual_cost = %actual_cost,
            "job finished"
        );

        self.free_provider(provider, job_id, outcome, actual_cost);
        self.settle_payment(&job, provider, outcome).await;

        if outcome == Outcome::Failed {
            self.handle_failure(job_id)?;
        }
        self.assign_pending();

        self.job(job_id)
    }

    fn free_provider(&self, provider: &Provider, job_id: &str, outcome: Outcome, earned: Amount) {
        let inner = &self.inner;
        let updated = inner.store.update_provider(&provider.id, |p| {
            if p.current_job_id.as_deref() == Some(job_id) {
                p.release();
            }
            if outcome == Outcome::Completed {
                p.completed_jobs += 1;
                p.total_earnings = p.total_earnings + earned;
            }
        });
        let provider = match updated {
            Ok(((), provider)) => provider,
            Err(e) => {
                warn!(job_id, provider_id = %provider.id, error = %e, "could not free provider");
                return;
            }
        };

        if outcome == Outcome::Completed {
            inner.events.publish(
                &Channel::provider(&provider.id),
                MarketEvent::new(EventType::EarningsUpdate)
                    .job(job_id)
                    .data(json!({
                        "amount": earned,
                        "totalEarnings": provider.total_earnings,
                        "completedJobs": provider.completed_jobs,
                    })),
            );
        }
        if provider.available {
            inner.events.publish(
                &Channel::Marketplace,
                MarketEvent::new(EventType::ProviderAvailable)
                    .data(json!({ "providerId": provider.id })),
            );
        }
    }

    async fn settle_payment(&self, job: &Job, provider: &Provider, outcome: Outcome) {
        let inner = &self.inner;
        let Some(amount) = inner.escrow.locked_amount(&job.id) else {
            warn!(job_id = %job.id, "job has no confirmed escrow lock, nothing to settle");
            return;
        };

        let result = match outcome {
            Outcome::Completed => {
                inner
                    .escrow
                    .release(&job.id, &provider.payout_address, amount)
                    .await
            }
            Outcome::Failed => inner.escrow.refund(&job.id, &job.owner_address, amount).await,
        };

        let status = match result {
            Ok(receipt) => {
                debug!(job_id = %job.id, tx_ref = %receipt.tx_ref, "payment settled");
                self.payment_status_from_records(&job.id)
            }
            Err(e) if e.kind() == ErrorKind::Conflict => {
                warn!(job_id = %job.id, error = %e, "escrow for this job was already settled");
                self.payment_status_from_records(&job.id)
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "settlement failed, payment pending");
                self.payment_status_from_records(&job.id)
            }
        };
        self.record_payment_status(&job.id, status);
    }

    /// Payment status implied by the job's settlement record.
    fn payment_status_from_records(&self, job_id: &str) -> PaymentStatus {
        match self.inner.store.settlement_record(job_id) {
            Some(r) if r.kind == EscrowKind::Release && r.status == RecordStatus::Confirmed => {
                PaymentStatus::Released
            }
            Some(r) if r.kind == EscrowKind::Refund && r.status == RecordStatus::Confirmed => {
                PaymentStatus::Refunded
            }
            Some(r) if r.kind == EscrowKind::Release => PaymentStatus::ReleasePending,
            Some(_) => PaymentStatus::RefundPending,
            None => PaymentStatus::Unsettled,
        }
    }

    fn record_payment_status(&self, job_id: &str, status: PaymentStatus) {
        let inner = &self.inner;
        let committed = inner.store.commit_job(job_id, &inner.events, |j| {
            if j.payment_status == status {
                return Ok(Change::Unchanged);
            }
            j.payment_status = status;
            Ok(Change::Commit(vec![(
                Channel::job(&j.id),
                MarketEvent::new(EventType::JobUpdated)
                    .status(j.status)
                    .data(json!({ "paymentStatus": status })),
            )]))
        });
        if let Err(e) = committed {
            warn!(job_id, error = %e, "could not record payment status");
        }
    }

    /// Re-submit a release or refund the ledger did not accept.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the job or its settlement record does not exist
    /// - `Conflict` if the payment is already settled
    /// - `Gateway` if the ledger fails again
    pub async fn retry_payment(&self, job_id: &str) -> Result<Job> {
        self.job(job_id)?;
        let result = self.inner.escrow.retry_settlement(job_id).await;
        let status = self.payment_status_from_records(job_id);
        self.record_payment_status(job_id, status);
        result?;
        self.job(job_id)
    }

    // ---- providers ----

    /// Register a provider. It starts online and idle.
    ///
    /// # Errors
    ///
    /// - `Validation` for a bad price, address or worker id
    /// - `Conflict` if the worker is already registered
    pub fn register_provider(&self, registration: ProviderRegistration) -> Result<Provider> {
        let inner = &self.inner;
        if registration.worker_id.trim().is_empty() {
            return Err(MarketError::validation("worker id must not be empty"));
        }
        let payout_address = Address::parse(&registration.payout_address)?;
        let price = parse_price(registration.price_per_hour, "price per hour")?;

        let provider = inner.store.insert_provider(Provider::new(
            registration.worker_id,
            payout_address,
            price,
        ))?;
        info!(
            provider_id = %provider.id,
            worker_id = %provider.worker_id,
            price_per_hour = %provider.price_per_hour,
            "provider registered"
        );
        inner.events.publish(
            &Channel::Marketplace,
            MarketEvent::new(EventType::ProviderRegistered).data(json!({
                "providerId": provider.id,
                "workerId": provider.worker_id,
                "pricePerHour": provider.price_per_hour,
            })),
        );

        self.assign_pending();
        self.provider(&provider.id)
    }

    /// Record a heartbeat from a worker.
    ///
    /// An online, idle provider triggers an assignment pass over waiting
    /// jobs.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the worker is not registered.
    pub fn provider_heartbeat(&self, worker_id: &str, online: bool) -> Result<Provider> {
        let inner = &self.inner;
        let provider = inner
            .store
            .provider_by_worker(worker_id)
            .ok_or_else(|| MarketError::provider_not_found(worker_id))?;
        let ((), provider) = inner.store.update_provider(&provider.id, |p| {
            p.last_heartbeat = Utc::now();
            p.online = online;
        })?;
        debug!(provider_id = %provider.id, online, "provider heartbeat");

        if provider.online && provider.available {
            self.assign_pending();
        }
        self.provider(&provider.id)
    }

    // ---- queries ----

    /// Look up a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job does not exist.
    pub fn job(&self, job_id: &str) -> Result<Job> {
        self.inner
            .store
            .job(job_id)
            .ok_or_else(|| MarketError::job_not_found(job_id))
    }

    /// Jobs submitted by a user, oldest first.
    #[must_use]
    pub fn jobs_for_owner(&self, owner_id: &str) -> Vec<Job> {
        self.inner.store.jobs_for_owner(owner_id)
    }

    /// Look up a provider.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the provider does not exist.
    pub fn provider(&self, provider_id: &str) -> Result<Provider> {
        self.inner
            .store
            .provider(provider_id)
            .ok_or_else(|| MarketError::provider_not_found(provider_id))
    }

    /// All providers.
    #[must_use]
    pub fn providers(&self) -> Vec<Provider> {
        self.inner.store.providers()
    }

    /// Escrow summary for a job; `None` if it never locked funds.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job does not exist.
    pub async fn escrow_status(&self, job_id: &str) -> Result<Option<EscrowStatus>> {
        self.job(job_id)?;
        Ok(self.inner.escrow.status(job_id).await)
    }

    /// Metric samples reported for a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job does not exist.
    pub fn job_metrics(&self, job_id: &str) -> Result<Vec<MetricSample>> {
        self.job(job_id)?;
        Ok(self.inner.store.metrics(job_id))
    }

    /// Log lines reported for a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job does not exist.
    pub fn job_logs(&self, job_id: &str) -> Result<Vec<LogLine>> {
        self.job(job_id)?;
        Ok(self.inner.store.logs(job_id))
    }

    // ---- persistence and shutdown ----

    /// Write the store to `dir`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the snapshot cannot be written.
    pub fn save_snapshot(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        self.inner.store.save_snapshot(dir)
    }

    /// Pick up work left in the store by a previous run: restart polling for
    /// pending locks, supervise their jobs, and assign waiting jobs.
    ///
    /// Returns the number of locks being polled again.
    pub fn resume(&self) -> usize {
        let inner = &self.inner;
        let resumed = inner.escrow.resume_polling();
        for record in inner.escrow.pending_locks() {
            if inner.store.contains_job(&record.job_id) {
                self.supervise_lock(&record.job_id, record.id.clone());
            }
        }
        let assigned = self.assign_pending();
        info!(resumed, assigned, "resumed market state");
        resumed
    }

    /// Stop every background task owned by the controller.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.escrow.shutdown();
        for (_, handle) in inner.supervisors.lock().drain() {
            handle.abort();
        }
        for (_, handle) in inner.timers.lock().drain() {
            handle.abort();
        }
        info!("job controller stopped");
    }

    fn authorize(&self, job: &Job, worker_id: &str) -> Result<Provider> {
        job.provider_id
            .as_deref()
            .and_then(|id| self.inner.store.provider(id))
            .filter(|p| p.worker_id == worker_id)
            .ok_or_else(|| not_assigned(worker_id, &job.id))
    }
}

fn not_assigned(worker_id: &str, job_id: &str) -> MarketError {
    MarketError::forbidden(format!("worker {worker_id} is not assigned to job {job_id}"))
}

fn parse_price(price: f64, what: &str) -> Result<Amount> {
    if !price.is_finite() || price <= 0.0 {
        return Err(MarketError::validation(format!(
            "{what} must be a positive number, got {price}"
        )));
    }
    let amount = Amount::try_credits(price)?;
    if amount.is_zero() {
        return Err(MarketError::validation(format!("{what} rounds to zero")));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::CompletionMetrics;
    use ledger_gateway::{InMemoryLedger, LedgerOp, PayerCredential, ADDRESS_LEN};
    use std::time::Duration;

    fn addr(c: char) -> String {
        c.to_string().repeat(ADDRESS_LEN)
    }

    fn config() -> MarketConfig {
        MarketConfig {
            poll_interval_ms: 2,
            max_poll_attempts: 50,
            assignment_timeout_secs: 3_600,
            ..MarketConfig::default()
        }
        .with_escrow_address(Address::parse(&addr('E')).expect("address"))
    }

    fn controller() -> (JobController, InMemoryLedger) {
        let ledger = InMemoryLedger::new();
        let controller =
            JobController::new(config(), Arc::new(ledger.clone())).expect("controller");
        (controller, ledger)
    }

    fn spec(hours: f64, max_price: Option<f64>) -> JobSpec {
        JobSpec {
            owner_id: "user-1".into(),
            owner_address: addr('O'),
            payer: PayerCredential::new("owner-seed").expect("credential"),
            compute_hours: hours,
            max_price_per_hour: max_price,
        }
    }

    fn register(c: &JobController, worker: &str, price: f64) -> Provider {
        c.register_provider(ProviderRegistration {
            worker_id: worker.into(),
            payout_address: addr('P'),
            price_per_hour: price,
        })
        .expect("register")
    }

    async fn wait_for_status(c: &JobController, job_id: &str, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = c.job(job_id).expect("job");
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    async fn assigned_job(c: &JobController) -> Job {
        let job = c.submit(spec(2.0, Some(1.0))).await.expect("submit");
        wait_for_status(c, &job.id, JobStatus::Assigned).await
    }

    #[tokio::test]
    async fn test_submit_locks_estimated_cost() {
        let (c, ledger) = controller();
        let job = c.submit(spec(2.0, None)).await.expect("submit");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.estimated_cost, Amount::credits(2.0));
        assert!(job.escrow_ref.is_some());

        let txs = ledger.transactions_for_job(&job.id).await;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, Amount::credits(2.0));
        assert_eq!(txs[0].to.as_str(), addr('E'));
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let (c, ledger) = controller();
        for bad in [spec(0.0, None), spec(-1.0, None), spec(f64::NAN, None), spec(1.0, Some(0.0))] {
            let err = c.submit(bad).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        let mut bad_address = spec(1.0, None);
        bad_address.owner_address = "short".into();
        assert_eq!(c.submit(bad_address).await.unwrap_err().kind(), ErrorKind::Validation);

        assert_eq!(ledger.calls(LedgerOp::Lock).await, 0);
        assert!(c.jobs_for_owner("user-1").is_empty());
    }

    #[tokio::test]
    async fn test_submit_rolls_back_when_lock_fails() {
        let (c, ledger) = controller();
        ledger.fail_next(LedgerOp::Lock, 1, false).await;

        let err = c.submit(spec(1.0, None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Gateway);
        assert!(c.jobs_for_owner("user-1").is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_job_is_assigned() {
        let (c, _) = controller();
        let cheap = register(&c, "w-cheap", 0.8);
        register(&c, "w-pricey", 3.0);

        let job = assigned_job(&c).await;
        assert_eq!(job.provider_id.as_deref(), Some(cheap.id.as_str()));

        let status = c.escrow_status(&job.id).await.expect("status").expect("locked");
        assert_eq!(status.state, crate::escrow::EscrowState::Locked);
    }

    #[tokio::test]
    async fn test_job_waits_for_capacity() {
        let (c, _) = controller();
        let job = c.submit(spec(1.0, Some(1.0))).await.expect("submit");
        let lock = c.store().lock_record(&job.id).expect("lock record");
        c.escrow().wait_for_confirmation(&lock.id).await.expect("confirm");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(c.job(&job.id).expect("job").status, JobStatus::Pending);

        register(&c, "w-1", 0.5);
        assert_eq!(c.job(&job.id).expect("job").status, JobStatus::Assigned);
    }

    #[tokio::test]
    async fn test_progress_moves_to_running() {
        let (c, _) = controller();
        register(&c, "w-1", 1.0);
        let job = assigned_job(&c).await;
        let mut rx = c.subscribe(Channel::job(&job.id));

        let update = c
            .ingest_progress(ProgressReport::new(&job.id, "w-1", 50).with_operation("training"))
            .expect("progress");
        let event = loop {
            let event = rx.recv().await.expect("event");
            if event.event_type == EventType::JobProgress {
                break event;
            }
        };
        let data = event.data.expect("data");
        assert_eq!(data["progress"].as_u64(), Some(50));
        assert_eq!(update.job.status, JobStatus::Running);
        assert_eq!(update.job.progress, 50);
        assert_eq!(update.job.current_operation.as_deref(), Some("training"));
        assert!(update.job.started_at.is_some());
        assert!(update.cost_so_far.is_some());
    }

    #[tokio::test]
    async fn test_progress_is_clamped() {
        let (c, _) = controller();
        register(&c, "w-1", 1.0);
        let job = assigned_job(&c).await;

        let update = c
            .ingest_progress(ProgressReport::new(&job.id, "w-1", -5))
            .expect("progress");
        assert_eq!(update.job.progress, 0);
        assert_eq!(update.job.status, JobStatus::Assigned);

        let update = c
            .ingest_progress(ProgressReport::new(&job.id, "w-1", 150))
            .expect("progress");
        assert_eq!(update.job.progress, 100);
    }

    #[tokio::test]
    async fn test_progress_from_wrong_worker_is_forbidden() {
        let (c, _) = controller();
        register(&c, "w-1", 1.0);
        register(&c, "w-2", 2.0);
        let job = assigned_job(&c).await;

        let err = c
            .ingest_progress(ProgressReport::new(&job.id, "w-2", 10))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_progress_stores_telemetry() {
        let (c, _) = controller();
        register(&c, "w-1", 1.0);
        let job = assigned_job(&c).await;

        let mut report = ProgressReport::new(&job.id, "w-1", 10);
        report.metrics.push(MetricSample {
            gpu_utilization: Some(93.0),
            ..MetricSample::default()
        });
        report.log_lines.push(LogLine {
            level: crate::job::LogLevel::Info,
            message: "epoch 1".into(),
            timestamp: Utc::now(),
        });
        c.ingest_progress(report).expect("progress");

        assert_eq!(c.job_metrics(&job.id).expect("metrics").len(), 1);
        assert_eq!(c.job_logs(&job.id).expect("logs")[0].message, "epoch 1");
    }

    #[tokio::test]
    async fn test_completion_releases_and_pays_provider() {
        let (c, ledger) = controller();
        let provider = register(&c, "w-1", 1.0);
        let job = assigned_job(&c).await;
        c.ingest_progress(ProgressReport::new(&job.id, "w-1", 30))
            .expect("progress");

        let mut earnings = c.subscribe(Channel::provider(&provider.id));
        let mut owner = c.subscribe(Channel::user("user-1"));

        let done = c
            .complete(CompletionReport::completed(&job.id, "w-1"))
            .await
            .expect("complete");
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.actual_cost.is_some());
        assert_eq!(done.payment_status, PaymentStatus::Released);

        let provider = c.provider(&provider.id).expect("provider");
        assert!(provider.available);
        assert!(provider.current_job_id.is_none());
        assert_eq!(provider.completed_jobs, 1);

        let release = ledger
            .transactions_for_job(&job.id)
            .await
            .into_iter()
            .find(|tx| tx.kind == ledger_gateway::TransactionKind::Release)
            .expect("release tx");
        assert_eq!(release.amount, Amount::credits(2.0));
        assert_eq!(release.to.as_str(), addr('P'));

        assert_eq!(earnings.recv().await.expect("event").event_type, EventType::EarningsUpdate);
        assert_eq!(
            owner.recv().await.expect("event").event_type,
            EventType::JobCompletionNotification
        );
    }

    #[tokio::test]
    async fn test_completion_without_progress_uses_reported_time() {
        let (c, _) = controller();
        register(&c, "w-1", 2.0);
        let job = c.submit(spec(2.0, None)).await.expect("submit");
        let job = wait_for_status(&c, &job.id, JobStatus::Assigned).await;

        let mut report = CompletionReport::completed(&job.id, "w-1");
        report.metrics = Some(CompletionMetrics {
            processing_time_seconds: Some(1_800.0),
        });
        let done = c.complete(report).await.expect("complete");
        assert_eq!(done.actual_cost, Some(Amount::credits(1.0)));
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_a_noop() {
        let (c, ledger) = controller();
        register(&c, "w-1", 1.0);
        let job = assigned_job(&c).await;

        let first = c
            .complete(CompletionReport::completed(&job.id, "w-1"))
            .await
            .expect("complete");
        let second = c
            .complete(CompletionReport::completed(&job.id, "w-1"))
            .await
            .expect("noop");
        assert_eq!(first.revision, second.revision);
        assert_eq!(ledger.calls(LedgerOp::Release).await, 1);
    }

    #[tokio::test]
    async fn test_failed_release_leaves_payment_pending() {
        let (c, ledger) = controller();
        register(&c, "w-1", 1.0);
        let job = assigned_job(&c).await;
        ledger.fail_next(LedgerOp::Release, 1, true).await;

        let done = c
            .complete(CompletionReport::completed(&job.id, "w-1"))
            .await
            .expect("complete");
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.payment_status, PaymentStatus::ReleasePending);

        let paid = c.retry_payment(&job.id).await.expect("retry");
        assert_eq!(paid.payment_status, PaymentStatus::Released);
        assert_eq!(ledger.calls(LedgerOp::Release).await, 2);
    }

    #[tokio::test]
    async fn test_pending_job_cannot_complete() {
        let (c, _) = controller();
        let job = c.submit(spec(1.0, None)).await.expect("submit");
        let err = c
            .complete(CompletionReport::completed(&job.id, "w-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_register_provider_validation() {
        let (c, _) = controller();
        let bad_price = c.register_provider(ProviderRegistration {
            worker_id: "w-1".into(),
            payout_address: addr('P'),
            price_per_hour: 0.0,
        });
        assert_eq!(bad_price.unwrap_err().kind(), ErrorKind::Validation);

        let bad_address = c.register_provider(ProviderRegistration {
            worker_id: "w-1".into(),
            payout_address: "nope".into(),
            price_per_hour: 1.0,
        });
        assert_eq!(bad_address.unwrap_err().kind(), ErrorKind::Validation);

        register(&c, "w-1", 1.0);
        let duplicate = c.register_provider(ProviderRegistration {
            worker_id: "w-1".into(),
            payout_address: addr('P'),
            price_per_hour: 1.0,
        });
        assert_eq!(duplicate.unwrap_err().kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_provider() {
        let (c, _) = controller();
        register(&c, "w-1", 1.0);
        let p = c.provider_heartbeat("w-1", false).expect("heartbeat");
        assert!(!p.online);
        let p = c.provider_heartbeat("w-1", true).expect("heartbeat");
        assert!(p.online);
        assert_eq!(
            c.provider_heartbeat("unknown", true).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_queries_on_unknown_job() {
        let (c, _) = controller();
        assert_eq!(c.job("nope").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(c.job_logs("nope").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            c.escrow_status("nope").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_lock_records_error() {
        let ledger = InMemoryLedger::new().with_confirmation_step(0);
        let config = MarketConfig {
            max_poll_attempts: 3,
            ..config()
        };
        let c = JobController::new(config, Arc::new(ledger)).expect("controller");
        let job = c.submit(spec(1.0, None)).await.expect("submit");

        for _ in 0..500 {
            if c.job(&job.id).expect("job").error.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let job = c.job(&job.id).expect("job");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.expect("error").contains("not confirmed"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = JobController::new(MarketConfig::default(), Arc::new(InMemoryLedger::new()));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
    }
}
