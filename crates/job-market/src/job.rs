//! Job records and worker reports.

use std::fmt;

use chrono::{DateTime, Utc};
use ledger_gateway::{Address, Amount, PayerCredential, TxRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for escrow confirmation or for a provider.
    Pending,
    /// Offered to a provider that has not reported progress yet.
    Assigned,
    /// The provider reported progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl JobStatus {
    /// Checks if a transition to the target state is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: &Self) -> bool {
        use JobStatus::{Assigned, Completed, Failed, Pending, Running};

        matches!(
            (self, target),
            (Pending, Assigned)
                | (Assigned, Running)
                | (Assigned | Running, Completed | Failed)
                | (Failed, Pending)
        )
    }

    /// Whether the job has finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a provider is currently working on the job.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Assigned => "ASSIGNED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Where the job's escrowed payment stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// No settlement attempted yet.
    #[default]
    Unsettled,
    /// Release reserved but not yet accepted by the ledger.
    ReleasePending,
    /// Funds paid out to the provider.
    Released,
    /// Refund reserved but not yet accepted by the ledger.
    RefundPending,
    /// Funds returned to the owner.
    Refunded,
}

impl PaymentStatus {
    /// Whether a settlement is waiting on the ledger.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::ReleasePending | Self::RefundPending)
    }
}

/// A compute job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job identifier.
    pub id: String,
    /// The user who submitted the job.
    pub owner_id: String,
    /// Ledger address refunds go to.
    pub owner_address: Address,
    /// Assigned provider, if any.
    pub provider_id: Option<String>,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Progress in percent, 0 to 100.
    pub progress: u8,
    /// Requested compute hours.
    pub compute_hours: f64,
    /// Price ceiling per hour, if the owner set one.
    pub max_price_per_hour: Option<Amount>,
    /// Amount locked in escrow at submission.
    pub estimated_cost: Amount,
    /// Final cost; only set while the job is terminal.
    pub actual_cost: Option<Amount>,
    /// Measured run time in seconds.
    pub actual_duration_secs: Option<f64>,
    /// Escrow lock transaction.
    pub escrow_ref: Option<TxRef>,
    /// What the worker last said it was doing.
    pub current_operation: Option<String>,
    /// Worker-supplied result payload.
    pub result: Option<Value>,
    /// Last error message.
    pub error: Option<String>,
    /// Times the job has been put back to PENDING after a failure.
    pub reassignment_count: u32,
    /// Settlement progress.
    pub payment_status: PaymentStatus,
    /// Incremented on every committed change.
    pub revision: u64,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// First progress report.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal report.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last committed change.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new PENDING job.
    #[must_use]
    pub fn new(
        owner_id: impl Into<String>,
        owner_address: Address,
        compute_hours: f64,
        max_price_per_hour: Option<Amount>,
        estimated_cost: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            owner_address,
            provider_id: None,
            status: JobStatus::Pending,
            progress: 0,
            compute_hours,
            max_price_per_hour,
            estimated_cost,
            actual_cost: None,
            actual_duration_secs: None,
            escrow_ref: None,
            current_operation: None,
            result: None,
            error: None,
            reassignment_count: 0,
            payment_status: PaymentStatus::Unsettled,
            revision: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Move to `target`, rejecting invalid transitions.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::InvalidTransition`](crate::MarketError::InvalidTransition)
    /// if the state machine does not allow the move.
    pub fn transition_to(&mut self, target: JobStatus) -> crate::Result<()> {
        if self.status.can_transition_to(&target) {
            self.status = target;
            Ok(())
        } else {
            Err(crate::MarketError::InvalidTransition {
                from: self.status,
                to: target,
            })
        }
    }

    /// Put a failed job back in the queue.
    pub(crate) fn reset_for_reassignment(&mut self) -> crate::Result<()> {
        self.transition_to(JobStatus::Pending)?;
        self.provider_id = None;
        self.progress = 0;
        self.current_operation = None;
        self.actual_cost = None;
        self.actual_duration_secs = None;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        self.reassignment_count += 1;
        Ok(())
    }
}

/// Clamp a reported progress value into 0..=100.
#[must_use]
pub fn clamp_progress(progress: i64) -> u8 {
    u8::try_from(progress.clamp(0, 100)).unwrap_or(100)
}

/// Input to [`JobController::submit`](crate::JobController::submit).
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Submitting user.
    pub owner_id: String,
    /// Owner's ledger address, as entered.
    pub owner_address: String,
    /// Credential used to sign the escrow lock.
    pub payer: PayerCredential,
    /// Requested compute hours.
    pub compute_hours: f64,
    /// Optional price ceiling per hour, in credits.
    pub max_price_per_hour: Option<f64>,
}

/// Log severity reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug output.
    Debug,
    /// Normal output.
    #[default]
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
}

/// A log line sent with a progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    /// Severity.
    #[serde(default)]
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// When the worker produced the line.
    pub timestamp: DateTime<Utc>,
}

/// A resource sample sent with a progress report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricSample {
    /// GPU utilization in percent.
    pub gpu_utilization: Option<f64>,
    /// GPU memory in use, MiB.
    pub memory_used_mb: Option<u64>,
    /// GPU memory total, MiB.
    pub memory_total_mb: Option<u64>,
    /// GPU temperature, Celsius.
    pub temperature_c: Option<f64>,
    /// Power draw, watts.
    pub power_watts: Option<f64>,
    /// Sample time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Worker progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    /// Job being reported on.
    pub job_id: String,
    /// Reporting worker.
    pub worker_id: String,
    /// Progress in percent; clamped on ingest.
    pub progress: i64,
    /// Current operation, e.g. "training".
    #[serde(default)]
    pub operation: Option<String>,
    /// Resource samples.
    #[serde(default)]
    pub metrics: Vec<MetricSample>,
    /// Log lines.
    #[serde(default)]
    pub log_lines: Vec<LogLine>,
}

impl ProgressReport {
    /// A bare progress report.
    #[must_use]
    pub fn new(job_id: impl Into<String>, worker_id: impl Into<String>, progress: i64) -> Self {
        Self {
            job_id: job_id.into(),
            worker_id: worker_id.into(),
            progress,
            operation: None,
            metrics: Vec::new(),
            log_lines: Vec::new(),
        }
    }

    /// Attach the current operation.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// Result of ingesting a progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// The job after the update.
    pub job: Job,
    /// Linear estimate of the remaining run time.
    pub time_remaining_secs: Option<f64>,
    /// Cost accrued since the job started.
    pub cost_so_far: Option<Amount>,
}

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The job finished successfully.
    Completed,
    /// The job failed.
    Failed,
}

/// Metrics sent with a completion report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionMetrics {
    /// Processing time measured by the worker.
    pub processing_time_seconds: Option<f64>,
}

/// Worker completion report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    /// Job being reported on.
    pub job_id: String,
    /// Reporting worker.
    pub worker_id: String,
    /// Success or failure.
    pub status: Outcome,
    /// Result payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error description for failures.
    #[serde(default)]
    pub error: Option<String>,
    /// Worker metrics.
    #[serde(default)]
    pub metrics: Option<CompletionMetrics>,
}

impl CompletionReport {
    /// Successful completion.
    #[must_use]
    pub fn completed(job_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            worker_id: worker_id.into(),
            status: Outcome::Completed,
            result: None,
            error: None,
            metrics: None,
        }
    }

    /// Failed completion.
    #[must_use]
    pub fn failed(
        job_id: impl Into<String>,
        worker_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            worker_id: worker_id.into(),
            status: Outcome::Failed,
            result: None,
            error: Some(error.into()),
            metrics: None,
        }
    }
}
