//! # job-market
//!
//! Job lifecycle and escrow coordination for a GPU compute marketplace.
//!
//! This crate provides:
//!
//! - Escrow locking, confirmation polling, release and refund
//! - Provider matching (cheapest eligible, fewest completed jobs on ties)
//! - The job state machine driven by worker progress and completion reports
//! - Bounded reassignment of failed jobs
//! - Per-job, per-provider, per-user and marketplace event channels
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use job_market::{JobController, JobSpec, MarketConfig};
//! use ledger_gateway::{Address, InMemoryLedger, PayerCredential, ADDRESS_LEN};
//!
//! # async fn run() -> job_market::Result<()> {
//! let custodian = Address::parse(&"E".repeat(ADDRESS_LEN))?;
//! let config = MarketConfig::default().with_escrow_address(custodian);
//! let controller = JobController::new(config, Arc::new(InMemoryLedger::new()))?;
//!
//! let job = controller
//!     .submit(JobSpec {
//!         owner_id: "user-1".into(),
//!         owner_address: "O".repeat(ADDRESS_LEN),
//!         payer: PayerCredential::new("owner-seed")?,
//!         compute_hours: 2.0,
//!         max_price_per_hour: None,
//!     })
//!     .await?;
//! println!("job {} is {}", job.id, job.status);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod heartbeat;
pub mod job;
pub mod lifecycle;
pub mod matcher;
pub mod provider;
mod reassign;
pub mod settlement;
pub mod store;

pub use config::MarketConfig;
pub use error::{ErrorKind, MarketError, Result};
pub use escrow::{
    EscrowCoordinator, EscrowKind, EscrowRecord, EscrowSettings, EscrowState, EscrowStatus,
    LockFailure, LockReceipt, RecordStatus, SettlementReceipt,
};
pub use events::{Channel, EventBroadcaster, EventType, MarketEvent};
pub use heartbeat::{start_heartbeat_monitor, HeartbeatMonitorConfig, HeartbeatMonitorHandle};
pub use job::{
    CompletionMetrics, CompletionReport, Job, JobSpec, JobStatus, LogLevel, LogLine,
    MetricSample, Outcome, PaymentStatus, ProgressReport, ProgressUpdate,
};
pub use lifecycle::JobController;
pub use matcher::{ProviderMatcher, rank_providers, select_provider};
pub use provider::{Provider, ProviderRegistration};
pub use settlement::{calculate_cost, estimate_cost, settle_job, JobSettlementInput, SettlementResult};
pub use store::{MarketSnapshot, MarketStore};
