//! Compute providers.

use chrono::{DateTime, Utc};
use ledger_gateway::{Address, Amount};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A hardware provider offering compute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /// Provider identifier.
    pub id: String,
    /// Identity the worker agent reports with.
    pub worker_id: String,
    /// Address releases are paid to.
    pub payout_address: Address,
    /// Heartbeats are arriving.
    pub online: bool,
    /// Not working on a job. `false` exactly when `current_job_id` is set.
    pub available: bool,
    /// Hourly price.
    pub price_per_hour: Amount,
    /// The job the provider is working on.
    pub current_job_id: Option<String>,
    /// Cumulative earnings from completed jobs.
    pub total_earnings: Amount,
    /// Number of successfully completed jobs.
    pub completed_jobs: u64,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
}

impl Provider {
    /// Create an online, idle provider.
    #[must_use]
    pub fn new(worker_id: impl Into<String>, payout_address: Address, price_per_hour: Amount) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            worker_id: worker_id.into(),
            payout_address,
            online: true,
            available: true,
            price_per_hour,
            current_job_id: None,
            total_earnings: Amount::ZERO,
            completed_jobs: 0,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// Whether the provider can take a job priced at most `max_price`.
    #[must_use]
    pub fn is_eligible(&self, max_price: Option<Amount>) -> bool {
        self.online && self.available && max_price.is_none_or(|max| self.price_per_hour <= max)
    }

    pub(crate) fn occupy(&mut self, job_id: &str) {
        self.available = false;
        self.current_job_id = Some(job_id.to_string());
    }

    pub(crate) fn release(&mut self) {
        self.available = true;
        self.current_job_id = None;
    }
}

/// Input to [`JobController::register_provider`](crate::JobController::register_provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistration {
    /// Worker identity.
    pub worker_id: String,
    /// Payout address, as entered.
    pub payout_address: String,
    /// Hourly price in credits.
    pub price_per_hour: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_gateway::ADDRESS_LEN;

    fn provider(price: f64) -> Provider {
        Provider::new(
            "worker-1",
            Address::parse(&"P".repeat(ADDRESS_LEN)).expect("address"),
            Amount::credits(price),
        )
    }

    #[test]
    fn test_new_provider_is_idle() {
        let p = provider(1.0);
        assert!(p.online);
        assert!(p.available);
        assert!(p.current_job_id.is_none());
    }

    #[test]
    fn test_eligibility() {
        let mut p = provider(1.0);
        assert!(p.is_eligible(None));
        assert!(p.is_eligible(Some(Amount::credits(1.0))));
        assert!(!p.is_eligible(Some(Amount::credits(0.5))));

        p.occupy("job-1");
        assert!(!p.is_eligible(None));
        p.release();
        p.online = false;
        assert!(!p.is_eligible(None));
    }

    #[test]
    fn test_occupy_and_release_keep_invariant() {
        let mut p = provider(1.0);
        p.occupy("job-1");
        assert_eq!(p.available, p.current_job_id.is_none());
        p.release();
        assert_eq!(p.available, p.current_job_id.is_none());
    }
}
