//! Provider matching.
//!
//! Picks the cheapest eligible provider for a job and binds the two
//! together. Assignment is serialized through a single lock so a provider
//! can never be handed two jobs.

use std::cmp::Ordering;
use std::sync::Arc;

use ledger_gateway::Amount;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{MarketError, Result};
use crate::escrow::{EscrowKind, RecordStatus};
use crate::events::{Channel, EventBroadcaster, EventType, MarketEvent};
use crate::job::JobStatus;
use crate::provider::Provider;
use crate::store::{Change, MarketStore};

/// Ordering used to rank eligible providers: lowest price first, then
/// fewest completed jobs, then provider id.
#[must_use]
pub fn compare_providers(a: &Provider, b: &Provider) -> Ordering {
    a.price_per_hour
        .cmp(&b.price_per_hour)
        .then(a.completed_jobs.cmp(&b.completed_jobs))
        .then_with(|| a.id.cmp(&b.id))
}

/// Eligible providers in preference order.
pub fn rank_providers<'a>(
    providers: impl IntoIterator<Item = &'a Provider>,
    max_price: Option<Amount>,
) -> Vec<&'a Provider> {
    let mut eligible: Vec<&Provider> = providers
        .into_iter()
        .filter(|p| p.is_eligible(max_price))
        .collect();
    eligible.sort_by(|a, b| compare_providers(a, b));
    eligible
}

/// The best eligible provider, if any.
pub fn select_provider<'a>(
    providers: impl IntoIterator<Item = &'a Provider>,
    max_price: Option<Amount>,
) -> Option<&'a Provider> {
    providers
        .into_iter()
        .filter(|p| p.is_eligible(max_price))
        .min_by(|a, b| compare_providers(a, b))
}

/// Assigns PENDING jobs to providers.
#[derive(Debug)]
pub struct ProviderMatcher {
    store: Arc<MarketStore>,
    events: Arc<EventBroadcaster>,
    assignment: Mutex<()>,
}

impl ProviderMatcher {
    /// Create a matcher over the given store.
    #[must_use]
    pub fn new(store: Arc<MarketStore>, events: Arc<EventBroadcaster>) -> Self {
        Self {
            store,
            events,
            assignment: Mutex::new(()),
        }
    }

    /// Assign a job to the best eligible provider.
    ///
    /// Returns `Ok(None)` when no provider qualifies. On success the
    /// provider is marked busy and the job is ASSIGNED.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the job does not exist
    /// - `Conflict` if the job is not PENDING or its escrow lock is not
    ///   confirmed
    pub fn assign(&self, job_id: &str, max_price: Option<Amount>) -> Result<Option<Provider>> {
        let _serialized = self.assignment.lock();

        let job = self
            .store
            .job(job_id)
            .ok_or_else(|| MarketError::job_not_found(job_id))?;
        if job.status != JobStatus::Pending {
            return Err(MarketError::conflict(format!(
                "job {job_id} is {}, only PENDING jobs can be assigned",
                job.status
            )));
        }
        let locked = self
            .store
            .lock_record(job_id)
            .is_some_and(|r| r.kind == EscrowKind::Lock && r.status == RecordStatus::Confirmed);
        if !locked || job.escrow_ref.is_none() {
            return Err(MarketError::conflict(format!(
                "job {job_id} has no confirmed escrow lock"
            )));
        }

        let chosen = self.store.with_providers(|providers| {
            let id = select_provider(providers.values(), max_price)?.id.clone();
            let provider = providers.get_mut(&id)?;
            provider.occupy(job_id);
            Some(provider.clone())
        });
        let Some(provider) = chosen else {
            debug!(job_id, max_price = ?max_price.map(|p| p.to_string()), "no eligible provider");
            return Ok(None);
        };

        let committed = self.store.commit_job(job_id, &self.events, |job| {
            job.transition_to(JobStatus::Assigned)?;
            job.provider_id = Some(provider.id.clone());
            job.error = None;

            let offer = json!({
                "providerId": provider.id,
                "workerId": provider.worker_id,
                "pricePerHour": provider.price_per_hour,
                "computeHours": job.compute_hours,
                "estimatedCost": job.estimated_cost,
            });
            Ok(Change::Commit(vec![
                (
                    Channel::job(job_id),
                    MarketEvent::new(EventType::JobAssigned)
                        .status(JobStatus::Assigned)
                        .data(offer.clone()),
                ),
                (
                    Channel::provider(&provider.id),
                    MarketEvent::new(EventType::JobOffered).data(offer),
                ),
                (
                    Channel::Marketplace,
                    MarketEvent::new(EventType::ProviderBusy)
                        .data(json!({ "providerId": provider.id })),
                ),
            ]))
        });

        if let Err(e) = committed {
            self.roll_back_offer(job_id, &provider.id);
            return Err(e);
        }

        info!(
            job_id,
            provider_id = %provider.id,
            price_per_hour = %provider.price_per_hour,
            "job assigned"
        );
        Ok(Some(provider))
    }

    /// Hand a provider back after its job could not be committed.
    fn roll_back_offer(&self, job_id: &str, provider_id: &str) {
        match self.store.update_provider(provider_id, Provider::release) {
            Ok((_, provider)) => {
                debug!(job_id, provider_id, available = provider.available, "offer rolled back");
            }
            Err(e) => {
                warn!(job_id, provider_id, error = %e, "could not roll back provider offer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::EscrowRecord;
    use crate::job::Job;
    use chrono::Utc;
    use ledger_gateway::{Address, TxRef, ADDRESS_LEN};
    use proptest::prelude::*;

    fn address(c: char) -> Address {
        Address::parse(&c.to_string().repeat(ADDRESS_LEN)).expect("address")
    }

    fn provider(id: &str, price: f64, completed: u64) -> Provider {
        let mut p = Provider::new(format!("worker-{id}"), address('P'), Amount::credits(price));
        p.id = id.to_string();
        p.completed_jobs = completed;
        p
    }

    struct Fixture {
        store: Arc<MarketStore>,
        events: Arc<EventBroadcaster>,
        matcher: ProviderMatcher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MarketStore::new());
        let events = Arc::new(EventBroadcaster::new(64));
        let matcher = ProviderMatcher::new(Arc::clone(&store), Arc::clone(&events));
        Fixture {
            store,
            events,
            matcher,
        }
    }

    fn funded_job(f: &Fixture) -> String {
        let mut job = Job::new("user-1", address('O'), 2.0, None, Amount::credits(2.0));
        job.escrow_ref = Some(TxRef::from_string("lock-tx"));
        let job = f.store.insert_job(job, &f.events, Vec::new()).expect("insert");
        let record = EscrowRecord {
            id: format!("escrow-{}", job.id),
            job_id: job.id.clone(),
            kind: EscrowKind::Lock,
            amount: Amount::credits(2.0),
            status: RecordStatus::Confirmed,
            confirmations: 3,
            required_confirmations: 3,
            tx_ref: Some(TxRef::from_string("lock-tx")),
            counterparty: address('E'),
            error: None,
            failure: None,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };
        f.store
            .insert_escrow_checked(record, |_| Ok(()))
            .expect("escrow");
        job.id
    }

    #[test]
    fn test_lowest_price_wins() {
        let providers = [provider("a", 2.0, 0), provider("b", 1.0, 10), provider("c", 1.5, 0)];
        assert_eq!(select_provider(&providers, None).map(|p| p.id.as_str()), Some("b"));
    }

    #[test]
    fn test_tie_broken_by_fewest_completed_jobs() {
        let providers = [provider("a", 1.0, 5), provider("b", 1.0, 2)];
        assert_eq!(select_provider(&providers, None).map(|p| p.id.as_str()), Some("b"));
    }

    #[test]
    fn test_full_tie_broken_by_id() {
        let providers = [provider("z", 1.0, 0), provider("m", 1.0, 0)];
        assert_eq!(select_provider(&providers, None).map(|p| p.id.as_str()), Some("m"));
    }

    #[test]
    fn test_price_ceiling_filters() {
        let providers = [provider("a", 2.0, 0), provider("b", 3.0, 0)];
        assert!(select_provider(&providers, Some(Amount::credits(1.0))).is_none());
        assert_eq!(rank_providers(&providers, Some(Amount::credits(2.5))).len(), 1);
    }

    #[test]
    fn test_offline_and_busy_excluded() {
        let mut offline = provider("a", 0.5, 0);
        offline.online = false;
        let mut busy = provider("b", 0.6, 0);
        busy.occupy("other-job");
        let idle = provider("c", 0.9, 0);
        let providers = [offline, busy, idle];
        assert_eq!(select_provider(&providers, None).map(|p| p.id.as_str()), Some("c"));
    }

    #[tokio::test]
    async fn test_assign_flips_provider_and_job() {
        let f = fixture();
        f.store.insert_provider(provider("p1", 1.0, 0)).expect("provider");
        let job_id = funded_job(&f);
        let mut job_rx = f.events.subscribe(Channel::job(&job_id));
        let mut provider_rx = f.events.subscribe(Channel::provider("p1"));
        let mut market_rx = f.events.subscribe(Channel::Marketplace);

        let chosen = f
            .matcher
            .assign(&job_id, Some(Amount::credits(1.0)))
            .expect("assign")
            .expect("provider");
        assert_eq!(chosen.id, "p1");

        let job = f.store.job(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Assigned);
        assert_eq!(job.provider_id.as_deref(), Some("p1"));

        let p = f.store.provider("p1").expect("provider");
        assert!(!p.available);
        assert_eq!(p.current_job_id.as_deref(), Some(job_id.as_str()));

        assert_eq!(job_rx.recv().await.expect("event").event_type, EventType::JobAssigned);
        assert_eq!(provider_rx.recv().await.expect("event").event_type, EventType::JobOffered);
        assert_eq!(market_rx.recv().await.expect("event").event_type, EventType::ProviderBusy);
    }

    #[test]
    fn test_assign_without_provider_returns_none() {
        let f = fixture();
        let job_id = funded_job(&f);
        assert!(f.matcher.assign(&job_id, None).expect("assign").is_none());
        assert_eq!(f.store.job(&job_id).expect("job").status, JobStatus::Pending);
    }

    #[test]
    fn test_assign_requires_confirmed_lock() {
        let f = fixture();
        f.store.insert_provider(provider("p1", 1.0, 0)).expect("provider");
        let job = Job::new("user-1", address('O'), 1.0, None, Amount::credits(1.0));
        let job = f.store.insert_job(job, &f.events, Vec::new()).expect("insert");

        let err = f.matcher.assign(&job.id, None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
        assert!(f.store.provider("p1").expect("provider").available);
    }

    #[test]
    fn test_provider_never_gets_two_jobs() {
        let f = fixture();
        f.store.insert_provider(provider("p1", 1.0, 0)).expect("provider");
        let first = funded_job(&f);
        let second = funded_job(&f);

        assert!(f.matcher.assign(&first, None).expect("assign").is_some());
        assert!(f.matcher.assign(&second, None).expect("assign").is_none());

        let err = f.matcher.assign(&first, None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
    }

    #[test]
    fn test_roll_back_offer_frees_provider() {
        let f = fixture();
        let mut busy = provider("p1", 1.0, 0);
        busy.occupy("job-1");
        f.store.insert_provider(busy).expect("provider");

        f.matcher.roll_back_offer("job-1", "p1");
        let p = f.store.provider("p1").expect("provider");
        assert!(p.available);
        assert!(p.current_job_id.is_none());

        // An unknown provider is logged, not fatal.
        f.matcher.roll_back_offer("job-1", "missing");
        assert_eq!(f.store.providers().len(), 1);
    }

    fn arb_provider() -> impl Strategy<Value = Provider> {
        ("[a-z]{1,6}", 1u64..5_000_000, 0u64..20, any::<bool>(), any::<bool>()).prop_map(
            |(id, price_micros, completed, online, available)| {
                let mut p = provider(&id, 0.0, completed);
                p.price_per_hour = Amount::from_micros(price_micros);
                p.online = online;
                if !available {
                    p.occupy("busy");
                }
                p
            },
        )
    }

    proptest! {
        #[test]
        fn prop_selected_provider_is_minimal(
            providers in proptest::collection::vec(arb_provider(), 0..12),
            ceiling in proptest::option::of(1u64..5_000_000),
        ) {
            let max_price = ceiling.map(Amount::from_micros);
            let selected = select_provider(&providers, max_price);
            let eligible: Vec<_> = providers.iter().filter(|p| p.is_eligible(max_price)).collect();

            match selected {
                None => prop_assert!(eligible.is_empty()),
                Some(best) => {
                    for other in eligible {
                        prop_assert!(compare_providers(best, other) != Ordering::Greater);
                    }
                }
            }
        }

        #[test]
        fn prop_ranking_is_sorted(providers in proptest::collection::vec(arb_provider(), 0..12)) {
            let ranked = rank_providers(&providers, None);
            for pair in ranked.windows(2) {
                prop_assert!(compare_providers(pair[0], pair[1]) != Ordering::Greater);
            }
        }
    }
}
