//! Provider liveness monitor.
//!
//! A provider that has not sent a heartbeat for
//! `heartbeat_interval × missed_heartbeats` is marked offline, and the job it
//! was running is failed through the normal failure path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::MarketConfig;
use crate::events::{Channel, EventType, MarketEvent};
use crate::job::Outcome;
use crate::lifecycle::JobController;
use crate::provider::Provider;

/// Reason recorded on jobs failed by the monitor.
pub const HEARTBEAT_TIMEOUT_REASON: &str = "provider heartbeat timeout";

/// Configuration for the heartbeat monitor.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitorConfig {
    /// Interval between sweeps.
    pub interval: Duration,
    /// Silence after which a provider is offline.
    pub timeout: Duration,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

impl From<&MarketConfig> for HeartbeatMonitorConfig {
    fn from(config: &MarketConfig) -> Self {
        Self {
            interval: config.heartbeat_interval(),
            timeout: config.heartbeat_timeout(),
        }
    }
}

/// Handle for controlling the monitor task.
#[derive(Debug)]
pub struct HeartbeatMonitorHandle {
    running: Arc<AtomicBool>,
    expired: Arc<AtomicU64>,
}

impl HeartbeatMonitorHandle {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            expired: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check if the monitor is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Providers marked offline since the monitor started.
    #[must_use]
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::SeqCst)
    }

    /// Stop the monitor after its current sweep.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl JobController {
    /// Mark providers silent since before `now - timeout` offline and fail
    /// their jobs.
    ///
    /// Returns the providers that were expired.
    pub async fn expire_stale_providers(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Vec<Provider> {
        let inner = &self.inner;
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        let cutoff = now - timeout;

        let stale: Vec<Provider> = inner.store.with_providers(|providers| {
            providers
                .values_mut()
                .filter(|p| p.online && p.last_heartbeat < cutoff)
                .map(|p| {
                    p.online = false;
                    p.clone()
                })
                .collect()
        });

        for provider in &stale {
            warn!(
                provider_id = %provider.id,
                worker_id = %provider.worker_id,
                last_heartbeat = %provider.last_heartbeat,
                "provider missed heartbeats, marking offline"
            );
            let data = json!({
                "providerId": provider.id,
                "lastHeartbeat": provider.last_heartbeat,
                "jobId": provider.current_job_id,
            });
            inner.events.publish(
                &Channel::Marketplace,
                MarketEvent::new(EventType::ProviderOffline).data(data.clone()),
            );
            inner.events.publish(
                &Channel::provider(&provider.id),
                MarketEvent::new(EventType::ProviderOffline).data(data),
            );

            if let Some(job_id) = &provider.current_job_id {
                let failed = self
                    .finish_job(
                        job_id,
                        provider,
                        Outcome::Failed,
                        None,
                        Some(HEARTBEAT_TIMEOUT_REASON.to_string()),
                        None,
                    )
                    .await;
                if let Err(e) = failed {
                    warn!(job_id, provider_id = %provider.id, error = %e, "could not fail job of offline provider");
                }
            }
        }
        stale
    }
}

/// Start a periodic liveness sweep.
///
/// Returns a handle to control the task.
#[must_use]
pub fn start_heartbeat_monitor(
    controller: JobController,
    config: HeartbeatMonitorConfig,
) -> HeartbeatMonitorHandle {
    let handle = HeartbeatMonitorHandle::new();
    handle.running.store(true, Ordering::SeqCst);

    let running = Arc::clone(&handle.running);
    let expired = Arc::clone(&handle.expired);

    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(config.interval);

        while running.load(Ordering::SeqCst) {
            interval_timer.tick().await;

            if !running.load(Ordering::SeqCst) {
                break;
            }

            let stale = controller
                .expire_stale_providers(Utc::now(), config.timeout)
                .await;
            if !stale.is_empty() {
                expired.fetch_add(stale.len() as u64, Ordering::SeqCst);
            }
            debug!(expired = stale.len(), "heartbeat sweep");
        }
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSpec, JobStatus};
    use crate::provider::ProviderRegistration;
    use ledger_gateway::{Address, InMemoryLedger, PayerCredential, ADDRESS_LEN};

    fn addr(c: char) -> String {
        c.to_string().repeat(ADDRESS_LEN)
    }

    fn controller() -> JobController {
        let config = MarketConfig {
            poll_interval_ms: 2,
            assignment_timeout_secs: 3_600,
            ..MarketConfig::default()
        }
        .with_escrow_address(Address::parse(&addr('E')).expect("address"));
        JobController::new(config, Arc::new(InMemoryLedger::new())).expect("controller")
    }

    fn register(c: &JobController, worker: &str) -> Provider {
        c.register_provider(ProviderRegistration {
            worker_id: worker.into(),
            payout_address: addr('P'),
            price_per_hour: 1.0,
        })
        .expect("register")
    }

    #[test]
    fn test_monitor_config_default() {
        let config = HeartbeatMonitorConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_monitor_config_from_market_config() {
        let market = MarketConfig {
            heartbeat_interval_secs: 10,
            missed_heartbeats: 4,
            ..MarketConfig::default()
        };
        let config = HeartbeatMonitorConfig::from(&market);
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.timeout, Duration::from_secs(40));
    }

    #[test]
    fn test_handle_stop() {
        let handle = HeartbeatMonitorHandle::new();
        assert!(!handle.is_running());
        handle.running.store(true, Ordering::SeqCst);
        assert!(handle.is_running());
        handle.stop();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_fresh_providers_stay_online() {
        let c = controller();
        register(&c, "w-1");
        let stale = c
            .expire_stale_providers(Utc::now(), Duration::from_secs(90))
            .await;
        assert!(stale.is_empty());
        assert!(c.providers()[0].online);
    }

    #[tokio::test]
    async fn test_idle_provider_goes_offline() {
        let c = controller();
        let provider = register(&c, "w-1");
        let mut marketplace = c.subscribe(Channel::Marketplace);

        let later = Utc::now() + chrono::Duration::seconds(120);
        let stale = c.expire_stale_providers(later, Duration::from_secs(90)).await;
        assert_eq!(stale.len(), 1);
        assert!(!c.provider(&provider.id).expect("provider").online);
        assert_eq!(
            marketplace.recv().await.expect("event").event_type,
            EventType::ProviderOffline
        );

        let again = c.expire_stale_providers(later, Duration::from_secs(90)).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_silent_provider_fails_its_job() {
        let c = controller();
        let provider = register(&c, "w-1");
        let job = c
            .submit(JobSpec {
                owner_id: "user-1".into(),
                owner_address: addr('O'),
                payer: PayerCredential::new("seed").expect("credential"),
                compute_hours: 1.0,
                max_price_per_hour: None,
            })
            .await
            .expect("submit");
        for _ in 0..500 {
            if c.job(&job.id).expect("job").status == JobStatus::Assigned {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let later = Utc::now() + chrono::Duration::seconds(120);
        c.expire_stale_providers(later, Duration::from_secs(90)).await;

        let job = c.job(&job.id).expect("job");
        // Requeued, nobody else online.
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.reassignment_count, 1);
        assert_eq!(job.error.as_deref(), Some(HEARTBEAT_TIMEOUT_REASON));

        let provider = c.provider(&provider.id).expect("provider");
        assert!(!provider.online);
        assert!(provider.available);
    }

    #[tokio::test]
    async fn test_monitor_task_runs_and_stops() {
        let c = controller();
        register(&c, "w-1");
        let handle = start_heartbeat_monitor(
            c.clone(),
            HeartbeatMonitorConfig {
                interval: Duration::from_millis(5),
                timeout: Duration::ZERO,
            },
        );
        assert!(handle.is_running());

        for _ in 0..200 {
            if handle.expired() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.expired(), 1);
        handle.stop();
        assert!(!handle.is_running());
    }
}
