//! Failure handling and assignment retries.
//!
//! A failed job goes back to PENDING until it has been reassigned
//! `max_reassignments` times; after that it stays FAILED. A job that finds
//! no provider gets a single timer that retries the match once
//! `assignment_timeout` has passed. Otherwise it waits for an opportunistic
//! pass triggered by a provider registering, heartbeating or finishing work.

use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{Channel, EventType, MarketEvent};
use crate::job::{Job, JobStatus};
use crate::lifecycle::JobController;
use crate::provider::Provider;
use crate::store::Change;

impl JobController {
    /// Apply the reassignment policy to a FAILED job.
    ///
    /// Jobs that are not FAILED are returned untouched.
    pub(crate) fn handle_failure(&self, job_id: &str) -> Result<Job> {
        let inner = &self.inner;
        let max = inner.config.max_reassignments;
        let mut requeued = false;

        let (job, _) = inner.store.commit_job(job_id, &inner.events, |j| {
            if j.status != JobStatus::Failed {
                return Ok(Change::Unchanged);
            }
            let last_error = j.error.clone();

            if j.reassignment_count < max {
                j.reset_for_reassignment()?;
                requeued = true;
                let data = json!({
                    "reassignmentCount": j.reassignment_count,
                    "maxReassignments": max,
                    "lastError": last_error,
                });
                return Ok(Change::Commit(vec![
                    (
                        Channel::job(&j.id),
                        MarketEvent::new(EventType::JobReassigning)
                            .status(j.status)
                            .data(data.clone()),
                    ),
                    (
                        Channel::Marketplace,
                        MarketEvent::new(EventType::JobReassigning).data(data),
                    ),
                ]));
            }

            let data = json!({
                "reassignmentCount": j.reassignment_count,
                "maxReassignments": max,
                "error": last_error,
            });
            Ok(Change::Commit(vec![
                (
                    Channel::job(&j.id),
                    MarketEvent::new(EventType::JobExhausted)
                        .status(j.status)
                        .data(data.clone()),
                ),
                (
                    Channel::user(&j.owner_id),
                    MarketEvent::new(EventType::JobExhausted)
                        .status(j.status)
                        .data(data),
                ),
            ]))
        })?;

        if !requeued {
            if job.status == JobStatus::Failed {
                warn!(
                    job_id,
                    reassignments = job.reassignment_count,
                    "reassignment budget exhausted, job stays failed"
                );
            }
            return Ok(job);
        }

        info!(
            job_id,
            reassignment = job.reassignment_count,
            max,
            "job requeued for reassignment"
        );
        self.try_assign(job_id);
        self.job(job_id)
    }

    /// Match a PENDING job now, or arm its assignment timer.
    pub(crate) fn try_assign(&self, job_id: &str) -> Option<Provider> {
        let job = self.inner.store.job(job_id)?;
        match self.inner.matcher.assign(job_id, job.max_price_per_hour) {
            Ok(Some(provider)) => {
                self.cancel_assignment_timer(job_id);
                Some(provider)
            }
            Ok(None) => {
                debug!(job_id, "no eligible provider, waiting");
                self.schedule_assignment_timeout(job_id);
                None
            }
            Err(e) => {
                debug!(job_id, error = %e, "job not assignable");
                None
            }
        }
    }

    /// Assign PENDING jobs whose lock is confirmed, oldest first.
    ///
    /// Returns how many were assigned.
    pub fn assign_pending(&self) -> usize {
        let inner = &self.inner;
        let waiting: Vec<Job> = inner
            .store
            .jobs_with_status(JobStatus::Pending)
            .into_iter()
            .filter(|j| j.escrow_ref.is_some() && inner.escrow.has_confirmed_lock(&j.id))
            .collect();

        let mut assigned = 0;
        for job in waiting {
            if !inner.store.providers().iter().any(|p| p.online && p.available) {
                break;
            }
            match inner.matcher.assign(&job.id, job.max_price_per_hour) {
                Ok(Some(_)) => {
                    self.cancel_assignment_timer(&job.id);
                    assigned += 1;
                }
                Ok(None) => {}
                Err(e) => debug!(job_id = %job.id, error = %e, "skipping job in assignment pass"),
            }
        }
        if assigned > 0 {
            debug!(assigned, "assignment pass");
        }
        assigned
    }

    /// Whether a job has an armed assignment timer.
    #[must_use]
    pub fn has_assignment_timer(&self, job_id: &str) -> bool {
        self.inner.timers.lock().contains_key(job_id)
    }

    fn schedule_assignment_timeout(&self, job_id: &str) {
        let mut timers = self.inner.timers.lock();
        if timers.contains_key(job_id) {
            return;
        }

        let this = self.clone();
        let job_id = job_id.to_string();
        let delay = self.inner.config.assignment_timeout();
        let key = job_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.inner.timers.lock().remove(&job_id);

            let Some(job) = this.inner.store.job(&job_id) else {
                return;
            };
            if job.status != JobStatus::Pending {
                return;
            }
            match this.inner.matcher.assign(&job_id, job.max_price_per_hour) {
                Ok(Some(provider)) => {
                    info!(job_id, provider_id = %provider.id, "assigned after timeout");
                }
                Ok(None) => {
                    info!(job_id, "assignment timed out, waiting for capacity");
                }
                Err(e) => debug!(job_id, error = %e, "assignment retry skipped"),
            }
        });
        timers.insert(key, handle);
    }

    fn cancel_assignment_timer(&self, job_id: &str) {
        if let Some(handle) = self.inner.timers.lock().remove(job_id) {
            handle.abort();
        }
    }
}
