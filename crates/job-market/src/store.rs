//! In-memory tables for jobs, providers, escrow records and job telemetry.
//!
//! Each table sits behind its own `parking_lot::RwLock`. Locks are only held
//! for short synchronous sections and never across an `.await`. When two
//! tables are needed the order is jobs, then providers, then escrows.
//!
//! The whole store can be written to and read back from a JSON snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MarketError, Result};
use crate::escrow::{EscrowKind, EscrowRecord};
use crate::events::{Channel, EventBroadcaster, MarketEvent};
use crate::job::{Job, JobStatus, LogLine, MetricSample};
use crate::provider::Provider;

/// Samples and log lines kept per job; older entries are dropped first.
pub const MAX_TELEMETRY_PER_JOB: usize = 1_000;

/// File name of the snapshot inside the state directory.
pub const SNAPSHOT_FILE: &str = "market-state.json";

const SNAPSHOT_VERSION: u32 = 1;

/// Result of a job mutation closure.
pub(crate) enum Change {
    /// Commit the mutated job and publish these events.
    Commit(Vec<(Channel, MarketEvent)>),
    /// Leave the job as it was.
    Unchanged,
}

/// Serialized form of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    /// Format version.
    pub version: u32,
    /// When the snapshot was taken.
    pub taken_at: Option<DateTime<Utc>>,
    /// All jobs.
    pub jobs: Vec<Job>,
    /// All providers.
    pub providers: Vec<Provider>,
    /// All escrow records.
    pub escrows: Vec<EscrowRecord>,
    /// Metric samples by job.
    pub metrics: HashMap<String, Vec<MetricSample>>,
    /// Log lines by job.
    pub logs: HashMap<String, Vec<LogLine>>,
}

/// The marketplace tables.
#[derive(Debug, Default)]
pub struct MarketStore {
    jobs: RwLock<HashMap<String, Job>>,
    providers: RwLock<HashMap<String, Provider>>,
    escrows: RwLock<HashMap<String, EscrowRecord>>,
    metrics: RwLock<HashMap<String, Vec<MetricSample>>>,
    logs: RwLock<HashMap<String, Vec<LogLine>>>,
}

impl MarketStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- jobs ----

    /// Look up a job.
    #[must_use]
    pub fn job(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    /// Whether a job exists.
    #[must_use]
    pub fn contains_job(&self, id: &str) -> bool {
        self.jobs.read().contains_key(id)
    }

    /// All jobs, oldest first.
    #[must_use]
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Jobs submitted by an owner, oldest first.
    #[must_use]
    pub fn jobs_for_owner(&self, owner_id: &str) -> Vec<Job> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .values()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Jobs in a given status, oldest first.
    #[must_use]
    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Insert a new job and publish its creation events under the same lock.
    pub(crate) fn insert_job(
        &self,
        mut job: Job,
        events: &EventBroadcaster,
        emit: Vec<(Channel, MarketEvent)>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(MarketError::conflict(format!("job {} already exists", job.id)));
        }
        job.revision = 1;
        publish_job_events(&job, events, emit);
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    /// Remove a job. Only used to roll back a submission whose lock failed.
    pub(crate) fn remove_job(&self, id: &str) -> Option<Job> {
        let removed = self.jobs.write().remove(id);
        self.metrics.write().remove(id);
        self.logs.write().remove(id);
        removed
    }

    /// Apply `f` to a copy of the job and commit it atomically.
    ///
    /// On [`Change::Commit`] the revision is bumped and the events are
    /// published while the jobs lock is still held, so subscribers observe
    /// job events in commit order. If `f` fails or returns
    /// [`Change::Unchanged`] the stored job is untouched. Returns the job as
    /// stored afterwards and whether it changed.
    pub(crate) fn commit_job(
        &self,
        id: &str,
        events: &EventBroadcaster,
        f: impl FnOnce(&mut Job) -> Result<Change>,
    ) -> Result<(Job, bool)> {
        let mut jobs = self.jobs.write();
        let current = jobs.get(id).ok_or_else(|| MarketError::job_not_found(id))?;
        let mut draft = current.clone();

        match f(&mut draft)? {
            Change::Unchanged => Ok((current.clone(), false)),
            Change::Commit(emit) => {
                draft.revision += 1;
                draft.updated_at = Utc::now();
                debug!(job_id = id, revision = draft.revision, status = %draft.status, "job committed");
                publish_job_events(&draft, events, emit);
                jobs.insert(id.to_string(), draft.clone());
                Ok((draft, true))
            }
        }
    }

    // ---- providers ----

    /// Look up a provider.
    #[must_use]
    pub fn provider(&self, id: &str) -> Option<Provider> {
        self.providers.read().get(id).cloned()
    }

    /// Look up a provider by worker identity.
    #[must_use]
    pub fn provider_by_worker(&self, worker_id: &str) -> Option<Provider> {
        self.providers
            .read()
            .values()
            .find(|p| p.worker_id == worker_id)
            .cloned()
    }

    /// All providers, ordered by registration.
    #[must_use]
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self.providers.read().values().cloned().collect();
        providers.sort_by_key(|p| p.registered_at);
        providers
    }

    /// Insert a provider, rejecting a duplicate worker identity.
    pub(crate) fn insert_provider(&self, provider: Provider) -> Result<Provider> {
        let mut providers = self.providers.write();
        if providers.values().any(|p| p.worker_id == provider.worker_id) {
            return Err(MarketError::conflict(format!(
                "worker {} is already registered",
                provider.worker_id
            )));
        }
        providers.insert(provider.id.clone(), provider.clone());
        Ok(provider)
    }

    /// Mutate a provider in place.
    pub(crate) fn update_provider<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Provider) -> T,
    ) -> Result<(T, Provider)> {
        let mut providers = self.providers.write();
        let provider = providers
            .get_mut(id)
            .ok_or_else(|| MarketError::provider_not_found(id))?;
        let out = f(provider);
        Ok((out, provider.clone()))
    }

    /// Run `f` with the providers table locked for writing.
    pub(crate) fn with_providers<T>(&self, f: impl FnOnce(&mut HashMap<String, Provider>) -> T) -> T {
        f(&mut self.providers.write())
    }

    // ---- escrow records ----

    /// Look up an escrow record.
    #[must_use]
    pub fn escrow(&self, id: &str) -> Option<EscrowRecord> {
        self.escrows.read().get(id).cloned()
    }

    /// All escrow records of a job, oldest first.
    #[must_use]
    pub fn escrows_for_job(&self, job_id: &str) -> Vec<EscrowRecord> {
        let mut records: Vec<_> = self
            .escrows
            .read()
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Escrow records matching a predicate.
    #[must_use]
    pub fn escrows_where(&self, pred: impl Fn(&EscrowRecord) -> bool) -> Vec<EscrowRecord> {
        let mut records: Vec<_> = self
            .escrows
            .read()
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Insert an escrow record if `check` accepts the job's existing records.
    ///
    /// Check and insert happen under one write lock, so two callers racing
    /// for the same job cannot both pass the check.
    pub(crate) fn insert_escrow_checked(
        &self,
        record: EscrowRecord,
        check: impl FnOnce(&[&EscrowRecord]) -> Result<()>,
    ) -> Result<EscrowRecord> {
        let mut escrows = self.escrows.write();
        let existing: Vec<&EscrowRecord> = escrows
            .values()
            .filter(|r| r.job_id == record.job_id)
            .collect();
        check(&existing)?;
        escrows.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Mutate an escrow record in place.
    pub(crate) fn update_escrow(
        &self,
        id: &str,
        f: impl FnOnce(&mut EscrowRecord),
    ) -> Option<EscrowRecord> {
        let mut escrows = self.escrows.write();
        let record = escrows.get_mut(id)?;
        f(record);
        Some(record.clone())
    }

    /// Remove an escrow record.
    pub(crate) fn remove_escrow(&self, id: &str) -> Option<EscrowRecord> {
        self.escrows.write().remove(id)
    }

    /// The job's LOCK record, if any.
    #[must_use]
    pub fn lock_record(&self, job_id: &str) -> Option<EscrowRecord> {
        self.escrows
            .read()
            .values()
            .find(|r| r.job_id == job_id && r.kind == EscrowKind::Lock)
            .cloned()
    }

    /// The job's RELEASE or REFUND record, if any.
    #[must_use]
    pub fn settlement_record(&self, job_id: &str) -> Option<EscrowRecord> {
        self.escrows
            .read()
            .values()
            .find(|r| r.job_id == job_id && r.kind.is_settlement())
            .cloned()
    }

    // ---- telemetry ----

    /// Append metric samples for a job.
    pub(crate) fn append_metrics(&self, job_id: &str, samples: &[MetricSample]) {
        if samples.is_empty() {
            return;
        }
        let mut metrics = self.metrics.write();
        let entry = metrics.entry(job_id.to_string()).or_default();
        entry.extend_from_slice(samples);
        trim_front(entry);
    }

    /// Append log lines for a job.
    pub(crate) fn append_logs(&self, job_id: &str, lines: &[LogLine]) {
        if lines.is_empty() {
            return;
        }
        let mut logs = self.logs.write();
        let entry = logs.entry(job_id.to_string()).or_default();
        entry.extend_from_slice(lines);
        trim_front(entry);
    }

    /// Metric samples recorded for a job.
    #[must_use]
    pub fn metrics(&self, job_id: &str) -> Vec<MetricSample> {
        self.metrics.read().get(job_id).cloned().unwrap_or_default()
    }

    /// Log lines recorded for a job.
    #[must_use]
    pub fn logs(&self, job_id: &str) -> Vec<LogLine> {
        self.logs.read().get(job_id).cloned().unwrap_or_default()
    }

    // ---- snapshots ----

    /// Copy every table into a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MarketSnapshot {
        let jobs = self.jobs.read().values().cloned().collect();
        let providers = self.providers.read().values().cloned().collect();
        let escrows = self.escrows.read().values().cloned().collect();
        MarketSnapshot {
            version: SNAPSHOT_VERSION,
            taken_at: Some(Utc::now()),
            jobs,
            providers,
            escrows,
            metrics: self.metrics.read().clone(),
            logs: self.logs.read().clone(),
        }
    }

    /// Replace every table with the snapshot's contents.
    pub fn restore(&self, snapshot: MarketSnapshot) {
        let mut jobs = self.jobs.write();
        let mut providers = self.providers.write();
        let mut escrows = self.escrows.write();
        *jobs = snapshot.jobs.into_iter().map(|j| (j.id.clone(), j)).collect();
        *providers = snapshot
            .providers
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        *escrows = snapshot
            .escrows
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        *self.metrics.write() = snapshot.metrics;
        *self.logs.write() = snapshot.logs;
    }

    /// Write a snapshot to `dir/market-state.json`.
    ///
    /// The file is written next to the target and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or the file written.
    pub fn save_snapshot(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            MarketError::storage(format!("failed to create '{}': {e}", dir.display()))
        })?;

        let snapshot = self.snapshot();
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| MarketError::storage(format!("failed to encode snapshot: {e}")))?;

        let path = dir.join(SNAPSHOT_FILE);
        let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        std::fs::write(&tmp, bytes).map_err(|e| {
            MarketError::storage(format!("failed to write '{}': {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            MarketError::storage(format!("failed to replace '{}': {e}", path.display()))
        })?;

        debug!(
            path = %path.display(),
            jobs = snapshot.jobs.len(),
            providers = snapshot.providers.len(),
            "snapshot saved"
        );
        Ok(path)
    }

    /// Restore from `dir/market-state.json` if it exists.
    ///
    /// Returns `false` when there is no snapshot to load.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or decoded.
    pub fn load_snapshot(&self, dir: impl AsRef<Path>) -> Result<bool> {
        let path = dir.as_ref().join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(&path).map_err(|e| {
            MarketError::storage(format!("failed to read '{}': {e}", path.display()))
        })?;
        let snapshot: MarketSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
            MarketError::storage(format!("failed to decode '{}': {e}", path.display()))
        })?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(MarketError::storage(format!(
                "snapshot version {} is newer than supported version {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }

        info!(
            path = %path.display(),
            jobs = snapshot.jobs.len(),
            providers = snapshot.providers.len(),
            escrows = snapshot.escrows.len(),
            "restored market state"
        );
        self.restore(snapshot);
        Ok(true)
    }
}

fn publish_job_events(job: &Job, events: &EventBroadcaster, emit: Vec<(Channel, MarketEvent)>) {
    for (channel, mut event) in emit {
        if event.job_id.is_none() {
            event.job_id = Some(job.id.clone());
        }
        event.revision = Some(job.revision);
        events.publish(&channel, event);
    }
}

fn trim_front<T>(entries: &mut Vec<T>) {
    if entries.len() > MAX_TELEMETRY_PER_JOB {
        let excess = entries.len() - MAX_TELEMETRY_PER_JOB;
        entries.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::job::LogLevel;
    use ledger_gateway::{Address, Amount, ADDRESS_LEN};

    fn address(c: char) -> Address {
        Address::parse(&c.to_string().repeat(ADDRESS_LEN)).expect("address")
    }

    fn job() -> Job {
        Job::new("user-1", address('O'), 1.0, None, Amount::credits(1.0))
    }

    #[tokio::test]
    async fn test_commit_bumps_revision_and_publishes() {
        let store = MarketStore::new();
        let events = EventBroadcaster::new(16);
        let job = store
            .insert_job(job(), &events, Vec::new())
            .expect("insert");
        let mut rx = events.subscribe(Channel::job(&job.id));

        let (updated, changed) = store
            .commit_job(&job.id, &events, |j| {
                j.transition_to(JobStatus::Assigned)?;
                Ok(Change::Commit(vec![(
                    Channel::job(&j.id),
                    MarketEvent::new(EventType::JobAssigned),
                )]))
            })
            .expect("commit");

        assert!(changed);
        assert_eq!(updated.revision, 2);
        let event = rx.recv().await.expect("event");
        assert_eq!(event.revision, Some(2));
        assert_eq!(event.job_id.as_deref(), Some(job.id.as_str()));
    }

    #[test]
    fn test_failed_commit_leaves_job_untouched() {
        let store = MarketStore::new();
        let events = EventBroadcaster::new(16);
        let job = store.insert_job(job(), &events, Vec::new()).expect("insert");

        let result = store.commit_job(&job.id, &events, |j| {
            j.progress = 50;
            j.transition_to(JobStatus::Completed)?;
            Ok(Change::Commit(Vec::new()))
        });
        assert!(result.is_err());

        let stored = store.job(&job.id).expect("job");
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.progress, 0);
    }

    #[test]
    fn test_commit_unknown_job() {
        let store = MarketStore::new();
        let events = EventBroadcaster::new(16);
        let err = store
            .commit_job("missing", &events, |_| Ok(Change::Unchanged))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn test_duplicate_worker_rejected() {
        let store = MarketStore::new();
        store
            .insert_provider(Provider::new("w-1", address('P'), Amount::credits(1.0)))
            .expect("first");
        let err = store
            .insert_provider(Provider::new("w-1", address('Q'), Amount::credits(2.0)))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
    }

    #[test]
    fn test_telemetry_is_capped() {
        let store = MarketStore::new();
        let lines: Vec<_> = (0..MAX_TELEMETRY_PER_JOB + 10)
            .map(|i| LogLine {
                level: LogLevel::Info,
                message: format!("line {i}"),
                timestamp: Utc::now(),
            })
            .collect();
        store.append_logs("j1", &lines);

        let stored = store.logs("j1");
        assert_eq!(stored.len(), MAX_TELEMETRY_PER_JOB);
        assert_eq!(stored[0].message, "line 10");
    }

    #[test]
    fn test_snapshot_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MarketStore::new();
        let events = EventBroadcaster::new(16);
        let job = store.insert_job(job(), &events, Vec::new()).expect("insert");
        store
            .insert_provider(Provider::new("w-1", address('P'), Amount::credits(1.0)))
            .expect("provider");
        store.append_metrics(
            &job.id,
            &[MetricSample {
                gpu_utilization: Some(80.0),
                ..MetricSample::default()
            }],
        );

        store.save_snapshot(dir.path()).expect("save");

        let restored = MarketStore::new();
        assert!(restored.load_snapshot(dir.path()).expect("load"));
        assert_eq!(restored.job(&job.id).expect("job").owner_id, "user-1");
        assert_eq!(restored.providers().len(), 1);
        assert_eq!(restored.metrics(&job.id).len(), 1);
    }

    #[test]
    fn test_load_without_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MarketStore::new();
        assert!(!store.load_snapshot(dir.path()).expect("load"));
    }

    #[test]
    fn test_load_corrupt_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(SNAPSHOT_FILE), b"{not json").expect("write");
        let err = MarketStore::new().load_snapshot(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Storage);
    }
}
