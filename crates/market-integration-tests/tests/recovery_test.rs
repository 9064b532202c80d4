//! Integration tests for recovery paths.
//!
//! Covers what happens when things go wrong outside the happy path:
//! 1. Restart from a snapshot with a lock still confirming
//! 2. Ledger outages during settlement
//! 3. Providers that stop sending heartbeats

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use job_market::heartbeat::HEARTBEAT_TIMEOUT_REASON;
use job_market::{
    CompletionReport, ErrorKind, EscrowKind, EscrowState, Job, JobController, JobSpec, JobStatus,
    LockFailure, MarketConfig, PaymentStatus, ProgressReport, ProviderRegistration,
};
use ledger_gateway::{Address, InMemoryLedger, LedgerOp, PayerCredential, ADDRESS_LEN};

// ============================================================================
// Helper Functions
// ============================================================================

fn address(c: char) -> String {
    c.to_string().repeat(ADDRESS_LEN)
}

fn config(poll_interval_ms: u64) -> MarketConfig {
    MarketConfig {
        poll_interval_ms,
        max_poll_attempts: 100,
        assignment_timeout_secs: 3_600,
        ..MarketConfig::default()
    }
    .with_escrow_address(Address::parse(&address('E')).unwrap())
}

fn job_spec() -> JobSpec {
    JobSpec {
        owner_id: "bob".to_string(),
        owner_address: address('B'),
        payer: PayerCredential::new("bob-seed").unwrap(),
        compute_hours: 1.0,
        max_price_per_hour: None,
    }
}

fn register(controller: &JobController, worker: &str) {
    controller
        .register_provider(ProviderRegistration {
            worker_id: worker.to_string(),
            payout_address: address('P'),
            price_per_hour: 1.0,
        })
        .unwrap();
}

async fn wait_for_status(controller: &JobController, job_id: &str, status: JobStatus) -> Job {
    for _ in 0..1_000 {
        let job = controller.job(job_id).unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("job {job_id} never reached {status}");
}

// ============================================================================
// Snapshot and Resume
// ============================================================================

#[tokio::test]
async fn restart_resumes_confirming_lock() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = InMemoryLedger::new();

    // Polls so slowly that the lock is still pending at shutdown.
    let before = JobController::new(config(60_000), Arc::new(ledger.clone())).unwrap();
    register(&before, "worker-1");
    let job = before.submit(job_spec()).await.unwrap();
    assert_eq!(before.escrow().pending_locks().len(), 1);
    before.save_snapshot(dir.path()).unwrap();
    before.shutdown();

    let after = JobController::new(config(2), Arc::new(ledger.clone())).unwrap();
    assert!(after.store().load_snapshot(dir.path()).unwrap());
    assert_eq!(after.resume(), 1);

    let job = wait_for_status(&after, &job.id, JobStatus::Assigned).await;
    assert!(job.escrow_ref.is_some());
    let escrow = after.escrow_status(&job.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, EscrowState::Locked);
    assert_eq!(ledger.calls(LedgerOp::Lock).await, 1);
}

#[tokio::test]
async fn snapshot_keeps_settled_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = InMemoryLedger::new();
    let market = JobController::new(config(2), Arc::new(ledger.clone())).unwrap();
    register(&market, "worker-1");
    let job = market.submit(job_spec()).await.unwrap();
    wait_for_status(&market, &job.id, JobStatus::Assigned).await;
    market
        .ingest_progress(ProgressReport::new(&job.id, "worker-1", 40))
        .unwrap();
    market
        .complete(CompletionReport::completed(&job.id, "worker-1"))
        .await
        .unwrap();
    market.save_snapshot(dir.path()).unwrap();

    let restored = JobController::new(config(2), Arc::new(ledger)).unwrap();
    restored.store().load_snapshot(dir.path()).unwrap();
    assert_eq!(restored.resume(), 0);

    let job = restored.job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.payment_status, PaymentStatus::Released);
    assert_eq!(restored.providers()[0].completed_jobs, 1);
}

// ============================================================================
// Settlement Outages
// ============================================================================

#[tokio::test]
async fn refund_outage_is_retried() {
    let ledger = InMemoryLedger::new();
    let market = JobController::new(config(2), Arc::new(ledger.clone())).unwrap();
    register(&market, "worker-1");
    let job = market.submit(job_spec()).await.unwrap();
    wait_for_status(&market, &job.id, JobStatus::Assigned).await;

    ledger.fail_next(LedgerOp::Refund, 2, true).await;
    let job = market
        .complete(CompletionReport::failed(&job.id, "worker-1", "driver crash"))
        .await
        .unwrap();
    assert_eq!(job.payment_status, PaymentStatus::RefundPending);

    let escrow = market.escrow_status(&job.id).await.unwrap().unwrap();
    assert_eq!(escrow.pending_settlement, Some(EscrowKind::Refund));
    assert!(escrow.error.is_some());

    let err = market.retry_payment(&job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Gateway);

    let job = market.retry_payment(&job.id).await.unwrap();
    assert_eq!(job.payment_status, PaymentStatus::Refunded);
    assert_eq!(ledger.calls(LedgerOp::Refund).await, 3);

    let err = market.retry_payment(&job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn rejected_lock_discards_job() {
    let ledger = InMemoryLedger::new();
    let market = JobController::new(config(2), Arc::new(ledger.clone())).unwrap();
    ledger.fail_next(LedgerOp::Lock, 1, false).await;

    let err = market.submit(job_spec()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Gateway);
    assert!(market.jobs_for_owner("bob").is_empty());
    assert!(market.escrow().pending_locks().is_empty());

    // The next submission goes through.
    let job = market.submit(job_spec()).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn lock_timeout_stays_a_timeout() {
    let ledger = InMemoryLedger::new().with_confirmation_step(0);
    let market = JobController::new(
        MarketConfig {
            max_poll_attempts: 3,
            ..config(2)
        },
        Arc::new(ledger),
    )
    .unwrap();
    let job = market.submit(job_spec()).await.unwrap();
    let lock = market.store().lock_record(&job.id).unwrap();

    let first = market.escrow().wait_for_confirmation(&lock.id).await.unwrap_err();
    assert_eq!(first.kind(), ErrorKind::Timeout);

    // Later callers see the same kind, not a generic ledger failure.
    let again = market.escrow().wait_for_confirmation(&lock.id).await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::Timeout);

    let escrow = market.escrow_status(&job.id).await.unwrap().unwrap();
    assert_eq!(escrow.state, EscrowState::Failed);
    assert_eq!(escrow.failure, Some(LockFailure::TimedOut { attempts: 3 }));

    let wire = serde_json::to_value(&escrow).unwrap();
    assert_eq!(wire["failure"]["cause"], "timed_out");
    assert_eq!(market.job(&job.id).unwrap().status, JobStatus::Pending);
}

// ============================================================================
// Heartbeats
// ============================================================================

#[tokio::test]
async fn silent_provider_job_moves_to_live_provider() {
    let market = JobController::new(config(2), Arc::new(InMemoryLedger::new())).unwrap();
    register(&market, "worker-silent");
    let job = market.submit(job_spec()).await.unwrap();
    let job = wait_for_status(&market, &job.id, JobStatus::Assigned).await;
    let silent = job.provider_id.clone().unwrap();

    market
        .ingest_progress(ProgressReport::new(&job.id, "worker-silent", 20))
        .unwrap();
    register(&market, "worker-live");

    let later = Utc::now() + chrono::Duration::minutes(10);
    let expired = market
        .expire_stale_providers(later, Duration::from_secs(90))
        .await;
    // Both providers look stale at that instant; only one was busy.
    assert_eq!(expired.len(), 2);

    let job = market.job(&job.id).unwrap();
    assert_eq!(job.reassignment_count, 1);
    assert_eq!(job.error.as_deref(), Some(HEARTBEAT_TIMEOUT_REASON));
    assert_eq!(job.payment_status, PaymentStatus::Refunded);
    assert!(!market.provider(&silent).unwrap().online);

    // The live worker checks in and picks the job up.
    market.provider_heartbeat("worker-live", true).unwrap();
    let job = market.job(&job.id).unwrap();
    assert_eq!(job.status, JobStatus::Assigned);
    assert_ne!(job.provider_id.as_deref(), Some(silent.as_str()));
}
