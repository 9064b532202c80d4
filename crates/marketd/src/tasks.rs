//! Background tasks run by the daemon.
//!
//! Each task loops until its [`CancellationToken`] is cancelled.

use std::path::PathBuf;
use std::time::Duration;

use job_market::{JobController, MarketEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// Periodically write the market snapshot to `state_dir`.
pub async fn run_snapshots(
    controller: JobController,
    state_dir: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        state_dir = %state_dir.display(),
        interval_secs = interval.as_secs(),
        "snapshot task started"
    );
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("snapshot task stopping");
                break;
            }
            _ = ticker.tick() => {
                match controller.save_snapshot(&state_dir) {
                    Ok(path) => tracing::debug!(path = %path.display(), "snapshot written"),
                    Err(e) => tracing::error!(error = %e, "snapshot failed"),
                }
            }
        }
    }
}

/// Log every published market event.
pub async fn run_event_log(mut events: broadcast::Receiver<MarketEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

fn log_event(event: &MarketEvent) {
    tracing::info!(
        target: "marketd::events",
        channel = %event.channel,
        event = ?event.event_type,
        job_id = event.job_id.as_deref().unwrap_or(""),
        status = event.status.as_deref().unwrap_or(""),
        revision = event.revision.unwrap_or_default(),
        "event"
    );
}
