//! Cost and time arithmetic for jobs.
//!
//! # Precision
//!
//! Costs are computed in micro-credits with `u128` intermediates and
//! millisecond durations:
//!
//! `cost = ceiling(duration_ms × rate_micros_per_hour / 3_600_000)`
//!
//! Rounding is up, so a provider is never underpaid by rounding. Results
//! that would overflow `u64` saturate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ledger_gateway::Amount;
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, Result};

const MILLIS_PER_HOUR: u128 = 3_600_000;

/// Cost of running for `duration_ms` at `rate_micros` per hour, in micros.
///
/// # Examples
/// ```
/// use job_market::settlement::calculate_cost_micros;
///
/// // One hour at 1 credit/hour.
/// assert_eq!(calculate_cost_micros(3_600_000, 1_000_000), 1_000_000);
///
/// // One millisecond rounds up to a single micro-credit.
/// assert_eq!(calculate_cost_micros(1, 1_000_000), 1);
/// ```
#[must_use]
pub const fn calculate_cost_micros(duration_ms: u64, rate_micros: u64) -> u64 {
    if duration_ms == 0 || rate_micros == 0 {
        return 0;
    }

    let numerator = duration_ms as u128 * rate_micros as u128;
    let cost = numerator.div_ceil(MILLIS_PER_HOUR);

    if cost > u64::MAX as u128 {
        u64::MAX
    } else {
        cost as u64
    }
}

/// Cost of running for `duration` at `rate` per hour.
#[must_use]
pub fn calculate_cost(duration: Duration, rate: Amount) -> Amount {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    Amount::from_micros(calculate_cost_micros(millis, rate.micros()))
}

/// Up-front estimate: `compute_hours × price_per_hour`.
///
/// # Errors
///
/// Returns a validation error if the hours are not a positive finite
/// number, or if the estimate overflows or rounds to zero.
pub fn estimate_cost(compute_hours: f64, price_per_hour: Amount) -> Result<Amount> {
    if !compute_hours.is_finite() || compute_hours <= 0.0 {
        return Err(MarketError::validation(format!(
            "compute hours must be a positive number, got {compute_hours}"
        )));
    }
    let estimate = price_per_hour
        .checked_mul_f64(compute_hours)
        .ok_or_else(|| MarketError::validation("estimated cost is out of range"))?;
    if estimate.is_zero() {
        return Err(MarketError::validation("estimated cost rounds to zero"));
    }
    Ok(estimate)
}

/// Linear extrapolation of the remaining run time.
///
/// Defined only while `0 < progress < 100`.
#[must_use]
pub fn estimate_time_remaining(elapsed: Duration, progress: u8) -> Option<Duration> {
    if progress == 0 || progress >= 100 {
        return None;
    }
    let elapsed_secs = elapsed.as_secs_f64();
    let total = elapsed_secs / f64::from(progress) * 100.0;
    Duration::try_from_secs_f64(total - elapsed_secs).ok()
}

/// Time between two instants, zero if `end` precedes `start`.
#[must_use]
pub fn elapsed_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or(Duration::ZERO)
}

/// Input data needed to settle a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettlementInput {
    /// The job being settled.
    pub job_id: String,
    /// When the first progress report arrived.
    pub started_at: Option<DateTime<Utc>>,
    /// When the terminal report arrived.
    pub finished_at: DateTime<Utc>,
    /// Processing time measured by the worker, used if the job never
    /// reported progress.
    pub reported_duration_secs: Option<f64>,
    /// Provider's hourly rate.
    pub rate_per_hour: Amount,
}

/// The result of settling a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementResult {
    /// The settled job ID.
    pub job_id: String,
    /// Run time in seconds.
    pub duration_secs: f64,
    /// Cost of the run.
    pub actual_cost: Amount,
}

/// Compute the duration and cost of a finished job.
///
/// Wall-clock time since `started_at` wins; otherwise the worker's own
/// measurement is used; otherwise the job is free.
///
/// # Errors
///
/// Returns a validation error if the job finished before it started or the
/// reported duration is negative or not finite.
pub fn settle_job(input: &JobSettlementInput) -> Result<SettlementResult> {
    let duration = if let Some(started_at) = input.started_at {
        if input.finished_at < started_at {
            return Err(MarketError::validation(
                "finish time cannot be before start time",
            ));
        }
        elapsed_between(started_at, input.finished_at)
    } else if let Some(secs) = input.reported_duration_secs {
        Duration::try_from_secs_f64(secs).map_err(|_| {
            MarketError::validation(format!("invalid reported processing time: {secs}"))
        })?
    } else {
        Duration::ZERO
    };

    Ok(SettlementResult {
        job_id: input.job_id.clone(),
        duration_secs: duration.as_secs_f64(),
        actual_cost: calculate_cost(duration, input.rate_per_hour),
    })
}
