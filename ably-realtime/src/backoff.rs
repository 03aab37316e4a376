//! Incremental retry back-off with jitter.
//!
//! For an initial timeout `T0` and 1-based attempt `n`, the delay is drawn
//! from `[0.8 * upper, upper)` where `upper = min((n + 2) / 3, 2) * T0`.
//! Growth stops at `2 * T0` from the fourth attempt on.

use std::time::Duration;

/// Randomised retry delay for `attempt` (1-based).
pub fn retry_time(initial: Duration, attempt: u32) -> Duration {
    retry_time_with(initial, attempt, rand::random::<f64>())
}

/// Deterministic form of [`retry_time`]; `fraction` must lie in `[0, 1)`.
pub(crate) fn retry_time_with(initial: Duration, attempt: u32, fraction: f64) -> Duration {
    let upper = upper_bound_nanos(initial, attempt);
    let lower = (upper * 4).div_ceil(5);
    let span = upper - lower;
    if span == 0 {
        return nanos(lower);
    }
    let fraction = fraction.clamp(0.0, 1.0);
    // `span` is well within f64's exact integer range for any realistic timeout.
    let offset = ((span as f64) * fraction).floor() as u128;
    nanos(lower + offset.min(span - 1))
}

fn upper_bound_nanos(initial: Duration, attempt: u32) -> u128 {
    let n = u128::from(attempt.max(1));
    initial.as_nanos() * (n + 2).min(6) / 3
}

fn nanos(n: u128) -> Duration {
    Duration::from_nanos(u64::try_from(n).unwrap_or(u64::MAX))
}
