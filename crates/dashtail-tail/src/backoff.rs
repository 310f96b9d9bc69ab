//! Reconnect timing and resume policy

use std::time::Duration;

/// Delay before the first reconnect
const BASE_DELAY_MS: u64 = 1000;

/// Upper bound on the reconnect delay
pub const MAX_DELAY: Duration = Duration::from_millis(15_000);

/// Seconds of already-seen time re-requested on reconnect
pub const RESUME_OVERLAP_SECS: i64 = 5;

/// Delay before reconnect number `attempt` (zero based)
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay = Duration::from_millis(BASE_DELAY_MS.saturating_mul(factor));
    delay.min(MAX_DELAY)
}

/// Stream start for the next attempt, in unix seconds
///
/// Backs up by the overlap window from the newest record seen, or from `now`
/// when nothing has been seen yet.
pub fn resume_point(last_seen: Option<i64>, now: i64) -> i64 {
    match last_seen {
        Some(ts) => (ts - RESUME_OVERLAP_SECS).max(0),
        None => now - RESUME_OVERLAP_SECS,
    }
}
