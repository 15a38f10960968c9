//! Millisecond clock used for expiry and access tracking.
//!
//! Timestamps are milliseconds on a monotonic clock anchored at the first
//! call in the process, so they never move backwards when the wall clock is
//! adjusted. Absolute unix deadlines (`EXPIREAT`) are translated onto this
//! clock when they are set.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time in milliseconds.
#[inline]
pub fn now_ms() -> u64 {
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_millis() as u64
}

/// Current unix time in milliseconds.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Deadline `ttl` from now on the monotonic clock.
#[inline]
pub fn deadline_after(ttl: Duration) -> u64 {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    now_ms().saturating_add(ttl_ms)
}

/// Translates an absolute unix timestamp (ms) to the monotonic clock.
/// Timestamps in the past map to "now", which counts as expired.
pub fn deadline_from_unix_ms(unix_ms: u64) -> u64 {
    let now = now_ms();
    let unix_now = unix_now_ms();
    now.saturating_add(unix_ms.saturating_sub(unix_now))
}

/// Expiry check with an inclusive boundary: a deadline equal to `now` has
/// already passed.
#[inline]
pub fn is_expired(expires_at: Option<u64>, now: u64) -> bool {
    expires_at.is_some_and(|deadline| now >= deadline)
}
