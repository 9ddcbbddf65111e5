//! Millisecond helpers for the caller-facing timeout convention.

use std::time::{Duration, Instant};

/// Convert a caller timeout to a `Duration`. Negative values mean "no limit".
///
/// ```
/// use std::time::Duration;
/// use detect_lot::util::timeout_from_ms;
///
/// assert_eq!(timeout_from_ms(-1), None);
/// assert_eq!(timeout_from_ms(0), Some(Duration::ZERO));
/// assert_eq!(timeout_from_ms(1500), Some(Duration::from_millis(1500)));
/// ```
#[must_use]
pub fn timeout_from_ms(timeout_ms: i64) -> Option<Duration> {
    u64::try_from(timeout_ms).ok().map(Duration::from_millis)
}

/// Whole milliseconds elapsed since `since`, saturating.
#[must_use]
pub fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
