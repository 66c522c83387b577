use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// Monotonic origin for the nanosecond clock used by the pool and the task
/// runner. Wall-clock time is only used for cache arithmetic and the
/// request/response timestamps.
static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds on a monotonic clock. Comparable across threads, never goes
/// backwards, unrelated to the wall clock.
pub(crate) fn now_nanos() -> u64 {
    START.elapsed().as_nanos() as u64
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn duration_to_nanos(d: Duration) -> u64 {
    d.as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }
}
