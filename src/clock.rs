//! Process-wide monotonic tick source.
//!
//! All wire timestamps are microseconds since a single process anchor, so
//! every stamp taken inside this process is directly comparable. Zero is
//! reserved to mean "never stamped"; the first real tick is clamped to 1.

use std::sync::LazyLock;
use std::time::Duration;
use std::time::Instant;

static ANCHOR: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Pin the anchor now so later stamps are strictly positive.
pub fn init() {
    LazyLock::force(&ANCHOR);
}

/// Microseconds elapsed since the process anchor.
pub fn ticks_now() -> i64 {
    (ANCHOR.elapsed().as_micros() as i64).max(1)
}

/// Interpret a tick delta as a duration; negative deltas collapse to zero.
pub fn ticks_between(earlier: i64, later: i64) -> Duration {
    Duration::from_micros(later.saturating_sub(earlier).max(0) as u64)
}
