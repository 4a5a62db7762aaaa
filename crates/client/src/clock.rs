//! Millisecond wall clock, injectable for tests.

use std::sync::Arc;

use chrono::Utc;

/// Returns the current time in milliseconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis())
}

/// A clock frozen at `at`, handy for deterministic snapshots.
pub fn fixed_clock(at: i64) -> Clock {
    Arc::new(move || at)
}
