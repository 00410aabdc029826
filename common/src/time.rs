// System time is non-deterministic: use these helpers for cache TTLs,
// packet expiry marks and logging only, never for anything that must
// agree across nodes.

use std::time::{SystemTime, UNIX_EPOCH};

pub type TimestampSeconds = u64;

// Return unix timestamp in seconds
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Incorrect time returned from the system clock")
        .as_secs()
}
