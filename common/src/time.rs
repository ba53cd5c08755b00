// Wall-clock time helpers. These use SystemTime::now() and are therefore
// non-deterministic: safe for slot scheduling, mempool admission and
// expiry, never for anything that must replay identically from the chain.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type TimestampMillis = u64;

#[inline]
pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
}

// We cast to u64 as we have plenty of time before it overflows
pub fn get_current_time_in_millis() -> TimestampMillis {
    get_current_time().as_millis() as TimestampMillis
}
