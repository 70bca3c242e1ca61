//! Small shims over the host OS: wall-clock timestamps for trailers and the
//! process identity stamped into control-message frames.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Trailer timestamps are taken with this at commit time.  A clock set before
/// 1970 yields zero rather than failing: trailer times only need to be
/// monotonically non-decreasing along the revision chain, which the commit
/// path enforces separately.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// The calling process's ID, used as the conventional `sender_id` of
/// control-message frames.
pub fn process_id() -> u32 {
    std::process::id()
}
