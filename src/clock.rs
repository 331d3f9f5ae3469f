//! Low-overhead timestamps for records.
//!
//! A wall-clock reading is taken once and paired with a monotonic
//! [`Instant`]; every later timestamp is the anchor plus the monotonic time
//! elapsed since. This keeps per-call cost to one `Instant::now()` while the
//! values stay comparable across processes (nanoseconds since the UNIX
//! epoch).

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;

struct Anchor {
    instant: Instant,
    unix_nanos: u64,
}

lazy_static! {
    static ref ANCHOR: Anchor = Anchor {
        instant: Instant::now(),
        unix_nanos: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64),
    };
}

/// Current time in nanoseconds since the UNIX epoch, never going backwards
/// within a process.
#[inline(always)]
pub fn now() -> u64 {
    let anchor = &*ANCHOR;
    anchor.unix_nanos + anchor.instant.elapsed().as_nanos() as u64
}

/// Forces the anchor to be captured, so the first record does not pay for it.
pub fn init() {
    lazy_static::initialize(&ANCHOR);
}
