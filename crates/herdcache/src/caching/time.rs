//! The clock that all cache timestamps are based on.
//!
//! Timestamps are wall-clock [`SystemTime`]s, so they can be shared with other processes via the
//! shared cache. They are however derived from the tokio clock, which means that tests using
//! [`tokio::time::pause`] and [`tokio::time::advance`] control every expiration decision.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime};

static ANCHOR: OnceLock<(SystemTime, Instant)> = OnceLock::new();

/// Returns the current time.
///
/// Outside of a runtime with a paused clock, this follows [`SystemTime::now`].
pub fn now() -> SystemTime {
    let (wall, real) = *ANCHOR.get_or_init(|| (SystemTime::now(), Instant::now()));
    let tokio = tokio::time::Instant::now().into_std();

    match tokio.checked_duration_since(real) {
        Some(elapsed) => wall + elapsed,
        None => wall - real.duration_since(tokio),
    }
}
