//! Time source shared by every component.
//!
//! Wall-clock timestamps are needed for state shared through a
//! coordination store (other processes must agree on them), but they are
//! derived from tokio's monotonic clock so that a paused test runtime can
//! drive every window, timeout and TTL deterministically.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Longest window or TTL honoured anywhere, about a century. Longer
/// durations are clamped to it so deadlines stay representable.
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Wall-clock anchored to a monotonic origin.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall_origin: SystemTime,
    mono_origin: Instant,
}

impl Clock {
    /// Anchor a clock at the current instant.
    pub fn new() -> Self {
        Self {
            wall_origin: SystemTime::now(),
            mono_origin: Instant::now(),
        }
    }

    /// Current wall-clock time.
    pub fn now(&self) -> SystemTime {
        self.wall_origin + self.mono_origin.elapsed()
    }

    /// Current time as fractional seconds since the Unix epoch.
    pub fn now_secs(&self) -> f64 {
        to_secs(self.now())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a wall-clock time to fractional epoch seconds.
pub fn to_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Convert fractional epoch seconds back to a wall-clock time.
///
/// Saturates at the far end of the representable range.
pub fn from_secs(secs: f64) -> SystemTime {
    let offset = Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX);
    UNIX_EPOCH
        .checked_add(offset)
        .unwrap_or_else(|| UNIX_EPOCH + Duration::from_secs(i32::MAX as u64))
}
