//! Engine clock.
//!
//! Timeouts run on a monotonic counter (`Instant`) offset against a Unix
//! wall-clock base. The base is resynchronized periodically: forward jumps
//! of the system clock are adopted, backward jumps are logged and ignored so
//! engine time never decreases.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

/// Drift below which a resync is silent.
const DRIFT_LOG_THRESHOLD_MS: u64 = 1_000;

/// Current Unix time in milliseconds.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Monotonic millisecond clock anchored to Unix time.
#[derive(Debug)]
pub struct Clock {
    base_unix_ms: u64,
    base_instant: Instant,
    last_resync: Instant,
    wall: fn() -> u64,
}

impl Clock {
    pub fn new() -> Self {
        Self::with_wall_source(unix_now_ms)
    }

    /// Clock reading wall time from `wall` instead of the system clock.
    pub fn with_wall_source(wall: fn() -> u64) -> Self {
        let now = Instant::now();
        Self {
            base_unix_ms: wall(),
            base_instant: now,
            last_resync: now,
            wall,
        }
    }

    /// Engine time in Unix milliseconds. Never decreases.
    pub fn now_ms(&self) -> u64 {
        self.base_unix_ms + self.base_instant.elapsed().as_millis() as u64
    }

    /// Resynchronize against the wall clock if `interval_ms` has passed.
    pub fn maybe_resync(&mut self, interval_ms: u64) {
        if self.last_resync.elapsed().as_millis() as u64 >= interval_ms {
            self.resync();
        }
    }

    pub fn resync(&mut self) {
        let now = Instant::now();
        let ours = self.base_unix_ms + now.duration_since(self.base_instant).as_millis() as u64;
        let wall = (self.wall)();
        self.last_resync = now;

        if wall >= ours {
            let drift = wall - ours;
            if drift >= DRIFT_LOG_THRESHOLD_MS {
                debug!(drift_ms = drift, "Wall clock moved forward, adopting");
            }
            self.base_unix_ms = wall;
            self.base_instant = now;
        } else {
            let drift = ours - wall;
            if drift >= DRIFT_LOG_THRESHOLD_MS {
                warn!(drift_ms = drift, "Wall clock moved backward, keeping monotonic time");
            }
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
