//! Monotonic local clock for tie-break counters.
//!
//! Wall clocks on venue tablets drift independently and may jump backwards
//! (NTP corrections, manual changes). The counter issued here is only ever
//! compared between two stamps from the *same* device, so it needs to be
//! strictly increasing locally — it carries no cross-device meaning.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A stamp issued by [`MonotonicClock`].
///
/// `wall_ms` is advisory wall-clock time; `counter` is the strictly
/// increasing local value used as a deterministic tie-break seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStamp {
    /// Milliseconds since Unix epoch at issue time (advisory only).
    pub wall_ms: u64,
    /// Strictly increasing local counter.
    pub counter: u64,
}

/// Issues strictly increasing [`LocalStamp`]s.
///
/// The counter is seeded from the microsecond clock and bumped past the
/// previously issued value whenever the clock stalls or runs backwards,
/// so two stamps from one clock never compare equal.
#[derive(Debug)]
pub struct MonotonicClock {
    last: Mutex<u64>,
}

impl MonotonicClock {
    /// Creates a new clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: Mutex::new(0),
        }
    }

    /// Issues the next stamp.
    pub fn tick(&self) -> LocalStamp {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let wall_ms = now.as_millis() as u64;
        let candidate = now.as_micros() as u64;

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let counter = if candidate > *last {
            candidate
        } else {
            *last + 1
        };
        *last = counter;

        LocalStamp { wall_ms, counter }
    }

    /// Returns the current wall-clock time in epoch milliseconds without
    /// advancing the counter.
    #[must_use]
    pub fn wall_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
