/*!
 * Session Clock
 * Monotonic nanosecond ticks anchored to the wall-clock session start
 */

use serde::{Deserialize, Serialize};
use std::time::Instant;
use time::OffsetDateTime;

/// Ticks per second of every persisted timestamp
pub const TICKS_PER_SECOND: u64 = 1_000_000_000;

/// Session-wide clock
///
/// Every timestamp written to an address record or info structure is a tick
/// count relative to `origin`.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    origin: Instant,
    start_unix_nanos: u64,
}

/// Persistable description of a session clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    pub frequency: u64,
    pub start_unix_nanos: u64,
    pub start_ticks: u64,
}

impl SessionClock {
    pub fn new() -> Self {
        let start = OffsetDateTime::now_utc().unix_timestamp_nanos();
        Self {
            origin: Instant::now(),
            start_unix_nanos: u64::try_from(start).unwrap_or(0),
        }
    }

    /// Ticks elapsed since the session started, never zero
    ///
    /// Zero is reserved for "phase not reached yet" in address records.
    #[inline]
    pub fn now(&self) -> i64 {
        let nanos = self.origin.elapsed().as_nanos();
        i64::try_from(nanos).unwrap_or(i64::MAX).max(1)
    }

    pub fn start_unix_nanos(&self) -> u64 {
        self.start_unix_nanos
    }

    pub fn session_time(&self) -> SessionTime {
        SessionTime {
            frequency: TICKS_PER_SECOND,
            start_unix_nanos: self.start_unix_nanos,
            start_ticks: 0,
        }
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
