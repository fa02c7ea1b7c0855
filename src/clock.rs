//! Time sources for the mode controller.

use std::time::Instant;

use chrono::{DateTime, Local};

/// Monotonic time for scheduling plus local wall time for file names.
pub trait Clock: Send {
    /// Monotonic instant.
    fn now(&self) -> Instant;

    /// Local wall-clock time.
    fn local_now(&self) -> DateTime<Local>;
}

/// The system clocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_now(&self) -> DateTime<Local> {
        Local::now()
    }
}
