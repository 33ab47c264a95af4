//! Time source used for idle waits, settle delays and busy-wait timeouts.
//!
//! All layers above the transport obtain time through the `Clock` trait so
//! that the whole protocol stack can be driven by a virtual clock in tests.

use std::time::{Duration, Instant};

/// Monotonic time source which can also block the caller.
pub trait Clock {
    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);

    /// Time elapsed since an arbitrary fixed point.
    fn now(&self) -> Duration;
}

/// Wall-clock implementation using `std::thread::sleep`.
pub struct StdClock {
    epoch: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        StdClock { epoch: Instant::now() }
    }
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for StdClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}
