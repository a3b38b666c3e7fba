//! Countdown latch used as the per-cycle flush barrier.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A one-shot countdown barrier.
///
/// Participants call [`count_down`](FlushLatch::count_down) once; waiters block
/// until the count reaches zero or their timeout elapses.
#[derive(Debug)]
pub struct FlushLatch {
    count: Mutex<usize>,
    resolved: Condvar,
}

impl FlushLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            resolved: Condvar::new(),
        }
    }

    /// A latch that is already resolved
    pub fn resolved() -> Self {
        Self::new(0)
    }

    /// Decrement the count, waking all waiters when it reaches zero.
    /// Extra calls past zero are ignored.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.resolved.notify_all();
        }
    }

    /// Participants that have not reported yet
    pub fn remaining(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until the latch resolves or `timeout` elapses.
    /// Returns true if the latch resolved.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.resolved.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}
