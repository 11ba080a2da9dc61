// Copyright (c) 2025 RustySched Contributors

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A counting semaphore.
///
/// The serial scheduler parks its worker here between posts; the timed
/// variants keep idle waits bounded so a missed signal never strands the
/// waiter.
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a count is available, then consumes it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
    }

    /// Consumes a count if one is available right now.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Waits at most `timeout` for a count. Returns whether one was taken.
    pub fn try_wait_for(&self, timeout: Duration) -> bool {
        self.try_wait_until(Instant::now() + timeout)
    }

    /// Waits until `deadline` for a count. Returns whether one was taken.
    pub fn try_wait_until(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            if self.cv.wait_until(&mut count, deadline).timed_out() {
                if *count > 0 {
                    *count -= 1;
                    return true;
                }
                return false;
            }
        }
    }

    /// Releases one count, waking a waiter.
    pub fn signal(&self) {
        *self.count.lock() += 1;
        self.cv.notify_one();
    }
}
