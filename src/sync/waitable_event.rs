// Copyright (c) 2025 RustySched Contributors

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A latch-style event: waiters block until some thread signals, after which
/// every wait returns immediately until the event is reset.
pub struct WaitableEvent {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl WaitableEvent {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Blocks the current thread until the event is signaled.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cv.wait(&mut signaled);
        }
    }

    /// Blocks for at most `timeout`. Returns whether the event was signaled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Blocks until `deadline`. Returns whether the event was signaled.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cv.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }

    /// Signals the event, releasing all current and future waiters.
    pub fn signal(&self) {
        *self.signaled.lock() = true;
        self.cv.notify_all();
    }

    /// Returns the event to the unsignaled state.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }
}

impl Default for WaitableEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_releases_waiter() {
        let event = Arc::new(WaitableEvent::new());
        let shared = Arc::clone(&event);

        let waiter = thread::spawn(move || {
            shared.wait();
        });

        event.signal();
        waiter.join().unwrap();

        // Latched: a later wait returns immediately.
        assert!(event.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_timed_wait_expires_unsignaled() {
        let event = WaitableEvent::new();
        assert!(!event.wait_for(Duration::from_millis(10)));

        event.signal();
        event.reset();
        assert!(!event.wait_for(Duration::from_millis(1)));
    }
}
