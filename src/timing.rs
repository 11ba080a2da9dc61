//! Telemetry clock helpers

use std::time::{Duration, Instant};

/// Monotonic timestamp for telemetry.
#[inline]
pub fn now() -> Instant {
    Instant::now()
}

/// Logs how long a scope took once it ends. Telemetry only; never used on
/// the execution hot path.
pub struct ScopeTimer {
    label: &'static str,
    started: Instant,
}

impl ScopeTimer {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for ScopeTimer {
    fn drop(&mut self) {
        log::trace!("{}: took {:?}", self.label, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_monotonic() {
        let timer = ScopeTimer::new("test scope");
        let first = timer.elapsed();
        let second = timer.elapsed();
        assert!(second >= first);
    }
}
