//! Process-wide atomic counters for guarded tool calls.
//!
//! Counters are bumped silently by the middleware and the breaker. Call
//! [`Metrics::flush`] to emit the current values as one `tracing::info!`
//! event (e.g. on a daemon tick or at CLI exit).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    calls_executed: AtomicU64,
    calls_rejected: AtomicU64,
    guard_violations: AtomicU64,
    breaker_trips: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            calls_executed: AtomicU64::new(0),
            calls_rejected: AtomicU64::new(0),
            guard_violations: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
        }
    }

    /// A call reached the tool body (whatever its result).
    pub fn inc_calls_executed(&self) {
        self.calls_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "calls_executed", "counter incremented");
    }

    /// A call was turned away before the tool body ran.
    pub fn inc_calls_rejected(&self) {
        self.calls_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "calls_rejected", "counter incremented");
    }

    pub fn inc_guard_violations(&self) {
        self.guard_violations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "guard_violations", "counter incremented");
    }

    pub fn inc_breaker_trips(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "breaker_trips", "counter incremented");
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            calls_executed = self.calls_executed(),
            calls_rejected = self.calls_rejected(),
            guard_violations = self.guard_violations(),
            breaker_trips = self.breaker_trips(),
        );
    }

    pub fn calls_executed(&self) -> u64 {
        self.calls_executed.load(Ordering::Relaxed)
    }

    pub fn calls_rejected(&self) -> u64 {
        self.calls_rejected.load(Ordering::Relaxed)
    }

    pub fn guard_violations(&self) -> u64 {
        self.guard_violations.load(Ordering::Relaxed)
    }

    pub fn breaker_trips(&self) -> u64 {
        self.breaker_trips.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.calls_executed.store(0, Ordering::Relaxed);
        self.calls_rejected.store(0, Ordering::Relaxed);
        self.guard_violations.store(0, Ordering::Relaxed);
        self.breaker_trips.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_calls_executed();
        m.inc_calls_executed();
        m.inc_calls_rejected();
        m.inc_guard_violations();
        assert_eq!(m.calls_executed(), 2);
        assert_eq!(m.calls_rejected(), 1);
        assert_eq!(m.guard_violations(), 1);
        assert_eq!(m.breaker_trips(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_calls_executed();
        m.inc_breaker_trips();
        m.reset();
        assert_eq!(m.calls_executed(), 0);
        assert_eq!(m.breaker_trips(), 0);
    }
}
