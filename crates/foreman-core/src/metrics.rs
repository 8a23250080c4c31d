//! Global atomic counters for orchestration runs.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event, typically when a run finishes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    steps_dispatched: AtomicU64,
    steps_skipped: AtomicU64,
    worker_timeouts: AtomicU64,
    approvals_requested: AtomicU64,
    loop_iterations: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            steps_dispatched: AtomicU64::new(0),
            steps_skipped: AtomicU64::new(0),
            worker_timeouts: AtomicU64::new(0),
            approvals_requested: AtomicU64::new(0),
            loop_iterations: AtomicU64::new(0),
        }
    }

    /// A worker call was started.
    pub fn inc_steps_dispatched(&self) {
        self.steps_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_dispatched", "counter incremented");
    }

    /// A step was satisfied from a previous attempt instead of dispatched.
    pub fn inc_steps_skipped(&self) {
        self.steps_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "steps_skipped", "counter incremented");
    }

    pub fn inc_worker_timeouts(&self) {
        self.worker_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "worker_timeouts", "counter incremented");
    }

    pub fn inc_approvals_requested(&self) {
        self.approvals_requested.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "approvals_requested", "counter incremented");
    }

    pub fn inc_loop_iterations(&self) {
        self.loop_iterations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "loop_iterations", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            steps_dispatched = self.steps_dispatched(),
            steps_skipped = self.steps_skipped(),
            worker_timeouts = self.worker_timeouts(),
            approvals_requested = self.approvals_requested(),
            loop_iterations = self.loop_iterations(),
        );
    }

    pub fn steps_dispatched(&self) -> u64 {
        self.steps_dispatched.load(Ordering::Relaxed)
    }

    pub fn steps_skipped(&self) -> u64 {
        self.steps_skipped.load(Ordering::Relaxed)
    }

    pub fn worker_timeouts(&self) -> u64 {
        self.worker_timeouts.load(Ordering::Relaxed)
    }

    pub fn approvals_requested(&self) -> u64 {
        self.approvals_requested.load(Ordering::Relaxed)
    }

    pub fn loop_iterations(&self) -> u64 {
        self.loop_iterations.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.steps_dispatched.store(0, Ordering::Relaxed);
        self.steps_skipped.store(0, Ordering::Relaxed);
        self.worker_timeouts.store(0, Ordering::Relaxed);
        self.approvals_requested.store(0, Ordering::Relaxed);
        self.loop_iterations.store(0, Ordering::Relaxed);
    }
}
