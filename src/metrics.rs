//! Session counters.
//!
//! The supervisor bumps these at fixed lifecycle points; exporting them is
//! left to whoever reads [`SessionMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug, Default)]
pub struct SessionMetrics {
    active: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    duration_ms_total: AtomicU64,
    unauthenticated: AtomicU64,
    unauthorized: AtomicU64,
    establish_failures: AtomicU64,
    accept_errors: AtomicU64,
}

/// Point-in-time copy of [`SessionMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active: u64,
    pub started: u64,
    pub completed: u64,
    pub duration_ms_total: u64,
    pub unauthenticated: u64,
    pub unauthorized: u64,
    pub establish_failures: u64,
    pub accept_errors: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_session_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn at_session_end(&self, created_at: DateTime<Utc>) {
        let elapsed = (Utc::now() - created_at).num_milliseconds().max(0) as u64;
        self.duration_ms_total.fetch_add(elapsed, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
        debug!(duration_ms = elapsed, "Session ended");
    }

    pub fn record_unauthenticated(&self) {
        self.unauthenticated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unauthorized(&self) {
        self.unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_establish_failure(&self) {
        self.establish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            duration_ms_total: self.duration_ms_total.load(Ordering::Relaxed),
            unauthenticated: self.unauthenticated.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
            establish_failures: self.establish_failures.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
        }
    }
}
