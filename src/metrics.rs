use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::rate_limiter::Decision;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleMetrics {
    pub evaluated_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub bypassed_requests: u64,
    pub swept_records: u64,
    pub store_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    throttled: AtomicU64,
    bypassed: AtomicU64,
    swept: AtomicU64,
    store_failures: AtomicU64,
}

/// Process-wide decision counters
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    counters: Arc<Counters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&self, decision: &Decision) {
        let counter = if decision.is_allowed() {
            &self.counters.allowed
        } else {
            &self.counters.throttled
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self, removed: usize) {
        self.counters.swept.fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// A decision that fell back because the quota store errored.
    pub fn record_store_failure(&self) {
        self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ThrottleMetrics {
        let allowed = self.counters.allowed.load(Ordering::Relaxed);
        let throttled = self.counters.throttled.load(Ordering::Relaxed);
        ThrottleMetrics {
            evaluated_requests: allowed + throttled,
            allowed_requests: allowed,
            throttled_requests: throttled,
            bypassed_requests: self.counters.bypassed.load(Ordering::Relaxed),
            swept_records: self.counters.swept.load(Ordering::Relaxed),
            store_failures: self.counters.store_failures.load(Ordering::Relaxed),
        }
    }
}
