//! Atomic counters for broker observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`BrokerMetrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. after a sweep).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lightweight atomic counters, owned by one broker.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    launches_accepted: AtomicU64,
    launches_rejected: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    runs_ready: AtomicU64,
    runs_failed: AtomicU64,
    runs_deleted: AtomicU64,
    runs_expired: AtomicU64,
}

/// Point-in-time copy of [`BrokerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub launches_accepted: u64,
    pub launches_rejected: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub runs_ready: u64,
    pub runs_failed: u64,
    pub runs_deleted: u64,
    pub runs_expired: u64,
}

impl MetricsSnapshot {
    /// Share of pool acquisitions that were hits; `None` before any attempt.
    pub fn pool_hit_rate(&self) -> Option<f64> {
        let attempts = self.pool_hits + self.pool_misses;
        (attempts > 0).then(|| self.pool_hits as f64 / attempts as f64)
    }
}

fn bump(counter: &AtomicU64, name: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric = name, "counter incremented");
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_launches_accepted(&self) {
        bump(&self.launches_accepted, "launches_accepted");
    }

    pub fn inc_launches_rejected(&self) {
        bump(&self.launches_rejected, "launches_rejected");
    }

    pub fn inc_pool_hits(&self) {
        bump(&self.pool_hits, "pool_hits");
    }

    pub fn inc_pool_misses(&self) {
        bump(&self.pool_misses, "pool_misses");
    }

    pub fn inc_runs_ready(&self) {
        bump(&self.runs_ready, "runs_ready");
    }

    pub fn inc_runs_failed(&self) {
        bump(&self.runs_failed, "runs_failed");
    }

    pub fn inc_runs_deleted(&self) {
        bump(&self.runs_deleted, "runs_deleted");
    }

    pub fn inc_runs_expired(&self) {
        bump(&self.runs_expired, "runs_expired");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            launches_accepted: self.launches_accepted.load(Ordering::Relaxed),
            launches_rejected: self.launches_rejected.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            runs_ready: self.runs_ready.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_deleted: self.runs_deleted.load(Ordering::Relaxed),
            runs_expired: self.runs_expired.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            launches_accepted = s.launches_accepted,
            launches_rejected = s.launches_rejected,
            pool_hits = s.pool_hits,
            pool_misses = s.pool_misses,
            runs_ready = s.runs_ready,
            runs_failed = s.runs_failed,
            runs_deleted = s.runs_deleted,
            runs_expired = s.runs_expired,
        );
    }
}
