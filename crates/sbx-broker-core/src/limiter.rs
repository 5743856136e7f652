//! Admission limiter.
//!
//! Synchronous accept/reject gate in front of every launch. The three checks
//! (hourly quota, global concurrency, category concurrency) and the
//! bookkeeping that follows an accept run under one mutex, so two concurrent
//! admissions can never both pass a capacity check only one should pass.
//! Never touches the network.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::LimitsConfig;
use crate::domain::{Category, RunId};
use crate::error::Rejection;

const HOUR_SECS: i64 = 3600;

/// Proof that a launch was admitted. Consumed by
/// [`RunRegistry::allocate`](crate::registry::RunRegistry::allocate).
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an admitted ticket holds a concurrency slot until allocated and released"]
pub struct AdmissionTicket {
    run_id: RunId,
    category: Category,
}

impl AdmissionTicket {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn category(&self) -> Category {
        self.category
    }
}

/// Read-only snapshot of the limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterStatus {
    pub active: BTreeMap<Category, usize>,
    pub total_active: usize,
    pub caps: BTreeMap<Category, usize>,
    pub max_total_active: usize,
    pub hourly_used: u32,
    pub hourly_limit: u32,
    pub reset_in_seconds: u64,
}

#[derive(Debug, Default)]
struct LimiterState {
    active: HashMap<Category, HashSet<RunId>>,
    /// Accepted launches keyed by wall-clock hour bucket.
    hourly: BTreeMap<i64, u32>,
}

impl LimiterState {
    fn total_active(&self) -> usize {
        self.active.values().map(HashSet::len).sum()
    }

    fn active_in(&self, category: Category) -> usize {
        self.active.get(&category).map_or(0, HashSet::len)
    }
}

fn hour_bucket(timestamp: i64) -> (i64, u64) {
    let bucket = timestamp.div_euclid(HOUR_SECS);
    let reset_in = (HOUR_SECS - timestamp.rem_euclid(HOUR_SECS)) as u64;
    (bucket, reset_in)
}

#[derive(Debug)]
pub struct AdmissionLimiter {
    limits: LimitsConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

impl AdmissionLimiter {
    pub fn new(limits: LimitsConfig, clock: Arc<dyn Clock>) -> Self {
        AdmissionLimiter {
            limits,
            clock,
            state: Mutex::new(LimiterState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Admit one launch of `category` or say why not.
    ///
    /// On accept the fresh run id is recorded as active in its category and
    /// the current hour's counter is incremented exactly once.
    pub fn try_admit(&self, category: Category) -> Result<AdmissionTicket, Rejection> {
        let (hour, reset_in_secs) = hour_bucket(self.clock.now().timestamp());
        let mut state = self.lock();

        state.hourly.retain(|bucket, _| *bucket >= hour - 2);

        let used = state.hourly.get(&hour).copied().unwrap_or(0);
        let limit = self.limits.max_runs_per_hour;
        if used >= limit {
            return Err(Rejection::HourlyQuota {
                used,
                limit,
                reset_in_secs,
            });
        }

        let total = state.total_active();
        if total >= self.limits.max_total_active {
            return Err(Rejection::GlobalCapacity {
                active: total,
                cap: self.limits.max_total_active,
            });
        }

        let active = state.active_in(category);
        let cap = self.limits.cap_for(category);
        if active >= cap {
            return Err(Rejection::CategoryCapacity {
                category,
                active,
                cap,
            });
        }

        let run_id = RunId::new();
        state.active.entry(category).or_default().insert(run_id);
        *state.hourly.entry(hour).or_insert(0) += 1;

        Ok(AdmissionTicket { run_id, category })
    }

    /// Free the run's slot. Removes the id from every category set;
    /// returns whether it was present.
    pub fn release(&self, run_id: &RunId) -> bool {
        let mut state = self.lock();
        let mut removed = false;
        for ids in state.active.values_mut() {
            removed |= ids.remove(run_id);
        }
        removed
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.lock().active.values().any(|ids| ids.contains(run_id))
    }

    pub fn active_in(&self, category: Category) -> usize {
        self.lock().active_in(category)
    }

    pub fn total_active(&self) -> usize {
        self.lock().total_active()
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn status(&self) -> LimiterStatus {
        let (hour, reset_in_seconds) = hour_bucket(self.clock.now().timestamp());
        let state = self.lock();
        let active = Category::ALL
            .iter()
            .map(|c| (*c, state.active_in(*c)))
            .collect();
        let caps = Category::ALL
            .iter()
            .map(|c| (*c, self.limits.cap_for(*c)))
            .collect();
        LimiterStatus {
            active,
            total_active: state.total_active(),
            caps,
            max_total_active: self.limits.max_total_active,
            hourly_used: state.hourly.get(&hour).copied().unwrap_or(0),
            hourly_limit: self.limits.max_runs_per_hour,
            reset_in_seconds,
        }
    }

    #[cfg(test)]
    fn hour_buckets(&self) -> Vec<i64> {
        self.lock().hourly.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    fn limiter(limits: LimitsConfig) -> (AdmissionLimiter, Arc<ManualClock>) {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 10, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        (AdmissionLimiter::new(limits, clock.clone()), clock)
    }

    #[test]
    fn test_release_restores_count_and_is_idempotent() {
        let (limiter, _) = limiter(LimitsConfig::default());
        let before = limiter.active_in(Category::Warm);
        let ticket = limiter.try_admit(Category::Warm).unwrap();
        assert_eq!(limiter.active_in(Category::Warm), before + 1);
        assert!(limiter.is_active(&ticket.run_id()));

        assert!(limiter.release(&ticket.run_id()));
        assert_eq!(limiter.active_in(Category::Warm), before);
        assert!(!limiter.release(&ticket.run_id()));
        assert_eq!(limiter.active_in(Category::Warm), before);
    }

    #[test]
    fn test_release_does_not_refund_hourly_quota() {
        let mut limits = LimitsConfig::default();
        limits.max_runs_per_hour = 1;
        let (limiter, _) = limiter(limits);
        let ticket = limiter.try_admit(Category::Cold).unwrap();
        limiter.release(&ticket.run_id());
        let err = limiter.try_admit(Category::Cold).unwrap_err();
        assert!(matches!(err, Rejection::HourlyQuota { used: 1, limit: 1, .. }));
    }

    #[test]
    fn test_reset_seconds_counts_to_next_hour() {
        let (limiter, _) = limiter(LimitsConfig::default());
        // 12:10:00 -> 50 minutes left
        assert_eq!(limiter.status().reset_in_seconds, 3000);
    }

    #[test]
    fn test_quota_rolls_over_and_old_buckets_are_collected() {
        let mut limits = LimitsConfig::default();
        limits.max_runs_per_hour = 1;
        let (limiter, clock) = limiter(limits);

        let t = limiter.try_admit(Category::Cold).unwrap();
        limiter.release(&t.run_id());
        assert!(limiter.try_admit(Category::Cold).is_err());

        clock.advance(Duration::hours(1));
        let t = limiter.try_admit(Category::Cold).unwrap();
        limiter.release(&t.run_id());
        assert_eq!(limiter.hour_buckets().len(), 2);

        clock.advance(Duration::hours(3));
        let t = limiter.try_admit(Category::Cold).unwrap();
        limiter.release(&t.run_id());
        assert_eq!(limiter.hour_buckets().len(), 1);
    }

    #[test]
    fn test_shared_cap_group_counts_each_category_separately() {
        let limits = LimitsConfig::default().with_group_cap("warm", 1);
        let (limiter, _) = limiter(limits);
        let _warm = limiter.try_admit(Category::Warm).unwrap();
        let _snap = limiter.try_admit(Category::Snapshot).unwrap();
        let err = limiter.try_admit(Category::Snapshot).unwrap_err();
        assert_eq!(err.to_string(), "max snapshot reached: 1/1");
    }

    #[test]
    fn test_concurrent_admissions_never_overshoot() {
        let mut limits = LimitsConfig::default().with_group_cap("cold", 3);
        limits.max_runs_per_hour = 100;
        let (limiter, _) = limiter(limits);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.try_admit(Category::Cold).is_ok())
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 3);
        assert_eq!(limiter.active_in(Category::Cold), 3);
        assert_eq!(limiter.status().hourly_used, 3);
    }
}
