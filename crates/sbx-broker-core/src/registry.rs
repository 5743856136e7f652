//! Run registry: live runs, their event channels, and deleted-run history.
//!
//! Each live run sits in a [`RunSlot`] that guards the run and its channel
//! with one mutex, so appending a log line and relaying it happen together
//! and a late subscriber sees every line exactly once (replayed or live).
//! Only the run's provisioning task writes through a slot; deletion may come
//! from anywhere and is idempotent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use provision_backend::SandboxHandle;

use crate::channel::{EventChannel, Subscription};
use crate::clock::Clock;
use crate::domain::{DeletedSummary, DeployMode, Run, RunEvent, RunId, RunStatus};
use crate::error::BrokerResult;
use crate::limiter::AdmissionTicket;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug)]
struct SlotState {
    run: Run,
    channel: EventChannel,
    deleted: bool,
}

/// A live run together with its event channel.
///
/// Event timestamps come from the registry's clock.
#[derive(Debug)]
pub struct RunSlot {
    run_id: RunId,
    clock: Arc<dyn Clock>,
    state: Mutex<SlotState>,
}

impl RunSlot {
    fn new(run: Run, clock: Arc<dyn Clock>) -> Self {
        RunSlot {
            run_id: run.run_id,
            clock,
            state: Mutex::new(SlotState {
                run,
                channel: EventChannel::new(),
                deleted: false,
            }),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn snapshot(&self) -> Run {
        lock(&self.state).run.clone()
    }

    pub fn is_deleted(&self) -> bool {
        lock(&self.state).deleted
    }

    /// Append a run log line and relay it. Returns `false` once deleted.
    pub fn log(&self, message: &str) -> bool {
        let mut state = lock(&self.state);
        if state.deleted {
            return false;
        }
        state.run.logs.push(message.to_string());
        state
            .channel
            .emit(&RunEvent::log(self.run_id, message, self.clock.now()));
        true
    }

    /// Relay a status event without changing the run.
    pub fn emit_status(&self, status: RunStatus) {
        let mut state = lock(&self.state);
        if !state.deleted {
            state
                .channel
                .emit(&RunEvent::status(self.run_id, status, self.clock.now()));
        }
    }

    /// Record the acquired sandbox and whether it came from the warm pool.
    /// Hands the sandbox back if the run was deleted meanwhile, so the
    /// caller can release it.
    pub fn attach_handle(
        &self,
        handle: SandboxHandle,
        acquire_ms: u64,
        pooled: bool,
    ) -> Result<(), SandboxHandle> {
        let mut state = lock(&self.state);
        if state.deleted {
            return Err(handle);
        }
        state.run.handle = Some(handle);
        state.run.acquire_ms = Some(acquire_ms);
        state.run.pooled = pooled;
        Ok(())
    }

    pub fn set_deploy_ms(&self, deploy_ms: u64) {
        let mut state = lock(&self.state);
        if !state.deleted {
            state.run.deploy_ms = Some(deploy_ms);
        }
    }

    /// Move to `ready`, set address, timings and expiry, then emit the
    /// status and ready events. `Ok(false)` if the run is already deleted.
    pub fn mark_ready(
        &self,
        ingress_url: &str,
        total_ms: u64,
        expires_at: DateTime<Utc>,
    ) -> BrokerResult<bool> {
        let mut state = lock(&self.state);
        if state.deleted {
            return Ok(false);
        }
        state.run.advance(RunStatus::Ready)?;
        state.run.ingress_url = Some(ingress_url.to_string());
        state.run.total_ms = Some(total_ms);
        state.run.expires_at = Some(expires_at);

        let now = self.clock.now();
        state
            .channel
            .emit(&RunEvent::status(self.run_id, RunStatus::Ready, now));
        if let Some(ready) = RunEvent::ready_from(&state.run, now) {
            state.channel.emit(&ready);
        }
        Ok(true)
    }

    /// Move to `failed` with an error line and status event.
    pub fn mark_failed(&self, message: &str) -> BrokerResult<bool> {
        let mut state = lock(&self.state);
        if state.deleted {
            return Ok(false);
        }
        state.run.advance(RunStatus::Failed)?;
        let line = format!("ERROR: {}", message);
        let now = self.clock.now();
        state.run.logs.push(line.clone());
        state.channel.emit(&RunEvent::log(self.run_id, &line, now));
        state
            .channel
            .emit(&RunEvent::status(self.run_id, RunStatus::Failed, now));
        Ok(true)
    }

    pub(crate) fn subscribe(&self, keepalive: Duration) -> Subscription {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        let mut replay: Vec<RunEvent> = state
            .run
            .logs
            .iter()
            .map(|line| RunEvent::log(self.run_id, line, now))
            .collect();
        if let Some(ready) = RunEvent::ready_from(&state.run, now) {
            replay.push(ready);
        }
        state.channel.attach(self.run_id, replay, keepalive)
    }

    fn retire(&self, deleted_at: DateTime<Utc>, reason: &str) -> (Run, DeletedSummary) {
        let mut state = lock(&self.state);
        state.deleted = true;
        let summary = state.run.summary(deleted_at, reason);
        state.channel.emit(&RunEvent::Complete {
            run_id: self.run_id,
            duration_ms: summary.duration_ms,
            reason: reason.to_string(),
            timestamp: deleted_at,
        });
        state.channel.close();
        (state.run.clone(), summary)
    }
}

#[derive(Debug)]
pub struct RunRegistry {
    clock: Arc<dyn Clock>,
    live: Mutex<HashMap<RunId, Arc<RunSlot>>>,
    deleted: Mutex<VecDeque<DeletedSummary>>,
    history_capacity: usize,
    keepalive: Duration,
}

impl RunRegistry {
    pub fn new(clock: Arc<dyn Clock>, history_capacity: usize, keepalive: Duration) -> Self {
        RunRegistry {
            clock,
            live: Mutex::new(HashMap::new()),
            deleted: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            keepalive,
        }
    }

    /// Create the run for an admitted launch, in `provisioning`.
    pub fn allocate(
        &self,
        ticket: AdmissionTicket,
        workload: &str,
        deploy_mode: DeployMode,
    ) -> Arc<RunSlot> {
        let run = Run::new(
            ticket.run_id(),
            ticket.category(),
            workload,
            deploy_mode,
            self.clock.now(),
        );
        let slot = Arc::new(RunSlot::new(run, self.clock.clone()));
        lock(&self.live).insert(slot.run_id(), slot.clone());
        slot
    }

    pub fn get(&self, run_id: &RunId) -> Option<Run> {
        self.slot(run_id).map(|slot| slot.snapshot())
    }

    pub fn slot(&self, run_id: &RunId) -> Option<Arc<RunSlot>> {
        lock(&self.live).get(run_id).cloned()
    }

    /// Remove a live run, record its summary and end its event stream.
    ///
    /// Returns the run as it was at deletion; `None` if it was not live
    /// (already deleted or never existed).
    pub fn delete(&self, run_id: &RunId, reason: &str) -> Option<Run> {
        let slot = lock(&self.live).remove(run_id)?;
        let (run, summary) = slot.retire(self.clock.now(), reason);

        let mut deleted = lock(&self.deleted);
        deleted.push_front(summary);
        deleted.truncate(self.history_capacity);
        Some(run)
    }

    /// Live runs, oldest first.
    pub fn list_active(&self) -> Vec<Run> {
        let slots: Vec<_> = lock(&self.live).values().cloned().collect();
        let mut runs: Vec<Run> = slots.iter().map(|slot| slot.snapshot()).collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    /// Most recent deletions first.
    pub fn list_deleted(&self, limit: usize) -> Vec<DeletedSummary> {
        lock(&self.deleted).iter().take(limit).cloned().collect()
    }

    pub fn subscribe(&self, run_id: &RunId) -> Option<Subscription> {
        self.slot(run_id).map(|slot| slot.subscribe(self.keepalive))
    }

    /// Ids of live runs whose expiry is at or before `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<RunId> {
        self.list_active()
            .into_iter()
            .filter(|run| run.is_expired(now))
            .map(|run| run.run_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.live).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live runs holding a sandbox taken from the warm pool.
    pub fn count_pooled(&self) -> usize {
        self.list_active().iter().filter(|run| run.pooled).count()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
