//! Expiry sweeper.
//!
//! A periodic pass that deletes every live run whose expiry has passed.
//! Provisioning runs have no expiry and are never touched. The loop stops
//! at the next tick boundary once the broker's cancellation token fires.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::obs;
use crate::orchestrator::BrokerInner;

/// Delete every expired run, one after another. Returns how many were
/// deleted by this pass.
pub(crate) async fn sweep_once(inner: &BrokerInner) -> usize {
    let now = inner.registry.now();
    let expired = inner.registry.expired(now);
    if expired.is_empty() {
        debug!(active = inner.registry.len(), "sweep: nothing expired");
        return 0;
    }

    let lifetime = inner.config.lifetime;
    let reason = format!(
        "expired (auto-cleanup after {}-{} min)",
        lifetime.min_minutes, lifetime.max_minutes
    );
    let mut reaped = 0;
    for run_id in &expired {
        if inner.delete(run_id, &reason).await {
            inner.metrics.inc_runs_expired();
            reaped += 1;
        }
    }

    inner
        .journal
        .info(format!("Cleanup: removed {} expired sandbox(es)", reaped));
    obs::emit_sweep_completed(reaped, inner.registry.len());
    inner.metrics.flush();
    reaped
}

pub(crate) fn spawn_sweeper(inner: Arc<BrokerInner>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("expiry sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    sweep_once(&inner).await;
                }
            }
        }
    })
}
