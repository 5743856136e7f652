//! Structured observability hooks for the run lifecycle.
//!
//! This module provides:
//! - Run-scoped tracing spans: `RunSpan` RAII guard for synchronous sections,
//!   `run_span` for instrumenting a run's provisioning task
//! - One emitter per lifecycle edge: launch accepted/rejected, pool hit/miss,
//!   run ready/failed/deleted, sweep completed
//!
//! Events are emitted at `info!` level (configurable via `RUST_LOG`).

use tracing::{info, warn};

use crate::domain::{Category, RunId};
use crate::error::Rejection;

/// RAII guard that enters a run-scoped tracing span.
///
/// Not `Send`; hold it only across synchronous code.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &RunId) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// Span tagged with the run id, for `Instrument::instrument`.
pub fn run_span(run_id: &RunId) -> tracing::Span {
    tracing::info_span!("sbx.run", run_id = %run_id)
}

pub fn emit_launch_accepted(run_id: &RunId, category: Category, workload: &str) {
    info!(
        event = "launch.accepted",
        run_id = %run_id,
        category = %category,
        workload = %workload,
    );
}

pub fn emit_launch_rejected(category: Category, rejection: &Rejection) {
    info!(event = "launch.rejected", category = %category, reason = %rejection);
}

pub fn emit_pool_hit(run_id: &RunId, acquire_ms: u64) {
    info!(event = "pool.hit", run_id = %run_id, acquire_ms = acquire_ms);
}

/// Warning level: the run continues on the cold path.
pub fn emit_pool_miss(run_id: &RunId, error: &dyn std::fmt::Display) {
    warn!(event = "pool.miss", run_id = %run_id, error = %error);
}

pub fn emit_run_ready(run_id: &RunId, acquire_ms: u64, deploy_ms: u64, total_ms: u64) {
    info!(
        event = "run.ready",
        run_id = %run_id,
        acquire_ms = acquire_ms,
        deploy_ms = deploy_ms,
        total_ms = total_ms,
    );
}

pub fn emit_run_failed(run_id: &RunId, error: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, error = %error);
}

pub fn emit_run_deleted(run_id: &RunId, reason: &str, duration_ms: u64) {
    info!(
        event = "run.deleted",
        run_id = %run_id,
        reason = %reason,
        duration_ms = duration_ms,
    );
}

/// Warning level: bookkeeping already succeeded.
pub fn emit_release_error(run_id: &RunId, sandbox_id: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "sandbox.release_error",
        run_id = %run_id,
        sandbox_id = %sandbox_id,
        error = %error,
    );
}

pub fn emit_sweep_completed(expired: usize, remaining: usize) {
    info!(event = "sweep.completed", expired = expired, remaining = remaining);
}
