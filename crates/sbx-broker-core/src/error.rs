//! Error taxonomy for the sandbox broker.
//!
//! Only `AdmissionRejected` (at launch) and `Provisioning` (through the run's
//! event stream) ever reach a caller. Pool misses, propagation lag and
//! archive failures are absorbed by fallbacks inside the orchestrator.

use provision_backend::BackendError;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::domain::{Category, RunId, RunStatus};

/// Why the admission limiter turned a launch away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("rate limit exceeded: {used}/{limit} runs this hour, resets in {reset_in_secs}s")]
    HourlyQuota {
        used: u32,
        limit: u32,
        reset_in_secs: u64,
    },

    #[error("max active sandboxes reached: {active}/{cap}")]
    GlobalCapacity { active: usize, cap: usize },

    #[error("max {category} reached: {active}/{cap}")]
    CategoryCapacity {
        category: Category,
        active: usize,
        cap: usize,
    },
}

/// Errors produced by the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("{0}")]
    AdmissionRejected(#[from] Rejection),

    #[error("unknown workload: {0}")]
    UnknownWorkload(String),

    #[error("unknown category: {0}")]
    UnknownCategory(String),

    #[error("unknown deploy mode: {0}")]
    UnknownDeployMode(String),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl BrokerError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::AdmissionRejected(_))
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
