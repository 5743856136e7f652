//! Runs: one tracked attempt to obtain and use a sandbox.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use provision_backend::SandboxHandle;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};

/// Opaque, globally unique run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }

    /// First eight hex chars, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RunId(Uuid::parse_str(s)?))
    }
}

/// How a run obtains its sandbox; each category has its own concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Cold,
    Warm,
    Snapshot,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Cold, Category::Warm, Category::Snapshot];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Cold => "cold",
            Category::Warm => "warm",
            Category::Snapshot => "snapshot",
        }
    }

    /// Whether runs of this category try the warm pool before creating.
    pub fn uses_pool(&self) -> bool {
        matches!(self, Category::Warm | Category::Snapshot)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cold" => Ok(Category::Cold),
            "warm" => Ok(Category::Warm),
            "snapshot" => Ok(Category::Snapshot),
            other => Err(BrokerError::UnknownCategory(other.to_string())),
        }
    }
}

/// How the workload payload reaches the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    /// Download and unpack a prebuilt archive, cloning on any failure.
    #[default]
    Restore,
    /// Clone the workload from its source repository.
    Clone,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::Restore => "restore",
            DeployMode::Clone => "clone",
        }
    }
}

impl std::fmt::Display for DeployMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployMode {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "restore" | "snapshot" => Ok(DeployMode::Restore),
            "clone" | "git" => Ok(DeployMode::Clone),
            other => Err(BrokerError::UnknownDeployMode(other.to_string())),
        }
    }
}

/// Lifecycle status. Moves forward only:
/// `provisioning -> ready` or `provisioning -> failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Provisioning,
    Ready,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Provisioning => "provisioning",
            RunStatus::Ready => "ready",
            RunStatus::Failed => "failed",
        }
    }

    pub fn can_advance_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Provisioning, RunStatus::Ready) | (RunStatus::Provisioning, RunStatus::Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of a run. Mutated only by the run's provisioning task.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: RunId,
    pub category: Category,
    pub workload: String,
    pub deploy_mode: DeployMode,
    pub status: RunStatus,
    /// Absent until a sandbox is acquired.
    pub handle: Option<SandboxHandle>,
    /// The sandbox came from the warm pool rather than a cold create.
    pub pooled: bool,
    /// Relayed address; absent until ready.
    pub ingress_url: Option<String>,
    pub acquire_ms: Option<u64>,
    pub deploy_ms: Option<u64>,
    pub total_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// Set when the run becomes ready; provisioning runs never expire.
    pub expires_at: Option<DateTime<Utc>>,
    /// Run log lines in insertion order.
    pub logs: Vec<String>,
}

impl Run {
    pub fn new(
        run_id: RunId,
        category: Category,
        workload: &str,
        deploy_mode: DeployMode,
        created_at: DateTime<Utc>,
    ) -> Self {
        Run {
            run_id,
            category,
            workload: workload.to_string(),
            deploy_mode,
            status: RunStatus::Provisioning,
            handle: None,
            pooled: false,
            ingress_url: None,
            acquire_ms: None,
            deploy_ms: None,
            total_ms: None,
            created_at,
            expires_at: None,
            logs: Vec::new(),
        }
    }

    /// Move the status forward, rejecting any backward or repeated step.
    pub fn advance(&mut self, next: RunStatus) -> BrokerResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(BrokerError::InvalidTransition {
                run_id: self.run_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn info(&self, now: DateTime<Utc>) -> RunInfo {
        let duration_ms = (self.status == RunStatus::Ready)
            .then(|| millis_between(self.created_at, now));
        RunInfo {
            run_id: self.run_id,
            category: self.category,
            workload: self.workload.clone(),
            deploy_mode: self.deploy_mode,
            status: self.status,
            app_id: self.handle.as_ref().map(|h| h.id.clone()),
            pooled: self.pooled,
            ingress_url: self.ingress_url.clone(),
            acquire_ms: self.acquire_ms,
            deploy_ms: self.deploy_ms,
            total_ms: self.total_ms,
            duration_ms,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }

    pub fn summary(&self, deleted_at: DateTime<Utc>, reason: &str) -> DeletedSummary {
        DeletedSummary {
            run_id: self.run_id,
            category: self.category,
            workload: self.workload.clone(),
            deploy_mode: self.deploy_mode,
            final_status: self.status,
            acquire_ms: self.acquire_ms,
            deploy_ms: self.deploy_ms,
            total_ms: self.total_ms,
            duration_ms: millis_between(self.created_at, deleted_at),
            created_at: self.created_at,
            deleted_at,
            reason: reason.to_string(),
        }
    }
}

pub(crate) fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

/// Caller-facing view of a run. Carries no credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: RunId,
    pub category: Category,
    pub workload: String,
    pub deploy_mode: DeployMode,
    pub status: RunStatus,
    pub app_id: Option<String>,
    pub pooled: bool,
    pub ingress_url: Option<String>,
    pub acquire_ms: Option<u64>,
    pub deploy_ms: Option<u64>,
    pub total_ms: Option<u64>,
    /// Time alive so far, while ready.
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Redacted record of a deleted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedSummary {
    pub run_id: RunId,
    pub category: Category,
    pub workload: String,
    pub deploy_mode: DeployMode,
    pub final_status: RunStatus,
    pub acquire_ms: Option<u64>,
    pub deploy_ms: Option<u64>,
    pub total_ms: Option<u64>,
    /// Creation to deletion.
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: DateTime<Utc>,
    pub reason: String,
}
