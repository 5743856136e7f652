//! Value types exchanged with the provisioning backend

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the backend exposes a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Sandbox runs an HTTP service API; commands go through it and every
    /// request needs the per-sandbox service token.
    #[default]
    Service,
    /// Sandbox is driven through the platform console.
    Console,
}

/// Reference to a provisioned sandbox.
///
/// The service token is a credential: it is never serialized and is
/// redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Backend identifier of the resource (app id).
    pub id: String,
    /// Image the sandbox was created from.
    pub image: String,
    pub mode: SandboxMode,
    /// Credentialed base URL of the sandbox. Never handed to callers.
    pub base_url: String,
    #[serde(skip)]
    pub service_token: Option<String>,
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("image", &self.image)
            .field("mode", &self.mode)
            .field("base_url", &self.base_url)
            .field(
                "service_token",
                &self.service_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Parameters for creating a sandbox from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    pub image: String,
    pub mode: SandboxMode,
    /// Block until the backend reports the sandbox ready.
    pub wait_ready: bool,
    pub timeout: Duration,
}

impl CreateSpec {
    pub fn new(image: &str, timeout: Duration) -> Self {
        CreateSpec {
            image: image.to_string(),
            mode: SandboxMode::Service,
            wait_ready: true,
            timeout,
        }
    }
}

/// Outcome of a command executed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn ok(stdout: &str) -> Self {
        ExecOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn failed(stderr: &str) -> Self {
        ExecOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(1),
        }
    }
}

/// What the pool does when asked for a sandbox it does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnEmpty {
    /// Create one on demand (slow path inside the pool).
    #[default]
    Create,
    /// Fail the acquisition with `PoolExhausted`.
    Fail,
}

/// Warm pool tuning. Built once, validated by the broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Images kept warm; anything else always cold-starts.
    pub images: Vec<String>,
    /// Ready sandboxes to maintain once the pool is active.
    pub target_ready: u32,
    /// Hard ceiling on ready sandboxes.
    pub max_ready: u32,
    /// Idle seconds before scale-down begins.
    pub idle_timeout_secs: u64,
    /// Seconds between successive scale-down steps.
    pub scale_down_delay_secs: u64,
    /// Scale-down pause after an acquire.
    pub cooldown_after_acquire_secs: u64,
    /// Warm sandboxes older than this are recycled.
    pub max_warm_age_secs: u64,
    pub max_concurrent_creates: u32,
    /// Cap on every sandbox the pool owns, ready or handed out.
    pub max_total: u32,
    pub on_empty: OnEmpty,
    pub create_retries: u32,
    pub create_retry_delay_secs: u64,
    /// Warm up at start instead of scaling on first demand.
    pub warm_up_at_start: bool,
    pub warm_up_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            images: vec!["python".to_string()],
            target_ready: 2,
            max_ready: 3,
            idle_timeout_secs: 600,
            scale_down_delay_secs: 120,
            cooldown_after_acquire_secs: 300,
            max_warm_age_secs: 3600,
            max_concurrent_creates: 1,
            max_total: 5,
            on_empty: OnEmpty::Create,
            create_retries: 2,
            create_retry_delay_secs: 10,
            warm_up_at_start: false,
            warm_up_timeout_secs: 60,
        }
    }
}

/// Per-image pool gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PoolMetrics {
    pub ready: u32,
    pub creating: u32,
}

/// Pool gauges keyed by image.
pub type PoolMetricsByImage = BTreeMap<String, PoolMetrics>;
