//! Backend trait definitions
//!
//! These traits describe the collaborators the broker drives but does not
//! own:
//! - `ProvisioningBackend`: create, drive and delete sandboxes
//! - `SandboxPool`: backend-managed reserve of pre-created sandboxes
//! - `ArchiveStore`: object storage holding prebuilt workload archives
//!
//! In-memory fakes live in the `fakes` module.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ArchiveError, BackendResult};
use crate::types::{CreateSpec, ExecOutput, PoolMetricsByImage, PoolSettings, SandboxHandle};

/// Remote provisioning service.
///
/// Every method may suspend for a long time; callers bound concurrency.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Create a brand-new sandbox.
    async fn create(&self, spec: &CreateSpec) -> BackendResult<SandboxHandle>;

    /// Run a command to completion inside the sandbox.
    ///
    /// `Ok` with `success == false` means the command ran and failed;
    /// `Err` means the command could not be delivered.
    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Duration,
    ) -> BackendResult<ExecOutput>;

    /// Start a command in the background and return its process id.
    async fn exec_detached(
        &self,
        handle: &SandboxHandle,
        command: &str,
        cwd: &str,
    ) -> BackendResult<u32>;

    /// Credentialed URL of the sandbox.
    async fn address(&self, handle: &SandboxHandle) -> BackendResult<String>;

    /// Destroy the sandbox. Best-effort from the caller's point of view.
    async fn delete(&self, handle: &SandboxHandle) -> BackendResult<()>;
}

/// Warm pool managed by the backend.
#[async_trait]
pub trait SandboxPool: Send + Sync {
    async fn start(&self, settings: &PoolSettings) -> BackendResult<()>;

    /// Fill the pool up to its target, giving up after `timeout`.
    async fn warm_up(&self, timeout: Duration) -> BackendResult<()>;

    /// Take a ready sandbox for `image`.
    async fn acquire(&self, image: &str) -> BackendResult<SandboxHandle>;

    fn metrics(&self) -> PoolMetricsByImage;

    async fn shutdown(&self) -> BackendResult<()>;
}

/// Object storage holding prebuilt workload archives.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Public download URL of an archive.
    fn archive_url(&self, archive_id: &str) -> String;

    /// Check that an archive exists; returns its size in bytes when known.
    async fn probe(&self, archive_id: &str) -> Result<Option<u64>, ArchiveError>;
}
