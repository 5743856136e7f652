//! In-memory fakes for the backend traits (testing and simulation)
//!
//! Provides `MemoryBackend`, `MemoryPool` and `MemoryArchiveStore`. Each one
//! records what it was asked to do and can be scripted to fail, so the
//! broker's fallback and retry paths can be exercised without a network.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ArchiveError, BackendError, BackendErrorKind, BackendResult};
use crate::traits::{ArchiveStore, ProvisioningBackend, SandboxPool};
use crate::types::{
    CreateSpec, ExecOutput, OnEmpty, PoolMetrics, PoolMetricsByImage, PoolSettings, SandboxHandle,
    SandboxMode,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fake_handle(prefix: &str, n: u32, image: &str) -> SandboxHandle {
    SandboxHandle {
        id: format!("{}-{:04}", prefix, n),
        image: image.to_string(),
        mode: SandboxMode::Service,
        base_url: format!("https://{}-{:04}.sandbox.local", prefix, n),
        service_token: Some(format!("token-{}-{:04}", prefix, n)),
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BackendState {
    create_failures: VecDeque<BackendError>,
    transient_exec_failures: u32,
    exec_rules: Vec<(String, ExecOutput)>,
    delete_failures: VecDeque<BackendError>,
    commands: Vec<String>,
    detached: Vec<(String, String)>,
    live: BTreeSet<String>,
    deleted: Vec<String>,
}

/// Scriptable in-memory provisioning backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    create_delay: Mutex<Duration>,
    next_id: AtomicU32,
    next_pid: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `create` take this long.
    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = delay;
    }

    /// Fail the next `create` call with `err`.
    pub fn fail_next_create(&self, err: BackendError) {
        lock(&self.state).create_failures.push_back(err);
    }

    /// Fail the next `n` `exec` calls with a connectivity error.
    pub fn fail_exec_transiently(&self, n: u32) {
        lock(&self.state).transient_exec_failures = n;
    }

    /// Answer any command containing `pattern` with `output`.
    pub fn on_exec(&self, pattern: &str, output: ExecOutput) {
        lock(&self.state)
            .exec_rules
            .push((pattern.to_string(), output));
    }

    pub fn fail_next_delete(&self, err: BackendError) {
        lock(&self.state).delete_failures.push_back(err);
    }

    /// Every command passed to `exec`, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// `(command, cwd)` of every detached start, in order.
    pub fn detached(&self) -> Vec<(String, String)> {
        lock(&self.state).detached.clone()
    }

    /// Ids of sandboxes created and not yet deleted.
    pub fn live(&self) -> Vec<String> {
        lock(&self.state).live.iter().cloned().collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    /// Adopt a sandbox handed out by a pool so deletes are accounted for.
    pub fn adopt(&self, handle: &SandboxHandle) {
        lock(&self.state).live.insert(handle.id.clone());
    }
}

#[async_trait]
impl ProvisioningBackend for MemoryBackend {
    async fn create(&self, spec: &CreateSpec) -> BackendResult<SandboxHandle> {
        let delay = *lock(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock(&self.state).create_failures.pop_front() {
            return Err(err);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = fake_handle("cold", n, &spec.image);
        lock(&self.state).live.insert(handle.id.clone());
        Ok(handle)
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        _timeout: Duration,
    ) -> BackendResult<ExecOutput> {
        let mut state = lock(&self.state);
        state.commands.push(command.to_string());
        if state.transient_exec_failures > 0 {
            state.transient_exec_failures -= 1;
            return Err(BackendError::connectivity(
                "exec",
                format!("{}: Name or service not known", handle.base_url),
            ));
        }
        let scripted = state
            .exec_rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, out)| out.clone());
        Ok(scripted.unwrap_or_else(|| ExecOutput::ok("")))
    }

    async fn exec_detached(
        &self,
        _handle: &SandboxHandle,
        command: &str,
        cwd: &str,
    ) -> BackendResult<u32> {
        lock(&self.state)
            .detached
            .push((command.to_string(), cwd.to_string()));
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst) + 100)
    }

    async fn address(&self, handle: &SandboxHandle) -> BackendResult<String> {
        Ok(handle.base_url.clone())
    }

    async fn delete(&self, handle: &SandboxHandle) -> BackendResult<()> {
        let mut state = lock(&self.state);
        if let Some(err) = state.delete_failures.pop_front() {
            return Err(err);
        }
        if !state.live.remove(&handle.id) {
            return Err(BackendError::new(
                BackendErrorKind::NotFound,
                "delete",
                format!("sandbox {} not found", handle.id),
            ));
        }
        state.deleted.push(handle.id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPool
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PoolState {
    settings: Option<PoolSettings>,
    ready: BTreeMap<String, u32>,
    acquire_failures: VecDeque<BackendError>,
    acquired: Vec<String>,
    warmed: bool,
    shut_down: bool,
}

/// In-memory warm pool with a ready count per image.
#[derive(Debug, Default)]
pub struct MemoryPool {
    state: Mutex<PoolState>,
    next_id: AtomicU32,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, image: &str, ready: u32) {
        lock(&self.state).ready.insert(image.to_string(), ready);
    }

    pub fn fail_next_acquire(&self, err: BackendError) {
        lock(&self.state).acquire_failures.push_back(err);
    }

    /// Ids handed out by `acquire`, in order.
    pub fn acquired(&self) -> Vec<String> {
        lock(&self.state).acquired.clone()
    }

    pub fn is_started(&self) -> bool {
        let state = lock(&self.state);
        state.settings.is_some() && !state.shut_down
    }

    pub fn was_warmed(&self) -> bool {
        lock(&self.state).warmed
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }
}

#[async_trait]
impl SandboxPool for MemoryPool {
    async fn start(&self, settings: &PoolSettings) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.settings = Some(settings.clone());
        state.shut_down = false;
        Ok(())
    }

    async fn warm_up(&self, _timeout: Duration) -> BackendResult<()> {
        let mut state = lock(&self.state);
        let Some(settings) = state.settings.clone() else {
            return Err(BackendError::new(
                BackendErrorKind::Rejected,
                "warm_up",
                "pool not started",
            ));
        };
        for image in &settings.images {
            state.ready.insert(image.clone(), settings.target_ready);
        }
        state.warmed = true;
        Ok(())
    }

    async fn acquire(&self, image: &str) -> BackendResult<SandboxHandle> {
        let mut state = lock(&self.state);
        if let Some(err) = state.acquire_failures.pop_front() {
            return Err(err);
        }
        let Some(settings) = state.settings.clone() else {
            return Err(BackendError::new(
                BackendErrorKind::Rejected,
                "acquire",
                "pool not started",
            ));
        };
        if !settings.images.iter().any(|i| i == image) {
            return Err(BackendError::pool_exhausted(image));
        }
        let ready = state.ready.entry(image.to_string()).or_insert(0);
        if *ready == 0 && settings.on_empty == OnEmpty::Fail {
            return Err(BackendError::pool_exhausted(image));
        }
        *ready = ready.saturating_sub(1);
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = fake_handle("warm", n, image);
        state.acquired.push(handle.id.clone());
        Ok(handle)
    }

    fn metrics(&self) -> PoolMetricsByImage {
        let state = lock(&self.state);
        state
            .ready
            .iter()
            .map(|(image, ready)| {
                (
                    image.clone(),
                    PoolMetrics {
                        ready: *ready,
                        creating: 0,
                    },
                )
            })
            .collect()
    }

    async fn shutdown(&self) -> BackendResult<()> {
        let mut state = lock(&self.state);
        state.shut_down = true;
        state.ready.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryArchiveStore
// ---------------------------------------------------------------------------

/// Archive store that knows a fixed set of archive ids.
#[derive(Debug, Default)]
pub struct MemoryArchiveStore {
    archives: Mutex<BTreeMap<String, u64>>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive(self, archive_id: &str, size: u64) -> Self {
        lock(&self.archives).insert(archive_id.to_string(), size);
        self
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    fn archive_url(&self, archive_id: &str) -> String {
        format!("https://archives.local/snapshots/{}.tar.gz", archive_id)
    }

    async fn probe(&self, archive_id: &str) -> Result<Option<u64>, ArchiveError> {
        lock(&self.archives)
            .get(archive_id)
            .copied()
            .map(Some)
            .ok_or_else(|| ArchiveError::NotFound(archive_id.to_string()))
    }
}
