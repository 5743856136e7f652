//! Per-run provisioning task: acquire, deploy, start, ready.
//!
//! Each step logs to the run and checks that the run is still live before
//! moving on. A deletion mid-step stops the task at the next boundary; a
//! sandbox acquired after the deletion is released, never leaked.

use std::sync::Arc;
use std::time::Duration;

use provision_backend::{ArchiveError, BackendError, CreateSpec, ExecOutput, SandboxHandle};
use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use super::retry::retry_transient;
use super::BrokerInner;
use crate::config::WorkloadSpec;
use crate::domain::{DeployMode, Run, RunStatus};
use crate::error::BrokerError;
use crate::obs;
use crate::registry::RunSlot;

const ARCHIVE_TMP: &str = "/tmp/snapshot.tar.gz";

enum StepError {
    /// The run was deleted while the step was in flight.
    Gone,
    Failed(BrokerError),
}

impl From<BrokerError> for StepError {
    fn from(err: BrokerError) -> Self {
        StepError::Failed(err)
    }
}

impl From<BackendError> for StepError {
    fn from(err: BackendError) -> Self {
        StepError::Failed(err.into())
    }
}

type StepResult<T> = Result<T, StepError>;

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn step_log(slot: &RunSlot, message: &str) -> StepResult<()> {
    if slot.log(message) {
        Ok(())
    } else {
        Err(StepError::Gone)
    }
}

fn first_line(text: &str) -> &str {
    text.trim().lines().next().unwrap_or("")
}

/// Drive one run to `ready`, or to `failed` and deletion.
pub(super) async fn provision(inner: Arc<BrokerInner>, slot: Arc<RunSlot>, workload: WorkloadSpec) {
    let run_id = slot.run_id();
    match drive(&inner, &slot, &workload).await {
        Ok(()) => {}
        Err(StepError::Gone) => {
            debug!(run_id = %run_id, "run deleted during provisioning; task stopped");
        }
        Err(StepError::Failed(err)) => {
            match slot.mark_failed(&err.to_string()) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(run_id = %run_id, error = %err, "run deleted during provisioning; task stopped");
                    return;
                }
                Err(transition) => {
                    debug!(run_id = %run_id, error = %transition, "run could not be marked failed");
                }
            }
            obs::emit_run_failed(&run_id, &err);
            inner.metrics.inc_runs_failed();
            inner
                .journal
                .error(format!("Run {} failed: {}", run_id.short(), err));
            inner.delete(&run_id, "provisioning failed").await;
        }
    }
}

async fn drive(inner: &BrokerInner, slot: &RunSlot, workload: &WorkloadSpec) -> StepResult<()> {
    let started = Instant::now();
    let run = slot.snapshot();
    let run_id = run.run_id;

    let (handle, pooled) = acquire(inner, slot, &run, workload).await?;
    let acquire_ms = elapsed_ms(started);
    if let Err(orphan) = slot.attach_handle(handle.clone(), acquire_ms, pooled) {
        inner.release_sandbox(&run_id, &orphan).await;
        return Err(StepError::Gone);
    }
    step_log(slot, &format!("Sandbox ready in {}ms", acquire_ms))?;
    step_log(slot, &format!("App ID: {}", handle.id))?;

    let propagation = inner.config.propagation_delay();
    if !propagation.is_zero() {
        step_log(
            slot,
            &format!("Waiting {}s for DNS propagation...", propagation.as_secs()),
        )?;
        tokio::time::sleep(propagation).await;
    }

    let deploy_started = Instant::now();
    deploy(inner, slot, &handle, run.deploy_mode, workload).await?;
    let deploy_ms = elapsed_ms(deploy_started);
    slot.set_deploy_ms(deploy_ms);

    let workspace = &inner.config.workspace_dir;
    step_log(slot, &format!("Starting {}...", run.workload))?;
    let command = format!("cd {}/{} && {}", workspace, workload.path, workload.run);
    let pid = inner
        .remote(inner.backend.exec_detached(&handle, &command, workspace))
        .await?;
    step_log(slot, &format!("Workload started (pid {})", pid))?;

    let ingress_url = format!(
        "{}/{}",
        inner.config.ingress_prefix.trim_end_matches('/'),
        run_id
    );
    let lifetime = inner.config.lifetime;
    let minutes = rand::rng().random_range(lifetime.min_minutes..=lifetime.max_minutes);
    let expires_at = inner.registry.now() + chrono::Duration::minutes(i64::from(minutes));
    let total_ms = elapsed_ms(started);

    if !slot.mark_ready(&ingress_url, total_ms, expires_at)? {
        return Err(StepError::Gone);
    }
    inner.metrics.inc_runs_ready();
    obs::emit_run_ready(&run_id, acquire_ms, deploy_ms, total_ms);
    inner.journal.info(format!(
        "Run {} ready in {}ms (acquire {}ms, deploy {}ms)",
        run_id.short(),
        total_ms,
        acquire_ms,
        deploy_ms
    ));

    step_log(slot, &format!("Workload live at: {}", ingress_url))?;
    step_log(slot, &format!("Total time: {}ms", total_ms))?;
    step_log(slot, &format!("Auto-cleanup in {} minutes", minutes))?;
    Ok(())
}

/// Warm pool first when the category asks for it, cold create otherwise
/// or on any pool error. The flag is true for a pool hit.
async fn acquire(
    inner: &BrokerInner,
    slot: &RunSlot,
    run: &Run,
    workload: &WorkloadSpec,
) -> StepResult<(SandboxHandle, bool)> {
    let run_id = run.run_id;
    if let Some(pool) = inner.pool_for(run.category) {
        step_log(slot, "Acquiring sandbox from warm pool...")?;
        slot.emit_status(RunStatus::Provisioning);

        let started = Instant::now();
        match inner.remote(pool.acquire(&workload.image)).await {
            Ok(handle) => {
                inner.metrics.inc_pool_hits();
                obs::emit_pool_hit(&run_id, elapsed_ms(started));
                inner.journal.info(format!(
                    "Pool hit for run {}: {}",
                    run_id.short(),
                    handle.id
                ));
                return Ok((handle, true));
            }
            Err(err) => {
                inner.metrics.inc_pool_misses();
                obs::emit_pool_miss(&run_id, &err);
                inner
                    .journal
                    .warn(format!("Pool miss for run {}: {}", run_id.short(), err));
                step_log(slot, "Pool miss, falling back to cold start...")?;
            }
        }
    } else {
        step_log(slot, "Creating cold sandbox...")?;
        slot.emit_status(RunStatus::Provisioning);
    }

    let spec = CreateSpec::new(&workload.image, inner.config.timeouts.create());
    let handle = inner.remote(inner.backend.create(&spec)).await?;
    Ok((handle, false))
}

async fn exec(
    inner: &BrokerInner,
    handle: &SandboxHandle,
    command: &str,
    timeout: Duration,
) -> StepResult<ExecOutput> {
    let output = retry_transient(&inner.config.retry, move || {
        inner.remote(inner.backend.exec(handle, command, timeout))
    })
    .await?;
    Ok(output)
}

async fn deploy(
    inner: &BrokerInner,
    slot: &RunSlot,
    handle: &SandboxHandle,
    mode: DeployMode,
    workload: &WorkloadSpec,
) -> StepResult<()> {
    let restored = match mode {
        DeployMode::Restore => restore_archive(inner, slot, handle, workload).await?,
        DeployMode::Clone => false,
    };
    if !restored {
        if mode == DeployMode::Restore {
            step_log(slot, "Falling back to source clone...")?;
        }
        clone_from_source(inner, slot, handle, workload).await?;
    }
    install_dependencies(inner, slot, handle, workload).await
}

/// Fetch and unpack the workload archive. `Ok(false)` means use the clone
/// path instead.
async fn restore_archive(
    inner: &BrokerInner,
    slot: &RunSlot,
    handle: &SandboxHandle,
    workload: &WorkloadSpec,
) -> StepResult<bool> {
    step_log(slot, "Restoring from archive...")?;
    let Some(archives) = &inner.archives else {
        step_log(slot, "Archive storage not configured")?;
        return Ok(false);
    };

    let archive_id = &workload.archive_id;
    match inner.remote(archives.probe(archive_id)).await {
        Ok(Some(size)) => step_log(
            slot,
            &format!(
                "Found archive {} ({:.1} MB)",
                archive_id,
                size as f64 / (1024.0 * 1024.0)
            ),
        )?,
        Ok(None) => step_log(slot, &format!("Found archive {}", archive_id))?,
        Err(ArchiveError::NotFound(_)) => {
            step_log(slot, &format!("Archive {} not found", archive_id))?;
            return Ok(false);
        }
        Err(err) => {
            step_log(slot, &format!("Archive check failed: {}", err))?;
            return Ok(false);
        }
    }

    let timeouts = inner.config.timeouts;
    step_log(slot, &format!("Downloading archive: {}", archive_id))?;
    let url = archives.archive_url(archive_id);
    let download = exec(
        inner,
        handle,
        &format!("wget -q -O {} {}", ARCHIVE_TMP, url),
        timeouts.download(),
    )
    .await?;
    if !download.success {
        step_log(
            slot,
            &format!("Download failed: {}", first_line(&download.stderr)),
        )?;
        return Ok(false);
    }

    step_log(slot, "Extracting archive...")?;
    let extract = exec(
        inner,
        handle,
        &format!(
            "cd {} && tar -xzf {}",
            inner.config.workspace_dir, ARCHIVE_TMP
        ),
        timeouts.extract(),
    )
    .await?;
    if !extract.success {
        step_log(
            slot,
            &format!("Extract failed: {}", first_line(&extract.stderr)),
        )?;
        return Ok(false);
    }

    step_log(slot, "Archive restored")?;
    Ok(true)
}

async fn clone_from_source(
    inner: &BrokerInner,
    slot: &RunSlot,
    handle: &SandboxHandle,
    workload: &WorkloadSpec,
) -> StepResult<()> {
    let repo = &inner.config.source_repo;
    let workspace = &inner.config.workspace_dir;
    let timeouts = inner.config.timeouts;

    step_log(slot, &format!("Cloning from {}...", repo))?;
    let clone = exec(
        inner,
        handle,
        &format!("git clone --depth 1 {} {}/source", repo, workspace),
        timeouts.clone_repo(),
    )
    .await?;
    if !clone.success {
        return Err(BrokerError::Provisioning(format!(
            "git clone failed: {}",
            first_line(&clone.stderr)
        ))
        .into());
    }
    step_log(slot, "Repository cloned")?;

    let moved = exec(
        inner,
        handle,
        &format!(
            "mv {ws}/source/{path} {ws}/{path}",
            ws = workspace,
            path = workload.path
        ),
        timeouts.move_files(),
    )
    .await?;
    if !moved.success {
        return Err(BrokerError::Provisioning(format!(
            "moving {} into the workspace failed: {}",
            workload.path,
            first_line(&moved.stderr)
        ))
        .into());
    }
    Ok(())
}

/// Best-effort: a failed install is a warning, not a failed run.
async fn install_dependencies(
    inner: &BrokerInner,
    slot: &RunSlot,
    handle: &SandboxHandle,
    workload: &WorkloadSpec,
) -> StepResult<()> {
    step_log(slot, "Installing dependencies...")?;
    let command = format!(
        "cd {}/{} && {}",
        inner.config.workspace_dir, workload.path, workload.install
    );
    match exec(inner, handle, &command, inner.config.timeouts.install()).await {
        Ok(out) if out.success => step_log(slot, "Dependencies installed"),
        Ok(out) => step_log(slot, &format!("Warning: {}", first_line(&out.stderr))),
        Err(StepError::Failed(err)) => step_log(slot, &format!("Warning: {}", err)),
        Err(StepError::Gone) => Err(StepError::Gone),
    }
}
