//! Lifecycle orchestrator.
//!
//! [`Broker`] owns every piece of shared state (limiter, registry, journal,
//! metrics) and the handles to the remote collaborators. `launch` admits a
//! run, allocates it and returns at once with a live subscription; the
//! acquire, deploy, start and ready sequence runs on its own task
//! (see `provision`). Deletion is idempotent and may come from the caller,
//! the failure path or the expiry sweeper.

mod provision;
mod retry;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use provision_backend::{
    ArchiveStore, PoolMetricsByImage, ProvisioningBackend, SandboxHandle, SandboxPool,
    SpacesArchiveStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Instrument};

use crate::channel::Subscription;
use crate::clock::{Clock, SystemClock};
use crate::config::{BrokerConfig, ConfigError};
use crate::domain::run::millis_between;
use crate::domain::{Category, DeletedSummary, DeployMode, RunId, RunInfo};
use crate::error::{BrokerError, BrokerResult};
use crate::journal::{Journal, JournalEntry};
use crate::limiter::AdmissionLimiter;
use crate::metrics::{BrokerMetrics, MetricsSnapshot};
use crate::obs::{self, RunSpan};
use crate::registry::RunRegistry;
use crate::sweeper;

/// What a successful launch hands back, before any remote work completes.
#[derive(Debug)]
pub struct Launched {
    pub run_id: RunId,
    /// Path a transport layer would serve the event stream on.
    pub stream_path: String,
    /// Live subscription, attached before provisioning starts.
    pub events: Subscription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub enabled: bool,
    pub started: bool,
    pub ready: u32,
    pub creating: u32,
    /// Live runs holding a sandbox taken from the pool.
    pub in_use: usize,
    pub by_image: PoolMetricsByImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateStatus {
    pub used: u32,
    pub limit: u32,
    pub reset_in_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsStatus {
    pub caps: BTreeMap<Category, usize>,
    pub max_total_active: usize,
    pub max_runs_per_hour: u32,
}

/// Operator snapshot returned by [`Broker::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerStatus {
    pub active: BTreeMap<Category, usize>,
    pub total_active: usize,
    pub pool: PoolStatus,
    pub rate: RateStatus,
    pub limits: LimitsStatus,
}

pub(crate) struct BrokerInner {
    pub(crate) config: BrokerConfig,
    pub(crate) limiter: AdmissionLimiter,
    pub(crate) registry: RunRegistry,
    pub(crate) backend: Arc<dyn ProvisioningBackend>,
    pub(crate) pool: Option<Arc<dyn SandboxPool>>,
    pub(crate) archives: Option<Arc<dyn ArchiveStore>>,
    pub(crate) journal: Journal,
    pub(crate) metrics: BrokerMetrics,
    workers: Semaphore,
    pool_started: AtomicBool,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerInner {
    /// Run a remote call under one of the backend worker permits.
    pub(crate) async fn remote<T>(&self, call: impl Future<Output = T>) -> T {
        let _permit = self.workers.acquire().await.ok();
        call.await
    }

    /// Pool to try for `category`, if any.
    pub(crate) fn pool_for(&self, category: Category) -> Option<&Arc<dyn SandboxPool>> {
        self.pool.as_ref().filter(|_| category.uses_pool())
    }

    /// Delete a run's bookkeeping, then release its sandbox best-effort.
    pub(crate) async fn delete(&self, run_id: &RunId, reason: &str) -> bool {
        let handle = {
            let _span = RunSpan::enter(run_id);
            let Some(run) = self.registry.delete(run_id, reason) else {
                return false;
            };
            self.limiter.release(run_id);
            self.metrics.inc_runs_deleted();
            obs::emit_run_deleted(
                run_id,
                reason,
                millis_between(run.created_at, self.registry.now()),
            );
            self.journal
                .info(format!("Deleted run {} ({})", run_id.short(), reason));
            run.handle
        };
        if let Some(handle) = handle {
            self.release_sandbox(run_id, &handle).await;
        }
        true
    }

    /// Ask the backend to destroy a sandbox; failures are logged only.
    pub(crate) async fn release_sandbox(&self, run_id: &RunId, handle: &SandboxHandle) {
        if let Err(err) = self.remote(self.backend.delete(handle)).await {
            obs::emit_release_error(run_id, &handle.id, &err);
            self.journal
                .warn(format!("Failed to delete sandbox {}: {}", handle.id, err));
        }
    }
}

pub struct BrokerBuilder {
    config: BrokerConfig,
    backend: Arc<dyn ProvisioningBackend>,
    pool: Option<Arc<dyn SandboxPool>>,
    archives: Option<Arc<dyn ArchiveStore>>,
    clock: Arc<dyn Clock>,
}

impl BrokerBuilder {
    pub fn with_pool(mut self, pool: Arc<dyn SandboxPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_archives(mut self, archives: Arc<dyn ArchiveStore>) -> Self {
        self.archives = Some(archives);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and assemble the broker.
    ///
    /// A configured pool section needs a pool collaborator. Without an
    /// explicit archive store, one is built from the `archives` section.
    pub fn build(self) -> BrokerResult<Broker> {
        let config = self.config;
        config.validate()?;

        let pool = match (config.pool.is_some(), self.pool) {
            (true, Some(pool)) => Some(pool),
            (true, None) => {
                return Err(ConfigError::Invalid(
                    "pool is enabled but no pool backend was supplied".into(),
                )
                .into())
            }
            (false, Some(_)) => {
                warn!("pool backend supplied while the pool is disabled; ignoring it");
                None
            }
            (false, None) => None,
        };

        let archives = match (self.archives, &config.archives) {
            (Some(store), _) => Some(store),
            (None, Some(settings)) => {
                let store = SpacesArchiveStore::new(settings.spaces())
                    .map_err(|e| ConfigError::Invalid(format!("archive store: {}", e)))?;
                Some(Arc::new(store) as Arc<dyn ArchiveStore>)
            }
            (None, None) => None,
        };

        let inner = BrokerInner {
            limiter: AdmissionLimiter::new(config.limits.clone(), self.clock.clone()),
            registry: RunRegistry::new(self.clock, config.history_capacity, config.keepalive()),
            backend: self.backend,
            pool,
            archives,
            journal: Journal::new(config.journal_capacity),
            metrics: BrokerMetrics::new(),
            workers: Semaphore::new(config.backend_workers),
            pool_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
            config,
        };
        Ok(Broker {
            inner: Arc::new(inner),
        })
    }
}

/// Handle to one broker. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("active", &self.inner.registry.len())
            .field("pool", &self.inner.pool.is_some())
            .field("archives", &self.inner.archives.is_some())
            .finish()
    }
}

impl Broker {
    pub fn builder(config: BrokerConfig, backend: Arc<dyn ProvisioningBackend>) -> BrokerBuilder {
        BrokerBuilder {
            config,
            backend,
            pool: None,
            archives: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<BrokerInner> {
        &self.inner
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Admit and start a run.
    ///
    /// Rejections come back synchronously; everything after admission
    /// happens on a spawned task and is reported through `events`.
    pub async fn launch(
        &self,
        category: Category,
        workload: &str,
        deploy_mode: DeployMode,
    ) -> BrokerResult<Launched> {
        let inner = &self.inner;
        let spec = inner
            .config
            .workload(workload)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownWorkload(workload.to_string()))?;

        let ticket = match inner.limiter.try_admit(category) {
            Ok(ticket) => ticket,
            Err(rejection) => {
                inner.metrics.inc_launches_rejected();
                obs::emit_launch_rejected(category, &rejection);
                inner
                    .journal
                    .warn(format!("Rejected {} launch: {}", category, rejection));
                return Err(rejection.into());
            }
        };

        let slot = inner.registry.allocate(ticket, workload, deploy_mode);
        let run_id = slot.run_id();
        let events = slot.subscribe(inner.config.keepalive());

        inner.metrics.inc_launches_accepted();
        obs::emit_launch_accepted(&run_id, category, workload);
        inner.journal.info(format!(
            "Launching {} run {} ({}, {})",
            category,
            run_id.short(),
            workload,
            deploy_mode
        ));

        tokio::spawn(
            provision::provision(inner.clone(), slot, spec).instrument(obs::run_span(&run_id)),
        );

        Ok(Launched {
            run_id,
            stream_path: format!("/api/stream/{}", run_id),
            events,
        })
    }

    /// Delete a run on the caller's behalf. `false` if it was not live.
    pub async fn delete(&self, run_id: &RunId) -> bool {
        self.inner.delete(run_id, "user request").await
    }

    pub fn get(&self, run_id: &RunId) -> Option<RunInfo> {
        let now = self.inner.registry.now();
        self.inner.registry.get(run_id).map(|run| run.info(now))
    }

    /// Attach a new subscriber: replayed history, then live events.
    pub fn stream(&self, run_id: &RunId) -> BrokerResult<Subscription> {
        self.inner
            .registry
            .subscribe(run_id)
            .ok_or(BrokerError::RunNotFound(*run_id))
    }

    pub fn active_runs(&self) -> Vec<RunInfo> {
        let now = self.inner.registry.now();
        self.inner
            .registry
            .list_active()
            .iter()
            .map(|run| run.info(now))
            .collect()
    }

    pub fn deleted_history(&self, limit: usize) -> Vec<DeletedSummary> {
        self.inner.registry.list_deleted(limit)
    }

    pub fn journal(&self, limit: usize) -> Vec<JournalEntry> {
        self.inner.journal.recent(limit)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn status(&self) -> BrokerStatus {
        let inner = &self.inner;
        let limiter = inner.limiter.status();

        let by_image = inner
            .pool
            .as_ref()
            .map(|pool| pool.metrics())
            .unwrap_or_default();
        let in_use = inner.registry.count_pooled();
        let pool = PoolStatus {
            enabled: inner.pool.is_some(),
            started: inner.pool_started.load(Ordering::SeqCst),
            ready: by_image.values().map(|m| m.ready).sum(),
            creating: by_image.values().map(|m| m.creating).sum(),
            in_use,
            by_image,
        };

        BrokerStatus {
            total_active: limiter.total_active,
            pool,
            rate: RateStatus {
                used: limiter.hourly_used,
                limit: limiter.hourly_limit,
                reset_in_seconds: limiter.reset_in_seconds,
            },
            limits: LimitsStatus {
                caps: limiter.caps,
                max_total_active: limiter.max_total_active,
                max_runs_per_hour: limiter.hourly_limit,
            },
            active: limiter.active,
        }
    }

    /// Start the warm pool, if one is configured. Idempotent.
    ///
    /// Returns whether a pool is running afterwards. Warm-up, when enabled,
    /// continues in the background.
    pub async fn start_pool(&self) -> BrokerResult<bool> {
        let inner = &self.inner;
        let (Some(pool), Some(settings)) = (&inner.pool, &inner.config.pool) else {
            return Ok(false);
        };
        if inner.pool_started.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }
        if let Err(err) = inner.remote(pool.start(settings)).await {
            inner.pool_started.store(false, Ordering::SeqCst);
            inner
                .journal
                .error(format!("Failed to start warm pool: {}", err));
            return Err(err.into());
        }
        inner.journal.info(format!(
            "Warm pool started: images {:?}, target {} ready, max {} ready, max {} total",
            settings.images, settings.target_ready, settings.max_ready, settings.max_total
        ));

        if settings.warm_up_at_start {
            let timeout = Duration::from_secs(settings.warm_up_timeout_secs);
            let pool = pool.clone();
            let inner = inner.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = inner.cancel.cancelled() => {}
                    res = tokio::time::timeout(timeout, pool.warm_up(timeout)) => match res {
                        Ok(Ok(())) => inner.journal.info("Warm pool warmed up"),
                        Ok(Err(err)) => inner.journal.warn(format!("Warm-up failed: {}", err)),
                        Err(_) => inner
                            .journal
                            .warn("Warm-up timed out; pool keeps warming in the background"),
                    },
                }
            });
        }
        Ok(true)
    }

    /// Start the pool (if configured) and the expiry sweeper.
    pub async fn start(&self) -> BrokerResult<()> {
        self.start_pool().await?;
        let mut sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if sweeper.is_none() && !self.inner.cancel.is_cancelled() {
            *sweeper = Some(sweeper::spawn_sweeper(
                self.inner.clone(),
                self.inner.cancel.clone(),
            ));
        }
        Ok(())
    }

    /// One expiry pass now; returns how many runs were reaped.
    pub async fn sweep_now(&self) -> usize {
        sweeper::sweep_once(&self.inner).await
    }

    /// Stop the sweeper, drain live runs and shut the pool down.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        let sweeper = inner
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = sweeper {
            if let Err(err) = handle.await {
                warn!(error = %err, "sweeper task ended abnormally");
            }
        }

        for run in inner.registry.list_active() {
            inner.delete(&run.run_id, "shutdown").await;
        }

        if let Some(pool) = &inner.pool {
            if inner.pool_started.swap(false, Ordering::SeqCst) {
                if let Err(err) = inner.remote(pool.shutdown()).await {
                    inner
                        .journal
                        .warn(format!("Warm pool shutdown failed: {}", err));
                }
            }
        }
        inner.metrics.flush();
        inner.journal.info("Broker shut down");
    }
}
