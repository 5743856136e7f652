//! SBX-Broker-Core: admission-controlled sandbox lifecycle orchestration
//!
//! A broker between callers that want short-lived sandboxes and a remote
//! provisioning backend with finite capacity.
//!
//! ## Key Components
//!
//! - `AdmissionLimiter`: synchronous hourly, global and per-category quotas
//! - `RunRegistry`: live runs, their event channels, deleted-run history
//! - `Broker`: launch, provisioning task (warm pool with cold fallback,
//!   archive restore with clone fallback), deletion, status
//! - `Subscription`: replay-then-live event stream with keepalives
//! - Expiry sweeper: periodic teardown of runs past their lifetime
//! - `IngressRelay`: forwards traffic to a ready run without exposing the
//!   sandbox's credentialed address
//!
//! ## Example
//!
//! ```ignore
//! let backend = Arc::new(MemoryBackend::new());
//! let broker = Broker::builder(BrokerConfig::default().without_delays(), backend).build()?;
//! broker.start().await?;
//! let mut launched = broker.launch(Category::Cold, "snake", DeployMode::Clone).await?;
//! while let Some(item) = launched.events.next().await { /* ... */ }
//! ```

pub mod channel;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod journal;
pub mod limiter;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod registry;
pub mod relay;
mod sweeper;
pub mod telemetry;

pub use channel::{EventChannel, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ArchiveSettings, BrokerConfig, ConfigError, LifetimeConfig, LimitsConfig, RetryConfig,
    StepTimeouts, WorkloadSpec,
};
pub use domain::{
    Category, DeletedSummary, DeployMode, Run, RunEvent, RunId, RunInfo, RunStatus, StreamItem,
};
pub use error::{BrokerError, BrokerResult, Rejection};
pub use journal::{Journal, JournalEntry, JournalLevel};
pub use limiter::{AdmissionLimiter, AdmissionTicket, LimiterStatus};
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use orchestrator::{
    Broker, BrokerBuilder, BrokerStatus, Launched, LimitsStatus, PoolStatus, RateStatus,
};
pub use registry::{RunRegistry, RunSlot};
pub use relay::{IngressRelay, RelayError, RelayResponse};
pub use telemetry::{init_tracing, LogFormat};
