//! Broker configuration.
//!
//! One validated [`BrokerConfig`] is built at startup (defaults, environment
//! or JSON) and shared read-only by every component. Pool tunables live in
//! exactly one place: [`BrokerConfig::pool`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use provision_backend::{PoolSettings, SpacesConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::Category;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("environment variable {var} has invalid value '{value}'")]
    Env { var: String, value: String },

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Concurrency and rate quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Active runs across all categories.
    pub max_total_active: usize,
    /// Accepted launches per wall-clock hour.
    pub max_runs_per_hour: u32,
    /// Cap group name -> concurrent runs allowed per category in the group.
    pub cap_groups: BTreeMap<String, usize>,
    /// Which cap group each category draws its cap from.
    pub category_groups: BTreeMap<Category, String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let cap_groups = BTreeMap::from([("cold".to_string(), 2), ("warm".to_string(), 2)]);
        let category_groups = BTreeMap::from([
            (Category::Cold, "cold".to_string()),
            (Category::Warm, "warm".to_string()),
            (Category::Snapshot, "warm".to_string()),
        ]);
        LimitsConfig {
            max_total_active: 6,
            max_runs_per_hour: 10,
            cap_groups,
            category_groups,
        }
    }
}

impl LimitsConfig {
    /// Cap that applies to `category`; zero when unmapped.
    pub fn cap_for(&self, category: Category) -> usize {
        self.category_groups
            .get(&category)
            .and_then(|group| self.cap_groups.get(group))
            .copied()
            .unwrap_or(0)
    }

    pub fn with_group_cap(mut self, group: &str, cap: usize) -> Self {
        self.cap_groups.insert(group.to_string(), cap);
        self
    }

    pub fn with_category_group(mut self, category: Category, group: &str) -> Self {
        self.category_groups.insert(category, group.to_string());
        self
    }
}

/// Lifetime granted to a ready run, in whole minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifetimeConfig {
    pub min_minutes: u32,
    pub max_minutes: u32,
}

impl Default for LifetimeConfig {
    fn default() -> Self {
        LifetimeConfig {
            min_minutes: 3,
            max_minutes: 6,
        }
    }
}

/// Retry policy for commands against freshly created sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 5,
            delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Per-step timeouts handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTimeouts {
    pub create_secs: u64,
    pub download_secs: u64,
    pub extract_secs: u64,
    pub install_secs: u64,
    pub clone_secs: u64,
    pub move_secs: u64,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        StepTimeouts {
            create_secs: 120,
            download_secs: 60,
            extract_secs: 30,
            install_secs: 120,
            clone_secs: 60,
            move_secs: 30,
        }
    }
}

impl StepTimeouts {
    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create_secs)
    }
    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }
    pub fn extract(&self) -> Duration {
        Duration::from_secs(self.extract_secs)
    }
    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }
    pub fn clone_repo(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }
    pub fn move_files(&self) -> Duration {
        Duration::from_secs(self.move_secs)
    }
}

/// Where prebuilt archives live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSettings {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
}

impl ArchiveSettings {
    pub fn spaces(&self) -> SpacesConfig {
        SpacesConfig::new(&self.bucket, &self.region).with_prefix(&self.prefix)
    }
}

/// One launchable workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Sandbox image the workload needs.
    pub image: String,
    /// Directory of the workload, relative to the repository root and the
    /// workspace.
    pub path: String,
    /// Dependency install command, run inside the workload directory.
    pub install: String,
    /// Entry command, run detached inside the workload directory.
    pub run: String,
    /// Prebuilt archive in the archive store.
    pub archive_id: String,
}

impl WorkloadSpec {
    pub fn python(path: &str, archive_id: &str, port: u16) -> Self {
        WorkloadSpec {
            image: "python".to_string(),
            path: path.to_string(),
            install: "pip install -r requirements.txt".to_string(),
            run: format!(
                "sed -i 's/port=8080/port={}/' app.py && python app.py",
                port
            ),
            archive_id: archive_id.to_string(),
        }
    }
}

fn default_workloads(port: u16) -> BTreeMap<String, WorkloadSpec> {
    BTreeMap::from([
        ("snake".to_string(), WorkloadSpec::python("snake", "snake-python", port)),
        (
            "tic-tac-toe".to_string(),
            WorkloadSpec::python("tic-tac-toe-python", "tictactoe-python", port),
        ),
        ("memory".to_string(), WorkloadSpec::python("memory", "memory-python", port)),
    ])
}

/// Complete broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub limits: LimitsConfig,
    pub lifetime: LifetimeConfig,
    pub sweep_interval_secs: u64,
    pub retry: RetryConfig,
    /// Pause after acquisition before the first command, for DNS to settle.
    pub propagation_delay_secs: u64,
    pub timeouts: StepTimeouts,
    /// Idle time after which a subscriber receives a keepalive.
    pub keepalive_secs: u64,
    pub history_capacity: usize,
    pub journal_capacity: usize,
    /// Concurrent calls allowed into the backend.
    pub backend_workers: usize,
    /// Warm pool; `None` disables pool acquisition entirely.
    pub pool: Option<PoolSettings>,
    /// Archive store; `None` sends every restore down the clone path.
    pub archives: Option<ArchiveSettings>,
    pub source_repo: String,
    /// Prefix of relayed ingress addresses handed to callers.
    pub ingress_prefix: String,
    pub workload_port: u16,
    pub workspace_dir: String,
    pub workloads: BTreeMap<String, WorkloadSpec>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let workload_port = 5000;
        BrokerConfig {
            limits: LimitsConfig::default(),
            lifetime: LifetimeConfig::default(),
            sweep_interval_secs: 30,
            retry: RetryConfig::default(),
            propagation_delay_secs: 15,
            timeouts: StepTimeouts::default(),
            keepalive_secs: 30,
            history_capacity: 20,
            journal_capacity: 100,
            backend_workers: 4,
            pool: None,
            archives: None,
            source_repo: "https://github.com/bikramkgupta/do-sandbox-games.git".to_string(),
            ingress_prefix: "/api/game".to_string(),
            workload_port,
            workspace_dir: "/workspace".to_string(),
            workloads: default_workloads(workload_port),
        }
    }
}

fn env_or<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            })
        }
        _ => Ok(default),
    }
}

impl BrokerConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = BrokerConfig::default();

        let cold = env_or("MAX_CONCURRENT_COLD", 2usize)?;
        let warm = env_or("MAX_CONCURRENT_WARM", 2usize)?;
        config.limits = config
            .limits
            .with_group_cap("cold", cold)
            .with_group_cap("warm", warm);
        config.limits.max_total_active = env_or("MAX_TOTAL_ACTIVE", 6usize)?;
        config.limits.max_runs_per_hour = env_or("MAX_RUNS_PER_HOUR", 10u32)?;

        config.lifetime.min_minutes = env_or("SANDBOX_MIN_LIFETIME_MINUTES", 3u32)?;
        config.lifetime.max_minutes = env_or("SANDBOX_MAX_LIFETIME_MINUTES", 6u32)?;
        config.sweep_interval_secs = env_or("CLEANUP_INTERVAL_SECONDS", 30u64)?;
        config.propagation_delay_secs = env_or("DNS_PROPAGATION_DELAY", 15u64)?;
        config.backend_workers = env_or("BACKEND_WORKERS", 4usize)?;

        if env_or("WARM_POOL_ENABLED", false)? {
            let target_ready = env_or("WARM_POOL_TARGET_READY", 2u32)?;
            config.pool = Some(PoolSettings {
                target_ready,
                max_ready: env_or("WARM_POOL_MAX_READY", target_ready + 1)?,
                idle_timeout_secs: env_or("WARM_POOL_IDLE_TIMEOUT", 600u64)?,
                max_concurrent_creates: env_or("WARM_POOL_MAX_CONCURRENT_CREATES", 1u32)?,
                max_total: env_or("WARM_POOL_MAX_TOTAL", target_ready + 3)?,
                warm_up_at_start: env_or("WARM_POOL_WARM_UP", false)?,
                ..PoolSettings::default()
            });
        }

        if let Some(spaces) = SpacesConfig::from_env() {
            config.archives = Some(ArchiveSettings {
                bucket: spaces.bucket,
                region: spaces.region,
                prefix: spaces.prefix,
            });
        }

        if let Ok(repo) = std::env::var("SOURCE_REPO_URL") {
            if !repo.trim().is_empty() {
                config.source_repo = repo.trim().to_string();
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Zero the propagation and retry delays (simulation and tests).
    pub fn without_delays(mut self) -> Self {
        self.propagation_delay_secs = 0;
        self.retry.delay_ms = 0;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn propagation_delay(&self) -> Duration {
        Duration::from_secs(self.propagation_delay_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn workload(&self, name: &str) -> Option<&WorkloadSpec> {
        self.workloads.get(name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.limits.max_total_active == 0 {
            return invalid("limits.max_total_active must be greater than zero".into());
        }
        if self.limits.max_runs_per_hour == 0 {
            return invalid("limits.max_runs_per_hour must be greater than zero".into());
        }
        for category in Category::ALL {
            let Some(group) = self.limits.category_groups.get(&category) else {
                return invalid(format!("category '{}' has no cap group", category));
            };
            match self.limits.cap_groups.get(group) {
                None => {
                    return invalid(format!(
                        "category '{}' maps to unknown cap group '{}'",
                        category, group
                    ))
                }
                Some(0) => return invalid(format!("cap group '{}' must be greater than zero", group)),
                Some(cap) if *cap > self.limits.max_total_active => warn!(
                    category = %category,
                    cap = cap,
                    max_total = self.limits.max_total_active,
                    "category cap exceeds global cap; global cap wins"
                ),
                Some(_) => {}
            }
        }
        if self.lifetime.min_minutes == 0 || self.lifetime.min_minutes > self.lifetime.max_minutes {
            return invalid(format!(
                "lifetime range {}-{} minutes is invalid",
                self.lifetime.min_minutes, self.lifetime.max_minutes
            ));
        }
        if self.sweep_interval_secs == 0 {
            return invalid("sweep_interval_secs must be greater than zero".into());
        }
        if self.keepalive_secs == 0 {
            return invalid("keepalive_secs must be greater than zero".into());
        }
        if self.retry.attempts == 0 {
            return invalid("retry.attempts must be at least 1".into());
        }
        if self.backend_workers == 0 {
            return invalid("backend_workers must be greater than zero".into());
        }
        if self.history_capacity == 0 || self.journal_capacity == 0 {
            return invalid("history and journal capacities must be greater than zero".into());
        }
        if self.workloads.is_empty() {
            return invalid("workload catalog is empty".into());
        }
        if let Some(pool) = &self.pool {
            if pool.images.is_empty() {
                return invalid("pool.images must name at least one image".into());
            }
            if pool.max_ready < pool.target_ready {
                return invalid(format!(
                    "pool.max_ready ({}) is below pool.target_ready ({})",
                    pool.max_ready, pool.target_ready
                ));
            }
            if pool.max_total < pool.max_ready {
                return invalid(format!(
                    "pool.max_total ({}) is below pool.max_ready ({})",
                    pool.max_total, pool.max_ready
                ));
            }
            if pool.max_concurrent_creates == 0 {
                return invalid("pool.max_concurrent_creates must be greater than zero".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = BrokerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.limits.cap_for(Category::Cold), 2);
        assert_eq!(cfg.limits.cap_for(Category::Snapshot), 2);
        assert_eq!(cfg.workloads.len(), 3);
        assert!(cfg.workload("snake").unwrap().run.contains("port=5000"));
    }

    #[test]
    fn test_snapshot_follows_its_cap_group() {
        let limits = LimitsConfig::default().with_group_cap("warm", 4);
        assert_eq!(limits.cap_for(Category::Snapshot), 4);

        let limits = limits
            .with_group_cap("snapshot", 1)
            .with_category_group(Category::Snapshot, "snapshot");
        assert_eq!(limits.cap_for(Category::Snapshot), 1);
        assert_eq!(limits.cap_for(Category::Warm), 4);
    }

    #[test]
    fn test_unknown_cap_group_rejected() {
        let mut cfg = BrokerConfig::default();
        cfg.limits = cfg.limits.with_category_group(Category::Cold, "missing");
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown cap group"));
    }

    #[test]
    fn test_inverted_lifetime_rejected() {
        let mut cfg = BrokerConfig::default();
        cfg.lifetime = LifetimeConfig {
            min_minutes: 8,
            max_minutes: 4,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pool_bounds_validated() {
        let mut cfg = BrokerConfig::default();
        cfg.pool = Some(PoolSettings {
            target_ready: 4,
            max_ready: 2,
            ..PoolSettings::default()
        });
        assert!(cfg.validate().unwrap_err().to_string().contains("max_ready"));

        cfg.pool = Some(PoolSettings {
            max_total: 1,
            ..PoolSettings::default()
        });
        assert!(cfg.validate().unwrap_err().to_string().contains("max_total"));
    }

    #[test]
    fn test_zero_retry_attempts_rejected() {
        let mut cfg = BrokerConfig::default();
        cfg.retry.attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_without_delays() {
        let cfg = BrokerConfig::default().without_delays();
        assert_eq!(cfg.propagation_delay(), Duration::ZERO);
        assert_eq!(cfg.retry.delay(), Duration::ZERO);
        assert_eq!(cfg.retry.attempts, 5);
    }

    #[test]
    fn test_json_roundtrip_keeps_category_map() {
        let cfg = BrokerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"snapshot\":\"warm\""));
        let back = BrokerConfig::from_json(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
