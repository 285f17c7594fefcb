use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, ShardliteError};
use crate::node_path::JobNodePath;
use crate::registry::RegistryClient;
use crate::sharding::ShardingStrategyKind;

/// Configuration for one sharded job.
///
/// The configuration document is persisted as JSON at the job's `config`
/// registry node so that every instance of the job reads the same effective
/// settings. Instances started with `overwrite = false` adopt whatever is
/// already published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name, used as the registry namespace for all coordination state.
    pub job_name: String,

    /// Total number of shard items. Every item in `[0, sharding_total_count)`
    /// is assigned to exactly one live instance after a resharding pass.
    pub sharding_total_count: usize,

    /// Track per-item running/completed markers. When disabled, crash
    /// detection and failover are unavailable by design.
    #[serde(default = "default_true")]
    pub monitor_execution: bool,

    /// Reassign items of crashed instances to live ones.
    #[serde(default)]
    pub failover: bool,

    /// Record missed runs when a trigger fires while the previous run of the
    /// same items is still executing, so they can be re-run afterwards.
    #[serde(default = "default_true")]
    pub misfire: bool,

    /// Streaming jobs have no discrete completion point and are excluded
    /// from the "all started" barrier.
    #[serde(default)]
    pub streaming_process: bool,

    /// Strategy used to divide shard items among live instances.
    #[serde(default)]
    pub sharding_strategy: ShardingStrategyKind,

    /// Opaque parameter handed to the job body on each run.
    #[serde(default)]
    pub job_parameter: String,

    /// Optional per-item parameters (e.g. `0 -> "Beijing"`).
    #[serde(default)]
    pub shard_item_parameters: HashMap<usize, String>,

    /// Replace an already-published configuration document on startup.
    #[serde(default)]
    pub overwrite: bool,
}

fn default_true() -> bool {
    true
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>, sharding_total_count: usize) -> Self {
        Self {
            job_name: job_name.into(),
            sharding_total_count,
            monitor_execution: true,
            failover: false,
            misfire: true,
            streaming_process: false,
            sharding_strategy: ShardingStrategyKind::default(),
            job_parameter: String::new(),
            shard_item_parameters: HashMap::new(),
            overwrite: false,
        }
    }

    pub fn with_monitor_execution(mut self, enabled: bool) -> Self {
        self.monitor_execution = enabled;
        self
    }

    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    pub fn with_misfire(mut self, enabled: bool) -> Self {
        self.misfire = enabled;
        self
    }

    pub fn with_streaming_process(mut self, enabled: bool) -> Self {
        self.streaming_process = enabled;
        self
    }

    pub fn with_sharding_strategy(mut self, strategy: ShardingStrategyKind) -> Self {
        self.sharding_strategy = strategy;
        self
    }

    pub fn with_job_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.job_parameter = parameter.into();
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Validate the configuration. Invalid settings are fatal at load time;
    /// no coordination state is written for a job that fails validation.
    pub fn validate(&self) -> Result<()> {
        if self.job_name.is_empty() {
            return Err(ShardliteError::InvalidConfig(
                "job_name must not be empty".to_string(),
            ));
        }
        if self.sharding_total_count == 0 {
            return Err(ShardliteError::InvalidConfig(format!(
                "sharding_total_count must be positive for job '{}'",
                self.job_name
            )));
        }
        if self
            .shard_item_parameters
            .keys()
            .any(|&item| item >= self.sharding_total_count)
        {
            return Err(ShardliteError::InvalidConfig(format!(
                "shard_item_parameters reference items outside [0, {})",
                self.sharding_total_count
            )));
        }
        Ok(())
    }
}

/// Publishes and fetches the job configuration document.
///
/// Reads that gate decisions affecting other instances bypass the local
/// cache (`fresh = true`); per-run lookups on the hot path use the cached
/// snapshot refreshed by the config listener.
pub struct ConfigService {
    registry: Arc<dyn RegistryClient>,
    paths: Arc<JobNodePath>,
    cache: RwLock<Option<JobConfig>>,
}

impl ConfigService {
    pub fn new(registry: Arc<dyn RegistryClient>, paths: Arc<JobNodePath>) -> Self {
        Self {
            registry,
            paths,
            cache: RwLock::new(None),
        }
    }

    /// Publish the configuration document if absent, or unconditionally when
    /// `overwrite` is set.
    pub async fn persist(&self, config: &JobConfig) -> Result<()> {
        config.validate()?;
        let path = self.paths.config();
        if config.overwrite || !self.registry.is_existed(&path).await? {
            self.registry
                .persist(&path, &serde_json::to_string(config)?)
                .await?;
            tracing::info!(job = %config.job_name, "Job configuration published");
        }
        *self.cache.write().await = Some(self.load_remote().await?);
        Ok(())
    }

    /// Load the effective configuration. `fresh` forces a registry read,
    /// bypassing the locally cached snapshot.
    pub async fn load(&self, fresh: bool) -> Result<JobConfig> {
        if !fresh {
            if let Some(cached) = self.cache.read().await.clone() {
                return Ok(cached);
            }
        }
        let config = self.load_remote().await?;
        *self.cache.write().await = Some(config.clone());
        Ok(config)
    }

    /// Current cached snapshot, if any.
    pub async fn cached(&self) -> Option<JobConfig> {
        self.cache.read().await.clone()
    }

    /// Replace the cached snapshot. Called by the config listener when the
    /// published document changes.
    pub async fn update_cache(&self, config: JobConfig) {
        *self.cache.write().await = Some(config);
    }

    async fn load_remote(&self) -> Result<JobConfig> {
        let raw = self
            .registry
            .get_directly(&self.paths.config())
            .await?
            .ok_or_else(|| {
                ShardliteError::InvalidConfig(format!(
                    "no configuration published for job '{}'",
                    self.paths.job_name()
                ))
            })?;
        let config: JobConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_config_defaults() {
        let cfg = JobConfig::new("order-sync", 10);
        assert_eq!(cfg.job_name, "order-sync");
        assert_eq!(cfg.sharding_total_count, 10);
        assert!(cfg.monitor_execution);
        assert!(!cfg.failover);
        assert!(cfg.misfire);
        assert!(!cfg.streaming_process);
        assert!(!cfg.overwrite);
    }

    #[test]
    fn job_config_builders() {
        let cfg = JobConfig::new("order-sync", 3)
            .with_failover(true)
            .with_misfire(false)
            .with_streaming_process(true)
            .with_job_parameter("region=eu")
            .with_overwrite(true);
        assert!(cfg.failover);
        assert!(!cfg.misfire);
        assert!(cfg.streaming_process);
        assert_eq!(cfg.job_parameter, "region=eu");
        assert!(cfg.overwrite);
    }

    #[test]
    fn validate_rejects_empty_job_name() {
        let cfg = JobConfig::new("", 10);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_shard_count() {
        let cfg = JobConfig::new("order-sync", 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_item_parameters() {
        let mut cfg = JobConfig::new("order-sync", 2);
        cfg.shard_item_parameters.insert(5, "x".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut cfg = JobConfig::new("order-sync", 4).with_failover(true);
        cfg.shard_item_parameters.insert(0, "Beijing".to_string());
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: JobConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let parsed: JobConfig =
            serde_json::from_str(r#"{"job_name":"j","sharding_total_count":2}"#).unwrap();
        assert!(parsed.monitor_execution);
        assert!(parsed.misfire);
        assert!(!parsed.failover);
    }
}
