//! Barrier primitive over per-item start/complete markers.
//!
//! Each instance registers the milestones of its own items; once the marker
//! count matches the configured item count, one instance fires the cycle
//! callback. The check-and-clear runs under a registry latch and re-verifies
//! the condition after acquisition, so racing instances fire the callback
//! exactly once per cycle.

use std::sync::Arc;

use crate::config::ConfigService;
use crate::error::Result;
use crate::node_path::JobNodePath;
use crate::registry::RegistryClient;

pub struct GuaranteeService {
    registry: Arc<dyn RegistryClient>,
    paths: Arc<JobNodePath>,
    config: Arc<ConfigService>,
}

impl GuaranteeService {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        paths: Arc<JobNodePath>,
        config: Arc<ConfigService>,
    ) -> Self {
        Self {
            registry,
            paths,
            config,
        }
    }

    pub async fn register_start(&self, items: &[usize]) -> Result<()> {
        for &item in items {
            self.registry
                .persist(&self.paths.guarantee_started(item), "")
                .await?;
        }
        Ok(())
    }

    pub async fn register_complete(&self, items: &[usize]) -> Result<()> {
        for &item in items {
            self.registry
                .persist(&self.paths.guarantee_completed(item), "")
                .await?;
        }
        Ok(())
    }

    /// Whether every item across all instances has registered its start.
    /// Streaming jobs have no discrete cycle start and are excluded.
    pub async fn is_all_started(&self) -> Result<bool> {
        let config = self.config.load(true).await?;
        if config.streaming_process {
            return Ok(false);
        }
        let started = self
            .registry
            .get_num_children(&self.paths.guarantee_started_root())
            .await?;
        Ok(config.sharding_total_count > 0 && started == config.sharding_total_count)
    }

    /// Whether every item across all instances has registered completion.
    pub async fn is_all_completed(&self) -> Result<bool> {
        let config = self.config.load(true).await?;
        let completed = self
            .registry
            .get_num_children(&self.paths.guarantee_completed_root())
            .await?;
        Ok(config.sharding_total_count > 0 && completed == config.sharding_total_count)
    }

    /// Fire `callback` once all items started this cycle. The condition is
    /// re-verified under the latch because it can change between the
    /// triggering event and dispatch; the markers are cleared before the
    /// latch is released so only one racing instance fires. Returns whether
    /// the callback ran.
    pub async fn fire_when_all_started<F>(&self, callback: F) -> Result<bool>
    where
        F: FnOnce(),
    {
        if !self.is_all_started().await? {
            return Ok(false);
        }
        let _latch = self
            .registry
            .acquire_latch(&self.paths.guarantee_started_latch())
            .await?;
        if !self.is_all_started().await? {
            return Ok(false);
        }
        callback();
        self.clear_all_started_info().await?;
        tracing::debug!(job = %self.paths.job_name(), "All-started barrier fired");
        Ok(true)
    }

    /// Fire `callback` once all items completed this cycle. Same latch
    /// discipline as [`Self::fire_when_all_started`].
    pub async fn fire_when_all_completed<F>(&self, callback: F) -> Result<bool>
    where
        F: FnOnce(),
    {
        if !self.is_all_completed().await? {
            return Ok(false);
        }
        let _latch = self
            .registry
            .acquire_latch(&self.paths.guarantee_completed_latch())
            .await?;
        if !self.is_all_completed().await? {
            return Ok(false);
        }
        callback();
        self.clear_all_completed_info().await?;
        tracing::debug!(job = %self.paths.job_name(), "All-completed barrier fired");
        Ok(true)
    }

    pub async fn clear_all_started_info(&self) -> Result<()> {
        self.registry
            .remove(&self.paths.guarantee_started_root())
            .await
    }

    pub async fn clear_all_completed_info(&self) -> Result<()> {
        self.registry
            .remove(&self.paths.guarantee_completed_root())
            .await
    }
}
