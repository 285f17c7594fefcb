//! Per-item execution tracking.
//!
//! Each shard item carries three independent markers:
//!
//! - `running` - ephemeral; exists iff the owning instance is actively
//!   executing the item this cycle. Its disappearance without a matching
//!   `completed` marker is the crash signal consumed by failover.
//! - `completed` - persistent until the leader's per-cycle cleanup.
//! - `misfire` - persistent flag recording a trigger that fired while the
//!   previous run was still in progress.
//!
//! The whole service is a no-op when `monitor_execution` is disabled, which
//! also disables crash detection and failover by design.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::config::ConfigService;
use crate::election::LeaderService;
use crate::error::Result;
use crate::node_path::JobNodePath;
use crate::registry::RegistryClient;

const CLEANING_WAIT_BASE_MS: u64 = 50;
const CLEANING_WAIT_MAX_ATTEMPTS: u32 = 100;

pub struct ExecutionService {
    registry: Arc<dyn RegistryClient>,
    paths: Arc<JobNodePath>,
    config: Arc<ConfigService>,
    leader: Arc<LeaderService>,
}

impl ExecutionService {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        paths: Arc<JobNodePath>,
        config: Arc<ConfigService>,
        leader: Arc<LeaderService>,
    ) -> Self {
        Self {
            registry,
            paths,
            config,
            leader,
        }
    }

    /// Mark the given items as running for this cycle. The marker value is
    /// the begin timestamp.
    pub async fn register_begin(&self, items: &[usize]) -> Result<()> {
        if !self.config.load(false).await?.monitor_execution {
            return Ok(());
        }
        let begin = Utc::now().to_rfc3339();
        for &item in items {
            self.registry
                .persist_ephemeral(&self.paths.item_running(item), &begin)
                .await?;
        }
        tracing::debug!(job = %self.paths.job_name(), ?items, "Execution started");
        Ok(())
    }

    /// Mark the given items completed and drop their running markers.
    /// Within one instance this always happens after [`Self::register_begin`]
    /// for the same cycle.
    pub async fn register_completed(&self, items: &[usize]) -> Result<()> {
        if !self.config.load(false).await?.monitor_execution {
            return Ok(());
        }
        let completed = Utc::now().to_rfc3339();
        for &item in items {
            self.registry
                .persist(&self.paths.item_completed(item), &completed)
                .await?;
            self.registry.remove(&self.paths.item_running(item)).await?;
        }
        tracing::debug!(job = %self.paths.job_name(), ?items, "Execution completed");
        Ok(())
    }

    /// Whether any of the given items carries a running marker.
    pub async fn has_running_items_in(&self, items: &[usize]) -> Result<bool> {
        if !self.config.load(false).await?.monitor_execution {
            return Ok(false);
        }
        for &item in items {
            if self
                .registry
                .is_existed(&self.paths.item_running(item))
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether any item of the job carries a running marker. Gates
    /// resharding.
    pub async fn has_running_items(&self) -> Result<bool> {
        let total = self.config.load(false).await?.sharding_total_count;
        let all: Vec<usize> = (0..total).collect();
        self.has_running_items_in(&all).await
    }

    /// Record a misfire for the given items when any of them is still
    /// running. Returns whether a misfire was recorded.
    pub async fn misfire_if_necessary(&self, items: &[usize]) -> Result<bool> {
        if !self.has_running_items_in(items).await? {
            return Ok(false);
        }
        for &item in items {
            self.registry
                .persist(&self.paths.item_misfire(item), "")
                .await?;
        }
        tracing::debug!(job = %self.paths.job_name(), ?items, "Misfire recorded");
        Ok(true)
    }

    pub async fn get_misfired_items(&self, items: &[usize]) -> Result<Vec<usize>> {
        let mut misfired = Vec::new();
        for &item in items {
            if self
                .registry
                .is_existed(&self.paths.item_misfire(item))
                .await?
            {
                misfired.push(item);
            }
        }
        Ok(misfired)
    }

    pub async fn clear_misfire(&self, items: &[usize]) -> Result<()> {
        for &item in items {
            self.registry.remove(&self.paths.item_misfire(item)).await?;
        }
        Ok(())
    }

    /// Once-per-cycle cleanup. The leader removes the previous cycle's
    /// completed markers under the `cleaning` flag and prunes per-item
    /// subtrees beyond the configured item count; everyone else short-polls
    /// until the flag clears so no instance reads a half-migrated item set.
    pub async fn clean_previous_execution_info(&self) -> Result<()> {
        if !self.config.load(false).await?.monitor_execution {
            return Ok(());
        }
        if self.leader.is_leader().await? {
            self.registry
                .persist_ephemeral(&self.paths.execution_cleaning(), "")
                .await?;
            let total = self.config.load(true).await?.sharding_total_count;
            for child in self
                .registry
                .get_children_keys(&self.paths.sharding_root())
                .await?
            {
                let Ok(item) = child.parse::<usize>() else {
                    continue;
                };
                if item >= total {
                    self.registry.remove(&self.paths.item_root(item)).await?;
                } else {
                    self.registry
                        .remove(&self.paths.item_completed(item))
                        .await?;
                }
            }
            self.registry
                .remove(&self.paths.execution_cleaning())
                .await?;
            tracing::debug!(job = %self.paths.job_name(), "Previous execution info cleaned");
            return Ok(());
        }

        let mut attempts = 0u32;
        while self
            .registry
            .is_existed(&self.paths.execution_cleaning())
            .await?
        {
            if attempts >= CLEANING_WAIT_MAX_ATTEMPTS {
                tracing::warn!(
                    job = %self.paths.job_name(),
                    "Gave up waiting for execution cleanup to finish"
                );
                return Ok(());
            }
            attempts += 1;
            let jitter = rand::thread_rng().gen_range(0..CLEANING_WAIT_BASE_MS);
            tokio::time::sleep(Duration::from_millis(CLEANING_WAIT_BASE_MS + jitter)).await;
        }
        Ok(())
    }
}
