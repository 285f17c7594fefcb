//! Crash detection follow-up: queueing and claiming of orphaned shard items.
//!
//! When a `running` marker disappears without a matching `completed` marker,
//! the listener manager queues the item here. A live instance then claims
//! exactly one queued item at a time under the failover latch, publishes
//! itself as the item's failover owner, and triggers an immediate local run
//! of that single item out of cycle. Failover items take priority over the
//! claimer's normally-sharded items, and the original owner's duplicate is
//! suppressed until the owner marker is cleared on completion.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::ConfigService;
use crate::error::Result;
use crate::execution::ExecutionService;
use crate::instance::ServerService;
use crate::node_path::JobNodePath;
use crate::registry::RegistryClient;
use crate::sharding::ShardingService;

pub struct FailoverService {
    registry: Arc<dyn RegistryClient>,
    paths: Arc<JobNodePath>,
    config: Arc<ConfigService>,
    server: Arc<ServerService>,
    sharding: Arc<ShardingService>,
    execution: Arc<ExecutionService>,
    instance_id: String,
    /// Immediate-run hook: claimed items are pushed here for the local
    /// execution driver to run out of cycle.
    trigger_tx: mpsc::Sender<usize>,
}

impl FailoverService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        paths: Arc<JobNodePath>,
        config: Arc<ConfigService>,
        server: Arc<ServerService>,
        sharding: Arc<ShardingService>,
        execution: Arc<ExecutionService>,
        instance_id: String,
        trigger_tx: mpsc::Sender<usize>,
    ) -> Self {
        Self {
            registry,
            paths,
            config,
            server,
            sharding,
            execution,
            instance_id,
            trigger_tx,
        }
    }

    /// Queue a crashed item for failover. Idempotent: repeated notifications
    /// for the same item, or an item that already has a failover owner, add
    /// nothing.
    pub async fn set_crashed_failover_flag(&self, item: usize) -> Result<()> {
        if !self.config.load(true).await?.failover {
            return Ok(());
        }
        if self
            .registry
            .is_existed(&self.paths.item_failover(item))
            .await?
            || self
                .registry
                .is_existed(&self.paths.failover_queue_item(item))
                .await?
        {
            return Ok(());
        }
        self.registry
            .persist(&self.paths.failover_queue_item(item), "")
            .await?;
        tracing::info!(job = %self.paths.job_name(), item, "Item queued for failover");
        Ok(())
    }

    pub async fn needs_failover(&self) -> Result<bool> {
        Ok(self
            .registry
            .get_num_children(&self.paths.failover_items_root())
            .await?
            > 0)
    }

    /// Claim one queued item, lowest item id first, and trigger its
    /// immediate local execution.
    ///
    /// The claim is skipped while this instance is unavailable or still has
    /// running items of its own, so failover never steals capacity
    /// mid-execution. The queue re-check, owner publication and dequeue all
    /// happen under the failover latch.
    pub async fn failover_if_necessary(&self) -> Result<()> {
        if !self.config.load(true).await?.failover || !self.needs_failover().await? {
            return Ok(());
        }
        if !self.server.is_local_available().await? {
            return Ok(());
        }
        let local_items = self.sharding.get_local_items().await?;
        if self.execution.has_running_items_in(&local_items).await? {
            tracing::debug!(
                job = %self.paths.job_name(),
                "Local items still running, failover claim deferred"
            );
            return Ok(());
        }

        let claimed = {
            let _latch = self
                .registry
                .acquire_latch(&self.paths.failover_latch())
                .await?;
            let mut queued: Vec<usize> = self
                .registry
                .get_children_keys(&self.paths.failover_items_root())
                .await?
                .into_iter()
                .filter_map(|c| c.parse().ok())
                .collect();
            queued.sort_unstable();
            match queued.first() {
                Some(&item) => {
                    self.registry
                        .persist_ephemeral(&self.paths.item_failover(item), &self.instance_id)
                        .await?;
                    self.registry
                        .remove(&self.paths.failover_queue_item(item))
                        .await?;
                    Some(item)
                }
                None => None,
            }
        };

        if let Some(item) = claimed {
            tracing::info!(
                job = %self.paths.job_name(),
                item,
                instance = %self.instance_id,
                "Failover item claimed"
            );
            if let Err(e) = self.trigger_tx.try_send(item) {
                tracing::warn!(
                    job = %self.paths.job_name(),
                    item,
                    error = %e,
                    "Immediate-run hook not consumed"
                );
            }
        }
        Ok(())
    }

    /// Clear failover ownership after the items completed normally.
    pub async fn update_failover_complete(&self, items: &[usize]) -> Result<()> {
        for &item in items {
            self.registry.remove(&self.paths.item_failover(item)).await?;
        }
        Ok(())
    }

    /// Items this instance is executing as failover owner.
    pub async fn get_local_failover_items(&self) -> Result<Vec<usize>> {
        let total = self.config.load(false).await?.sharding_total_count;
        let mut items = Vec::new();
        for item in 0..total {
            if self
                .registry
                .get(&self.paths.item_failover(item))
                .await?
                .as_deref()
                == Some(self.instance_id.as_str())
            {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// This instance's normally-sharded items that currently have a failover
    /// owner elsewhere; their normal run is suppressed for the cycle.
    pub async fn get_local_take_off_items(&self) -> Result<Vec<usize>> {
        let mut taken = Vec::new();
        for item in self.sharding.get_local_items().await? {
            if self
                .registry
                .is_existed(&self.paths.item_failover(item))
                .await?
            {
                taken.push(item);
            }
        }
        Ok(taken)
    }

    /// Drop every queued and owned failover record. Used when failover is
    /// disabled through configuration, so stale records cannot trigger runs
    /// after re-enabling.
    pub async fn remove_failover_info(&self) -> Result<()> {
        self.registry
            .remove(&self.paths.failover_items_root())
            .await?;
        let total = self.config.load(false).await?.sharding_total_count;
        for item in 0..total {
            self.registry.remove(&self.paths.item_failover(item)).await?;
        }
        tracing::debug!(job = %self.paths.job_name(), "Failover records cleared");
        Ok(())
    }
}
