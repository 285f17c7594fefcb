//! Computes and publishes the item-to-instance assignment.
//!
//! Only this service mutates assignment state, and only while holding
//! leadership. Non-leader instances observing a pending resharding wait for
//! the leader to finish rather than assigning anything themselves.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::config::ConfigService;
use crate::election::LeaderService;
use crate::error::Result;
use crate::execution::ExecutionService;
use crate::instance::ServerService;
use crate::node_path::JobNodePath;
use crate::registry::{RegistryClient, TxOp};

/// Base delay of the bounded spin-waits on the resharding flags.
const WAIT_BASE_MS: u64 = 50;
/// Attempt cap for the bounded spin-waits; exhausting it is logged and
/// recovered on the next cycle, never surfaced as an error.
const WAIT_MAX_ATTEMPTS: u32 = 100;

pub struct ShardingService {
    registry: Arc<dyn RegistryClient>,
    paths: Arc<JobNodePath>,
    config: Arc<ConfigService>,
    server: Arc<ServerService>,
    leader: Arc<LeaderService>,
    execution: Arc<ExecutionService>,
    instance_id: String,
}

impl ShardingService {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        paths: Arc<JobNodePath>,
        config: Arc<ConfigService>,
        server: Arc<ServerService>,
        leader: Arc<LeaderService>,
        execution: Arc<ExecutionService>,
        instance_id: String,
    ) -> Self {
        Self {
            registry,
            paths,
            config,
            server,
            leader,
            execution,
            instance_id,
        }
    }

    /// Mark the assignment stale. Called on configuration shard-count
    /// changes and on any live-set change; idempotent.
    pub async fn set_reshard_flag(&self) -> Result<()> {
        self.registry
            .persist(&self.paths.sharding_necessary(), "")
            .await
    }

    pub async fn is_need_sharding(&self) -> Result<bool> {
        self.registry
            .is_existed(&self.paths.sharding_necessary())
            .await
    }

    /// Recompute and publish the assignment if the resharding flag is set.
    ///
    /// Non-leader instances never assign: they wait for the leader's pass to
    /// finish instead. A second call with no intervening topology or config
    /// change is a no-op because the flag was cleared with the assignment in
    /// one transaction. With an empty live set the assignment is left empty
    /// and the flag stays set, so the next topology change retries.
    pub async fn sharding_if_necessary(&self) -> Result<()> {
        if !self.is_need_sharding().await? {
            return Ok(());
        }
        let available = self.server.alive_instances().await?;
        if available.is_empty() {
            tracing::debug!(
                job = %self.paths.job_name(),
                "No live instances, resharding deferred"
            );
            return Ok(());
        }
        if !self.leader.is_leader_until_block().await? {
            self.block_until_sharding_completed().await?;
            return Ok(());
        }

        let config = self.config.load(true).await?;
        if config.monitor_execution {
            self.wait_until_no_running_items().await?;
        }
        tracing::debug!(job = %config.job_name, "Resharding started");
        self.registry
            .persist_ephemeral(&self.paths.sharding_processing(), "")
            .await?;
        self.reset_sharding_info(config.sharding_total_count).await?;

        let strategy = config.sharding_strategy.strategy();
        let assignment = strategy.sharding(
            &available,
            &config.job_name,
            config.sharding_total_count,
        );

        let mut ops = Vec::new();
        for (instance, items) in &assignment {
            for &item in items {
                ops.push(TxOp::Create {
                    path: self.paths.item_instance(item),
                    value: instance.clone(),
                });
            }
        }
        ops.push(TxOp::Delete {
            path: self.paths.sharding_necessary(),
        });
        ops.push(TxOp::Delete {
            path: self.paths.sharding_processing(),
        });
        self.registry.execute_in_transaction(ops).await?;
        tracing::info!(
            job = %config.job_name,
            instances = available.len(),
            items = config.sharding_total_count,
            "Resharding completed"
        );
        Ok(())
    }

    /// Drop the previous assignment and prune per-item subtrees that fall
    /// outside the (possibly shrunk) item range.
    async fn reset_sharding_info(&self, total_count: usize) -> Result<()> {
        for child in self
            .registry
            .get_children_keys(&self.paths.sharding_root())
            .await?
        {
            let Ok(item) = child.parse::<usize>() else {
                continue;
            };
            if item >= total_count {
                self.registry.remove(&self.paths.item_root(item)).await?;
            } else {
                self.registry.remove(&self.paths.item_instance(item)).await?;
            }
        }
        Ok(())
    }

    /// Bounded wait for the leader to clear the necessary/processing flags.
    async fn block_until_sharding_completed(&self) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            let pending = self.is_need_sharding().await?
                || self
                    .registry
                    .is_existed(&self.paths.sharding_processing())
                    .await?;
            if !pending || self.leader.is_leader().await? {
                return Ok(());
            }
            if attempts >= WAIT_MAX_ATTEMPTS {
                tracing::warn!(
                    job = %self.paths.job_name(),
                    "Gave up waiting for resharding to complete, retrying next cycle"
                );
                return Ok(());
            }
            attempts += 1;
            tokio::time::sleep(backoff()).await;
        }
    }

    /// A resharding pass must not reassign an item mid-execution.
    async fn wait_until_no_running_items(&self) -> Result<()> {
        let mut attempts = 0u32;
        while self.execution.has_running_items().await? {
            if attempts >= WAIT_MAX_ATTEMPTS {
                tracing::warn!(
                    job = %self.paths.job_name(),
                    "Items still running after bounded wait, resharding proceeds"
                );
                return Ok(());
            }
            attempts += 1;
            tokio::time::sleep(backoff()).await;
        }
        Ok(())
    }

    /// Items owned by the given instance under the current assignment.
    pub async fn get_items_of(&self, instance_id: &str) -> Result<Vec<usize>> {
        let total = self.config.load(false).await?.sharding_total_count;
        let mut items = Vec::new();
        for item in 0..total {
            if self
                .registry
                .get(&self.paths.item_instance(item))
                .await?
                .as_deref()
                == Some(instance_id)
            {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// This instance's slice of the assignment.
    pub async fn get_local_items(&self) -> Result<Vec<usize>> {
        self.get_items_of(&self.instance_id).await
    }

    pub async fn is_item_disabled(&self, item: usize) -> Result<bool> {
        self.registry
            .is_existed(&self.paths.item_disabled(item))
            .await
    }

    /// Administratively stop one item from being handed to the execution
    /// driver without touching the assignment.
    pub async fn disable_item(&self, item: usize) -> Result<()> {
        self.registry
            .persist(&self.paths.item_disabled(item), "")
            .await
    }

    pub async fn enable_item(&self, item: usize) -> Result<()> {
        self.registry.remove(&self.paths.item_disabled(item)).await
    }
}

fn backoff() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..WAIT_BASE_MS);
    Duration::from_millis(WAIT_BASE_MS + jitter)
}
