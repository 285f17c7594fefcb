//! Watch dispatch: turns registry notifications into domain actions.
//!
//! One task per watched subtree, each fed by its own bounded channel so
//! per-subtree ordering is preserved while subtrees stay concurrent:
//!
//! - execution-path deletions → failover candidates
//! - configuration updates → resharding flag, failover-toggle cleanup
//! - server/topology changes → resharding flag
//! - leader-token removal → re-election
//!
//! Registry delivery is at-least-once and unordered across subtrees, so
//! every handler is idempotent and re-checks registry state instead of
//! trusting the event payload.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{ConfigService, JobConfig};
use crate::election::LeaderService;
use crate::error::Result;
use crate::failover::FailoverService;
use crate::instance::ServerService;
use crate::node_path::JobNodePath;
use crate::registry::{DataEvent, DataEventKind, DataSubscription, RegistryClient};
use crate::sharding::ShardingService;

struct ListenerContext {
    registry: Arc<dyn RegistryClient>,
    paths: Arc<JobNodePath>,
    config: Arc<ConfigService>,
    server: Arc<ServerService>,
    leader: Arc<LeaderService>,
    sharding: Arc<ShardingService>,
    failover: Arc<FailoverService>,
}

pub struct ListenerManager {
    ctx: Arc<ListenerContext>,
    token: CancellationToken,
}

impl ListenerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        paths: Arc<JobNodePath>,
        config: Arc<ConfigService>,
        server: Arc<ServerService>,
        leader: Arc<LeaderService>,
        sharding: Arc<ShardingService>,
        failover: Arc<FailoverService>,
    ) -> Self {
        Self {
            ctx: Arc::new(ListenerContext {
                registry,
                paths,
                config,
                server,
                leader,
                sharding,
                failover,
            }),
            token: CancellationToken::new(),
        }
    }

    /// Subscribe all watch streams and spawn their dispatch tasks.
    pub async fn start(&self) -> Result<()> {
        let execution_sub = self
            .ctx
            .registry
            .add_data_listener(&self.ctx.paths.sharding_root())
            .await?;
        let config_sub = self
            .ctx
            .registry
            .add_data_listener(&self.ctx.paths.config())
            .await?;
        let servers_sub = self
            .ctx
            .registry
            .add_data_listener(&self.ctx.paths.servers_root())
            .await?;
        let election_sub = self
            .ctx
            .registry
            .add_data_listener(&self.ctx.paths.leader_instance())
            .await?;

        tokio::spawn(Self::dispatch_loop(
            self.ctx.clone(),
            execution_sub,
            self.token.clone(),
            Self::on_execution_event,
        ));
        tokio::spawn(Self::dispatch_loop(
            self.ctx.clone(),
            config_sub,
            self.token.clone(),
            Self::on_config_event,
        ));
        tokio::spawn(Self::dispatch_loop(
            self.ctx.clone(),
            servers_sub,
            self.token.clone(),
            Self::on_server_event,
        ));
        tokio::spawn(Self::dispatch_loop(
            self.ctx.clone(),
            election_sub,
            self.token.clone(),
            Self::on_election_event,
        ));
        Ok(())
    }

    /// Stop all dispatch tasks and cancel their subscriptions.
    pub fn stop(&self) {
        self.token.cancel();
    }

    async fn dispatch_loop<F, Fut>(
        ctx: Arc<ListenerContext>,
        mut subscription: DataSubscription,
        token: CancellationToken,
        handler: F,
    ) where
        F: Fn(Arc<ListenerContext>, DataEvent) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = subscription.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = handler(ctx.clone(), event).await {
                                tracing::warn!(error = %e, "Watch handler failed, event dropped");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// A running marker removed without a completed marker is the crash
    /// signal. Deletions performed by the leader's own cleanup pass are
    /// recognized by the cleaning flag and ignored.
    async fn on_execution_event(ctx: Arc<ListenerContext>, event: DataEvent) -> Result<()> {
        if event.kind != DataEventKind::Removed {
            return Ok(());
        }
        let Some(item) = ctx.paths.running_item(&event.path) else {
            return Ok(());
        };
        if !ctx.config.load(true).await?.failover {
            return Ok(());
        }
        if ctx
            .registry
            .is_existed(&ctx.paths.execution_cleaning())
            .await?
        {
            tracing::debug!(item, "Running marker removed by cleanup, not a crash");
            return Ok(());
        }
        if ctx
            .registry
            .is_existed(&ctx.paths.item_completed(item))
            .await?
        {
            return Ok(());
        }
        ctx.failover.set_crashed_failover_flag(item).await
    }

    /// Configuration document changed: refresh the cache, reshard on item
    /// count changes, clear stale failover records when failover is turned
    /// off.
    async fn on_config_event(ctx: Arc<ListenerContext>, event: DataEvent) -> Result<()> {
        if event.kind == DataEventKind::Removed || !ctx.paths.is_config_path(&event.path) {
            return Ok(());
        }
        let new_config: JobConfig = match serde_json::from_str(&event.value) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unparsable configuration update");
                return Ok(());
            }
        };
        let previous = ctx.config.cached().await;
        ctx.config.update_cache(new_config.clone()).await;

        if previous
            .as_ref()
            .map(|c| c.sharding_total_count != new_config.sharding_total_count)
            .unwrap_or(true)
        {
            ctx.sharding.set_reshard_flag().await?;
        }
        if !new_config.failover {
            ctx.failover.remove_failover_info().await?;
        }
        Ok(())
    }

    /// Any liveness or disable change in the server subtree changes the
    /// live set, so the assignment is stale.
    async fn on_server_event(ctx: Arc<ListenerContext>, event: DataEvent) -> Result<()> {
        if ctx.paths.server_instance(&event.path).is_none() {
            return Ok(());
        }
        ctx.sharding.set_reshard_flag().await
    }

    /// The leader token vanished (crash or voluntary release): race for a
    /// new leader if this instance is eligible.
    async fn on_election_event(ctx: Arc<ListenerContext>, event: DataEvent) -> Result<()> {
        if event.kind != DataEventKind::Removed
            || !ctx.paths.is_leader_instance_path(&event.path)
        {
            return Ok(());
        }
        if ctx.server.is_local_available().await? {
            ctx.leader.elect_leader().await?;
        }
        Ok(())
    }
}
