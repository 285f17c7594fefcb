//! Per-job coordinator facade.
//!
//! [`JobCoordinator`] is the explicit per-job-name object wiring every
//! coordination service over one registry client; an execution driver calls
//! its surface once per cycle:
//!
//! 1. [`sharding_if_necessary`](JobCoordinator::sharding_if_necessary) and
//!    [`clean_previous_execution_info`](JobCoordinator::clean_previous_execution_info)
//! 2. [`get_local_items`](JobCoordinator::get_local_items) →
//!    [`misfire_if_necessary`](JobCoordinator::misfire_if_necessary) →
//!    [`register_job_begin`](JobCoordinator::register_job_begin)
//! 3. run the job body
//! 4. [`register_job_completed`](JobCoordinator::register_job_completed),
//!    then [`failover_if_necessary`](JobCoordinator::failover_if_necessary)
//!
//! Reactive entry points serialize against each other through a per-job
//! local mutex, because registry notifications can race the process's own
//! writes.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::config::{ConfigService, JobConfig};
use crate::election::LeaderService;
use crate::error::Result;
use crate::execution::ExecutionService;
use crate::failover::FailoverService;
use crate::guarantee::GuaranteeService;
use crate::instance::{JobInstance, ServerService};
use crate::listener::ListenerManager;
use crate::node_path::JobNodePath;
use crate::registry::RegistryClient;
use crate::sharding::ShardingService;

/// Capacity of the immediate-run hook channel fed by failover claims.
const IMMEDIATE_RUN_CAPACITY: usize = 64;

pub struct JobCoordinator {
    instance: JobInstance,
    paths: Arc<JobNodePath>,
    pub config: Arc<ConfigService>,
    pub server: Arc<ServerService>,
    pub leader: Arc<LeaderService>,
    pub execution: Arc<ExecutionService>,
    pub sharding: Arc<ShardingService>,
    pub failover: Arc<FailoverService>,
    pub guarantee: Arc<GuaranteeService>,
    listeners: ListenerManager,
    process_lock: Mutex<()>,
    immediate_runs: std::sync::Mutex<Option<mpsc::Receiver<usize>>>,
}

impl JobCoordinator {
    /// Validate and publish the configuration, register this instance,
    /// join leader election, mark the assignment stale and start watch
    /// dispatch. Invalid configuration aborts startup with no state written.
    pub async fn start(
        registry: Arc<dyn RegistryClient>,
        instance: JobInstance,
        config: JobConfig,
    ) -> Result<Self> {
        config.validate()?;
        let paths = Arc::new(JobNodePath::new(&config.job_name));

        let config_service = Arc::new(ConfigService::new(registry.clone(), paths.clone()));
        config_service.persist(&config).await?;

        let server = Arc::new(ServerService::new(
            registry.clone(),
            paths.clone(),
            instance.id.clone(),
        ));
        let leader = Arc::new(LeaderService::new(
            registry.clone(),
            paths.clone(),
            server.clone(),
            instance.id.clone(),
        ));
        let execution = Arc::new(ExecutionService::new(
            registry.clone(),
            paths.clone(),
            config_service.clone(),
            leader.clone(),
        ));
        let sharding = Arc::new(ShardingService::new(
            registry.clone(),
            paths.clone(),
            config_service.clone(),
            server.clone(),
            leader.clone(),
            execution.clone(),
            instance.id.clone(),
        ));
        let (trigger_tx, trigger_rx) = mpsc::channel(IMMEDIATE_RUN_CAPACITY);
        let failover = Arc::new(FailoverService::new(
            registry.clone(),
            paths.clone(),
            config_service.clone(),
            server.clone(),
            sharding.clone(),
            execution.clone(),
            instance.id.clone(),
            trigger_tx,
        ));
        let guarantee = Arc::new(GuaranteeService::new(
            registry.clone(),
            paths.clone(),
            config_service.clone(),
        ));
        let listeners = ListenerManager::new(
            registry,
            paths.clone(),
            config_service.clone(),
            server.clone(),
            leader.clone(),
            sharding.clone(),
            failover.clone(),
        );

        server.register().await?;
        leader.elect_leader().await?;
        sharding.set_reshard_flag().await?;
        listeners.start().await?;

        tracing::info!(
            job = %paths.job_name(),
            instance = %instance.id,
            "Job coordinator started"
        );
        Ok(Self {
            instance,
            paths,
            config: config_service,
            server,
            leader,
            execution,
            sharding,
            failover,
            guarantee,
            listeners,
            process_lock: Mutex::new(()),
            immediate_runs: std::sync::Mutex::new(Some(trigger_rx)),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.id
    }

    pub fn job_name(&self) -> &str {
        self.paths.job_name()
    }

    /// Items this instance should execute this cycle. Failover-owned items
    /// take priority and suppress everything else; otherwise the local slice
    /// of the assignment, minus items taken over by another instance's
    /// failover and minus administratively disabled items.
    pub async fn get_local_items(&self) -> Result<Vec<usize>> {
        let config = self.config.load(false).await?;
        if config.failover {
            let failover_items = self.failover.get_local_failover_items().await?;
            if !failover_items.is_empty() {
                return Ok(failover_items);
            }
        }
        let mut items = self.sharding.get_local_items().await?;
        if config.failover {
            let taken = self.failover.get_local_take_off_items().await?;
            items.retain(|item| !taken.contains(item));
        }
        let mut runnable = Vec::with_capacity(items.len());
        for item in items {
            if !self.sharding.is_item_disabled(item).await? {
                runnable.push(item);
            }
        }
        Ok(runnable)
    }

    pub async fn register_job_begin(&self, items: &[usize]) -> Result<()> {
        self.execution.register_begin(items).await
    }

    /// Record completion and clear any failover ownership the items carried.
    pub async fn register_job_completed(&self, items: &[usize]) -> Result<()> {
        self.execution.register_completed(items).await?;
        if self.config.load(false).await?.failover {
            self.failover.update_failover_complete(items).await?;
        }
        Ok(())
    }

    /// Record a misfire if any of the items is still running and misfires
    /// are enabled. Returns whether the cycle should be deferred.
    pub async fn misfire_if_necessary(&self, items: &[usize]) -> Result<bool> {
        if !self.config.load(false).await?.misfire {
            return Ok(false);
        }
        self.execution.misfire_if_necessary(items).await
    }

    pub async fn clear_misfire(&self, items: &[usize]) -> Result<()> {
        self.execution.clear_misfire(items).await
    }

    pub async fn get_misfired_items(&self, items: &[usize]) -> Result<Vec<usize>> {
        self.execution.get_misfired_items(items).await
    }

    pub async fn is_need_sharding(&self) -> Result<bool> {
        self.sharding.is_need_sharding().await
    }

    pub async fn has_running_items(&self) -> Result<bool> {
        self.execution.has_running_items().await
    }

    /// Per-cycle resharding entry point, serialized per job.
    pub async fn sharding_if_necessary(&self) -> Result<()> {
        let _guard = self.process_lock.lock().await;
        self.sharding.sharding_if_necessary().await
    }

    /// Per-cycle failover entry point, serialized per job.
    pub async fn failover_if_necessary(&self) -> Result<()> {
        let _guard = self.process_lock.lock().await;
        self.failover.failover_if_necessary().await
    }

    /// Per-cycle cleanup entry point, serialized per job.
    pub async fn clean_previous_execution_info(&self) -> Result<()> {
        let _guard = self.process_lock.lock().await;
        self.execution.clean_previous_execution_info().await
    }

    pub async fn register_start(&self, items: &[usize]) -> Result<()> {
        self.guarantee.register_start(items).await
    }

    pub async fn register_complete(&self, items: &[usize]) -> Result<()> {
        self.guarantee.register_complete(items).await
    }

    pub async fn is_all_started(&self) -> Result<bool> {
        self.guarantee.is_all_started().await
    }

    pub async fn is_all_completed(&self) -> Result<bool> {
        self.guarantee.is_all_completed().await
    }

    /// Receiver of the immediate-run hook: items claimed through failover
    /// arrive here for out-of-cycle execution. Can be taken once.
    pub fn take_immediate_run_events(&self) -> Option<mpsc::Receiver<usize>> {
        self.immediate_runs
            .lock()
            .expect("immediate-run receiver lock poisoned")
            .take()
    }

    /// Stop watch dispatch without touching registry state. Used by tests
    /// to freeze an instance before simulating its crash.
    pub fn stop_listeners(&self) {
        self.listeners.stop();
    }

    /// Graceful shutdown: stop watch dispatch, release leadership so
    /// re-election does not wait for session expiry, then deregister.
    pub async fn shutdown(&self) -> Result<()> {
        self.listeners.stop();
        self.leader.remove_leadership().await?;
        self.server.deregister().await?;
        tracing::info!(
            job = %self.paths.job_name(),
            instance = %self.instance.id,
            "Job coordinator stopped"
        );
        Ok(())
    }
}
