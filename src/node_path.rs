//! Registry path layout for one job.
//!
//! All coordination state of a job lives under `/{job_name}`:
//!
//! - `leader/election/instance` - ephemeral leader token
//! - `leader/sharding/necessary` / `leader/sharding/processing` - resharding flags
//! - `leader/execution/cleaning` - per-cycle cleanup flag
//! - `leader/failover/items/{item}` - failover queue, plus its claim latch
//! - `sharding/{item}/...` - per-item assignment and execution markers
//! - `servers/{instance}/...` - per-instance liveness and disable markers
//! - `guarantee/started|completed/{item}` - barrier markers
//! - `config` - the published [`JobConfig`](crate::config::JobConfig) document

/// Pure mapping from logical coordination concepts to registry paths,
/// namespaced by job name. Also provides the inverse helpers the listener
/// manager needs to classify notification paths.
#[derive(Debug, Clone)]
pub struct JobNodePath {
    job_name: String,
}

impl JobNodePath {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn root(&self) -> String {
        format!("/{}", self.job_name)
    }

    fn full(&self, node: &str) -> String {
        format!("/{}/{}", self.job_name, node)
    }

    pub fn config(&self) -> String {
        self.full("config")
    }

    // Leader subtree

    pub fn leader_instance(&self) -> String {
        self.full("leader/election/instance")
    }

    pub fn election_latch(&self) -> String {
        self.full("leader/election/latch")
    }

    pub fn sharding_necessary(&self) -> String {
        self.full("leader/sharding/necessary")
    }

    pub fn sharding_processing(&self) -> String {
        self.full("leader/sharding/processing")
    }

    pub fn execution_cleaning(&self) -> String {
        self.full("leader/execution/cleaning")
    }

    pub fn failover_latch(&self) -> String {
        self.full("leader/failover/latch")
    }

    pub fn failover_items_root(&self) -> String {
        self.full("leader/failover/items")
    }

    pub fn failover_queue_item(&self, item: usize) -> String {
        format!("{}/{}", self.failover_items_root(), item)
    }

    // Sharding subtree

    pub fn sharding_root(&self) -> String {
        self.full("sharding")
    }

    pub fn item_root(&self, item: usize) -> String {
        format!("{}/{}", self.sharding_root(), item)
    }

    pub fn item_instance(&self, item: usize) -> String {
        format!("{}/instance", self.item_root(item))
    }

    pub fn item_running(&self, item: usize) -> String {
        format!("{}/running", self.item_root(item))
    }

    pub fn item_completed(&self, item: usize) -> String {
        format!("{}/completed", self.item_root(item))
    }

    pub fn item_misfire(&self, item: usize) -> String {
        format!("{}/misfire", self.item_root(item))
    }

    pub fn item_failover(&self, item: usize) -> String {
        format!("{}/failover", self.item_root(item))
    }

    pub fn item_disabled(&self, item: usize) -> String {
        format!("{}/disabled", self.item_root(item))
    }

    // Servers subtree

    pub fn servers_root(&self) -> String {
        self.full("servers")
    }

    pub fn server_status(&self, instance_id: &str) -> String {
        format!("{}/{}/status", self.servers_root(), instance_id)
    }

    pub fn server_disabled(&self, instance_id: &str) -> String {
        format!("{}/{}/disabled", self.servers_root(), instance_id)
    }

    // Guarantee subtree

    pub fn guarantee_started_root(&self) -> String {
        self.full("guarantee/started")
    }

    pub fn guarantee_started(&self, item: usize) -> String {
        format!("{}/{}", self.guarantee_started_root(), item)
    }

    pub fn guarantee_completed_root(&self) -> String {
        self.full("guarantee/completed")
    }

    pub fn guarantee_completed(&self, item: usize) -> String {
        format!("{}/{}", self.guarantee_completed_root(), item)
    }

    pub fn guarantee_started_latch(&self) -> String {
        self.full("guarantee/started_latch")
    }

    pub fn guarantee_completed_latch(&self) -> String {
        self.full("guarantee/completed_latch")
    }

    // Path classification, used by the listener manager

    /// Shard item of a `sharding/{item}/running` path, if the path is one.
    pub fn running_item(&self, path: &str) -> Option<usize> {
        let rest = path.strip_prefix(&format!("{}/", self.sharding_root()))?;
        let (item, node) = rest.split_once('/')?;
        if node == "running" {
            item.parse().ok()
        } else {
            None
        }
    }

    pub fn is_config_path(&self, path: &str) -> bool {
        path == self.config()
    }

    /// Instance id of a `servers/{instance}/...` path, if the path is one.
    pub fn server_instance(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(&format!("{}/", self.servers_root()))?;
        let instance = rest.split('/').next()?;
        if instance.is_empty() {
            None
        } else {
            Some(instance.to_string())
        }
    }

    pub fn is_leader_instance_path(&self, path: &str) -> bool {
        path == self.leader_instance()
    }
}
