use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::node_path::JobNodePath;
use crate::registry::RegistryClient;

/// Identity of one running process of a job: process id plus a per-process
/// disambiguator, so restarting a process yields a fresh identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobInstance {
    pub id: String,
}

impl JobInstance {
    pub fn new() -> Self {
        Self {
            id: format!("{}@{}", std::process::id(), Uuid::new_v4().simple()),
        }
    }

    /// Explicit identity, used by tests and deployments with stable names.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for JobInstance {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks which instances of a job are live and eligible for work.
///
/// Liveness is an ephemeral `servers/{instance}/status` entry bound to the
/// instance's registry session; a persistent `disabled` sibling takes an
/// instance out of rotation without ending its session.
pub struct ServerService {
    registry: Arc<dyn RegistryClient>,
    paths: Arc<JobNodePath>,
    instance_id: String,
}

impl ServerService {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        paths: Arc<JobNodePath>,
        instance_id: String,
    ) -> Self {
        Self {
            registry,
            paths,
            instance_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Publish this instance's liveness marker.
    pub async fn register(&self) -> Result<()> {
        self.registry
            .persist_ephemeral(&self.paths.server_status(&self.instance_id), "")
            .await?;
        tracing::info!(
            job = %self.paths.job_name(),
            instance = %self.instance_id,
            "Instance registered"
        );
        Ok(())
    }

    /// Remove this instance's liveness marker ahead of session end, so peers
    /// observe the departure without waiting for session expiry.
    pub async fn deregister(&self) -> Result<()> {
        self.registry
            .remove(&self.paths.server_status(&self.instance_id))
            .await?;
        tracing::info!(
            job = %self.paths.job_name(),
            instance = %self.instance_id,
            "Instance deregistered"
        );
        Ok(())
    }

    /// Ids of live, non-disabled instances, in sorted order. The sorted
    /// order is what the sharding strategies enumerate.
    pub async fn alive_instances(&self) -> Result<Vec<String>> {
        let mut alive = Vec::new();
        for id in self
            .registry
            .get_children_keys(&self.paths.servers_root())
            .await?
        {
            if self.is_available(&id).await? {
                alive.push(id);
            }
        }
        Ok(alive)
    }

    pub async fn is_available(&self, instance_id: &str) -> Result<bool> {
        Ok(self
            .registry
            .is_existed(&self.paths.server_status(instance_id))
            .await?
            && !self
                .registry
                .is_existed(&self.paths.server_disabled(instance_id))
                .await?)
    }

    pub async fn is_local_available(&self) -> Result<bool> {
        self.is_available(&self.instance_id).await
    }

    /// Administratively take an instance out of rotation. Topology listeners
    /// turn this into a resharding trigger.
    pub async fn disable(&self, instance_id: &str) -> Result<()> {
        self.registry
            .persist(&self.paths.server_disabled(instance_id), "")
            .await
    }

    pub async fn enable(&self, instance_id: &str) -> Result<()> {
        self.registry
            .remove(&self.paths.server_disabled(instance_id))
            .await
    }
}
