//! Leader election over the registry's mutual-exclusion latch.
//!
//! Exactly one instance holds the ephemeral leader token at any time; the
//! token disappears with its holder's session, so a crashed leader is
//! replaced as soon as another instance races the latch again. A stale
//! belief of leadership is never acted upon: every leader-gated operation
//! re-reads the token directly from the registry as its last step before
//! mutating shared state.

use std::sync::Arc;

use crate::error::Result;
use crate::instance::ServerService;
use crate::node_path::JobNodePath;
use crate::registry::RegistryClient;

pub struct LeaderService {
    registry: Arc<dyn RegistryClient>,
    paths: Arc<JobNodePath>,
    server: Arc<ServerService>,
    instance_id: String,
}

impl LeaderService {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        paths: Arc<JobNodePath>,
        server: Arc<ServerService>,
        instance_id: String,
    ) -> Self {
        Self {
            registry,
            paths,
            server,
            instance_id,
        }
    }

    /// Race all live instances for the election latch. The winner publishes
    /// the ephemeral leader token; losers observe the existing token and
    /// return without mutating anything.
    pub async fn elect_leader(&self) -> Result<()> {
        let _latch = self
            .registry
            .acquire_latch(&self.paths.election_latch())
            .await?;
        if !self.has_leader().await? {
            self.registry
                .persist_ephemeral(&self.paths.leader_instance(), &self.instance_id)
                .await?;
            tracing::info!(
                job = %self.paths.job_name(),
                instance = %self.instance_id,
                "Leadership acquired"
            );
        }
        Ok(())
    }

    /// Whether this instance currently holds the leader token. Reads the
    /// token directly, never a cached copy.
    pub async fn is_leader(&self) -> Result<bool> {
        Ok(self
            .registry
            .get_directly(&self.paths.leader_instance())
            .await?
            .as_deref()
            == Some(self.instance_id.as_str()))
    }

    /// Block until some instance holds leadership, electing if necessary,
    /// then report whether that leader is this instance. Returns `false`
    /// without electing when no instance is available to lead.
    pub async fn is_leader_until_block(&self) -> Result<bool> {
        while !self.has_leader().await? {
            if self.server.alive_instances().await?.is_empty() {
                return Ok(false);
            }
            self.elect_leader().await?;
        }
        self.is_leader().await
    }

    pub async fn has_leader(&self) -> Result<bool> {
        self.registry
            .is_existed(&self.paths.leader_instance())
            .await
    }

    /// Voluntarily release the leader token. Used when an instance is
    /// administratively disabled or shuts down gracefully, shortening
    /// re-election latency compared to waiting for session expiry.
    pub async fn remove_leadership(&self) -> Result<()> {
        if self.is_leader().await? {
            self.registry.remove(&self.paths.leader_instance()).await?;
            tracing::info!(
                job = %self.paths.job_name(),
                instance = %self.instance_id,
                "Leadership released"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    async fn leader_service(
        registry: &Arc<MemoryRegistry>,
        id: &str,
    ) -> (Arc<ServerService>, LeaderService) {
        let client: Arc<dyn RegistryClient> = Arc::new(registry.connect());
        let paths = Arc::new(JobNodePath::new("j"));
        let server = Arc::new(ServerService::new(
            client.clone(),
            paths.clone(),
            id.to_string(),
        ));
        server.register().await.unwrap();
        let leader = LeaderService::new(client, paths, server.clone(), id.to_string());
        (server, leader)
    }

    #[tokio::test]
    async fn first_contender_wins_election() {
        let registry = MemoryRegistry::new();
        let (_sa, a) = leader_service(&registry, "a").await;
        let (_sb, b) = leader_service(&registry, "b").await;

        a.elect_leader().await.unwrap();
        b.elect_leader().await.unwrap();

        assert!(a.is_leader().await.unwrap());
        assert!(!b.is_leader().await.unwrap());
        assert!(b.has_leader().await.unwrap());
    }

    #[tokio::test]
    async fn leadership_can_be_released_and_retaken() {
        let registry = MemoryRegistry::new();
        let (_sa, a) = leader_service(&registry, "a").await;
        let (_sb, b) = leader_service(&registry, "b").await;

        a.elect_leader().await.unwrap();
        a.remove_leadership().await.unwrap();
        assert!(!a.has_leader().await.unwrap());

        b.elect_leader().await.unwrap();
        assert!(b.is_leader().await.unwrap());
    }

    #[tokio::test]
    async fn remove_leadership_is_noop_for_non_leader() {
        let registry = MemoryRegistry::new();
        let (_sa, a) = leader_service(&registry, "a").await;
        let (_sb, b) = leader_service(&registry, "b").await;

        a.elect_leader().await.unwrap();
        b.remove_leadership().await.unwrap();
        assert!(a.is_leader().await.unwrap());
    }

    #[tokio::test]
    async fn is_leader_until_block_elects_when_token_absent() {
        let registry = MemoryRegistry::new();
        let (_sa, a) = leader_service(&registry, "a").await;

        assert!(a.is_leader_until_block().await.unwrap());
        assert!(a.is_leader().await.unwrap());
    }
}
