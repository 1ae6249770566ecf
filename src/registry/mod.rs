//! Agent lifecycle: registration, heartbeat ingest, liveness, revocation
//! and token rotation.

use crate::models::AgentRecord;
use crate::store::Store;
use crate::{ProbeMeshError, Result};
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct AgentRegistry {
    store: Store,
    /// Legacy affordance: accept the agent's public name in place of its
    /// token on heartbeat.
    allow_name_heartbeat: bool,
}

impl AgentRegistry {
    pub fn new(store: Store, allow_name_heartbeat: bool) -> Self {
        Self {
            store,
            allow_name_heartbeat,
        }
    }

    /// Registers a new agent with a freshly generated token.
    pub async fn create(&self, name: &str, region: &str) -> Result<AgentRecord> {
        let name = name.trim();
        let region = region.trim();
        if name.is_empty() || region.is_empty() {
            return Err(ProbeMeshError::BadRequest(
                "agent name and region are required".to_string(),
            ));
        }
        if self
            .store
            .list_active_agents()
            .await
            .iter()
            .any(|a| a.name == name)
        {
            return Err(ProbeMeshError::BadRequest(format!(
                "agent name {name:?} already registered"
            )));
        }
        let token = Uuid::new_v4().to_string();
        let agent = self.store.create_agent(name, region, &token).await;
        info!("registered agent {} ({})", agent.name, agent.region);
        Ok(agent)
    }

    /// Non-revoked agents, newest first, with derived completion counts.
    pub async fn list_active(&self) -> Vec<AgentRecord> {
        self.store.list_active_agents().await
    }

    pub async fn count_active(&self) -> usize {
        self.store.count_active_agents().await
    }

    pub async fn get(&self, id: Uuid) -> Result<AgentRecord> {
        self.store.get_agent(id).await
    }

    /// Revokes the agent; its queue key stops receiving fan-outs and its
    /// token stops heartbeating.
    pub async fn revoke(&self, id: Uuid) -> Result<()> {
        self.store.revoke_agent(id).await?;
        info!("revoked agent {}", id);
        Ok(())
    }

    /// Token rotation: the old row is revoked and a new row is inserted
    /// with the same `(name, region)` and a fresh token. Heartbeats with
    /// the old token fail from this point on.
    pub async fn rotate_token(&self, id: Uuid) -> Result<AgentRecord> {
        let old = self.store.get_agent(id).await?;
        self.store.revoke_agent(id).await?;
        let token = Uuid::new_v4().to_string();
        let agent = self.store.create_agent(&old.name, &old.region, &token).await;
        info!("rotated token for agent {}", agent.name);
        Ok(agent)
    }

    /// Heartbeat ingest. The identifier is the agent's token (or its name
    /// when the legacy flag is on); unknown or revoked identities are
    /// `Unauthorized`.
    pub async fn heartbeat(&self, identifier: &str, ip: Option<String>) -> Result<()> {
        self.store
            .update_heartbeat(identifier, ip, self.allow_name_heartbeat)
            .await
            .map_err(|_| ProbeMeshError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Store::new(), false)
    }

    #[tokio::test]
    async fn create_generates_a_token() {
        let registry = registry();
        let agent = registry.create("probe-1", "eu").await.unwrap();
        assert!(!agent.token.is_empty());
        assert!(!agent.revoked);
        assert_eq!(registry.count_active().await, 1);
    }

    #[tokio::test]
    async fn create_rejects_blank_and_duplicate_names() {
        let registry = registry();
        assert!(matches!(
            registry.create(" ", "eu").await,
            Err(ProbeMeshError::BadRequest(_))
        ));
        registry.create("probe-1", "eu").await.unwrap();
        assert!(matches!(
            registry.create("probe-1", "us").await,
            Err(ProbeMeshError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn token_rotation_revokes_old_credentials() {
        let registry = registry();
        let original = registry.create("probe-1", "eu").await.unwrap();

        registry
            .heartbeat(&original.token, Some("10.0.0.1".to_string()))
            .await
            .unwrap();

        let rotated = registry.rotate_token(original.id).await.unwrap();
        assert_eq!(rotated.name, "probe-1");
        assert_eq!(rotated.region, "eu");
        assert_ne!(rotated.token, original.token);

        // Old token now fails, new token works.
        assert!(matches!(
            registry.heartbeat(&original.token, None).await,
            Err(ProbeMeshError::Unauthorized)
        ));
        registry.heartbeat(&rotated.token, None).await.unwrap();

        // Exactly one active row remains for the name.
        let active = registry.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, rotated.id);
    }

    #[tokio::test]
    async fn heartbeat_by_name_requires_legacy_flag() {
        let strict = registry();
        strict.create("probe-1", "eu").await.unwrap();
        assert!(matches!(
            strict.heartbeat("probe-1", None).await,
            Err(ProbeMeshError::Unauthorized)
        ));

        let legacy = AgentRegistry::new(Store::new(), true);
        legacy.create("probe-2", "us").await.unwrap();
        legacy.heartbeat("probe-2", None).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_heartbeat_is_unauthorized() {
        let registry = registry();
        assert!(matches!(
            registry.heartbeat("no-such-token", None).await,
            Err(ProbeMeshError::Unauthorized)
        ));
    }
}
