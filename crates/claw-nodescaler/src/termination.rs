//! Instance and node teardown shared by disruption and interruption.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backoff::Backoff;
use crate::cluster::ClusterClient;
use crate::error::{ControllerError, ProviderError, Result};
use crate::lifecycle::{ClaimId, ClaimPhase, ConditionKind, NodeClaimStore};
use crate::provider::CloudProvider;

/// Deletes a claim's instance and node and records the claim as terminated.
#[derive(Debug)]
pub struct Terminator<P, C> {
    provider: Arc<P>,
    cluster: Arc<C>,
    store: Arc<NodeClaimStore>,
    backoff: Backoff,
}

impl<P: CloudProvider, C: ClusterClient> Terminator<P, C> {
    /// Creates a terminator.
    #[must_use]
    pub fn new(provider: Arc<P>, cluster: Arc<C>, store: Arc<NodeClaimStore>, backoff: Backoff) -> Self {
        Self {
            provider,
            cluster,
            store,
            backoff,
        }
    }

    /// Drives a `Disrupting` or `Terminating` claim to `Terminated`. Every
    /// step is idempotent, so an interrupted call can simply be repeated.
    ///
    /// # Errors
    ///
    /// Returns error if the claim is missing, is in any other phase, or a
    /// collaborator call keeps failing.
    pub async fn terminate(&self, id: ClaimId, cancel: &CancellationToken) -> Result<()> {
        let claim = self
            .store
            .get(id)
            .ok_or(ControllerError::ClaimNotFound { claim_id: id })?;
        match claim.phase {
            ClaimPhase::Terminated => return Ok(()),
            ClaimPhase::Disrupting => {
                self.store.transition(id, ClaimPhase::Terminating, false)?;
                self.publish(id, cancel).await?;
            }
            ClaimPhase::Terminating => {}
            from => {
                return Err(ControllerError::InvalidTransition {
                    claim_id: id,
                    from,
                    to: ClaimPhase::Terminating,
                });
            }
        }

        if let Some(provider_id) = &claim.provider_id {
            self.delete_instance(provider_id, cancel).await?;
        }
        if let Some(node) = &claim.node_name {
            self.backoff
                .retry("delete node", cancel, || self.cluster.delete_node(node))
                .await?;
        }

        let now = Utc::now();
        self.store.update(id, |c| {
            c.set_condition(ConditionKind::Ready, false, "terminated", now);
        })?;
        self.store.transition(id, ClaimPhase::Terminated, false)?;
        self.publish(id, cancel).await?;
        info!(claim = %id, name = %claim.name, "claim terminated");
        Ok(())
    }

    /// Deletes a provider instance. An instance that is already gone counts
    /// as deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the provider keeps failing.
    pub async fn delete_instance(&self, provider_id: &str, cancel: &CancellationToken) -> Result<()> {
        let outcome = self
            .backoff
            .retry("delete instance", cancel, || async move {
                self.provider.delete(provider_id).await.map_err(Into::into)
            })
            .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(ControllerError::Provider(ProviderError::NotFound { .. })) => {
                debug!(provider_id, "instance already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Mirrors the stored claim to the cluster.
    ///
    /// # Errors
    ///
    /// Returns error if the claim is missing or the cluster keeps failing.
    pub async fn publish(&self, id: ClaimId, cancel: &CancellationToken) -> Result<()> {
        let claim = self
            .store
            .get(id)
            .ok_or(ControllerError::ClaimNotFound { claim_id: id })?;
        self.backoff
            .retry("upsert claim", cancel, || self.cluster.upsert_claim(&claim))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::lifecycle::testing::claim;
    use crate::provider::{InMemoryProvider, LaunchRequest};
    use claw_provisioning::{CapacityType, DisruptionMethod, InstanceType, Node, Resources};

    struct Fixture {
        provider: Arc<InMemoryProvider>,
        cluster: Arc<InMemoryCluster>,
        store: Arc<NodeClaimStore>,
        terminator: Terminator<InMemoryProvider, InMemoryCluster>,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(InMemoryProvider::new(vec![
            InstanceType::new("medium", Resources::new().with_cpu(4))
                .with_offering("zone-a", CapacityType::OnDemand, 0.1),
        ]));
        let cluster = Arc::new(InMemoryCluster::new());
        let store = Arc::new(NodeClaimStore::new());
        let terminator = Terminator::new(
            Arc::clone(&provider),
            Arc::clone(&cluster),
            Arc::clone(&store),
            Backoff::default(),
        );
        Fixture {
            provider,
            cluster,
            store,
            terminator,
        }
    }

    async fn ready_claim(f: &Fixture) -> ClaimId {
        let mut c = claim("default-1", "default", ClaimPhase::Ready);
        let instance = f
            .provider
            .create(&LaunchRequest::for_claim(&c))
            .await
            .expect("create");
        c.provider_id = Some(instance.provider_id.clone());
        c.node_name = Some(instance.name.clone());
        f.cluster.add_node(instance.to_node());
        f.store.insert(c).expect("insert")
    }

    #[tokio::test]
    async fn disrupting_claims_are_torn_down() {
        let f = fixture();
        let id = ready_claim(&f).await;
        f.store
            .begin_disrupting(&[id], DisruptionMethod::Emptiness, Utc::now())
            .expect("disrupt");

        f.terminator.terminate(id, &CancellationToken::new()).await.expect("terminate");

        assert_eq!(f.store.get(id).map(|c| c.phase), Some(ClaimPhase::Terminated));
        assert!(f.provider.running().is_empty());
        assert!(f.cluster.nodes().is_empty());
        assert_eq!(f.cluster.claim(id).map(|c| c.phase), Some(ClaimPhase::Terminated));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let f = fixture();
        let id = ready_claim(&f).await;
        f.store
            .begin_disrupting(&[id], DisruptionMethod::Drift, Utc::now())
            .expect("disrupt");
        let cancel = CancellationToken::new();
        f.terminator.terminate(id, &cancel).await.expect("first");
        f.terminator.terminate(id, &cancel).await.expect("second");
        assert_eq!(f.store.get(id).map(|c| c.phase), Some(ClaimPhase::Terminated));
    }

    #[tokio::test]
    async fn missing_instances_do_not_block_termination() {
        let f = fixture();
        let mut c = claim("default-2", "default", ClaimPhase::Ready);
        c.provider_id = Some("mem:///zone-a/i-gone".into());
        let id = f.store.insert(c).expect("insert");
        f.cluster.add_node(Node::new("default-2"));
        f.store
            .begin_disrupting(&[id], DisruptionMethod::Expiration, Utc::now())
            .expect("disrupt");

        f.terminator.terminate(id, &CancellationToken::new()).await.expect("terminate");
        assert_eq!(f.store.get(id).map(|c| c.phase), Some(ClaimPhase::Terminated));
    }

    #[tokio::test]
    async fn ready_claims_cannot_be_terminated_directly() {
        let f = fixture();
        let id = ready_claim(&f).await;
        let err = f
            .terminator
            .terminate(id, &CancellationToken::new())
            .await
            .expect_err("not disrupting");
        assert!(matches!(err, ControllerError::InvalidTransition { .. }));
        assert_eq!(f.provider.running().len(), 1);
    }
}
