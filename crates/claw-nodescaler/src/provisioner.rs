//! Turns pending pods into NodeClaims.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use claw_provisioning::{PodKey, Resources, SchedulingResults, simulate_with};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::cluster::{ClusterClient, NodePoolStatus};
use crate::context::ReconcileContext;
use crate::error::Result;
use crate::lifecycle::{ClaimId, ConditionKind, NodeClaim, NodeClaimStore};

/// What one provisioning pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisioningOutcome {
    /// Claims created.
    pub claims: Vec<ClaimId>,
    /// Pods placed on existing or in-flight capacity.
    pub placed: usize,
    /// Pods that could not be placed, with the reason reported on them.
    pub unschedulable: BTreeMap<PodKey, String>,
}

impl ProvisioningOutcome {
    /// Returns true if the pass changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.claims.is_empty() && self.unschedulable.is_empty()
    }
}

/// Runs the simulator over pending pods and records the claims it asks for.
#[derive(Debug)]
pub struct Provisioner<C> {
    cluster: Arc<C>,
    store: Arc<NodeClaimStore>,
    backoff: Backoff,
}

impl<C: ClusterClient> Provisioner<C> {
    /// Creates a provisioner.
    #[must_use]
    pub fn new(cluster: Arc<C>, store: Arc<NodeClaimStore>, backoff: Backoff) -> Self {
        Self {
            cluster,
            store,
            backoff,
        }
    }

    /// Simulates the context's pending pods without side effects.
    #[must_use]
    pub fn plan(ctx: &ReconcileContext) -> SchedulingResults {
        let pending = ctx.state.pending_pods();
        simulate_with(
            &pending,
            &ctx.state,
            &ctx.catalog,
            &ctx.nodepools,
            &ctx.policy,
        )
    }

    /// Runs one provisioning pass: creates a `Pending` claim for every node
    /// the simulator launches, reports unschedulable pods and refreshes
    /// NodePool status.
    ///
    /// # Errors
    ///
    /// Returns error if the cluster API keeps failing after retries.
    pub async fn provision(
        &self,
        ctx: &ReconcileContext,
        cancel: &CancellationToken,
    ) -> Result<ProvisioningOutcome> {
        let results = Self::plan(ctx);
        let mut outcome = ProvisioningOutcome {
            placed: results.placements.len(),
            ..ProvisioningOutcome::default()
        };

        let mut launched: BTreeMap<String, (Resources, usize)> = BTreeMap::new();
        for template in &results.node_claims {
            let Some(pool) = ctx.nodepool(&template.nodepool) else {
                warn!(nodepool = %template.nodepool, "nodepool vanished during pass");
                continue;
            };
            let Some(instance) = ctx
                .catalog
                .instance_type(&template.nodepool, &template.offering.instance_type)
            else {
                warn!(instance_type = %template.offering.instance_type, "instance type vanished during pass");
                continue;
            };

            let mut claim = NodeClaim::from_template(template, pool, instance);
            claim.set_condition(ConditionKind::Launched, false, "awaiting launch", Utc::now());
            let id = self.store.insert(claim.clone())?;
            self.backoff
                .retry("upsert claim", cancel, || self.cluster.upsert_claim(&claim))
                .await?;
            info!(
                claim = %id,
                name = %claim.name,
                nodepool = %claim.nodepool,
                instance_type = %claim.offering.instance_type,
                zone = %claim.offering.zone,
                pods = claim.pods.len(),
                "node claim created"
            );

            let entry = launched.entry(claim.nodepool.clone()).or_default();
            entry.0 = entry.0.add(&claim.capacity);
            entry.1 += 1;
            outcome.claims.push(id);
        }

        for (pod, reason) in &results.unschedulable {
            let reason = reason.to_string();
            debug!(pod = %pod, reason = %reason, "pod unschedulable");
            self.backoff
                .retry("mark unschedulable", cancel, || {
                    self.cluster.mark_unschedulable(pod, &reason)
                })
                .await?;
            outcome.unschedulable.insert(pod.clone(), reason);
        }

        for placement in &results.placements {
            self.backoff
                .retry("clear unschedulable", cancel, || {
                    self.cluster.clear_unschedulable(&placement.pod)
                })
                .await?;
        }

        for pool in ctx.nodepools.iter() {
            let (extra, count) = launched.get(&pool.name).copied().unwrap_or_default();
            let status = NodePoolStatus {
                usage: ctx.state.nodepool_usage(&pool.name).add(&extra),
                nodes: ctx.state.nodepool_size(&pool.name) + count,
            };
            self.backoff
                .retry("update nodepool status", cancel, || {
                    self.cluster.update_nodepool_status(&pool.name, status.clone())
                })
                .await?;
        }

        if !outcome.is_noop() {
            info!(
                claims = outcome.claims.len(),
                placed = outcome.placed,
                unschedulable = outcome.unschedulable.len(),
                "provisioning pass complete"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::lifecycle::ClaimPhase;
    use crate::provider::InMemoryProvider;
    use claw_provisioning::{CapacityType, InstanceType, NodePool, Pod, SchedulingPolicy};

    fn catalog_types() -> Vec<InstanceType> {
        vec![
            InstanceType::new("small", Resources::new().with_cpu(2).with_memory_gib(8))
                .with_offering("zone-a", CapacityType::OnDemand, 0.05),
            InstanceType::new("large", Resources::new().with_cpu(8).with_memory_gib(32))
                .with_offering("zone-a", CapacityType::OnDemand, 0.15),
        ]
    }

    fn cpu_pod(name: &str, cpu: u64) -> Pod {
        Pod::new("default", name)
            .with_requests(Resources::new().with_cpu(cpu))
            .with_owner("ReplicaSet", "web")
    }

    async fn capture(
        provider: &InMemoryProvider,
        cluster: &InMemoryCluster,
        store: &NodeClaimStore,
    ) -> ReconcileContext {
        ReconcileContext::capture(
            provider,
            cluster,
            store,
            &Backoff::default(),
            SchedulingPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .expect("capture")
    }

    #[tokio::test]
    async fn three_three_cpu_pods_need_two_large_nodes() {
        let cluster = Arc::new(
            InMemoryCluster::new()
                .with_nodepool(NodePool::new("default"))
                .with_pod(cpu_pod("a", 3))
                .with_pod(cpu_pod("b", 3))
                .with_pod(cpu_pod("c", 3)),
        );
        let provider = InMemoryProvider::new(catalog_types());
        let store = Arc::new(NodeClaimStore::new());
        let provisioner = Provisioner::new(Arc::clone(&cluster), Arc::clone(&store), Backoff::default());

        let ctx = capture(&provider, &cluster, &store).await;
        let outcome = provisioner
            .provision(&ctx, &CancellationToken::new())
            .await
            .expect("provision");

        assert_eq!(outcome.claims.len(), 2);
        assert!(outcome.unschedulable.is_empty());
        for claim in store.list() {
            assert_eq!(claim.offering.instance_type, "large");
            assert_eq!(claim.phase, ClaimPhase::Pending);
            assert!(cluster.claim(claim.id).is_some());
        }
        let status = cluster.nodepool_status("default").expect("status");
        assert_eq!(status.nodes, 2);
        assert_eq!(status.usage.cpu_millis, 16_000);
    }

    #[tokio::test]
    async fn in_flight_claims_are_not_provisioned_twice() {
        let cluster = Arc::new(
            InMemoryCluster::new()
                .with_nodepool(NodePool::new("default"))
                .with_pod(cpu_pod("a", 3))
                .with_pod(cpu_pod("b", 3)),
        );
        let provider = InMemoryProvider::new(catalog_types());
        let store = Arc::new(NodeClaimStore::new());
        let provisioner = Provisioner::new(Arc::clone(&cluster), Arc::clone(&store), Backoff::default());
        let cancel = CancellationToken::new();

        let first = provisioner
            .provision(&capture(&provider, &cluster, &store).await, &cancel)
            .await
            .expect("first pass");
        assert_eq!(first.claims.len(), 1);

        let second = provisioner
            .provision(&capture(&provider, &cluster, &store).await, &cancel)
            .await
            .expect("second pass");
        assert!(second.claims.is_empty());
        assert_eq!(second.placed, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn infeasible_pods_get_a_condition() {
        let cluster = Arc::new(
            InMemoryCluster::new()
                .with_nodepool(NodePool::new("default"))
                .with_pod(cpu_pod("huge", 64)),
        );
        let provider = InMemoryProvider::new(catalog_types());
        let store = Arc::new(NodeClaimStore::new());
        let provisioner = Provisioner::new(Arc::clone(&cluster), Arc::clone(&store), Backoff::default());

        let outcome = provisioner
            .provision(&capture(&provider, &cluster, &store).await, &CancellationToken::new())
            .await
            .expect("provision");

        assert!(outcome.claims.is_empty());
        let key = PodKey::new("default", "huge");
        let condition = cluster.unschedulable(&key).expect("condition");
        assert_eq!(condition.reason, "insufficient capacity");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn empty_catalog_reports_no_offerings() {
        let cluster = Arc::new(
            InMemoryCluster::new()
                .with_nodepool(NodePool::new("default"))
                .with_pod(cpu_pod("a", 1)),
        );
        let provider = InMemoryProvider::new(Vec::new());
        let store = Arc::new(NodeClaimStore::new());
        let provisioner = Provisioner::new(Arc::clone(&cluster), Arc::clone(&store), Backoff::default());

        let outcome = provisioner
            .provision(&capture(&provider, &cluster, &store).await, &CancellationToken::new())
            .await
            .expect("provision");

        assert_eq!(
            outcome.unschedulable.get(&PodKey::new("default", "a")).map(String::as_str),
            Some("no offerings")
        );
    }
}
