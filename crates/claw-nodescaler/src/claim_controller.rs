//! Drives NodeClaims from `Pending` to `Ready`.
//!
//! Each reconcile advances a claim as far as the world allows: launch the
//! instance, wait for its node to register, wait for startup taints to clear
//! and for the node to report ready. A claim that cannot launch, or whose
//! instance never registers, is failed and its instance torn down so nothing
//! is left billing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use claw_provisioning::Node;
use claw_provisioning::taints::TAINT_NOT_READY;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::cluster::ClusterClient;
use crate::config::LifecycleConfig;
use crate::error::{ControllerError, Result};
use crate::lifecycle::{ClaimId, ClaimPhase, ConditionKind, NodeClaim, NodeClaimStore};
use crate::provider::{CloudProvider, InstanceState, LaunchRequest};
use crate::queue::{ReconcileOutcome, Reconciler};
use crate::termination::Terminator;

enum Step {
    Advanced,
    Wait,
    Done,
}

/// Lifecycle reconciler keyed by [`ClaimId`].
#[derive(Debug)]
pub struct ClaimReconciler<P, C> {
    provider: Arc<P>,
    cluster: Arc<C>,
    store: Arc<NodeClaimStore>,
    terminator: Arc<Terminator<P, C>>,
    backoff: Backoff,
    registration_timeout: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl<P: CloudProvider, C: ClusterClient> ClaimReconciler<P, C> {
    /// Creates a reconciler. `cancel` aborts in-flight collaborator calls.
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        cluster: Arc<C>,
        store: Arc<NodeClaimStore>,
        terminator: Arc<Terminator<P, C>>,
        backoff: Backoff,
        config: &LifecycleConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            cluster,
            store,
            terminator,
            backoff,
            registration_timeout: config.registration_timeout(),
            poll_interval: config.poll_interval(),
            cancel,
        }
    }

    async fn step(&self, claim: &NodeClaim) -> Result<Step> {
        match claim.phase {
            ClaimPhase::Pending => self.launch(claim).await,
            ClaimPhase::Launched => self.register(claim).await,
            ClaimPhase::Registered => self.initialize(claim).await,
            ClaimPhase::Initialized => self.mark_ready(claim).await,
            ClaimPhase::Terminating => {
                self.terminator.terminate(claim.id, &self.cancel).await?;
                Ok(Step::Done)
            }
            // Disrupting claims belong to the orchestrator or the
            // interruption handler.
            ClaimPhase::Ready
            | ClaimPhase::Disrupting
            | ClaimPhase::Terminated
            | ClaimPhase::Failed => Ok(Step::Done),
        }
    }

    async fn launch(&self, claim: &NodeClaim) -> Result<Step> {
        let request = LaunchRequest::for_claim(claim);
        let request = &request;
        let created = self
            .backoff
            .retry("create instance", &self.cancel, || async move {
                self.provider.create(request).await.map_err(Into::into)
            })
            .await;

        let instance = match created {
            Ok(instance) => instance,
            Err(e @ ControllerError::Cancelled { .. }) => return Err(e),
            Err(e) if e.is_retryable() && !matches!(e, ControllerError::Timeout { .. }) => {
                // Transient: stay pending and try again later.
                warn!(claim = %claim.id, error = %e, "launch deferred");
                return Err(e);
            }
            Err(e) => {
                self.fail(claim, &format!("launch failed: {e}")).await?;
                return Ok(Step::Done);
            }
        };

        self.store.bind_provider(claim.id, &instance.provider_id)?;
        let now = Utc::now();
        let deadline = now
            + ChronoDuration::from_std(self.registration_timeout).unwrap_or_else(|_| ChronoDuration::zero());
        self.store.update(claim.id, |c| {
            c.capacity = instance.capacity;
            c.allocatable = instance.allocatable;
            c.launched_at = Some(now);
            c.registration_deadline = Some(deadline);
            c.set_condition(ConditionKind::Launched, true, "instance launched", now);
        })?;
        self.store.transition(claim.id, ClaimPhase::Launched, false)?;
        self.terminator.publish(claim.id, &self.cancel).await?;
        info!(
            claim = %claim.id,
            provider_id = %instance.provider_id,
            instance_type = %instance.instance_type,
            zone = %instance.zone,
            "claim launched"
        );
        Ok(Step::Advanced)
    }

    async fn register(&self, claim: &NodeClaim) -> Result<Step> {
        let Some(provider_id) = claim.provider_id.as_deref() else {
            self.fail(claim, "launched without a provider instance").await?;
            return Ok(Step::Done);
        };
        let node = self
            .backoff
            .retry("lookup node", &self.cancel, || self.cluster.node_by_provider_id(provider_id))
            .await?;

        let Some(node) = node else {
            let now = Utc::now();
            if claim.registration_deadline.is_some_and(|d| now > d) {
                self.fail(claim, "node did not register before the deadline").await?;
                return Ok(Step::Done);
            }
            debug!(claim = %claim.id, provider_id, "waiting for node registration");
            return Ok(Step::Wait);
        };

        self.store.bind_node(claim.id, &node.name)?;
        self.store.update(claim.id, |c| {
            c.set_condition(ConditionKind::Registered, true, "node registered", Utc::now());
        })?;
        self.store.transition(claim.id, ClaimPhase::Registered, false)?;
        self.terminator.publish(claim.id, &self.cancel).await?;
        Ok(Step::Advanced)
    }

    async fn initialize(&self, claim: &NodeClaim) -> Result<Step> {
        let Some(node) = self.node_of(claim).await? else {
            return Ok(Step::Wait);
        };
        if !claim.requirements.matches_labels(&node.labels) {
            debug!(claim = %claim.id, node = %node.name, "node labels do not match claim yet");
            return Ok(Step::Wait);
        }
        let starting = claim
            .startup_taints
            .iter()
            .any(|st| node.taints.iter().any(|t| t.matches(st)));
        if starting || node.allocatable.is_zero() {
            debug!(claim = %claim.id, node = %node.name, "node still initializing");
            return Ok(Step::Wait);
        }

        self.store.update(claim.id, |c| {
            c.set_condition(ConditionKind::Initialized, true, "node initialized", Utc::now());
        })?;
        self.store.transition(claim.id, ClaimPhase::Initialized, false)?;
        self.terminator.publish(claim.id, &self.cancel).await?;
        Ok(Step::Advanced)
    }

    async fn mark_ready(&self, claim: &NodeClaim) -> Result<Step> {
        let Some(node) = self.node_of(claim).await? else {
            return Ok(Step::Wait);
        };
        if !node.ready || node.taints.iter().any(|t| t.key == TAINT_NOT_READY) {
            return Ok(Step::Wait);
        }

        self.store.update(claim.id, |c| {
            c.set_condition(ConditionKind::Ready, true, "node ready", Utc::now());
        })?;
        self.store.transition(claim.id, ClaimPhase::Ready, false)?;
        self.terminator.publish(claim.id, &self.cancel).await?;
        info!(claim = %claim.id, node = %node.name, "claim ready");
        Ok(Step::Done)
    }

    async fn node_of(&self, claim: &NodeClaim) -> Result<Option<Node>> {
        let Some(provider_id) = claim.provider_id.as_deref() else {
            return Ok(None);
        };
        self.backoff
            .retry("lookup node", &self.cancel, || self.cluster.node_by_provider_id(provider_id))
            .await
    }

    /// Fails a `Pending` or `Launched` claim and deletes whatever the
    /// provider created for it.
    async fn fail(&self, claim: &NodeClaim, reason: &str) -> Result<()> {
        warn!(claim = %claim.id, name = %claim.name, reason, "claim failed");
        let instances = self
            .backoff
            .retry("list instances", &self.cancel, || async move {
                self.provider.list_instances().await.map_err(Into::into)
            })
            .await?;
        for instance in instances
            .iter()
            .filter(|i| i.claim_id == claim.id && i.state != InstanceState::Terminated)
        {
            self.terminator
                .delete_instance(&instance.provider_id, &self.cancel)
                .await?;
        }

        let kind = if claim.phase == ClaimPhase::Pending {
            ConditionKind::Launched
        } else {
            ConditionKind::Registered
        };
        self.store.update(claim.id, |c| {
            c.set_condition(kind, false, reason, Utc::now());
        })?;
        self.store.transition(claim.id, ClaimPhase::Failed, false)?;
        self.terminator.publish(claim.id, &self.cancel).await
    }

    /// Deletes provider instances no live claim accounts for.
    ///
    /// # Errors
    ///
    /// Returns error if the provider keeps failing.
    pub async fn collect_orphans(&self) -> Result<Vec<String>> {
        let instances = self
            .backoff
            .retry("list instances", &self.cancel, || async move {
                self.provider.list_instances().await.map_err(Into::into)
            })
            .await?;

        let mut deleted = Vec::new();
        for instance in instances.iter().filter(|i| i.state != InstanceState::Terminated) {
            let owner = self
                .store
                .by_provider_id(&instance.provider_id)
                .or_else(|| self.store.get(instance.claim_id));
            if owner.is_some_and(|c| !c.phase.is_terminal()) {
                continue;
            }
            warn!(provider_id = %instance.provider_id, "deleting orphaned instance");
            self.terminator
                .delete_instance(&instance.provider_id, &self.cancel)
                .await?;
            deleted.push(instance.provider_id.clone());
        }
        Ok(deleted)
    }
}

impl<P: CloudProvider, C: ClusterClient> Reconciler for ClaimReconciler<P, C> {
    type Key = ClaimId;

    fn name(&self) -> &'static str {
        "nodeclaim"
    }

    async fn reconcile(&self, key: &ClaimId) -> Result<ReconcileOutcome> {
        loop {
            let Some(claim) = self.store.get(*key) else {
                return Ok(ReconcileOutcome::Done);
            };
            match self.step(&claim).await? {
                Step::Advanced => {}
                Step::Wait => return Ok(ReconcileOutcome::RequeueAfter(self.poll_interval)),
                Step::Done => return Ok(ReconcileOutcome::Done),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::error::ProviderError;
    use crate::lifecycle::testing::claim;
    use crate::provider::InMemoryProvider;
    use claw_provisioning::requirements::LABEL_INSTANCE_TYPE;
    use claw_provisioning::{
        CapacityType, InstanceType, Requirement, Requirements, Resources, Taint, TaintEffect,
    };

    struct Fixture {
        provider: Arc<InMemoryProvider>,
        cluster: Arc<InMemoryCluster>,
        store: Arc<NodeClaimStore>,
        reconciler: ClaimReconciler<InMemoryProvider, InMemoryCluster>,
    }

    fn fixture(config: &LifecycleConfig) -> Fixture {
        let provider = Arc::new(InMemoryProvider::new(vec![
            InstanceType::new("medium", Resources::new().with_cpu(4))
                .with_offering("zone-a", CapacityType::OnDemand, 0.1),
        ]));
        let cluster = Arc::new(InMemoryCluster::new());
        let store = Arc::new(NodeClaimStore::new());
        let backoff = Backoff::default()
            .with_delays(Duration::from_millis(1), Duration::from_millis(2))
            .with_max_attempts(2);
        let terminator = Arc::new(Terminator::new(
            Arc::clone(&provider),
            Arc::clone(&cluster),
            Arc::clone(&store),
            backoff.clone(),
        ));
        let reconciler = ClaimReconciler::new(
            Arc::clone(&provider),
            Arc::clone(&cluster),
            Arc::clone(&store),
            terminator,
            backoff,
            config,
            CancellationToken::new(),
        );
        Fixture {
            provider,
            cluster,
            store,
            reconciler,
        }
    }

    fn pending(store: &NodeClaimStore) -> ClaimId {
        let mut c = claim("default-abc", "default", ClaimPhase::Pending);
        c.requirements =
            Requirements::new().with(Requirement::in_values(LABEL_INSTANCE_TYPE, ["medium"]));
        c.startup_taints = vec![Taint::new("example.com/agent-starting", TaintEffect::NoSchedule)];
        store.insert(c).expect("insert")
    }

    fn phase(f: &Fixture, id: ClaimId) -> Option<ClaimPhase> {
        f.store.get(id).map(|c| c.phase)
    }

    #[tokio::test]
    async fn claim_walks_to_ready() {
        let f = fixture(&LifecycleConfig::default());
        let id = pending(&f.store);

        let outcome = f.reconciler.reconcile(&id).await.expect("launch");
        assert!(matches!(outcome, ReconcileOutcome::RequeueAfter(_)));
        assert_eq!(phase(&f, id), Some(ClaimPhase::Launched));
        let instance = f.provider.running().pop().expect("instance");

        // The node registers still carrying its startup taint
        f.cluster.add_node(instance.to_node());
        f.reconciler.reconcile(&id).await.expect("register");
        assert_eq!(phase(&f, id), Some(ClaimPhase::Registered));

        f.cluster
            .untaint_node(&instance.name, "example.com/agent-starting")
            .await
            .expect("untaint");
        let outcome = f.reconciler.reconcile(&id).await.expect("ready");
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(phase(&f, id), Some(ClaimPhase::Ready));

        let published = f.cluster.claim(id).expect("published");
        assert_eq!(published.phase, ClaimPhase::Ready);
        assert_eq!(published.node_name.as_deref(), Some(instance.name.as_str()));
        for kind in [
            ConditionKind::Launched,
            ConditionKind::Registered,
            ConditionKind::Initialized,
            ConditionKind::Ready,
        ] {
            assert!(published.is_condition_true(kind), "{kind:?}");
        }
    }

    #[tokio::test]
    async fn rejected_launch_fails_the_claim() {
        let f = fixture(&LifecycleConfig::default());
        let id = pending(&f.store);
        f.provider.fail_next(ProviderError::Rejected {
            reason: "quota exceeded".into(),
        });

        let outcome = f.reconciler.reconcile(&id).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(phase(&f, id), Some(ClaimPhase::Failed));
        assert!(f.provider.running().is_empty());
    }

    #[tokio::test]
    async fn transient_launch_errors_keep_the_claim_pending() {
        let f = fixture(&LifecycleConfig::default());
        let id = pending(&f.store);
        for _ in 0..2 {
            f.provider.fail_next(ProviderError::Transient {
                reason: "throttled".into(),
            });
        }

        let err = f.reconciler.reconcile(&id).await.expect_err("transient");
        assert!(err.is_retryable());
        assert_eq!(phase(&f, id), Some(ClaimPhase::Pending));

        f.reconciler.reconcile(&id).await.expect("retry");
        assert_eq!(phase(&f, id), Some(ClaimPhase::Launched));
    }

    #[tokio::test]
    async fn registration_timeout_tears_down_the_instance() {
        let config = LifecycleConfig {
            registration_timeout_secs: 0,
            ..LifecycleConfig::default()
        };
        let f = fixture(&config);
        let id = pending(&f.store);

        for _ in 0..3 {
            if f.reconciler.reconcile(&id).await.expect("reconcile") == ReconcileOutcome::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(phase(&f, id), Some(ClaimPhase::Failed));
        assert_eq!(f.provider.create_count(), 1);
        assert!(f.provider.running().is_empty());
    }

    #[tokio::test]
    async fn orphaned_instances_are_collected() {
        let f = fixture(&LifecycleConfig::default());
        let id = pending(&f.store);
        f.reconciler.reconcile(&id).await.expect("launch");

        let stray = claim("stray", "default", ClaimPhase::Pending);
        f.provider
            .create(&LaunchRequest::for_claim(&stray))
            .await
            .expect("create");

        let deleted = f.reconciler.collect_orphans().await.expect("gc");
        assert_eq!(deleted.len(), 1);
        let running = f.provider.running();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].claim_id, id);
    }

    #[tokio::test]
    async fn unknown_claims_are_done() {
        let f = fixture(&LifecycleConfig::default());
        let outcome = f.reconciler.reconcile(&ClaimId::new()).await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Done);
    }
}
