//! Top-level controller loop.
//!
//! Wires the provisioner, the claim lifecycle reconciler, disruption
//! orchestration and interruption handling to one set of collaborators and
//! drives them on intervals. Only the leader acts: a standby replica keeps
//! its timers and workers running but drops every tick and key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::claim_controller::ClaimReconciler;
use crate::cluster::ClusterClient;
use crate::config::ControllerConfig;
use crate::context::ReconcileContext;
use crate::disruption::{CommandId, DisruptionPlan, Orchestrator, Planner, mark_conditions};
use crate::error::{ControllerError, Result};
use crate::interruption::InterruptionHandler;
use crate::lifecycle::{ClaimId, ClaimPhase, NodeClaimStore};
use crate::provider::CloudProvider;
use crate::provisioner::{Provisioner, ProvisioningOutcome};
use crate::queue::{WorkQueue, WorkerPool};
use crate::termination::Terminator;

/// What a disruption pass decided and started.
#[derive(Debug, Clone, Default)]
pub struct DisruptionPass {
    /// The plan as computed.
    pub plan: DisruptionPlan,
    /// Commands the orchestrator accepted.
    pub started: Vec<CommandId>,
}

/// The node controller.
#[derive(Debug)]
pub struct Controller<P, C> {
    provider: Arc<P>,
    cluster: Arc<C>,
    store: Arc<NodeClaimStore>,
    config: ControllerConfig,
    backoff: Backoff,
    claims: WorkQueue<ClaimId>,
    commands: WorkQueue<CommandId>,
    provisioner: Provisioner<C>,
    reconciler: Arc<ClaimReconciler<P, C>>,
    orchestrator: Arc<Orchestrator<P, C>>,
    interruptions: Arc<InterruptionHandler<P, C>>,
    cancel: CancellationToken,
}

impl<P: CloudProvider, C: ClusterClient> Controller<P, C> {
    /// Creates a controller. Cancelling `cancel` stops [`Controller::run`]
    /// and aborts in-flight collaborator calls.
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        cluster: Arc<C>,
        store: Arc<NodeClaimStore>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = Backoff::from_config(&config.backoff);
        let claims = WorkQueue::new();
        let commands = WorkQueue::new();
        let terminator = Arc::new(Terminator::new(
            Arc::clone(&provider),
            Arc::clone(&cluster),
            Arc::clone(&store),
            backoff.clone(),
        ));
        let provisioner = Provisioner::new(Arc::clone(&cluster), Arc::clone(&store), backoff.clone());
        let reconciler = Arc::new(ClaimReconciler::new(
            Arc::clone(&provider),
            Arc::clone(&cluster),
            Arc::clone(&store),
            Arc::clone(&terminator),
            backoff.clone(),
            &config.lifecycle,
            cancel.clone(),
        ));
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::clone(&cluster),
                Arc::clone(&store),
                Arc::clone(&terminator),
                backoff.clone(),
                cancel.clone(),
            )
            .with_claim_queue(claims.clone())
            .with_config(&config.disruption, &config.lifecycle),
        );
        let interruptions = Arc::new(InterruptionHandler::new(
            Arc::clone(&cluster),
            Arc::clone(&store),
            terminator,
            backoff.clone(),
        ));

        Self {
            provider,
            cluster,
            store,
            config,
            backoff,
            claims,
            commands,
            provisioner,
            reconciler,
            orchestrator,
            interruptions,
            cancel,
        }
    }

    /// The claim store.
    #[must_use]
    pub fn store(&self) -> &Arc<NodeClaimStore> {
        &self.store
    }

    /// The disruption orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator<P, C>> {
        &self.orchestrator
    }

    /// Captures a fresh context.
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator call fails after retries.
    pub async fn capture(&self) -> Result<ReconcileContext> {
        ReconcileContext::capture(
            &*self.provider,
            &*self.cluster,
            &self.store,
            &self.backoff,
            self.config.scheduling.policy(),
            &self.cancel,
        )
        .await
    }

    /// Runs one provisioning pass and queues the claims it created.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Timeout`] if the pass exceeds its budget,
    /// or the first collaborator failure.
    pub async fn provisioning_pass(&self) -> Result<ProvisioningOutcome> {
        self.bounded("provisioning pass", async {
            let ctx = self.capture().await?;
            let outcome = self.provisioner.provision(&ctx, &self.cancel).await?;
            for id in &outcome.claims {
                self.claims.add(*id);
            }
            Ok(outcome)
        })
        .await
    }

    /// Runs one disruption pass: refreshes claim conditions, plans and
    /// starts commands.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Timeout`] if the pass exceeds its budget,
    /// or the first collaborator failure while capturing.
    pub async fn disruption_pass(&self) -> Result<DisruptionPass> {
        if !self.config.disruption.enabled {
            return Ok(DisruptionPass::default());
        }
        self.bounded("disruption pass", async {
            let now = Utc::now();
            let ctx = self.capture().await?;
            let changed = mark_conditions(&self.store, &ctx, now);
            let ctx = ctx.with_claims(self.store.list()).at(now);
            let plan = Planner::new(&ctx, &self.config.disruption, now).plan();
            debug!(
                conditions_changed = changed,
                commands = plan.commands.len(),
                deferred = plan.deferred.len(),
                blocked = plan.blocked.len(),
                rejected = plan.rejected.len(),
                "disruption planned"
            );

            let mut started = Vec::new();
            for command in plan.commands.iter().cloned() {
                let id = command.id;
                match self.orchestrator.start(command, &ctx).await {
                    Ok(Some(id)) => {
                        self.commands.add(id);
                        started.push(id);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(command = %id, error = %e, "disruption command failed to start"),
                }
            }
            Ok(DisruptionPass { plan, started })
        })
        .await
    }

    /// Requeues claims and commands that still have work, repairs
    /// disruptions a cut-short pass or notice left behind, prunes old
    /// terminal claims and finished commands, and deletes orphaned
    /// instances.
    pub async fn housekeeping(&self) {
        match self.orchestrator.recover_orphans().await {
            Ok(ids) if !ids.is_empty() => info!(claims = ids.len(), "orphaned disruptions rolled back"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "orphaned disruption recovery failed"),
        }
        match self.interruptions.recover(&self.cancel).await {
            Ok(ids) if !ids.is_empty() => info!(claims = ids.len(), "stranded interruptions finished"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "interruption recovery failed"),
        }

        for claim in self.store.list() {
            if claim.phase.is_launching() || claim.phase == ClaimPhase::Terminating {
                self.claims.add(claim.id);
            }
        }
        for id in self.orchestrator.in_progress() {
            self.commands.add(id);
        }

        let retention = ChronoDuration::from_std(Duration::from_secs(
            self.config.lifecycle.terminal_retention_secs,
        ))
        .unwrap_or(ChronoDuration::MAX);
        let pruned = self.store.prune_terminal(retention, Utc::now());
        let finished = self.orchestrator.prune_finished();
        if pruned > 0 || finished > 0 {
            debug!(claims = pruned, commands = finished, "pruned");
        }

        if let Err(e) = self.reconciler.collect_orphans().await {
            warn!(error = %e, "orphan collection failed");
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        pass: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let budget = self.config.pass_timeout();
        tokio::time::timeout(budget, pass)
            .await
            .map_err(|_| ControllerError::Timeout {
                operation: operation.to_string(),
                after_secs: budget.as_secs(),
            })?
    }

    /// Runs until cancelled. Passes and workers only act while `leader`
    /// reads true.
    pub async fn run(&self, leader: watch::Receiver<bool>) {
        let claim_workers = WorkerPool::spawn(
            Arc::clone(&self.reconciler),
            self.claims.clone(),
            self.config.workers,
            self.backoff.clone(),
            leader.clone(),
            self.cancel.clone(),
        );
        let command_workers = WorkerPool::spawn(
            Arc::clone(&self.orchestrator),
            self.commands.clone(),
            self.config.workers,
            self.backoff.clone(),
            leader.clone(),
            self.cancel.clone(),
        );
        let interruptions = {
            let handler = Arc::clone(&self.interruptions);
            let events = self.provider.subscribe_interruptions();
            let leader = leader.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move { handler.run(events, leader, cancel).await })
        };

        let mut provisioning = interval(Duration::from_secs(self.config.provisioning.interval_secs));
        let mut disruption = interval(Duration::from_secs(self.config.disruption.interval_secs));
        let mut housekeeping = interval(self.config.lifecycle.poll_interval());
        for timer in [&mut provisioning, &mut disruption, &mut housekeeping] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(workers = self.config.workers, "controller started");
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = provisioning.tick() => {
                    if !*leader.borrow() {
                        continue;
                    }
                    match self.provisioning_pass().await {
                        Ok(outcome) if !outcome.is_noop() => info!(
                            claims = outcome.claims.len(),
                            placed = outcome.placed,
                            unschedulable = outcome.unschedulable.len(),
                            "provisioning pass"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "provisioning pass failed"),
                    }
                }
                _ = disruption.tick() => {
                    if !*leader.borrow() {
                        continue;
                    }
                    match self.disruption_pass().await {
                        Ok(pass) if !pass.started.is_empty() => {
                            info!(commands = pass.started.len(), "disruption pass");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "disruption pass failed"),
                    }
                }
                _ = housekeeping.tick() => {
                    if *leader.borrow() {
                        self.housekeeping().await;
                    }
                }
            }
        }

        self.claims.shut_down();
        self.commands.shut_down();
        claim_workers.join().await;
        command_workers.join().await;
        if let Err(e) = interruptions.await {
            error!(error = %e, "interruption task failed");
        }
        info!("controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::disruption::CommandPhase;
    use crate::lifecycle::testing::claim;
    use crate::provider::{InMemoryProvider, LaunchRequest};
    use claw_provisioning::{
        Budget, CapacityType, DisruptionMethod, DisruptionPolicy, InstanceType, NodePool, Pod,
        Resources, Taint,
    };

    fn pool() -> NodePool {
        NodePool::new("default").with_disruption(DisruptionPolicy {
            consolidate_after_secs: 0,
            budgets: vec![Budget::new("100%")],
            ..DisruptionPolicy::default()
        })
    }

    fn controller(
        cluster: InMemoryCluster,
    ) -> (
        Arc<InMemoryProvider>,
        Arc<InMemoryCluster>,
        Controller<InMemoryProvider, InMemoryCluster>,
        CancellationToken,
    ) {
        let provider = Arc::new(InMemoryProvider::new(vec![
            InstanceType::new("medium", Resources::new().with_cpu(4).with_memory_gib(16))
                .with_offering("zone-a", CapacityType::OnDemand, 0.1),
        ]));
        let cluster = Arc::new(cluster.with_nodepool(pool()));
        let cancel = CancellationToken::new();
        let controller = Controller::new(
            Arc::clone(&provider),
            Arc::clone(&cluster),
            Arc::new(NodeClaimStore::new()),
            ControllerConfig::default(),
            cancel.clone(),
        );
        (provider, cluster, controller, cancel)
    }

    fn pending(name: &str) -> Pod {
        Pod::new("default", name)
            .with_owner("ReplicaSet", "web")
            .with_requests(Resources::new().with_cpu(1))
    }

    #[tokio::test]
    async fn provisioning_pass_queues_new_claims() {
        let (_, _, controller, _) = controller(InMemoryCluster::new().with_pod(pending("w1")));
        let outcome = controller.provisioning_pass().await.expect("pass");
        assert_eq!(outcome.claims.len(), 1);
        assert_eq!(controller.claims.len(), 1);
        assert_eq!(controller.store.len(), 1);
    }

    #[tokio::test]
    async fn disruption_pass_starts_commands_for_empty_nodes() {
        let (provider, cluster, controller, _) = controller(InMemoryCluster::new());
        let mut c = claim("a", "default", ClaimPhase::Ready);
        let instance = provider.create(&LaunchRequest::for_claim(&c)).await.expect("create");
        c.provider_id = Some(instance.provider_id.clone());
        c.node_name = Some("a".to_string());
        cluster.add_node(instance.to_node());
        let id = controller.store.insert(c).expect("insert");

        let pass = controller.disruption_pass().await.expect("pass");

        assert_eq!(pass.started.len(), 1);
        assert_eq!(pass.plan.commands[0].method, DisruptionMethod::Emptiness);
        assert_eq!(controller.commands.len(), 1);
        assert_eq!(
            controller.orchestrator.phase(pass.started[0]),
            Some(CommandPhase::Draining)
        );
        assert_eq!(controller.store.get(id).map(|c| c.phase), Some(ClaimPhase::Disrupting));
    }

    async fn ready_node(
        provider: &InMemoryProvider,
        cluster: &InMemoryCluster,
        controller: &Controller<InMemoryProvider, InMemoryCluster>,
        name: &str,
    ) -> ClaimId {
        let mut c = claim(name, "default", ClaimPhase::Ready);
        let instance = provider.create(&LaunchRequest::for_claim(&c)).await.expect("create");
        c.provider_id = Some(instance.provider_id.clone());
        c.node_name = Some(name.to_string());
        cluster.add_node(instance.to_node());
        controller.store.insert(c).expect("insert")
    }

    #[tokio::test]
    async fn housekeeping_repairs_cut_short_disruptions() {
        let (provider, cluster, controller, _) = controller(InMemoryCluster::new());
        let voluntary = ready_node(&provider, &cluster, &controller, "a").await;
        let interrupted = ready_node(&provider, &cluster, &controller, "b").await;

        // A pass timed out inside start, and a notice failed after the claim
        // was forced into Disrupting.
        controller
            .store
            .begin_disrupting(&[voluntary], DisruptionMethod::Consolidation, Utc::now())
            .expect("disrupt");
        cluster.taint_node("a", &Taint::disrupted()).await.expect("taint");
        controller
            .store
            .begin_disrupting(&[interrupted], DisruptionMethod::Interruption, Utc::now())
            .expect("interrupt");

        controller.housekeeping().await;

        let restored = controller.store.get(voluntary).expect("claim");
        assert_eq!(restored.phase, ClaimPhase::Ready);
        assert_eq!(restored.disruption, None);
        assert!(cluster.node("a").is_some_and(|n| !n.is_disrupted()));
        assert_eq!(
            controller.store.get(interrupted).map(|c| c.phase),
            Some(ClaimPhase::Terminated)
        );
        assert_eq!(provider.running().len(), 1);
    }

    #[tokio::test]
    async fn disabled_disruption_plans_nothing() {
        let (_, _, mut controller, _) = controller(InMemoryCluster::new());
        controller.config.disruption.enabled = false;
        let pass = controller.disruption_pass().await.expect("pass");
        assert!(pass.plan.is_empty());
        assert!(pass.started.is_empty());
    }

    #[tokio::test]
    async fn standby_replicas_do_nothing() {
        let (_, _, controller, cancel) = controller(InMemoryCluster::new().with_pod(pending("w1")));
        let controller = Arc::new(controller);
        let (_leader_tx, leader) = watch::channel(false);
        let task = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(leader).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.expect("join");
        assert!(controller.store.is_empty());
    }

    #[tokio::test]
    async fn leaders_provision_until_cancelled() {
        let (_, _, controller, cancel) = controller(InMemoryCluster::new().with_pod(pending("w1")));
        let controller = Arc::new(controller);
        let (_leader_tx, leader) = watch::channel(true);
        let task = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(leader).await })
        };
        for _ in 0..200 {
            if controller
                .store
                .list()
                .iter()
                .any(|c| c.phase == ClaimPhase::Launched)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.expect("join");
        let claims = controller.store.list();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].phase, ClaimPhase::Launched);
    }
}
