//! Executes disruption commands.
//!
//! A command locks its nodes, moves their claims to `Disrupting`, taints
//! the nodes and launches any replacements. Once every replacement is
//! `Ready` the nodes are drained and torn down. A replacement that fails,
//! a pod that opts out mid-drain or a drain that overruns its timeout
//! aborts the command: the claims go back to `Ready` and the taint is lifted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_provisioning::taints::TAINT_DISRUPTED;
use claw_provisioning::{DisruptionMethod, Pod, Taint};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::methods::{Command, CommandId};
use crate::backoff::Backoff;
use crate::cluster::{ClusterClient, EvictionOutcome};
use crate::config::{DisruptionConfig, LifecycleConfig};
use crate::context::ReconcileContext;
use crate::error::{ControllerError, Result};
use crate::lifecycle::{ClaimId, ClaimPhase, ConditionKind, NodeClaim, NodeClaimStore};
use crate::locks::{KeyGuard, KeyLocks};
use crate::provider::CloudProvider;
use crate::queue::{ReconcileOutcome, Reconciler, WorkQueue};
use crate::termination::Terminator;

/// Where a command is in its execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPhase {
    /// Replacement claims are launching.
    WaitingForReplacements,
    /// Pods are being evicted from the targets.
    Draining,
    /// Target instances and nodes are being deleted.
    Terminating,
    /// Every target is gone.
    Completed,
    /// The command was rolled back.
    Aborted,
}

impl CommandPhase {
    /// Returns true for `Completed` and `Aborted`.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl std::fmt::Display for CommandPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WaitingForReplacements => "waiting-for-replacements",
            Self::Draining => "draining",
            Self::Terminating => "terminating",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
struct Progress {
    command: Command,
    phase: CommandPhase,
    replacements: Vec<ClaimId>,
    drain_started: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Execution {
    progress: Progress,
    // Held until the command finishes
    guard: Option<KeyGuard>,
}

enum Step {
    Advanced,
    Wait,
    Done,
}

/// Command reconciler keyed by [`CommandId`].
#[derive(Debug)]
pub struct Orchestrator<P, C> {
    cluster: Arc<C>,
    store: Arc<NodeClaimStore>,
    terminator: Arc<Terminator<P, C>>,
    locks: KeyLocks,
    claims: WorkQueue<ClaimId>,
    backoff: Backoff,
    drain_timeout: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
    executions: Mutex<BTreeMap<CommandId, Execution>>,
}

impl<P: CloudProvider, C: ClusterClient> Orchestrator<P, C> {
    /// Creates an orchestrator with default timing and its own locks and
    /// claim queue.
    #[must_use]
    pub fn new(
        cluster: Arc<C>,
        store: Arc<NodeClaimStore>,
        terminator: Arc<Terminator<P, C>>,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            store,
            terminator,
            locks: KeyLocks::new(),
            claims: WorkQueue::new(),
            backoff,
            drain_timeout: DisruptionConfig::default().drain_timeout(),
            poll_interval: LifecycleConfig::default().poll_interval(),
            cancel,
            executions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Shares node locks with other writers.
    #[must_use]
    pub fn with_locks(mut self, locks: KeyLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Queue replacement claims are pushed onto.
    #[must_use]
    pub fn with_claim_queue(mut self, claims: WorkQueue<ClaimId>) -> Self {
        self.claims = claims;
        self
    }

    /// Applies drain timeout and poll interval settings.
    #[must_use]
    pub const fn with_config(mut self, disruption: &DisruptionConfig, lifecycle: &LifecycleConfig) -> Self {
        self.drain_timeout = disruption.drain_timeout();
        self.poll_interval = lifecycle.poll_interval();
        self
    }

    /// Starts executing `command`. Returns `None` without side effects if
    /// its nodes are locked by another command or its claims are no longer
    /// disruptable.
    ///
    /// # Errors
    ///
    /// Returns error if tainting or launching replacements fails; the
    /// command is rolled back first.
    pub async fn start(&self, command: Command, ctx: &ReconcileContext) -> Result<Option<CommandId>> {
        let Some(guard) = self.locks.try_lock_all(command.nodes()) else {
            debug!(command = %command.id, "nodes busy, command skipped");
            return Ok(None);
        };
        if let Err(e) = self
            .store
            .begin_disrupting(&command.claim_ids(), command.method, Utc::now())
        {
            debug!(command = %command.id, error = %e, "claims not disruptable, command skipped");
            return Ok(None);
        }

        let replacements = match self.launch(&command, ctx).await {
            Ok(ids) => ids,
            Err(e) => {
                if let Err(rollback) = self.roll_back(&command, "start failed").await {
                    warn!(command = %command.id, error = %rollback, "rollback failed");
                }
                return Err(e);
            }
        };

        let id = command.id;
        info!(
            command = %id,
            method = %command.method,
            nodes = ?command.nodes(),
            replacements = replacements.len(),
            reason = %command.reason,
            "disruption started"
        );
        let (phase, drain_started) = if replacements.is_empty() {
            (CommandPhase::Draining, Some(Utc::now()))
        } else {
            (CommandPhase::WaitingForReplacements, None)
        };
        self.executions.lock().insert(
            id,
            Execution {
                progress: Progress {
                    command,
                    phase,
                    replacements,
                    drain_started,
                },
                guard: Some(guard),
            },
        );
        Ok(Some(id))
    }

    /// Current phase of a command.
    #[must_use]
    pub fn phase(&self, id: CommandId) -> Option<CommandPhase> {
        self.executions.lock().get(&id).map(|e| e.progress.phase)
    }

    /// Commands not yet finished.
    #[must_use]
    pub fn active(&self) -> usize {
        self.executions
            .lock()
            .values()
            .filter(|e| !e.progress.phase.is_finished())
            .count()
    }

    /// IDs of commands not yet finished.
    #[must_use]
    pub fn in_progress(&self) -> Vec<CommandId> {
        self.executions
            .lock()
            .iter()
            .filter(|(_, e)| !e.progress.phase.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Forgets finished commands, returning how many were dropped.
    pub fn prune_finished(&self) -> usize {
        let mut executions = self.executions.lock();
        let before = executions.len();
        executions.retain(|_, e| !e.progress.phase.is_finished());
        before - executions.len()
    }

    async fn launch(&self, command: &Command, ctx: &ReconcileContext) -> Result<Vec<ClaimId>> {
        let taint = Taint::disrupted();
        let taint = &taint;
        for node in &command.nodes() {
            self.backoff
                .retry("taint node", &self.cancel, || self.cluster.taint_node(node, taint))
                .await?;
        }
        for id in command.claim_ids() {
            self.terminator.publish(id, &self.cancel).await?;
        }

        let now = Utc::now();
        let mut launched = Vec::new();
        for template in &command.replacements {
            let pool = ctx
                .nodepool(&template.nodepool)
                .ok_or_else(|| ControllerError::NodePoolNotFound {
                    name: template.nodepool.clone(),
                })?;
            let instance = ctx
                .catalog
                .instance_type(&template.nodepool, &template.offering.instance_type)
                .ok_or_else(|| ControllerError::InstanceTypeNotFound {
                    nodepool: template.nodepool.clone(),
                    instance_type: template.offering.instance_type.clone(),
                })?;
            let mut claim = NodeClaim::from_template(template, pool, instance);
            claim.set_condition(ConditionKind::Launched, false, "replacement awaiting launch", now);
            let id = self.store.insert(claim)?;
            self.terminator.publish(id, &self.cancel).await?;
            self.claims.add(id);
            launched.push(id);
        }
        Ok(launched)
    }

    fn progress(&self, id: CommandId) -> Option<Progress> {
        self.executions.lock().get(&id).map(|e| e.progress.clone())
    }

    fn advance(&self, id: CommandId, phase: CommandPhase) {
        let mut executions = self.executions.lock();
        if let Some(e) = executions.get_mut(&id) {
            debug!(command = %id, from = %e.progress.phase, to = %phase, "command advanced");
            e.progress.phase = phase;
            if phase == CommandPhase::Draining {
                e.progress.drain_started = Some(Utc::now());
            }
            if phase.is_finished() {
                e.guard = None;
            }
        }
    }

    async fn step(&self, id: CommandId, progress: &Progress) -> Result<Step> {
        match progress.phase {
            CommandPhase::WaitingForReplacements => self.await_replacements(id, progress).await,
            CommandPhase::Draining => self.drain(id, progress).await,
            CommandPhase::Terminating => self.terminate(id, &progress.command).await,
            CommandPhase::Completed | CommandPhase::Aborted => Ok(Step::Done),
        }
    }

    async fn await_replacements(&self, id: CommandId, progress: &Progress) -> Result<Step> {
        let mut ready = true;
        for replacement in &progress.replacements {
            match self.store.get(*replacement) {
                None => {
                    self.abort(id, &progress.command, "replacement claim vanished").await?;
                    return Ok(Step::Done);
                }
                Some(claim) if claim.phase.is_terminal() => {
                    let reason = format!("replacement {} failed to launch", claim.name);
                    self.abort(id, &progress.command, &reason).await?;
                    return Ok(Step::Done);
                }
                Some(claim) => ready &= claim.phase == ClaimPhase::Ready,
            }
        }
        if !ready {
            return Ok(Step::Wait);
        }
        self.advance(id, CommandPhase::Draining);
        Ok(Step::Advanced)
    }

    async fn drain(&self, id: CommandId, progress: &Progress) -> Result<Step> {
        let command = &progress.command;
        let overdue = progress
            .drain_started
            .and_then(|started| (Utc::now() - started).to_std().ok())
            .is_some_and(|elapsed| elapsed > self.drain_timeout);
        if overdue {
            let reason = format!("drain exceeded {}s", self.drain_timeout.as_secs());
            self.abort(id, command, &reason).await?;
            return Ok(Step::Done);
        }

        let nodes: BTreeSet<String> = command.nodes().into_iter().collect();
        let pods = self
            .backoff
            .retry("list pods", &self.cancel, || self.cluster.list_pods())
            .await?;
        let remaining: Vec<Pod> = pods
            .into_iter()
            .filter(|p| p.node_name.as_ref().is_some_and(|n| nodes.contains(n)))
            .filter(|p| !p.is_daemonset() && !p.is_mirror() && !p.is_terminal())
            .collect();

        if let Some(pod) = remaining.iter().find(|p| p.do_not_disrupt()) {
            let reason = format!("pod {} opted out of disruption", pod.key());
            self.abort(id, command, &reason).await?;
            return Ok(Step::Done);
        }
        if remaining.is_empty() {
            self.advance(id, CommandPhase::Terminating);
            return Ok(Step::Advanced);
        }

        let mut blocked = false;
        for pod in &remaining {
            let key = pod.key();
            let key = &key;
            let outcome = self
                .backoff
                .retry("evict pod", &self.cancel, || self.cluster.evict(key))
                .await?;
            if let EvictionOutcome::Blocked { reason } = outcome {
                debug!(command = %id, pod = %key, reason = %reason, "eviction blocked");
                blocked = true;
            }
        }
        Ok(if blocked { Step::Wait } else { Step::Advanced })
    }

    async fn terminate(&self, id: CommandId, command: &Command) -> Result<Step> {
        for claim in command.claim_ids() {
            match self.terminator.terminate(claim, &self.cancel).await {
                Ok(()) | Err(ControllerError::ClaimNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.advance(id, CommandPhase::Completed);
        info!(
            command = %id,
            method = %command.method,
            nodes = command.targets.len(),
            savings = command.savings(),
            "disruption completed"
        );
        Ok(Step::Done)
    }

    async fn abort(&self, id: CommandId, command: &Command, reason: &str) -> Result<()> {
        self.roll_back(command, reason).await?;
        self.advance(id, CommandPhase::Aborted);
        warn!(command = %id, method = %command.method, reason, "disruption aborted");
        Ok(())
    }

    async fn roll_back(&self, command: &Command, reason: &str) -> Result<()> {
        let rolled_back = self
            .store
            .abort_disrupting(&command.claim_ids(), reason, Utc::now())?;
        let nodes: Vec<&str> = command
            .targets
            .iter()
            .filter(|t| rolled_back.contains(&t.claim))
            .map(|t| t.node.as_str())
            .collect();
        self.release(&rolled_back, &nodes).await
    }

    /// Publishes rolled-back claims and lifts the disruption taint from
    /// their nodes.
    async fn release(&self, claims: &[ClaimId], nodes: &[&str]) -> Result<()> {
        for id in claims {
            match self.terminator.publish(*id, &self.cancel).await {
                Ok(()) | Err(ControllerError::ClaimNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        for node in nodes {
            self.backoff
                .retry("untaint node", &self.cancel, || {
                    self.cluster.untaint_node(node, TAINT_DISRUPTED)
                })
                .await?;
        }
        Ok(())
    }

    /// Rolls back claims left `Disrupting` by a command that never got
    /// under way, for example a pass cancelled halfway through
    /// [`Orchestrator::start`]. A claim is orphaned when its node is not
    /// locked by any command. Claims an interruption has taken over are
    /// left to the interruption handler. Returns the rolled-back claims.
    ///
    /// # Errors
    ///
    /// Returns error if the cluster keeps failing.
    pub async fn recover_orphans(&self) -> Result<Vec<ClaimId>> {
        let orphans: Vec<(ClaimId, Option<String>)> = self
            .store
            .list()
            .into_iter()
            .filter(|c| c.phase == ClaimPhase::Disrupting)
            .filter(|c| c.disruption != Some(DisruptionMethod::Interruption))
            .filter(|c| c.node_name.as_deref().is_none_or(|n| !self.locks.is_locked(n)))
            .map(|c| (c.id, c.node_name))
            .collect();
        if orphans.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ClaimId> = orphans.iter().map(|(id, _)| *id).collect();
        let rolled_back = self
            .store
            .abort_disrupting(&ids, "disruption command lost", Utc::now())?;
        let nodes: Vec<&str> = orphans
            .iter()
            .filter(|(id, _)| rolled_back.contains(id))
            .filter_map(|(_, node)| node.as_deref())
            .collect();
        warn!(claims = rolled_back.len(), "rolled back orphaned disruptions");
        self.release(&rolled_back, &nodes).await?;
        Ok(rolled_back)
    }
}

impl<P: CloudProvider, C: ClusterClient> Reconciler for Orchestrator<P, C> {
    type Key = CommandId;

    fn name(&self) -> &'static str {
        "disruption"
    }

    async fn reconcile(&self, key: &CommandId) -> Result<ReconcileOutcome> {
        loop {
            let Some(progress) = self.progress(*key) else {
                return Ok(ReconcileOutcome::Done);
            };
            match self.step(*key, &progress).await? {
                Step::Advanced => {}
                Step::Wait => return Ok(ReconcileOutcome::RequeueAfter(self.poll_interval)),
                Step::Done => return Ok(ReconcileOutcome::Done),
            }
        }
    }
}
