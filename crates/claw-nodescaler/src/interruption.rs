//! Involuntary interruption handling.
//!
//! A termination notice preempts everything else: the claim is forced into
//! `Disrupting`, even when a voluntary command already owns it, and its pods
//! are removed without regard for disruption budgets or opt-outs. The drain
//! is bounded by the notice window; whatever is left when it runs out goes
//! down with the instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use claw_provisioning::{DisruptionMethod, PodKey, Taint};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::cluster::ClusterClient;
use crate::error::Result;
use crate::lifecycle::{ClaimId, ClaimPhase, ConditionKind, NodeClaim, NodeClaimStore};
use crate::locks::KeyLocks;
use crate::provider::{CloudProvider, InterruptionEvent, InterruptionKind};
use crate::termination::Terminator;

/// Reason reported on pods removed by an interruption.
pub const INTERRUPTED_REASON: &str = "node interrupted";

/// Drain budget when resuming an interruption whose notice is lost.
const RESUMED_DRAIN_WINDOW: Duration = InterruptionKind::InstanceTerminating.notice_window();

/// Why a notice was not acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No claim owns the instance.
    UnknownInstance,
    /// The claim is already being torn down.
    AlreadyTerminated,
    /// An earlier notice for the same instance is being handled.
    Duplicate,
}

/// What handling a notice did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptionOutcome {
    /// The node was drained and the claim terminated.
    Drained {
        /// The interrupted claim.
        claim: ClaimId,
        /// Pods removed from the node.
        evicted: usize,
    },
    /// Nothing was done.
    Ignored(IgnoreReason),
}

/// Turns provider notices into forced drains and terminations.
#[derive(Debug)]
pub struct InterruptionHandler<P, C> {
    cluster: Arc<C>,
    store: Arc<NodeClaimStore>,
    terminator: Arc<Terminator<P, C>>,
    backoff: Backoff,
    /// Claims whose interruption is being handled right now.
    handling: KeyLocks,
}

impl<P: CloudProvider, C: ClusterClient> InterruptionHandler<P, C> {
    /// Creates a handler.
    #[must_use]
    pub fn new(
        cluster: Arc<C>,
        store: Arc<NodeClaimStore>,
        terminator: Arc<Terminator<P, C>>,
        backoff: Backoff,
    ) -> Self {
        Self {
            cluster,
            store,
            terminator,
            backoff,
            handling: KeyLocks::new(),
        }
    }

    /// Handles one notice.
    ///
    /// # Errors
    ///
    /// Returns error if the claim cannot be moved to `Disrupting` or the
    /// teardown keeps failing.
    pub async fn handle(
        &self,
        event: &InterruptionEvent,
        cancel: &CancellationToken,
    ) -> Result<InterruptionOutcome> {
        let Some(claim) = self.store.by_provider_id(&event.provider_id) else {
            debug!(provider_id = %event.provider_id, kind = %event.kind, "notice for unknown instance");
            return Ok(InterruptionOutcome::Ignored(IgnoreReason::UnknownInstance));
        };
        if claim.phase.is_terminal() || claim.phase == ClaimPhase::Terminating {
            return Ok(InterruptionOutcome::Ignored(IgnoreReason::AlreadyTerminated));
        }
        if claim.disruption == Some(DisruptionMethod::Interruption) {
            return Ok(InterruptionOutcome::Ignored(IgnoreReason::Duplicate));
        }
        let Some(_handling) = self.handling.try_lock_all([claim.id.to_string()]) else {
            return Ok(InterruptionOutcome::Ignored(IgnoreReason::Duplicate));
        };

        let now = Utc::now();
        if claim.phase == ClaimPhase::Disrupting {
            // A voluntary command owned the claim; the notice takes over.
            let reason = format!("interrupted: {}", event.kind);
            self.store.update(claim.id, |c| {
                c.disruption = Some(DisruptionMethod::Interruption);
                c.set_condition(ConditionKind::Disrupted, true, reason, now);
            })?;
        } else {
            self.store
                .begin_disrupting(&[claim.id], DisruptionMethod::Interruption, now)?;
        }
        self.terminator.publish(claim.id, cancel).await?;
        info!(
            claim = %claim.id,
            provider_id = %event.provider_id,
            kind = %event.kind,
            "instance interrupted"
        );

        let elapsed = (now - event.received_at).to_std().unwrap_or_default();
        let window = event.kind.notice_window().saturating_sub(elapsed);
        let evicted = self.finish(&claim, window, cancel).await?;
        Ok(InterruptionOutcome::Drained {
            claim: claim.id,
            evicted,
        })
    }

    /// Finishes interruptions whose handling stopped part way, such as a
    /// teardown that kept failing. Later notices for those instances are
    /// duplicates, so nothing else would ever terminate them. Returns the
    /// claims that were terminated.
    ///
    /// # Errors
    ///
    /// Returns the first teardown failure.
    pub async fn recover(&self, cancel: &CancellationToken) -> Result<Vec<ClaimId>> {
        let stranded: Vec<ClaimId> = self
            .store
            .list()
            .into_iter()
            .filter(|c| c.phase == ClaimPhase::Disrupting)
            .filter(|c| c.disruption == Some(DisruptionMethod::Interruption))
            .map(|c| c.id)
            .collect();

        let mut resumed = Vec::new();
        for id in stranded {
            let Some(_handling) = self.handling.try_lock_all([id.to_string()]) else {
                continue;
            };
            let Some(claim) = self.store.get(id).filter(|c| c.phase == ClaimPhase::Disrupting) else {
                continue;
            };
            warn!(claim = %id, name = %claim.name, "resuming interrupted claim");
            self.finish(&claim, RESUMED_DRAIN_WINDOW, cancel).await?;
            resumed.push(id);
        }
        Ok(resumed)
    }

    async fn finish(&self, claim: &NodeClaim, window: Duration, cancel: &CancellationToken) -> Result<usize> {
        let evicted = match &claim.node_name {
            Some(node) => match tokio::time::timeout(window, self.drain(node, cancel)).await {
                Ok(drained) => drained?,
                Err(_) => {
                    warn!(claim = %claim.id, node = %node, "notice window elapsed during drain");
                    0
                }
            },
            None => 0,
        };
        self.terminator.terminate(claim.id, cancel).await?;
        Ok(evicted)
    }

    async fn drain(&self, node: &str, cancel: &CancellationToken) -> Result<usize> {
        let taint = Taint::disrupted();
        let taint = &taint;
        if let Err(e) = self
            .backoff
            .retry("taint node", cancel, || self.cluster.taint_node(node, taint))
            .await
        {
            warn!(node, error = %e, "could not taint interrupted node");
        }

        let pods = self
            .backoff
            .retry("list pods", cancel, || self.cluster.list_pods())
            .await?;
        let victims: Vec<PodKey> = pods
            .iter()
            .filter(|p| p.node_name.as_deref() == Some(node))
            .filter(|p| !p.is_daemonset() && !p.is_terminal())
            .map(claw_provisioning::Pod::key)
            .collect();
        for key in &victims {
            self.backoff
                .retry("mark unschedulable", cancel, || {
                    self.cluster.mark_unschedulable(key, INTERRUPTED_REASON)
                })
                .await?;
            self.backoff
                .retry("delete pod", cancel, || self.cluster.delete_pod(key))
                .await?;
        }
        debug!(node, pods = victims.len(), "interrupted node drained");
        Ok(victims.len())
    }

    /// Handles notices until `events` closes or `cancel` fires. Notices
    /// received while not leading are dropped.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<InterruptionEvent>,
        leader: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else { break };
            if !*leader.borrow() {
                debug!(provider_id = %event.provider_id, "not leader, dropping notice");
                continue;
            }
            match self.handle(&event, &cancel).await {
                Ok(outcome) => debug!(provider_id = %event.provider_id, ?outcome, "notice handled"),
                Err(e) => error!(provider_id = %event.provider_id, error = %e, "notice handling failed"),
            }
        }
    }
}
