//! Cloud provider collaborator.
//!
//! The controller never talks to a cloud directly. It launches, inspects and
//! deletes instances through [`CloudProvider`], and learns about involuntary
//! terminations from the stream returned by
//! [`CloudProvider::subscribe_interruptions`].

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_provisioning::requirements::{
    LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_NODEPOOL, LABEL_ZONE,
};
use claw_provisioning::{CapacityType, InstanceType, Node, NodePool, Resources, Taint};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::lifecycle::{ClaimId, NodeClaim};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// What the controller asks the provider to launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Claim the instance is launched for; providers tag instances with it.
    pub claim_id: ClaimId,
    /// Node name to register with.
    pub name: String,
    /// Owning NodePool.
    pub nodepool: String,
    /// Instance type.
    pub instance_type: String,
    /// Zone.
    pub zone: String,
    /// Capacity type.
    pub capacity_type: CapacityType,
    /// Labels the node registers with.
    pub labels: BTreeMap<String, String>,
    /// Taints the node registers with.
    pub taints: Vec<Taint>,
    /// Kubelet pod limit override.
    pub max_pods: Option<u32>,
}

impl LaunchRequest {
    /// Builds the request for a pending claim.
    #[must_use]
    pub fn for_claim(claim: &NodeClaim) -> Self {
        let mut labels = claim.requirements.single_valued_labels();
        labels.insert(LABEL_NODEPOOL.to_string(), claim.nodepool.clone());
        Self {
            claim_id: claim.id,
            name: claim.name.clone(),
            nodepool: claim.nodepool.clone(),
            instance_type: claim.offering.instance_type.clone(),
            zone: claim.offering.zone.clone(),
            capacity_type: claim.offering.capacity_type,
            labels,
            taints: claim
                .taints
                .iter()
                .chain(&claim.startup_taints)
                .cloned()
                .collect(),
            max_pods: claim.max_pods,
        }
    }
}

/// Provider-side instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Booting.
    Pending,
    /// Up.
    Running,
    /// Shutting down.
    Stopping,
    /// Gone.
    Terminated,
}

/// A provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Provider instance ID.
    pub provider_id: String,
    /// Claim the instance was launched for.
    pub claim_id: ClaimId,
    /// Node name it registers as.
    pub name: String,
    /// Instance type.
    pub instance_type: String,
    /// Zone.
    pub zone: String,
    /// Capacity type.
    pub capacity_type: CapacityType,
    /// Current state.
    pub state: InstanceState,
    /// Raw capacity.
    pub capacity: Resources,
    /// Capacity left for pods.
    pub allocatable: Resources,
    /// Labels the node registers with.
    pub labels: BTreeMap<String, String>,
    /// Taints the node registers with.
    pub taints: Vec<Taint>,
    /// Launch time.
    pub launched_at: DateTime<Utc>,
}

impl Instance {
    /// The node this instance registers as once its kubelet is up.
    #[must_use]
    pub fn to_node(&self) -> Node {
        let mut node = Node::new(self.name.clone())
            .with_provider_id(self.provider_id.clone())
            .with_allocatable(self.allocatable)
            .with_created_at(self.launched_at);
        node.capacity = self.capacity;
        for (k, v) in &self.labels {
            node = node.with_label(k.clone(), v.clone());
        }
        for taint in &self.taints {
            node = node.with_taint(taint.clone());
        }
        node
    }
}

/// Kinds of involuntary termination notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptionKind {
    /// Spot capacity is being reclaimed.
    SpotReclaim,
    /// The host is scheduled for maintenance.
    ScheduledMaintenance,
    /// The instance is stopping.
    InstanceStopping,
    /// The instance is terminating.
    InstanceTerminating,
}

impl InterruptionKind {
    /// Time between the notice and the provider taking the instance.
    #[must_use]
    pub const fn notice_window(self) -> Duration {
        match self {
            Self::SpotReclaim => Duration::from_secs(120),
            Self::ScheduledMaintenance => Duration::from_secs(3600),
            Self::InstanceStopping | Self::InstanceTerminating => Duration::from_secs(30),
        }
    }
}

impl std::fmt::Display for InterruptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SpotReclaim => "spot-reclaim",
            Self::ScheduledMaintenance => "scheduled-maintenance",
            Self::InstanceStopping => "instance-stopping",
            Self::InstanceTerminating => "instance-terminating",
        };
        f.write_str(s)
    }
}

/// An involuntary termination notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptionEvent {
    /// Affected instance.
    pub provider_id: String,
    /// Kind of notice.
    pub kind: InterruptionKind,
    /// When the notice arrived.
    pub received_at: DateTime<Utc>,
}

impl InterruptionEvent {
    /// A notice received now.
    #[must_use]
    pub fn new(provider_id: impl Into<String>, kind: InterruptionKind) -> Self {
        Self {
            provider_id: provider_id.into(),
            kind,
            received_at: Utc::now(),
        }
    }
}

/// Cloud provider operations the controller depends on.
///
/// Calls may block on the network and must be cancel-safe: dropping the
/// returned future abandons the call.
pub trait CloudProvider: Send + Sync + 'static {
    /// Instance types the provider offers for `pool`, with their offerings.
    fn list_offerings(
        &self,
        pool: &NodePool,
    ) -> impl Future<Output = ProviderResult<Vec<InstanceType>>> + Send;

    /// Launches an instance.
    fn create(&self, request: &LaunchRequest) -> impl Future<Output = ProviderResult<Instance>> + Send;

    /// Looks up an instance.
    fn get(&self, provider_id: &str) -> impl Future<Output = ProviderResult<Instance>> + Send;

    /// Every instance the provider knows about, for garbage collection.
    fn list_instances(&self) -> impl Future<Output = ProviderResult<Vec<Instance>>> + Send;

    /// Deletes an instance. Deleting a terminated instance succeeds.
    fn delete(&self, provider_id: &str) -> impl Future<Output = ProviderResult<()>> + Send;

    /// Stream of involuntary termination notices.
    fn subscribe_interruptions(&self) -> mpsc::Receiver<InterruptionEvent>;
}

#[derive(Debug, Default)]
struct ProviderState {
    instance_types: Vec<InstanceType>,
    instances: BTreeMap<String, Instance>,
    failures: VecDeque<ProviderError>,
    next_id: u64,
    creates: u64,
    subscribers: Vec<mpsc::Sender<InterruptionEvent>>,
}

/// Provider backed by memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    state: Mutex<ProviderState>,
}

impl InMemoryProvider {
    /// Creates a provider offering `instance_types` to every pool.
    #[must_use]
    pub fn new(instance_types: Vec<InstanceType>) -> Self {
        Self {
            state: Mutex::new(ProviderState {
                instance_types: instance_types.into_iter().map(InstanceType::normalized).collect(),
                ..ProviderState::default()
            }),
        }
    }

    /// Makes the next provider call fail with `err`.
    pub fn fail_next(&self, err: ProviderError) {
        self.state.lock().failures.push_back(err);
    }

    /// Adds an instance that already exists, e.g. one backing a pre-existing node.
    pub fn adopt(&self, instance: Instance) {
        self.state
            .lock()
            .instances
            .insert(instance.provider_id.clone(), instance);
    }

    /// A copy of every instance.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        self.state.lock().instances.values().cloned().collect()
    }

    /// Instances not yet terminated.
    #[must_use]
    pub fn running(&self) -> Vec<Instance> {
        self.state
            .lock()
            .instances
            .values()
            .filter(|i| i.state != InstanceState::Terminated)
            .cloned()
            .collect()
    }

    /// Number of successful create calls.
    #[must_use]
    pub fn create_count(&self) -> u64 {
        self.state.lock().creates
    }

    /// Publishes an interruption notice to every subscriber.
    pub fn interrupt(&self, provider_id: &str, kind: InterruptionKind) {
        let event = InterruptionEvent::new(provider_id, kind);
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        for tx in &state.subscribers {
            if tx.try_send(event.clone()).is_err() {
                warn!(provider_id, "interruption channel full, notice dropped");
            }
        }
    }

    fn take_failure(&self) -> ProviderResult<()> {
        match self.state.lock().failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl CloudProvider for InMemoryProvider {
    async fn list_offerings(&self, _pool: &NodePool) -> ProviderResult<Vec<InstanceType>> {
        self.take_failure()?;
        Ok(self.state.lock().instance_types.clone())
    }

    async fn create(&self, request: &LaunchRequest) -> ProviderResult<Instance> {
        self.take_failure()?;
        let mut state = self.state.lock();

        let Some(it) = state
            .instance_types
            .iter()
            .find(|it| it.name == request.instance_type)
            .cloned()
        else {
            return Err(ProviderError::Rejected {
                reason: format!("unknown instance type {}", request.instance_type),
            });
        };
        let available = it.offerings.iter().any(|o| {
            o.zone == request.zone && o.capacity_type == request.capacity_type && o.is_available()
        });
        if !available {
            return Err(ProviderError::InsufficientCapacity {
                instance_type: request.instance_type.clone(),
                zone: request.zone.clone(),
            });
        }

        state.next_id += 1;
        state.creates += 1;
        let provider_id = format!("mem:///{}/i-{:08x}", request.zone, state.next_id);

        let mut labels = it.labels.clone();
        labels.extend(request.labels.clone());
        labels.insert(LABEL_INSTANCE_TYPE.to_string(), it.name.clone());
        labels.insert(LABEL_ZONE.to_string(), request.zone.clone());
        labels.insert(
            LABEL_CAPACITY_TYPE.to_string(),
            request.capacity_type.as_str().to_string(),
        );

        let instance = Instance {
            provider_id: provider_id.clone(),
            claim_id: request.claim_id,
            name: request.name.clone(),
            instance_type: it.name.clone(),
            zone: request.zone.clone(),
            capacity_type: request.capacity_type,
            state: InstanceState::Running,
            capacity: it.capacity,
            allocatable: it.allocatable(request.max_pods),
            labels,
            taints: request.taints.clone(),
            launched_at: Utc::now(),
        };
        state.instances.insert(provider_id.clone(), instance.clone());
        info!(provider_id = %provider_id, instance_type = %it.name, zone = %request.zone, "instance launched");
        Ok(instance)
    }

    async fn get(&self, provider_id: &str) -> ProviderResult<Instance> {
        self.take_failure()?;
        self.state
            .lock()
            .instances
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            })
    }

    async fn list_instances(&self) -> ProviderResult<Vec<Instance>> {
        self.take_failure()?;
        Ok(self.instances())
    }

    async fn delete(&self, provider_id: &str) -> ProviderResult<()> {
        self.take_failure()?;
        let mut state = self.state.lock();
        match state.instances.get_mut(provider_id) {
            Some(instance) => {
                if instance.state != InstanceState::Terminated {
                    instance.state = InstanceState::Terminated;
                    debug!(provider_id, "instance terminated");
                }
                Ok(())
            }
            None => Err(ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            }),
        }
    }

    fn subscribe_interruptions(&self) -> mpsc::Receiver<InterruptionEvent> {
        let (tx, rx) = mpsc::channel(256);
        self.state.lock().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ClaimId;

    fn provider() -> InMemoryProvider {
        InMemoryProvider::new(vec![
            InstanceType::new("small", Resources::new().with_cpu(2))
                .with_offering("zone-a", CapacityType::OnDemand, 0.05)
                .with_offering("zone-a", CapacityType::Spot, 0.02),
        ])
    }

    fn request(zone: &str) -> LaunchRequest {
        LaunchRequest {
            claim_id: ClaimId::new(),
            name: "default-abc".into(),
            nodepool: "default".into(),
            instance_type: "small".into(),
            zone: zone.into(),
            capacity_type: CapacityType::Spot,
            labels: BTreeMap::from([(LABEL_NODEPOOL.to_string(), "default".to_string())]),
            taints: vec![],
            max_pods: Some(20),
        }
    }

    #[tokio::test]
    async fn create_labels_instance() {
        let p = provider();
        let instance = p.create(&request("zone-a")).await.expect("create");
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.allocatable.pods, 20);
        assert_eq!(instance.labels.get(LABEL_ZONE).map(String::as_str), Some("zone-a"));
        assert_eq!(
            instance.labels.get(LABEL_CAPACITY_TYPE).map(String::as_str),
            Some("spot")
        );

        let node = instance.to_node();
        assert_eq!(node.provider_id.as_deref(), Some(instance.provider_id.as_str()));
        assert_eq!(node.nodepool(), Some("default"));
        assert_eq!(p.create_count(), 1);
    }

    #[tokio::test]
    async fn create_without_offering_fails() {
        let p = provider();
        let err = p.create(&request("zone-b")).await.expect_err("no offering");
        assert!(matches!(err, ProviderError::InsufficientCapacity { .. }));
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let p = provider();
        p.fail_next(ProviderError::Transient {
            reason: "throttled".into(),
        });
        assert!(p.create(&request("zone-a")).await.is_err());
        assert!(p.create(&request("zone-a")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let p = provider();
        let instance = p.create(&request("zone-a")).await.expect("create");
        p.delete(&instance.provider_id).await.expect("delete");
        p.delete(&instance.provider_id).await.expect("delete again");
        assert!(p.running().is_empty());
        assert!(matches!(
            p.delete("mem:///zone-a/i-missing").await,
            Err(ProviderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn interruptions_reach_subscribers() {
        let p = provider();
        let mut rx = p.subscribe_interruptions();
        p.interrupt("i-1", InterruptionKind::SpotReclaim);
        let event = rx.recv().await.expect("event");
        assert_eq!(event.provider_id, "i-1");
        assert_eq!(event.kind.notice_window(), Duration::from_secs(120));
    }
}
