//! The topology holder: one routing table, one lock, and the side effects.
//!
//! [`Topology`] serializes every routing table mutation behind a single
//! mutex. Mutations return [`TopologyAction`]s; once the lock is released
//! the actions are handed to a background task that drives the
//! [`OverlayNetwork`]. Callers never wait for network work.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use crate::config::{ConfigError, TopologyConfig};
use crate::id::NodeId;
use crate::message::Destination;
use crate::network::{AttachRequest, OverlayNetwork};
use crate::routing::{
    NeighborView, Node, NodeState, OverlayState, RoutingTable, RoutingTableEntry, TopologyAction,
    TopologySnapshot,
};

/// Capacity of the topology event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Changes observers can subscribe to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    /// Successor or predecessor list changed. Carries the new view.
    NeighborsChanged(NeighborView),
    /// A peer was removed after leaving or failing.
    PeerLeft(NodeId),
    /// A peer moved to a new liveness state.
    StateChanged { peer: NodeId, state: NodeState },
}

/// Ring topology of one overlay node.
///
/// Cheap to clone; clones share the same table and network.
pub struct Topology<N: OverlayNetwork> {
    local: NodeId,
    routing: Arc<Mutex<RoutingTable>>,
    network: Arc<N>,
    events: broadcast::Sender<TopologyEvent>,
}

impl<N: OverlayNetwork> Clone for Topology<N> {
    fn clone(&self) -> Self {
        Self {
            local: self.local,
            routing: self.routing.clone(),
            network: self.network.clone(),
            events: self.events.clone(),
        }
    }
}

impl<N: OverlayNetwork> Topology<N> {
    /// Create the topology for `local`. Tables start empty.
    pub fn new(local: NodeId, config: TopologyConfig, network: N) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            local,
            routing: Arc::new(Mutex::new(RoutingTable::new(local, config))),
            network: Arc::new(network),
            events,
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub(crate) fn routing(&self) -> &Arc<Mutex<RoutingTable>> {
        &self.routing
    }

    /// Receive topology events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: TopologyEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Run one table mutation, publish a neighbor change if any, and
    /// schedule the resulting actions.
    async fn mutate<F>(&self, op: F) -> Vec<TopologyAction>
    where
        F: FnOnce(&mut RoutingTable) -> Vec<TopologyAction>,
    {
        let (actions, before, after) = {
            let mut rt = self.routing.lock().await;
            let before = rt.neighbor_view();
            let actions = op(&mut *rt);
            (actions, before, rt.neighbor_view())
        };
        if before != after {
            self.publish(TopologyEvent::NeighborsChanged(after));
        }
        self.spawn_actions(actions.clone());
        actions
    }

    /// Hand actions to a background task. Order within the batch is kept.
    fn spawn_actions(&self, actions: Vec<TopologyAction>) {
        if actions.is_empty() {
            return;
        }
        let routing = self.routing.clone();
        let network = self.network.clone();
        tokio::spawn(async move {
            run_actions(routing, network, actions).await;
        });
    }

    // ------------------------------------------------------------------------
    // Table operations
    // ------------------------------------------------------------------------

    /// Register a newly discovered peer.
    pub async fn add_node(&self, node: Node) -> bool {
        let mut rt = self.routing.lock().await;
        rt.add_node(node)
    }

    /// Replace the connectivity candidates of a known peer.
    pub async fn update_candidates(&self, id: &NodeId, candidates: Vec<String>) -> bool {
        let mut rt = self.routing.lock().await;
        rt.update_candidates(id, candidates)
    }

    /// Change a peer's liveness state.
    pub async fn set_node_state(&self, id: NodeId, state: NodeState) -> Vec<TopologyAction> {
        let mut resulting = None;
        let actions = self
            .mutate(|rt| {
                let before = rt.get_node(&id).map(|e| e.state);
                let actions = rt.set_node_state(id, state);
                let after = rt.get_node(&id).map(|e| e.state);
                if after != before {
                    resulting = after;
                }
                actions
            })
            .await;
        if let Some(state) = resulting {
            self.publish(TopologyEvent::StateChanged { peer: id, state });
        }
        actions
    }

    /// Merge a neighbor's advertised view.
    pub async fn merge(
        &self,
        originator: NodeId,
        successors: &[NodeId],
        predecessors: &[NodeId],
        force_send_update: bool,
    ) -> Vec<TopologyAction> {
        self.mutate(|rt| rt.merge(originator, successors, predecessors, force_send_update))
            .await
    }

    /// Handle an Update received from `originator` and merge its view.
    ///
    /// An attached sender becomes a confirmed ring member. An unattached
    /// one keeps its state until its attach completes.
    pub async fn handle_update(
        &self,
        originator: NodeId,
        view: NeighborView,
        force_send_update: bool,
    ) -> Vec<TopologyAction> {
        let mut resulting = None;
        let actions = self
            .mutate(|rt| {
                let before = rt.get_node(&originator).map(|e| e.state);
                let mut actions = rt.note_update(originator);
                let after = rt.get_node(&originator).map(|e| e.state);
                if after != before {
                    resulting = after;
                }
                for action in rt.merge(
                    originator,
                    &view.successors,
                    &view.predecessors,
                    force_send_update,
                ) {
                    if !actions.contains(&action) {
                        actions.push(action);
                    }
                }
                actions
            })
            .await;
        if let Some(state) = resulting {
            self.publish(TopologyEvent::StateChanged {
                peer: originator,
                state,
            });
        }
        actions
    }

    /// Remove a departed or failed peer.
    pub async fn leave(&self, id: NodeId) -> Vec<TopologyAction> {
        if id == self.local {
            return Vec::new();
        }
        let actions = self.mutate(|rt| rt.leave(id)).await;
        self.publish(TopologyEvent::PeerLeft(id));
        actions
    }

    /// Next hop toward `target`; `Some(local)` when this node is
    /// responsible.
    pub async fn find_next_hop(
        &self,
        target: NodeId,
        include_target: bool,
        exclude_self: bool,
    ) -> Option<NodeId> {
        let rt = self.routing.lock().await;
        rt.find_next_hop(target, include_target, exclude_self, &*self.network)
    }

    pub async fn get_node(&self, id: &NodeId) -> Option<RoutingTableEntry> {
        let rt = self.routing.lock().await;
        rt.get_node(id).cloned()
    }

    pub async fn is_attached(&self, id: &NodeId) -> bool {
        let rt = self.routing.lock().await;
        rt.is_attached(id)
    }

    pub async fn successor_id(&self, index: usize) -> Option<NodeId> {
        let rt = self.routing.lock().await;
        rt.successor_id(index)
    }

    pub async fn predecessor_id(&self, index: usize) -> Option<NodeId> {
        let rt = self.routing.lock().await;
        rt.predecessor_id(index)
    }

    pub async fn successors(&self) -> Vec<NodeId> {
        let rt = self.routing.lock().await;
        rt.successors().to_vec()
    }

    pub async fn predecessors(&self) -> Vec<NodeId> {
        let rt = self.routing.lock().await;
        rt.predecessors().to_vec()
    }

    /// Whether this node stores data for `id`.
    pub async fn is_responsible(&self, id: &NodeId) -> bool {
        let rt = self.routing.lock().await;
        rt.is_responsible(id)
    }

    pub async fn replica_set(&self) -> Vec<NodeId> {
        let rt = self.routing.lock().await;
        rt.replica_set()
    }

    /// Attach to fingers that are empty or point at unknown peers.
    pub async fn attach_fingers(&self) -> Vec<TopologyAction> {
        self.mutate(|rt| rt.attach_fingers()).await
    }

    /// Attach to every neighbor still unknown.
    pub async fn attach_to_all_neighbors(&self) -> Vec<TopologyAction> {
        self.mutate(|rt| rt.attach_to_all_neighbors()).await
    }

    /// Send the current view to every neighbor and attached client, or
    /// attach to unattached neighbors first.
    pub async fn send_update_to_all_neighbors(&self) -> Vec<TopologyAction> {
        let network = self.network.clone();
        self.mutate(move |rt| rt.plan_update_broadcast(&*network))
            .await
    }

    /// Record join progress. Reaching [`OverlayState::Joined`] announces
    /// the node to its neighbors.
    pub async fn set_overlay_state(&self, state: OverlayState) -> Vec<TopologyAction> {
        self.mutate(|rt| {
            let joined_now = state == OverlayState::Joined && rt.overlay_state() != state;
            rt.set_overlay_state(state);
            if joined_now {
                vec![TopologyAction::BroadcastUpdate]
            } else {
                Vec::new()
            }
        })
        .await
    }

    pub async fn overlay_state(&self) -> OverlayState {
        let rt = self.routing.lock().await;
        rt.overlay_state()
    }

    pub async fn set_admitting_peer(&self, peer: Option<NodeId>) {
        let mut rt = self.routing.lock().await;
        rt.set_admitting_peer(peer);
    }

    pub async fn admitting_peer(&self) -> Option<NodeId> {
        let rt = self.routing.lock().await;
        rt.admitting_peer()
    }

    pub async fn record_liveness(&self, id: &NodeId) {
        let mut rt = self.routing.lock().await;
        rt.record_liveness(id);
    }

    pub async fn set_pinging(&self, id: &NodeId, pinging: bool) {
        let mut rt = self.routing.lock().await;
        rt.set_pinging(id, pinging);
    }

    /// Neighbors due for a liveness check.
    pub async fn stale_neighbors(&self, max_age: Duration) -> Vec<NodeId> {
        let rt = self.routing.lock().await;
        rt.stale_neighbors(max_age)
    }

    pub async fn purge_leaving_nodes(&self) -> usize {
        let mut rt = self.routing.lock().await;
        rt.purge_leaving_nodes()
    }

    /// Empty every table before rejoining the overlay.
    pub async fn clear(&self) {
        self.mutate(|rt| {
            rt.clear();
            Vec::new()
        })
        .await;
    }

    pub async fn snapshot(&self) -> TopologySnapshot {
        let rt = self.routing.lock().await;
        rt.snapshot()
    }

    /// Periodic upkeep: expire departed peers and attach to missing
    /// fingers every `period`.
    pub fn spawn_maintenance(&self, period: Duration) -> JoinHandle<()> {
        let topology = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let purged = topology.purge_leaving_nodes().await;
                let attaches = topology.attach_fingers().await;
                debug!(purged, attaches = attaches.len(), "topology maintenance");
            }
        })
    }
}

/// Drive a batch of actions against the network.
async fn run_actions<N: OverlayNetwork>(
    routing: Arc<Mutex<RoutingTable>>,
    network: Arc<N>,
    actions: Vec<TopologyAction>,
) {
    let mut queue: VecDeque<TopologyAction> = actions.into();
    while let Some(action) = queue.pop_front() {
        if let TopologyAction::BroadcastUpdate = action {
            let planned = {
                let mut rt = routing.lock().await;
                rt.plan_update_broadcast(&*network)
            };
            queue.extend(planned);
            continue;
        }
        if let Err(err) = execute(&*network, &action).await {
            warn!(?action, "topology side effect failed: {err:?}");
            if let TopologyAction::Attach(AttachRequest {
                target: Destination::Node(peer),
                ..
            }) = &action
            {
                routing.lock().await.attach_failed(peer);
            }
        }
    }
}

async fn execute<N: OverlayNetwork>(network: &N, action: &TopologyAction) -> Result<()> {
    match action {
        TopologyAction::Attach(request) => network.attach(request.clone()).await,
        TopologyAction::SendUpdate { to, view } => {
            network.send_update(*to, Some(view.clone())).await
        }
        TopologyAction::HandoverKeys(to) => network.handover_keys(*to).await,
        TopologyAction::StoreReplicas(to) => network.store_replicas(*to).await,
        TopologyAction::EvaluateReplicas => network.evaluate_replicas().await,
        TopologyAction::Rejoin => network.rejoin().await,
        // expanded by the caller
        TopologyAction::BroadcastUpdate => Ok(()),
    }
}
