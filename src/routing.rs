//! Ring routing table and neighbor merge engine.
//!
//! [`RoutingTable`] holds everything a peer knows about the ring: the peer
//! table with per-peer liveness state, the successor and predecessor caches,
//! the finger table, the learned-from table used to pick introducers, and
//! the set of recently departed peers.
//!
//! The table performs no I/O. Operations that would contact other peers
//! return [`TopologyAction`]s for the caller to carry out, which keeps every
//! mutation a short synchronous step under one lock.

use std::collections::HashMap;
use std::iter;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{NodeRole, TopologyConfig};
use crate::id::NodeId;
use crate::message::Destination;
use crate::network::{AttachRequest, LinkState};

// ============================================================================
// Peer State
// ============================================================================

/// Liveness state of a known peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Known by id only.
    Unknown,
    /// An attach handshake is in flight.
    Attaching,
    /// Attached, but no ring update exchanged yet.
    Attached,
    /// Confirmed, routable ring member.
    UpdatesReceived,
}

impl NodeState {
    /// Attached or confirmed.
    pub fn is_approved(self) -> bool {
        matches!(self, NodeState::Attached | NodeState::UpdatesReceived)
    }

    /// Resolve a requested state change.
    ///
    /// Returns the state the peer ends up in, or `None` when the change is
    /// rejected. `pending_update` means an update from the peer arrived
    /// before it was attached; attaching such a peer confirms it directly.
    pub fn transition(self, requested: NodeState, pending_update: bool) -> Option<NodeState> {
        use NodeState::*;
        match (self, requested) {
            (Unknown | Attaching, Attached) if pending_update => Some(UpdatesReceived),
            (Unknown | Attaching, next) => Some(next),
            (Attached, Attaching | Attached) if pending_update => Some(UpdatesReceived),
            (Attached, Attaching) => None,
            (Attached, next) => Some(next),
            (UpdatesReceived, Unknown | UpdatesReceived) => Some(requested),
            (UpdatesReceived, _) => None,
        }
    }
}

/// A peer as learned from the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Connectivity candidates, opaque to the topology.
    pub candidates: Vec<String>,
    /// Successor hints, only meaningful while bootstrapping.
    pub successors: Vec<NodeId>,
    /// Predecessor hints, only meaningful while bootstrapping.
    pub predecessors: Vec<NodeId>,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            candidates: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<String>) -> Self {
        self.candidates = candidates;
        self
    }
}

/// Everything the table tracks about one peer.
#[derive(Clone, Debug)]
pub struct RoutingTableEntry {
    pub node: Node,
    /// Last successful liveness check.
    pub last_success: Option<Instant>,
    pub state: NodeState,
    /// A liveness check is in flight.
    pub pinging: bool,
    /// A join request to this peer awaits its answer.
    pub wait_for_join_answer: bool,
    /// An update from this peer arrived before it was attached.
    pub pending_update: bool,
}

impl RoutingTableEntry {
    fn new(node: Node, pending_update: bool) -> Self {
        Self {
            node,
            last_success: None,
            state: NodeState::Unknown,
            pinging: false,
            wait_for_join_answer: false,
            pending_update,
        }
    }
}

/// One slot of the finger table.
#[derive(Clone, Debug)]
pub struct FingerEntry {
    /// `local + 2^i`.
    pub target: NodeId,
    /// Closest known peer at or beyond `target`.
    pub successor: Option<NodeId>,
    pub state: NodeState,
    pub last_success: Option<Instant>,
    pub valid: bool,
}

impl FingerEntry {
    fn new(target: NodeId) -> Self {
        Self {
            target,
            successor: None,
            state: NodeState::Unknown,
            last_success: None,
            valid: false,
        }
    }

    fn install(&mut self, peer: NodeId, state: NodeState) {
        self.successor = Some(peer);
        self.state = state;
        self.last_success = state.is_approved().then(Instant::now);
        self.valid = true;
    }

    fn clear(&mut self) {
        self.successor = None;
        self.state = NodeState::Unknown;
        self.last_success = None;
        self.valid = false;
    }

    /// Usable for routing.
    pub fn is_confirmed(&self) -> bool {
        self.valid && self.successor.is_some() && self.state == NodeState::UpdatesReceived
    }
}

/// Successor and predecessor lists as advertised in an Update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborView {
    pub successors: Vec<NodeId>,
    pub predecessors: Vec<NodeId>,
}

/// Progress of this node through the overlay join.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayState {
    #[default]
    Init,
    Joining,
    Joined,
}

/// Side effect requested by a routing table operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyAction {
    Attach(AttachRequest),
    /// Send the current view to every neighbor (see
    /// [`RoutingTable::plan_update_broadcast`]).
    BroadcastUpdate,
    SendUpdate { to: NodeId, view: NeighborView },
    HandoverKeys(NodeId),
    StoreReplicas(NodeId),
    EvaluateReplicas,
    Rejoin,
}

/// Point-in-time summary of the table.
#[derive(Clone, Debug, Serialize)]
pub struct TopologySnapshot {
    pub local_id: NodeId,
    pub overlay_state: OverlayState,
    pub admitting_peer: Option<NodeId>,
    pub successors: Vec<NodeId>,
    pub predecessors: Vec<NodeId>,
    pub occupied_fingers: usize,
    pub confirmed_fingers: usize,
    pub known_peers: usize,
    pub leaving_peers: usize,
}

// ============================================================================
// Routing Table
// ============================================================================

/// Per-node ring state.
#[derive(Debug)]
pub struct RoutingTable {
    local: NodeId,
    config: TopologyConfig,
    overlay_state: OverlayState,
    /// The peer relaying all traffic while acting as a client.
    admitting_peer: Option<NodeId>,
    entries: HashMap<NodeId, RoutingTableEntry>,
    /// Peers that sent an update before they had an entry.
    pending_updates: LruCache<NodeId, ()>,
    successors: Vec<NodeId>,
    predecessors: Vec<NodeId>,
    fingers: Vec<FingerEntry>,
    /// Which neighbor first advertised an id.
    learned_from: LruCache<NodeId, NodeId>,
    leaving: HashMap<NodeId, Instant>,
}

impl RoutingTable {
    /// Create an empty table for `local`. The finger targets are fixed here.
    pub fn new(local: NodeId, config: TopologyConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.learned_from_capacity).unwrap_or(NonZeroUsize::MIN);
        let fingers = (0..NodeId::BITS)
            .map(|i| FingerEntry::new(local.add_pow2(i)))
            .collect();
        Self {
            local,
            config,
            overlay_state: OverlayState::Init,
            admitting_peer: None,
            entries: HashMap::new(),
            pending_updates: LruCache::new(capacity),
            successors: Vec::new(),
            predecessors: Vec::new(),
            fingers,
            learned_from: LruCache::new(capacity),
            leaving: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn is_client(&self) -> bool {
        self.config.role == NodeRole::Client
    }

    /// Fully joined, or the bootstrap node of the overlay.
    pub fn is_joined(&self) -> bool {
        self.overlay_state == OverlayState::Joined || self.config.role == NodeRole::Bootstrap
    }

    pub fn overlay_state(&self) -> OverlayState {
        self.overlay_state
    }

    pub fn set_overlay_state(&mut self, state: OverlayState) {
        if self.overlay_state != state {
            info!(from = ?self.overlay_state, to = ?state, "overlay state changed");
            self.overlay_state = state;
        }
    }

    pub fn admitting_peer(&self) -> Option<NodeId> {
        self.admitting_peer
    }

    pub fn set_admitting_peer(&mut self, peer: Option<NodeId>) {
        self.admitting_peer = peer;
    }

    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    pub fn predecessors(&self) -> &[NodeId] {
        &self.predecessors
    }

    pub fn fingers(&self) -> &[FingerEntry] {
        &self.fingers
    }

    pub fn successor_id(&self, index: usize) -> Option<NodeId> {
        self.successors.get(index).copied()
    }

    pub fn predecessor_id(&self, index: usize) -> Option<NodeId> {
        self.predecessors.get(index).copied()
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&RoutingTableEntry> {
        self.entries.get(id)
    }

    pub fn peer_count(&self) -> usize {
        self.entries.len()
    }

    /// Attached or confirmed.
    pub fn is_attached(&self, id: &NodeId) -> bool {
        self.entries
            .get(id)
            .map(|e| e.state.is_approved())
            .unwrap_or(false)
    }

    fn is_confirmed(&self, id: &NodeId) -> bool {
        self.entries
            .get(id)
            .map(|e| e.state == NodeState::UpdatesReceived)
            .unwrap_or(false)
    }

    pub fn is_neighbor(&self, id: &NodeId) -> bool {
        self.successors.contains(id) || self.predecessors.contains(id)
    }

    /// Successors followed by predecessors, without duplicates.
    pub fn neighbors(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.successors.len() + self.predecessors.len());
        for id in self.successors.iter().chain(self.predecessors.iter()) {
            if !out.contains(id) {
                out.push(*id);
            }
        }
        out
    }

    pub fn neighbor_view(&self) -> NeighborView {
        NeighborView {
            successors: self.successors.clone(),
            predecessors: self.predecessors.clone(),
        }
    }

    /// The neighbor that first advertised `id`, if still remembered.
    pub fn learned_from(&self, id: &NodeId) -> Option<NodeId> {
        self.learned_from.peek(id).copied()
    }

    /// Whether `id` left within the grace window.
    pub fn is_leaving(&self, id: &NodeId) -> bool {
        let grace = self.config.leaving_grace();
        self.leaving
            .get(id)
            .map(|since| since.elapsed() < grace)
            .unwrap_or(false)
    }

    /// Drop departed peers whose grace window has expired.
    pub fn purge_leaving_nodes(&mut self) -> usize {
        let grace = self.config.leaving_grace();
        let before = self.leaving.len();
        self.leaving.retain(|_, since| since.elapsed() < grace);
        before - self.leaving.len()
    }

    /// Whether this node stores data for `id`.
    pub fn is_responsible(&self, id: &NodeId) -> bool {
        if self.is_client() {
            return false;
        }
        match self.predecessors.first() {
            Some(pred) => id.element_of_interval(*pred, self.local, true),
            None => true,
        }
    }

    /// Peers holding replicas of locally owned data.
    pub fn replica_set(&self) -> Vec<NodeId> {
        self.successors.iter().take(2).copied().collect()
    }

    // ------------------------------------------------------------------------
    // Peer table
    // ------------------------------------------------------------------------

    /// Register a newly discovered peer as [`NodeState::Unknown`].
    ///
    /// Returns false when the peer is the local node or already known.
    pub fn add_node(&mut self, node: Node) -> bool {
        let id = node.id;
        if id == self.local || id == NodeId::WILDCARD || self.entries.contains_key(&id) {
            return false;
        }
        let pending = self.pending_updates.pop(&id).is_some();
        self.entries.insert(id, RoutingTableEntry::new(node, pending));
        self.fill_empty_fingers(id);
        debug!(peer = %id, pending, "added peer to routing table");
        true
    }

    /// Replace the connectivity candidates of a known peer.
    pub fn update_candidates(&mut self, id: &NodeId, candidates: Vec<String>) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.node.candidates = candidates;
                true
            }
            None => false,
        }
    }

    /// Apply a state change following the [`NodeState::transition`] rules.
    ///
    /// A neighbor that becomes attached or confirmed while the node is
    /// joined must see the current ring view, so that case asks for an
    /// update broadcast.
    pub fn set_node_state(&mut self, id: NodeId, requested: NodeState) -> Vec<TopologyAction> {
        if id == self.local {
            return Vec::new();
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            if requested == NodeState::UpdatesReceived {
                debug!(peer = %id, "update from unknown peer remembered as pending");
                self.pending_updates.put(id, ());
            }
            return Vec::new();
        };

        let previous = entry.state;
        let Some(next) = previous.transition(requested, entry.pending_update) else {
            debug!(peer = %id, ?previous, ?requested, "rejected node state change");
            return Vec::new();
        };
        entry.state = next;
        match next {
            NodeState::UpdatesReceived => {
                entry.pending_update = false;
                entry.last_success = Some(Instant::now());
            }
            NodeState::Attached => entry.last_success = Some(Instant::now()),
            NodeState::Unknown => entry.pinging = false,
            NodeState::Attaching => {}
        }
        if previous != next {
            debug!(peer = %id, ?previous, ?next, "node state changed");
        }

        if next.is_approved() {
            self.add_finger(id, next);
        } else {
            self.sync_finger_state(id, next);
        }

        let elevated = !previous.is_approved() && next.is_approved();
        if elevated && self.is_joined() && self.is_neighbor(&id) {
            vec![TopologyAction::BroadcastUpdate]
        } else {
            Vec::new()
        }
    }

    /// Record that `id` sent an Update.
    ///
    /// An attached sender is confirmed. A sender that is not attached yet
    /// keeps its state and is only flagged, so the attach confirms it later.
    pub fn note_update(&mut self, id: NodeId) -> Vec<TopologyAction> {
        if id == self.local {
            return Vec::new();
        }
        let approved = self.is_attached(&id);
        if approved {
            return self.set_node_state(id, NodeState::UpdatesReceived);
        }
        match self.entries.get_mut(&id) {
            Some(entry) => {
                warn!(peer = %id, state = ?entry.state, "update from a peer that is not attached");
                entry.pending_update = true;
                Vec::new()
            }
            None => {
                warn!(peer = %id, "update from an unknown peer");
                self.pending_updates.put(id, ());
                Vec::new()
            }
        }
    }

    /// An attach to `id` failed: make the peer eligible for another attempt.
    pub fn attach_failed(&mut self, id: &NodeId) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.state == NodeState::Attaching => {
                debug!(peer = %id, "attach failed; peer back to unknown");
                entry.state = NodeState::Unknown;
                self.sync_finger_state(*id, NodeState::Unknown);
                true
            }
            _ => false,
        }
    }

    /// Stamp a successful liveness check.
    pub fn record_liveness(&mut self, id: &NodeId) {
        let now = Instant::now();
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_success = Some(now);
            entry.pinging = false;
        }
        for finger in self.fingers.iter_mut().filter(|f| f.successor == Some(*id)) {
            finger.last_success = Some(now);
        }
    }

    pub fn set_pinging(&mut self, id: &NodeId, pinging: bool) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.pinging = pinging;
        }
    }

    pub fn set_wait_for_join_answer(&mut self, id: &NodeId, waiting: bool) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.wait_for_join_answer = waiting;
        }
    }

    /// Neighbors whose last successful liveness check is older than
    /// `max_age`, or that never had one.
    pub fn stale_neighbors(&self, max_age: Duration) -> Vec<NodeId> {
        self.neighbors()
            .into_iter()
            .filter(|id| match self.entries.get(id) {
                Some(entry) => !entry.pinging
                    && entry
                        .last_success
                        .map(|at| at.elapsed() > max_age)
                        .unwrap_or(true),
                None => true,
            })
            .collect()
    }

    fn mark_attaching(&mut self, id: NodeId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(next) = entry.state.transition(NodeState::Attaching, false) {
                entry.state = next;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Fingers
    // ------------------------------------------------------------------------

    /// Install `id` into every empty slot whose target lies in `(local, id]`.
    fn fill_empty_fingers(&mut self, id: NodeId) -> bool {
        let local = self.local;
        let mut changed = false;
        for finger in self.fingers.iter_mut().filter(|f| f.successor.is_none()) {
            if finger.target.element_of_interval(local, id, true) {
                finger.install(id, NodeState::Unknown);
                changed = true;
            }
        }
        changed
    }

    fn sync_finger_state(&mut self, id: NodeId, state: NodeState) {
        for finger in self.fingers.iter_mut().filter(|f| f.successor == Some(id)) {
            finger.state = state;
        }
    }

    /// Offer `id` as a finger.
    ///
    /// Empty slots whose target lies in `(local, id]` take it first. Filled
    /// slots switch to it only when it sits strictly closer to their target
    /// than the current occupant. Slots it already occupies pick up `state`.
    pub fn add_finger(&mut self, id: NodeId, state: NodeState) -> bool {
        if id == self.local {
            return false;
        }
        let local = self.local;
        let mut changed = self.fill_empty_fingers(id);
        for finger in self.fingers.iter_mut() {
            match finger.successor {
                Some(current) if current == id => {
                    if finger.state != state {
                        if let Some(next) = finger.state.transition(state, false) {
                            finger.state = next;
                            if next.is_approved() {
                                finger.last_success = Some(Instant::now());
                            }
                            changed = true;
                        }
                    }
                }
                Some(current) => {
                    let covers = finger.target.element_of_interval(local, id, true);
                    if covers && finger.target.distance_to(id) < finger.target.distance_to(current)
                    {
                        finger.install(id, state);
                        changed = true;
                    }
                }
                None => {}
            }
        }
        changed
    }

    /// The farthest confirmed finger that does not overshoot `key`.
    pub fn closest_preceding_finger(&self, key: NodeId) -> Option<NodeId> {
        self.fingers
            .iter()
            .filter(|f| f.is_confirmed())
            .filter_map(|f| f.successor)
            .filter(|peer| peer.element_of_interval(self.local, key, false))
            .max_by_key(|peer| self.local.distance_to(*peer))
    }

    /// Attach requests for fingers that point nowhere or at an unknown peer.
    ///
    /// Empty slots covered by the successor list are skipped: those targets
    /// are already owned by a known neighbor.
    pub fn attach_fingers(&mut self) -> Vec<TopologyAction> {
        if self.is_client() {
            return Vec::new();
        }
        let Some(horizon) = self.successors.last().copied() else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        let mut unknown_peers = Vec::new();
        for finger in &self.fingers {
            match finger.successor {
                None if !finger.target.element_of_interval(self.local, horizon, true) => {
                    actions.push(TopologyAction::Attach(AttachRequest {
                        target: Destination::Resource(finger.target),
                        introducer: None,
                    }));
                }
                Some(peer) if finger.state == NodeState::Unknown => {
                    let unknown = self
                        .entries
                        .get(&peer)
                        .map(|e| e.state == NodeState::Unknown)
                        .unwrap_or(true);
                    if unknown && !unknown_peers.contains(&peer) {
                        unknown_peers.push(peer);
                    }
                }
                _ => {}
            }
        }
        for peer in unknown_peers {
            let introducer = self.usable_introducer(&peer);
            actions.push(TopologyAction::Attach(AttachRequest {
                target: Destination::Node(peer),
                introducer,
            }));
            self.mark_attaching(peer);
        }
        debug!(attaches = actions.len(), "finger attach round");
        actions
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// Next hop toward `target`. `Some(local)` means this node is
    /// responsible.
    ///
    /// `include_target` allows answering with the target itself when it is
    /// directly reachable. `exclude_self` suppresses every answer naming
    /// the local node.
    pub fn find_next_hop(
        &self,
        target: NodeId,
        include_target: bool,
        exclude_self: bool,
        links: &dyn LinkState,
    ) -> Option<NodeId> {
        if include_target && target != self.local {
            if links.has_live_connection(&target) || self.is_confirmed(&target) {
                return Some(target);
            }
        }

        if self.is_client() {
            return self.admitting_peer;
        }

        let local = (!exclude_self).then_some(self.local);
        if self.successors.is_empty() || target == self.local {
            return local;
        }
        if let Some(pred) = self.predecessors.first() {
            if !exclude_self && target.element_of_interval(*pred, self.local, true) {
                return local;
            }
        }

        for succ in &self.successors {
            if target.element_of_interval(self.local, *succ, true) {
                return Some(*succ);
            }
        }

        self.closest_preceding_node(target)
    }

    /// Known peer closest to `target` without passing it.
    fn closest_preceding_node(&self, target: NodeId) -> Option<NodeId> {
        let mut candidates: Vec<NodeId> = self.successors.clone();
        candidates.extend(
            self.predecessors
                .iter()
                .copied()
                .filter(|p| p.element_of_interval(self.local, target, false)),
        );
        candidates.extend(self.closest_preceding_finger(target));
        candidates.push(target);
        candidates.sort_by_key(|id| self.local.distance_to(*id));
        candidates.dedup();

        let position = candidates.iter().position(|id| *id == target)?;
        match position.checked_sub(1) {
            Some(prev) => Some(candidates[prev]),
            None => self.successors.first().copied(),
        }
    }

    // ------------------------------------------------------------------------
    // Neighbor merge
    // ------------------------------------------------------------------------

    /// Order `candidates` by ring distance from the local id, clockwise for
    /// successors and counter-clockwise for predecessors, and cap the
    /// result at the configured cache size.
    pub fn neighbors_from_total(&self, candidates: &[NodeId], successors: bool) -> Vec<NodeId> {
        let cap = if successors {
            self.config.successor_cache_size
        } else {
            self.config.predecessor_cache_size
        };
        let mut result: Vec<NodeId> = Vec::with_capacity(cap + 1);
        for &candidate in candidates {
            if candidate == self.local || result.contains(&candidate) {
                continue;
            }
            let position = result
                .iter()
                .position(|existing| {
                    if successors {
                        candidate.element_of_interval(self.local, *existing, false)
                    } else {
                        candidate.element_of_interval(*existing, self.local, false)
                    }
                })
                .unwrap_or(result.len());
            if position < cap {
                result.insert(position, candidate);
                result.truncate(cap);
            }
        }
        result
    }

    /// Fold a neighbor's advertised view into the table.
    pub fn merge(
        &mut self,
        originator: NodeId,
        successors: &[NodeId],
        predecessors: &[NodeId],
        force_send_update: bool,
    ) -> Vec<TopologyAction> {
        self.purge_leaving_nodes();

        let mut candidates: Vec<NodeId> = Vec::new();
        let advertised = iter::once(originator)
            .chain(successors.iter().copied())
            .chain(predecessors.iter().copied());
        for id in advertised {
            if id == self.local || id == NodeId::WILDCARD || candidates.contains(&id) {
                continue;
            }
            if self.leaving.contains_key(&id) {
                debug!(peer = %id, from = %originator, "ignoring departed peer in update");
                continue;
            }
            candidates.push(id);
        }

        for &id in &candidates {
            if id != originator && !self.learned_from.contains(&id) {
                self.learned_from.put(id, originator);
            }
            self.add_node(Node::new(id));
        }

        if self.is_client() {
            return self.merge_as_client(originator, &candidates);
        }

        let mut total = candidates;
        total.extend(self.successors.iter().copied());
        total.extend(self.predecessors.iter().copied());
        total.retain(|id| !self.leaving.contains_key(id));

        let new_successors = self.neighbors_from_total(&total, true);
        let remaining: Vec<NodeId> = total
            .iter()
            .copied()
            .filter(|id| !new_successors.contains(id))
            .collect();
        let mut new_predecessors = self.neighbors_from_total(&remaining, false);
        if new_predecessors.is_empty() {
            new_predecessors = self.neighbors_from_total(&total, false);
        }

        let predecessors_changed = new_predecessors != self.predecessors;
        let successors_changed = new_successors != self.successors;
        let replicas_changed = new_successors
            .iter()
            .take(2)
            .ne(self.successors.iter().take(2));

        let mut actions = Vec::new();
        if predecessors_changed {
            match new_predecessors.first() {
                Some(first) if self.predecessors.first() != Some(first) => {
                    actions.push(TopologyAction::HandoverKeys(*first));
                }
                _ => actions.push(TopologyAction::EvaluateReplicas),
            }
        }
        if replicas_changed {
            actions.extend(
                new_successors
                    .iter()
                    .take(2)
                    .map(|id| TopologyAction::StoreReplicas(*id)),
            );
        }
        if predecessors_changed || successors_changed {
            info!(
                from = %originator,
                successors = ?new_successors,
                predecessors = ?new_predecessors,
                "neighbor set changed"
            );
        }

        self.successors = new_successors;
        self.predecessors = new_predecessors;

        if predecessors_changed || successors_changed || force_send_update {
            actions.push(TopologyAction::BroadcastUpdate);
        }
        actions
    }

    /// Clients only track their admitting peer: switch to a candidate that
    /// sits closer to the local id than the current one.
    fn merge_as_client(&mut self, originator: NodeId, candidates: &[NodeId]) -> Vec<TopologyAction> {
        let current = self.admitting_peer;
        let best = candidates
            .iter()
            .copied()
            .filter(|id| match current {
                Some(peer) => id.element_of_interval(self.local, peer, false),
                None => true,
            })
            .min_by_key(|id| self.local.distance_to(*id));

        match best {
            Some(next) if Some(next) != current => {
                info!(current = ?current, next = %next, "attaching to closer admitting peer");
                self.mark_attaching(next);
                let introducer = (next != originator).then_some(originator);
                vec![TopologyAction::Attach(AttachRequest {
                    target: Destination::Node(next),
                    introducer,
                })]
            }
            _ => Vec::new(),
        }
    }

    fn usable_introducer(&self, id: &NodeId) -> Option<NodeId> {
        self.learned_from(id)
            .filter(|introducer| introducer != id && self.is_attached(introducer))
    }

    /// Attach requests for every neighbor still in [`NodeState::Unknown`].
    ///
    /// Each attach is source-routed through the neighbor that introduced
    /// the id. Neighbors without a known, attached introducer are skipped;
    /// they are picked up once their introducer attaches.
    pub fn attach_to_all_neighbors(&mut self) -> Vec<TopologyAction> {
        let mut actions = Vec::new();
        for id in self.neighbors() {
            let unknown = self
                .entries
                .get(&id)
                .map(|e| e.state == NodeState::Unknown)
                .unwrap_or(false);
            if !unknown {
                continue;
            }
            let Some(introducer) = self.usable_introducer(&id) else {
                debug!(peer = %id, "no attached introducer; attach postponed");
                continue;
            };
            actions.push(TopologyAction::Attach(AttachRequest {
                target: Destination::Node(id),
                introducer: Some(introducer),
            }));
            self.mark_attaching(id);
        }
        actions
    }

    /// Turn an update broadcast into concrete sends.
    ///
    /// Nothing is sent before the node is joined. While any neighbor is
    /// not yet attached, the broadcast is deferred and attach requests are
    /// returned instead; the broadcast is asked for again once the last
    /// neighbor attaches.
    pub fn plan_update_broadcast(&mut self, links: &dyn LinkState) -> Vec<TopologyAction> {
        if self.is_client() {
            return Vec::new();
        }
        if !self.is_joined() {
            debug!(state = ?self.overlay_state, "not joined; update broadcast skipped");
            return Vec::new();
        }

        let mut targets = self.neighbors();
        if targets.iter().any(|id| !self.is_attached(id)) {
            debug!("neighbors not attached yet; deferring update broadcast");
            return self.attach_to_all_neighbors();
        }
        for client in links.connected_clients() {
            if client != self.local && !targets.contains(&client) {
                targets.push(client);
            }
        }

        let view = self.neighbor_view();
        targets
            .into_iter()
            .map(|to| TopologyAction::SendUpdate {
                to,
                view: view.clone(),
            })
            .collect()
    }

    /// Forget a departed peer everywhere and keep it out of merges for the
    /// grace window.
    pub fn leave(&mut self, id: NodeId) -> Vec<TopologyAction> {
        if id == self.local {
            return Vec::new();
        }
        let old_successors = self.successors.clone();
        let old_predecessors = self.predecessors.clone();

        self.successors.retain(|s| *s != id);
        self.predecessors.retain(|p| *p != id);
        for finger in self.fingers.iter_mut().filter(|f| f.successor == Some(id)) {
            finger.clear();
        }
        let known = self.entries.remove(&id).is_some();
        self.pending_updates.pop(&id);
        self.learned_from.pop(&id);
        self.leaving.insert(id, Instant::now());
        info!(peer = %id, known, "peer left the overlay");

        let mut actions = Vec::new();
        if self.admitting_peer == Some(id) {
            info!(peer = %id, "admitting peer left; rejoining");
            self.admitting_peer = None;
            actions.push(TopologyAction::Rejoin);
        }

        let predecessors_changed = old_predecessors != self.predecessors;
        let successors_changed = old_successors != self.successors;
        if predecessors_changed {
            actions.push(TopologyAction::EvaluateReplicas);
        }
        if old_successors
            .iter()
            .take(2)
            .ne(self.successors.iter().take(2))
        {
            actions.extend(
                self.successors
                    .iter()
                    .take(2)
                    .map(|s| TopologyAction::StoreReplicas(*s)),
            );
        }
        if (predecessors_changed || successors_changed) && !self.is_client() {
            actions.push(TopologyAction::BroadcastUpdate);
        }
        actions
    }

    /// Empty every table for a fresh join. Finger targets and configuration
    /// are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending_updates.clear();
        self.successors.clear();
        self.predecessors.clear();
        for finger in &mut self.fingers {
            finger.clear();
        }
        self.learned_from.clear();
        self.leaving.clear();
        self.admitting_peer = None;
        self.overlay_state = OverlayState::Init;
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            local_id: self.local,
            overlay_state: self.overlay_state,
            admitting_peer: self.admitting_peer,
            successors: self.successors.clone(),
            predecessors: self.predecessors.clone(),
            occupied_fingers: self.fingers.iter().filter(|f| f.successor.is_some()).count(),
            confirmed_fingers: self.fingers.iter().filter(|f| f.is_confirmed()).count(),
            known_peers: self.entries.len(),
            leaving_peers: self.leaving.len(),
        }
    }
}
