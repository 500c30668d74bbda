//! Interfaces to the collaborators around the topology core.
//!
//! Connection management, attach handshakes, update encoding and key
//! storage all live outside this crate. The topology reaches them through
//! [`OverlayNetwork`]; tests plug in an in-memory recorder.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::id::NodeId;
use crate::message::{Destination, ErrorReply, Message};
use crate::routing::NeighborView;

/// An attach handshake to start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachRequest {
    /// `Destination::Node` for a known peer, `Destination::Resource` to
    /// attach to whoever is responsible for a ring position (fingers).
    pub target: Destination,
    /// Peer to source-route the attach through. `None` routes it over the
    /// overlay.
    pub introducer: Option<NodeId>,
}

/// Synchronous view of the link layer's live connections.
pub trait LinkState {
    /// Whether an open, live connection to `id` exists.
    fn has_live_connection(&self, id: &NodeId) -> bool;

    /// Clients currently attached to this node, which receive updates too.
    fn connected_clients(&self) -> Vec<NodeId> {
        Vec::new()
    }
}

/// No live connections at all.
impl LinkState for () {
    fn has_live_connection(&self, _id: &NodeId) -> bool {
        false
    }
}

/// Transport and storage operations the topology triggers.
///
/// Every method is a hand-off: implementations queue the work and return,
/// results come back later through the normal message path.
#[async_trait]
pub trait OverlayNetwork: LinkState + Send + Sync + 'static {
    /// Send `message` to the chosen next hop.
    async fn send(&self, message: Message, next_hop: NodeId) -> Result<()>;

    /// Build and send an error answer.
    async fn send_error(&self, reply: ErrorReply) -> Result<()>;

    /// Start an attach handshake.
    async fn attach(&self, request: AttachRequest) -> Result<()>;

    /// Send an Update to `to`. `None` sends an update without a ring view
    /// (used by nodes that are not ring members).
    async fn send_update(&self, to: NodeId, view: Option<NeighborView>) -> Result<()>;

    /// Hand the keys now owned by `new_predecessor` over to it.
    async fn handover_keys(&self, new_predecessor: NodeId) -> Result<()>;

    /// Push replicas of locally owned keys to `to`.
    async fn store_replicas(&self, to: NodeId) -> Result<()>;

    /// Re-check which replicas this node should still hold.
    async fn evaluate_replicas(&self) -> Result<()>;

    /// Start the pre-join procedure again after losing the admitting peer.
    async fn rejoin(&self) -> Result<()>;
}

/// State of one link-layer connection.
#[derive(Clone, Debug)]
pub struct Connection {
    pub peer: NodeId,
    pub live: bool,
    pub last_activity: Instant,
}

/// Connections keyed by peer id, maintained by the link layer.
#[derive(Debug, Default, Clone)]
pub struct ConnectionTable {
    connections: HashMap<NodeId, Connection>,
    clients: Vec<NodeId>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection or refresh its activity timestamp.
    pub fn upsert(&mut self, peer: NodeId, live: bool) {
        let conn = self.connections.entry(peer).or_insert(Connection {
            peer,
            live,
            last_activity: Instant::now(),
        });
        conn.live = live;
        conn.last_activity = Instant::now();
    }

    /// Mark `peer` as an attached client of this node.
    pub fn add_client(&mut self, peer: NodeId) {
        if !self.clients.contains(&peer) {
            self.clients.push(peer);
        }
        self.upsert(peer, true);
    }

    pub fn remove(&mut self, peer: &NodeId) -> Option<Connection> {
        self.clients.retain(|c| c != peer);
        self.connections.remove(peer)
    }

    pub fn get(&self, peer: &NodeId) -> Option<&Connection> {
        self.connections.get(peer)
    }

    /// Ids of all live connections.
    pub fn live_peers(&self) -> Vec<NodeId> {
        self.connections
            .values()
            .filter(|c| c.live)
            .map(|c| c.peer)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl LinkState for ConnectionTable {
    fn has_live_connection(&self, id: &NodeId) -> bool {
        self.connections.get(id).map(|c| c.live).unwrap_or(false)
    }

    fn connected_clients(&self) -> Vec<NodeId> {
        self.clients
            .iter()
            .filter(|c| self.has_live_connection(c))
            .copied()
            .collect()
    }
}
