//! # RELOAD ring
//!
//! This crate implements the topology core of a Chord-style RELOAD overlay:
//! the ring identifier space, the per-node routing table with its successor,
//! predecessor and finger caches, the neighbor merge that makes the ring
//! converge from exchanged Update messages, and the forwarding step every
//! inbound message passes through.
//!
//! Transport, attach handshakes, message encoding and data storage are not
//! part of the crate. They are reached through the [`OverlayNetwork`] trait,
//! so the same topology can sit on top of any link layer or be driven by an
//! in-memory harness in tests.
//!
//! The crate is split into a handful of modules:
//!
//! - [`id`]: 128-bit ring identifiers and interval arithmetic.
//! - [`config`]: the [`TopologyConfig`] cache sizes and bounds.
//! - [`message`]: the forwarding header of overlay messages and the error
//!   codes the forwarding layer answers with.
//! - [`network`]: the [`OverlayNetwork`] and [`LinkState`] seams.
//! - [`routing`]: the synchronous [`RoutingTable`], which returns
//!   [`TopologyAction`]s instead of performing I/O.
//! - [`topology`]: [`Topology`], which guards the table with one lock and
//!   runs the resulting actions in the background.
//! - [`forwarding`]: [`ForwardingLayer::process_msg`] and the pure
//!   [`route_message`] decision.
//!
//! ## Getting started
//!
//! ```no_run
//! use reload_ring::{
//!     Destination, ForwardingLayer, Message, NodeId, OverlayNetwork, Topology, TopologyConfig,
//! };
//!
//! # async fn launch<N: OverlayNetwork>(network: N) -> anyhow::Result<()> {
//! let local = reload_ring::derive_node_id(b"peer certificate");
//! let topology = Topology::new(local, TopologyConfig::default(), network)?;
//!
//! // Update received from a neighbor.
//! let neighbor = NodeId::new(42);
//! topology.merge(neighbor, &[], &[], false).await;
//!
//! let forwarding = ForwardingLayer::new(topology.clone());
//! let mut message = Message::request(neighbor, 1, Destination::Resource(NodeId::new(7)));
//! if !forwarding.process_msg(&mut message).await {
//!     // deliver locally
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod forwarding;
pub mod id;
pub mod message;
pub mod network;
pub mod routing;
pub mod topology;

pub use config::{ConfigError, NodeRole, TopologyConfig};
pub use forwarding::{route_message, DropReason, ForwardDecision, ForwardingLayer};
pub use id::{derive_node_id, resource_id, NodeId, ResourceId};
pub use message::{Destination, ErrorCode, ErrorReply, Message, MessageKind};
pub use network::{AttachRequest, Connection, ConnectionTable, LinkState, OverlayNetwork};
pub use routing::{
    FingerEntry, NeighborView, Node, NodeState, OverlayState, RoutingTable, RoutingTableEntry,
    TopologyAction, TopologySnapshot,
};
pub use topology::{Topology, TopologyEvent};
