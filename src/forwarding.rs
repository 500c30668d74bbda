//! Per-message forwarding decisions.
//!
//! Every inbound message passes through [`ForwardingLayer::process_msg`],
//! which either keeps it for local delivery or consumes it by forwarding,
//! answering with an error, or dropping it. The decision itself is the
//! pure function [`route_message`], evaluated against a routing table
//! snapshot.
//!
//! Loop safety:
//! - a message whose originator is the local node is never forwarded again
//! - the via-list grows by at most one entry per hop and is bounded
//! - resource routing always makes ring progress unless delivering locally

use tracing::{debug, warn};

use crate::id::NodeId;
use crate::message::{Destination, ErrorCode, ErrorReply, Message};
use crate::network::{LinkState, OverlayNetwork};
use crate::routing::RoutingTable;
use crate::topology::Topology;

/// Why a message was dropped without an answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The message came back to the node that created it.
    SelfOriginated,
    /// The via-list is longer than the configured bound.
    ViaListOverflow,
    /// A node destination names the originator itself.
    DestinationIsOriginator,
    /// The local node is responsible, but more destinations follow.
    AmbiguousDestination,
}

/// Outcome of [`route_message`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardDecision {
    /// Hand the message to the local application or storage layer.
    Deliver,
    Drop(DropReason),
    /// Answer the last hop with an error and consume the message.
    Reply(ErrorReply),
    /// Send the message on toward this peer.
    Forward(NodeId),
}

/// Decide what to do with `message`.
///
/// Destination entries naming the local node are stripped from `message`
/// along the way, so a message kept for delivery carries only what is left.
pub fn route_message(
    rt: &RoutingTable,
    links: &dyn LinkState,
    message: &mut Message,
) -> ForwardDecision {
    let local = rt.local_id();

    if message.originator == local {
        warn!(
            transaction = message.transaction_id,
            "message looped back to its originator; dropping"
        );
        return ForwardDecision::Drop(DropReason::SelfOriginated);
    }
    if message.destination_list.is_empty() {
        return ForwardDecision::Reply(ErrorReply::for_message(
            message,
            ErrorCode::UnsupportedForwardingOption,
            "empty destination list",
        ));
    }
    let max_via = rt.config().max_via_list_len;
    if message.via_list.len() > max_via {
        warn!(
            transaction = message.transaction_id,
            via = message.via_list.len(),
            max_via,
            "via-list too long; dropping"
        );
        return ForwardDecision::Drop(DropReason::ViaListOverflow);
    }

    loop {
        let Some(head) = message.destination_list.first().cloned() else {
            return ForwardDecision::Deliver;
        };
        match head {
            Destination::Node(id) => {
                if id == message.originator {
                    warn!(peer = %id, "destination is the originator; dropping");
                    return ForwardDecision::Drop(DropReason::DestinationIsOriginator);
                }
                if message.via_list.contains(&id) {
                    warn!(
                        peer = %id,
                        via = ?message.via_list,
                        "destination already on the via-list; possible loop"
                    );
                }
                if id == local || id == NodeId::WILDCARD {
                    if message.destination_list.len() == 1 {
                        return ForwardDecision::Deliver;
                    }
                    message.destination_list.remove(0);
                    continue;
                }

                let next_hop = if links.has_live_connection(&id) || rt.is_attached(&id) {
                    Some(id)
                } else {
                    rt.find_next_hop(id, true, false, links)
                };
                return match next_hop {
                    Some(hop) if hop != local => ForwardDecision::Forward(hop),
                    _ => {
                        debug!(peer = %id, "no route to destination node");
                        ForwardDecision::Reply(ErrorReply::for_message(
                            message,
                            ErrorCode::NotFound,
                            format!("no route to {id}"),
                        ))
                    }
                };
            }
            Destination::Resource(id) => {
                if id == local {
                    return ForwardDecision::Deliver;
                }
                // self-originated messages were dropped above
                return match rt.find_next_hop(id, true, false, links) {
                    None => ForwardDecision::Deliver,
                    Some(hop) if hop == local => {
                        if message.destination_list.len() > 1 {
                            debug!(resource = %id, "responsible, but more destinations follow; dropping");
                            ForwardDecision::Drop(DropReason::AmbiguousDestination)
                        } else {
                            ForwardDecision::Deliver
                        }
                    }
                    Some(hop) => ForwardDecision::Forward(hop),
                };
            }
            Destination::Compressed(_) => {
                return ForwardDecision::Reply(ErrorReply::for_message(
                    message,
                    ErrorCode::UnsupportedForwardingOption,
                    "compressed destination lists are not supported",
                ));
            }
        }
    }
}

/// Rewrite the forwarding header before a message leaves this node.
fn prepare_forward(message: &mut Message, local: NodeId) {
    if message.is_request() {
        message.via_list.push(local);
    } else {
        // a response retraces its path through the destination list
        let vias = std::mem::take(&mut message.via_list);
        message
            .destination_list
            .extend(vias.into_iter().rev().map(Destination::Node));
    }
    message.last_hop = Some(local);
}

/// Entry point of the message dispatch loop.
pub struct ForwardingLayer<N: OverlayNetwork> {
    topology: Topology<N>,
}

impl<N: OverlayNetwork> ForwardingLayer<N> {
    pub fn new(topology: Topology<N>) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Topology<N> {
        &self.topology
    }

    /// Handle one inbound message.
    ///
    /// Returns `true` when the message was consumed (forwarded, answered
    /// with an error, or dropped) and `false` when it is for local
    /// delivery.
    pub async fn process_msg(&self, message: &mut Message) -> bool {
        let network = self.topology.network();
        let local = self.topology.local_id();
        let decision = {
            let rt = self.topology.routing().lock().await;
            route_message(&rt, &**network, message)
        };

        match decision {
            ForwardDecision::Deliver => false,
            ForwardDecision::Drop(reason) => {
                debug!(?reason, transaction = message.transaction_id, "message dropped");
                true
            }
            ForwardDecision::Reply(reply) => {
                debug!(code = %reply.code, to = %reply.to, "answering with error");
                if let Err(err) = network.send_error(reply).await {
                    warn!("failed to send error reply: {err:?}");
                }
                true
            }
            ForwardDecision::Forward(next_hop) => {
                prepare_forward(message, local);
                debug!(next_hop = %next_hop, transaction = message.transaction_id, "forwarding");
                if let Err(err) = network.send(message.clone(), next_hop).await {
                    warn!(next_hop = %next_hop, "failed to forward message: {err:?}");
                }
                true
            }
        }
    }
}
