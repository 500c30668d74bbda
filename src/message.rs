//! Message model seen by the forwarding layer.
//!
//! Only the forwarding header matters here: originator, destination list,
//! via-list and last hop. The body is carried as opaque bytes; encoding it
//! is the transport's concern.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{NodeId, ResourceId};

/// One entry of a destination list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// A specific peer.
    Node(NodeId),
    /// Whichever peer is responsible for this ring position.
    Resource(ResourceId),
    /// An opaque compressed destination list. Not supported for forwarding.
    Compressed(Vec<u8>),
}

/// Request or response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
}

/// A message in transit through the overlay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Peer that created the message.
    pub originator: NodeId,
    /// Transaction the message belongs to.
    pub transaction_id: u64,
    /// Peer the message was last received from, if any.
    pub last_hop: Option<NodeId>,
    /// Remaining destinations, head first.
    pub destination_list: Vec<Destination>,
    /// Hops the message has already been forwarded through.
    pub via_list: Vec<NodeId>,
    /// Request or response.
    pub kind: MessageKind,
    /// Opaque message body.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a request from `originator` to a single destination.
    pub fn request(originator: NodeId, transaction_id: u64, destination: Destination) -> Self {
        Self {
            originator,
            transaction_id,
            last_hop: None,
            destination_list: vec![destination],
            via_list: Vec::new(),
            kind: MessageKind::Request,
            payload: Vec::new(),
        }
    }

    /// Build the response to `request`, sent by `responder`.
    ///
    /// The response retraces the request: its destination list is the
    /// reversed via-list followed by the request's originator.
    pub fn response_to(request: &Message, responder: NodeId, payload: Vec<u8>) -> Self {
        let mut destination_list: Vec<Destination> = request
            .via_list
            .iter()
            .rev()
            .map(|hop| Destination::Node(*hop))
            .collect();
        destination_list.push(Destination::Node(request.originator));
        Self {
            originator: responder,
            transaction_id: request.transaction_id,
            last_hop: None,
            destination_list,
            via_list: Vec::new(),
            kind: MessageKind::Response,
            payload,
        }
    }

    /// Replace the body.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    /// Where error replies about this message go: the last hop, or the
    /// originator when the message came straight from it.
    pub fn reply_target(&self) -> NodeId {
        self.last_hop.unwrap_or(self.originator)
    }
}

/// RELOAD error codes emitted by the forwarding layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Forbidden,
    NotFound,
    RequestTimeout,
    UnsupportedForwardingOption,
    TtlExceeded,
    MessageTooLarge,
    InvalidMessage,
}

impl ErrorCode {
    /// Numeric code as carried on the wire.
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::Forbidden => 2,
            ErrorCode::NotFound => 3,
            ErrorCode::RequestTimeout => 4,
            ErrorCode::UnsupportedForwardingOption => 7,
            ErrorCode::TtlExceeded => 10,
            ErrorCode::MessageTooLarge => 11,
            ErrorCode::InvalidMessage => 20,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Forbidden => "Error_Forbidden",
            ErrorCode::NotFound => "Error_Not_Found",
            ErrorCode::RequestTimeout => "Error_Request_Timeout",
            ErrorCode::UnsupportedForwardingOption => "Error_Unsupported_Forwarding_Option",
            ErrorCode::TtlExceeded => "Error_TTL_Exceeded",
            ErrorCode::MessageTooLarge => "Error_Message_Too_Large",
            ErrorCode::InvalidMessage => "Error_Invalid_Message",
        };
        f.write_str(name)
    }
}

/// An error answer the transport should build and send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Peer the answer is addressed to.
    pub to: NodeId,
    pub code: ErrorCode,
    /// Human readable reason.
    pub reason: String,
    /// Transaction of the message being answered.
    pub transaction_id: u64,
}

impl ErrorReply {
    /// Error answer to `message`, addressed to its last hop.
    pub fn for_message(message: &Message, code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            to: message.reply_target(),
            code,
            reason: reason.into(),
            transaction_id: message.transaction_id,
        }
    }
}
