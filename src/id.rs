//! Identifiers on the 128-bit overlay ring.
//!
//! Peers and resources share one circular identifier space of size `2^128`.
//! All ordering questions in the overlay are answered with clockwise
//! distance and [`NodeId::element_of_interval`], never with plain integer
//! comparison.

use std::fmt;
use std::str::FromStr;

use iroh_blake3::Hasher;
use serde::{Deserialize, Serialize};

/// A 128-bit position on the overlay ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u128);

/// A resource identifier. Resources are placed on the same ring as peers.
pub type ResourceId = NodeId;

impl NodeId {
    /// Number of bits in an identifier, and therefore number of finger slots.
    pub const BITS: usize = 128;

    /// The identifier at position zero.
    pub const ZERO: NodeId = NodeId(0);

    /// Reserved wildcard destination, accepted by every peer as "local".
    pub const WILDCARD: NodeId = NodeId(u128::MAX);

    /// Wrap a raw ring position.
    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    /// The raw ring position.
    pub const fn value(self) -> u128 {
        self.0
    }

    /// Build an identifier from its 16-byte big-endian wire form.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    /// The 16-byte big-endian wire form.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Modular addition on the ring.
    pub fn wrapping_add(self, other: NodeId) -> NodeId {
        NodeId(self.0.wrapping_add(other.0))
    }

    /// `self + 2^exp` on the ring. Used to compute finger targets.
    pub fn add_pow2(self, exp: usize) -> NodeId {
        debug_assert!(exp < Self::BITS);
        NodeId(self.0.wrapping_add(1u128 << exp))
    }

    /// Clockwise distance walking from `self` to `other`.
    pub fn distance_to(self, other: NodeId) -> u128 {
        other.0.wrapping_sub(self.0)
    }

    /// Whether walking clockwise from `low` to `high` passes through `self`.
    ///
    /// The interval is always open at `low`. `inclusive` decides whether
    /// `high` itself belongs to it. When `low == high` the interval spans
    /// the whole ring except `low`, so only an inclusive test accepts
    /// `self == low`.
    pub fn element_of_interval(self, low: NodeId, high: NodeId, inclusive: bool) -> bool {
        let d_self = low.distance_to(self);
        if d_self == 0 {
            // self == low; only the full-ring inclusive case contains it
            return low == high && inclusive;
        }
        if low == high {
            return true;
        }
        let d_high = low.distance_to(high);
        if inclusive {
            d_self <= d_high
        } else {
            d_self < d_high
        }
    }
}

impl From<u128> for NodeId {
    fn from(raw: u128) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::LowerHex for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        u128::from_str_radix(trimmed, 16).map(NodeId)
    }
}

/// Compute a 128-bit identifier from the leading bytes of a BLAKE3 digest.
fn blake3_id(data: &[u8]) -> NodeId {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.as_bytes()[..16]);
    NodeId::from_bytes(out)
}

/// Derive a stable [`NodeId`] from arbitrary identity material,
/// typically the bytes of a peer certificate's public key.
///
/// ```
/// use reload_ring::derive_node_id;
///
/// let id = derive_node_id(b"example-public-key-bytes");
/// assert_eq!(id, derive_node_id(b"example-public-key-bytes"));
/// ```
pub fn derive_node_id(data: &[u8]) -> NodeId {
    blake3_id(data)
}

/// Map a resource name onto the ring.
pub fn resource_id(name: &[u8]) -> ResourceId {
    blake3_id(name)
}
