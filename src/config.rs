//! Topology configuration.
//!
//! A [`TopologyConfig`] is built once at node startup and handed to
//! [`crate::Topology::new`]. It never changes afterwards; overlay state that
//! does change (joined or not, the admitting peer) lives in the routing table.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while validating a [`TopologyConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("successor cache size must be at least 1")]
    ZeroSuccessorCache,

    #[error("predecessor cache size must be at least 1")]
    ZeroPredecessorCache,

    #[error("max via-list length must be at least 1")]
    ZeroViaListBound,

    #[error("learned-from table capacity must be at least 1")]
    ZeroLearnedFromCapacity,
}

/// How this node takes part in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// A routing ring member.
    #[default]
    Peer,
    /// The first node of the overlay. Counts as joined from the start.
    Bootstrap,
    /// Never joins the ring; all traffic is relayed by the admitting peer.
    Client,
}

/// Ring maintenance and forwarding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Maximum number of successors kept.
    #[serde(default = "TopologyConfig::default_successor_cache_size")]
    pub successor_cache_size: usize,
    /// Maximum number of predecessors kept.
    #[serde(default = "TopologyConfig::default_predecessor_cache_size")]
    pub predecessor_cache_size: usize,
    /// Messages whose via-list is longer than this are dropped.
    #[serde(default = "TopologyConfig::default_max_via_list_len")]
    pub max_via_list_len: usize,
    /// How long a departed peer is kept out of merged neighbor sets.
    #[serde(default = "TopologyConfig::default_leaving_grace_secs")]
    pub leaving_grace_secs: u64,
    /// Bound of the table remembering which neighbor introduced an id.
    #[serde(default = "TopologyConfig::default_learned_from_capacity")]
    pub learned_from_capacity: usize,
    /// Ring role of this node.
    #[serde(default)]
    pub role: NodeRole,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            successor_cache_size: Self::default_successor_cache_size(),
            predecessor_cache_size: Self::default_predecessor_cache_size(),
            max_via_list_len: Self::default_max_via_list_len(),
            leaving_grace_secs: Self::default_leaving_grace_secs(),
            learned_from_capacity: Self::default_learned_from_capacity(),
            role: NodeRole::default(),
        }
    }
}

impl TopologyConfig {
    fn default_successor_cache_size() -> usize {
        3
    }

    fn default_predecessor_cache_size() -> usize {
        3
    }

    fn default_max_via_list_len() -> usize {
        32
    }

    fn default_leaving_grace_secs() -> u64 {
        60
    }

    fn default_learned_from_capacity() -> usize {
        1024
    }

    /// Same configuration with both neighbor caches set to `size`.
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.successor_cache_size = size;
        self.predecessor_cache_size = size;
        self
    }

    /// Same configuration with a different role.
    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    /// The LeavingNodes grace window.
    pub fn leaving_grace(&self) -> Duration {
        Duration::from_secs(self.leaving_grace_secs)
    }

    /// Reject configurations the routing table cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.successor_cache_size == 0 {
            return Err(ConfigError::ZeroSuccessorCache);
        }
        if self.predecessor_cache_size == 0 {
            return Err(ConfigError::ZeroPredecessorCache);
        }
        if self.max_via_list_len == 0 {
            return Err(ConfigError::ZeroViaListBound);
        }
        if self.learned_from_capacity == 0 {
            return Err(ConfigError::ZeroLearnedFromCapacity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TopologyConfig::default();
        assert_eq!(config.successor_cache_size, 3);
        assert_eq!(config.leaving_grace(), Duration::from_secs(60));
        assert_eq!(config.role, NodeRole::Peer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let config = TopologyConfig::default().with_cache_size(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroSuccessorCache));

        let config = TopologyConfig {
            max_via_list_len: 0,
            ..TopologyConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroViaListBound));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: TopologyConfig =
            serde_json::from_str(r#"{ "successor_cache_size": 5, "role": "client" }"#)
                .expect("config parses");
        assert_eq!(config.successor_cache_size, 5);
        assert_eq!(config.predecessor_cache_size, 3);
        assert_eq!(config.max_via_list_len, 32);
        assert_eq!(config.role, NodeRole::Client);
    }
}
