// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Static cluster topology for a partitioned virtual machine monitor.
//!
//! A guest's physical memory is split across a fixed set of monitor
//! processes ("nodes"), one virtual processor each. The node set is
//! configured once at launch and never changes at runtime; every node knows
//! the address of every other node. This crate holds that description plus
//! the one pure function derived from it: which node manages coherence for a
//! given physical page.

#![forbid(unsafe_code)]

use std::fmt;
use thiserror::Error;

/// Upper bound on the cluster size, set by the width of the per-page copyset
/// bitmask.
pub const MAX_NODES: usize = 64;

/// Identifies a node within the cluster.
///
/// Ids are dense integers in `[0, node_count)`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Returns the id as a table index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// The launch-time address of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An error validating a topology at construction.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("a cluster needs at least two nodes, got {0}")]
    TooFewNodes(usize),
    #[error("at most {MAX_NODES} nodes are supported, got {0}")]
    TooManyNodes(usize),
    #[error("bootstrap node {0} is not in the cluster")]
    BadBootstrap(NodeId),
}

/// The immutable description of the cluster: one address per node, indexed
/// by [`NodeId`], plus the designated bootstrap node that initially owns all
/// of guest memory.
#[derive(Clone, Debug)]
pub struct NodeTopology {
    nodes: Vec<PeerAddress>,
    bootstrap: NodeId,
}

impl NodeTopology {
    /// Validates and builds a topology. The external configuration loader is
    /// responsible for parsing; this constructor is the single point where a
    /// bad node count or bootstrap id is rejected, before any coherence
    /// traffic starts.
    pub fn new(nodes: Vec<PeerAddress>, bootstrap: NodeId) -> Result<Self, TopologyError> {
        if nodes.len() < 2 {
            return Err(TopologyError::TooFewNodes(nodes.len()));
        }
        if nodes.len() > MAX_NODES {
            return Err(TopologyError::TooManyNodes(nodes.len()));
        }
        if bootstrap.index() >= nodes.len() {
            return Err(TopologyError::BadBootstrap(bootstrap));
        }
        Ok(Self { nodes, bootstrap })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The node that initially owns every physical page.
    pub fn bootstrap(&self) -> NodeId {
        self.bootstrap
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.index() < self.nodes.len()
    }

    /// The launch-time address of `id`.
    ///
    /// Panics if `id` is not in the cluster.
    pub fn addr(&self, id: NodeId) -> &PeerAddress {
        &self.nodes[id.index()]
    }

    /// The node that serializes coherence transactions for `page_no`.
    ///
    /// This is a pure function of the page number and the node count, so it
    /// never needs to be communicated or reassigned.
    pub fn manager_of(&self, page_no: u32) -> NodeId {
        NodeId(page_no % self.nodes.len() as u32)
    }

    /// All node ids, in order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// All node ids except `this`.
    pub fn peers_of(&self, this: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.ids().filter(move |&id| id != this)
    }
}

#[cfg(test)]
mod tests {
    use super::NodeId;
    use super::NodeTopology;
    use super::PeerAddress;
    use super::TopologyError;

    fn local_nodes(n: usize) -> Vec<PeerAddress> {
        (0..n)
            .map(|i| PeerAddress::new("localhost", 9000 + i as u16))
            .collect()
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(matches!(
            NodeTopology::new(local_nodes(1), NodeId(0)),
            Err(TopologyError::TooFewNodes(1))
        ));
        assert!(matches!(
            NodeTopology::new(local_nodes(65), NodeId(0)),
            Err(TopologyError::TooManyNodes(65))
        ));
        assert!(matches!(
            NodeTopology::new(local_nodes(2), NodeId(2)),
            Err(TopologyError::BadBootstrap(NodeId(2)))
        ));
    }

    #[test]
    fn manager_assignment_cycles_over_nodes() {
        let topology = NodeTopology::new(local_nodes(3), NodeId(0)).unwrap();
        assert_eq!(topology.manager_of(0), NodeId(0));
        assert_eq!(topology.manager_of(7), NodeId(1));
        assert_eq!(topology.manager_of(8), NodeId(2));
        assert_eq!(topology.manager_of(9), NodeId(0));
    }

    #[test]
    fn peer_enumeration_skips_self() {
        let topology = NodeTopology::new(local_nodes(3), NodeId(0)).unwrap();
        let peers: Vec<_> = topology.peers_of(NodeId(1)).collect();
        assert_eq!(peers, [NodeId(0), NodeId(2)]);
    }
}
