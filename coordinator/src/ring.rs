//! Consistent hash ring for assigning transactions to validating nodes.
//!
//! Each node occupies `weight` positions on a 64-bit ring. Lookup walks
//! clockwise from the key's hash collecting distinct healthy nodes, so a
//! membership change only remaps keys adjacent to the changed node's
//! positions.

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use paycore_common::NodeId;

/// A participant eligible for validation duty.
#[derive(Debug, Clone)]
pub struct RingNode {
    /// Node identifier.
    pub node_id: NodeId,
    /// Number of virtual positions this node occupies.
    pub weight: u32,
    /// Externally reported health; unhealthy nodes are skipped at lookup.
    pub healthy: bool,
}

impl RingNode {
    /// Create a healthy node with the given weight.
    pub fn new(node_id: NodeId, weight: u32) -> Self {
        Self {
            node_id,
            weight,
            healthy: true,
        }
    }
}

/// Consistent hash ring over validating nodes.
pub struct ConsistentHashRing {
    /// Ring positions in sorted order.
    positions: BTreeMap<u64, NodeId>,
    /// Node records by id.
    nodes: HashMap<NodeId, RingNode>,
}

impl ConsistentHashRing {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self {
            positions: BTreeMap::new(),
            nodes: HashMap::new(),
        }
    }

    /// Create a ring from a set of nodes.
    pub fn with_nodes(nodes: impl IntoIterator<Item = RingNode>) -> Self {
        let mut ring = Self::new();
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    /// Add a node, hashing it into `weight` positions.
    pub fn add_node(&mut self, node: RingNode) {
        for replica in 0..node.weight {
            let position = Self::position_hash(&node.node_id, replica);
            self.positions.insert(position, node.node_id.clone());
        }
        self.nodes.insert(node.node_id.clone(), node);
    }

    /// Remove a node and all of its positions.
    pub fn remove_node(&mut self, node_id: &NodeId) {
        if let Some(node) = self.nodes.remove(node_id) {
            for replica in 0..node.weight {
                let position = Self::position_hash(node_id, replica);
                self.positions.remove(&position);
            }
        }
    }

    /// Update a node's reported health. Unknown nodes are ignored.
    pub fn set_healthy(&mut self, node_id: &NodeId, healthy: bool) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.healthy = healthy;
        }
    }

    /// Number of member nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of currently healthy members.
    pub fn healthy_count(&self) -> usize {
        self.nodes.values().filter(|n| n.healthy).count()
    }

    /// The ordered set of nodes responsible for `key`.
    ///
    /// Walks clockwise from the first position at or after the key's hash,
    /// wrapping, collecting up to `replication` distinct healthy nodes.
    /// With fewer healthy nodes than `replication`, all healthy nodes are
    /// returned; quorum policy is the coordinator's concern, not the ring's.
    pub fn nodes_for(&self, key: &[u8], replication: usize) -> Vec<NodeId> {
        let mut selected: Vec<NodeId> = Vec::with_capacity(replication);
        if self.positions.is_empty() || replication == 0 {
            return selected;
        }

        let start = Self::key_hash(key);
        let clockwise = self
            .positions
            .range(start..)
            .chain(self.positions.range(..start));

        for (_, node_id) in clockwise {
            if selected.len() == replication {
                break;
            }
            if selected.contains(node_id) {
                continue;
            }
            let healthy = self
                .nodes
                .get(node_id)
                .map(|n| n.healthy)
                .unwrap_or(false);
            if healthy {
                selected.push(node_id.clone());
            }
        }
        selected
    }

    /// Position of a node replica on the ring.
    fn position_hash(node_id: &NodeId, replica: u32) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(node_id.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(replica.to_be_bytes());
        Self::truncate(hasher.finalize().as_slice())
    }

    /// Hash of a lookup key.
    fn key_hash(key: &[u8]) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(key);
        Self::truncate(hasher.finalize().as_slice())
    }

    fn truncate(digest: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }
}

impl Default for ConsistentHashRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ring_of(names: &[&str]) -> ConsistentHashRing {
        ConsistentHashRing::with_nodes(
            names
                .iter()
                .map(|n| RingNode::new(NodeId::new(*n), 100)),
        )
    }

    #[test]
    fn test_lookup_deterministic() {
        let ring = ring_of(&["node1", "node2", "node3"]);
        let a = ring.nodes_for(b"tx-123", 2);
        let b = ring.nodes_for(b"tx-123", 2);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_ne!(a[0], a[1]);
    }

    #[test]
    fn test_fewer_healthy_than_replication_returns_all_healthy() {
        let mut ring = ring_of(&["node1", "node2", "node3"]);
        ring.set_healthy(&NodeId::new("node2"), false);
        ring.set_healthy(&NodeId::new("node3"), false);

        let selected = ring.nodes_for(b"tx-123", 3);
        assert_eq!(selected, vec![NodeId::new("node1")]);
    }

    #[test]
    fn test_unhealthy_nodes_skipped() {
        let mut ring = ring_of(&["node1", "node2", "node3"]);
        ring.set_healthy(&NodeId::new("node1"), false);

        for key in 0..50u32 {
            let selected = ring.nodes_for(&key.to_be_bytes(), 2);
            assert!(!selected.contains(&NodeId::new("node1")));
        }
    }

    #[test]
    fn test_empty_ring_returns_empty() {
        let ring = ConsistentHashRing::new();
        assert!(ring.nodes_for(b"tx", 3).is_empty());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_remove_node_clears_positions() {
        let mut ring = ring_of(&["node1", "node2"]);
        ring.remove_node(&NodeId::new("node1"));

        assert_eq!(ring.len(), 1);
        for key in 0..50u32 {
            let selected = ring.nodes_for(&key.to_be_bytes(), 1);
            assert_eq!(selected, vec![NodeId::new("node2")]);
        }
    }

    #[test]
    fn test_membership_change_remaps_bounded_fraction() {
        let before = ring_of(&["node1", "node2", "node3", "node4"]);
        let after = ring_of(&["node1", "node2", "node3", "node4", "node5"]);

        let mut moved = 0;
        let samples = 1000;
        for key in 0..samples as u32 {
            let old = before.nodes_for(&key.to_be_bytes(), 1);
            let new = after.nodes_for(&key.to_be_bytes(), 1);
            if old != new {
                moved += 1;
            }
        }

        // Adding one of five nodes should move roughly 1/5 of keys; it must
        // never remap everything.
        assert!(moved > 0, "new node received no keys");
        assert!(moved < samples / 2, "moved {} of {} keys", moved, samples);
    }

    proptest! {
        #[test]
        fn prop_lookup_distinct_and_healthy(key in any::<[u8; 16]>(), replication in 1usize..5) {
            let ring = ring_of(&["node1", "node2", "node3"]);
            let selected = ring.nodes_for(&key, replication);

            prop_assert_eq!(selected.len(), replication.min(3));
            let mut dedup = selected.clone();
            dedup.dedup();
            prop_assert_eq!(dedup.len(), selected.len());
        }
    }
}
