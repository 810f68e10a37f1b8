// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Canonical state-root digesting for a [`Graph`].
//!
//! The root hash includes every node in ascending `NodeId` order and every
//! outbound edge per node in ascending `EdgeId` order. Length prefixes are
//! 8-byte little-endian and ids are raw 16-byte UUID values, following the
//! domain-separated, version-tagged digest convention used throughout this
//! crate (see [`crate::patch`]).

use crate::graph::Graph;
use crate::ident::Digest;

/// Domain-separation prefix for state-root digests.
const STATE_ROOT_V1: &[u8] = b"storytangl:state-root:v1";

fn write_len_prefixed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Computes the canonical root digest of a graph's committed state.
#[must_use]
pub fn compute_state_root(graph: &Graph) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(STATE_ROOT_V1);
    hasher.update(&graph.version.to_le_bytes());

    let nodes = graph.nodes_map();
    hasher.update(&(nodes.len() as u64).to_le_bytes());
    for (uid, node) in nodes {
        hasher.update(uid.as_uuid().as_bytes());
        write_len_prefixed(&mut hasher, node.label.as_bytes());
        hasher.update(&(node.tags.len() as u64).to_le_bytes());
        for tag in &node.tags {
            write_len_prefixed(&mut hasher, tag.as_bytes());
        }
    }

    let edges = graph.edges_map();
    hasher.update(&(edges.len() as u64).to_le_bytes());
    for (uid, edge) in edges {
        hasher.update(uid.as_uuid().as_bytes());
        hasher.update(edge.source_uid.as_uuid().as_bytes());
        match edge.destination_uid {
            Some(dst) => {
                hasher.update(&[1]);
                hasher.update(dst.as_uuid().as_bytes());
            }
            None => hasher.update(&[0]),
        }
    }

    *hasher.finalize().as_bytes()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::{Edge, EdgeKind, Node, NodeKind};
    use crate::ident::{EdgeId, NodeId};

    #[test]
    fn identical_graphs_produce_identical_digests() {
        let mut g1 = Graph::new();
        let mut g2 = Graph::new();
        let id = NodeId::new();
        g1.add_node(Node::new(id, NodeKind::Block, "room"));
        g2.add_node(Node::new(id, NodeKind::Block, "room"));
        assert_eq!(g1.snapshot_digest(), g2.snapshot_digest());
    }

    #[test]
    fn differing_labels_produce_differing_digests() {
        let mut g1 = Graph::new();
        let mut g2 = Graph::new();
        let id = NodeId::new();
        g1.add_node(Node::new(id, NodeKind::Block, "room"));
        g2.add_node(Node::new(id, NodeKind::Block, "hall"));
        assert_ne!(g1.snapshot_digest(), g2.snapshot_digest());
    }

    #[test]
    fn edges_affect_the_digest() {
        let mut g = Graph::new();
        let a = g.add_node(Node::new(NodeId::new(), NodeKind::Block, "a"));
        let b = g.add_node(Node::new(NodeId::new(), NodeKind::Block, "b"));
        let before = g.snapshot_digest();
        g.add_edge(Edge::new(EdgeId::new(), EdgeKind::Choice, a, Some(b), "go"))
            .unwrap();
        assert_ne!(before, g.snapshot_digest());
    }
}
