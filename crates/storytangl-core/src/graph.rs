// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! The story graph: an indexed bag of [`Node`]s and [`Edge`]s with
//! deterministic iteration order everywhere.
//!
//! `Graph` does not invoke dispatch itself — it has no `Context` to dispatch
//! through. The `create`/`link`/`unlink` hooks named in the component design
//! are raised by the commit path (see [`crate::patch`]) immediately after a
//! mutation lands, using the freshly committed [`Graph`] as the dispatch
//! target. This keeps `Graph` a plain, dependency-free data structure, the
//! same role `GraphStore` plays for its engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::{Edge, EdgeKind, Node, NodeKind};
use crate::error::{ErrorContext, StError, StResult};
use crate::ident::{Digest, EdgeId, NodeId};

/// Which tier of [`MediaRegistry`] resolved a `MediaDep` role lookup.
pub const MEDIA_SCOPE_WORLD: &str = "world";
/// See [`MEDIA_SCOPE_WORLD`].
pub const MEDIA_SCOPE_WORLD_SYSTEM: &str = "world_system";
/// See [`MEDIA_SCOPE_WORLD`].
pub const MEDIA_SCOPE_SYSTEM: &str = "system";

/// The three media-role bindings a graph carries, consulted in precedence
/// order world → world-system → system (spec §4.7 "Media resolution"): a
/// `MediaDep` edge's `label` names a role (e.g. `"portrait"`); each tier maps
/// role names to an absolute-style URL. A world-specific binding always
/// shadows a world-system one, which in turn shadows the system default —
/// the same "most specific wins" precedence the template registry's scope
/// selector uses (§4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaRegistry {
    /// Bindings specific to this world instance.
    pub world: BTreeMap<String, String>,
    /// Bindings shared by a family of worlds (e.g. a shared asset pack).
    pub world_system: BTreeMap<String, String>,
    /// Process-wide fallback bindings.
    pub system: BTreeMap<String, String>,
}

impl MediaRegistry {
    /// Resolves `role` against the three tiers in precedence order,
    /// returning the bound URL and which scope supplied it.
    #[must_use]
    pub fn resolve(&self, role: &str) -> Option<(&str, &'static str)> {
        self.world
            .get(role)
            .map(|url| (url.as_str(), MEDIA_SCOPE_WORLD))
            .or_else(|| {
                self.world_system
                    .get(role)
                    .map(|url| (url.as_str(), MEDIA_SCOPE_WORLD_SYSTEM))
            })
            .or_else(|| {
                self.system
                    .get(role)
                    .map(|url| (url.as_str(), MEDIA_SCOPE_SYSTEM))
            })
    }
}

/// A mutation raised by a committed change, for callers that want to react
/// to structural events (dispatch hooks, indices, logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphHook {
    /// A node was added.
    Create(NodeId),
    /// An edge was added.
    Link(EdgeId),
    /// An edge was removed.
    Unlink(EdgeId),
}

/// The indexed bag of entities that makes up one story graph.
///
/// Serializable so a caller (e.g. `storytangl-cli`, or any persistence
/// adapter satisfying the `storytangl-store` snapshot contract) can take a
/// point-in-time snapshot and restore it verbatim; `hooks` is transient
/// commit-path bookkeeping, always empty between ticks, and is not part of
/// the wire form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    edges_out: BTreeMap<NodeId, Vec<EdgeId>>,
    edges_in: BTreeMap<NodeId, Vec<EdgeId>>,
    label_index: BTreeMap<String, Vec<NodeId>>,
    tag_index: BTreeMap<String, Vec<NodeId>>,
    kind_index: BTreeMap<NodeKind, Vec<NodeId>>,
    /// The node traversal begins at, if the graph designates one.
    pub initial_cursor_id: Option<NodeId>,
    /// Monotone tick counter, advanced only by a committed patch.
    pub tick: u64,
    /// Equals the number of committed patches.
    pub version: u64,
    /// Media-role bindings consulted by `MediaDep` edge resolution.
    #[serde(default)]
    pub media: MediaRegistry,
    #[serde(skip)]
    hooks: Vec<GraphHook>,
}

impl Graph {
    /// Builds an empty graph at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates and inserts a node, updating every index. Records a
    /// [`GraphHook::Create`] for the commit path to dispatch.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let uid = node.uid;
        self.label_index
            .entry(node.label.clone())
            .or_default()
            .push(uid);
        for tag in &node.tags {
            self.tag_index.entry(tag.clone()).or_default().push(uid);
        }
        self.kind_index.entry(node.kind).or_default().push(uid);
        self.nodes.insert(uid, node);
        self.hooks.push(GraphHook::Create(uid));
        uid
    }

    /// Validates endpoints (unless the edge's kind permits an unresolved
    /// destination) and inserts the edge, updating adjacency maps.
    ///
    /// # Errors
    /// Returns [`StError::DanglingEndpoint`] if a required endpoint is
    /// missing from this graph.
    pub fn add_edge(&mut self, edge: Edge) -> StResult<EdgeId> {
        if !self.nodes.contains_key(&edge.source_uid) {
            return Err(StError::DanglingEndpoint { edge: edge.uid });
        }
        match edge.destination_uid {
            Some(dst) if !self.nodes.contains_key(&dst) => {
                return Err(StError::DanglingEndpoint { edge: edge.uid });
            }
            None if !edge.allows_unresolved_destination() => {
                return Err(StError::DanglingEndpoint { edge: edge.uid });
            }
            _ => {}
        }
        let uid = edge.uid;
        self.edges_out.entry(edge.source_uid).or_default().push(uid);
        if let Some(dst) = edge.destination_uid {
            self.edges_in.entry(dst).or_default().push(uid);
        }
        self.edges.insert(uid, edge);
        self.hooks.push(GraphHook::Link(uid));
        Ok(uid)
    }

    /// Removes an edge and recomputes (not patches) the adjacency buckets it
    /// touched, satisfying I5.
    ///
    /// # Errors
    /// Returns [`StError::NotFound`] if no such edge exists.
    pub fn remove_edge(&mut self, edge_id: EdgeId) -> StResult<()> {
        let edge = self.edges.remove(&edge_id).ok_or_else(|| {
            StError::not_found("edge", ErrorContext::uid(edge_id.to_string()))
        })?;
        self.recompute_out_bucket(edge.source_uid);
        if let Some(dst) = edge.destination_uid {
            self.recompute_in_bucket(dst);
        }
        self.hooks.push(GraphHook::Unlink(edge_id));
        Ok(())
    }

    fn recompute_out_bucket(&mut self, source: NodeId) {
        let ids: Vec<EdgeId> = self
            .edges
            .values()
            .filter(|e| e.source_uid == source)
            .map(|e| e.uid)
            .collect();
        if ids.is_empty() {
            self.edges_out.remove(&source);
        } else {
            self.edges_out.insert(source, ids);
        }
    }

    fn recompute_in_bucket(&mut self, dest: NodeId) {
        let ids: Vec<EdgeId> = self
            .edges
            .values()
            .filter(|e| e.destination_uid == Some(dest))
            .map(|e| e.uid)
            .collect();
        if ids.is_empty() {
            self.edges_in.remove(&dest);
        } else {
            self.edges_in.insert(dest, ids);
        }
    }

    /// Drains the accumulated hooks since the last call, for the commit path
    /// to dispatch `on_create`/`on_link`/`on_unlink`.
    pub fn drain_hooks(&mut self) -> Vec<GraphHook> {
        std::mem::take(&mut self.hooks)
    }

    /// Looks a node up by id.
    ///
    /// # Errors
    /// Returns [`StError::NotFound`] if no node has this uid.
    pub fn get(&self, uid: NodeId) -> StResult<&Node> {
        self.nodes
            .get(&uid)
            .ok_or_else(|| StError::not_found("node", ErrorContext::uid(uid.to_string())))
    }

    /// Mutable lookup by id, used only by the commit path applying effects.
    pub(crate) fn get_mut(&mut self, uid: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&uid)
    }

    /// Mutable edge lookup, used only by the commit path binding a
    /// provisioning requirement's `provider_id`/`is_unresolvable`.
    pub(crate) fn get_edge_mut(&mut self, uid: EdgeId) -> Option<&mut Edge> {
        self.edges.get_mut(&uid)
    }

    /// Looks a node up by exact label, failing if zero or more than one node
    /// carries it.
    ///
    /// # Errors
    /// Returns [`StError::NotFound`] if no node has this label, or
    /// [`StError::Ambiguous`] if more than one does.
    pub fn get_by_label(&self, label: &str) -> StResult<&Node> {
        let candidates = self.label_index.get(label).map(Vec::as_slice).unwrap_or(&[]);
        match candidates {
            [] => Err(StError::not_found("label", ErrorContext::label(label))),
            [only] => self.get(*only),
            _ => Err(StError::ambiguous("label", ErrorContext::label(label))),
        }
    }

    /// Returns an edge by id.
    ///
    /// # Errors
    /// Returns [`StError::NotFound`] if no edge has this uid.
    pub fn get_edge(&self, uid: EdgeId) -> StResult<&Edge> {
        self.edges
            .get(&uid)
            .ok_or_else(|| StError::not_found("edge", ErrorContext::uid(uid.to_string())))
    }

    /// Deterministic iteration over every node, in ascending uid order.
    pub fn iter_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Deterministic iteration over every edge, in ascending uid order.
    pub fn iter_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Filtered, deterministically ordered (by uid) search over nodes and
    /// edges. A `None` filter argument is treated as "don't filter on this".
    #[must_use]
    pub fn find_all(&self, filter: EntityFilter<'_>) -> FoundEntities {
        let nodes = self
            .nodes
            .values()
            .filter(|n| filter.matches_node(n))
            .map(|n| n.uid)
            .collect();
        let edges = self
            .edges
            .values()
            .filter(|e| filter.matches_edge(e, self))
            .map(|e| e.uid)
            .collect();
        FoundEntities { nodes, edges }
    }

    /// Outbound edges from `uid`, optionally restricted to one kind, in
    /// ascending edge-uid order.
    #[must_use]
    pub fn edges_out(&self, uid: NodeId, kind: Option<EdgeKind>) -> Vec<&Edge> {
        let mut ids: Vec<EdgeId> = self
            .edges_out
            .get(&uid)
            .cloned()
            .unwrap_or_default();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.edges.get(&id))
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .collect()
    }

    /// Inbound edges to `uid`, optionally restricted to one kind, in
    /// ascending edge-uid order.
    #[must_use]
    pub fn edges_in(&self, uid: NodeId, kind: Option<EdgeKind>) -> Vec<&Edge> {
        let mut ids: Vec<EdgeId> = self.edges_in.get(&uid).cloned().unwrap_or_default();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.edges.get(&id))
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .collect()
    }

    /// Walks `Child` edges from `uid` up to the root, nearest ancestor
    /// first, bounded by `max_depth` to guard against authoring cycles.
    #[must_use]
    pub fn ancestors(&self, uid: NodeId, max_depth: u32) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = uid;
        for _ in 0..max_depth {
            let Some(parent_edge) = self
                .edges_in(current, Some(EdgeKind::Child))
                .into_iter()
                .next()
            else {
                break;
            };
            current = parent_edge.source_uid;
            out.push(current);
        }
        out
    }

    /// Recomputes the label index from scratch. Called by the commit path
    /// after applying effects that may have renamed a node (I4, extended to
    /// the label index).
    pub(crate) fn reindex_label(&mut self) {
        self.label_index.clear();
        for node in self.nodes.values() {
            self.label_index
                .entry(node.label.clone())
                .or_default()
                .push(node.uid);
        }
    }

    /// Recomputes the tag index from scratch, mirroring [`Self::reindex_label`].
    pub(crate) fn reindex_tag(&mut self) {
        self.tag_index.clear();
        for node in self.nodes.values() {
            for tag in &node.tags {
                self.tag_index.entry(tag.clone()).or_default().push(node.uid);
            }
        }
    }

    /// Removes a node and every edge incident to it (cascading delete).
    pub(crate) fn delete_node_cascade(&mut self, uid: NodeId) {
        let incident: Vec<EdgeId> = self
            .edges
            .values()
            .filter(|e| e.source_uid == uid || e.destination_uid == Some(uid))
            .map(|e| e.uid)
            .collect();
        for edge_id in incident {
            let _ = self.remove_edge(edge_id);
        }
        self.nodes.remove(&uid);
        self.reindex_label();
        self.reindex_tag();
    }

    /// Canonical BLAKE3 digest over every entity in uid order: the root
    /// hash used by the snapshot store to detect divergence between a
    /// replayed graph and the one a patch was computed against.
    #[must_use]
    pub fn snapshot_digest(&self) -> Digest {
        crate::snapshot::compute_state_root(self)
    }

    /// Resolves a `MediaDep` role name against [`Self::media`]'s three tiers.
    #[must_use]
    pub fn resolve_media(&self, role: &str) -> Option<(&str, &'static str)> {
        self.media.resolve(role)
    }

    pub(crate) fn nodes_map(&self) -> &BTreeMap<NodeId, Node> {
        &self.nodes
    }

    pub(crate) fn edges_map(&self) -> &BTreeMap<EdgeId, Edge> {
        &self.edges
    }
}

/// A filter over [`Graph::find_all`]'s results. Every field is optional;
/// absent fields are not filtered on.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityFilter<'a> {
    /// Restrict nodes to this kind.
    pub node_kind: Option<NodeKind>,
    /// Restrict edges to this kind.
    pub edge_kind: Option<EdgeKind>,
    /// Restrict edges to this source.
    pub source_id: Option<NodeId>,
    /// Restrict edges to this destination.
    pub destination_id: Option<NodeId>,
    /// Restrict nodes to this exact label.
    pub label: Option<&'a str>,
    /// Restrict nodes to those carrying this tag.
    pub tag: Option<&'a str>,
}

impl<'a> EntityFilter<'a> {
    fn matches_node(&self, node: &Node) -> bool {
        self.node_kind.is_none_or(|k| node.kind == k)
            && self.label.is_none_or(|l| node.label == l)
            && self.tag.is_none_or(|t| node.tags.iter().any(|tag| tag == t))
    }

    fn matches_edge(&self, edge: &Edge, _graph: &Graph) -> bool {
        self.edge_kind.is_none_or(|k| edge.kind == k)
            && self.source_id.is_none_or(|s| edge.source_uid == s)
            && self.destination_id.is_none_or(|d| edge.destination_uid == Some(d))
    }
}

/// The uids matched by [`Graph::find_all`], in ascending order.
#[derive(Debug, Clone, Default)]
pub struct FoundEntities {
    /// Matched node ids.
    pub nodes: Vec<NodeId>,
    /// Matched edge ids.
    pub edges: Vec<EdgeId>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn block(label: &str) -> Node {
        Node::new(NodeId::new(), NodeKind::Block, label)
    }

    #[test]
    fn add_edge_rejects_dangling_endpoints() {
        let mut g = Graph::new();
        let a = g.add_node(block("a"));
        let missing = NodeId::new();
        let err = g
            .add_edge(Edge::new(EdgeId::new(), EdgeKind::Choice, a, Some(missing), "go"))
            .unwrap_err();
        assert!(matches!(err, StError::DanglingEndpoint { .. }));
    }

    #[test]
    fn dependency_edges_may_have_no_destination() {
        let mut g = Graph::new();
        let a = g.add_node(block("a"));
        let edge_id = g
            .add_edge(Edge::new(EdgeId::new(), EdgeKind::Dependency, a, None, "needs"))
            .expect("dependency edges allow unresolved destinations");
        assert!(g.get_edge(edge_id).is_ok());
    }

    #[test]
    fn get_by_label_is_ambiguous_for_duplicates() {
        let mut g = Graph::new();
        g.add_node(block("room"));
        g.add_node(block("room"));
        assert!(matches!(
            g.get_by_label("room").unwrap_err(),
            StError::Ambiguous { .. }
        ));
    }

    #[test]
    fn remove_edge_recomputes_adjacency_rather_than_leaving_a_tombstone() {
        let mut g = Graph::new();
        let a = g.add_node(block("a"));
        let b = g.add_node(block("b"));
        let edge_id = g
            .add_edge(Edge::new(EdgeId::new(), EdgeKind::Choice, a, Some(b), "go"))
            .unwrap();
        g.remove_edge(edge_id).unwrap();
        assert!(g.edges_out(a, None).is_empty());
        assert!(g.edges_in(b, None).is_empty());
    }

    #[test]
    fn ancestors_walks_child_edges_nearest_first() {
        let mut g = Graph::new();
        let root = g.add_node(block("root"));
        let mid = g.add_node(block("mid"));
        let leaf = g.add_node(block("leaf"));
        g.add_edge(Edge::new(EdgeId::new(), EdgeKind::Child, root, Some(mid), "c"))
            .unwrap();
        g.add_edge(Edge::new(EdgeId::new(), EdgeKind::Child, mid, Some(leaf), "c"))
            .unwrap();
        assert_eq!(g.ancestors(leaf, 10), vec![mid, root]);
    }

    #[test]
    fn media_resolution_prefers_world_over_world_system_over_system() {
        let mut g = Graph::new();
        g.media.system.insert("portrait".into(), "system://default-portrait".into());
        assert_eq!(g.resolve_media("portrait"), Some(("system://default-portrait", "system")));

        g.media.world_system.insert("portrait".into(), "pack://shared-portrait".into());
        assert_eq!(g.resolve_media("portrait"), Some(("pack://shared-portrait", "world_system")));

        g.media.world.insert("portrait".into(), "world://hero-portrait".into());
        assert_eq!(g.resolve_media("portrait"), Some(("world://hero-portrait", "world")));

        assert_eq!(g.resolve_media("backdrop"), None);
    }

    #[test]
    fn delete_node_cascade_removes_incident_edges() {
        let mut g = Graph::new();
        let a = g.add_node(block("a"));
        let b = g.add_node(block("b"));
        g.add_edge(Edge::new(EdgeId::new(), EdgeKind::Choice, a, Some(b), "go"))
            .unwrap();
        g.delete_node_cascade(a);
        assert!(g.get(a).is_err());
        assert!(g.edges_in(b, None).is_empty());
    }
}
