// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! The effect buffer: the only place handlers may record mutations during a
//! phase. Nothing in `EFFECTS`/`PLANNING`/`JOURNAL`/`BOOKKEEPING` touches the
//! base [`Graph`] directly — every change is staged here, previewed through
//! a cached copy-on-read clone, and only applied to the graph at commit.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Edge, Node};
use crate::ident::{EdgeId, NodeId, TickId};
use crate::journal::Fragment;
use crate::value::Value;

/// A deterministic id generator seeded by a tick's `rng_seed`: the `n`th id
/// allocated from the same seed is always the same uuid, which is what
/// lets `step(graph, choice, seed)` stay a pure function (§8 determinism).
/// Ids are derived with domain-separated BLAKE3 rather than a seeded PRNG
/// stream, so allocation order is the only thing that matters, not which
/// PRNG implementation produced a particular `u128`.
#[derive(Debug)]
struct IdAllocator {
    rng_seed: u64,
    next_index: Cell<u64>,
}

impl IdAllocator {
    const fn new(rng_seed: u64) -> Self {
        Self {
            rng_seed,
            next_index: Cell::new(0),
        }
    }

    fn next_uuid(&self, domain: &[u8]) -> Uuid {
        let index = self.next_index.get();
        self.next_index.set(index + 1);
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"storytangl:detid:v1");
        hasher.update(domain);
        hasher.update(&self.rng_seed.to_le_bytes());
        hasher.update(&index.to_le_bytes());
        let hash = hasher.finalize();
        #[allow(clippy::expect_used)] // blake3 digests are always 32 bytes; slicing 16 never fails
        let bytes: [u8; 16] = hash.as_bytes()[..16]
            .try_into()
            .expect("blake3 output is at least 16 bytes");
        Uuid::from_bytes(bytes)
    }

    fn next_node_id(&self) -> NodeId {
        NodeId::from_uuid(self.next_uuid(b"node"))
    }

    fn next_edge_id(&self) -> EdgeId {
        EdgeId::from_uuid(self.next_uuid(b"edge"))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A single atomic mutation enqueued during a tick.
///
/// Variant order here doubles as `Effect::sort_key`'s tie-break order for
/// effects that land on the same `(uid, path)` — see [`crate::patch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    /// Materializes a new node. `data` seeds its locals.
    CreateNode {
        /// The uid to materialize under (pre-allocated so downstream
        /// effects in the same tick can reference it before commit).
        uid: NodeId,
        /// The node's kind.
        kind: crate::entity::NodeKind,
        /// Initial locals.
        data: BTreeMap<String, Value>,
    },
    /// Materializes a new edge.
    AddEdge {
        /// The uid to materialize under.
        uid: EdgeId,
        /// Source endpoint.
        src: NodeId,
        /// Destination endpoint, if resolved.
        dst: Option<NodeId>,
        /// The edge's kind.
        kind: crate::entity::EdgeKind,
        /// Extra fields (label, predicate, etc.), keyed by field name.
        fields: BTreeMap<String, Value>,
    },
    /// Removes an edge.
    DelEdge {
        /// The edge to remove.
        uid: EdgeId,
    },
    /// Removes a node and every edge incident to it.
    DelNode {
        /// The node to remove.
        uid: NodeId,
    },
    /// Sets a single attribute path on an entity (e.g. `locals.score`).
    SetAttr {
        /// The entity to mutate.
        uid: NodeId,
        /// A dotted path into the entity, e.g. `"locals.score"`.
        path: String,
        /// The new value.
        value: Value,
    },
    /// Moves the cursor.
    SetCursor {
        /// The new cursor.
        uid: NodeId,
    },
    /// Pushes a subroutine call frame.
    PushFrame {
        /// The frame to push.
        frame: crate::context::StackFrame,
    },
    /// Pops the current subroutine call frame.
    PopFrame,
    /// Binds (or marks unresolvable) a [`crate::entity::Requirement`] living
    /// on a `Dependency`/`Affordance` edge. This is PLANNING's sole
    /// mutation: requirements are never touched outside the commit path.
    BindRequirement {
        /// The edge whose `requirement` field is being updated.
        edge_uid: EdgeId,
        /// The bound provider, or `None` if this merely flags
        /// `is_unresolvable`.
        provider_id: Option<NodeId>,
        /// Set when a hard requirement could not be bound this tick.
        is_unresolvable: bool,
    },
}

impl Effect {
    /// The `(uid, path)` pair effects are coalesced/deduplicated on, for
    /// canonicalization. `None` for effects that don't target one entity
    /// field (cursor moves, frame pushes/pops), which are never coalesced.
    #[must_use]
    pub fn coalesce_key(&self) -> Option<(NodeId, &str)> {
        match self {
            Self::SetAttr { uid, path, .. } => Some((*uid, path.as_str())),
            _ => None,
        }
    }

    /// The uid an `AddEdge`/`CreateNode` effect is deduplicated by.
    #[must_use]
    pub fn dedupe_key(&self) -> Option<EntityUid> {
        match self {
            Self::CreateNode { uid, .. } => Some(EntityUid::Node(*uid)),
            Self::AddEdge { uid, .. } => Some(EntityUid::Edge(*uid)),
            _ => None,
        }
    }
}

/// Either kind of uid an effect's dedup key may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityUid {
    /// A node uid.
    Node(NodeId),
    /// An edge uid.
    Edge(EdgeId),
}

/// Tick-local accumulator for effects and journal fragments. Owned
/// exclusively by the [`crate::context::Context`] for the tick; never
/// escapes the tick boundary.
#[derive(Debug, Default)]
pub struct EffectBuffer {
    effects: Vec<Effect>,
    journal: Vec<Fragment>,
    preview_cache: RefCell<Option<crate::graph::Graph>>,
    ids: IdAllocator,
}

impl EffectBuffer {
    /// A fresh, empty buffer seeded at 0. Most callers construct a
    /// [`crate::context::Context`] this way and then replace `effects` with
    /// [`Self::with_seed`] once the tick's actual `rng_seed` is known.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, empty buffer whose `create_node`/`add_edge` calls allocate
    /// ids deterministically from `rng_seed`.
    #[must_use]
    pub fn with_seed(rng_seed: u64) -> Self {
        Self {
            ids: IdAllocator::new(rng_seed),
            ..Self::default()
        }
    }

    /// The seed this buffer's id allocator was built with.
    #[must_use]
    pub const fn rng_seed(&self) -> u64 {
        self.ids.rng_seed
    }

    /// Appends an effect and invalidates the preview cache.
    pub fn emit(&mut self, effect: Effect) {
        self.effects.push(effect);
        self.preview_cache.borrow_mut().take();
    }

    /// Appends a fragment to the journal side-channel; does not affect the
    /// preview cache.
    pub fn say(&mut self, fragment: Fragment) {
        self.journal.push(fragment);
    }

    /// Allocates a fresh node uid and emits a `CreateNode` effect.
    pub fn create_node(
        &mut self,
        kind: crate::entity::NodeKind,
        data: BTreeMap<String, Value>,
    ) -> NodeId {
        let uid = self.ids.next_node_id();
        self.emit(Effect::CreateNode { uid, kind, data });
        uid
    }

    /// Allocates a fresh edge uid and emits an `AddEdge` effect.
    pub fn add_edge(
        &mut self,
        src: NodeId,
        dst: Option<NodeId>,
        kind: crate::entity::EdgeKind,
        fields: BTreeMap<String, Value>,
    ) -> EdgeId {
        let uid = self.ids.next_edge_id();
        self.emit(Effect::AddEdge {
            uid,
            src,
            dst,
            kind,
            fields,
        });
        uid
    }

    /// Emits a `DelEdge` effect.
    pub fn del_edge(&mut self, uid: EdgeId) {
        self.emit(Effect::DelEdge { uid });
    }

    /// Emits a `SetAttr` effect.
    pub fn set_attr(&mut self, uid: NodeId, path: impl Into<String>, value: Value) {
        self.emit(Effect::SetAttr {
            uid,
            path: path.into(),
            value,
        });
    }

    /// Emits a `BindRequirement` effect, PLANNING's way of recording a
    /// requirement's resolution (or failure to resolve).
    pub fn bind_requirement(&mut self, edge_uid: EdgeId, provider_id: Option<NodeId>, is_unresolvable: bool) {
        self.emit(Effect::BindRequirement {
            edge_uid,
            provider_id,
            is_unresolvable,
        });
    }

    /// Every effect emitted so far, in emission order (not yet
    /// canonicalized).
    #[must_use]
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Every fragment said so far.
    #[must_use]
    pub fn journal(&self) -> &[Fragment] {
        &self.journal
    }

    /// Returns a lazily-cloned graph with every emitted effect applied on
    /// top of `base`, cached until the next `emit`. This is what
    /// read-your-writes dispatch (downstream handlers in the same phase)
    /// reads instead of the base graph.
    pub fn preview(&self, base: &crate::graph::Graph) -> crate::graph::Graph {
        if let Some(cached) = self.preview_cache.borrow().as_ref() {
            return cached.clone();
        }
        let mut overlay = base.clone();
        for effect in &self.effects {
            crate::patch::apply_effect(&mut overlay, effect);
        }
        *self.preview_cache.borrow_mut() = Some(overlay.clone());
        overlay
    }

    /// Canonicalizes the buffered effects (dedup/coalesce) and produces a
    /// [`crate::patch::Patch`] ready to commit.
    #[must_use]
    pub fn to_patch(&self, tick_id: TickId, base_version: u64, rng_seed: u64) -> crate::patch::Patch {
        crate::patch::Patch::new(
            tick_id,
            base_version,
            rng_seed,
            self.effects.clone(),
            self.journal.clone(),
            None,
        )
    }

    /// True once discarded at commit, or before any effect has been
    /// emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.journal.is_empty()
    }
}

/// Applies a single effect's node-construction half directly, used by
/// [`EffectBuffer::preview`] and the commit path. Exposed so `patch` can
/// share the exact same apply logic for both preview and commit — the
/// canonicalization/determinism property in the testable-properties list
/// (`apply(canonicalize(E)) ≡ apply(E)`) depends on there being exactly one
/// apply implementation.
pub(crate) fn new_node_from_create(
    uid: NodeId,
    kind: crate::entity::NodeKind,
    data: &BTreeMap<String, Value>,
) -> Node {
    let mut node = Node::new(uid, kind, String::new());
    node.locals = data.clone();
    if let Some(Value::Str(label)) = data.get("label") {
        node.label = label.clone();
    }
    if let Some(Value::Str(content)) = data.get("content") {
        node.content = Some(content.clone());
    }
    node
}

/// Builds an [`Edge`] from an `AddEdge` effect's fields, used by
/// [`crate::patch::apply_effect`].
pub(crate) fn new_edge_from_add(
    uid: EdgeId,
    src: NodeId,
    dst: Option<NodeId>,
    kind: crate::entity::EdgeKind,
    fields: &BTreeMap<String, Value>,
) -> Edge {
    let label = match fields.get("label") {
        Some(Value::Str(s)) => s.clone(),
        _ => String::new(),
    };
    let mut edge = Edge::new(uid, kind, src, dst, label);
    if let Some(Value::Str(expr)) = fields.get("predicate") {
        edge.predicate = Some(expr.clone());
    }
    edge
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::NodeKind;
    use crate::graph::Graph;

    #[test]
    fn preview_reflects_emitted_creates_without_touching_base() {
        let base = Graph::new();
        let mut buf = EffectBuffer::new();
        let uid = buf.create_node(NodeKind::Block, BTreeMap::new());
        let preview = buf.preview(&base);
        assert!(preview.get(uid).is_ok());
        assert!(base.get(uid).is_err());
    }

    #[test]
    fn emit_invalidates_the_preview_cache() {
        let base = Graph::new();
        let mut buf = EffectBuffer::new();
        let first = buf.create_node(NodeKind::Block, BTreeMap::new());
        let _ = buf.preview(&base);
        let second = buf.create_node(NodeKind::Block, BTreeMap::new());
        let preview = buf.preview(&base);
        assert!(preview.get(first).is_ok());
        assert!(preview.get(second).is_ok());
    }
}
