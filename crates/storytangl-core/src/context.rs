// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Per-tick execution state: the call stack, cursor history, namespace
//! resolution, and cancellation.
//!
//! `Context` does not hold a `&mut Graph` the way the component design's
//! prose describes it, even though that is the literal field list in §4.3.
//! Every operation that needs the graph (namespace resolution walking
//! ancestors, dispatch) takes a `&Graph`/preview `Graph` argument instead.
//! Splitting it out this way avoids threading a single mutable borrow of the
//! graph through every handler closure — the phase engine owns the graph and
//! passes it alongside `&mut Context` wherever both are needed, which reads
//! the same as the spec's Context but is representable without lifetime
//! parameters infecting `Handler`'s `dyn Fn` type.

use std::cell::Cell;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dispatch::{HandlerRegistry, Receipt};
use crate::effect::EffectBuffer;
use crate::entity::{EdgeKind, Node, NodeKind};
use crate::graph::Graph;
use crate::ident::NodeId;
use crate::value::Value;

/// A record of a subroutine invocation on the call stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Where to resume once this frame pops.
    pub return_cursor_id: NodeId,
    /// The label of the edge that pushed this frame, for diagnostics.
    pub call_site_label: String,
    /// This frame's depth (1 for the first call).
    pub depth: u32,
}

/// Per-tick mutable execution state.
#[derive(Debug)]
pub struct Context {
    /// The node the tick is advancing from.
    pub cursor_id: NodeId,
    /// Append-only within the tick and across ticks: every cursor the
    /// traversal has visited, oldest first.
    pub cursor_history: Vec<NodeId>,
    /// The subroutine call stack, persisted in the graph across ticks.
    pub call_stack: Vec<StackFrame>,
    /// Tick-local mutation accumulator.
    pub effects: EffectBuffer,
    /// Phase-local handler results; cleared between phases.
    pub call_receipts: Vec<Receipt>,
    /// Tick-local namespace overrides, highest-precedence in `ns()`.
    pub ns_overrides: BTreeMap<String, Value>,
    /// `LOCAL`-layer handlers installed on this Context for its lifetime.
    pub local_handlers: HandlerRegistry,
    /// Domains active for this tick, consulted by `DOMAIN`-layer selectors.
    pub active_domains: Vec<String>,
    cancelled: bool,
    /// Nesting counter guarding `ns()`'s concept-child fallback against an
    /// authoring cycle (two concepts whose content reference each other).
    concept_depth: Cell<u32>,
}

impl Context {
    /// Builds a fresh context for a tick beginning at `cursor_id`, with
    /// empty history/call-stack. Callers resuming an existing playthrough
    /// should use [`Self::resume`] instead, to carry history and the call
    /// stack forward.
    #[must_use]
    pub fn new(cursor_id: NodeId) -> Self {
        Self {
            cursor_id,
            cursor_history: vec![cursor_id],
            call_stack: Vec::new(),
            effects: EffectBuffer::new(),
            call_receipts: Vec::new(),
            ns_overrides: BTreeMap::new(),
            local_handlers: HandlerRegistry::new(),
            active_domains: Vec::new(),
            cancelled: false,
            concept_depth: Cell::new(0),
        }
    }

    /// Builds a context for the next tick of an existing playthrough,
    /// carrying forward cursor history and the call stack.
    #[must_use]
    pub fn resume(cursor_id: NodeId, cursor_history: Vec<NodeId>, call_stack: Vec<StackFrame>) -> Self {
        let mut history = cursor_history;
        history.push(cursor_id);
        Self {
            cursor_id,
            cursor_history: history,
            call_stack,
            effects: EffectBuffer::new(),
            call_receipts: Vec::new(),
            ns_overrides: BTreeMap::new(),
            local_handlers: HandlerRegistry::new(),
            active_domains: Vec::new(),
            cancelled: false,
            concept_depth: Cell::new(0),
        }
    }

    /// Clears phase-local call receipts; called between phases by the phase
    /// engine.
    pub fn clear_call_receipts(&mut self) {
        self.call_receipts.clear();
    }

    /// Sets the cancellation flag, checked between handlers within a phase.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Whether this context has been cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Resolves `name` in order: (a) tick `ns_overrides`, (b) cursor's
    /// `locals`, (c) a `Concept` node linked as a `Child` of the cursor
    /// whose label is `name` (its `content`, itself expanded), (d) each
    /// ancestor's `locals` nearest-first, (e) domain variables (read from
    /// `ns_overrides` under a `domain:` prefix, since domains register
    /// variables the same way handlers register effects), (f) graph globals
    /// (the `Game`/world-root node's `locals`). Pure read; never
    /// materializes a write.
    #[must_use]
    pub fn ns(&self, graph: &Graph, name: &str) -> Value {
        if let Some(v) = self.ns_overrides.get(name) {
            return v.clone();
        }
        if let Ok(cursor) = graph.get(self.cursor_id) {
            if let Some(v) = cursor.locals.get(name) {
                return v.clone();
            }
        }
        if let Some(v) = self.resolve_concept_child(graph, name) {
            return v;
        }
        for ancestor in graph.ancestors(self.cursor_id, 256) {
            if let Ok(node) = graph.get(ancestor) {
                if let Some(v) = node.locals.get(name) {
                    return v.clone();
                }
            }
        }
        for domain in &self.active_domains {
            if let Some(v) = self.ns_overrides.get(&format!("domain:{domain}:{name}")) {
                return v.clone();
            }
        }
        if let Some(root) = self.graph_root(graph) {
            if let Some(v) = root.locals.get(name) {
                return v.clone();
            }
        }
        Value::None
    }

    /// Looks for a `Concept` node reachable from the cursor by a `Child`
    /// edge whose label is `name`, returning its `content` with any nested
    /// `{{ }}` inside that content expanded in turn. Guarded by
    /// `concept_depth` against two concepts whose content reference each
    /// other — past [`crate::journal::MAX_CONCEPT_DEPTH`] nested
    /// resolutions a reference degrades to `Value::None` rather than
    /// looping forever.
    fn resolve_concept_child(&self, graph: &Graph, name: &str) -> Option<Value> {
        if self.concept_depth.get() >= crate::journal::MAX_CONCEPT_DEPTH {
            return None;
        }
        let node = graph
            .edges_out(self.cursor_id, Some(EdgeKind::Child))
            .into_iter()
            .filter_map(|edge| edge.destination_uid)
            .filter_map(|uid| graph.get(uid).ok())
            .find(|node| node.kind == NodeKind::Concept && node.label == name)?;
        let body = node.content.clone().unwrap_or_default();
        self.concept_depth.set(self.concept_depth.get() + 1);
        let expanded = crate::expr::expand_template(&body, graph, self).unwrap_or(body);
        self.concept_depth.set(self.concept_depth.get() - 1);
        Some(Value::Str(expanded))
    }

    fn graph_root<'g>(&self, graph: &'g Graph) -> Option<&'g Node> {
        let mut chain = graph.ancestors(self.cursor_id, 256);
        chain.push(self.cursor_id);
        let root_id = *chain.last()?;
        let mut current = root_id;
        loop {
            let next = graph.ancestors(current, 1);
            match next.first() {
                Some(parent) => current = *parent,
                None => break,
            }
        }
        graph.get(current).ok()
    }

    /// How many times `uid` appears in cursor history, including the
    /// current position.
    #[must_use]
    pub fn get_visit_count(&self, uid: NodeId) -> usize {
        self.cursor_history.iter().filter(|&&v| v == uid).count()
    }

    /// Whether this is the first time the cursor has ever been at `uid`.
    #[must_use]
    pub fn is_first_visit(&self, uid: NodeId) -> bool {
        self.get_visit_count(uid) <= 1
    }

    /// How many ticks have elapsed since `uid` was last visited, or `None`
    /// if it has never been visited (excluding the current position).
    #[must_use]
    pub fn steps_since_last_visit(&self, uid: NodeId) -> Option<usize> {
        let len = self.cursor_history.len();
        if len < 2 {
            return None;
        }
        self.cursor_history[..len - 1]
            .iter()
            .rposition(|&v| v == uid)
            .map(|idx| len - 1 - idx)
    }

    /// Whether the current tick moved the cursor back to where it was the
    /// previous tick.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        let len = self.cursor_history.len();
        len >= 2 && self.cursor_history[len - 1] == self.cursor_history[len - 2]
    }

    /// Whether execution is currently inside a subroutine call.
    #[must_use]
    pub fn in_subroutine(&self) -> bool {
        !self.call_stack.is_empty()
    }

    /// The frame that would be returned to if the current subroutine
    /// returned now.
    #[must_use]
    pub fn get_caller_frame(&self) -> Option<&StackFrame> {
        self.call_stack.last()
    }

    /// Current call-stack depth.
    #[must_use]
    pub fn get_call_depth(&self) -> u32 {
        self.call_stack.len() as u32
    }

    /// The outermost (first-pushed) frame, i.e. where execution will end up
    /// once every pending subroutine returns.
    #[must_use]
    pub fn get_root_caller(&self) -> Option<&StackFrame> {
        self.call_stack.first()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::{Edge, EdgeKind, NodeKind};
    use crate::ident::EdgeId;

    #[test]
    fn ns_resolves_override_before_locals() {
        let mut graph = Graph::new();
        let mut node = crate::entity::Node::new(NodeId::new(), NodeKind::Block, "b");
        node.locals.insert("x".into(), Value::Int(1));
        let uid = node.uid;
        graph.add_node(node);
        let mut ctx = Context::new(uid);
        ctx.ns_overrides.insert("x".into(), Value::Int(99));
        assert_eq!(ctx.ns(&graph, "x"), Value::Int(99));
    }

    #[test]
    fn ns_falls_through_to_nearest_ancestor_locals() {
        let mut graph = Graph::new();
        let mut parent = crate::entity::Node::new(NodeId::new(), NodeKind::Scene, "scene");
        parent.locals.insert("mood".into(), Value::Str("tense".into()));
        let parent_uid = graph.add_node(parent);
        let child_uid = NodeId::new();
        graph.add_node(crate::entity::Node::new(child_uid, NodeKind::Block, "block"));
        graph
            .add_edge(Edge::new(EdgeId::new(), EdgeKind::Child, parent_uid, Some(child_uid), "c"))
            .unwrap();
        let ctx = Context::new(child_uid);
        assert_eq!(ctx.ns(&graph, "mood"), Value::Str("tense".into()));
    }

    #[test]
    fn ns_resolves_domain_variable_before_graph_root() {
        let mut graph = Graph::new();
        let uid = graph.add_node(crate::entity::Node::new(NodeId::new(), NodeKind::Block, "b"));
        let mut ctx = Context::new(uid);
        ctx.active_domains.push("weather".into());
        ctx.ns_overrides
            .insert("domain:weather:sky".into(), Value::Str("overcast".into()));
        assert_eq!(ctx.ns(&graph, "sky"), Value::Str("overcast".into()));
    }

    #[test]
    fn is_first_visit_is_false_after_a_revisit() {
        let mut ctx = Context::new(NodeId::new());
        let uid = ctx.cursor_id;
        assert!(ctx.is_first_visit(uid));
        ctx.cursor_history.push(uid);
        assert!(!ctx.is_first_visit(uid));
    }

    #[test]
    fn is_self_loop_detects_immediate_revisit() {
        let a = NodeId::new();
        let mut ctx = Context::new(a);
        assert!(!ctx.is_self_loop());
        ctx.cursor_history.push(a);
        assert!(ctx.is_self_loop());
    }

    #[test]
    fn call_depth_tracks_stack_length() {
        let mut ctx = Context::new(NodeId::new());
        assert_eq!(ctx.get_call_depth(), 0);
        ctx.call_stack.push(StackFrame {
            return_cursor_id: NodeId::new(),
            call_site_label: "jump".into(),
            depth: 1,
        });
        assert_eq!(ctx.get_call_depth(), 1);
        assert!(ctx.in_subroutine());
    }
}
