// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! The phase engine (§4.6): the VM loop that advances a story graph by one
//! tick.
//!
//! A tick runs seven phases in a fixed order — INIT, PLANNING, PREREQS,
//! EFFECTS, JOURNAL, BOOKKEEPING, POSTREQS — against a single [`Context`]
//! built for that tick, then commits the accumulated effects to the
//! [`Graph`] in one [`patch::apply_to_graph`] call. Nothing here mutates
//! `self.graph` directly before commit; every phase reads through
//! `ctx.effects.preview(&self.graph)` so later phases see earlier phases'
//! pending writes (read-your-writes), exactly as [`crate::provisioning`]
//! already does internally.
//!
//! `Context` itself, not a replay of the committed patch, is the source of
//! truth for cursor/call-stack state carried into the next tick: the tick's
//! final `ctx.cursor_id`/`cursor_history`/`call_stack` become the next
//! [`PlaythroughState`] directly. The `SetCursor`/`PushFrame`/`PopFrame`
//! effects still land in the patch (append-only audit trail, required by
//! the wire format), but nothing re-derives state from them — they are
//! never coalesced (see [`crate::patch::canonicalize`]) so replaying them
//! in canonical order would reconstruct the same end state regardless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::{Context, StackFrame};
use crate::dispatch::{self, AggregationStrategy, DispatchTables, HandlerOutcome};
use crate::effect::{Effect, EffectBuffer};
use crate::entity::{Edge, EdgeKind, JumpKind, NodeKind, TriggerPhase};
use crate::error::{ErrorContext, StError, StResult};
use crate::expr::{self, ExprCache};
use crate::graph::{Graph, GraphHook};
use crate::ident::{EdgeId, NodeId, TickId};
use crate::journal::{self, Fragment};
use crate::patch::{self, Patch};
use crate::provisioning::{self, BuildReceipt, Provisioner};
use crate::template::TemplateRegistry;
use crate::value::Value;

/// The cursor/call-stack state of one playthrough, carried across ticks.
/// Kept separate from [`Graph`] so `Graph` stays the plain, dependency-free
/// data structure its own module doc promises — this is the "current
/// position" half of a playthrough, not graph content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaythroughState {
    /// Where the next tick begins.
    pub cursor_id: NodeId,
    /// Every cursor visited so far, oldest first.
    pub cursor_history: Vec<NodeId>,
    /// The subroutine call stack.
    pub call_stack: Vec<StackFrame>,
}

/// Per-tick handler/provisioning activity, returned alongside the committed
/// patch for callers that want to audit what ran (e.g. a CLI `--verbose`
/// mode).
#[derive(Debug, Clone)]
pub struct TickReport {
    /// One entry per requirement PLANNING considered.
    pub build_receipts: Vec<BuildReceipt>,
    /// Every dispatch receipt recorded this tick, in firing order.
    pub call_receipts: Vec<dispatch::Receipt>,
}

/// What one `step()` call produces.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// The canonical patch committed to the graph.
    pub patch: Patch,
    /// The journal fragments rendered for this tick.
    pub fragments: Vec<Fragment>,
    /// Handler/provisioning activity for this tick.
    pub report: TickReport,
    /// Where the cursor ended up.
    pub cursor_id: NodeId,
}

/// An executing story graph: the committed [`Graph`] plus everything a tick
/// needs to advance it — template registry, dispatch tables, the
/// provisioner set, the expression cache, and the current playthrough
/// position.
pub struct Engine {
    /// The committed story graph.
    pub graph: Graph,
    /// Author-declared templates available to `CREATE_TEMPLATE` requirements.
    pub templates: TemplateRegistry,
    /// `SCOPE`/`DOMAIN`/`GLOBAL`/`APPLICATION`-layer dispatch tables.
    pub tables: DispatchTables,
    /// The provisioner set PLANNING consults, in priority order.
    pub provisioners: Vec<Provisioner>,
    /// Compiled-expression cache, shared across ticks.
    pub expr_cache: ExprCache,
    /// Subroutine recursion limit; exceeding it raises `CallDepthExceeded`.
    pub max_call_depth: u32,
    /// Whether POSTREQS checks forward progress from the final cursor.
    /// Opt-in: most graphs have no `Source`/`Sink` scaffolding and would
    /// otherwise soft-lock on every dead end, which isn't always an error.
    pub softlock_check: bool,
    /// The current playthrough position.
    pub state: PlaythroughState,
}

impl Engine {
    /// Starts a fresh playthrough at `graph.initial_cursor_id`.
    ///
    /// # Errors
    /// Returns [`StError::NotFound`] if the graph designates no initial
    /// cursor.
    pub fn new(graph: Graph) -> StResult<Self> {
        let cursor_id = graph
            .initial_cursor_id
            .ok_or_else(|| StError::not_found("initial_cursor_id", ErrorContext::none()))?;
        Ok(Self::resume(
            graph,
            PlaythroughState {
                cursor_id,
                cursor_history: vec![cursor_id],
                call_stack: Vec::new(),
            },
        ))
    }

    /// Resumes a playthrough at an explicit, previously persisted position.
    #[must_use]
    pub fn resume(graph: Graph, state: PlaythroughState) -> Self {
        Self {
            graph,
            templates: TemplateRegistry::new(),
            tables: DispatchTables::default(),
            provisioners: provisioning::standard_provisioners(),
            expr_cache: ExprCache::new(),
            max_call_depth: 64,
            softlock_check: false,
            state,
        }
    }

    /// Advances the playthrough by one tick.
    ///
    /// `choice`, if given, must name an outbound `Choice` edge from the
    /// current cursor whose predicate currently evaluates truthy; otherwise
    /// the cursor holds still through INIT and the tick is driven purely by
    /// PREREQS/POSTREQS auto-advance and ambient dispatch.
    ///
    /// The tick is all-or-nothing: nothing in `self` is mutated unless every
    /// phase succeeds and no hard requirement is left unresolved.
    ///
    /// # Errors
    /// Propagates any [`StError`] raised while resolving the choice,
    /// traversing a subroutine jump, evaluating an expression, or enforcing
    /// a hard requirement/softlock check.
    #[tracing::instrument(
        level = "debug",
        skip(self),
        fields(tick = self.graph.tick, cursor = %self.state.cursor_id)
    )]
    pub fn step(&mut self, choice: Option<EdgeId>, rng_seed: u64) -> StResult<TickOutcome> {
        let tick_id = TickId::new();
        let mut ctx = Context::resume(
            self.state.cursor_id,
            self.state.cursor_history.clone(),
            self.state.call_stack.clone(),
        );
        ctx.effects = EffectBuffer::with_seed(rng_seed);

        let mut traversed: Vec<EdgeId> = Vec::new();

        // INIT (10)
        if let Some(edge_id) = choice {
            let edge = self.graph.get_edge(edge_id)?.clone();
            let preview = ctx.effects.preview(&self.graph);
            if edge.kind != EdgeKind::Choice || edge.source_uid != ctx.cursor_id {
                return Err(StError::not_found(
                    "choice edge from current cursor",
                    ErrorContext::uid(edge_id.to_string()),
                ));
            }
            if !journal::edge_is_available(&edge, &preview, &ctx) {
                return Err(StError::not_found(
                    "available choice edge",
                    ErrorContext::uid(edge_id.to_string()),
                ));
            }
            self.traverse(&edge, &mut ctx)?;
            traversed.push(edge.uid);
        }

        // PLANNING (20)
        tracing::debug!(phase = "planning", "resolving pending requirements");
        let build_receipts = if ctx.is_cancelled() {
            Vec::new()
        } else {
            provisioning::run_planning(&self.graph, &mut ctx, &self.provisioners, &self.templates)
        };

        // PREREQS (30)
        tracing::debug!(phase = "prereqs", "checking pre-cursor auto-advance edges");
        if !ctx.is_cancelled() {
            if let Some(edge) = self.find_triggered_edge(&ctx, TriggerPhase::Prereqs)? {
                self.traverse(&edge, &mut ctx)?;
                traversed.push(edge.uid);
            }
        }

        // EFFECTS (40)
        tracing::debug!(phase = "effects", "running cursor-authored effects");
        if !ctx.is_cancelled() {
            for edge_id in traversed.clone() {
                let edge = self.graph.get_edge(edge_id)?.clone();
                self.run_edge_effects(&edge, &mut ctx)?;
            }
            let cursor_node = self.graph.get(ctx.cursor_id)?.clone();
            let receipts = dispatch::scoped_dispatch(
                &cursor_node,
                &self.graph,
                &mut ctx,
                &self.tables,
                "on_effects",
                &BTreeMap::new(),
                false,
            );
            for receipt in receipts {
                if let HandlerOutcome::Effect(effect) = receipt.result {
                    ctx.effects.emit(effect);
                }
            }
        }

        // JOURNAL (50) — always runs, even cancelled, so the client sees
        // whatever narration the tick produced before it was cut short.
        tracing::debug!(phase = "journal", "composing fragments");
        {
            let preview = ctx.effects.preview(&self.graph);
            let cursor_node = preview.get(ctx.cursor_id)?.clone();
            let gather_receipts = dispatch::scoped_dispatch(
                &cursor_node,
                &preview,
                &mut ctx,
                &self.tables,
                "gather_content",
                &BTreeMap::new(),
                false,
            );
            let override_content = dispatch::aggregate(AggregationStrategy::First, &gather_receipts);
            let raw_content = match override_content {
                Value::Str(s) if !s.is_empty() => s,
                _ => cursor_node.content.clone().unwrap_or_default(),
            };
            let fragments = journal::compose_content(cursor_node.uid, &raw_content, &preview, &ctx)?;
            for fragment in fragments {
                ctx.effects.say(fragment);
            }
            for fragment in journal::media_fragments(ctx.cursor_id, &preview) {
                ctx.effects.say(fragment);
            }
            for fragment in journal::choice_fragments(ctx.cursor_id, &preview, &ctx) {
                ctx.effects.say(fragment);
            }
        }

        // BOOKKEEPING (60)
        tracing::debug!(phase = "bookkeeping", "gathering context overrides");
        if !ctx.is_cancelled() {
            let preview = ctx.effects.preview(&self.graph);
            let cursor_node = preview.get(ctx.cursor_id)?.clone();
            let context_receipts = dispatch::scoped_dispatch(
                &cursor_node,
                &preview,
                &mut ctx,
                &self.tables,
                "gather_context",
                &BTreeMap::new(),
                false,
            );
            if let Value::Map(overrides) = dispatch::aggregate(AggregationStrategy::Merge, &context_receipts) {
                ctx.ns_overrides.extend(overrides);
            }
        }

        // POSTREQS (70)
        tracing::debug!(phase = "postreqs", "checking auto-advance and hard obligations");
        if !ctx.is_cancelled() {
            if let Some(edge) = self.find_triggered_edge(&ctx, TriggerPhase::Postreqs)? {
                self.traverse(&edge, &mut ctx)?;
                self.run_edge_effects(&edge, &mut ctx)?;
            }
            if let Some(unresolved) = build_receipts.iter().find(|r| r.hard_requirement && !r.accepted) {
                return Err(StError::UnresolvableHard {
                    requirement: unresolved.requirement_id,
                });
            }
            if self.softlock_check {
                let preview = ctx.effects.preview(&self.graph);
                if !has_forward_progress(ctx.cursor_id, &preview, &ctx) {
                    return Err(StError::Softlock { cursor: ctx.cursor_id });
                }
            }
        }

        // Commit.
        let patch = ctx.effects.to_patch(tick_id, self.graph.version, rng_seed);
        tracing::debug!(
            phase = "commit",
            base_version = patch.base_version,
            effect_count = patch.effects.len(),
            "applying patch"
        );
        patch::apply_to_graph(&mut self.graph, &patch)?;
        self.dispatch_hooks(&mut ctx)?;

        self.state = PlaythroughState {
            cursor_id: ctx.cursor_id,
            cursor_history: ctx.cursor_history.clone(),
            call_stack: ctx.call_stack.clone(),
        };

        Ok(TickOutcome {
            fragments: patch.journal.clone(),
            report: TickReport {
                build_receipts,
                call_receipts: ctx.call_receipts.clone(),
            },
            cursor_id: ctx.cursor_id,
            patch,
        })
    }

    /// Raises `on_create`/`on_link`/`on_unlink` at `GLOBAL` layer for every
    /// structural mutation this tick committed, attributed to the tick's
    /// final cursor (the only entity every effect in a tick can be said to
    /// act through).
    fn dispatch_hooks(&mut self, ctx: &mut Context) -> StResult<()> {
        let hooks = self.graph.drain_hooks();
        if hooks.is_empty() {
            return Ok(());
        }
        let caller = self.graph.get(ctx.cursor_id)?.clone();
        for hook in hooks {
            let (task, uid) = match hook {
                GraphHook::Create(uid) => ("on_create", uid.as_uuid().to_string()),
                GraphHook::Link(uid) => ("on_link", uid.as_uuid().to_string()),
                GraphHook::Unlink(uid) => ("on_unlink", uid.as_uuid().to_string()),
            };
            let mut args = BTreeMap::new();
            args.insert("uid".to_owned(), Value::Str(uid));
            dispatch::scoped_dispatch(&caller, &self.graph, ctx, &self.tables, task, &args, false);
        }
        Ok(())
    }

    /// Moves the cursor along `edge`, handling its `jump_kind` if any.
    fn traverse(&self, edge: &Edge, ctx: &mut Context) -> StResult<()> {
        match edge.jump_kind {
            Some(JumpKind::JumpAndReturn) => {
                let depth = ctx.get_call_depth() + 1;
                if depth > self.max_call_depth {
                    return Err(StError::CallDepthExceeded { max: self.max_call_depth });
                }
                let frame = StackFrame {
                    return_cursor_id: ctx.cursor_id,
                    call_site_label: edge.label.clone(),
                    depth,
                };
                ctx.effects.emit(Effect::PushFrame { frame: frame.clone() });
                ctx.call_stack.push(frame);
                let destination = edge
                    .destination_uid
                    .ok_or(StError::DanglingEndpoint { edge: edge.uid })?;
                move_cursor(ctx, destination);
            }
            Some(JumpKind::JumpReturn) => {
                let frame = ctx
                    .call_stack
                    .pop()
                    .ok_or_else(|| StError::not_found("call stack frame", ErrorContext::none().with_phase("postreqs")))?;
                ctx.effects.emit(Effect::PopFrame);
                move_cursor(ctx, frame.return_cursor_id);
            }
            None => {
                let destination = edge
                    .destination_uid
                    .ok_or(StError::DanglingEndpoint { edge: edge.uid })?;
                move_cursor(ctx, destination);
            }
        }
        Ok(())
    }

    /// Runs one edge's authored `effects` strings in effect mode, against a
    /// fresh preview each time so later statements see earlier ones' writes.
    fn run_edge_effects(&self, edge: &Edge, ctx: &mut Context) -> StResult<()> {
        for source in &edge.effects {
            let compiled = self.expr_cache.get_or_compile(edge.uid.as_uuid(), source, true)?;
            let preview = ctx.effects.preview(&self.graph);
            expr::eval_effect(&compiled, &preview, ctx)?;
        }
        Ok(())
    }

    /// The first outbound `Choice` edge from the current cursor whose
    /// `trigger_phase` is `phase` and whose predicate currently evaluates
    /// truthy, in ascending edge-uid order (deterministic).
    fn find_triggered_edge(&self, ctx: &Context, phase: TriggerPhase) -> StResult<Option<Edge>> {
        let preview = ctx.effects.preview(&self.graph);
        for edge in preview.edges_out(ctx.cursor_id, Some(EdgeKind::Choice)) {
            if edge.trigger_phase != Some(phase) {
                continue;
            }
            let fires = edge.predicate.as_deref().is_none_or(|source| {
                expr::compile_predicate(source)
                    .map(|compiled| expr::eval_predicate(&compiled, &preview, ctx))
                    .unwrap_or(false)
            });
            if fires {
                return Ok(Some(edge.clone()));
            }
        }
        Ok(None)
    }
}

fn move_cursor(ctx: &mut Context, destination: NodeId) {
    ctx.effects.emit(Effect::SetCursor { uid: destination });
    ctx.cursor_id = destination;
    ctx.cursor_history.push(destination);
}

/// Whether the cursor has somewhere to go: a `Sink` node is always a valid
/// terminus, otherwise at least one currently available outbound `Choice`
/// edge must exist.
fn has_forward_progress(cursor: NodeId, graph: &Graph, ctx: &Context) -> bool {
    graph.get(cursor).is_ok_and(|n| n.kind == NodeKind::Sink)
        || !journal::choice_fragments(cursor, graph, ctx).is_empty()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::Node;

    fn linear_graph() -> (Graph, NodeId, NodeId, EdgeId) {
        let mut graph = Graph::new();
        let start = graph.add_node(Node::new(NodeId::new(), NodeKind::Block, "start"));
        let next = graph.add_node(Node::new(NodeId::new(), NodeKind::Block, "next"));
        let edge_id = graph
            .add_edge(Edge::new(EdgeId::new(), EdgeKind::Choice, start, Some(next), "go on"))
            .unwrap();
        graph.initial_cursor_id = Some(start);
        (graph, start, next, edge_id)
    }

    #[test]
    fn a_tick_with_no_choice_just_journals_the_cursor() {
        let (graph, start, _next, _edge) = linear_graph();
        let mut engine = Engine::new(graph).unwrap();
        let outcome = engine.step(None, 1).unwrap();
        assert_eq!(outcome.cursor_id, start);
        assert_eq!(engine.graph.tick, 1);
        assert_eq!(engine.graph.version, 1);
    }

    #[test]
    fn choosing_an_edge_moves_the_cursor_and_commits_a_set_cursor_effect() {
        let (graph, _start, next, edge) = linear_graph();
        let mut engine = Engine::new(graph).unwrap();
        let outcome = engine.step(Some(edge), 1).unwrap();
        assert_eq!(outcome.cursor_id, next);
        assert_eq!(engine.state.cursor_id, next);
        assert!(outcome
            .patch
            .effects
            .iter()
            .any(|e| matches!(e, Effect::SetCursor { uid } if *uid == next)));
    }

    #[test]
    fn choosing_an_edge_not_from_the_current_cursor_is_rejected() {
        let (graph, _start, next, _edge) = linear_graph();
        let mut engine = Engine::new(graph).unwrap();
        let bogus = EdgeId::new();
        let _ = next;
        assert!(engine.step(Some(bogus), 1).is_err());
    }

    #[test]
    fn a_hard_requirement_with_no_candidates_aborts_the_tick_without_committing() {
        let mut graph = Graph::new();
        let start = graph.add_node(Node::new(NodeId::new(), NodeKind::Block, "start"));
        let role = graph.add_node(Node::new(NodeId::new(), NodeKind::Role, "lead"));
        let sink = graph.add_node(Node::new(NodeId::new(), NodeKind::Location, "nowhere"));
        let requirement = crate::entity::Requirement::new(crate::entity::RequirementPolicy::Any, true);
        let mut affordance = Edge::new(EdgeId::new(), EdgeKind::Affordance, sink, Some(role), "provides");
        affordance.requirement = Some(requirement);
        graph.add_edge(affordance).unwrap();
        graph
            .add_edge(Edge::new(EdgeId::new(), EdgeKind::Choice, start, Some(role), "enter"))
            .unwrap();
        graph.initial_cursor_id = Some(start);

        let mut engine = Engine::new(graph).unwrap();
        let edge_id = engine.graph.edges_out(start, Some(EdgeKind::Choice))[0].uid;
        let before_version = engine.graph.version;
        let result = engine.step(Some(edge_id), 1);
        assert!(matches!(result, Err(StError::UnresolvableHard { .. })));
        assert_eq!(engine.graph.version, before_version);
    }

    #[test]
    fn prereqs_auto_advance_fires_before_effects_runs_once() {
        let mut graph = Graph::new();
        let start = graph.add_node(Node::new(NodeId::new(), NodeKind::Block, "start"));
        let landing = graph.add_node(Node::new(NodeId::new(), NodeKind::Block, "landing"));
        let mut auto = Edge::new(EdgeId::new(), EdgeKind::Choice, start, Some(landing), "auto");
        auto.trigger_phase = Some(TriggerPhase::Prereqs);
        graph.add_edge(auto).unwrap();
        graph.initial_cursor_id = Some(start);

        let mut engine = Engine::new(graph).unwrap();
        let outcome = engine.step(None, 7).unwrap();
        assert_eq!(outcome.cursor_id, landing);
    }
}
