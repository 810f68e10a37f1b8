// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Layered, priority-ordered handler dispatch.
//!
//! Handlers are gathered from up to five layers — `LOCAL` (installed on one
//! [`crate::context::Context`] for its lifetime), `SCOPE` (reachable through
//! the cursor's ancestor chain), `DOMAIN` (author-declared extension
//! surfaces), `GLOBAL` (process-wide), and `APPLICATION` (the graph's
//! containing world) — sorted by `(priority, layer, insertion order)`, and
//! invoked in turn. This module replaces runtime class-decoration side
//! effects with explicit `register(registry)` calls: every handler is data,
//! not a method resolution order.
//!
//! `scoped_dispatch` is implemented as a single gather-and-sort pass over an
//! owner chain (`caller`, then its ancestors) rather than one dispatch call
//! per ancestor: `LOCAL`/`DOMAIN`/`GLOBAL`/`APPLICATION` handlers have no
//! per-entity owner, so re-running the full gather once per ancestor would
//! invoke them redundantly once per scope level. Folding the chain into a
//! single gather keeps the "handlers fire in `(priority, layer, insertion)`
//! order" guarantee (§5) exact while still letting `SCOPE` handlers attached
//! to any ancestor participate.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::entity::{Node, NodeKind};
use crate::graph::Graph;
use crate::ident::NodeId;
use crate::value::Value;

/// Where a handler was registered, outermost-at-lookup, innermost-at-execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer {
    /// Installed on a single Context for its lifetime.
    Local,
    /// Reachable through the cursor's ancestor chain and its graph.
    Scope,
    /// Registered with a named, author-declared domain.
    Domain,
    /// Process-wide registry.
    Global,
    /// Registered via the graph's containing world.
    Application,
}

impl Layer {
    /// Execution rank: lower runs first. Matches declaration order exactly
    /// (`LOCAL` innermost/first, `APPLICATION` outermost/last).
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Scope => 1,
            Self::Domain => 2,
            Self::Global => 3,
            Self::Application => 4,
        }
    }
}

/// What a handler matches against to decide whether it participates in a
/// dispatch.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    /// Restrict to callers of this kind.
    pub is_instance: Option<NodeKind>,
    /// Restrict to callers carrying all of these tags.
    pub tags: Vec<String>,
    /// `SCOPE`-layer handlers are installed on a specific owning entity;
    /// they match only when that entity is in the dispatch's owner chain.
    pub owner: Option<NodeId>,
    /// `DOMAIN`-layer handlers are grouped by domain name.
    pub domain: Option<String>,
}

impl Selector {
    fn matches_caller(&self, caller: &Node) -> bool {
        self.is_instance.is_none_or(|k| caller.kind == k)
            && self.tags.iter().all(|t| caller.tags.contains(t))
    }
}

/// What a handler invocation produced.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// No contribution.
    None,
    /// A value recorded in the receipt (and fed to aggregation).
    Value(Value),
    /// A new effect, recorded into `ctx.effects`.
    Effect(crate::effect::Effect),
}

type HandlerFn =
    Rc<dyn Fn(&Node, &mut crate::context::Context, &BTreeMap<String, Value>) -> HandlerOutcome>;

/// A callable registered against `(task, layer)` that participates in
/// dispatch.
#[derive(Clone)]
pub struct Handler {
    /// A human-readable, stable identifier (used in receipts and logs).
    pub label: String,
    /// Smaller priority runs earlier; ties break by insertion order, then
    /// layer rank.
    pub priority: u8,
    /// Which layer this handler belongs to.
    pub layer: Layer,
    /// What this handler matches against.
    pub selector: Selector,
    func: HandlerFn,
    insertion: u64,
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

/// A record of one handler's contribution to a dispatch, readable by
/// subsequent handlers in the same phase via `ctx.call_receipts`.
#[derive(Debug, Clone)]
pub struct Receipt {
    /// The handler's label.
    pub handler_id: String,
    /// What it returned.
    pub result: HandlerOutcome,
    /// The handler's priority at the time it ran.
    pub priority: u8,
    /// The handler's layer.
    pub layer: Layer,
    /// How many effects it emitted while running (0 if it returned a value
    /// or nothing).
    pub produced_effects_count: usize,
}

/// How multiple handlers' results are combined for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationStrategy {
    /// Stop and return on the first non-`None` result.
    First,
    /// Feed each handler's result as the next handler's input.
    Pipeline,
    /// Deep-merge dict (`Value::Map`) results.
    Merge,
    /// Collect every result.
    All,
}

/// Handlers registered for one `(task, layer)` key.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    by_task: BTreeMap<String, Vec<Handler>>,
    aggregation: BTreeMap<String, AggregationStrategy>,
    next_insertion: Cell<u64>,
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `task`.
    pub fn register(
        &mut self,
        task: impl Into<String>,
        label: impl Into<String>,
        layer: Layer,
        priority: u8,
        selector: Selector,
        func: impl Fn(&Node, &mut crate::context::Context, &BTreeMap<String, Value>) -> HandlerOutcome
            + 'static,
    ) {
        let insertion = self.next_insertion.get();
        self.next_insertion.set(insertion + 1);
        self.by_task.entry(task.into()).or_default().push(Handler {
            label: label.into(),
            priority,
            layer,
            selector,
            func: Rc::new(func),
            insertion,
        });
    }

    /// Declares how a task's results should be aggregated. Tasks with no
    /// declaration default to [`AggregationStrategy::All`].
    pub fn set_aggregation(&mut self, task: impl Into<String>, strategy: AggregationStrategy) {
        self.aggregation.insert(task.into(), strategy);
    }

    fn aggregation_for(&self, task: &str) -> AggregationStrategy {
        self.aggregation
            .get(task)
            .copied()
            .unwrap_or(AggregationStrategy::All)
    }

    fn handlers_for(&self, task: &str) -> &[Handler] {
        self.by_task.get(task).map_or(&[], Vec::as_slice)
    }
}

/// The non-`LOCAL` registries a dispatch draws from. `LOCAL` handlers live
/// on [`crate::context::Context`] itself since they are installed per-tick.
#[derive(Debug, Default)]
pub struct DispatchTables {
    /// `SCOPE`-layer handlers, matched by owner against the dispatch's
    /// owner chain.
    pub scope: HandlerRegistry,
    /// `DOMAIN`-layer handlers, matched by the context's active domains.
    pub domain: HandlerRegistry,
    /// Process-wide `GLOBAL`-layer handlers.
    pub global: HandlerRegistry,
    /// `APPLICATION`-layer handlers registered via the containing world.
    pub application: HandlerRegistry,
}

/// Collects matching handlers as owned clones (cheap: the closure itself is
/// an `Rc`) so the candidate list does not keep `ctx` borrowed while
/// handlers are invoked.
fn collect_candidates(
    tables: &DispatchTables,
    local: &HandlerRegistry,
    task: &str,
    owner_chain: &[NodeId],
    active_domains: &[String],
) -> Vec<Handler> {
    let mut out: Vec<Handler> = Vec::new();
    out.extend(local.handlers_for(task).iter().cloned());
    out.extend(
        tables
            .scope
            .handlers_for(task)
            .iter()
            .filter(|h| h.selector.owner.is_none_or(|o| owner_chain.contains(&o)))
            .cloned(),
    );
    out.extend(
        tables
            .domain
            .handlers_for(task)
            .iter()
            .filter(|h| {
                h.selector
                    .domain
                    .as_ref()
                    .is_none_or(|d| active_domains.contains(d))
            })
            .cloned(),
    );
    out.extend(tables.global.handlers_for(task).iter().cloned());
    out.extend(tables.application.handlers_for(task).iter().cloned());
    out
}

fn sort_and_dedup_stable(mut handlers: Vec<Handler>) -> Vec<Handler> {
    handlers.sort_by_key(|h| (h.priority, h.layer.rank(), h.insertion));
    handlers
}

fn aggregation_for(tables: &DispatchTables, local: &HandlerRegistry, task: &str) -> AggregationStrategy {
    for registry in [local, &tables.scope, &tables.domain, &tables.global, &tables.application] {
        if registry.aggregation.contains_key(task) {
            return registry.aggregation_for(task);
        }
    }
    AggregationStrategy::All
}

fn merge_values(into: &mut Value, from: Value) {
    match (into, from) {
        (Value::Map(base), Value::Map(added)) => {
            for (k, v) in added {
                base.insert(k, v);
            }
        }
        (slot, from) => *slot = from,
    }
}

/// Runs every matching handler for `task` against `caller`, honoring the
/// task's declared [`AggregationStrategy`]. Returns the empty vector (never
/// an error) when nothing is registered.
pub fn dispatch(
    caller: &Node,
    ctx: &mut crate::context::Context,
    tables: &DispatchTables,
    task: &str,
    args: &BTreeMap<String, Value>,
    dry_run: bool,
) -> Vec<Receipt> {
    dispatch_over_chain(caller, &[caller.uid], ctx, tables, task, args, dry_run)
}

/// Convenience that widens the `SCOPE` layer to every ancestor of `caller`
/// (computed via `Child` edges up to `graph.ancestors`'s depth guard),
/// effectively letting handlers "installed" anywhere on the cursor's
/// ancestry chain participate in one call.
pub fn scoped_dispatch(
    caller: &Node,
    graph: &Graph,
    ctx: &mut crate::context::Context,
    tables: &DispatchTables,
    task: &str,
    args: &BTreeMap<String, Value>,
    dry_run: bool,
) -> Vec<Receipt> {
    let mut chain = vec![caller.uid];
    chain.extend(graph.ancestors(caller.uid, 256));
    dispatch_over_chain(caller, &chain, ctx, tables, task, args, dry_run)
}

fn dispatch_over_chain(
    caller: &Node,
    owner_chain: &[NodeId],
    ctx: &mut crate::context::Context,
    tables: &DispatchTables,
    task: &str,
    args: &BTreeMap<String, Value>,
    dry_run: bool,
) -> Vec<Receipt> {
    let active_domains = ctx.active_domains.clone();
    let strategy = aggregation_for(tables, &ctx.local_handlers, task);
    let candidates = sort_and_dedup_stable(collect_candidates(
        tables,
        &ctx.local_handlers,
        task,
        owner_chain,
        &active_domains,
    ))
    .into_iter()
    .filter(|h| h.selector.matches_caller(caller))
    .collect::<Vec<_>>();

    let mut receipts = Vec::with_capacity(candidates.len());
    let mut pipeline_value: Option<Value> = None;

    for handler in candidates {
        if ctx.is_cancelled() {
            break;
        }
        let mut call_args = args.clone();
        if strategy == AggregationStrategy::Pipeline {
            if let Some(v) = pipeline_value.take() {
                call_args.insert("__pipeline_input".to_owned(), v);
            }
        }
        let effects_before = ctx.effects.effects().len();
        let outcome = if dry_run {
            HandlerOutcome::None
        } else {
            (handler.func)(caller, ctx, &call_args)
        };
        let produced_effects_count = ctx.effects.effects().len() - effects_before;

        if strategy == AggregationStrategy::Pipeline {
            if let HandlerOutcome::Value(v) = &outcome {
                pipeline_value = Some(v.clone());
            }
        }
        let stop_early = strategy == AggregationStrategy::First
            && matches!(outcome, HandlerOutcome::Value(_));

        receipts.push(Receipt {
            handler_id: handler.label.clone(),
            result: outcome,
            priority: handler.priority,
            layer: handler.layer,
            produced_effects_count,
        });
        if let Some(last) = receipts.last() {
            ctx.call_receipts.push(last.clone());
        }
        if stop_early {
            break;
        }
    }

    receipts
}

/// Combines a dispatch's receipts per its declared aggregation strategy.
/// Dispatch itself always returns the full receipt list (so later handlers
/// can read prior results); callers that want the single aggregated value
/// (e.g. `ns()` resolving a `gather_context` dispatch) use this.
#[must_use]
pub fn aggregate(strategy: AggregationStrategy, receipts: &[Receipt]) -> Value {
    let values = || {
        receipts.iter().filter_map(|r| match &r.result {
            HandlerOutcome::Value(v) => Some(v.clone()),
            _ => None,
        })
    };
    match strategy {
        AggregationStrategy::First => values().next().unwrap_or(Value::None),
        AggregationStrategy::Pipeline => values().last().unwrap_or(Value::None),
        AggregationStrategy::Merge => {
            let mut acc = Value::Map(BTreeMap::new());
            for v in values() {
                merge_values(&mut acc, v);
            }
            acc
        }
        AggregationStrategy::All => Value::List(values().collect()),
    }
}

impl Clone for HandlerOutcome {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Value(v) => Self::Value(v.clone()),
            Self::Effect(e) => Self::Effect(e.clone()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::entity::NodeKind;
    use crate::graph::Graph;
    use crate::ident::NodeId;

    fn make_node(graph: &mut Graph) -> Node {
        let uid = graph.add_node(Node::new(NodeId::new(), NodeKind::Block, "room"));
        graph.get(uid).unwrap().clone()
    }

    #[test]
    fn dispatch_with_no_handlers_returns_empty_receipts() {
        let mut graph = Graph::new();
        let node = make_node(&mut graph);
        let mut ctx = Context::new(node.uid);
        let tables = DispatchTables::default();
        let receipts = dispatch(&node, &mut ctx, &tables, "anything", &BTreeMap::new(), false);
        assert!(receipts.is_empty());
    }

    #[test]
    fn lower_priority_handlers_run_before_higher_priority_ones() {
        let mut graph = Graph::new();
        let node = make_node(&mut graph);
        let mut ctx = Context::new(node.uid);
        let mut tables = DispatchTables::default();
        tables.global.register(
            "order",
            "second",
            Layer::Global,
            50,
            Selector::default(),
            |_n, _ctx, _a| HandlerOutcome::Value(Value::Str("second".into())),
        );
        tables.global.register(
            "order",
            "first",
            Layer::Global,
            10,
            Selector::default(),
            |_n, _ctx, _a| HandlerOutcome::Value(Value::Str("first".into())),
        );
        let receipts = dispatch(&node, &mut ctx, &tables, "order", &BTreeMap::new(), false);
        assert_eq!(receipts[0].handler_id, "first");
        assert_eq!(receipts[1].handler_id, "second");
    }

    #[test]
    fn scope_handlers_only_match_when_owner_is_in_the_ancestor_chain() {
        let mut graph = Graph::new();
        let parent = graph.add_node(Node::new(NodeId::new(), NodeKind::Scene, "scene"));
        let child_uid = NodeId::new();
        graph.add_node(Node::new(child_uid, NodeKind::Block, "block"));
        graph
            .add_edge(crate::entity::Edge::new(
                crate::ident::EdgeId::new(),
                crate::entity::EdgeKind::Child,
                parent,
                Some(child_uid),
                "child",
            ))
            .unwrap();
        let child = graph.get(child_uid).unwrap().clone();
        let mut ctx = Context::new(child.uid);
        let mut tables = DispatchTables::default();
        tables.scope.register(
            "probe",
            "scene_handler",
            Layer::Scope,
            50,
            Selector {
                owner: Some(parent),
                ..Selector::default()
            },
            |_n, _ctx, _a| HandlerOutcome::Value(Value::Bool(true)),
        );
        let receipts = scoped_dispatch(&child, &graph, &mut ctx, &tables, "probe", &BTreeMap::new(), false);
        assert_eq!(receipts.len(), 1);

        let mut ctx2 = Context::new(child.uid);
        let receipts_unscoped = dispatch(&child, &mut ctx2, &tables, "probe", &BTreeMap::new(), false);
        assert!(receipts_unscoped.is_empty());
    }
}
