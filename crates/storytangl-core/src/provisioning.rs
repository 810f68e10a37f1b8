// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Provisioning (§4.4): resolving the frontier's unsatisfied requirements
//! during the PLANNING phase.
//!
//! Every registered [`Provisioner`] is asked to bid on every unresolved
//! requirement on the cursor's inbound `Affordance` and outbound
//! `Dependency` edges. Offers are ranked affordance-before-dependency, then
//! by author priority, then by relative build cost, then by a deterministic
//! tiebreak, and the first offer that actually materializes a provider
//! wins. The ranking and the
//! frontier-gathering order mirror the original planner's
//! `_collect` / `_candidate_sort_key` / `plan_select_and_apply` pass, with
//! one deliberate change: that planner broke final ties with a random
//! offer uid, which this crate cannot do without breaking the
//! `step(graph, choice, seed)` determinism the rest of it is built on, so
//! the tiebreak here is the provisioner's own label instead.

use std::collections::BTreeMap;

use crate::context::Context;
use crate::entity::{Node, NodeKind, Requirement, RequirementPolicy};
use crate::graph::{EntityFilter, Graph};
use crate::ident::{EdgeId, NodeId, RequirementId};
use crate::template::TemplateRegistry;
use crate::value::Value;

/// Relative build cost a provisioner assigns its own offer. Only used to
/// rank offers that already tie on source and priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OfferCost {
    /// Binding something that already exists.
    Cheap,
    /// A quick derivation: clone, or an in-place update.
    Normal,
    /// Materializing a whole new entity from a template.
    HeavyDirect,
    /// Materializing a new entity indirectly, e.g. from an asset reference.
    HeavyIndirect,
}

/// Which edge direction a requirement's frontier search found it on.
/// Affordances (a resource already reaching toward the cursor) are
/// preferred over dependencies (the cursor reaching out for one), per the
/// grounding planner's "existing resources before fresh builds" ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferSource {
    /// Found via an inbound `Affordance` edge.
    Affordance,
    /// Found via an outbound `Dependency` edge.
    Dependency,
}

impl OfferSource {
    const fn rank(self) -> u8 {
        match self {
            Self::Affordance => 0,
            Self::Dependency => 1,
        }
    }
}

/// What accepting an offer does. Resolved fully at propose time so
/// acceptance is one exhaustive match rather than a second round of
/// per-provisioner dispatch.
#[derive(Debug, Clone)]
enum ProvisionPlan {
    BindExisting(NodeId),
    Clone(NodeId),
    UpdateInPlace {
        uid: NodeId,
        criteria: BTreeMap<String, Value>,
    },
    CreateFromTemplate {
        kind: NodeKind,
        data: BTreeMap<String, Value>,
    },
    CreateBare(NodeKind),
    CreateAsset(String),
}

/// One provisioner's bid to satisfy a [`Requirement`].
#[derive(Debug, Clone)]
pub struct ProvisionOffer {
    /// Which provisioner produced this offer.
    pub provisioner: &'static str,
    /// The requirement this offer would satisfy.
    pub requirement_id: RequirementId,
    /// Which edge direction the requirement was found on. Filled in by
    /// [`run_planning`] after gathering, not by the provisioner itself.
    pub source: Option<OfferSource>,
    /// This offer's relative build cost.
    pub cost: OfferCost,
    /// Author/provisioner-declared priority; lower runs first.
    pub priority: u8,
    /// A human-readable description of what accepting this offer would do.
    pub operation: String,
    plan: ProvisionPlan,
}

impl ProvisionOffer {
    fn sort_key(&self) -> (u8, u8, OfferCost, &'static str) {
        let source_rank = self.source.map_or(1, OfferSource::rank);
        (source_rank, self.priority, self.cost, self.provisioner)
    }

    fn accept(&self, graph: &Graph, ctx: &mut Context) -> Option<NodeId> {
        match &self.plan {
            ProvisionPlan::BindExisting(uid) => Some(*uid),
            ProvisionPlan::UpdateInPlace { uid, criteria } => {
                for (key, value) in criteria {
                    ctx.effects.set_attr(*uid, format!("locals.{key}"), value.clone());
                }
                Some(*uid)
            }
            ProvisionPlan::Clone(source) => {
                let node = graph.get(*source).ok()?;
                let mut data = node.locals.clone();
                data.insert("label".into(), Value::Str(node.label.clone()));
                if let Some(content) = &node.content {
                    data.insert("content".into(), Value::Str(content.clone()));
                }
                Some(ctx.effects.create_node(node.kind, data))
            }
            ProvisionPlan::CreateFromTemplate { kind, data } => {
                Some(ctx.effects.create_node(*kind, data.clone()))
            }
            ProvisionPlan::CreateBare(kind) => Some(ctx.effects.create_node(*kind, BTreeMap::new())),
            ProvisionPlan::CreateAsset(asset_ref) => {
                let mut data = BTreeMap::new();
                data.insert("content".into(), Value::Str(asset_ref.clone()));
                Some(ctx.effects.create_node(NodeKind::Location, data))
            }
        }
    }
}

/// A record of one requirement's planning outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReceipt {
    /// The requirement this receipt reports on.
    pub requirement_id: RequirementId,
    /// The provisioner whose offer was accepted, if any.
    pub provisioner: Option<&'static str>,
    /// The node bound as the requirement's provider, if any.
    pub provider_id: Option<NodeId>,
    /// What the accepted offer did.
    pub operation: Option<String>,
    /// Whether any offer was accepted.
    pub accepted: bool,
    /// Whether this was a hard requirement.
    pub hard_requirement: bool,
    /// `"no_offers"`, `"waived_soft"`, or `"unresolvable"` when `accepted` is
    /// false; absent otherwise.
    pub reason: Option<&'static str>,
}

type ProposeFn = fn(&Requirement, &Graph, &Context, &TemplateRegistry) -> Vec<ProvisionOffer>;

/// A provisioning strategy: proposes offers for the requirements it knows
/// how to satisfy. Shaped like the rewrite engine's function-pointer rules —
/// a plain `fn` rather than a trait object — but provisioners are consulted
/// directly by PLANNING instead of through the `(task, layer)` dispatch
/// registry, since every provisioner must see every requirement regardless
/// of scope.
pub struct Provisioner {
    propose_fn: ProposeFn,
}

impl Provisioner {
    /// Wraps a propose function as a provisioner.
    #[must_use]
    pub const fn new(propose_fn: ProposeFn) -> Self {
        Self { propose_fn }
    }

    fn propose(&self, requirement: &Requirement, graph: &Graph, ctx: &Context, templates: &TemplateRegistry) -> Vec<ProvisionOffer> {
        (self.propose_fn)(requirement, graph, ctx, templates)
    }
}

fn target_kind(requirement: &Requirement) -> NodeKind {
    match requirement.criteria.get("kind") {
        Some(Value::Str(s)) => parse_node_kind(s).unwrap_or(NodeKind::Actor),
        _ => NodeKind::Actor,
    }
}

fn parse_node_kind(s: &str) -> Option<NodeKind> {
    match s {
        "block" => Some(NodeKind::Block),
        "concept" => Some(NodeKind::Concept),
        "actor" => Some(NodeKind::Actor),
        "location" => Some(NodeKind::Location),
        "role" => Some(NodeKind::Role),
        "scene" => Some(NodeKind::Scene),
        "game" => Some(NodeKind::Game),
        _ => None,
    }
}

fn candidate_matches(node: &Node, requirement: &Requirement) -> bool {
    if let Some(identifier) = &requirement.identifier {
        if &node.label != identifier {
            return false;
        }
    }
    requirement
        .criteria
        .iter()
        .filter(|(key, _)| key.as_str() != "kind")
        .all(|(key, value)| node.locals.get(key) == Some(value))
}

fn candidates(requirement: &Requirement, graph: &Graph) -> Vec<NodeId> {
    graph
        .find_all(EntityFilter {
            node_kind: Some(target_kind(requirement)),
            ..EntityFilter::default()
        })
        .nodes
        .into_iter()
        .filter(|uid| graph.get(*uid).is_ok_and(|n| candidate_matches(n, requirement)))
        .collect()
}

/// Offers to bind an already-existing, already-matching node. The cheapest
/// and most common resolution, grounded in the original `GraphProvisioner`.
fn graph_provisioner_propose(requirement: &Requirement, graph: &Graph, _ctx: &Context, _templates: &TemplateRegistry) -> Vec<ProvisionOffer> {
    if requirement.policy != RequirementPolicy::Any {
        return Vec::new();
    }
    candidates(requirement, graph)
        .into_iter()
        .map(|uid| ProvisionOffer {
            provisioner: "graph",
            requirement_id: requirement.id,
            source: None,
            cost: OfferCost::Cheap,
            priority: 10,
            operation: format!("bind_existing:{uid}"),
            plan: ProvisionPlan::BindExisting(uid),
        })
        .collect()
}

/// Offers to clone the first matching candidate into a fresh node.
fn cloning_provisioner_propose(requirement: &Requirement, graph: &Graph, _ctx: &Context, _templates: &TemplateRegistry) -> Vec<ProvisionOffer> {
    if requirement.policy != RequirementPolicy::Clone {
        return Vec::new();
    }
    candidates(requirement, graph)
        .into_iter()
        .take(1)
        .map(|uid| ProvisionOffer {
            provisioner: "cloning",
            requirement_id: requirement.id,
            source: None,
            cost: OfferCost::Normal,
            priority: 20,
            operation: format!("clone:{uid}"),
            plan: ProvisionPlan::Clone(uid),
        })
        .collect()
}

/// Offers to update the first matching candidate's locals in place rather
/// than materializing anything new.
fn updating_provisioner_propose(requirement: &Requirement, graph: &Graph, _ctx: &Context, _templates: &TemplateRegistry) -> Vec<ProvisionOffer> {
    if requirement.policy != RequirementPolicy::Update {
        return Vec::new();
    }
    candidates(requirement, graph)
        .into_iter()
        .take(1)
        .map(|uid| ProvisionOffer {
            provisioner: "updating",
            requirement_id: requirement.id,
            source: None,
            cost: OfferCost::Normal,
            priority: 20,
            operation: format!("update_in_place:{uid}"),
            plan: ProvisionPlan::UpdateInPlace {
                uid,
                criteria: requirement.criteria.clone(),
            },
        })
        .collect()
}

/// Offers to materialize a node from the requirement's `template_ref`,
/// resolved against the registry from the cursor's current scope.
fn template_provisioner_propose(requirement: &Requirement, graph: &Graph, ctx: &Context, templates: &TemplateRegistry) -> Vec<ProvisionOffer> {
    if requirement.policy != RequirementPolicy::CreateTemplate {
        return Vec::new();
    }
    let Some(reference) = &requirement.template_ref else {
        return Vec::new();
    };
    let Ok(template) = templates.find_template(reference, graph, ctx.cursor_id) else {
        return Vec::new();
    };
    let mut data = template.locals.clone();
    data.insert("label".into(), Value::Str(template.label.clone()));
    if let Some(content) = &template.content {
        data.insert("content".into(), Value::Str(content.clone()));
    }
    vec![ProvisionOffer {
        provisioner: "template",
        requirement_id: requirement.id,
        source: None,
        cost: OfferCost::HeavyDirect,
        priority: 30,
        operation: format!("create_from_template:{reference}"),
        plan: ProvisionPlan::CreateFromTemplate {
            kind: template.kind,
            data,
        },
    }]
}

/// Offers to materialize a bare node of the requirement's inferred kind,
/// for a `CREATE` policy with no `asset_ref`.
fn create_provisioner_propose(requirement: &Requirement, _graph: &Graph, _ctx: &Context, _templates: &TemplateRegistry) -> Vec<ProvisionOffer> {
    if requirement.policy != RequirementPolicy::Create || requirement.asset_ref.is_some() {
        return Vec::new();
    }
    vec![ProvisionOffer {
        provisioner: "create",
        requirement_id: requirement.id,
        source: None,
        cost: OfferCost::HeavyDirect,
        priority: 35,
        operation: "create_bare".into(),
        plan: ProvisionPlan::CreateBare(target_kind(requirement)),
    }]
}

/// Offers to materialize a node from the requirement's `asset_ref`.
fn asset_provisioner_propose(requirement: &Requirement, _graph: &Graph, _ctx: &Context, _templates: &TemplateRegistry) -> Vec<ProvisionOffer> {
    if requirement.policy != RequirementPolicy::Create {
        return Vec::new();
    }
    let Some(asset_ref) = &requirement.asset_ref else {
        return Vec::new();
    };
    vec![ProvisionOffer {
        provisioner: "asset",
        requirement_id: requirement.id,
        source: None,
        cost: OfferCost::HeavyIndirect,
        priority: 40,
        operation: format!("load_asset:{asset_ref}"),
        plan: ProvisionPlan::CreateAsset(asset_ref.clone()),
    }]
}

/// The standard provisioner set: reuse, derive, then materialize, cheapest
/// first.
#[must_use]
pub fn standard_provisioners() -> Vec<Provisioner> {
    vec![
        Provisioner::new(graph_provisioner_propose),
        Provisioner::new(cloning_provisioner_propose),
        Provisioner::new(updating_provisioner_propose),
        Provisioner::new(template_provisioner_propose),
        Provisioner::new(create_provisioner_propose),
        Provisioner::new(asset_provisioner_propose),
    ]
}

/// Resolves every unsatisfied requirement on the cursor's frontier edges,
/// emitting `BindRequirement` effects through `ctx.effects` and returning a
/// receipt per requirement considered.
///
/// Requirements are visited in `RequirementId` order for determinism.
/// Affordance edges are gathered before dependency edges so that, at equal
/// priority, a resource already pointed at the cursor wins over one the
/// cursor would have to reach out and build.
pub fn run_planning(graph: &Graph, ctx: &mut Context, provisioners: &[Provisioner], templates: &TemplateRegistry) -> Vec<BuildReceipt> {
    use crate::entity::EdgeKind;

    let cursor = ctx.cursor_id;
    let mut frontier: BTreeMap<RequirementId, (EdgeId, OfferSource)> = BTreeMap::new();

    for edge in graph.edges_in(cursor, Some(EdgeKind::Affordance)) {
        if let Some(req) = &edge.requirement {
            if !req.is_satisfied() {
                frontier.entry(req.id).or_insert((edge.uid, OfferSource::Affordance));
            }
        }
    }
    for edge in graph.edges_out(cursor, Some(EdgeKind::Dependency)) {
        if let Some(req) = &edge.requirement {
            if !req.is_satisfied() {
                frontier.entry(req.id).or_insert((edge.uid, OfferSource::Dependency));
            }
        }
    }

    let mut receipts = Vec::with_capacity(frontier.len());

    for (requirement_id, (edge_uid, source)) in frontier {
        let preview = ctx.effects.preview(graph);
        let Ok(edge) = preview.get_edge(edge_uid) else {
            continue;
        };
        let Some(requirement) = edge.requirement.clone() else {
            continue;
        };

        let mut offers: Vec<ProvisionOffer> = provisioners
            .iter()
            .flat_map(|p| p.propose(&requirement, &preview, ctx, templates))
            .map(|mut offer| {
                offer.source.get_or_insert(source);
                offer
            })
            .collect();
        offers.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        if offers.is_empty() {
            ctx.effects.bind_requirement(edge_uid, None, requirement.hard_requirement);
            receipts.push(BuildReceipt {
                requirement_id,
                provisioner: None,
                provider_id: None,
                operation: None,
                accepted: false,
                hard_requirement: requirement.hard_requirement,
                reason: Some(if requirement.hard_requirement { "no_offers" } else { "waived_soft" }),
            });
            continue;
        }

        let accepted = offers.iter().find_map(|offer| {
            offer
                .accept(&preview, ctx)
                .map(|provider| (offer.provisioner, offer.operation.clone(), provider))
        });

        match accepted {
            Some((provisioner, operation, provider)) => {
                ctx.effects.bind_requirement(edge_uid, Some(provider), false);
                receipts.push(BuildReceipt {
                    requirement_id,
                    provisioner: Some(provisioner),
                    provider_id: Some(provider),
                    operation: Some(operation),
                    accepted: true,
                    hard_requirement: requirement.hard_requirement,
                    reason: None,
                });
            }
            None => {
                ctx.effects.bind_requirement(edge_uid, None, requirement.hard_requirement);
                receipts.push(BuildReceipt {
                    requirement_id,
                    provisioner: None,
                    provider_id: None,
                    operation: None,
                    accepted: false,
                    hard_requirement: requirement.hard_requirement,
                    reason: Some(if requirement.hard_requirement { "unresolvable" } else { "waived_soft" }),
                });
            }
        }
    }

    receipts
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::effect::EffectBuffer;
    use crate::entity::{Edge, EdgeKind, Node};

    fn graph_with_role_and_actor() -> (Graph, NodeId, NodeId, EdgeId) {
        let mut graph = Graph::new();
        let role = graph.add_node(Node::new(NodeId::new(), NodeKind::Role, "guard_role"));
        let actor = graph.add_node(Node::new(NodeId::new(), NodeKind::Actor, "guard"));
        let mut requirement = Requirement::new(RequirementPolicy::Any, true);
        requirement.criteria.insert("kind".into(), Value::Str("actor".into()));
        let mut edge = Edge::new(EdgeId::new(), EdgeKind::Affordance, actor, Some(role), "provides");
        edge.requirement = Some(requirement);
        let edge_id = edge.uid;
        graph.add_edge(edge).unwrap();
        (graph, role, actor, edge_id)
    }

    #[test]
    fn graph_provisioner_binds_an_existing_matching_node() {
        let (graph, role, actor, _edge) = graph_with_role_and_actor();
        let mut ctx = Context::new(role);
        ctx.effects = EffectBuffer::with_seed(1);
        let receipts = run_planning(&graph, &mut ctx, &standard_provisioners(), &TemplateRegistry::new());
        assert_eq!(receipts.len(), 1);
        assert!(receipts[0].accepted);
        assert_eq!(receipts[0].provider_id, Some(actor));
        assert_eq!(receipts[0].provisioner, Some("graph"));
    }

    #[test]
    fn hard_requirement_with_no_candidates_is_unresolvable() {
        let mut graph = Graph::new();
        let role = graph.add_node(Node::new(NodeId::new(), NodeKind::Role, "lonely_role"));
        let sink = graph.add_node(Node::new(NodeId::new(), NodeKind::Location, "nowhere"));
        let requirement = Requirement::new(RequirementPolicy::Any, true);
        let mut edge = Edge::new(EdgeId::new(), EdgeKind::Affordance, sink, Some(role), "provides");
        edge.requirement = Some(requirement);
        graph.add_edge(edge).unwrap();

        let mut ctx = Context::new(role);
        ctx.effects = EffectBuffer::with_seed(1);
        let receipts = run_planning(&graph, &mut ctx, &standard_provisioners(), &TemplateRegistry::new());
        assert_eq!(receipts.len(), 1);
        assert!(!receipts[0].accepted);
        assert_eq!(receipts[0].reason, Some("no_offers"));
    }

    #[test]
    fn soft_requirement_with_no_candidates_is_waived_not_fatal() {
        let mut graph = Graph::new();
        let role = graph.add_node(Node::new(NodeId::new(), NodeKind::Role, "optional_role"));
        let sink = graph.add_node(Node::new(NodeId::new(), NodeKind::Location, "nowhere"));
        let requirement = Requirement::new(RequirementPolicy::Any, false);
        let mut edge = Edge::new(EdgeId::new(), EdgeKind::Affordance, sink, Some(role), "provides");
        edge.requirement = Some(requirement);
        graph.add_edge(edge).unwrap();

        let mut ctx = Context::new(role);
        ctx.effects = EffectBuffer::with_seed(1);
        let receipts = run_planning(&graph, &mut ctx, &standard_provisioners(), &TemplateRegistry::new());
        assert_eq!(receipts.len(), 1);
        assert!(!receipts[0].accepted);
        assert!(!receipts[0].hard_requirement);
        assert_eq!(receipts[0].reason, Some("waived_soft"));
    }

    #[test]
    fn affordance_offers_beat_dependency_offers_at_equal_priority() {
        assert!(OfferSource::Affordance.rank() < OfferSource::Dependency.rank());
    }

    #[test]
    fn template_provisioner_materializes_from_a_registered_blueprint() {
        let mut graph = Graph::new();
        let role = graph.add_node(Node::new(NodeId::new(), NodeKind::Role, "role_with_template"));
        let mut requirement = Requirement::new(RequirementPolicy::CreateTemplate, true);
        requirement.template_ref = Some("global_guard".into());
        let mut edge = Edge::new(EdgeId::new(), EdgeKind::Dependency, role, None, "needs");
        edge.requirement = Some(requirement);
        graph.add_edge(edge).unwrap();

        let mut templates = TemplateRegistry::new();
        templates.register(crate::template::Template {
            label: "global_guard".into(),
            kind: NodeKind::Actor,
            tags: Vec::new(),
            locals: BTreeMap::new(),
            content: None,
            scope: None,
        });

        let mut ctx = Context::new(role);
        ctx.effects = EffectBuffer::with_seed(1);
        let receipts = run_planning(&graph, &mut ctx, &standard_provisioners(), &templates);
        assert_eq!(receipts.len(), 1);
        assert!(receipts[0].accepted);
        assert_eq!(receipts[0].provisioner, Some("template"));
    }
}
