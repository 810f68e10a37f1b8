// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Entity types: [`Node`], [`Edge`], and the [`Requirement`] a provisionable
//! edge carries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::expr::CompiledExpr;
use crate::ident::{EdgeId, NodeId, RequirementId};
use crate::value::Value;

/// Discriminates the concrete subtype of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A content-bearing narrative atom.
    Block,
    /// A static, inline-expandable fact.
    Concept,
    /// A character.
    Actor,
    /// A place.
    Location,
    /// A role slot awaiting an Actor provider.
    Role,
    /// A scene grouping blocks.
    Scene,
    /// The root of a world's story graph.
    Game,
    /// Synthetic entry point used only for softlock detection.
    Source,
    /// Synthetic exit point used only for softlock detection.
    Sink,
}

/// Discriminates the concrete kind of an [`Edge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Ancestry edge; also used to compute scope chains.
    Child,
    /// A traversal option offered to the player.
    Choice,
    /// An outbound requirement to be resolved by provisioning.
    Dependency,
    /// An inbound offer that can satisfy another entity's requirement.
    Affordance,
    /// A reference to a media role, resolved by scope precedence.
    MediaDep,
    /// An authored effect-bearing transition, evaluated every tick.
    Action,
    /// A generic, untyped relation between two nodes.
    Association,
}

/// The phase in which a [`Choice`](EdgeKind::Choice) edge's predicate is
/// (re-)evaluated to decide whether it auto-fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPhase {
    /// Evaluated in PREREQS, before the current cursor's own effects run.
    Prereqs,
    /// Evaluated in POSTREQS, after bookkeeping.
    Postreqs,
}

/// A subroutine-jump edge variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpKind {
    /// Pushes a [`crate::context::StackFrame`] and transfers control.
    JumpAndReturn,
    /// Pops the current frame and returns control to its `return_cursor_id`.
    JumpReturn,
}

/// How a [`Requirement`] should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequirementPolicy {
    /// Any provisioner may satisfy this requirement.
    Any,
    /// Only materialize a fresh node; never reuse or clone.
    Create,
    /// Materialize from a named template.
    CreateTemplate,
    /// Clone an existing matching node.
    Clone,
    /// Mutate an existing matching node in place.
    Update,
    /// No provisioning; the requirement is inert (used for scope admission
    /// checks without a concrete build).
    Noop,
}

/// Description of what a provisionable edge needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    /// This requirement's own id.
    pub id: RequirementId,
    /// An explicit identifier criterion, if the author pinned one.
    pub identifier: Option<String>,
    /// A template registry reference, for `CREATE_TEMPLATE` resolution.
    pub template_ref: Option<String>,
    /// An asset bundle reference, for `AssetProvisioner` resolution.
    pub asset_ref: Option<String>,
    /// Free-form selection criteria matched against candidate nodes.
    pub criteria: BTreeMap<String, Value>,
    /// The resolution policy.
    pub policy: RequirementPolicy,
    /// Whether traversal must stop if this cannot be satisfied.
    pub hard_requirement: bool,
    /// The bound provider, once satisfied. `provider_id.is_some()` is the
    /// definition of "satisfied".
    pub provider_id: Option<NodeId>,
    /// Set by PLANNING when a hard requirement could not be bound; checked
    /// by POSTREQS.
    pub is_unresolvable: bool,
}

impl Requirement {
    /// Builds a fresh, unresolved requirement.
    #[must_use]
    pub fn new(policy: RequirementPolicy, hard_requirement: bool) -> Self {
        Self {
            id: RequirementId::new(),
            identifier: None,
            template_ref: None,
            asset_ref: None,
            criteria: BTreeMap::new(),
            policy,
            hard_requirement,
            provider_id: None,
            is_unresolvable: false,
        }
    }

    /// A requirement is satisfied exactly when it has a bound provider.
    #[must_use]
    pub const fn is_satisfied(&self) -> bool {
        self.provider_id.is_some()
    }
}

/// Every addressable object in a story graph: the common fields shared by
/// every [`Node`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable identity; immutable for the node's lifetime.
    pub uid: NodeId,
    /// The node's subtype.
    pub kind: NodeKind,
    /// Human-readable label; mutable.
    pub label: String,
    /// Free-form tags; mutable.
    pub tags: Vec<String>,
    /// Namespace frame consulted by `ns()` resolution.
    pub locals: BTreeMap<String, Value>,
    /// Raw authored content string (for `Block`/`Concept`); templated and
    /// expanded during JOURNAL.
    pub content: Option<String>,
    /// Cached compiled form of `content`'s embedded expressions, keyed by a
    /// hash of the source so edits invalidate the cache.
    #[serde(skip)]
    pub compiled_content: Option<CompiledExpr>,
}

impl Node {
    /// Builds a new node with empty locals/tags and no content.
    #[must_use]
    pub fn new(uid: NodeId, kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            uid,
            kind,
            label: label.into(),
            tags: Vec::new(),
            locals: BTreeMap::new(),
            content: None,
            compiled_content: None,
        }
    }
}

/// A directed reference between two nodes, polymorphic over [`EdgeKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Stable identity.
    pub uid: EdgeId,
    /// The edge's subtype.
    pub kind: EdgeKind,
    /// The source endpoint. Always set.
    pub source_uid: NodeId,
    /// The destination endpoint. May be `None` only for an unresolved
    /// `Dependency`/`Affordance` edge (invariant I1).
    pub destination_uid: Option<NodeId>,
    /// Human-readable label.
    pub label: String,
    /// For `Choice` edges, when its predicate is (re-)checked.
    pub trigger_phase: Option<TriggerPhase>,
    /// For subroutine-jump edges, which variant this is.
    pub jump_kind: Option<JumpKind>,
    /// Guard expression; an edge only fires/counts as available when this
    /// evaluates truthy (or is absent).
    pub predicate: Option<String>,
    /// Effect-mode expressions run when this edge fires.
    pub effects: Vec<String>,
    /// For provisionable edges (`Dependency`/`Affordance`), what they need.
    pub requirement: Option<Requirement>,
}

impl Edge {
    /// Builds a new edge with no predicate, effects, or requirement.
    #[must_use]
    pub fn new(
        uid: EdgeId,
        kind: EdgeKind,
        source_uid: NodeId,
        destination_uid: Option<NodeId>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            uid,
            kind,
            source_uid,
            destination_uid,
            label: label.into(),
            trigger_phase: None,
            jump_kind: None,
            predicate: None,
            effects: Vec::new(),
            requirement: None,
        }
    }

    /// Whether this edge is allowed to have a null destination given its
    /// kind (invariant I1).
    #[must_use]
    pub const fn allows_unresolved_destination(&self) -> bool {
        matches!(self.kind, EdgeKind::Dependency | EdgeKind::Affordance)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn requirement_is_unsatisfied_until_bound() {
        let mut req = Requirement::new(RequirementPolicy::Any, true);
        assert!(!req.is_satisfied());
        req.provider_id = Some(NodeId::new());
        assert!(req.is_satisfied());
    }

    #[test]
    fn only_dependency_and_affordance_allow_unresolved_destination() {
        let edge = Edge::new(EdgeId::new(), EdgeKind::Choice, NodeId::new(), None, "go");
        assert!(!edge.allows_unresolved_destination());
        let edge = Edge::new(
            EdgeId::new(),
            EdgeKind::Dependency,
            NodeId::new(),
            None,
            "needs",
        );
        assert!(edge.allows_unresolved_destination());
    }
}
