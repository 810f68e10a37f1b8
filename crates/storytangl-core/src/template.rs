// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! The template registry (§4.8): author-declared blueprints the
//! `CREATE_TEMPLATE` provisioning policy materializes from.
//!
//! Templates are authored at global, scene, or block scope (grounded in the
//! original world-script compiler's `global.<name>` / scene-level
//! `templates:` / block-level `templates:` sections) and registered under a
//! normalized label — the authoring key with its namespace dots turned into
//! underscores, e.g. `scene.guard` → `scene_guard`. A reference can name
//! that normalized label directly (a *qualified* reference) or just the
//! bare suffix (`guard`), in which case every in-scope candidate is ranked
//! by specificity, block beating scene beating global.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::NodeKind;
use crate::error::{ErrorContext, StError, StResult};
use crate::graph::Graph;
use crate::ident::NodeId;
use crate::value::Value;

/// Where a template is admitted for use, narrowing `CREATE_TEMPLATE`
/// resolution to a region of the cursor's ancestry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSelector {
    /// Admitted only when an ancestor scene carries this label.
    pub parent_label: Option<String>,
    /// Admitted only when the containing block carries this label.
    pub source_label: Option<String>,
}

impl ScopeSelector {
    /// Global scope: admitted everywhere.
    #[must_use]
    pub const fn global() -> Self {
        Self {
            parent_label: None,
            source_label: None,
        }
    }

    /// Specificity rank used to break ties between bare-name candidates:
    /// block (2) beats scene (1) beats global (0).
    #[must_use]
    pub const fn specificity(&self) -> u8 {
        if self.source_label.is_some() {
            2
        } else if self.parent_label.is_some() {
            1
        } else {
            0
        }
    }
}

/// An author-declared blueprint a `CREATE_TEMPLATE` requirement
/// materializes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// The normalized registry key (authoring key with `.` replaced by `_`).
    pub label: String,
    /// The kind of node this template materializes.
    pub kind: NodeKind,
    /// Tags seeded onto the materialized node.
    pub tags: Vec<String>,
    /// Locals seeded onto the materialized node.
    pub locals: BTreeMap<String, Value>,
    /// Authored content, if any.
    pub content: Option<String>,
    /// Scope admission; `None` means global.
    pub scope: Option<ScopeSelector>,
}

impl Template {
    fn bare_name(&self) -> &str {
        self.label.rsplit('_').next().unwrap_or(&self.label)
    }

    fn admits(&self, graph: &Graph, cursor: NodeId) -> bool {
        let Some(scope) = &self.scope else {
            return true;
        };
        let mut chain = vec![cursor];
        chain.extend(graph.ancestors(cursor, 256));
        if let Some(parent_label) = &scope.parent_label {
            let admitted = chain.iter().any(|uid| {
                graph
                    .get(*uid)
                    .is_ok_and(|n| n.kind == NodeKind::Scene && &n.label == parent_label)
            });
            if !admitted {
                return false;
            }
        }
        if let Some(source_label) = &scope.source_label {
            let admitted = chain.iter().any(|uid| {
                graph
                    .get(*uid)
                    .is_ok_and(|n| n.kind == NodeKind::Block && &n.label == source_label)
            });
            if !admitted {
                return false;
            }
        }
        true
    }
}

/// Normalizes an authoring key (`"scene.guard"`) into a registry label
/// (`"scene_guard"`).
#[must_use]
pub fn normalize_label(authoring_key: &str) -> String {
    authoring_key.replace('.', "_")
}

/// The set of templates compiled for one world.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Template>,
}

impl TemplateRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a template under its already-normalized label, replacing
    /// any earlier template with the same label.
    pub fn register(&mut self, template: Template) {
        self.templates.insert(template.label.clone(), template);
    }

    /// Every registered template, in label order.
    pub fn find_all(&self) -> impl Iterator<Item = &Template> {
        self.templates.values()
    }

    /// Resolves `reference` against the cursor's current scope.
    ///
    /// Tries an exact (qualified) label match first; if that match exists
    /// but isn't admitted from `cursor`, that's still a
    /// [`StError::NoTemplateInScope`] rather than falling through to a bare
    /// match (an explicit qualified reference is a promise about *which*
    /// template the author meant). Otherwise treats `reference` as a bare
    /// name and ranks every admitted candidate by
    /// [`ScopeSelector::specificity`], highest first; ties are an
    /// [`StError::Ambiguous`].
    ///
    /// # Errors
    /// [`StError::NoTemplateInScope`] if nothing resolves;
    /// [`StError::Ambiguous`] if two equally-specific bare candidates tie.
    pub fn find_template(&self, reference: &str, graph: &Graph, cursor: NodeId) -> StResult<&Template> {
        if let Some(exact) = self.templates.get(reference) {
            return if exact.admits(graph, cursor) {
                Ok(exact)
            } else {
                Err(StError::NoTemplateInScope {
                    reference: reference.to_owned(),
                })
            };
        }

        let mut candidates: Vec<&Template> = self
            .templates
            .values()
            .filter(|t| t.bare_name() == reference && t.admits(graph, cursor))
            .collect();
        candidates.sort_by_key(|t| std::cmp::Reverse(t.scope.as_ref().map_or(0, ScopeSelector::specificity)));

        match candidates.as_slice() {
            [] => Err(StError::NoTemplateInScope {
                reference: reference.to_owned(),
            }),
            [only] => Ok(only),
            [best, rest @ ..]
                if rest.iter().all(|t| {
                    t.scope.as_ref().map_or(0, ScopeSelector::specificity)
                        < best.scope.as_ref().map_or(0, ScopeSelector::specificity)
                }) =>
            {
                Ok(best)
            }
            _ => Err(StError::ambiguous(
                format!("template reference '{reference}'"),
                ErrorContext::label(reference),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::Node;

    fn template(label: &str, scope: Option<ScopeSelector>) -> Template {
        Template {
            label: label.to_owned(),
            kind: NodeKind::Actor,
            tags: Vec::new(),
            locals: BTreeMap::new(),
            content: None,
            scope,
        }
    }

    #[test]
    fn normalize_label_replaces_dots_with_underscores() {
        assert_eq!(normalize_label("scene.guard"), "scene_guard");
    }

    #[test]
    fn qualified_reference_out_of_scope_is_an_error_not_a_fallback() {
        let mut registry = TemplateRegistry::new();
        registry.register(template(
            "scene_guard",
            Some(ScopeSelector {
                parent_label: Some("town".into()),
                source_label: None,
            }),
        ));
        let graph = Graph::new();
        let cursor = NodeId::new();
        assert!(matches!(
            registry.find_template("scene_guard", &graph, cursor),
            Err(StError::NoTemplateInScope { .. })
        ));
    }

    #[test]
    fn bare_reference_prefers_most_specific_in_scope_candidate() {
        let mut registry = TemplateRegistry::new();
        registry.register(template("global_guard", None));
        registry.register(template(
            "scene_guard",
            Some(ScopeSelector {
                parent_label: Some("town".into()),
                source_label: None,
            }),
        ));
        let mut graph = Graph::new();
        let town = graph.add_node(Node::new(NodeId::new(), NodeKind::Scene, "town"));
        let resolved = registry.find_template("guard", &graph, town).unwrap();
        assert_eq!(resolved.label, "scene_guard");
    }

    #[test]
    fn bare_reference_falls_back_to_global_when_nothing_more_specific_is_in_scope() {
        let mut registry = TemplateRegistry::new();
        registry.register(template("global_guard", None));
        registry.register(template(
            "scene_guard",
            Some(ScopeSelector {
                parent_label: Some("town".into()),
                source_label: None,
            }),
        ));
        let graph = Graph::new();
        let cursor = NodeId::new();
        let resolved = registry.find_template("guard", &graph, cursor).unwrap();
        assert_eq!(resolved.label, "global_guard");
    }
}
