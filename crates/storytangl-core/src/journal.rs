// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! The journal & content pipeline (§4.7): turning a cursor's authored
//! content into the ordered [`Fragment`]s a client renders for one tick.
//!
//! Composition runs content through, in order: namespace interpolation
//! (`{{ expr }}`, via [`crate::expr`] — an identifier that names a `Concept`
//! linked as a `Child` of the cursor resolves to that concept's own content,
//! depth-limited so an authoring cycle can't hang a tick), then
//! dialog-block parsing (`> [!tag] Speaker` paragraphs, grounded in the
//! original dialog-discourse module) — finally appending one
//! [`FragmentKind::Choice`] fragment per currently available outbound
//! `Choice`/`Action` edge.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::entity::{EdgeKind, NodeKind};
use crate::error::StError;
use crate::expr;
use crate::graph::Graph;
use crate::ident::NodeId;
use crate::value::Value;

/// Maximum concept-expansion recursion depth before a `{{ name }}` reference
/// to a linked `Concept` resolves to nothing rather than recursing further
/// (never an error — a cycle in authored content should degrade, not abort
/// the tick). Consulted by [`crate::context::Context::ns`].
pub const MAX_CONCEPT_DEPTH: u32 = 8;

/// How a fragment's `content` should be interpreted by a renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFormat {
    /// Plain text, no markup.
    PlainText,
    /// CommonMark-flavored markdown.
    Markdown,
    /// `content` is itself an absolute-style URL (media fragments).
    Url,
    /// `content` is an opaque structured payload, interpreted by kind.
    Data,
}

/// The variant-specific payload of a [`Fragment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FragmentKind {
    /// Plain narrative text with no speaker attribution.
    Text,
    /// Text attributed to a speaker, with a delivery/class tag.
    Attributed {
        /// Who is speaking (a label, or `"narrator"`).
        speaker: String,
        /// The dialog class (e.g. `"narration"`, or an author-defined tag
        /// parsed from a `> [!tag]` header).
        how: String,
    },
    /// A media reference resolved through world/world-system/system scope
    /// precedence.
    Media {
        /// The resolved media URL.
        url: String,
        /// Which scope resolved it (`"world"`, `"world_system"`, `"system"`).
        scope: String,
    },
    /// A single structured key/value datum (e.g. a stat readout).
    KeyValue {
        /// The key.
        key: String,
        /// The value.
        value: Value,
    },
    /// A nested group of fragments, rendered together.
    Group {
        /// The grouped children, in order.
        children: Vec<Fragment>,
    },
    /// One currently available traversal option.
    Choice {
        /// The edge's label, shown to the player.
        label: String,
        /// Where choosing it would move the cursor.
        target: NodeId,
    },
    /// A reference to a fragment emitted earlier in the playthrough, for
    /// clients that want to patch an existing render rather than append.
    Update {
        /// The fragment being referenced.
        ref_id: NodeId,
    },
    /// An expanded concept inclusion, kept as its own fragment so a client
    /// can style inline facts distinctly from authored prose.
    Concept {
        /// The concept node's label.
        label: String,
    },
}

/// One renderable unit of journal output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// The entity this fragment was produced from (the speaking/authoring
    /// node), or a freshly allocated id for an ephemeral fragment (a parsed
    /// dialog paragraph has no graph entity of its own).
    pub uid: NodeId,
    /// The variant-specific payload.
    pub kind: FragmentKind,
    /// An optional caller-facing label (distinct from `kind`'s own label
    /// fields, which are specific to that variant).
    pub label: Option<String>,
    /// The rendered, fully-expanded text.
    pub content: String,
    /// How to interpret `content`.
    pub format: ContentFormat,
    /// Renderer hints (e.g. `{"emphasis": "italic"}`), passed through
    /// verbatim.
    pub presentation_hints: BTreeMap<String, Value>,
}

impl Fragment {
    fn new(uid: NodeId, kind: FragmentKind, content: impl Into<String>) -> Self {
        Self {
            uid,
            kind,
            label: None,
            content: content.into(),
            format: ContentFormat::PlainText,
            presentation_hints: BTreeMap::new(),
        }
    }

    /// Builds a plain narration fragment.
    #[must_use]
    pub fn text(uid: NodeId, content: impl Into<String>) -> Self {
        Self::new(uid, FragmentKind::Text, content)
    }

    /// Builds a speaker-attributed fragment.
    #[must_use]
    pub fn attributed(uid: NodeId, speaker: impl Into<String>, how: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            uid,
            FragmentKind::Attributed {
                speaker: speaker.into(),
                how: how.into(),
            },
            content,
        )
    }

    /// Builds a choice fragment for one available outbound edge.
    #[must_use]
    pub fn choice(uid: NodeId, label: impl Into<String>, target: NodeId) -> Self {
        let label = label.into();
        Self::new(uid, FragmentKind::Choice { label: label.clone(), target }, label)
    }

    /// Builds a concept-inclusion fragment.
    #[must_use]
    pub fn concept(uid: NodeId, label: impl Into<String>, content: impl Into<String>) -> Self {
        let label = label.into();
        Self::new(uid, FragmentKind::Concept { label }, content)
    }

    /// Builds a media fragment for a resolved `MediaDep` role.
    #[must_use]
    pub fn media(uid: NodeId, url: impl Into<String>, scope: impl Into<String>) -> Self {
        let url = url.into();
        let mut fragment = Self::new(
            uid,
            FragmentKind::Media { url: url.clone(), scope: scope.into() },
            url,
        );
        fragment.format = ContentFormat::Url;
        fragment
    }
}

// ---- Dialog parsing ---------------------------------------------------------

#[allow(clippy::expect_used)] // pattern is a fixed literal, checked once here
static DIALOG_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^>\s*\[!([\w.\-]+)\s*\]\s*(\S.*)?$").expect("valid regex"));

fn strip_dialog_prefix(line: &str) -> &str {
    line.strip_prefix('>').map_or(line, str::trim_start)
}

/// Parses `text` into dialog paragraphs: blocks are split on blank lines; a
/// paragraph whose first line matches `> [!tag] Speaker` becomes an
/// [`FragmentKind::Attributed`] fragment with that tag/speaker, its
/// remaining `>`-prefixed lines joined with spaces into the body. Any other
/// paragraph becomes a plain [`FragmentKind::Text`] narration fragment.
#[must_use]
pub fn parse_dialog(uid: NodeId, text: &str) -> Vec<Fragment> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|paragraph| parse_dialog_paragraph(uid, paragraph))
        .collect()
}

fn parse_dialog_paragraph(uid: NodeId, paragraph: &str) -> Fragment {
    let mut lines = paragraph.lines();
    let Some(first) = lines.next() else {
        return Fragment::text(uid, String::new());
    };
    let Some(caps) = DIALOG_HEADER.captures(first) else {
        return Fragment::text(uid, paragraph);
    };
    let dialog_class = caps[1].to_owned();
    let speaker = caps.get(2).map_or("narrator", |m| m.as_str()).to_owned();
    let body: Vec<&str> = lines.map(strip_dialog_prefix).collect();
    Fragment::attributed(uid, speaker, dialog_class, body.join(" "))
}

// ---- Composition ------------------------------------------------------------

/// Renders `node`'s authored content end-to-end: namespace interpolation
/// (which resolves a linked `Concept`'s content along with plain namespace
/// lookups), then dialog parsing. Returns one or more fragments (a plain
/// block without dialog markup still comes back as a single narration
/// fragment).
///
/// # Errors
/// Propagates [`StError::UnsafeExpression`] from a malformed embedded
/// expression.
pub fn compose_content(uid: NodeId, raw_content: &str, graph: &Graph, ctx: &Context) -> Result<Vec<Fragment>, StError> {
    let interpolated = expr::expand_template(raw_content, graph, ctx)?;
    Ok(parse_dialog(uid, &interpolated))
}

/// Appends one [`FragmentKind::Choice`] fragment per outbound `Choice` edge
/// from `cursor` whose predicate (if any) currently evaluates truthy —
/// "available" in the sense §4.4's softlock/traversal machinery uses.
#[must_use]
pub fn choice_fragments(cursor: NodeId, graph: &Graph, ctx: &Context) -> Vec<Fragment> {
    graph
        .edges_out(cursor, Some(EdgeKind::Choice))
        .into_iter()
        .filter(|edge| edge_is_available(edge, graph, ctx))
        .filter_map(|edge| {
            edge.destination_uid
                .map(|target| Fragment::choice(edge.uid.as_uuid().into(), edge.label.clone(), target))
        })
        .collect()
}

/// Resolves every outbound `MediaDep` edge from `cursor` against the
/// graph's [`crate::graph::MediaRegistry`], one [`FragmentKind::Media`]
/// fragment per role that resolves. A `MediaDep` edge whose role (its
/// `label`) has no binding in any of the three scopes is skipped rather than
/// failing the tick — an unbound media role is an authoring gap, not a
/// runtime error, since the asset pipeline itself is an external
/// collaborator this crate only reproduces the contract for.
#[must_use]
pub fn media_fragments(cursor: NodeId, graph: &Graph) -> Vec<Fragment> {
    graph
        .edges_out(cursor, Some(EdgeKind::MediaDep))
        .into_iter()
        .filter_map(|edge| {
            let (url, scope) = graph.resolve_media(&edge.label)?;
            Some(Fragment::media(edge.uid.as_uuid().into(), url, scope))
        })
        .collect()
}

pub(crate) fn edge_is_available(edge: &crate::entity::Edge, graph: &Graph, ctx: &Context) -> bool {
    edge.destination_uid.is_some()
        && edge.predicate.as_deref().is_none_or(|source| {
            expr::compile_predicate(source)
                .map(|compiled| expr::eval_predicate(&compiled, graph, ctx))
                .unwrap_or(false)
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entity::{Edge, Node};
    use crate::ident::EdgeId;

    /// A Block with a `dragon` Concept linked as its `Child`, content "a red
    /// dragon" — the graph shape from the seed scenario in which a template
    /// reference to a linked concept's label must resolve to its content.
    fn concept_graph() -> (Graph, NodeId) {
        let mut graph = Graph::new();
        let block = graph.add_node(Node::new(NodeId::new(), NodeKind::Block, "b"));
        let mut concept = Node::new(NodeId::new(), NodeKind::Concept, "dragon");
        concept.content = Some("a red dragon".into());
        let concept_uid = concept.uid;
        graph.add_node(concept);
        graph
            .add_edge(Edge::new(EdgeId::new(), EdgeKind::Child, block, Some(concept_uid), "dragon"))
            .unwrap();
        (graph, block)
    }

    #[test]
    fn compose_content_resolves_linked_concept_through_template_syntax() {
        let (graph, block) = concept_graph();
        let ctx = Context::new(block);
        let fragments = compose_content(block, "You see {{ dragon }}.", &graph, &ctx).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].content, "You see a red dragon.");
        assert!(!matches!(fragments[0].kind, FragmentKind::Concept { .. }));
    }

    #[test]
    fn compose_content_renders_unlinked_concept_reference_as_empty() {
        let (graph, block) = concept_graph();
        let ctx = Context::new(block);
        let fragments = compose_content(block, "A {{ griffin }} appears.", &graph, &ctx).unwrap();
        assert_eq!(fragments[0].content, "A  appears.");
    }

    #[test]
    fn parse_dialog_splits_narration_from_attributed_paragraphs() {
        let uid = NodeId::new();
        let text = "The room is quiet.\n\n> [!whisper] Mira\n> Did you hear that?\n> I almost missed it.";
        let fragments = parse_dialog(uid, text);
        assert_eq!(fragments.len(), 2);
        assert!(matches!(&fragments[0].kind, FragmentKind::Text));
        assert_eq!(fragments[0].content, "The room is quiet.");
        match &fragments[1].kind {
            FragmentKind::Attributed { speaker, how } => {
                assert_eq!(speaker, "Mira");
                assert_eq!(how, "whisper");
            }
            other => panic!("expected Attributed, got {other:?}"),
        }
        assert_eq!(fragments[1].content, "Did you hear that? I almost missed it.");
    }

    #[test]
    fn media_fragments_resolves_bound_roles_and_skips_unbound_ones() {
        let mut graph = Graph::new();
        let actor = graph.add_node(Node::new(NodeId::new(), NodeKind::Actor, "hero"));
        let role_node = graph.add_node(Node::new(NodeId::new(), NodeKind::Role, "hero_portrait"));
        let other_role_node = graph.add_node(Node::new(NodeId::new(), NodeKind::Role, "hero_theme"));
        graph
            .add_edge(Edge::new(EdgeId::new(), EdgeKind::MediaDep, actor, Some(role_node), "portrait"))
            .unwrap();
        graph
            .add_edge(Edge::new(EdgeId::new(), EdgeKind::MediaDep, actor, Some(other_role_node), "theme_song"))
            .unwrap();
        graph.media.world.insert("portrait".into(), "world://hero.png".into());

        let fragments = media_fragments(actor, &graph);
        assert_eq!(fragments.len(), 1);
        match &fragments[0].kind {
            FragmentKind::Media { url, scope } => {
                assert_eq!(url, "world://hero.png");
                assert_eq!(scope, "world");
            }
            other => panic!("expected Media, got {other:?}"),
        }
        assert_eq!(fragments[0].format, ContentFormat::Url);
    }

    #[test]
    fn compose_content_interpolates_then_parses_dialog() {
        let (graph, block) = concept_graph();
        let ctx = Context::new(block);
        let fragments = compose_content(block, "You see {{ dragon }}: {{ 1 + 1 }} heads.", &graph, &ctx).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].content, "You see a red dragon: 2 heads.");
    }
}
