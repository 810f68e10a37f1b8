// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Compiles parsed IR into a runnable story graph and template registry.
//!
//! Two passes, mirroring the original tree-script compilers' node-then-edge
//! ordering: the first pass materializes every `Game`/`Scene`/`Block` node
//! (so `Child` ancestry exists for template scope resolution) and registers
//! every template; the second pass wires `actions` into `Choice` edges and
//! `roles`/`settings` into `Dependency` edges, since an action's `successor`
//! may name a block declared later in the same script.

use std::collections::BTreeMap;

use storytangl_core::template::normalize_label;
use storytangl_core::{
    Edge, EdgeId, EdgeKind, Graph, Node, NodeId, NodeKind, Requirement, RequirementPolicy,
    ScopeSelector, Template, TemplateRegistry,
};

use crate::error::{IrError, IrResult};
use crate::script::{BlockScript, RoleDecl, SettingDecl, StoryScript, TemplateDecl};

/// Output of compiling one [`StoryScript`].
#[derive(Debug)]
pub struct CompiledStory {
    /// The committed story graph.
    pub graph: Graph,
    /// Every template the script declared, at every scope.
    pub templates: TemplateRegistry,
    /// The block the playthrough should begin at.
    pub initial_cursor: NodeId,
}

/// Compiles a parsed story script into a runnable graph.
///
/// # Errors
/// [`IrError::UnresolvedReference`] if an action's `successor` names a
/// block this script never declares, or if the script has no blocks at
/// all; propagates [`IrError`] raised constructing the underlying graph
/// (dangling edge endpoints should not occur from well-formed IR, but a
/// [`storytangl_core::error::StError`] from `add_edge` is surfaced as
/// [`IrError::MalformedField`]).
pub fn compile_story(script: &StoryScript) -> IrResult<CompiledStory> {
    let mut graph = Graph::new();
    let mut templates = TemplateRegistry::new();

    let mut root_node = Node::new(NodeId::new(), NodeKind::Game, script.label.clone());
    root_node.locals = script.metadata.clone();
    let root = graph.add_node(root_node);

    register_templates(&mut templates, &script.templates, None, |key| key.clone());

    let mut block_ids: BTreeMap<(String, String), NodeId> = BTreeMap::new();
    let mut block_scripts: BTreeMap<NodeId, &BlockScript> = BTreeMap::new();

    for (scene_key, scene) in &script.scenes {
        let scene_node = Node::new(NodeId::new(), NodeKind::Scene, scene.label.clone());
        let scene_id = graph.add_node(scene_node);
        add_edge(&mut graph, EdgeKind::Child, root, Some(scene_id), scene_key)?;

        register_templates(
            &mut templates,
            &scene.templates,
            Some(ScopeSelector {
                parent_label: Some(scene.label.clone()),
                source_label: None,
            }),
            |key| format!("{scene_key}.{key}"),
        );

        for (block_key, block) in &scene.blocks {
            let mut block_node = Node::new(NodeId::new(), NodeKind::Block, block.label.clone());
            if !block.content.is_empty() {
                block_node.content = Some(block.content.clone());
            }
            let block_id = graph.add_node(block_node);
            add_edge(&mut graph, EdgeKind::Child, scene_id, Some(block_id), block_key)?;

            register_templates(
                &mut templates,
                &block.templates,
                Some(ScopeSelector {
                    parent_label: Some(scene.label.clone()),
                    source_label: Some(block.label.clone()),
                }),
                |key| format!("{scene_key}.{block_key}.{key}"),
            );

            block_ids.insert((scene_key.clone(), block_key.clone()), block_id);
            block_scripts.insert(block_id, block);
        }
    }

    for (scene_key, scene) in &script.scenes {
        for (block_key, block) in &scene.blocks {
            let source_id = block_ids[&(scene_key.clone(), block_key.clone())];

            for role in block.roles.values() {
                add_role_dependency(&mut graph, source_id, role)?;
            }
            for setting in block.settings.values() {
                add_setting_dependency(&mut graph, source_id, setting)?;
            }

            for action in &block.actions {
                let target_id = resolve_successor(&action.successor, scene_key, &block_ids)?;
                let target_block = block_scripts[&target_id];

                let mut edge = Edge::new(EdgeId::new(), EdgeKind::Choice, source_id, Some(target_id), action.text.clone());
                edge.effects = target_block.effects.clone();
                edge.predicate = join_predicate(&target_block.conditions);
                graph
                    .add_edge(edge)
                    .map_err(|e| to_ir_error(e, &format!("scene '{scene_key}' block '{block_key}' action '{}'", action.text)))?;
            }
        }
    }

    let initial_cursor = choose_entry(&script.scenes, &block_ids)
        .ok_or_else(|| IrError::UnresolvedReference {
            reference: "start".to_owned(),
            context: format!("story '{}' has no blocks to begin at", script.label),
        })?;
    graph.initial_cursor_id = Some(initial_cursor);

    Ok(CompiledStory {
        graph,
        templates,
        initial_cursor,
    })
}

fn add_edge(graph: &mut Graph, kind: EdgeKind, source: NodeId, destination: Option<NodeId>, label: &str) -> IrResult<EdgeId> {
    graph
        .add_edge(Edge::new(EdgeId::new(), kind, source, destination, label))
        .map_err(|e| to_ir_error(e, &format!("linking '{label}'")))
}

fn to_ir_error(err: storytangl_core::StError, context: &str) -> IrError {
    IrError::MalformedField {
        field: "<graph>".to_owned(),
        context: context.to_owned(),
        reason: err.to_string(),
    }
}

/// Registers every template in `decls` under a scope-qualified, dot-normalized
/// label. `qualify` turns the author's bare template key into the dotted
/// authoring key this scope should register under (e.g. `"village.guard"`
/// for a template named `guard` inside scene `village`).
fn register_templates(
    registry: &mut TemplateRegistry,
    decls: &BTreeMap<String, TemplateDecl>,
    scope: Option<ScopeSelector>,
    qualify: impl Fn(&String) -> String,
) {
    for (key, decl) in decls {
        let authoring_key = qualify(key);
        registry.register(Template {
            label: normalize_label(&authoring_key),
            kind: decl.kind,
            tags: decl.tags.clone(),
            locals: decl.locals.clone(),
            content: decl.content.clone(),
            scope: scope.clone(),
        });
    }
}

fn add_role_dependency(graph: &mut Graph, source_id: NodeId, role: &RoleDecl) -> IrResult<()> {
    let mut criteria = BTreeMap::new();
    criteria.insert("kind".to_owned(), storytangl_core::Value::Str("actor".to_owned()));
    let policy = if role.actor_template_ref.is_some() {
        RequirementPolicy::CreateTemplate
    } else {
        RequirementPolicy::Any
    };
    let mut requirement = Requirement::new(policy, role.hard);
    requirement.identifier = Some(role.actor_ref.clone());
    requirement.template_ref = role.actor_template_ref.clone();
    requirement.criteria = criteria;

    let mut edge = Edge::new(EdgeId::new(), EdgeKind::Dependency, source_id, None, role.actor_ref.clone());
    edge.requirement = Some(requirement);
    graph
        .add_edge(edge)
        .map_err(|e| to_ir_error(e, &format!("role '{}'", role.actor_ref)))?;
    Ok(())
}

fn add_setting_dependency(graph: &mut Graph, source_id: NodeId, setting: &SettingDecl) -> IrResult<()> {
    let mut criteria = BTreeMap::new();
    criteria.insert("kind".to_owned(), storytangl_core::Value::Str("location".to_owned()));
    let policy = if setting.location_template_ref.is_some() {
        RequirementPolicy::CreateTemplate
    } else {
        RequirementPolicy::Any
    };
    let mut requirement = Requirement::new(policy, setting.hard);
    requirement.identifier = Some(setting.location_ref.clone());
    requirement.template_ref = setting.location_template_ref.clone();
    requirement.criteria = criteria;

    let mut edge = Edge::new(EdgeId::new(), EdgeKind::Dependency, source_id, None, setting.location_ref.clone());
    edge.requirement = Some(requirement);
    graph
        .add_edge(edge)
        .map_err(|e| to_ir_error(e, &format!("setting '{}'", setting.location_ref)))?;
    Ok(())
}

/// ANDs a block's `conditions:` expressions into the single predicate an
/// edge carries. An empty list yields no predicate (the edge always fires).
fn join_predicate(conditions: &[String]) -> Option<String> {
    if conditions.is_empty() {
        return None;
    }
    Some(
        conditions
            .iter()
            .map(|c| format!("({c})"))
            .collect::<Vec<_>>()
            .join(" and "),
    )
}

/// Resolves an action's `successor` against the compiled block table.
/// `"scene.block"` is a qualified reference; a bare name resolves within
/// `current_scene`.
fn resolve_successor(
    reference: &str,
    current_scene: &str,
    block_ids: &BTreeMap<(String, String), NodeId>,
) -> IrResult<NodeId> {
    if let Some((scene_part, block_part)) = reference.split_once('.') {
        if let Some(id) = block_ids.get(&(scene_part.to_owned(), block_part.to_owned())) {
            return Ok(*id);
        }
    }
    if let Some(id) = block_ids.get(&(current_scene.to_owned(), reference.to_owned())) {
        return Ok(*id);
    }
    Err(IrError::UnresolvedReference {
        reference: reference.to_owned(),
        context: format!("scene '{current_scene}'"),
    })
}

/// Picks the playthrough's starting block, following the original tree
/// loader's `entry_label` convention: a block literally named `start`,
/// searched scene-by-scene in label order. Scripts that don't follow the
/// convention still compile — the first declared block is used instead,
/// so a world without a `start` block degrades to "begin somewhere"
/// rather than failing to compile.
fn choose_entry(
    scenes: &BTreeMap<String, crate::script::SceneScript>,
    block_ids: &BTreeMap<(String, String), NodeId>,
) -> Option<NodeId> {
    for (scene_key, _scene) in scenes {
        if let Some(id) = block_ids.get(&(scene_key.clone(), "start".to_owned())) {
            return Some(*id);
        }
    }
    block_ids.values().next().copied()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use storytangl_core::{EdgeKind as EK, NodeKind as NK};

    fn village_script() -> StoryScript {
        let yaml = r#"
label: village
scenes:
  intro:
    blocks:
      start:
        content: You arrive.
        actions:
          - text: Enter the tavern
            successor: tavern
      tavern:
        content: The tavern is warm and loud.
        roles:
          bartender:
            actor_template_ref: village_bartender
        settings:
          room: null
        conditions:
          - "has_key"
        effects:
          - "visited_tavern = True"
templates:
  village_bartender:
    kind: actor
    locals:
      mood: gruff
"#;
        StoryScript::parse(yaml).unwrap()
    }

    #[test]
    fn compiles_blocks_scenes_and_game_root_with_child_edges() {
        let script = village_script();
        let compiled = compile_story(&script).unwrap();
        let root = compiled.graph.get_by_label("village").unwrap();
        assert_eq!(root.kind, NK::Game);
        let scene_edges = compiled.graph.edges_out(root.uid, Some(EK::Child));
        assert_eq!(scene_edges.len(), 1);
    }

    #[test]
    fn picks_the_block_named_start_as_initial_cursor() {
        let script = village_script();
        let compiled = compile_story(&script).unwrap();
        let start = compiled.graph.get(compiled.initial_cursor).unwrap();
        assert_eq!(start.label, "start");
    }

    #[test]
    fn action_compiles_to_a_choice_edge_carrying_the_destination_blocks_effects_and_conditions() {
        let script = village_script();
        let compiled = compile_story(&script).unwrap();
        let choice_edges = compiled.graph.edges_out(compiled.initial_cursor, Some(EK::Choice));
        assert_eq!(choice_edges.len(), 1);
        let edge = choice_edges[0];
        assert_eq!(edge.predicate.as_deref(), Some("(has_key)"));
        assert_eq!(edge.effects, vec!["visited_tavern = True".to_owned()]);
    }

    #[test]
    fn role_and_setting_shorthands_compile_to_unresolved_dependency_edges() {
        let script = village_script();
        let compiled = compile_story(&script).unwrap();
        let tavern = compiled.graph.get_by_label("tavern").unwrap();
        let deps = compiled.graph.edges_out(tavern.uid, Some(EK::Dependency));
        assert_eq!(deps.len(), 2);
        assert!(deps.iter().all(|e| e.destination_uid.is_none()));
        let bartender_req = deps
            .iter()
            .find(|e| e.label == "bartender")
            .unwrap()
            .requirement
            .as_ref()
            .unwrap();
        assert_eq!(bartender_req.template_ref.as_deref(), Some("village_bartender"));
    }

    #[test]
    fn global_template_registers_under_its_normalized_label() {
        let script = village_script();
        let compiled = compile_story(&script).unwrap();
        assert!(compiled.templates.find_all().any(|t| t.label == "village_bartender"));
    }

    #[test]
    fn unresolved_successor_is_reported_with_context() {
        let yaml = r#"
label: broken
scenes:
  intro:
    blocks:
      start:
        content: hi
        actions:
          - text: go
            successor: nowhere
"#;
        let script = StoryScript::parse(yaml).unwrap();
        let err = compile_story(&script).unwrap_err();
        assert!(matches!(err, IrError::UnresolvedReference { .. }));
    }
}
