// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! The YAML story-script grammar (spec §6): `{label, metadata, templates?,
//! scenes: {...}}`, with `roles`/`settings` shorthand expansion at both
//! scene and block scope.
//!
//! This is hand-walked over `serde_yaml::Value` rather than derived with
//! `#[derive(Deserialize)]`, because the shorthand forms (`roles: [...]` vs
//! `roles: {...}` vs a bare string vs a nested mapping) aren't representable
//! as one serde shape without losing the author-facing ergonomics the
//! original loader's `model_validate` gave for free.

use std::collections::BTreeMap;

use storytangl_core::{NodeKind, Value};

use crate::error::{IrError, IrResult};
use crate::yaml_value::{get_str, get_str_list, yaml_to_locals};

/// An author-declared blueprint, prior to normalization into the engine's
/// [`storytangl_core::Template`].
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDecl {
    /// The authoring key this template was declared under (dotted form not
    /// yet normalized).
    pub label: String,
    /// What kind of node this materializes into.
    pub kind: NodeKind,
    /// Seed tags.
    pub tags: Vec<String>,
    /// Seed locals.
    pub locals: BTreeMap<String, Value>,
    /// Seed content.
    pub content: Option<String>,
}

/// One role slot a block or scene declares, to be resolved by PLANNING into
/// an `Actor` via a `Dependency` edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDecl {
    /// The actor this role refers to by label/identifier, if one should
    /// already exist.
    pub actor_ref: String,
    /// The template to materialize from if no existing actor matches.
    pub actor_template_ref: Option<String>,
    /// Whether traversal must stop if this role cannot be filled.
    pub hard: bool,
}

/// One location slot, the `settings` analogue of [`RoleDecl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingDecl {
    /// The location this setting refers to by label/identifier.
    pub location_ref: String,
    /// The template to materialize from if no existing location matches.
    pub location_template_ref: Option<String>,
    /// Whether traversal must stop if this setting cannot be filled.
    pub hard: bool,
}

/// One authored traversal option: `{text, successor}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDecl {
    /// The choice's player-facing label.
    pub text: String,
    /// The target block reference (`"scene.block"` or a bare block label
    /// resolved within the same scene).
    pub successor: String,
}

/// One content-bearing block within a scene.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockScript {
    /// The block's authoring key.
    pub label: String,
    /// Raw authored content, templated at JOURNAL time.
    pub content: String,
    /// Outbound traversal options.
    pub actions: Vec<ActionDecl>,
    /// Role slots, keyed by role name.
    pub roles: BTreeMap<String, RoleDecl>,
    /// Location slots, keyed by setting name.
    pub settings: BTreeMap<String, SettingDecl>,
    /// Effect-mode expressions run when an edge into this block fires.
    pub effects: Vec<String>,
    /// Predicate expressions guarding edges into this block (ANDed
    /// together into the edge's single `predicate`).
    pub conditions: Vec<String>,
    /// Block-scoped templates, admitted only from within this block.
    pub templates: BTreeMap<String, TemplateDecl>,
}

/// A scene: a named group of blocks sharing scope.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneScript {
    /// The scene's authoring key.
    pub label: String,
    /// Scene-scoped templates, admitted from anywhere within the scene.
    pub templates: BTreeMap<String, TemplateDecl>,
    /// The scene's blocks, keyed by block label.
    pub blocks: BTreeMap<String, BlockScript>,
}

/// A full, parsed story script: the top-level unit a world bundle compiles.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryScript {
    /// The script's own label (becomes the `Game` root node's label).
    pub label: String,
    /// Free-form author metadata, seeded onto the `Game` root's locals.
    pub metadata: BTreeMap<String, Value>,
    /// Global-scope templates, admitted everywhere.
    pub templates: BTreeMap<String, TemplateDecl>,
    /// The script's scenes, keyed by scene label.
    pub scenes: BTreeMap<String, SceneScript>,
}

impl StoryScript {
    /// Parses a story script from its authored YAML text.
    ///
    /// # Errors
    /// [`IrError::InvalidYaml`] if the text doesn't parse; field-shaped
    /// errors if the grammar isn't honored.
    pub fn parse(yaml_text: &str) -> IrResult<Self> {
        let root: serde_yaml::Value = serde_yaml::from_str(yaml_text)?;
        let root = as_mapping(&root, "story script root")?;

        let label = get_str(root, "label")
            .ok_or_else(|| missing("label", "story script root"))?
            .to_owned();
        let metadata = yaml_to_locals(root.get(serde_yaml::Value::String("metadata".to_owned())), "story metadata")?;
        let templates = parse_template_section(root, &format!("story '{label}'"))?;
        let scenes = parse_scenes(root, &label)?;

        Ok(Self {
            label,
            metadata,
            templates,
            scenes,
        })
    }
}

fn as_mapping<'a>(value: &'a serde_yaml::Value, context: &str) -> IrResult<&'a serde_yaml::Mapping> {
    value.as_mapping().ok_or_else(|| IrError::MalformedField {
        field: "<root>".to_owned(),
        context: context.to_owned(),
        reason: "expected a mapping".to_owned(),
    })
}

fn missing(field: &str, context: &str) -> IrError {
    IrError::MissingField {
        field: field.to_owned(),
        context: context.to_owned(),
    }
}

fn parse_node_kind(s: &str) -> IrResult<NodeKind> {
    match s {
        "block" => Ok(NodeKind::Block),
        "concept" => Ok(NodeKind::Concept),
        "actor" => Ok(NodeKind::Actor),
        "location" => Ok(NodeKind::Location),
        "role" => Ok(NodeKind::Role),
        "scene" => Ok(NodeKind::Scene),
        "game" => Ok(NodeKind::Game),
        "source" => Ok(NodeKind::Source),
        "sink" => Ok(NodeKind::Sink),
        other => Err(IrError::UnknownNodeKind(other.to_owned())),
    }
}

fn parse_template_section(
    owner: &serde_yaml::Mapping,
    context: &str,
) -> IrResult<BTreeMap<String, TemplateDecl>> {
    let Some(templates_value) = owner.get(serde_yaml::Value::String("templates".to_owned())) else {
        return Ok(BTreeMap::new());
    };
    if matches!(templates_value, serde_yaml::Value::Null) {
        return Ok(BTreeMap::new());
    }
    let templates_map = as_mapping(templates_value, context)?;
    let mut out = BTreeMap::new();
    for (key, value) in templates_map {
        let key = key.as_str().ok_or_else(|| IrError::MalformedField {
            field: "templates".to_owned(),
            context: context.to_owned(),
            reason: "template keys must be strings".to_owned(),
        })?;
        let decl = parse_template_decl(key, value, context)?;
        out.insert(key.to_owned(), decl);
    }
    Ok(out)
}

fn parse_template_decl(label: &str, value: &serde_yaml::Value, context: &str) -> IrResult<TemplateDecl> {
    let map = as_mapping(value, context)?;
    let kind_str = get_str(map, "kind").unwrap_or("actor");
    let kind = parse_node_kind(kind_str)?;
    let tags = get_str_list(map, "tags", context)?;
    let locals = yaml_to_locals(map.get(serde_yaml::Value::String("locals".to_owned())), context)?;
    let content = get_str(map, "content").or_else(|| get_str(map, "text")).map(str::to_owned);
    Ok(TemplateDecl {
        label: label.to_owned(),
        kind,
        tags,
        locals,
        content,
    })
}

fn parse_scenes(root: &serde_yaml::Mapping, story_label: &str) -> IrResult<BTreeMap<String, SceneScript>> {
    let Some(scenes_value) = root.get(serde_yaml::Value::String("scenes".to_owned())) else {
        return Ok(BTreeMap::new());
    };
    let scenes_map = as_mapping(scenes_value, &format!("story '{story_label}' scenes"))?;
    let mut out = BTreeMap::new();
    for (key, value) in scenes_map {
        let key = key.as_str().ok_or_else(|| IrError::MalformedField {
            field: "scenes".to_owned(),
            context: story_label.to_owned(),
            reason: "scene keys must be strings".to_owned(),
        })?;
        let scene = parse_scene(key, value)?;
        out.insert(key.to_owned(), scene);
    }
    Ok(out)
}

fn parse_scene(key: &str, value: &serde_yaml::Value) -> IrResult<SceneScript> {
    let context = format!("scene '{key}'");
    let map = as_mapping(value, &context)?;
    let label = get_str(map, "label").unwrap_or(key).to_owned();
    let templates = parse_template_section(map, &context)?;
    let blocks = parse_blocks(map, &context)?;
    Ok(SceneScript {
        label,
        templates,
        blocks,
    })
}

fn parse_blocks(scene_map: &serde_yaml::Mapping, context: &str) -> IrResult<BTreeMap<String, BlockScript>> {
    let Some(blocks_value) = scene_map.get(serde_yaml::Value::String("blocks".to_owned())) else {
        return Ok(BTreeMap::new());
    };
    let blocks_map = as_mapping(blocks_value, context)?;
    let mut out = BTreeMap::new();
    for (key, value) in blocks_map {
        let key = key.as_str().ok_or_else(|| IrError::MalformedField {
            field: "blocks".to_owned(),
            context: context.to_owned(),
            reason: "block keys must be strings".to_owned(),
        })?;
        let block = parse_block(key, value, context)?;
        out.insert(key.to_owned(), block);
    }
    Ok(out)
}

fn parse_block(key: &str, value: &serde_yaml::Value, scene_context: &str) -> IrResult<BlockScript> {
    let context = format!("{scene_context} block '{key}'");
    let map = as_mapping(value, &context)?;
    let label = get_str(map, "label").unwrap_or(key).to_owned();
    let content = get_str(map, "content")
        .or_else(|| get_str(map, "text"))
        .unwrap_or_default()
        .to_owned();
    let actions = parse_actions(map, &context)?;
    let roles = parse_roles(map.get(serde_yaml::Value::String("roles".to_owned())), &context)?;
    let settings = parse_settings(map.get(serde_yaml::Value::String("settings".to_owned())), &context)?;
    let effects = get_str_list(map, "effects", &context)?;
    let conditions = get_str_list(map, "conditions", &context)?;
    let templates = parse_template_section(map, &context)?;
    Ok(BlockScript {
        label,
        content,
        actions,
        roles,
        settings,
        effects,
        conditions,
        templates,
    })
}

fn parse_actions(map: &serde_yaml::Mapping, context: &str) -> IrResult<Vec<ActionDecl>> {
    let key = serde_yaml::Value::String("actions".to_owned());
    let Some(actions_value) = map.get(key) else {
        return Ok(Vec::new());
    };
    if matches!(actions_value, serde_yaml::Value::Null) {
        return Ok(Vec::new());
    }
    let serde_yaml::Value::Sequence(items) = actions_value else {
        return Err(IrError::MalformedField {
            field: "actions".to_owned(),
            context: context.to_owned(),
            reason: "expected a list".to_owned(),
        });
    };
    items
        .iter()
        .map(|item| {
            let item_map = as_mapping(item, context)?;
            let text = get_str(item_map, "text")
                .ok_or_else(|| missing("text", context))?
                .to_owned();
            let successor = get_str(item_map, "successor")
                .ok_or_else(|| missing("successor", context))?
                .to_owned();
            Ok(ActionDecl { text, successor })
        })
        .collect()
}

/// A resolved reference-like declaration, shared shape for roles and
/// settings before their field names diverge.
struct RawRefDecl {
    reference: String,
    template_ref: Option<String>,
    hard: bool,
}

/// Expands the `roles:`/`settings:` shorthand forms into a uniform mapping.
///
/// Accepts, matching the original loader's `model_validate` shorthands:
/// - a sequence of plain strings: `["bob", "alice"]`, each becoming its own
///   key with `reference == key`;
/// - a sequence of one-entry mappings carrying an explicit `label`:
///   `[{label: "merchant", actor_ref: "shopkeep"}]`;
/// - a mapping whose values are `null` (reference defaults to the key),
///   a bare string (an explicit reference), or a nested mapping (full
///   declaration; `reference` defaults to the key if the mapping omits it).
fn expand_ref_shorthand(
    yaml: Option<&serde_yaml::Value>,
    ref_field: &str,
    template_field: &str,
    context: &str,
) -> IrResult<BTreeMap<String, RawRefDecl>> {
    let mut out = BTreeMap::new();
    let Some(yaml) = yaml else {
        return Ok(out);
    };
    match yaml {
        serde_yaml::Value::Null => {}
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                match item {
                    serde_yaml::Value::String(s) => {
                        out.insert(
                            s.clone(),
                            RawRefDecl {
                                reference: s.clone(),
                                template_ref: None,
                                hard: true,
                            },
                        );
                    }
                    serde_yaml::Value::Mapping(_) => {
                        let map = as_mapping(item, context)?;
                        let label = get_str(map, "label")
                            .ok_or_else(|| missing("label", context))?
                            .to_owned();
                        let decl = raw_decl_from_mapping(map, &label, ref_field, template_field);
                        out.insert(label, decl);
                    }
                    other => {
                        return Err(IrError::MalformedField {
                            field: ref_field.to_owned(),
                            context: context.to_owned(),
                            reason: format!("unsupported shorthand entry: {other:?}"),
                        })
                    }
                }
            }
        }
        serde_yaml::Value::Mapping(entries) => {
            for (key, value) in entries {
                let key = key.as_str().ok_or_else(|| IrError::MalformedField {
                    field: ref_field.to_owned(),
                    context: context.to_owned(),
                    reason: "keys must be strings".to_owned(),
                })?;
                let decl = match value {
                    serde_yaml::Value::Null => RawRefDecl {
                        reference: key.to_owned(),
                        template_ref: None,
                        hard: true,
                    },
                    serde_yaml::Value::String(s) => RawRefDecl {
                        reference: s.clone(),
                        template_ref: None,
                        hard: true,
                    },
                    serde_yaml::Value::Mapping(_) => {
                        let map = as_mapping(value, context)?;
                        let mut decl = raw_decl_from_mapping(map, key, ref_field, template_field);
                        if get_str(map, ref_field).is_none() {
                            tracing::warn!(key, context, "no explicit '{ref_field}', defaulting to the slot's own name");
                            decl.reference = key.to_owned();
                        }
                        decl
                    }
                    other => {
                        return Err(IrError::MalformedField {
                            field: ref_field.to_owned(),
                            context: context.to_owned(),
                            reason: format!("unsupported shorthand value: {other:?}"),
                        })
                    }
                };
                out.insert(key.to_owned(), decl);
            }
        }
        other => {
            return Err(IrError::MalformedField {
                field: ref_field.to_owned(),
                context: context.to_owned(),
                reason: format!("expected a list or mapping, got {other:?}"),
            })
        }
    }
    Ok(out)
}

fn raw_decl_from_mapping(map: &serde_yaml::Mapping, default_key: &str, ref_field: &str, template_field: &str) -> RawRefDecl {
    let reference = get_str(map, ref_field).unwrap_or(default_key).to_owned();
    let template_ref = get_str(map, template_field).map(str::to_owned);
    let hard = map
        .get(serde_yaml::Value::String("hard".to_owned()))
        .and_then(serde_yaml::Value::as_bool)
        .unwrap_or(true);
    RawRefDecl {
        reference,
        template_ref,
        hard,
    }
}

fn parse_roles(yaml: Option<&serde_yaml::Value>, context: &str) -> IrResult<BTreeMap<String, RoleDecl>> {
    let raw = expand_ref_shorthand(yaml, "actor_ref", "actor_template_ref", context)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            (
                k,
                RoleDecl {
                    actor_ref: v.reference,
                    actor_template_ref: v.template_ref,
                    hard: v.hard,
                },
            )
        })
        .collect())
}

fn parse_settings(yaml: Option<&serde_yaml::Value>, context: &str) -> IrResult<BTreeMap<String, SettingDecl>> {
    let raw = expand_ref_shorthand(yaml, "location_ref", "location_template_ref", context)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            (
                k,
                SettingDecl {
                    location_ref: v.reference,
                    location_template_ref: v.template_ref,
                    hard: v.hard,
                },
            )
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const VILLAGE_YAML: &str = r#"
label: test_story
metadata:
  title: Test Story
templates:
  global_guard:
    kind: actor
    locals:
      hp: 50
scenes:
  intro:
    label: intro
    roles: ["bob", "alice"]
    blocks:
      start:
        content: You wake up.
        actions:
          - text: Look around
            successor: intro.look
      look:
        content: It's a room.
        roles:
          guard:
            actor_template_ref: village_guard
"#;

    #[test]
    fn parses_top_level_label_and_metadata() {
        let script = StoryScript::parse(VILLAGE_YAML).unwrap();
        assert_eq!(script.label, "test_story");
        assert_eq!(script.metadata.get("title"), Some(&Value::Str("Test Story".into())));
    }

    #[test]
    fn global_template_locals_are_parsed() {
        let script = StoryScript::parse(VILLAGE_YAML).unwrap();
        let guard = script.templates.get("global_guard").unwrap();
        assert_eq!(guard.kind, NodeKind::Actor);
        assert_eq!(guard.locals.get("hp"), Some(&Value::Int(50)));
    }

    #[test]
    fn scene_role_list_shorthand_expands_to_self_named_refs() {
        let script = StoryScript::parse(VILLAGE_YAML).unwrap();
        let intro = &script.scenes["intro"];
        assert_eq!(intro.roles["bob"].actor_ref, "bob");
        assert_eq!(intro.roles["alice"].actor_ref, "alice");
    }

    #[test]
    fn block_role_mapping_form_carries_a_template_ref() {
        let script = StoryScript::parse(VILLAGE_YAML).unwrap();
        let look = &script.scenes["intro"].blocks["look"];
        assert_eq!(look.roles["guard"].actor_template_ref.as_deref(), Some("village_guard"));
        assert_eq!(look.roles["guard"].actor_ref, "guard");
    }

    #[test]
    fn block_actions_capture_text_and_successor() {
        let script = StoryScript::parse(VILLAGE_YAML).unwrap();
        let start = &script.scenes["intro"].blocks["start"];
        assert_eq!(start.actions.len(), 1);
        assert_eq!(start.actions[0].successor, "intro.look");
    }

    #[test]
    fn role_dict_shorthand_with_string_value_is_a_reference() {
        let yaml = r#"
label: s
scenes:
  intro:
    blocks:
      a:
        content: hi
        roles:
          merchant: shopkeep
"#;
        let script = StoryScript::parse(yaml).unwrap();
        let block = &script.scenes["intro"].blocks["a"];
        assert_eq!(block.roles["merchant"].actor_ref, "shopkeep");
    }

    #[test]
    fn role_list_mapping_entry_uses_label_as_key() {
        let yaml = r#"
label: s
scenes:
  intro:
    blocks:
      a:
        content: hi
        roles:
          - guard
          - label: merchant
            actor_ref: shopkeep
"#;
        let script = StoryScript::parse(yaml).unwrap();
        let block = &script.scenes["intro"].blocks["a"];
        assert_eq!(block.roles["guard"].actor_ref, "guard");
        assert_eq!(block.roles["merchant"].actor_ref, "shopkeep");
    }

    #[test]
    fn setting_shorthand_mirrors_role_shorthand_with_location_fields() {
        let yaml = r#"
label: s
scenes:
  intro:
    blocks:
      a:
        content: hi
        settings:
          square: null
          tavern: inn
"#;
        let script = StoryScript::parse(yaml).unwrap();
        let block = &script.scenes["intro"].blocks["a"];
        assert_eq!(block.settings["square"].location_ref, "square");
        assert_eq!(block.settings["tavern"].location_ref, "inn");
    }

    #[test]
    fn missing_label_is_a_missing_field_error() {
        let err = StoryScript::parse("metadata: {}").unwrap_err();
        assert!(matches!(err, IrError::MissingField { .. }));
    }
}
