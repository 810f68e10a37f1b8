// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! World bundles (spec.md §6): an on-disk directory of `world.yaml` plus the
//! YAML story scripts and `media/` subtree it names.
//!
//! ```text
//! my_world/
//!   world.yaml        -- manifest: {uid, label, scripts:[path], media_dir, metadata}
//!   village.yaml       -- a story script named in `scripts`
//!   media/
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use storytangl_core::Value;

use crate::error::{IrError, IrResult};
use crate::script::StoryScript;
use crate::yaml_value::{get_str, get_str_or_list, yaml_to_locals};

/// The parsed `world.yaml` manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldManifest {
    /// Filesystem-safe world identifier.
    pub uid: String,
    /// Human-readable world label.
    pub label: String,
    /// Paths to story scripts, relative to the bundle root, in load order.
    pub scripts: Vec<String>,
    /// Relative path to the `media/` subtree.
    pub media_dir: String,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, Value>,
}

/// A loaded world bundle: the manifest plus every story script it names,
/// parsed and ready to compile.
#[derive(Debug, Clone)]
pub struct WorldBundle {
    /// The bundle's own manifest.
    pub manifest: WorldManifest,
    /// The bundle's root directory on disk.
    pub root: PathBuf,
    /// Every script the manifest names, parsed, in manifest order.
    pub scripts: Vec<StoryScript>,
}

/// Checks that `uid` contains only ASCII alphanumerics, `-`, or `_` — the
/// filesystem-safety rule spec.md §6 requires of a world manifest's `uid`.
#[must_use]
pub fn is_filesystem_safe(uid: &str) -> bool {
    !uid.is_empty() && uid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl WorldManifest {
    /// Parses a `world.yaml` manifest from its authored text.
    ///
    /// # Errors
    /// [`IrError::InvalidYaml`], [`IrError::MissingField`], or
    /// [`IrError::UnsafeWorldUid`] if `uid` fails the filesystem-safety
    /// check.
    pub fn parse(yaml_text: &str) -> IrResult<Self> {
        let root: serde_yaml::Value = serde_yaml::from_str(yaml_text)?;
        let root = root.as_mapping().ok_or_else(|| IrError::MalformedField {
            field: "<root>".to_owned(),
            context: "world manifest".to_owned(),
            reason: "expected a mapping".to_owned(),
        })?;

        let uid = get_str(root, "uid")
            .ok_or_else(|| IrError::MissingField {
                field: "uid".to_owned(),
                context: "world manifest".to_owned(),
            })?
            .to_owned();
        if !is_filesystem_safe(&uid) {
            return Err(IrError::UnsafeWorldUid(uid));
        }
        let scripts = get_str_or_list(root, "scripts", "world manifest")?;
        let media_dir = get_str(root, "media_dir").unwrap_or("media").to_owned();
        let metadata = yaml_to_locals(
            root.get(serde_yaml::Value::String("metadata".to_owned())),
            "world manifest metadata",
        )?;
        // effective_label priority: explicit `label` > `metadata.title` > `uid`.
        let label = get_str(root, "label")
            .map(str::to_owned)
            .or_else(|| match metadata.get("title") {
                Some(Value::Str(title)) => Some(title.clone()),
                _ => None,
            })
            .unwrap_or_else(|| uid.clone());

        Ok(Self {
            uid,
            label,
            scripts,
            media_dir,
            metadata,
        })
    }
}

/// Loads a world bundle from a directory: reads `world.yaml`, then parses
/// the single script it names, relative to `bundle_root`.
///
/// # Errors
/// [`IrError::Io`] if `world.yaml` or the named script can't be read;
/// [`IrError::MultiScriptWorldUnsupported`] if the manifest names more than
/// one script; propagates [`IrError`] from manifest/script parsing
/// otherwise.
pub fn load_world_bundle(bundle_root: &Path) -> IrResult<WorldBundle> {
    let manifest_path = bundle_root.join("world.yaml");
    let manifest_text = read_to_string(&manifest_path)?;
    let manifest = WorldManifest::parse(&manifest_text)?;

    if manifest.scripts.len() > 1 {
        return Err(IrError::MultiScriptWorldUnsupported(
            manifest.uid.clone(),
            manifest.scripts.len(),
        ));
    }

    let scripts = manifest
        .scripts
        .iter()
        .map(|rel_path| {
            let script_path = bundle_root.join(rel_path);
            let text = read_to_string(&script_path)?;
            StoryScript::parse(&text)
        })
        .collect::<IrResult<Vec<_>>>()?;

    Ok(WorldBundle {
        manifest,
        root: bundle_root.to_path_buf(),
        scripts,
    })
}

fn read_to_string(path: &Path) -> IrResult<String> {
    std::fs::read_to_string(path).map_err(|source| IrError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_safe_uid_accepts_alnum_dash_underscore() {
        assert!(is_filesystem_safe("village-01_final"));
    }

    #[test]
    fn filesystem_safe_uid_rejects_path_separators() {
        assert!(!is_filesystem_safe("../escape"));
        assert!(!is_filesystem_safe("a/b"));
        assert!(!is_filesystem_safe(""));
    }

    #[test]
    fn parses_a_minimal_manifest() {
        let yaml = r#"
uid: village_01
label: The Village
scripts:
  - village.yaml
media_dir: assets
metadata:
  author: tester
"#;
        let manifest = WorldManifest::parse(yaml).unwrap();
        assert_eq!(manifest.uid, "village_01");
        assert_eq!(manifest.scripts, vec!["village.yaml".to_owned()]);
        assert_eq!(manifest.media_dir, "assets");
    }

    #[test]
    fn unsafe_uid_is_rejected_before_touching_the_filesystem() {
        let yaml = "uid: \"../escape\"\nscripts: []\n";
        let err = WorldManifest::parse(yaml).unwrap_err();
        assert!(matches!(err, IrError::UnsafeWorldUid(_)));
    }

    #[test]
    fn missing_scripts_defaults_to_an_empty_list() {
        let yaml = "uid: empty_world\n";
        let manifest = WorldManifest::parse(yaml).unwrap();
        assert!(manifest.scripts.is_empty());
        assert_eq!(manifest.media_dir, "media");
    }

    #[test]
    fn scalar_scripts_field_normalizes_to_a_single_element_list() {
        let yaml = "uid: world1\nscripts: story.yaml\n";
        let manifest = WorldManifest::parse(yaml).unwrap();
        assert_eq!(manifest.scripts, vec!["story.yaml".to_owned()]);
    }

    #[test]
    fn effective_label_falls_back_to_metadata_title_then_uid() {
        let yaml = "uid: test_world\nmetadata:\n  title: Metadata Title\n";
        let manifest = WorldManifest::parse(yaml).unwrap();
        assert_eq!(manifest.label, "Metadata Title");

        let yaml = "uid: test_world\n";
        let manifest = WorldManifest::parse(yaml).unwrap();
        assert_eq!(manifest.label, "test_world");
    }

    #[test]
    fn loading_a_multi_script_bundle_is_rejected() {
        let dir = std::env::temp_dir().join(format!("storytangl-ir-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("world.yaml"), "uid: multi\nscripts: [a.yaml, b.yaml]\n").unwrap();
        let err = load_world_bundle(&dir).unwrap_err();
        assert!(matches!(err, IrError::MultiScriptWorldUnsupported(_, 2)));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
