// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Compiling the same story script twice must yield graphs with identical
//! *shape* — same labels, same edge topology, same predicates/effects —
//! regardless of the author-chosen metadata values. Node/edge ids are
//! freshly allocated per compile (as they are per commit), so the
//! comparison is over content rather than raw uids, the same determinism
//! discipline `warp-core`'s `proptest` suite holds the patch/
//! canonicalization pipeline to.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use storytangl_core::EdgeKind;
use storytangl_ir::{compile_story, StoryScript};

/// A content fingerprint of a compiled graph, independent of its
/// (randomly allocated) node/edge ids.
fn fingerprint(compiled: &storytangl_ir::CompiledStory) -> (Vec<String>, Vec<(String, Option<String>, Vec<String>)>) {
    let mut labels: Vec<String> = compiled.graph.iter_nodes().map(|n| n.label.clone()).collect();
    labels.sort();

    let mut edges: Vec<(String, Option<String>, Vec<String>)> = compiled
        .graph
        .iter_edges()
        .filter(|e| e.kind == EdgeKind::Choice)
        .map(|e| (e.label.clone(), e.predicate.clone(), e.effects.clone()))
        .collect();
    edges.sort();

    (labels, edges)
}

fn story_yaml(title: &str, hp: i64) -> String {
    format!(
        r#"
label: village
metadata:
  title: "{title}"
scenes:
  intro:
    blocks:
      start:
        content: You arrive.
        actions:
          - text: Enter
            successor: hall
      hall:
        content: A grand hall.
        roles:
          guard: null
templates:
  bystander:
    kind: actor
    locals:
      hp: {hp}
"#
    )
}

proptest! {
    #[test]
    fn compiling_the_same_script_twice_produces_the_same_graph_digest(
        title in "[a-zA-Z ]{1,24}",
        hp in 1_i64..999,
    ) {
        let yaml = story_yaml(&title, hp);
        let script = StoryScript::parse(&yaml).unwrap();

        let first = compile_story(&script).unwrap();
        let second = compile_story(&script).unwrap();

        prop_assert_eq!(fingerprint(&first), fingerprint(&second));
    }
}
