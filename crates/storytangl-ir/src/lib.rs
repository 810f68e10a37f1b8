// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! storytangl-ir: the author-facing YAML story-script grammar and world
//! bundle, compiled down to a [`storytangl_core::graph::Graph`].
//!
//! A world bundle ([`world::WorldBundle`]) is a directory holding a
//! `world.yaml` manifest and the story scripts it names. A story script
//! ([`script::StoryScript`]) parses into scenes of content-bearing blocks;
//! [`compile::compile_story`] turns that IR into a runnable graph, template
//! registry, and initial cursor, ready to hand to
//! [`storytangl_core::vm::Engine::resume`].

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::module_name_repetitions,
    clippy::missing_const_for_fn
)]

/// Turning parsed IR into a runnable [`storytangl_core::graph::Graph`].
pub mod compile;
/// Parsing/compilation errors.
pub mod error;
/// The YAML story-script grammar.
pub mod script;
/// World bundles: `world.yaml` manifests plus the scripts they name.
pub mod world;
/// Conversion between raw YAML and the engine's [`storytangl_core::Value`].
mod yaml_value;

pub use compile::{compile_story, CompiledStory};
pub use error::{IrError, IrResult};
pub use script::{ActionDecl, BlockScript, RoleDecl, SceneScript, SettingDecl, StoryScript, TemplateDecl};
pub use world::{is_filesystem_safe, load_world_bundle, WorldBundle, WorldManifest};
