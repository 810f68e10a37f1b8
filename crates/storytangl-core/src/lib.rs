// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! storytangl-core: a typed, deterministic interactive-narrative engine.
//!
//! A world is compiled into a [`graph::Graph`] — a story graph of typed
//! [`entity::Node`]s and [`entity::Edge`]s — and advanced one tick at a time
//! by [`vm::Engine::step`]. Every tick runs through a fixed phase sequence
//! (INIT, PLANNING, PREREQS, EFFECTS, JOURNAL, BOOKKEEPING, POSTREQS)
//! against an [`effect::EffectBuffer`] staged in a [`context::Context`],
//! then commits as one canonical [`patch::Patch`] via [`patch::apply_to_graph`].
//! Given the same graph, the same player choice, and the same `rng_seed`,
//! a tick always produces the same patch — the determinism property this
//! crate is built around.

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
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

/// Layered, priority-ordered handler dispatch.
pub mod dispatch;
/// Per-tick execution state: cursor, call stack, namespace resolution.
pub mod context;
/// Tick-local effect accumulation and deterministic id allocation.
pub mod effect;
/// Typed entities: `Node`, `Edge`, `Requirement`.
pub mod entity;
/// The unified error envelope.
pub mod error;
/// The restricted predicate/effect expression DSL.
pub mod expr;
/// The indexed story graph.
pub mod graph;
/// Opaque identifier types.
pub mod ident;
/// The journal & content-composition pipeline.
pub mod journal;
/// Canonical patches: coalescing, ordering, and digesting a tick's effects.
pub mod patch;
/// Requirement provisioning, run during the PLANNING phase.
pub mod provisioning;
/// Canonical graph-content digesting.
pub mod snapshot;
/// Author-declared templates, resolved by scope precedence.
pub mod template;
/// The dynamically typed value carried through locals, criteria, and
/// expression evaluation.
pub mod value;
/// The phase engine: the tick loop that drives a story graph forward.
pub mod vm;

pub use context::{Context, StackFrame};
pub use dispatch::{
    aggregate, dispatch, scoped_dispatch, AggregationStrategy, DispatchTables, Handler,
    HandlerOutcome, HandlerRegistry, Layer, Receipt, Selector,
};
pub use effect::{Effect, EffectBuffer, EntityUid};
pub use entity::{
    Edge, JumpKind, Node, NodeKind, EdgeKind, Requirement, RequirementPolicy, TriggerPhase,
};
pub use error::{ErrorContext, StError, StResult};
pub use expr::{CompiledExpr, ExprCache, PronounFilter};
pub use graph::{EntityFilter, FoundEntities, Graph, GraphHook, MediaRegistry};
pub use ident::{Digest, EdgeId, GraphId, NodeId, RequirementId, TickId};
pub use journal::{ContentFormat, Fragment, FragmentKind, MAX_CONCEPT_DEPTH};
pub use patch::{apply_to_graph, canonicalize, diff_graph, Patch, PatchApplyError};
pub use provisioning::{
    standard_provisioners, BuildReceipt, OfferCost, OfferSource, ProvisionOffer, Provisioner,
};
pub use template::{ScopeSelector, Template, TemplateRegistry};
pub use value::Value;
pub use vm::{Engine, PlaythroughState, TickOutcome, TickReport};
