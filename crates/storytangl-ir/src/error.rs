// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Errors raised while parsing or compiling author-facing IR.
//!
//! These never leave this crate's boundary disguised as [`storytangl_core`]
//! errors — a script-grammar mistake is a data error (spec exit code 65),
//! not an engine error, so callers can tell the two apart.

use thiserror::Error;

/// Everything that can go wrong turning a world bundle into a playable
/// story graph.
#[derive(Debug, Error)]
pub enum IrError {
    /// The YAML text did not parse at all.
    #[error("invalid yaml: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    /// A required field was missing from a script/manifest node.
    #[error("missing field `{field}` in {context}")]
    MissingField {
        /// The absent field's name.
        field: String,
        /// Where it was expected (e.g. `"scene 'village'"`).
        context: String,
    },

    /// A field held a value of the wrong shape (e.g. a mapping where a
    /// scalar was expected).
    #[error("malformed field `{field}` in {context}: {reason}")]
    MalformedField {
        /// The offending field's name.
        field: String,
        /// Where it was found.
        context: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A `world.yaml` manifest's `uid` contained characters other than
    /// alphanumerics, `-`, or `_`.
    #[error("world uid '{0}' is not filesystem-safe")]
    UnsafeWorldUid(String),

    /// An action's `successor` (or a role/setting's template reference)
    /// named a block, scene, or template this script never declares.
    #[error("unresolved reference '{reference}' in {context}")]
    UnresolvedReference {
        /// The reference text as authored.
        reference: String,
        /// Where it was authored (e.g. `"scene 'village' block 'intro'"`).
        context: String,
    },

    /// An `obj_cls`/`kind` tag named a node kind this engine does not model.
    #[error("unknown node kind '{0}'")]
    UnknownNodeKind(String),

    /// A world manifest named more than one script. Multi-file scripts
    /// aren't supported yet — compile a manifest down to a single
    /// `scripts` entry.
    #[error("world '{0}' declares {1} scripts; multi-file worlds are not yet supported")]
    MultiScriptWorldUnsupported(String, usize),

    /// Reading a world bundle file from disk failed.
    #[error("io error reading '{path}': {source}")]
    Io {
        /// The path that could not be read.
        path: String,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// This crate's result alias.
pub type IrResult<T> = Result<T, IrError>;
