// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Maps every failure this CLI can observe onto spec.md §6's exit codes and
//! §7's structured error envelope, so a scripted caller never has to parse
//! human-readable text to know what went wrong.

use serde::Serialize;
use storytangl_core::StError;
use storytangl_ir::IrError;
use storytangl_store::StoreError;

/// Exit code for a usage error (bad arguments, unknown operation).
pub const EXIT_USAGE: i32 = 64;
/// Exit code for a data error (bad world bundle or story script).
pub const EXIT_DATA: i32 = 65;
/// Exit code for a persistence backend failure.
pub const EXIT_UNAVAILABLE: i32 = 69;
/// Exit code for every other failure (VM/engine errors, internal bugs).
pub const EXIT_INTERNAL: i32 = 70;

/// Every failure a subcommand can return, already carrying its exit code.
#[derive(Debug)]
pub enum CliError {
    /// A subcommand was given arguments it could not act on.
    Usage(String),
    /// The world bundle or story script was malformed.
    Data(IrError),
    /// The persistence backend is unavailable or reported a version
    /// conflict.
    Store(StoreError),
    /// The engine itself raised an [`StError`] while advancing a tick.
    Engine(StError),
    /// Serialization/deserialization of CLI-owned snapshot bytes failed.
    Codec(String),
    /// Filesystem I/O outside the store/IR boundary (e.g. reading config).
    Io(std::io::Error),
}

impl CliError {
    /// The process exit code this error maps to, per spec.md §6.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => EXIT_USAGE,
            Self::Data(_) => EXIT_DATA,
            Self::Store(_) => EXIT_UNAVAILABLE,
            Self::Engine(_) | Self::Codec(_) | Self::Io(_) => EXIT_INTERNAL,
        }
    }

    /// The structured `{kind, message, context}` envelope spec.md §7
    /// requires at the API boundary; never a stack trace.
    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        match self {
            Self::Usage(message) => ErrorEnvelope::new("UsageError", message.clone()),
            Self::Data(err) => ErrorEnvelope::new("DataError", err.to_string()),
            Self::Store(err) => ErrorEnvelope::new("StoreError", err.to_string()),
            Self::Engine(err) => {
                let (kind, message, context) = err.envelope();
                ErrorEnvelope {
                    kind: kind.to_owned(),
                    message,
                    uid: context.uid,
                    label: context.label,
                    phase: context.phase,
                }
            }
            Self::Codec(message) => ErrorEnvelope::new("CodecError", message.clone()),
            Self::Io(err) => ErrorEnvelope::new("IoError", err.to_string()),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.envelope().message)
    }
}

impl std::error::Error for CliError {}

impl From<IrError> for CliError {
    fn from(err: IrError) -> Self {
        Self::Data(err)
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<StError> for CliError {
    fn from(err: StError) -> Self {
        Self::Engine(err)
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// The JSON-serializable form of spec.md §7's error envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// The error kind name, matching spec.md §7's enumerated kinds where
    /// applicable.
    pub kind: String,
    /// A human-readable message; never a stack trace.
    pub message: String,
    /// The entity uid involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// The label involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// The phase the error occurred in, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl ErrorEnvelope {
    fn new(kind: &'static str, message: String) -> Self {
        Self {
            kind: kind.to_owned(),
            message,
            uid: None,
            label: None,
            phase: None,
        }
    }
}
