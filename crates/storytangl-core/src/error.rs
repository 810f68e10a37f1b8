// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! The unified error envelope surfaced to every caller of this crate.
//!
//! Every fallible operation in `storytangl-core` returns [`StError`]. None of
//! its variants leak implementation types (no `std::io::Error`, no serializer
//! internals) — callers at the API boundary are expected to serialize this
//! directly into the structured envelope described by the execution API.

use thiserror::Error;

use crate::ident::{EdgeId, NodeId, RequirementId};

/// Extra context attached to an [`StError`] for the structured error envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// The entity uid involved, if any.
    pub uid: Option<String>,
    /// The label involved, if any.
    pub label: Option<String>,
    /// The phase the error occurred in, if any.
    pub phase: Option<String>,
}

impl ErrorContext {
    /// An empty context.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// A context naming a uid.
    #[must_use]
    pub fn uid(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            ..Self::default()
        }
    }

    /// A context naming a label.
    #[must_use]
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    /// Attaches a phase name to this context, replacing any existing one.
    #[must_use]
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

/// The complete set of error kinds a caller of this engine may observe.
///
/// Names and semantics follow the error kinds enumerated in the execution
/// API's error handling section exactly; no implementation-language error
/// type is ever surfaced past this boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StError {
    /// Missing uid/label/path.
    #[error("not found: {what}")]
    NotFound {
        /// What was being looked up.
        what: String,
        /// Extra context.
        context: ErrorContext,
    },

    /// Duplicate match where a unique result was required.
    #[error("ambiguous: {what}")]
    Ambiguous {
        /// What was ambiguous.
        what: String,
        /// Extra context.
        context: ErrorContext,
    },

    /// An edge had a missing endpoint at commit time.
    #[error("dangling endpoint on edge {edge}")]
    DanglingEndpoint {
        /// The offending edge.
        edge: EdgeId,
    },

    /// No forward progress is possible from the cursor under satisfied edges.
    #[error("softlock: no forward progress from cursor {cursor}")]
    Softlock {
        /// The cursor that cannot progress.
        cursor: NodeId,
    },

    /// A commit was attempted against a stale base version.
    #[error("version conflict: expected base {expected}, graph is at {actual}")]
    VersionConflict {
        /// The version the patch was based on.
        expected: u64,
        /// The graph's actual current version.
        actual: u64,
    },

    /// A hard requirement could not be provisioned.
    #[error("unresolvable hard requirement {requirement}")]
    UnresolvableHard {
        /// The requirement that could not be resolved.
        requirement: RequirementId,
    },

    /// The expression parser rejected an unsafe construct.
    #[error("unsafe expression: {reason}")]
    UnsafeExpression {
        /// Why the expression was rejected.
        reason: String,
    },

    /// A template reference failed scope resolution.
    #[error("no template in scope for reference {reference}")]
    NoTemplateInScope {
        /// The reference that failed to resolve.
        reference: String,
    },

    /// Subroutine recursion exceeded the configured maximum depth.
    #[error("call depth exceeded (max {max})")]
    CallDepthExceeded {
        /// The configured maximum depth.
        max: u32,
    },

    /// A strict-cache caller observed a cache miss.
    #[error("cache miss for {what}")]
    CacheMiss {
        /// What was missing from the cache.
        what: String,
    },

    /// The requested operation is not recognized by the execution API.
    #[error("unknown operation: {operation}")]
    UnknownOperation {
        /// The unrecognized operation name.
        operation: String,
    },
}

impl StError {
    /// Builds a [`NotFound`](StError::NotFound) error.
    #[must_use]
    pub fn not_found(what: impl Into<String>, context: ErrorContext) -> Self {
        Self::NotFound {
            what: what.into(),
            context,
        }
    }

    /// Builds an [`Ambiguous`](StError::Ambiguous) error.
    #[must_use]
    pub fn ambiguous(what: impl Into<String>, context: ErrorContext) -> Self {
        Self::Ambiguous {
            what: what.into(),
            context,
        }
    }

    /// The structured `{kind, message, context}` envelope named in the
    /// external interfaces section: callers serialize this, never a stack
    /// trace, at the API boundary.
    #[must_use]
    pub fn envelope(&self) -> (&'static str, String, ErrorContext) {
        let kind = match self {
            Self::NotFound { .. } => "NotFound",
            Self::Ambiguous { .. } => "Ambiguous",
            Self::DanglingEndpoint { .. } => "DanglingEndpoint",
            Self::Softlock { .. } => "Softlock",
            Self::VersionConflict { .. } => "VersionConflict",
            Self::UnresolvableHard { .. } => "UnresolvableHard",
            Self::UnsafeExpression { .. } => "UnsafeExpression",
            Self::NoTemplateInScope { .. } => "NoTemplateInScope",
            Self::CallDepthExceeded { .. } => "CallDepthExceeded",
            Self::CacheMiss { .. } => "CacheMiss",
            Self::UnknownOperation { .. } => "UnknownOperation",
        };
        let context = match self {
            Self::NotFound { context, .. } | Self::Ambiguous { context, .. } => context.clone(),
            Self::DanglingEndpoint { edge } => ErrorContext::uid(edge.to_string()),
            Self::Softlock { cursor } => ErrorContext::uid(cursor.to_string()),
            Self::UnresolvableHard { requirement } => ErrorContext::uid(requirement.to_string()),
            _ => ErrorContext::none(),
        };
        (kind, self.to_string(), context)
    }
}

/// This crate's result alias.
pub type StResult<T> = Result<T, StError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_kind_and_message() {
        let err = StError::not_found("room", ErrorContext::label("room"));
        let (kind, message, context) = err.envelope();
        assert_eq!(kind, "NotFound");
        assert!(message.contains("room"));
        assert_eq!(context.label.as_deref(), Some("room"));
    }

    #[test]
    fn version_conflict_reports_both_versions() {
        let err = StError::VersionConflict {
            expected: 3,
            actual: 4,
        };
        assert!(err.to_string().contains('3'));
        assert!(err.to_string().contains('4'));
    }
}
