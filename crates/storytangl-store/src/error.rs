// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Errors a persistence backend can surface.
//!
//! These mirror the `VersionConflict` and I/O-adjacent failure kinds named
//! in the persistence contract; nothing backend-specific (no `sled::Error`,
//! no raw `io::Error`) crosses this boundary uncategorized.

use thiserror::Error;

/// Failures a [`crate::PatchLog`] or [`crate::SnapshotStore`] implementation
/// can return.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `append_patch` was called with an `expected_version` that no longer
    /// matches the log's current version for this graph.
    #[error("version conflict: expected base {expected}, log is at {actual}")]
    VersionConflict {
        /// The version the caller believed was current.
        expected: u64,
        /// The log's actual current version.
        actual: u64,
    },

    /// No patch log or snapshot exists for the requested graph id.
    #[error("no record for graph {0}")]
    NotFound(String),

    /// The backend is unavailable (disk, connection, lock poisoning).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A byte payload could not be read back (corrupt backend record).
    #[error("corrupt record for graph {graph_id}: {reason}")]
    Corrupt {
        /// The graph id whose record is corrupt.
        graph_id: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// This crate's result alias.
pub type StoreResult<T> = Result<T, StoreError>;
