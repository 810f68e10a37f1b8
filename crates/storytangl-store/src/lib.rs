// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! storytangl-store: the persistence contract a story graph's patch log and
//! snapshots are read from and written through.
//!
//! Patches and snapshots are opaque bytes to this crate — canonicalizing a
//! tick into a [`storytangl_core::Patch`] and serializing it is the caller's
//! job (`storytangl-cli` does this with `ciborium`, matching
//! `storytangl-core`'s own wire encoding). This crate only guarantees the
//! append-only, version-checked, idempotent-retry contract around those
//! bytes: [`PatchLog`] is the event log, [`SnapshotStore`] is the
//! point-in-time compaction of it.
//!
//! [`MemoryStore`] is the in-process reference implementation, used by tests
//! and as the CLI's default backend. [`SledStore`] (behind the `sled`
//! feature) persists the same contract to an embedded on-disk database.

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

/// Error kinds a backend can return.
pub mod error;
/// The in-process reference backend.
pub mod memory;
/// The `sled`-backed on-disk backend (feature `sled`).
#[cfg(feature = "sled")]
pub mod sled_store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
#[cfg(feature = "sled")]
pub use sled_store::SledStore;

use storytangl_core::GraphId;

/// One committed entry in a graph's patch log: the version it produced and
/// the opaque patch bytes that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPatch {
    /// The version the log reached after this patch was applied (i.e. the
    /// patch's `base_version + 1`).
    pub version: u64,
    /// The opaque, caller-serialized patch bytes.
    pub bytes: Vec<u8>,
}

/// The append-only event log of a story graph's committed ticks.
///
/// Implementations serialize concurrent appends to the same `graph_id`:
/// exactly one of two racing callers with the same `expected_version`
/// succeeds; the other observes [`StoreError::VersionConflict`].
pub trait PatchLog: Send + Sync {
    /// Appends a patch, advancing the log from `expected_version` to
    /// `expected_version + 1`.
    ///
    /// If `idempotency_key` matches the key of the immediately preceding
    /// append for this `graph_id`, the append is *not* re-applied — the
    /// version that append already produced is returned, letting a caller
    /// retry a timed-out request safely.
    ///
    /// # Errors
    /// [`StoreError::VersionConflict`] if `expected_version` does not match
    /// the log's current version for `graph_id`.
    fn append_patch(
        &self,
        graph_id: GraphId,
        expected_version: u64,
        bytes: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> StoreResult<u64>;

    /// The log's current version for `graph_id` (`0` if nothing has been
    /// appended yet — a fresh graph starts at version 0, matching
    /// `Graph::default`).
    ///
    /// # Errors
    /// Backend-specific I/O failures surface as [`StoreError::Unavailable`].
    fn current_version(&self, graph_id: GraphId) -> StoreResult<u64>;

    /// Every patch appended after `since_version`, in ascending version
    /// order — the sequence a caller replays on top of a snapshot to
    /// reconstruct the graph at the log's current version.
    ///
    /// # Errors
    /// Backend-specific I/O failures surface as [`StoreError::Unavailable`].
    fn load_patches_since(&self, graph_id: GraphId, since_version: u64) -> StoreResult<Vec<StoredPatch>>;
}

/// Point-in-time compactions of a graph's patch log, so replay doesn't have
/// to start from tick zero.
pub trait SnapshotStore: Send + Sync {
    /// The most recent snapshot recorded for `graph_id`, if any: the version
    /// it was taken at, and the opaque serialized graph bytes.
    ///
    /// # Errors
    /// Backend-specific I/O failures surface as [`StoreError::Unavailable`].
    fn load_latest_snapshot(&self, graph_id: GraphId) -> StoreResult<Option<(u64, Vec<u8>)>>;

    /// Records a snapshot at `version`, replacing any earlier one for this
    /// `graph_id`. Out-of-order saves (an older `version` arriving after a
    /// newer one) are accepted but discarded — the latest-by-version wins.
    ///
    /// # Errors
    /// Backend-specific I/O failures surface as [`StoreError::Unavailable`].
    fn save_snapshot(&self, graph_id: GraphId, version: u64, bytes: Vec<u8>) -> StoreResult<()>;
}
