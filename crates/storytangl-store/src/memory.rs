// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! An in-process, `BTreeMap`-backed reference implementation of the
//! persistence contract. Used by the test suite and as `storytangl-cli`'s
//! default backend when no on-disk store is configured.

use std::collections::BTreeMap;
use std::sync::RwLock;

use storytangl_core::GraphId;

use crate::error::{StoreError, StoreResult};
use crate::{PatchLog, SnapshotStore, StoredPatch};

#[derive(Debug, Default)]
struct Ledger {
    patches: Vec<StoredPatch>,
    last_append: Option<(String, u64)>,
    snapshot: Option<(u64, Vec<u8>)>,
}

/// In-memory reference store: every graph's patch log and latest snapshot
/// live in a `BTreeMap` guarded by a single `RwLock`. Nothing is persisted
/// across process restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledgers: RwLock<BTreeMap<GraphId, Ledger>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_ledger<T>(&self, graph_id: GraphId, f: impl FnOnce(&Ledger) -> T) -> StoreResult<T> {
        let ledgers = self
            .ledgers
            .read()
            .map_err(|_| StoreError::Unavailable("ledger lock poisoned".to_owned()))?;
        Ok(match ledgers.get(&graph_id) {
            Some(ledger) => f(ledger),
            None => f(&Ledger::default()),
        })
    }
}

impl PatchLog for MemoryStore {
    fn append_patch(
        &self,
        graph_id: GraphId,
        expected_version: u64,
        bytes: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> StoreResult<u64> {
        let mut ledgers = self
            .ledgers
            .write()
            .map_err(|_| StoreError::Unavailable("ledger lock poisoned".to_owned()))?;
        let ledger = ledgers.entry(graph_id).or_default();

        if let (Some(key), Some((last_key, last_version))) = (idempotency_key, &ledger.last_append) {
            if key == last_key {
                return Ok(*last_version);
            }
        }

        let current = ledger.patches.len() as u64;
        if current != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: current,
            });
        }

        let new_version = current + 1;
        ledger.patches.push(StoredPatch {
            version: new_version,
            bytes,
        });
        ledger.last_append = idempotency_key.map(|k| (k.to_owned(), new_version));
        Ok(new_version)
    }

    fn current_version(&self, graph_id: GraphId) -> StoreResult<u64> {
        self.with_ledger(graph_id, |ledger| ledger.patches.len() as u64)
    }

    fn load_patches_since(&self, graph_id: GraphId, since_version: u64) -> StoreResult<Vec<StoredPatch>> {
        self.with_ledger(graph_id, |ledger| {
            ledger
                .patches
                .iter()
                .filter(|p| p.version > since_version)
                .cloned()
                .collect()
        })
    }
}

impl SnapshotStore for MemoryStore {
    fn load_latest_snapshot(&self, graph_id: GraphId) -> StoreResult<Option<(u64, Vec<u8>)>> {
        self.with_ledger(graph_id, |ledger| ledger.snapshot.clone())
    }

    fn save_snapshot(&self, graph_id: GraphId, version: u64, bytes: Vec<u8>) -> StoreResult<()> {
        let mut ledgers = self
            .ledgers
            .write()
            .map_err(|_| StoreError::Unavailable("ledger lock poisoned".to_owned()))?;
        let ledger = ledgers.entry(graph_id).or_default();
        let supersedes = ledger.snapshot.as_ref().is_none_or(|(v, _)| version >= *v);
        if supersedes {
            ledger.snapshot = Some((version, bytes));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn appends_advance_the_version_by_one() {
        let store = MemoryStore::new();
        let graph_id = GraphId::new();
        assert_eq!(store.current_version(graph_id).unwrap(), 0);
        let v1 = store.append_patch(graph_id, 0, vec![1], None).unwrap();
        assert_eq!(v1, 1);
        let v2 = store.append_patch(graph_id, 1, vec![2], None).unwrap();
        assert_eq!(v2, 2);
    }

    #[test]
    fn stale_expected_version_is_a_conflict() {
        let store = MemoryStore::new();
        let graph_id = GraphId::new();
        store.append_patch(graph_id, 0, vec![1], None).unwrap();
        let err = store.append_patch(graph_id, 0, vec![2], None).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[test]
    fn repeating_an_idempotency_key_returns_the_prior_outcome_without_reappending() {
        let store = MemoryStore::new();
        let graph_id = GraphId::new();
        let v1 = store.append_patch(graph_id, 0, vec![1], Some("req-1")).unwrap();
        let v1_retry = store.append_patch(graph_id, 0, vec![1], Some("req-1")).unwrap();
        assert_eq!(v1, v1_retry);
        assert_eq!(store.current_version(graph_id).unwrap(), 1);
    }

    #[test]
    fn a_different_idempotency_key_is_a_fresh_append() {
        let store = MemoryStore::new();
        let graph_id = GraphId::new();
        store.append_patch(graph_id, 0, vec![1], Some("req-1")).unwrap();
        let v2 = store.append_patch(graph_id, 1, vec![2], Some("req-2")).unwrap();
        assert_eq!(v2, 2);
    }

    #[test]
    fn load_patches_since_returns_only_the_later_ones_in_order() {
        let store = MemoryStore::new();
        let graph_id = GraphId::new();
        store.append_patch(graph_id, 0, vec![1], None).unwrap();
        store.append_patch(graph_id, 1, vec![2], None).unwrap();
        store.append_patch(graph_id, 2, vec![3], None).unwrap();

        let since = store.load_patches_since(graph_id, 1).unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].version, 2);
        assert_eq!(since[1].version, 3);
    }

    #[test]
    fn snapshots_round_trip_and_never_regress() {
        let store = MemoryStore::new();
        let graph_id = GraphId::new();
        assert!(store.load_latest_snapshot(graph_id).unwrap().is_none());

        store.save_snapshot(graph_id, 5, vec![9, 9]).unwrap();
        store.save_snapshot(graph_id, 2, vec![1, 1]).unwrap();

        let (version, bytes) = store.load_latest_snapshot(graph_id).unwrap().unwrap();
        assert_eq!(version, 5);
        assert_eq!(bytes, vec![9, 9]);
    }

    #[test]
    fn an_unknown_graph_reads_as_empty_rather_than_erroring() {
        let store = MemoryStore::new();
        let graph_id = GraphId::new();
        assert_eq!(store.current_version(graph_id).unwrap(), 0);
        assert!(store.load_patches_since(graph_id, 0).unwrap().is_empty());
    }
}
