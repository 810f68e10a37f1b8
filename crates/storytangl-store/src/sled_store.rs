// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! A `sled`-backed implementation of the persistence contract, for callers
//! that want the patch log and snapshots to survive a process restart.
//!
//! Keys are laid out so both trees sort lexicographically in append order:
//! patches under `<graph-uuid>/patches/<version as 8-byte big-endian>`, with
//! the idempotency key (if any) for the *last* append of a graph tracked in
//! a separate tiny tree so a retry never has to scan the patch tree.
//! Snapshots live one-per-graph under `<graph-uuid>` in their own tree.

use storytangl_core::GraphId;

use crate::error::{StoreError, StoreResult};
use crate::{PatchLog, SnapshotStore, StoredPatch};

const PATCHES_TREE: &str = "storytangl_patches";
const SNAPSHOTS_TREE: &str = "storytangl_snapshots";
const IDEMPOTENCY_TREE: &str = "storytangl_idempotency";

/// An on-disk patch log and snapshot store backed by a `sled::Db`.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Opens (creating if absent) a `sled` database at `path`.
    ///
    /// # Errors
    /// [`StoreError::Unavailable`] if the database can't be opened (locked
    /// by another process, disk I/O failure, corrupt file).
    pub fn open(path: impl AsRef<std::path::Path>) -> StoreResult<Self> {
        let db = sled::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { db })
    }

    fn patch_key(graph_id: GraphId, version: u64) -> Vec<u8> {
        let mut key = graph_id.as_uuid().as_bytes().to_vec();
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn graph_prefix(graph_id: GraphId) -> [u8; 16] {
        *graph_id.as_uuid().as_bytes()
    }

    fn tree(&self, name: &str) -> StoreResult<sled::Tree> {
        self.db.open_tree(name).map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl PatchLog for SledStore {
    fn append_patch(
        &self,
        graph_id: GraphId,
        expected_version: u64,
        bytes: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> StoreResult<u64> {
        let idempotency = self.tree(IDEMPOTENCY_TREE)?;
        let idem_key_bytes = graph_id.as_uuid().as_bytes().to_vec();

        if let Some(key) = idempotency_key {
            if let Some(stored) = idempotency
                .get(&idem_key_bytes)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
            {
                if let Some((last_key, last_version)) = decode_idempotency(&stored, graph_id)? {
                    if last_key == key {
                        return Ok(last_version);
                    }
                }
            }
        }

        let current = self.current_version(graph_id)?;
        if current != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: current,
            });
        }

        let new_version = current + 1;
        let patches = self.tree(PATCHES_TREE)?;
        patches
            .insert(Self::patch_key(graph_id, new_version), bytes)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(key) = idempotency_key {
            let record = encode_idempotency(key, new_version);
            idempotency
                .insert(idem_key_bytes, record)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        self.db.flush().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(new_version)
    }

    fn current_version(&self, graph_id: GraphId) -> StoreResult<u64> {
        let patches = self.tree(PATCHES_TREE)?;
        let prefix = Self::graph_prefix(graph_id);
        let last = patches
            .scan_prefix(prefix)
            .last()
            .transpose()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(match last {
            Some((key, _)) => version_from_key(&key, graph_id)?,
            None => 0,
        })
    }

    fn load_patches_since(&self, graph_id: GraphId, since_version: u64) -> StoreResult<Vec<StoredPatch>> {
        let patches = self.tree(PATCHES_TREE)?;
        let prefix = Self::graph_prefix(graph_id);
        let mut out = Vec::new();
        for entry in patches.scan_prefix(prefix) {
            let (key, value) = entry.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let version = version_from_key(&key, graph_id)?;
            if version > since_version {
                out.push(StoredPatch {
                    version,
                    bytes: value.to_vec(),
                });
            }
        }
        Ok(out)
    }
}

impl SnapshotStore for SledStore {
    fn load_latest_snapshot(&self, graph_id: GraphId) -> StoreResult<Option<(u64, Vec<u8>)>> {
        let snapshots = self.tree(SNAPSHOTS_TREE)?;
        let key = graph_id.as_uuid().as_bytes();
        let Some(stored) = snapshots.get(key).map_err(|e| StoreError::Unavailable(e.to_string()))? else {
            return Ok(None);
        };
        decode_snapshot(&stored, graph_id).map(Some)
    }

    fn save_snapshot(&self, graph_id: GraphId, version: u64, bytes: Vec<u8>) -> StoreResult<()> {
        let snapshots = self.tree(SNAPSHOTS_TREE)?;
        let key = graph_id.as_uuid().as_bytes();

        let existing = snapshots.get(key).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if let Some(stored) = existing {
            let (existing_version, _) = decode_snapshot(&stored, graph_id)?;
            if existing_version > version {
                return Ok(());
            }
        }

        let mut record = version.to_be_bytes().to_vec();
        record.extend_from_slice(&bytes);
        snapshots
            .insert(key, record)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.db.flush().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

fn version_from_key(key: &[u8], graph_id: GraphId) -> StoreResult<u64> {
    let tail = key.get(16..).ok_or_else(|| StoreError::Corrupt {
        graph_id: graph_id.to_string(),
        reason: "patch key shorter than graph-uuid prefix".to_owned(),
    })?;
    let bytes: [u8; 8] = tail.try_into().map_err(|_| StoreError::Corrupt {
        graph_id: graph_id.to_string(),
        reason: "patch key version suffix is not 8 bytes".to_owned(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode_idempotency(key: &str, version: u64) -> Vec<u8> {
    let mut record = version.to_be_bytes().to_vec();
    record.extend_from_slice(key.as_bytes());
    record
}

fn decode_idempotency(record: &[u8], graph_id: GraphId) -> StoreResult<Option<(String, u64)>> {
    if record.len() < 8 {
        return Err(StoreError::Corrupt {
            graph_id: graph_id.to_string(),
            reason: "idempotency record shorter than version prefix".to_owned(),
        });
    }
    let (version_bytes, key_bytes) = record.split_at(8);
    let version = u64::from_be_bytes(version_bytes.try_into().map_err(|_| StoreError::Corrupt {
        graph_id: graph_id.to_string(),
        reason: "idempotency version prefix malformed".to_owned(),
    })?);
    let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| StoreError::Corrupt {
        graph_id: graph_id.to_string(),
        reason: "idempotency key is not valid utf-8".to_owned(),
    })?;
    Ok(Some((key, version)))
}

fn decode_snapshot(record: &[u8], graph_id: GraphId) -> StoreResult<(u64, Vec<u8>)> {
    if record.len() < 8 {
        return Err(StoreError::Corrupt {
            graph_id: graph_id.to_string(),
            reason: "snapshot record shorter than version prefix".to_owned(),
        });
    }
    let (version_bytes, payload) = record.split_at(8);
    let version = u64::from_be_bytes(version_bytes.try_into().map_err(|_| StoreError::Corrupt {
        graph_id: graph_id.to_string(),
        reason: "snapshot version prefix malformed".to_owned(),
    })?);
    Ok((version, payload.to_vec()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn open_tmp() -> (SledStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn appends_persist_and_advance_the_version() {
        let (store, _dir) = open_tmp();
        let graph_id = GraphId::new();
        assert_eq!(store.current_version(graph_id).unwrap(), 0);
        let v1 = store.append_patch(graph_id, 0, vec![1, 2, 3], None).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(store.current_version(graph_id).unwrap(), 1);
    }

    #[test]
    fn stale_expected_version_is_a_conflict() {
        let (store, _dir) = open_tmp();
        let graph_id = GraphId::new();
        store.append_patch(graph_id, 0, vec![1], None).unwrap();
        let err = store.append_patch(graph_id, 0, vec![2], None).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[test]
    fn repeated_idempotency_key_short_circuits_to_the_prior_version() {
        let (store, _dir) = open_tmp();
        let graph_id = GraphId::new();
        let v1 = store.append_patch(graph_id, 0, vec![1], Some("req-1")).unwrap();
        let retry = store.append_patch(graph_id, 0, vec![9, 9, 9], Some("req-1")).unwrap();
        assert_eq!(v1, retry);

        let since = store.load_patches_since(graph_id, 0).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].bytes, vec![1]);
    }

    #[test]
    fn snapshots_round_trip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let graph_id = GraphId::new();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.save_snapshot(graph_id, 3, vec![7, 7]).unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        let (version, bytes) = store.load_latest_snapshot(graph_id).unwrap().unwrap();
        assert_eq!(version, 3);
        assert_eq!(bytes, vec![7, 7]);
    }

    #[test]
    fn an_older_snapshot_never_overwrites_a_newer_one() {
        let (store, _dir) = open_tmp();
        let graph_id = GraphId::new();
        store.save_snapshot(graph_id, 5, vec![5]).unwrap();
        store.save_snapshot(graph_id, 2, vec![2]).unwrap();
        let (version, _) = store.load_latest_snapshot(graph_id).unwrap().unwrap();
        assert_eq!(version, 5);
    }
}
