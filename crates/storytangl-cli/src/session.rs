// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Glue between the engine (`storytangl-core`), the loader (`storytangl-ir`)
//! and the persistence contract (`storytangl-store`) that every subcommand
//! in [`crate::main`] drives.
//!
//! A world bundle is recompiled fresh on every invocation (cheap, and
//! `compile_story`'s templates are keyed by author label, never by a
//! previous run's node ids, so this is safe); only the *graph* — the one
//! part of compilation that allocates fresh ids — is ever persisted. The
//! pairing of "world bundle root" to a `graph_id` lives in a small JSON
//! side index next to the `sled` database, since that mapping is a CLI
//! convenience, not part of the persistence contract spec.md §4.5 defines.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use storytangl_core::{Fragment, GraphId, Patch};
use storytangl_ir::{compile_story, load_world_bundle};
use storytangl_store::{MemoryStore, PatchLog, SledStore, SnapshotStore, StoredPatch};

use crate::error::CliError;

/// The full state a `stcli` invocation needs to resume a playthrough: the
/// committed graph plus the cursor/call-stack position `storytangl-core`
/// keeps outside the graph proper (spec.md §4.3).
#[derive(Debug, Serialize, Deserialize)]
struct CliSnapshot {
    graph: storytangl_core::Graph,
    state: storytangl_core::PlaythroughState,
}

/// `graph_id -> world bundle root` index, so a later `step`/`status` call
/// knows which bundle to recompile templates from.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WorldIndex {
    worlds: BTreeMap<String, PathBuf>,
}

/// Which persistence contract implementation this session is driving.
/// Production use always takes `Sled`; `Memory` exists only so the test
/// suite can exercise every subcommand without touching disk.
enum Backend {
    Sled(SledStore),
    Memory(MemoryStore),
}

impl Backend {
    fn patch_log(&self) -> &dyn PatchLog {
        match self {
            Self::Sled(store) => store,
            Self::Memory(store) => store,
        }
    }

    fn snapshots(&self) -> &dyn SnapshotStore {
        match self {
            Self::Sled(store) => store,
            Self::Memory(store) => store,
        }
    }
}

/// The backend + world index a subcommand operates against, opened once
/// per invocation.
pub struct Session {
    backend: Backend,
    index_path: PathBuf,
    index: WorldIndex,
}

impl Session {
    /// Opens the `sled` database at `store_path` (creating it if absent)
    /// and loads the world index next to it. A `store_path` of `:memory:`
    /// selects the in-process [`MemoryStore`] instead; since that backend
    /// is reconstructed empty on every invocation, it only makes sense for
    /// a single subcommand in isolation, never a `create` followed by a
    /// later `step`/`status` in a separate process.
    ///
    /// # Errors
    /// [`CliError::Store`] if the database cannot be opened;
    /// [`CliError::Io`]/[`CliError::Codec`] if the world index exists but
    /// cannot be read or parsed.
    pub fn open(store_path: &Path) -> Result<Self, CliError> {
        if store_path == Path::new(":memory:") {
            return Ok(Self {
                backend: Backend::Memory(MemoryStore::new()),
                index_path: PathBuf::from("stcli-memory.worlds.json"),
                index: WorldIndex::default(),
            });
        }
        let db = SledStore::open(store_path)?;
        let index_path = sibling_index_path(store_path);
        let index = load_index(&index_path)?;
        Ok(Self {
            backend: Backend::Sled(db),
            index_path,
            index,
        })
    }

    /// Compiles `world_root` and persists its initial graph under a fresh
    /// [`GraphId`], returning that id.
    ///
    /// # Errors
    /// [`CliError::Data`] if the bundle or its script is malformed;
    /// [`CliError::Store`] if the initial snapshot cannot be written.
    pub fn create_story(&mut self, world_root: &Path) -> Result<GraphId, CliError> {
        let bundle = load_world_bundle(world_root)?;
        let script = bundle
            .scripts
            .first()
            .ok_or_else(|| CliError::Usage(format!("world at {} declares no scripts", world_root.display())))?;
        let compiled = compile_story(script)?;

        let graph_id = GraphId::new();
        let snapshot = CliSnapshot {
            graph: compiled.graph,
            state: storytangl_core::PlaythroughState {
                cursor_id: compiled.initial_cursor,
                cursor_history: vec![compiled.initial_cursor],
                call_stack: Vec::new(),
            },
        };
        self.save_snapshot(graph_id, 0, &snapshot)?;
        self.index
            .worlds
            .insert(graph_id.as_uuid().to_string(), world_root.to_path_buf());
        self.persist_index()?;
        Ok(graph_id)
    }

    /// Advances `graph_id` by one tick, appending the resulting patch to
    /// the log and writing a fresh snapshot.
    ///
    /// # Errors
    /// [`CliError::Store`] if no story was created under this id, or if the
    /// append races a concurrent writer ([`storytangl_store::StoreError::VersionConflict`]);
    /// [`CliError::Engine`] if the tick itself fails (softlock, unresolved
    /// hard requirement, unsafe expression, …).
    pub fn step(
        &mut self,
        graph_id: GraphId,
        choice: Option<storytangl_core::EdgeId>,
        rng_seed: u64,
        max_call_depth: u32,
        softlock_check: bool,
    ) -> Result<storytangl_core::TickOutcome, CliError> {
        let world_root = self.world_root_for(graph_id)?;
        let bundle = load_world_bundle(&world_root)?;
        let script = bundle.scripts.first().ok_or_else(|| {
            CliError::Usage(format!("world at {} declares no scripts", world_root.display()))
        })?;
        let templates = compile_story(script)?.templates;

        let snapshot = self.load_snapshot(graph_id)?;
        let before_version = snapshot.graph.version;

        let mut engine = storytangl_core::Engine::resume(snapshot.graph, snapshot.state);
        engine.templates = templates;
        engine.max_call_depth = max_call_depth;
        engine.softlock_check = softlock_check;

        let outcome = engine.step(choice, rng_seed)?;

        let mut patch_bytes = Vec::new();
        ciborium::into_writer(&outcome.patch, &mut patch_bytes)
            .map_err(|e| CliError::Codec(e.to_string()))?;
        self.append_patch(graph_id, before_version, patch_bytes)?;

        let after = CliSnapshot {
            graph: engine.graph,
            state: engine.state,
        };
        self.save_snapshot(graph_id, after.graph.version, &after)?;

        Ok(outcome)
    }

    /// The current cursor, tick, and version for `graph_id`.
    ///
    /// # Errors
    /// [`CliError::Store`] if no story was created under this id.
    pub fn status(&self, graph_id: GraphId) -> Result<StatusReport, CliError> {
        let snapshot = self.load_snapshot(graph_id)?;
        let cursor = snapshot.graph.get(snapshot.state.cursor_id).ok();
        Ok(StatusReport {
            graph_id,
            tick: snapshot.graph.version,
            version: snapshot.graph.version,
            cursor_id: snapshot.state.cursor_id,
            cursor_label: cursor.map(|n| n.label.clone()),
            call_depth: u32::try_from(snapshot.state.call_stack.len()).unwrap_or(u32::MAX),
        })
    }

    /// Confirms `graph_id` has a recorded story and returns its status —
    /// spec.md §6's `load_story(graph_id)` operation.
    ///
    /// # Errors
    /// [`CliError::Store`] if no story was created under this id.
    pub fn load_story(&self, graph_id: GraphId) -> Result<StatusReport, CliError> {
        self.status(graph_id)
    }

    /// The journal fragments produced by the `index`th committed tick
    /// (0-based), spec.md §6's `get_journal_entry(index)`.
    ///
    /// # Errors
    /// [`CliError::Usage`] if `index` is out of range;
    /// [`CliError::Store`]/[`CliError::Codec`] on backend or decode failure.
    pub fn journal_entry(&self, graph_id: GraphId, index: u64) -> Result<Vec<Fragment>, CliError> {
        let patches = self.load_patches(graph_id)?;
        let entry = patches.get(index as usize).ok_or_else(|| {
            CliError::Usage(format!("graph {graph_id} has no tick at index {index}"))
        })?;
        let patch: Patch =
            ciborium::from_reader(entry.bytes.as_slice()).map_err(|e| CliError::Codec(e.to_string()))?;
        Ok(patch.journal)
    }

    fn world_root_for(&self, graph_id: GraphId) -> Result<PathBuf, CliError> {
        self.index
            .worlds
            .get(&graph_id.as_uuid().to_string())
            .cloned()
            .ok_or_else(|| CliError::Usage(format!("no world recorded for graph {graph_id}")))
    }

    fn load_snapshot(&self, graph_id: GraphId) -> Result<CliSnapshot, CliError> {
        let (_, bytes) = self
            .backend
            .snapshots()
            .load_latest_snapshot(graph_id)?
            .ok_or_else(|| storytangl_store::StoreError::NotFound(graph_id.to_string()))?;
        ciborium::from_reader(bytes.as_slice()).map_err(|e| CliError::Codec(e.to_string()))
    }

    fn save_snapshot(&self, graph_id: GraphId, version: u64, snapshot: &CliSnapshot) -> Result<(), CliError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(snapshot, &mut bytes).map_err(|e| CliError::Codec(e.to_string()))?;
        self.backend.snapshots().save_snapshot(graph_id, version, bytes)?;
        Ok(())
    }

    fn append_patch(&self, graph_id: GraphId, expected_version: u64, bytes: Vec<u8>) -> Result<u64, CliError> {
        Ok(self.backend.patch_log().append_patch(graph_id, expected_version, bytes, None)?)
    }

    fn load_patches(&self, graph_id: GraphId) -> Result<Vec<StoredPatch>, CliError> {
        Ok(self.backend.patch_log().load_patches_since(graph_id, 0)?)
    }

    fn persist_index(&self) -> Result<(), CliError> {
        let text = serde_json::to_string_pretty(&self.index).map_err(|e| CliError::Codec(e.to_string()))?;
        if let Some(parent) = self.index_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.index_path, text)?;
        Ok(())
    }
}

/// A snapshot of one story's position, printed by `status`/`load`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// The story's id.
    pub graph_id: GraphId,
    /// The committed tick counter.
    pub tick: u64,
    /// The committed patch-count version.
    pub version: u64,
    /// Where the cursor currently sits.
    pub cursor_id: storytangl_core::NodeId,
    /// The cursor node's label, if it still exists.
    pub cursor_label: Option<String>,
    /// How many subroutine frames are currently on the call stack.
    pub call_depth: u32,
}

fn sibling_index_path(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".worlds.json");
    store_path.with_file_name(name)
}

fn load_index(path: &Path) -> Result<WorldIndex, CliError> {
    if !path.exists() {
        return Ok(WorldIndex::default());
    }
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| CliError::Codec(e.to_string()))
}
