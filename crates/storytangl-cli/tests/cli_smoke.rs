// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! End-to-end smoke tests over the `stcli` binary, covering spec.md §8
//! scenario 1 (a static block with one outbound choice) through the
//! `create`/`step`/`status`/`journal` subcommands.
//!
//! Each test opens its own `sled` database under a fresh temp directory:
//! the `:memory:` backend starts empty on every process invocation, so it
//! cannot carry state between the separate `stcli` processes these tests
//! spawn for `create` and the subcommands that follow it.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/village")
}

fn stcli(store: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stcli").expect("stcli binary is built for this crate's tests");
    cmd.args(["--store"]).arg(store).arg("--json");
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("subcommand printed valid JSON")
}

fn created_graph_id(store: &Path) -> String {
    let create = stcli(store)
        .arg("create")
        .arg(fixture_path())
        .output()
        .expect("create ran");
    assert!(create.status.success(), "create failed: {create:?}");
    parse_json(&create.stdout)["graph_id"].as_str().unwrap().to_owned()
}

#[test]
fn create_reports_a_fresh_graph_id() {
    let dir = TempDir::new().expect("temp dir");
    let store = dir.path().join("db");
    let output = stcli(&store).arg("create").arg(fixture_path()).output().expect("create ran");
    assert!(output.status.success());
    let json = parse_json(&output.stdout);
    assert!(json["graph_id"].is_string());
}

#[test]
fn status_after_create_reports_the_start_block() {
    let dir = TempDir::new().expect("temp dir");
    let store = dir.path().join("db");
    let graph_id = created_graph_id(&store);

    let status = stcli(&store).args(["status", &graph_id]).output().expect("status ran");
    assert!(status.status.success());
    let json = parse_json(&status.stdout);
    assert_eq!(json["cursor_label"], "start");
    assert_eq!(json["version"], 0);
}

#[test]
fn stepping_with_no_choice_journals_the_cursor_without_advancing() {
    let dir = TempDir::new().expect("temp dir");
    let store = dir.path().join("db");
    let graph_id = created_graph_id(&store);

    let step = stcli(&store).args(["step", &graph_id]).output().expect("step ran");
    assert!(step.status.success(), "step failed: {step:?}");
    let json = parse_json(&step.stdout);
    let fragments = json["fragments"].as_array().unwrap();
    assert!(fragments.iter().any(|f| f["content"] == "You are in a room."));
    assert!(fragments.iter().any(|f| f["content"] == "Leave"));

    let status = stcli(&store).args(["status", &graph_id]).output().expect("status ran");
    let status_json = parse_json(&status.stdout);
    assert_eq!(status_json["cursor_label"], "start");
    assert_eq!(status_json["version"], 1);
}

#[test]
fn journal_replays_the_fragments_of_a_committed_tick() {
    let dir = TempDir::new().expect("temp dir");
    let store = dir.path().join("db");
    let graph_id = created_graph_id(&store);

    let step = stcli(&store).args(["step", &graph_id]).output().expect("step ran");
    assert!(step.status.success());

    let journal = stcli(&store)
        .args(["journal", &graph_id, "0"])
        .output()
        .expect("journal ran");
    assert!(journal.status.success());
    let fragments = parse_json(&journal.stdout);
    let fragments = fragments.as_array().unwrap();
    assert!(fragments.iter().any(|f| f["content"] == "You are in a room."));
}

#[test]
fn status_for_an_unrecorded_graph_id_fails_with_the_store_exit_code() {
    let dir = TempDir::new().expect("temp dir");
    let store = dir.path().join("db");
    let status = stcli(&store)
        .args(["status", "00000000-0000-0000-0000-000000000000"])
        .output()
        .expect("status ran");
    assert!(!status.status.success());
    assert_eq!(status.status.code(), Some(69));
}

#[test]
fn an_invalid_graph_id_is_a_usage_error() {
    let dir = TempDir::new().expect("temp dir");
    let store = dir.path().join("db");
    let status = stcli(&store).args(["status", "not-a-uuid"]).output().expect("status ran");
    assert!(!status.status.success());
    assert_eq!(status.status.code(), Some(64));
}
