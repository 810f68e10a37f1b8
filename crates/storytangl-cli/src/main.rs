// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! `stcli`: a developer CLI over the execution API (spec.md §6) —
//! `create`, `step`, `status`, `journal`, `load`, each mapped onto the exit
//! codes that section defines.

#![deny(rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro
)]
#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]
// This binary's entire job is printing to stdout/stderr; the workspace-wide
// deny (kept at `deny`, not `forbid`, for exactly this) targets library
// code that should log through `tracing` instead.
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;
mod error;
mod session;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use storytangl_core::{EdgeId, Fragment, GraphId, NodeId};
use uuid::Uuid;

use config::EngineConfig;
use error::CliError;
use session::Session;

/// StoryTangl developer CLI.
#[derive(Debug, Parser)]
#[command(name = "stcli", author, version, about)]
struct Cli {
    /// Path to the `sled` database backing the patch log and snapshots.
    /// Defaults to the configured/platform store path. Pass `:memory:` to
    /// use an ephemeral in-process backend (testing only).
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile a world bundle and start a new playthrough.
    Create {
        /// Path to the world bundle directory (containing `world.yaml`).
        world: PathBuf,
    },
    /// Advance a playthrough by one tick.
    Step {
        /// The story's graph id, as printed by `create`.
        graph: String,
        /// The outbound `Choice` edge id to take, if any.
        #[arg(long)]
        choice: Option<String>,
        /// The deterministic-allocator seed for this tick.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Report a playthrough's current cursor, tick, and version.
    Status {
        /// The story's graph id.
        graph: String,
    },
    /// Confirm a playthrough exists and report its status.
    Load {
        /// The story's graph id.
        graph: String,
    },
    /// Print the journal fragments produced by a given tick.
    Journal {
        /// The story's graph id.
        graph: String,
        /// The 0-based tick index.
        index: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err, cli.json);
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(70))
        }
    }
}

fn report_error(err: &CliError, json: bool) {
    let envelope = err.envelope();
    if json {
        match serde_json::to_string(&envelope) {
            Ok(text) => eprintln!("{text}"),
            Err(_) => eprintln!("{{\"kind\":\"CodecError\",\"message\":\"failed to serialize error envelope\"}}"),
        }
    } else {
        eprintln!("error[{}]: {}", envelope.kind, envelope.message);
    }
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let config = EngineConfig::load()?;
    let store_path = cli.store.clone().unwrap_or_else(|| config.store_path.clone());
    let mut session = Session::open(&store_path)?;

    match &cli.command {
        Command::Create { world } => {
            let graph_id = session.create_story(world)?;
            print_created(graph_id, cli.json);
        }
        Command::Step { graph, choice, seed } => {
            let graph_id = parse_graph_id(graph)?;
            let choice_id = choice.as_deref().map(parse_edge_id).transpose()?;
            let outcome = session.step(
                graph_id,
                choice_id,
                *seed,
                config.max_call_depth,
                config.softlock_check,
            )?;
            print_tick_outcome(&outcome, cli.json);
        }
        Command::Status { graph } => {
            let report = session.status(parse_graph_id(graph)?)?;
            print_status(&report, cli.json);
        }
        Command::Load { graph } => {
            let report = session.load_story(parse_graph_id(graph)?)?;
            print_status(&report, cli.json);
        }
        Command::Journal { graph, index } => {
            let fragments = session.journal_entry(parse_graph_id(graph)?, *index)?;
            print_journal(&fragments, cli.json);
        }
    }
    Ok(())
}

fn parse_graph_id(raw: &str) -> Result<GraphId, CliError> {
    Uuid::parse_str(raw)
        .map(GraphId::from_uuid)
        .map_err(|e| CliError::Usage(format!("invalid graph id '{raw}': {e}")))
}

fn parse_edge_id(raw: &str) -> Result<EdgeId, CliError> {
    Uuid::parse_str(raw)
        .map(EdgeId::from_uuid)
        .map_err(|e| CliError::Usage(format!("invalid edge id '{raw}': {e}")))
}

fn print_created(graph_id: GraphId, json: bool) {
    if json {
        println!("{{\"graph_id\":\"{graph_id}\"}}");
    } else {
        println!("created story {graph_id}");
    }
}

fn print_tick_outcome(outcome: &storytangl_core::TickOutcome, json: bool) {
    if json {
        #[derive(serde::Serialize)]
        struct Wire<'a> {
            cursor_id: NodeId,
            fragments: &'a [Fragment],
        }
        let wire = Wire {
            cursor_id: outcome.cursor_id,
            fragments: &outcome.fragments,
        };
        println!("{}", serde_json::to_string(&wire).unwrap_or_default());
    } else {
        for fragment in &outcome.fragments {
            println!("{}", render_fragment(fragment));
        }
        println!("-- cursor: {}", outcome.cursor_id);
    }
}

fn print_status(report: &session::StatusReport, json: bool) {
    if json {
        println!("{}", serde_json::to_string(report).unwrap_or_default());
    } else {
        println!(
            "graph {}: tick {} version {} cursor {} ({}) depth {}",
            report.graph_id,
            report.tick,
            report.version,
            report.cursor_id,
            report.cursor_label.as_deref().unwrap_or("?"),
            report.call_depth
        );
    }
}

fn print_journal(fragments: &[Fragment], json: bool) {
    if json {
        println!("{}", serde_json::to_string(fragments).unwrap_or_default());
    } else {
        for fragment in fragments {
            println!("{}", render_fragment(fragment));
        }
    }
}

fn render_fragment(fragment: &Fragment) -> String {
    fragment.label.as_ref().map_or_else(
        || fragment.content.clone(),
        |label| format!("[{label}] {}", fragment.content),
    )
}
