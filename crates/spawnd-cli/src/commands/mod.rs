//! CLI command definitions and dispatch.

pub mod run;
pub mod spawn;

use clap::{Parser, Subcommand};
use spawnd_core::cgroup::{CgroupState, controllers};
use tokio::sync::mpsc;

/// spawnd: sandboxed child process spawner.
#[derive(Parser, Debug)]
#[command(name = spawnd_common::constants::BIN_NAME, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Spawn a program directly from this process.
    Run(run::RunArgs),
    /// Launch a spawner and spawn a program through it.
    Spawn(spawn::SpawnArgs),
}

/// Dispatches the parsed CLI command and returns the exit code.
///
/// # Errors
///
/// Returns an error if the program could not be spawned.
pub fn execute(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Command::Run(args) => run::execute(args),
        Command::Spawn(args) => spawn::execute(args),
    }
}

/// Ctrl+C presses, delivered to the event loop.
fn interrupts() -> anyhow::Result<mpsc::UnboundedReceiver<()>> {
    let (tx, rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;
    Ok(rx)
}

/// The cgroup children are created below: a new scope if requested,
/// otherwise our own cgroup. Cgroups are optional; failures only warn.
fn cgroup_state(scope: Option<&str>, needs_controllers: bool) -> CgroupState {
    let state = match scope {
        Some(scope) => spawnd_runtime::launch::create_scope(scope, None),
        None => CgroupState::from_process(None),
    };
    let state = state.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "cgroups disabled");
        CgroupState::default()
    });
    if needs_controllers && state.is_enabled() {
        if let Err(e) = controllers::enable_all_controllers(&state) {
            tracing::warn!(error = %e, "cannot enable cgroup controllers");
        }
    }
    state
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow::anyhow!("failed to create event loop: {e}"))
}
