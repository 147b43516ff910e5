//! # spawnd
//!
//! Spawns a single sandboxed child process, either directly or through a
//! freshly launched spawner, and exits with the child's status.

mod commands;
mod flags;
mod output;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Some(argv0) = std::env::args().next() {
        spawnd_runtime::process_name::init(&argv0);
    }

    let cli = Cli::parse();
    let code = commands::execute(cli)?;
    std::process::exit(code);
}
