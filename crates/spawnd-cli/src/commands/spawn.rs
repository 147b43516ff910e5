//! `spawnd spawn`: launch a spawner and spawn through the wire protocol.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use clap::Args;
use spawnd_common::config::SpawnConfig;
use spawnd_common::types::ExitStatus;
use spawnd_core::prepared::PreparedChildProcess;
use spawnd_core::uid_gid;
use spawnd_runtime::client::SpawnServerClient;
use spawnd_runtime::launch;
use spawnd_runtime::service::{SpawnService, wait_spawn_completion};
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

use crate::flags::SpawnFlags;
use crate::output;

/// Arguments for the `spawn` command.
#[derive(Args, Debug)]
pub struct SpawnArgs {
    /// Spawner configuration (JSON). Without it, the spawner accepts the
    /// identity given on the command line and defaults to our own.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// The child process.
    #[command(flatten)]
    pub flags: SpawnFlags,
}

fn load_config(path: Option<&PathBuf>, process: &PreparedChildProcess) -> anyhow::Result<SpawnConfig> {
    if let Some(path) = path {
        return Ok(SpawnConfig::load(path)?);
    }
    let mut config = SpawnConfig {
        default_uid_gid: uid_gid::load_effective(),
        ..SpawnConfig::default()
    };
    let ids = &process.uid_gid;
    config.allowed_uids.extend(ids.uid.into_iter().chain(ids.real_uid));
    config.allowed_gids.extend(ids.gid.into_iter().chain(ids.real_gid));
    Ok(config)
}

/// Executes the `spawn` command.
///
/// Ctrl+C sends `SIGTERM` to the child and exits without waiting.
///
/// # Errors
///
/// Returns an error if the spawner cannot be launched or the spawn fails.
#[allow(clippy::print_stderr)]
pub fn execute(args: SpawnArgs) -> anyhow::Result<i32> {
    let request = args.flags.into_request()?;
    let mut config = load_config(args.config.as_ref(), &request.process)?;
    if request.scope.is_some() {
        config.systemd_scope.clone_from(&request.scope);
    }

    // Before anything starts a thread.
    let spawner = launch::launch_spawner(config.clone())?;
    let mut interrupts = super::interrupts()?;
    let runtime = super::runtime()?;

    let status = LocalSet::new().block_on(
        &runtime,
        supervise(spawner.socket, config, request.process, &mut interrupts),
    )?;
    let (code, message) = output::exit_code(status);
    if let Some(message) = message {
        eprintln!("spawnd: {message}");
    }
    Ok(code)
}

async fn supervise(
    socket: OwnedFd,
    config: SpawnConfig,
    process: PreparedChildProcess,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> anyhow::Result<ExitStatus> {
    let client = SpawnServerClient::new(socket, config)?;
    client.on_memory_warning(output::memory_warning);
    client.wait_admission().await;

    let name = process
        .args
        .first()
        .map_or_else(|| "child".to_owned(), |arg0| arg0.rsplit('/').next().unwrap_or(arg0).to_owned());
    let mut handle = client.spawn_child_process(&name, process)?;

    let (tx, exited) = oneshot::channel();
    let mut tx = Some(tx);
    handle.set_exit_listener(Box::new(move |status| {
        if let Some(tx) = tx.take() {
            let _ = tx.send(status);
        }
    }));
    wait_spawn_completion(handle.as_mut()).await?;
    tracing::info!(name, cgroups = client.supports_cgroups(), "child process started");

    tokio::select! {
        status = exited => {
            let status = status.map_err(|_| anyhow::anyhow!("lost the spawner connection"))?;
            Ok(ExitStatus::from_raw(status))
        }
        Some(()) = interrupts.recv() => {
            handle.kill(libc::SIGTERM);
            Ok(ExitStatus::Signaled {
                signal: libc::SIGTERM,
                core_dumped: false,
            })
        }
    }
}
