//! `spawnd run`: spawn a program from this process.

use clap::Args;
use spawnd_common::types::ExitStatus;
use spawnd_core::cgroup::CgroupState;
use spawnd_core::filesystem::NamedTmpfsResolver;
use spawnd_runtime::cgroup_kill;
use spawnd_runtime::direct::{self, SpawnContext};
use spawnd_runtime::exit_watch::ExitWatch;
use spawnd_runtime::named_tmpfs::NamedTmpfsManager;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

use crate::flags::{Request, SpawnFlags};
use crate::output;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// The child process.
    #[command(flatten)]
    pub flags: SpawnFlags,
}

/// Executes the `run` command.
///
/// Ctrl+C kills the child's cgroup if it has one and forwards `SIGTERM`
/// otherwise.
///
/// # Errors
///
/// Returns an error if the child cannot be spawned.
#[allow(clippy::print_stderr)]
pub fn execute(args: RunArgs) -> anyhow::Result<i32> {
    let request = args.flags.into_request()?;
    let state = super::cgroup_state(request.scope.as_deref(), request.cgroup.is_some());
    let mut interrupts = super::interrupts()?;
    let runtime = super::runtime()?;

    let status = LocalSet::new().block_on(&runtime, supervise(request, &state, &mut interrupts))?;
    let (code, message) = output::exit_code(status);
    if let Some(message) = message {
        eprintln!("spawnd: {message}");
    }
    Ok(code)
}

async fn supervise(
    request: Request,
    state: &CgroupState,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> anyhow::Result<ExitStatus> {
    let named_tmpfs = NamedTmpfsManager::default();
    let ctx = SpawnContext {
        cgroup_state: state,
        named_tmpfs: Some(&named_tmpfs as &dyn NamedTmpfsResolver),
    };
    let child = direct::spawn_child_process(request.process, &ctx)?;
    tracing::info!(pid = child.pid, "child process started");

    let (tx, mut exited) = oneshot::channel();
    let watch = ExitWatch::start(child.pidfd, child.pid, move |status| {
        let _ = tx.send(status);
    })?;

    loop {
        tokio::select! {
            status = &mut exited => {
                let status = status.map_err(|_| anyhow::anyhow!("lost track of the child process"))?;
                return Ok(ExitStatus::from_raw(status));
            }
            Some(()) = interrupts.recv() => match request.cgroup.as_deref() {
                Some(cgroup) if state.is_enabled() => {
                    if let Err(e) = cgroup_kill::kill_cgroup(state, cgroup).await {
                        tracing::error!(cgroup, error = %e, "cgroup kill failed");
                    }
                }
                _ => {
                    if let Err(e) = watch.signal(libc::SIGTERM) {
                        tracing::warn!(pid = watch.pid(), error = %e, "cannot forward SIGTERM");
                    }
                }
            },
        }
    }
}
