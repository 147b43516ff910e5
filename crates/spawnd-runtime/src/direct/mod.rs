//! Direct spawn engine: one `clone3()` per [`PreparedChildProcess`].
//!
//! The parent resolves the request into a plan, joins named namespaces,
//! clones, runs the user namespace [`handshake`] and then polls the error
//! pipe briefly. Data on that pipe is the child's setup failure; EOF (the
//! pipe is `O_CLOEXEC`) or silence means the program is running.

mod child;
mod handshake;
mod init;
mod prepare;

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use spawnd_common::constants::ERROR_PIPE_TIMEOUT;
use spawnd_common::error::{Result, SpawnError};
use spawnd_core::cgroup::CgroupState;
use spawnd_core::filesystem::NamedTmpfsResolver;
use spawnd_core::prepared::PreparedChildProcess;
use spawnd_core::sys::{self, CloneArgs};

use self::child::ChildPipes;
use self::handshake::{Handshake, PipeHandshake};
use self::prepare::{Privileges, UserNamespaceMode};

/// Process-wide state a spawn needs besides the request itself.
#[derive(Clone, Copy)]
pub struct SpawnContext<'a> {
    /// The spawner's delegated cgroup.
    pub cgroup_state: &'a CgroupState,
    /// Registry for [`spawnd_core::namespace::mount::MountKind::NamedTmpfs`].
    pub named_tmpfs: Option<&'a dyn NamedTmpfsResolver>,
}

impl std::fmt::Debug for SpawnContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnContext")
            .field("cgroup_state", self.cgroup_state)
            .field("named_tmpfs", &self.named_tmpfs.is_some())
            .finish()
    }
}

/// A started child process.
#[derive(Debug)]
pub struct SpawnedChild {
    /// Pidfd of the child (of its init, with a new PID namespace).
    pub pidfd: OwnedFd,
    /// Pid in the spawner's PID namespace.
    pub pid: libc::pid_t,
}

fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
    sys::pipe().map_err(|e| SpawnError::Os {
        operation: "pipe",
        source: e,
    })
}

fn raw(fd: Option<&OwnedFd>) -> Option<RawFd> {
    fd.map(AsRawFd::as_raw_fd)
}

/// Reads a setup error the child wrote, if any.
fn read_child_error(error_r: &OwnedFd, timeout_ms: i32) -> Option<String> {
    match sys::poll_readable(error_r.as_raw_fd(), timeout_ms) {
        Ok(true) => {}
        _ => return None,
    }
    let mut buffer = [0u8; 1024];
    match sys::read(error_r.as_raw_fd(), &mut buffer) {
        Ok(n) if n > 0 => Some(String::from_utf8_lossy(buffer.get(..n).unwrap_or_default()).into_owned()),
        _ => None,
    }
}

fn abort_child(pidfd: &OwnedFd, pid: libc::pid_t) {
    let _ = sys::pidfd_send_signal(pidfd.as_fd(), libc::SIGKILL);
    if let Err(e) = sys::waitpid_blocking(pid) {
        tracing::debug!(pid, error = %e, "failed child already reaped");
    }
}

/// Spawns `process` and returns once it runs its program.
///
/// Blocks the calling thread for the handshake and up to
/// [`ERROR_PIPE_TIMEOUT`] afterwards.
///
/// # Errors
///
/// Returns an error if the request cannot be prepared, `clone3()` fails,
/// or the child reports a setup failure.
pub fn spawn_child_process(process: PreparedChildProcess, ctx: &SpawnContext<'_>) -> Result<SpawnedChild> {
    let named = process.ns.open_named()?;
    let plan = prepare::prepare(process, ctx.cgroup_state, ctx.named_tmpfs, Privileges::current())?;

    let (error_r, error_w) = pipe_pair()?;
    let (map_r, map_w) = match plan.user_namespace {
        UserNamespaceMode::Cloned => {
            let (r, w) = pipe_pair()?;
            (Some(r), Some(w))
        }
        _ => (None, None),
    };
    let ((create_r, create_w), (wait_r, wait_w)) = match plan.user_namespace {
        UserNamespaceMode::Postponed => {
            let (cr, cw) = pipe_pair()?;
            let (wr, ww) = pipe_pair()?;
            ((Some(cr), Some(cw)), (Some(wr), Some(ww)))
        }
        _ => ((None, None), (None, None)),
    };

    let pipes = ChildPipes {
        error_w: error_w.as_raw_fd(),
        map_r: raw(map_r.as_ref()),
        create_w: raw(create_w.as_ref()),
        wait_r: raw(wait_r.as_ref()),
        parent_ends: [
            Some(error_r.as_raw_fd()),
            raw(map_w.as_ref()),
            raw(create_r.as_ref()),
            raw(wait_w.as_ref()),
        ],
    };

    let mut pidfd: RawFd = -1;
    #[allow(clippy::cast_sign_loss)]
    let mut args = CloneArgs {
        flags: sys::CLONE_PIDFD | u64::from(plan.clone_flags.bits() as u32),
        pidfd: std::ptr::from_mut(&mut pidfd) as u64,
        exit_signal: libc::SIGCHLD as u64,
        ..CloneArgs::default()
    };
    if let Some(cgroup) = &plan.cgroup_fd {
        args.flags |= sys::CLONE_INTO_CGROUP;
        #[allow(clippy::cast_sign_loss)]
        {
            args.cgroup = cgroup.as_raw_fd() as u64;
        }
    }

    let switches = named.enter()?;
    // SAFETY: the child only runs `child::run`, which does not allocate and
    // never returns; `pidfd` outlives the call.
    let cloned = unsafe { sys::clone3(&mut args) };
    if matches!(cloned, Ok(0)) {
        child::run(&plan, &pipes);
    }
    drop(switches);
    let pid = cloned.map_err(|e| SpawnError::Os {
        operation: "clone3",
        source: e,
    })?;
    // SAFETY: CLONE_PIDFD stored a fresh descriptor we now own.
    let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd) };

    drop((error_w, map_r, create_w, wait_r));

    let mut io = PipeHandshake {
        pid,
        created: create_r,
        wake: map_w.or(wait_w),
        rlimits: &plan.rlimits,
    };
    if let Err(e) = Handshake::new(plan.user_namespace, plan.id_maps.as_ref()).run(&mut io) {
        let reported = read_child_error(&error_r, 0);
        abort_child(&pidfd, pid);
        return Err(reported.map_or(e, |message| SpawnError::ChildSetup { message }));
    }

    #[allow(clippy::cast_possible_truncation)]
    let timeout = ERROR_PIPE_TIMEOUT.as_millis() as i32;
    if let Some(message) = read_child_error(&error_r, timeout) {
        abort_child(&pidfd, pid);
        return Err(SpawnError::ChildSetup { message });
    }

    tracing::debug!(pid, "child process started");
    Ok(SpawnedChild { pidfd, pid })
}
