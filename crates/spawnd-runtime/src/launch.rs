//! Starting the spawner process.
//!
//! The spawner is cloned off the daemon early, while it is still
//! single-threaded and privileged. It gets its own PID and mount
//! namespace where the kernel allows it, wraps itself in a cgroup scope,
//! drops the capabilities it does not need and then serves the socket
//! until every connection is closed.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use nix::mount::{MsFlags, mount};
use spawnd_common::config::SpawnConfig;
use spawnd_common::constants::SPAWNER_PROCESS_NAME;
use spawnd_common::error::{Result, SpawnError};
use spawnd_core::capability::{self, Capability};
use spawnd_core::cgroup::{CgroupState, controllers};
use spawnd_core::{sys, uid_gid};

use crate::process_name;
use crate::server::SpawnServer;

/// Capabilities the spawner needs to build sandboxes.
const SPAWNER_CAPABILITIES: &[Capability] = &[
    Capability::SysAdmin,
    Capability::SysChroot,
    Capability::SysResource,
    Capability::SysNice,
    Capability::NetAdmin,
    Capability::Setuid,
    Capability::Setgid,
    Capability::Chown,
    Capability::Fowner,
    Capability::DacOverride,
    Capability::Kill,
];

#[allow(clippy::cast_sign_loss)]
const NEWPID: u64 = libc::CLONE_NEWPID as u64;
#[allow(clippy::cast_sign_loss)]
const NEWNS: u64 = libc::CLONE_NEWNS as u64;

/// A running spawner as seen by the daemon.
#[derive(Debug)]
pub struct SpawnerProcess {
    /// Pid of the spawner.
    pub pid: libc::pid_t,
    /// pidfd of the spawner.
    pub pidfd: OwnedFd,
    /// The daemon's end of the initial connection.
    pub socket: OwnedFd,
}

/// Path of the scope cgroup for a process currently in `group`.
///
/// The parent cgroup must not contain processes once its children use
/// controllers, so the scope is a sibling of `group`.
fn scope_path(group: &str, name: &str, slice: Option<&str>) -> Result<String> {
    let scope = if name.ends_with(".scope") {
        name.to_owned()
    } else {
        format!("{name}.scope")
    };
    for component in std::iter::once(scope.as_str()).chain(slice) {
        if component.is_empty() || component == ".scope" || component.contains('/') || component.starts_with('.') {
            return Err(SpawnError::Config {
                message: format!("invalid cgroup name {component:?}"),
            });
        }
    }

    let group = group.trim_end_matches('/');
    let parent = group.rsplit_once('/').map_or("", |(parent, _)| parent);
    Ok(match slice {
        Some(slice) => format!("{parent}/{slice}/{scope}"),
        None => format!("{parent}/{scope}"),
    })
}

/// Creates the cgroup `name` (suffixed `.scope` if needed) next to the
/// calling process's own cgroup, optionally inside `slice`, and moves the
/// process into it.
///
/// This stands in for systemd's `StartTransientUnit`; it requires the
/// parent of the current cgroup to be delegated.
///
/// # Errors
///
/// Returns an error if the current cgroup cannot be determined or the
/// scope cannot be created or joined.
pub fn create_scope(name: &str, slice: Option<&str>) -> Result<CgroupState> {
    let current = CgroupState::from_process(None)?;
    if !current.is_enabled() {
        return Err(SpawnError::Config {
            message: "not running in a cgroup2 hierarchy".into(),
        });
    }
    let scope_path = scope_path(current.group_path(), name, slice)?;
    let directory: PathBuf = current.mount_path().join(scope_path.trim_start_matches('/'));

    std::fs::create_dir_all(&directory).map_err(|e| SpawnError::Io {
        path: directory.clone(),
        source: e,
    })?;
    let procs = directory.join("cgroup.procs");
    std::fs::write(&procs, b"0").map_err(|e| SpawnError::Io { path: procs, source: e })?;
    tracing::info!(scope = %scope_path, "created cgroup scope");

    CgroupState::from_group(current.mount_path(), &scope_path)
}

fn cgroup_state(config: &SpawnConfig) -> CgroupState {
    let state = match config.systemd_scope.as_deref() {
        Some(scope) => create_scope(scope, config.systemd_slice.as_deref()).or_else(|e| {
            tracing::warn!(scope, error = %e, "cannot create scope, staying in the current cgroup");
            CgroupState::from_process(None)
        }),
        None => CgroupState::from_process(None),
    };
    let state = match state {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(error = %e, "cgroups disabled");
            return CgroupState::default();
        }
    };
    if let Some(description) = &config.systemd_scope_description {
        tracing::info!(cgroup = state.group_path(), description = %description, "spawner cgroup");
    }
    if state.is_enabled() {
        if let Err(e) = controllers::enable_all_controllers(&state) {
            tracing::warn!(error = %e, "cannot enable cgroup controllers");
        }
    }
    state
}

fn os_error(operation: &'static str) -> impl FnOnce(nix::Error) -> SpawnError {
    move |e| SpawnError::Os {
        operation,
        source: e.into(),
    }
}

/// Makes the spawner's mounts private and gives it its own `/tmp`.
///
/// Only the first step is required; a missing `/tmp` is logged.
fn isolate_mounts() -> Result<()> {
    mount(None::<&str>, "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)
        .map_err(os_error("making / private"))?;
    let tmp = mount(
        Some("none"),
        "/tmp",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        Some("size=16M,nr_inodes=256,mode=0700"),
    );
    if let Err(e) = tmp {
        tracing::warn!(error = %e, "keeping the daemon's /tmp");
    }
    Ok(())
}

/// Mounts a `/proc` matching the spawner's PID namespace.
///
/// Children's `/proc/<pid>` entries, e.g. their uid/gid maps, are looked
/// up with pids of this namespace.
fn mount_proc() -> Result<()> {
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(os_error("mounting /proc"))
}

fn drop_privileges(config: &SpawnConfig) -> Result<()> {
    let ids = &config.spawner_uid_gid;
    if !ids.is_empty() {
        sys::set_keep_caps(true).map_err(|e| SpawnError::Os {
            operation: "PR_SET_KEEPCAPS",
            source: e,
        })?;
        uid_gid::apply(ids, true).map_err(|e| SpawnError::PermissionDenied { message: e.to_string() })?;
        sys::set_keep_caps(false).map_err(|e| SpawnError::Os {
            operation: "PR_SET_KEEPCAPS",
            source: e,
        })?;
    }
    capability::drop_capabilities(SPAWNER_CAPABILITIES)
}

/// Body of the spawner process; never returns.
///
/// `namespaces` are the `CLONE_NEW*` flags the spawner was cloned with.
fn run_spawner(config: SpawnConfig, socket: OwnedFd, namespaces: u64) -> ! {
    process_name::set(SPAWNER_PROCESS_NAME);

    if namespaces & NEWNS != 0 {
        let isolated = isolate_mounts();
        if namespaces & NEWPID != 0 {
            // Without a matching /proc, child pids would resolve to
            // unrelated processes of the daemon's namespace.
            if let Err(e) = isolated.and_then(|()| mount_proc()) {
                tracing::error!(error = %e, "cannot mount /proc for the spawner's PID namespace");
                sys::exit_immediately(1);
            }
        } else if let Err(e) = isolated {
            tracing::warn!(error = %e, "keeping the daemon's mount namespace setup");
        }
    }

    let cgroup_state = cgroup_state(&config);

    if let Err(e) = drop_privileges(&config) {
        tracing::warn!(error = %e, "cannot drop privileges");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "cannot create event loop");
            sys::exit_immediately(1);
        }
    };
    let server = SpawnServer::new(config, cgroup_state);
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, server.run(socket));
    sys::exit_immediately(0);
}

/// Returns `None` in the new process.
fn clone_spawner(flags: u64) -> std::io::Result<Option<(libc::pid_t, OwnedFd)>> {
    let mut pidfd: RawFd = -1;
    #[allow(clippy::cast_sign_loss)]
    let mut args = sys::CloneArgs {
        flags: sys::CLONE_PIDFD | flags,
        pidfd: std::ptr::from_mut(&mut pidfd) as u64,
        exit_signal: libc::SIGCHLD as u64,
        ..sys::CloneArgs::default()
    };
    // SAFETY: the caller is single-threaded, so the child may allocate;
    // `pidfd` outlives the call.
    let pid = unsafe { sys::clone3(&mut args) }?;
    if pid == 0 {
        return Ok(None);
    }
    // SAFETY: CLONE_PIDFD stored a fresh descriptor we now own.
    Ok(Some((pid, unsafe { OwnedFd::from_raw_fd(pidfd) })))
}

/// Starts the spawner.
///
/// Must be called while the process is still single-threaded, i.e.
/// before any multi-threaded runtime exists.
///
/// # Errors
///
/// Returns an error if the socket pair or the process cannot be created.
pub fn launch_spawner(config: SpawnConfig) -> Result<SpawnerProcess> {
    let (daemon_end, spawner_end) = sys::seqpacket_pair(false).map_err(|e| SpawnError::Os {
        operation: "socketpair",
        source: e,
    })?;

    let mut flags = NEWPID | NEWNS;
    let cloned = loop {
        match clone_spawner(flags) {
            Ok(cloned) => break cloned,
            Err(e) if flags != 0 && matches!(e.raw_os_error(), Some(libc::EINVAL | libc::EPERM)) => {
                tracing::debug!(flags, error = %e, "retrying spawner clone with fewer namespaces");
                flags = if flags & NEWPID != 0 { NEWNS } else { 0 };
            }
            Err(e) => {
                return Err(SpawnError::Os {
                    operation: "clone3",
                    source: e,
                });
            }
        }
    };
    let Some((pid, pidfd)) = cloned else {
        drop(daemon_end);
        run_spawner(config, spawner_end, flags);
    };

    drop(spawner_end);
    tracing::info!(pid, "launched spawner");
    Ok(SpawnerProcess {
        pid,
        pidfd,
        socket: daemon_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_is_a_sibling_of_the_current_group() {
        assert_eq!(
            scope_path("/system.slice/daemon.service", "spawn", None).unwrap(),
            "/system.slice/spawn.scope"
        );
        assert_eq!(
            scope_path("/system.slice/daemon.service", "spawn.scope", Some("workers.slice")).unwrap(),
            "/system.slice/workers.slice/spawn.scope"
        );
        assert_eq!(scope_path("/", "spawn", None).unwrap(), "/spawn.scope");
    }

    #[test]
    fn scope_names_are_single_components() {
        assert!(scope_path("/a/b", "../evil", None).is_err());
        assert!(scope_path("/a/b", "", None).is_err());
        assert!(scope_path("/a/b", "ok", Some("x/y")).is_err());
    }
}
