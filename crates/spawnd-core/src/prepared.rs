//! The fully resolved description of one child process.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use spawnd_common::error::{Result, SpawnError};
use spawnd_common::types::{ResourceLimits, UidGid};

use crate::cgroup::CgroupOptions;
use crate::namespace::NamespaceOptions;
use crate::seccomp::SyscallFilter;

/// Everything needed to launch one child process.
///
/// Built by the caller (or decoded from the wire), consumed exactly once
/// by the spawn engine. Descriptors are owned and closed in the parent
/// after the spawn.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Default)]
pub struct PreparedChildProcess {
    /// Program to execute; defaults to `args[0]`.
    pub exec_path: Option<PathBuf>,
    /// Executable descriptor, run with `execveat(AT_EMPTY_PATH)`.
    pub exec_fd: Option<OwnedFd>,
    /// Run this function in the child instead of `execve()`; its return
    /// value becomes the exit code. Cannot be sent over the wire.
    pub exec_function: Option<fn() -> i32>,
    /// Argument vector including `argv[0]`.
    pub args: Vec<String>,
    /// Environment as `NAME=value` strings.
    pub env: Vec<String>,

    /// Becomes fd 0.
    pub stdin: Option<OwnedFd>,
    /// Becomes fd 1.
    pub stdout: Option<OwnedFd>,
    /// Becomes fd 2.
    pub stderr: Option<OwnedFd>,
    /// Becomes fd 3.
    pub control: Option<OwnedFd>,
    /// File opened as stderr after namespaces and ids are set up, if no
    /// `stderr` descriptor was given.
    pub stderr_path: Option<PathBuf>,

    /// Socket receiving a duplicate of the child's stderr.
    pub return_stderr: Option<OwnedFd>,
    /// Socket receiving a pidfd of the child.
    pub return_pidfd: Option<OwnedFd>,
    /// Socket receiving the child's cgroup directory descriptor.
    pub return_cgroup: Option<OwnedFd>,

    /// File creation mask.
    pub umask: Option<u16>,
    /// Allocate the stdin terminal as controlling TTY.
    pub tty: bool,
    /// Start a new session.
    pub session: bool,
    /// Send stdout/stderr to the systemd journal unless redirected.
    pub journal: bool,

    /// Use `SCHED_IDLE`.
    pub sched_idle: bool,
    /// Use the idle I/O scheduling class.
    pub ioprio_idle: bool,
    /// Nice value.
    pub priority: i32,
    /// Set `PR_SET_NO_NEW_PRIVS`.
    pub no_new_privs: bool,
    /// Optional seccomp restrictions.
    pub syscall_filter: SyscallFilter,

    /// Cgroup to create the child in.
    pub cgroup: Option<CgroupOptions>,
    /// Namespaces and filesystem layout.
    pub ns: NamespaceOptions,
    /// Resource limits.
    pub rlimits: ResourceLimits,
    /// Target identity.
    pub uid_gid: UidGid,

    /// `chroot()` into this directory after namespace setup.
    pub chroot: Option<PathBuf>,
    /// Working directory.
    pub chdir: Option<PathBuf>,
    /// Opaque data for a spawn hook's verifier.
    pub hook_info: Option<String>,
}

impl PreparedChildProcess {
    /// Creates an empty description.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one argument.
    pub fn append_arg(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    /// Sets an environment variable, replacing an earlier value.
    pub fn set_env(&mut self, name: &str, value: &str) {
        let prefix = format!("{name}=");
        self.env.retain(|entry| !entry.starts_with(&prefix));
        self.env.push(format!("{prefix}{value}"));
    }

    /// Looks up an environment variable.
    #[must_use]
    pub fn get_env(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find_map(|entry| entry.strip_prefix(name)?.strip_prefix('='))
    }

    /// Returns `true` if the child gets its own root filesystem.
    #[must_use]
    pub fn is_jailed(&self) -> bool {
        self.ns.mount.has_new_root() || self.chroot.is_some()
    }

    /// Rejects combinations that cannot be spawned or sent to a spawner.
    ///
    /// # Errors
    ///
    /// Returns an error for cgroup options without a cgroup name.
    pub fn check(&self) -> Result<()> {
        self.cgroup.as_ref().map_or(Ok(()), CgroupOptions::check)
    }

    /// Fills in defaults before spawning: the executable defaults to
    /// `args[0]` and an empty argument vector gets the executable path.
    ///
    /// # Errors
    ///
    /// Returns an error if there is nothing to execute or [`Self::check`]
    /// fails.
    pub fn finish(&mut self) -> Result<()> {
        self.check()?;
        if self.exec_function.is_some() || self.exec_fd.is_some() {
            return Ok(());
        }
        match (&self.exec_path, self.args.first()) {
            (Some(path), None) => {
                let arg0 = path.to_string_lossy().into_owned();
                self.args.push(arg0);
            }
            (None, Some(arg0)) => self.exec_path = Some(PathBuf::from(arg0)),
            (None, None) => {
                return Err(SpawnError::Config {
                    message: "no program to execute".into(),
                });
            }
            (Some(_), Some(_)) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_takes_program_from_args() {
        let mut p = PreparedChildProcess::new();
        p.append_arg("/bin/true");
        p.finish().expect("finish");
        assert_eq!(p.exec_path, Some(PathBuf::from("/bin/true")));
    }

    #[test]
    fn finish_adds_argv0() {
        let mut p = PreparedChildProcess {
            exec_path: Some(PathBuf::from("/bin/sh")),
            ..PreparedChildProcess::default()
        };
        p.finish().expect("finish");
        assert_eq!(p.args, vec!["/bin/sh".to_owned()]);
    }

    #[test]
    fn finish_without_program_fails() {
        assert!(PreparedChildProcess::new().finish().is_err());
    }

    #[test]
    fn set_env_replaces_value() {
        let mut p = PreparedChildProcess::new();
        p.set_env("PATH", "/bin");
        p.set_env("PATH", "/usr/bin");
        p.set_env("HOME", "/root");
        assert_eq!(p.get_env("PATH"), Some("/usr/bin"));
        assert_eq!(p.env.len(), 2);
        assert_eq!(p.get_env("PAT"), None);
    }

    #[test]
    fn orphaned_cgroup_session_is_rejected() {
        let mut p = PreparedChildProcess::new();
        p.append_arg("/bin/true");
        p.cgroup = Some(CgroupOptions {
            session: Some("7".into()),
            ..CgroupOptions::default()
        });
        assert!(p.check().is_err());
        assert!(p.finish().is_err());
    }

    #[test]
    fn pivot_root_makes_child_jailed() {
        let mut p = PreparedChildProcess::new();
        assert!(!p.is_jailed());
        p.ns.mount.mount_root_tmpfs = true;
        assert!(p.is_jailed());
    }
}
