//! Linux namespace configuration for child processes.
//!
//! [`NamespaceOptions`] describes which namespaces a child gets. Fresh
//! namespaces are requested through `clone3()` flags; named network and
//! PID namespaces are joined by the parent around the `clone3()` call with
//! a [`NamespaceSwitch`].

pub mod mount;
pub mod network;
pub mod pid;
pub mod user;
pub mod uts;

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

use nix::sched::CloneFlags;
use spawnd_common::error::{Result, SpawnError};

use self::mount::MountNamespaceOptions;

/// Which namespaces to create or join for a child process.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Default)]
pub struct NamespaceOptions {
    /// Create a new user namespace.
    pub enable_user: bool,
    /// Map root inside the user namespace to root outside.
    pub map_root: bool,
    /// Uid the child's effective uid maps to inside the user namespace.
    pub mapped_uid: Option<u32>,
    /// Create a new PID namespace.
    pub enable_pid: bool,
    /// Join this named PID namespace instead of creating one.
    pub pid_namespace: Option<String>,
    /// Create a new cgroup namespace.
    pub enable_cgroup: bool,
    /// Create a new, empty network namespace.
    pub enable_network: bool,
    /// Join this named network namespace instead of creating one.
    pub network_namespace: Option<String>,
    /// Create a new IPC namespace.
    pub enable_ipc: bool,
    /// Create a new UTS namespace with this hostname.
    pub hostname: Option<String>,
    /// Mount namespace layout.
    pub mount: MountNamespaceOptions,
}

impl NamespaceOptions {
    /// Returns `true` if a new PID namespace is created (not joined).
    #[must_use]
    pub const fn creates_pid_namespace(&self) -> bool {
        self.enable_pid && self.pid_namespace.is_none()
    }

    /// Returns `true` if `unshare(CLONE_NEWUSER)` is left to the child.
    ///
    /// A caller with `CAP_SYS_ADMIN` creates the PID and network namespaces
    /// while still privileged in the initial user namespace, so the user
    /// namespace comes after them.
    #[must_use]
    pub const fn postpones_user_namespace(&self, has_sys_admin: bool) -> bool {
        self.enable_user
            && has_sys_admin
            && (self.creates_pid_namespace()
                || (self.enable_network && self.network_namespace.is_none()))
    }

    /// Flags passed to `clone3()`.
    #[must_use]
    pub fn clone_flags(&self, postpone_user: bool) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.enable_user && !postpone_user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.creates_pid_namespace() {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.enable_cgroup {
            flags |= CloneFlags::CLONE_NEWCGROUP;
        }
        if self.enable_network && self.network_namespace.is_none() {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.enable_ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.hostname.is_some() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.mount.is_enabled() {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        flags
    }

    /// Opens the named namespaces to join around `clone3()`.
    ///
    /// # Errors
    ///
    /// Returns an error if a named namespace does not exist.
    pub fn open_named(&self) -> Result<NamedNamespaces> {
        Ok(NamedNamespaces {
            network: self
                .network_namespace
                .as_deref()
                .map(network::open_named)
                .transpose()?,
            pid: self
                .pid_namespace
                .as_deref()
                .map(pid::open_named)
                .transpose()?,
        })
    }
}

/// Open handles of named namespaces a child joins.
#[derive(Debug, Default)]
pub struct NamedNamespaces {
    /// Network namespace file.
    pub network: Option<OwnedFd>,
    /// PID namespace file.
    pub pid: Option<OwnedFd>,
}

impl NamedNamespaces {
    /// Moves the calling thread into the named namespaces.
    ///
    /// The returned switches move it back when dropped, so they must live
    /// until `clone3()` has returned.
    ///
    /// # Errors
    ///
    /// Returns an error if `setns(2)` fails.
    pub fn enter(&self) -> Result<Vec<NamespaceSwitch>> {
        let mut switches = Vec::with_capacity(2);
        if let Some(fd) = &self.network {
            switches.push(NamespaceSwitch::enter(fd.as_fd(), CloneFlags::CLONE_NEWNET)?);
        }
        if let Some(fd) = &self.pid {
            switches.push(NamespaceSwitch::enter(fd.as_fd(), CloneFlags::CLONE_NEWPID)?);
        }
        Ok(switches)
    }
}

/// The calling thread's temporary membership in another namespace.
#[derive(Debug)]
pub struct NamespaceSwitch {
    original: OwnedFd,
    kind: CloneFlags,
}

impl NamespaceSwitch {
    /// Enters the namespace behind `target`.
    ///
    /// For PID namespaces only children created afterwards are affected.
    ///
    /// # Errors
    ///
    /// Returns an error if the current namespace cannot be opened or
    /// `setns(2)` fails.
    pub fn enter(target: BorrowedFd<'_>, kind: CloneFlags) -> Result<Self> {
        let own = if kind == CloneFlags::CLONE_NEWPID {
            "/proc/thread-self/ns/pid_for_children"
        } else {
            "/proc/thread-self/ns/net"
        };
        let original = open_namespace_file(Path::new(own))?;
        nix::sched::setns(target, kind).map_err(|e| SpawnError::Os {
            operation: "setns",
            source: e.into(),
        })?;
        Ok(Self { original, kind })
    }
}

impl Drop for NamespaceSwitch {
    fn drop(&mut self) {
        if let Err(e) = nix::sched::setns(self.original.as_fd(), self.kind) {
            tracing::error!(error = %e, kind = ?self.kind, "failed to restore namespace");
        }
    }
}

fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(SpawnError::Config {
            message: format!("invalid {kind} name: {name:?}"),
        });
    }
    Ok(())
}

fn open_namespace_file(path: &Path) -> Result<OwnedFd> {
    match std::fs::File::open(path) {
        Ok(file) => Ok(OwnedFd::from(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SpawnError::NotFound {
            kind: "namespace",
            id: path.display().to_string(),
        }),
        Err(e) => Err(SpawnError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_need_no_flags() {
        assert!(NamespaceOptions::default().clone_flags(false).is_empty());
    }

    #[test]
    fn named_namespaces_are_not_created() {
        let options = NamespaceOptions {
            enable_pid: true,
            pid_namespace: Some("worker".into()),
            enable_network: true,
            network_namespace: Some("blue".into()),
            ..NamespaceOptions::default()
        };
        let flags = options.clone_flags(false);
        assert!(!flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!options.creates_pid_namespace());
    }

    #[test]
    fn hostname_implies_uts_namespace() {
        let options = NamespaceOptions {
            hostname: Some("sandbox".into()),
            ..NamespaceOptions::default()
        };
        assert!(options.clone_flags(false).contains(CloneFlags::CLONE_NEWUTS));
    }

    #[test]
    fn user_namespace_postponed_only_for_privileged_callers() {
        let options = NamespaceOptions {
            enable_user: true,
            enable_pid: true,
            ..NamespaceOptions::default()
        };
        assert!(options.postpones_user_namespace(true));
        assert!(!options.postpones_user_namespace(false));
        assert!(!options.clone_flags(true).contains(CloneFlags::CLONE_NEWUSER));
        assert!(options.clone_flags(false).contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn user_namespace_alone_is_never_postponed() {
        let options = NamespaceOptions {
            enable_user: true,
            ..NamespaceOptions::default()
        };
        assert!(!options.postpones_user_namespace(true));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(validate_name("network namespace", "a/b").is_err());
        assert!(validate_name("network namespace", "..").is_err());
        assert!(validate_name("network namespace", "blue").is_ok());
    }
}
