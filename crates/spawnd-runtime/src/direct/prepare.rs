//! Everything the child needs, resolved in the parent before `clone3()`.
//!
//! The child must not allocate, so every string is converted to a C string
//! here, the mount plan and seccomp program are assembled here, and the
//! argument vectors are built as NULL-terminated pointer arrays.

use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::path::Path;

use nix::unistd::{getegid, geteuid};
use spawnd_common::error::{Result, SpawnError};
use spawnd_common::types::{ResourceLimits, UidGid};
use spawnd_core::capability::{self, Capability};
use spawnd_core::cgroup::CgroupState;
use spawnd_core::filesystem::{MountPlan, NamedTmpfsResolver};
use spawnd_core::filesystem::plan::c_path;
use spawnd_core::namespace::user::IdMapping;
use spawnd_core::namespace::NamespaceOptions;
use spawnd_core::prepared::PreparedChildProcess;
use spawnd_core::seccomp::SeccompProgram;
use spawnd_core::uid_gid;

use crate::journal;

/// What the child finally runs.
#[derive(Debug)]
pub(crate) enum Executable {
    Path(CString),
    Fd(OwnedFd),
    Function(fn() -> i32),
}

/// How the user namespace is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UserNamespaceMode {
    /// No new user namespace.
    None,
    /// `clone3()` creates it; the parent writes the id maps before the
    /// child continues.
    Cloned,
    /// The child unshares it after the privileged setup; the parent then
    /// writes the id maps and applies resource limits.
    Postponed,
}

/// Uid/gid maps written by the parent.
#[derive(Debug, Clone)]
pub(crate) struct IdMaps {
    pub uid: IdMapping,
    pub gid: IdMapping,
    /// Supplementary groups mapped into the namespace.
    pub groups: Vec<u32>,
    /// The parent lacks `CAP_SETGID` and must deny `setgroups` first.
    pub deny_setgroups: bool,
}

/// Capabilities of the spawning process that change the plan.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Privileges {
    /// `CAP_SYS_ADMIN`: user namespaces may be postponed.
    pub sys_admin: bool,
    /// `CAP_SETGID`: `gid_map` may be written with `setgroups` allowed.
    pub setgid: bool,
}

impl Privileges {
    pub fn current() -> Self {
        Self {
            sys_admin: capability::has_effective(Capability::SysAdmin),
            setgid: capability::has_effective(Capability::Setgid),
        }
    }
}

/// C strings plus the pointer array `execve()` expects.
#[derive(Debug, Default)]
pub(crate) struct CStringVec {
    _storage: Vec<CString>,
    pointers: Vec<*const libc::c_char>,
}

impl CStringVec {
    fn new(strings: &[String], what: &str) -> Result<Self> {
        let storage = strings
            .iter()
            .map(|s| c_string(s, what))
            .collect::<Result<Vec<_>>>()?;
        let mut pointers: Vec<_> = storage.iter().map(|s| s.as_ptr()).collect();
        pointers.push(std::ptr::null());
        Ok(Self {
            _storage: storage,
            pointers,
        })
    }

    /// NULL-terminated pointer array.
    pub fn as_ptrs(&self) -> &[*const libc::c_char] {
        &self.pointers
    }
}

/// The resolved child description.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug)]
pub(crate) struct ChildPlan {
    pub executable: Executable,
    pub argv: CStringVec,
    pub envp: CStringVec,

    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    pub control: Option<OwnedFd>,
    pub stderr_path: Option<CString>,
    pub journal: Option<OwnedFd>,
    pub return_stderr: Option<OwnedFd>,
    pub return_pidfd: Option<OwnedFd>,
    pub return_cgroup: Option<OwnedFd>,

    pub umask: Option<u16>,
    pub tty: bool,
    pub session: bool,
    pub sched_idle: bool,
    pub ioprio_idle: bool,
    pub priority: i32,
    pub no_new_privs: bool,
    pub seccomp: SeccompProgram,
    pub seccomp_strict: bool,

    pub jailed: bool,
    pub hostname: Option<CString>,
    pub mounts: MountPlan,
    pub chroot: Option<CString>,
    pub chdir: Option<CString>,
    pub spawn_init: bool,

    pub rlimits: ResourceLimits,
    pub user_namespace: UserNamespaceMode,
    pub id_maps: Option<IdMaps>,
    /// Ids the child switches to, in its own user namespace.
    pub ids: UidGid,
    pub set_groups: bool,
    /// Supplementary groups set before a postponed user namespace is
    /// created, while the child still holds `CAP_SETGID`.
    pub outer_groups: Option<Vec<u32>>,
    pub apply_ids: bool,

    /// `CLONE_*` namespace flags for `clone3()`.
    pub clone_flags: nix::sched::CloneFlags,
    /// Target cgroup for `CLONE_INTO_CGROUP`.
    pub cgroup_fd: Option<OwnedFd>,
}

impl ChildPlan {
    /// Returns `true` if the child applies resource limits itself.
    pub const fn rlimits_in_child(&self) -> bool {
        !matches!(self.user_namespace, UserNamespaceMode::Postponed)
    }

    /// Returns `true` if the ids are switched before the mount setup.
    pub const fn ids_early(&self) -> bool {
        matches!(self.user_namespace, UserNamespaceMode::Cloned)
    }
}

fn c_string(value: &str, what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| SpawnError::Config {
        message: format!("{what} contains a NUL byte"),
    })
}

fn c_opt_path(path: Option<&Path>) -> Result<Option<CString>> {
    path.map(c_path).transpose()
}

fn id_maps(ns: &NamespaceOptions, ids: &UidGid, groups: Vec<u32>, deny_setgroups: bool) -> IdMaps {
    let uid_outside = ids.uid.unwrap_or_else(|| geteuid().as_raw());
    let gid_outside = ids.gid.unwrap_or_else(|| getegid().as_raw());
    IdMaps {
        uid: IdMapping {
            outside: uid_outside,
            inside: ns.mapped_uid.unwrap_or(uid_outside),
            real: ids.real_uid.filter(|&real| real != uid_outside),
            map_root: ns.map_root,
        },
        gid: IdMapping {
            outside: gid_outside,
            inside: gid_outside,
            real: ids.real_gid.filter(|&real| real != gid_outside),
            map_root: ns.map_root,
        },
        groups,
        deny_setgroups,
    }
}

fn translate_ids(maps: &IdMaps, ids: &UidGid) -> UidGid {
    UidGid {
        uid: Some(maps.uid.inside),
        gid: Some(maps.gid.inside),
        real_uid: ids.real_uid.and_then(|id| maps.uid.translate(id)),
        real_gid: ids.real_gid.and_then(|id| maps.gid.translate(id)),
        groups: maps.groups.iter().map(|&group| maps.gid.translate_group(group)).collect(),
    }
}

/// Ids as the child applies them.
struct ChildIds {
    maps: Option<IdMaps>,
    ids: UidGid,
    set_groups: bool,
    apply: bool,
    outer_groups: Option<Vec<u32>>,
}

/// Decides where the requested supplementary groups are set.
///
/// Without a user namespace they are applied with the ids. A postponed
/// namespace gets them before `unshare()`. A cloned one maps them when the
/// parent may write an unrestricted `gid_map`; otherwise `setgroups` is
/// denied and only an empty request can be honoured.
fn child_ids(mode: UserNamespaceMode, ns: &NamespaceOptions, requested: &UidGid, privileges: Privileges) -> Result<ChildIds> {
    Ok(match mode {
        UserNamespaceMode::None => ChildIds {
            maps: None,
            ids: requested.clone(),
            set_groups: true,
            apply: !requested.is_empty() && !uid_gid::is_nop(requested),
            outer_groups: None,
        },
        UserNamespaceMode::Postponed => {
            let maps = id_maps(ns, requested, Vec::new(), !privileges.setgid);
            ChildIds {
                ids: translate_ids(&maps, requested),
                maps: Some(maps),
                set_groups: false,
                apply: true,
                outer_groups: Some(requested.groups.clone()),
            }
        }
        UserNamespaceMode::Cloned if privileges.setgid => {
            let maps = id_maps(ns, requested, requested.groups.clone(), false);
            ChildIds {
                ids: translate_ids(&maps, requested),
                maps: Some(maps),
                set_groups: true,
                apply: true,
                outer_groups: None,
            }
        }
        UserNamespaceMode::Cloned => {
            if !requested.groups.is_empty() {
                return Err(SpawnError::PermissionDenied {
                    message: "supplementary groups in a user namespace require CAP_SETGID".into(),
                });
            }
            let maps = id_maps(ns, requested, Vec::new(), true);
            ChildIds {
                ids: translate_ids(&maps, requested),
                maps: Some(maps),
                set_groups: false,
                apply: true,
                outer_groups: None,
            }
        }
    })
}

fn journal_identifier(args: &[String]) -> &str {
    args.first()
        .and_then(|arg0| arg0.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("spawn")
}

/// Resolves `process` into a [`ChildPlan`].
///
/// `privileges` decide how the user namespace is set up.
///
/// # Errors
///
/// Returns an error if a string contains a NUL byte, the mount layout is
/// invalid, a cgroup cannot be created or a named tmpfs cannot be set up.
pub(crate) fn prepare(
    mut process: PreparedChildProcess,
    cgroup_state: &CgroupState,
    named_tmpfs: Option<&dyn NamedTmpfsResolver>,
    privileges: Privileges,
) -> Result<ChildPlan> {
    process.finish()?;

    let executable = if let Some(function) = process.exec_function {
        Executable::Function(function)
    } else if let Some(fd) = process.exec_fd.take() {
        Executable::Fd(fd)
    } else {
        let path = process.exec_path.as_deref().ok_or_else(|| SpawnError::Config {
            message: "no program to execute".into(),
        })?;
        Executable::Path(c_path(path)?)
    };

    let ns = &process.ns;
    let user_namespace = if !ns.enable_user {
        UserNamespaceMode::None
    } else if ns.postpones_user_namespace(privileges.sys_admin) {
        UserNamespaceMode::Postponed
    } else {
        UserNamespaceMode::Cloned
    };
    let clone_flags = ns.clone_flags(user_namespace == UserNamespaceMode::Postponed);

    let child = child_ids(user_namespace, ns, &process.uid_gid, privileges)?;

    let hostname = ns.hostname.as_deref().map(|h| c_string(h, "hostname")).transpose()?;
    let spawn_init = ns.creates_pid_namespace();
    let jailed = process.is_jailed();

    let cgroup_fd = match &process.cgroup {
        Some(cgroup) if cgroup.is_defined() => Some(cgroup.create2(cgroup_state)?),
        _ => None,
    };
    if process.return_cgroup.is_some() && cgroup_fd.is_none() {
        return Err(SpawnError::Config {
            message: "cannot return a cgroup without a cgroup name".into(),
        });
    }

    let journal = if process.journal && (process.stdout.is_none() || process.stderr.is_none()) {
        match journal::connect(journal_identifier(&process.args)) {
            Ok(fd) => Some(fd),
            Err(e) => {
                tracing::warn!(error = %e, "journal unavailable, keeping inherited output");
                None
            }
        }
    } else {
        None
    };

    let mount_options = std::mem::take(&mut process.ns.mount);
    let mounts = MountPlan::build(mount_options, named_tmpfs)?;

    Ok(ChildPlan {
        executable,
        argv: CStringVec::new(&process.args, "argument")?,
        envp: CStringVec::new(&process.env, "environment variable")?,
        stdin: process.stdin,
        stdout: process.stdout,
        stderr: process.stderr,
        control: process.control,
        stderr_path: c_opt_path(process.stderr_path.as_deref())?,
        journal,
        return_stderr: process.return_stderr,
        return_pidfd: process.return_pidfd,
        return_cgroup: process.return_cgroup,
        umask: process.umask,
        tty: process.tty,
        session: process.session,
        sched_idle: process.sched_idle,
        ioprio_idle: process.ioprio_idle,
        priority: process.priority,
        no_new_privs: process.no_new_privs,
        seccomp: process.syscall_filter.program(),
        seccomp_strict: process.syscall_filter.is_strict(),
        jailed,
        hostname,
        mounts,
        chroot: c_opt_path(process.chroot.as_deref())?,
        chdir: c_opt_path(process.chdir.as_deref())?,
        spawn_init,
        rlimits: process.rlimits,
        user_namespace,
        id_maps: child.maps,
        ids: child.ids,
        set_groups: child.set_groups,
        outer_groups: child.outer_groups,
        apply_ids: child.apply,
        clone_flags,
        cgroup_fd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVILEGED: Privileges = Privileges {
        sys_admin: true,
        setgid: true,
    };

    fn privileges(privileged: bool) -> Privileges {
        if privileged { PRIVILEGED } else { Privileges::default() }
    }

    fn plan(process: PreparedChildProcess, privileged: bool) -> ChildPlan {
        prepare(process, &CgroupState::default(), None, privileges(privileged)).expect("prepare")
    }

    fn true_process() -> PreparedChildProcess {
        let mut p = PreparedChildProcess::new();
        p.append_arg("/bin/true");
        p
    }

    #[test]
    fn argv_is_null_terminated() {
        let mut p = true_process();
        p.append_arg("--flag");
        let plan = plan(p, false);
        assert_eq!(plan.argv.as_ptrs().len(), 3);
        assert!(plan.argv.as_ptrs()[2].is_null());
        assert_eq!(plan.envp.as_ptrs().len(), 1);
        assert!(matches!(plan.executable, Executable::Path(ref p) if p.as_c_str() == c"/bin/true"));
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        let mut p = true_process();
        p.append_arg("a\0b");
        assert!(prepare(p, &CgroupState::default(), None, Privileges::default()).is_err());
    }

    #[test]
    fn user_namespace_is_postponed_for_privileged_pid_namespace() {
        let mut p = true_process();
        p.ns.enable_user = true;
        p.ns.enable_pid = true;
        let privileged = plan(p, true);
        assert_eq!(privileged.user_namespace, UserNamespaceMode::Postponed);
        assert!(!privileged.rlimits_in_child());
        assert!(privileged.spawn_init);
        assert!(!privileged.clone_flags.contains(nix::sched::CloneFlags::CLONE_NEWUSER));

        let mut p = true_process();
        p.ns.enable_user = true;
        p.ns.enable_pid = true;
        let unprivileged = plan(p, false);
        assert_eq!(unprivileged.user_namespace, UserNamespaceMode::Cloned);
        assert!(unprivileged.ids_early());
        assert!(unprivileged.clone_flags.contains(nix::sched::CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn mapped_uid_translates_child_ids() {
        let mut p = true_process();
        p.ns.enable_user = true;
        p.ns.mapped_uid = Some(0);
        p.uid_gid = UidGid::new(1000, 100);
        let plan = plan(p, false);
        let maps = plan.id_maps.expect("maps");
        assert_eq!(maps.uid.to_map_content(), "0 1000 1\n");
        assert_eq!(maps.gid.to_map_content(), "100 100 1\n");
        assert_eq!(plan.ids.uid, Some(0));
        assert_eq!(plan.ids.gid, Some(100));
        assert!(!plan.set_groups);
    }

    #[test]
    fn postponed_namespace_sets_groups_before_unshare() {
        let mut p = true_process();
        p.ns.enable_user = true;
        p.ns.enable_pid = true;
        p.uid_gid = UidGid::new(1000, 100);
        p.uid_gid.groups = vec![27, 44];
        let plan = plan(p, true);
        assert_eq!(plan.outer_groups.as_deref(), Some(&[27, 44][..]));
        assert!(!plan.set_groups);
        let maps = plan.id_maps.expect("maps");
        assert!(!maps.deny_setgroups);
    }

    #[test]
    fn postponed_namespace_clears_groups_when_none_requested() {
        let mut p = true_process();
        p.ns.enable_user = true;
        p.ns.enable_pid = true;
        let plan = plan(p, true);
        assert_eq!(plan.outer_groups.as_deref(), Some(&[][..]));
    }

    #[test]
    fn privileged_cloned_namespace_maps_groups() {
        let mut p = true_process();
        p.ns.enable_user = true;
        p.uid_gid = UidGid::new(1000, 100);
        p.uid_gid.groups = vec![27];
        let plan = plan(p, true);
        assert_eq!(plan.user_namespace, UserNamespaceMode::Cloned);
        assert!(plan.set_groups);
        assert_eq!(plan.ids.groups, [27]);
        let maps = plan.id_maps.expect("maps");
        assert!(!maps.deny_setgroups);
        assert_eq!(maps.gid.to_map_content_with(&maps.groups), "100 100 1\n27 27 1\n");
    }

    #[test]
    fn unprivileged_namespace_cannot_take_groups() {
        let mut p = true_process();
        p.ns.enable_user = true;
        p.uid_gid.groups = vec![27];
        let err = prepare(p, &CgroupState::default(), None, Privileges::default()).unwrap_err();
        assert!(matches!(err, SpawnError::PermissionDenied { .. }));

        let mut p = true_process();
        p.ns.enable_user = true;
        let plan = plan(p, false);
        assert!(plan.id_maps.expect("maps").deny_setgroups);
        assert!(!plan.set_groups);
    }

    #[test]
    fn empty_ids_are_not_applied_without_user_namespace() {
        let plan = plan(true_process(), false);
        assert!(!plan.apply_ids);
        assert_eq!(plan.user_namespace, UserNamespaceMode::None);
    }

    #[test]
    fn returning_cgroup_requires_a_cgroup() {
        let mut p = true_process();
        let (_r, w) = spawnd_core::sys::pipe().expect("pipe");
        p.return_cgroup = Some(w);
        assert!(prepare(p, &CgroupState::default(), None, Privileges::default()).is_err());
    }

    #[test]
    fn journal_identifier_uses_basename() {
        assert_eq!(journal_identifier(&["/usr/bin/worker".into()]), "worker");
        assert_eq!(journal_identifier(&[]), "spawn");
        assert_eq!(journal_identifier(&["dir/".into()]), "spawn");
    }
}
