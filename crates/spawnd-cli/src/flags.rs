//! Command-line description of a child process.
//!
//! Shared by `spawnd run` and `spawnd spawn`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use spawnd_core::cgroup::CgroupOptions;
use spawnd_core::namespace::mount::{Mount, MountFlags, MountKind};
use spawnd_core::prepared::PreparedChildProcess;

/// Parses `KEY=VALUE`.
fn key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

/// Flags describing the child process.
#[allow(clippy::struct_excessive_bools)]
#[derive(Args, Debug, Default)]
pub struct SpawnFlags {
    /// Effective user id of the child.
    #[arg(long)]
    pub uid: Option<u32>,

    /// Effective group id of the child.
    #[arg(long)]
    pub gid: Option<u32>,

    /// Real user id, if different from `--uid`.
    #[arg(long)]
    pub real_uid: Option<u32>,

    /// Real group id, if different from `--gid`.
    #[arg(long)]
    pub real_gid: Option<u32>,

    /// Create a user namespace.
    #[arg(long)]
    pub userns: bool,

    /// Create a PID namespace, or join the named one.
    #[arg(long, value_name = "NAME", num_args = 0..=1, require_equals = true, default_missing_value = "")]
    pub pidns: Option<String>,

    /// Create a network namespace, or join the named one.
    #[arg(long, value_name = "NAME", num_args = 0..=1, require_equals = true, default_missing_value = "")]
    pub netns: Option<String>,

    /// Use an empty tmpfs as the new root.
    #[arg(long)]
    pub root_tmpfs: bool,

    /// Use this directory as the new root.
    #[arg(long, value_name = "PATH")]
    pub root: Option<PathBuf>,

    /// Mount a new `/proc`.
    #[arg(long)]
    pub mount_proc: bool,

    /// Mount a new `devpts` on `/dev/pts`.
    #[arg(long)]
    pub mount_pts: bool,

    /// Bind mount the host's `/dev/pts`.
    #[arg(long)]
    pub bind_mount_pts: bool,

    /// Bind mount a host directory (read-only).
    #[arg(long, value_name = "SRC=DST", value_parser = key_value)]
    pub bind_mount: Vec<(String, String)>,

    /// Mount a writable tmpfs.
    #[arg(long, value_name = "TARGET")]
    pub mount_tmpfs: Vec<PathBuf>,

    /// Mount the shared tmpfs NAME.
    #[arg(long, value_name = "NAME=TARGET", value_parser = key_value)]
    pub mount_named_tmpfs: Vec<(String, String)>,

    /// Run inside a new cgroup scope named NAME.
    #[arg(long, value_name = "NAME")]
    pub scope: Option<String>,

    /// Place the child in this cgroup.
    #[arg(long, value_name = "NAME")]
    pub cgroup: Option<String>,

    /// Session cgroup nested inside `--cgroup`.
    #[arg(long, value_name = "ID", requires = "cgroup")]
    pub cgroup_session: Option<String>,

    /// Write a controller setting of `--cgroup`.
    #[arg(long, value_name = "NAME=VALUE", value_parser = key_value, requires = "cgroup")]
    pub cgroup_set: Vec<(String, String)>,

    /// Program and its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

/// A spawn request built from [`SpawnFlags`].
#[derive(Debug)]
pub struct Request {
    /// What to spawn.
    pub process: PreparedChildProcess,
    /// Scope to create before spawning.
    pub scope: Option<String>,
    /// Cgroup of the child, if any.
    pub cgroup: Option<String>,
}

fn namespace(flag: Option<String>) -> (bool, Option<String>) {
    match flag {
        None => (false, None),
        Some(name) if name.is_empty() => (true, None),
        Some(name) => (true, Some(name)),
    }
}

fn resolve_program(program: &str) -> anyhow::Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    which::which(program).with_context(|| format!("{program}: command not found"))
}

impl SpawnFlags {
    /// Builds the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be found.
    pub fn into_request(self) -> anyhow::Result<Request> {
        let mut process = PreparedChildProcess::new();

        let program = self.command.first().context("no program given")?;
        process.exec_path = Some(resolve_program(program)?);
        process.args = self.command;
        process.env = std::env::vars_os()
            .filter_map(|(key, value)| Some(format!("{}={}", key.to_str()?, value.to_str()?)))
            .collect();

        process.uid_gid.uid = self.uid;
        process.uid_gid.gid = self.gid;
        process.uid_gid.real_uid = self.real_uid;
        process.uid_gid.real_gid = self.real_gid;

        let ns = &mut process.ns;
        ns.enable_user = self.userns;
        (ns.enable_pid, ns.pid_namespace) = namespace(self.pidns);
        (ns.enable_network, ns.network_namespace) = namespace(self.netns);

        let mount = &mut ns.mount;
        mount.mount_root_tmpfs = self.root_tmpfs;
        mount.pivot_root = self.root;
        mount.mount_proc = self.mount_proc;
        mount.mount_pts = self.mount_pts;
        mount.bind_mount_pts = self.bind_mount_pts;

        let read_only = MountFlags {
            exec: true,
            ..MountFlags::default()
        };
        let writable = MountFlags {
            writable: true,
            ..MountFlags::default()
        };
        for (source, target) in self.bind_mount {
            mount.mounts.push(Mount::new(
                MountKind::Bind {
                    source: source.into(),
                },
                target,
                read_only,
            ));
        }
        for target in self.mount_tmpfs {
            mount.mounts.push(Mount::new(MountKind::Tmpfs, target, writable));
        }
        for (name, target) in self.mount_named_tmpfs {
            mount.mounts.push(Mount::new(MountKind::NamedTmpfs { name }, target, writable));
        }

        if let Some(name) = &self.cgroup {
            let mut cgroup = CgroupOptions::new(name.clone());
            cgroup.session = self.cgroup_session;
            for (setting, value) in self.cgroup_set {
                cgroup.set(setting, value);
            }
            process.cgroup = Some(cgroup);
        }

        Ok(Request {
            process,
            scope: self.scope,
            cgroup: self.cgroup,
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        flags: SpawnFlags,
    }

    fn parse(args: &[&str]) -> SpawnFlags {
        Harness::try_parse_from(std::iter::once("spawnd").chain(args.iter().copied()))
            .unwrap()
            .flags
    }

    #[test]
    fn namespace_flags_take_optional_names() {
        let flags = parse(&["--pidns", "--netns=blue", "/bin/true"]);
        assert_eq!(flags.pidns.as_deref(), Some(""));
        assert_eq!(flags.netns.as_deref(), Some("blue"));
        assert_eq!(flags.command, ["/bin/true"]);

        let request = flags.into_request().unwrap();
        assert!(request.process.ns.enable_pid);
        assert!(request.process.ns.pid_namespace.is_none());
        assert_eq!(request.process.ns.network_namespace.as_deref(), Some("blue"));
    }

    #[test]
    fn program_arguments_are_not_flags() {
        let flags = parse(&["--uid=1000", "/bin/ls", "-l", "--all"]);
        assert_eq!(flags.uid, Some(1000));
        assert_eq!(flags.command, ["/bin/ls", "-l", "--all"]);
    }

    #[test]
    fn mounts_keep_their_order() {
        let request = parse(&[
            "--root-tmpfs",
            "--mount-tmpfs=/tmp",
            "--bind-mount=/usr=/usr",
            "--mount-named-tmpfs=shared=/shared",
            "/bin/true",
        ])
        .into_request()
        .unwrap();
        let mounts = &request.process.ns.mount.mounts;
        assert_eq!(mounts.len(), 3);
        assert!(matches!(mounts[0].kind, MountKind::Tmpfs));
        assert!(matches!(&mounts[1].kind, MountKind::Bind { source } if source == &PathBuf::from("/usr")));
        assert!(matches!(&mounts[2].kind, MountKind::NamedTmpfs { name } if name == "shared"));
        assert!(mounts[0].flags.writable && !mounts[1].flags.writable);
    }

    #[test]
    fn cgroup_settings_require_a_cgroup() {
        let parsed = Harness::try_parse_from(["spawnd", "--cgroup-set=pids.max=4", "/bin/true"]);
        assert!(parsed.is_err());

        let request = parse(&["--cgroup=job", "--cgroup-session=7", "--cgroup-set=pids.max=4", "/bin/true"])
            .into_request()
            .unwrap();
        let cgroup = request.process.cgroup.unwrap();
        assert_eq!(cgroup.name.as_deref(), Some("job"));
        assert_eq!(cgroup.session.as_deref(), Some("7"));
        assert_eq!(cgroup.set, [("pids.max".to_owned(), "4".to_owned())]);
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(key_value("novalue").is_err());
        assert!(key_value("=x").is_err());
        assert_eq!(key_value("a=b=c").unwrap(), ("a".to_owned(), "b=c".to_owned()));
    }
}
