//! Encoding of a [`PreparedChildProcess`] as an `EXEC` command stream.
//!
//! Only fields that differ from their default are written. Repeated
//! records (arguments, environment, mounts, limits, cgroup settings) keep
//! their stream order.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use spawnd_common::constants::{MAX_ARGS, MAX_ENV, MAX_GROUPS};
use spawnd_common::error::{Result, SpawnError};
use spawnd_common::types::{ResourceLimit, UidGid};
use spawnd_core::cgroup::CgroupOptions;
use spawnd_core::namespace::mount::{Mount, MountFlags, MountKind};
use spawnd_core::prepared::PreparedChildProcess;

use crate::builder::Serializer;
use crate::commands::ExecCommand;
use crate::payload::{Payload, ReceivedFds};

/// Wire value of an unset resource limit.
const RLIMIT_UNDEFINED: u64 = u64::MAX - 1;

/// Wire value of an unset id.
const ID_UNSET: u32 = u32::MAX;

fn write_path(s: &mut Serializer, path: &Path) -> Result<()> {
    s.write_cstr(path.as_os_str().as_bytes())
}

fn write_tagged_path(s: &mut Serializer, tag: ExecCommand, path: Option<&PathBuf>) -> Result<()> {
    match path {
        Some(path) => {
            s.write_tag(tag)?;
            write_path(s, path)
        }
        None => Ok(()),
    }
}

fn write_tagged_str(s: &mut Serializer, tag: ExecCommand, value: Option<&String>) -> Result<()> {
    match value {
        Some(value) => s.write_tagged_str(tag, value),
        None => Ok(()),
    }
}

fn write_flag(s: &mut Serializer, tag: ExecCommand, value: bool) -> Result<()> {
    if value { s.write_tag(tag) } else { Ok(()) }
}

fn write_fd(s: &mut Serializer, tag: ExecCommand, fd: Option<std::os::fd::OwnedFd>) -> Result<()> {
    match fd {
        Some(fd) => s.write_tagged_fd(tag, fd),
        None => Ok(()),
    }
}

fn write_mount(s: &mut Serializer, mount: Mount) -> Result<()> {
    let Mount {
        kind,
        target,
        flags,
    } = mount;
    match kind {
        MountKind::Bind { source } => {
            s.write_tag(ExecCommand::BindMount)?;
            write_path(s, &source)?;
        }
        MountKind::BindFile { source } => {
            s.write_tag(ExecCommand::BindMountFile)?;
            write_path(s, &source)?;
        }
        MountKind::BindFd { fd } => s.write_tagged_fd(ExecCommand::FdBindMount, fd)?,
        MountKind::BindFdFile { fd } => s.write_tagged_fd(ExecCommand::FdBindMountFile, fd)?,
        MountKind::Tmpfs => s.write_tag(ExecCommand::MountTmpfs)?,
        MountKind::NamedTmpfs { name } => s.write_tagged_str(ExecCommand::MountNamedTmpfs, &name)?,
        MountKind::WriteFile { contents } => {
            s.write_tag(ExecCommand::WriteFile)?;
            write_path(s, &target)?;
            return s.write_str(&contents);
        }
        MountKind::Symlink { link_target } => {
            s.write_tag(ExecCommand::Symlink)?;
            write_path(s, &link_target)?;
            return write_path(s, &target);
        }
    }
    write_path(s, &target)?;
    s.write_u8(flags.to_bits())
}

fn write_uid_gid(s: &mut Serializer, uid_gid: &UidGid) -> Result<()> {
    if *uid_gid == UidGid::default() {
        return Ok(());
    }
    s.write_tag(ExecCommand::UidGid)?;
    for id in [uid_gid.uid, uid_gid.gid, uid_gid.real_uid, uid_gid.real_gid] {
        s.write_u32(id.unwrap_or(ID_UNSET))?;
    }
    let count = u8::try_from(uid_gid.groups.len())
        .ok()
        .filter(|&n| usize::from(n) <= MAX_GROUPS)
        .ok_or_else(|| SpawnError::malformed("too many supplementary groups"))?;
    s.write_u8(count)?;
    for &gid in &uid_gid.groups {
        s.write_u32(gid)?;
    }
    Ok(())
}

fn write_cgroup(s: &mut Serializer, cgroup: &CgroupOptions) -> Result<()> {
    cgroup.check()?;
    let Some(name) = &cgroup.name else {
        return Ok(());
    };
    s.write_tagged_str(ExecCommand::Cgroup, name)?;
    write_tagged_str(s, ExecCommand::CgroupSession, cgroup.session.as_ref())?;
    for (tag, entries) in [
        (ExecCommand::CgroupXattr, &cgroup.xattrs),
        (ExecCommand::CgroupSet, &cgroup.set),
    ] {
        for (name, value) in entries {
            s.write_tagged_str(tag, name)?;
            s.write_str(value)?;
        }
    }
    Ok(())
}

/// Appends the command stream describing `process` to `s`, moving its
/// descriptors into the datagram.
///
/// # Errors
///
/// Returns an error if `process` runs an in-process function, a string
/// contains a NUL byte, or the datagram limits are exceeded.
pub fn serialize(s: &mut Serializer, process: PreparedChildProcess) -> Result<()> {
    let PreparedChildProcess {
        exec_path,
        exec_fd,
        exec_function,
        args,
        env,
        stdin,
        stdout,
        stderr,
        control,
        stderr_path,
        return_stderr,
        return_pidfd,
        return_cgroup,
        umask,
        tty,
        session,
        journal,
        sched_idle,
        ioprio_idle,
        priority,
        no_new_privs,
        syscall_filter,
        cgroup,
        ns,
        rlimits,
        uid_gid,
        chroot,
        chdir,
        hook_info,
    } = process;

    if exec_function.is_some() {
        return Err(SpawnError::malformed(
            "an in-process function cannot be sent to the spawner",
        ));
    }

    for arg in &args {
        s.write_tagged_str(ExecCommand::Arg, arg)?;
    }
    for entry in &env {
        s.write_tagged_str(ExecCommand::SetEnv, entry)?;
    }
    write_tagged_path(s, ExecCommand::ExecPath, exec_path.as_ref())?;
    write_fd(s, ExecCommand::ExecFd, exec_fd)?;
    if let Some(umask) = umask {
        s.write_tag(ExecCommand::Umask)?;
        s.write_u16(umask)?;
    }

    write_fd(s, ExecCommand::Stdin, stdin)?;
    write_fd(s, ExecCommand::Stdout, stdout)?;
    write_fd(s, ExecCommand::Stderr, stderr)?;
    write_fd(s, ExecCommand::Control, control)?;
    write_tagged_path(s, ExecCommand::StderrPath, stderr_path.as_ref())?;
    write_fd(s, ExecCommand::ReturnStderr, return_stderr)?;
    write_fd(s, ExecCommand::ReturnPidfd, return_pidfd)?;
    write_fd(s, ExecCommand::ReturnCgroup, return_cgroup)?;
    write_flag(s, ExecCommand::Tty, tty)?;
    write_flag(s, ExecCommand::Session, session)?;
    write_flag(s, ExecCommand::Journal, journal)?;

    write_flag(s, ExecCommand::UserNs, ns.enable_user)?;
    write_flag(s, ExecCommand::MapRoot, ns.map_root)?;
    if let Some(uid) = ns.mapped_uid {
        s.write_tag(ExecCommand::MappedUid)?;
        s.write_u32(uid)?;
    }
    write_flag(s, ExecCommand::PidNs, ns.enable_pid)?;
    write_tagged_str(s, ExecCommand::PidNsName, ns.pid_namespace.as_ref())?;
    write_flag(s, ExecCommand::CgroupNs, ns.enable_cgroup)?;
    write_flag(s, ExecCommand::NetworkNs, ns.enable_network)?;
    write_tagged_str(s, ExecCommand::NetworkNsName, ns.network_namespace.as_ref())?;
    write_flag(s, ExecCommand::IpcNs, ns.enable_ipc)?;
    write_tagged_str(s, ExecCommand::Hostname, ns.hostname.as_ref())?;

    let mount = ns.mount;
    write_flag(s, ExecCommand::MountNs, mount.enable)?;
    write_tagged_path(s, ExecCommand::PivotRoot, mount.pivot_root.as_ref())?;
    write_flag(s, ExecCommand::MountRootTmpfs, mount.mount_root_tmpfs)?;
    write_flag(s, ExecCommand::MountProc, mount.mount_proc)?;
    write_flag(s, ExecCommand::WritableProc, mount.writable_proc)?;
    write_flag(s, ExecCommand::MountDev, mount.mount_dev)?;
    write_flag(s, ExecCommand::MountPts, mount.mount_pts)?;
    write_flag(s, ExecCommand::BindMountPts, mount.bind_mount_pts)?;
    write_tagged_str(s, ExecCommand::MountTmpTmpfs, mount.mount_tmp_tmpfs.as_ref())?;
    for entry in mount.mounts {
        write_mount(s, entry)?;
    }

    for (resource, limit) in rlimits.defined() {
        s.write_tag(ExecCommand::Rlimit)?;
        s.write_u8(u8::try_from(resource).map_err(|_| SpawnError::malformed("bad rlimit"))?)?;
        s.write_u64(limit.soft.unwrap_or(RLIMIT_UNDEFINED))?;
        s.write_u64(limit.hard.unwrap_or(RLIMIT_UNDEFINED))?;
    }
    write_uid_gid(s, &uid_gid)?;

    write_flag(s, ExecCommand::SchedIdle, sched_idle)?;
    write_flag(s, ExecCommand::IoprioIdle, ioprio_idle)?;
    if priority != 0 {
        s.write_tag(ExecCommand::Priority)?;
        s.write_i32(priority)?;
    }
    write_flag(s, ExecCommand::NoNewPrivs, no_new_privs)?;
    write_flag(s, ExecCommand::ForbidUserNs, syscall_filter.forbid_user_namespace)?;
    write_flag(s, ExecCommand::ForbidMulticast, syscall_filter.forbid_multicast)?;
    write_flag(s, ExecCommand::ForbidBind, syscall_filter.forbid_bind)?;

    if let Some(cgroup) = &cgroup {
        write_cgroup(s, cgroup)?;
    }
    write_tagged_path(s, ExecCommand::Chroot, chroot.as_ref())?;
    write_tagged_path(s, ExecCommand::Chdir, chdir.as_ref())?;
    write_tagged_str(s, ExecCommand::HookInfo, hook_info.as_ref())
}

fn read_path(p: &mut Payload<'_>) -> Result<PathBuf> {
    Ok(PathBuf::from(OsStr::from_bytes(p.read_cstr()?)))
}

fn read_string(p: &mut Payload<'_>) -> Result<String> {
    p.read_str().map(str::to_owned)
}

fn read_flags(p: &mut Payload<'_>) -> Result<MountFlags> {
    let bits = p.read_u8()?;
    MountFlags::from_bits(bits)
        .ok_or_else(|| SpawnError::malformed(format!("unknown mount flags {bits:#x}")))
}

fn read_rlimit_value(p: &mut Payload<'_>) -> Result<Option<u64>> {
    let value = p.read_u64()?;
    Ok((value != RLIMIT_UNDEFINED).then_some(value))
}

fn read_uid_gid(p: &mut Payload<'_>) -> Result<UidGid> {
    let mut read_id = || -> Result<Option<u32>> {
        let id = p.read_u32()?;
        Ok((id != ID_UNSET).then_some(id))
    };
    let mut uid_gid = UidGid {
        uid: read_id()?,
        gid: read_id()?,
        real_uid: read_id()?,
        real_gid: read_id()?,
        groups: Vec::new(),
    };
    let count = usize::from(p.read_u8()?);
    if count > MAX_GROUPS {
        return Err(SpawnError::malformed("too many supplementary groups"));
    }
    for _ in 0..count {
        uid_gid.groups.push(p.read_u32()?);
    }
    Ok(uid_gid)
}

fn cgroup_mut(cgroup: &mut Option<CgroupOptions>) -> &mut CgroupOptions {
    cgroup.get_or_insert_with(CgroupOptions::default)
}

/// Decodes the command stream of an `EXEC` request until the end of the
/// payload.
///
/// # Errors
///
/// Returns [`SpawnError::MalformedPayload`] for unknown tags, truncated
/// fields, exceeded limits and descriptor mismatches.
#[allow(clippy::too_many_lines)]
pub fn parse(p: &mut Payload<'_>, fds: &mut ReceivedFds) -> Result<PreparedChildProcess> {
    let mut process = PreparedChildProcess::new();

    while !p.is_empty() {
        let tag = p.read_u8()?;
        let command = ExecCommand::from_u8(tag)
            .ok_or_else(|| SpawnError::malformed(format!("unknown exec command {tag}")))?;
        let ns = &mut process.ns;
        let mount = &mut ns.mount;

        match command {
            ExecCommand::Arg => {
                if process.args.len() >= MAX_ARGS {
                    return Err(SpawnError::malformed("too many arguments"));
                }
                process.args.push(read_string(p)?);
            }
            ExecCommand::SetEnv => {
                if process.env.len() >= MAX_ENV {
                    return Err(SpawnError::malformed("too many environment variables"));
                }
                process.env.push(read_string(p)?);
            }
            ExecCommand::ExecPath => process.exec_path = Some(read_path(p)?),
            ExecCommand::ExecFd => process.exec_fd = Some(fds.take()?),
            ExecCommand::Umask => process.umask = Some(p.read_u16()?),
            ExecCommand::Stdin => process.stdin = Some(fds.take()?),
            ExecCommand::Stdout => process.stdout = Some(fds.take()?),
            ExecCommand::Stderr => process.stderr = Some(fds.take()?),
            ExecCommand::Control => process.control = Some(fds.take()?),
            ExecCommand::StderrPath => process.stderr_path = Some(read_path(p)?),
            ExecCommand::ReturnStderr => process.return_stderr = Some(fds.take()?),
            ExecCommand::ReturnPidfd => process.return_pidfd = Some(fds.take()?),
            ExecCommand::ReturnCgroup => process.return_cgroup = Some(fds.take()?),
            ExecCommand::Tty => process.tty = true,
            ExecCommand::Session => process.session = true,
            ExecCommand::Journal => process.journal = true,

            ExecCommand::UserNs => ns.enable_user = true,
            ExecCommand::MapRoot => ns.map_root = true,
            ExecCommand::MappedUid => ns.mapped_uid = Some(p.read_u32()?),
            ExecCommand::PidNs => ns.enable_pid = true,
            ExecCommand::PidNsName => ns.pid_namespace = Some(read_string(p)?),
            ExecCommand::CgroupNs => ns.enable_cgroup = true,
            ExecCommand::NetworkNs => ns.enable_network = true,
            ExecCommand::NetworkNsName => ns.network_namespace = Some(read_string(p)?),
            ExecCommand::IpcNs => ns.enable_ipc = true,
            ExecCommand::Hostname => ns.hostname = Some(read_string(p)?),

            ExecCommand::MountNs => mount.enable = true,
            ExecCommand::PivotRoot => mount.pivot_root = Some(read_path(p)?),
            ExecCommand::MountRootTmpfs => mount.mount_root_tmpfs = true,
            ExecCommand::MountProc => mount.mount_proc = true,
            ExecCommand::WritableProc => mount.writable_proc = true,
            ExecCommand::MountDev => mount.mount_dev = true,
            ExecCommand::MountPts => mount.mount_pts = true,
            ExecCommand::BindMountPts => mount.bind_mount_pts = true,
            ExecCommand::MountTmpTmpfs => mount.mount_tmp_tmpfs = Some(read_string(p)?),
            ExecCommand::BindMount | ExecCommand::BindMountFile => {
                let source = read_path(p)?;
                let target = read_path(p)?;
                let flags = read_flags(p)?;
                let kind = if command == ExecCommand::BindMount {
                    MountKind::Bind { source }
                } else {
                    MountKind::BindFile { source }
                };
                mount.mounts.push(Mount::new(kind, target, flags));
            }
            ExecCommand::FdBindMount | ExecCommand::FdBindMountFile => {
                let fd = fds.take()?;
                let target = read_path(p)?;
                let flags = read_flags(p)?;
                let kind = if command == ExecCommand::FdBindMount {
                    MountKind::BindFd { fd }
                } else {
                    MountKind::BindFdFile { fd }
                };
                mount.mounts.push(Mount::new(kind, target, flags));
            }
            ExecCommand::MountTmpfs => {
                let target = read_path(p)?;
                let flags = read_flags(p)?;
                mount.mounts.push(Mount::new(MountKind::Tmpfs, target, flags));
            }
            ExecCommand::MountNamedTmpfs => {
                let name = read_string(p)?;
                let target = read_path(p)?;
                let flags = read_flags(p)?;
                mount
                    .mounts
                    .push(Mount::new(MountKind::NamedTmpfs { name }, target, flags));
            }
            ExecCommand::WriteFile => {
                let target = read_path(p)?;
                let contents = read_string(p)?;
                mount.mounts.push(Mount::new(
                    MountKind::WriteFile { contents },
                    target,
                    MountFlags::default(),
                ));
            }
            ExecCommand::Symlink => {
                let link_target = read_path(p)?;
                let target = read_path(p)?;
                mount.mounts.push(Mount::new(
                    MountKind::Symlink { link_target },
                    target,
                    MountFlags::default(),
                ));
            }

            ExecCommand::Rlimit => {
                let resource = usize::from(p.read_u8()?);
                let limit = ResourceLimit {
                    soft: read_rlimit_value(p)?,
                    hard: read_rlimit_value(p)?,
                };
                process
                    .rlimits
                    .set(resource, limit)
                    .map_err(|e| SpawnError::malformed(e.to_string()))?;
            }
            ExecCommand::UidGid => process.uid_gid = read_uid_gid(p)?,
            ExecCommand::SchedIdle => process.sched_idle = true,
            ExecCommand::IoprioIdle => process.ioprio_idle = true,
            ExecCommand::Priority => process.priority = p.read_i32()?,
            ExecCommand::NoNewPrivs => process.no_new_privs = true,
            ExecCommand::ForbidUserNs => process.syscall_filter.forbid_user_namespace = true,
            ExecCommand::ForbidMulticast => process.syscall_filter.forbid_multicast = true,
            ExecCommand::ForbidBind => process.syscall_filter.forbid_bind = true,

            ExecCommand::Cgroup => cgroup_mut(&mut process.cgroup).name = Some(read_string(p)?),
            ExecCommand::CgroupSession => {
                cgroup_mut(&mut process.cgroup).session = Some(read_string(p)?);
            }
            ExecCommand::CgroupSet => {
                let name = read_string(p)?;
                let value = read_string(p)?;
                cgroup_mut(&mut process.cgroup).set(name, value);
            }
            ExecCommand::CgroupXattr => {
                let name = read_string(p)?;
                let value = read_string(p)?;
                cgroup_mut(&mut process.cgroup).set_xattr(name, value);
            }
            ExecCommand::Chroot => process.chroot = Some(read_path(p)?),
            ExecCommand::Chdir => process.chdir = Some(read_path(p)?),
            ExecCommand::HookInfo => process.hook_info = Some(read_string(p)?),
        }
    }

    if process.cgroup.as_ref().is_some_and(|c| !c.is_defined()) {
        return Err(SpawnError::malformed("cgroup settings without a cgroup name"));
    }

    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(s: Serializer) -> Result<PreparedChildProcess> {
        let datagram = s.finish();
        let mut payload = Payload::new(&datagram.data);
        let mut fds = ReceivedFds::new(datagram.fds);
        let process = parse(&mut payload, &mut fds)?;
        fds.finish()?;
        Ok(process)
    }

    #[test]
    fn default_process_encodes_to_nothing() {
        let mut s = Serializer::new();
        serialize(&mut s, PreparedChildProcess::new()).unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn exec_function_is_rejected() {
        fn entry() -> i32 {
            0
        }
        let process = PreparedChildProcess {
            exec_function: Some(entry),
            ..PreparedChildProcess::default()
        };
        assert!(serialize(&mut Serializer::new(), process).is_err());
    }

    #[test]
    fn write_file_contents_with_nul_are_rejected() {
        let mut process = PreparedChildProcess::new();
        process.ns.mount.mounts.push(Mount::new(
            MountKind::WriteFile {
                contents: "a\0b".into(),
            },
            "/etc/x",
            MountFlags::default(),
        ));
        assert!(serialize(&mut Serializer::new(), process).is_err());
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let mut s = Serializer::new();
        s.write_u8(200).unwrap();
        let err = decode(s).unwrap_err();
        assert!(err.to_string().contains("unknown exec command 200"));
    }

    #[test]
    fn missing_fd_is_malformed() {
        let mut s = Serializer::new();
        s.write_tag(ExecCommand::Stdin).unwrap();
        assert!(decode(s).is_err());
    }

    #[test]
    fn unknown_mount_flags_are_malformed() {
        let mut s = Serializer::new();
        s.write_tag(ExecCommand::MountTmpfs).unwrap();
        s.write_str("/scratch").unwrap();
        s.write_u8(0x40).unwrap();
        assert!(decode(s).is_err());
    }

    #[test]
    fn too_many_groups_are_malformed() {
        let mut s = Serializer::new();
        s.write_tag(ExecCommand::UidGid).unwrap();
        for _ in 0..4 {
            s.write_u32(1).unwrap();
        }
        s.write_u8(33).unwrap();
        assert!(decode(s).is_err());
    }

    #[test]
    fn orphan_cgroup_setting_is_malformed() {
        let mut s = Serializer::new();
        s.write_tagged_str(ExecCommand::CgroupSet, "memory.max").unwrap();
        s.write_str("1G").unwrap();
        assert!(decode(s).is_err());
    }

    #[test]
    fn orphan_cgroup_setting_is_not_serialized() {
        let mut process = PreparedChildProcess::new();
        process.append_arg("/bin/true");
        let mut cgroup = CgroupOptions::default();
        cgroup.set("memory.max", "1G");
        process.cgroup = Some(cgroup);
        let mut s = Serializer::new();
        let err = serialize(&mut s, process).unwrap_err();
        assert!(err.to_string().contains("without a cgroup name"));
    }

    #[test]
    fn argument_limit_is_enforced() {
        let mut s = Serializer::new();
        for _ in 0..=MAX_ARGS {
            s.write_tagged_str(ExecCommand::Arg, "").unwrap();
        }
        let err = decode(s).unwrap_err();
        assert!(err.to_string().contains("too many arguments"));
    }

    #[test]
    fn undefined_rlimit_half_survives() {
        let mut process = PreparedChildProcess::new();
        process
            .rlimits
            .set(
                7,
                ResourceLimit {
                    soft: Some(64),
                    hard: None,
                },
            )
            .unwrap();
        let mut s = Serializer::new();
        serialize(&mut s, process).unwrap();
        let decoded = decode(s).unwrap();
        assert_eq!(
            decoded.rlimits.get(7),
            Some(&ResourceLimit {
                soft: Some(64),
                hard: None
            })
        );
    }
}
