//! Platform primitives: raw system calls the standard library and `nix`
//! do not wrap.
//!
//! Every syscall number and kernel ABI struct used by the workspace lives
//! here so the rest of the code never spells out `libc::syscall`. The
//! functions in this module never allocate, which makes them usable in a
//! freshly cloned child of a (potentially) multi-threaded parent.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// `CLONE_INTO_CGROUP` (Linux 5.7).
pub const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;

/// `CLONE_PIDFD` (Linux 5.2).
pub const CLONE_PIDFD: u64 = 0x1000;

/// `P_PIDFD` id type for `waitid()` (Linux 5.4).
const P_PIDFD: libc::idtype_t = 3;

/// `PR_SCHED_CORE` and friends (Linux 5.14).
const PR_SCHED_CORE: libc::c_int = 62;
const PR_SCHED_CORE_CREATE: libc::c_ulong = 1;
const PIDTYPE_TGID: libc::c_ulong = 1;

const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_IDLE: libc::c_int = 3;
const IOPRIO_CLASS_SHIFT: libc::c_int = 13;

const OPEN_TREE_CLONE: libc::c_uint = 1;
const MOVE_MOUNT_F_EMPTY_PATH: libc::c_uint = 0x4;

/// Kernel `struct clone_args` (version 2, with the `cgroup` field).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CloneArgs {
    /// Clone flags (`CLONE_*`).
    pub flags: u64,
    /// Where the kernel stores the pidfd when `CLONE_PIDFD` is set.
    pub pidfd: u64,
    /// `CLONE_CHILD_SETTID` destination.
    pub child_tid: u64,
    /// `CLONE_PARENT_SETTID` destination.
    pub parent_tid: u64,
    /// Signal delivered to the parent on child exit.
    pub exit_signal: u64,
    /// Lowest address of the child stack.
    pub stack: u64,
    /// Size of the child stack.
    pub stack_size: u64,
    /// New TLS base.
    pub tls: u64,
    /// Array of requested pids.
    pub set_tid: u64,
    /// Length of `set_tid`.
    pub set_tid_size: u64,
    /// Cgroup directory fd for `CLONE_INTO_CGROUP`.
    pub cgroup: u64,
}

/// Calls `clone3()`. Returns 0 in the child and the child's pid in the parent.
///
/// # Safety
///
/// Behaves like `fork()`: in the child only async-signal-safe operations
/// are sound if the parent had more than one thread. `args` must point to
/// valid memory for every field the flags reference.
pub unsafe fn clone3(args: &mut CloneArgs) -> io::Result<libc::pid_t> {
    // SAFETY: the caller guarantees the pointed-to fields are valid; the
    // struct size matches the kernel's version 2 layout.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            std::ptr::from_mut(args),
            std::mem::size_of::<CloneArgs>(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        #[allow(clippy::cast_possible_truncation)]
        Ok(ret as libc::pid_t)
    }
}

/// Opens a pidfd for `pid`.
///
/// # Errors
///
/// Returns the OS error if `pidfd_open()` fails.
pub fn pidfd_open(pid: libc::pid_t) -> io::Result<OwnedFd> {
    // SAFETY: plain syscall with integer arguments.
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_possible_truncation)]
    // SAFETY: the kernel returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

/// Sends `signal` to the process behind `pidfd`.
///
/// # Errors
///
/// Returns the OS error if `pidfd_send_signal()` fails.
pub fn pidfd_send_signal(pidfd: BorrowedFd<'_>, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: null siginfo is allowed and means "like kill()".
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            signal,
            std::ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Converts a `waitid()` result into a classic wait status.
fn siginfo_to_status(info: &libc::siginfo_t) -> i32 {
    // SAFETY: only called after waitid() filled in a SIGCHLD siginfo.
    let status = unsafe { info.si_status() };
    match info.si_code {
        libc::CLD_EXITED => (status & 0xff) << 8,
        libc::CLD_KILLED => status & 0x7f,
        libc::CLD_DUMPED => (status & 0x7f) | 0x80,
        _ => 0x7f | ((status & 0xff) << 8),
    }
}

/// Reaps the process behind `pidfd` without blocking.
///
/// Returns `None` if it has not exited yet.
///
/// # Errors
///
/// Returns the OS error if `waitid()` fails.
pub fn waitid_pidfd(pidfd: BorrowedFd<'_>) -> io::Result<Option<i32>> {
    // SAFETY: siginfo_t is plain old data; zeroed is a valid value.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    #[allow(clippy::cast_sign_loss)]
    let id = pidfd.as_raw_fd() as libc::id_t;
    // SAFETY: info points to a valid siginfo_t.
    let ret = unsafe { libc::waitid(P_PIDFD, id, &raw mut info, libc::WEXITED | libc::WNOHANG) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: after a successful waitid() si_pid is initialized (0 if nothing exited).
    if unsafe { info.si_pid() } == 0 {
        return Ok(None);
    }
    Ok(Some(siginfo_to_status(&info)))
}

/// Reaps any exited child without blocking and returns `(pid, raw status)`.
///
/// # Errors
///
/// Returns the OS error if `waitpid()` fails (`ECHILD` when there are no children).
pub fn waitpid_any_nohang() -> io::Result<Option<(libc::pid_t, i32)>> {
    let mut status = 0;
    // SAFETY: status points to a valid int.
    let pid = unsafe { libc::waitpid(-1, &raw mut status, libc::WNOHANG) };
    match pid {
        0 => Ok(None),
        p if p < 0 => Err(io::Error::last_os_error()),
        p => Ok(Some((p, status))),
    }
}

/// Blocks until `pid` exits and returns its raw wait status.
///
/// # Errors
///
/// Returns the OS error if `waitpid()` fails.
pub fn waitpid_blocking(pid: libc::pid_t) -> io::Result<i32> {
    let mut status = 0;
    loop {
        // SAFETY: status points to a valid int.
        let ret = unsafe { libc::waitpid(pid, &raw mut status, 0) };
        if ret >= 0 {
            return Ok(status);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Kernel `struct rlimit64`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit64 {
    /// Soft limit.
    pub cur: u64,
    /// Hard limit.
    pub max: u64,
}

/// Calls `prlimit64()` on `pid` (0 = the calling process).
///
/// # Errors
///
/// Returns the OS error if `prlimit64()` fails.
pub fn prlimit(
    pid: libc::pid_t,
    resource: libc::c_int,
    new: Option<&Rlimit64>,
    old: Option<&mut Rlimit64>,
) -> io::Result<()> {
    let new_ptr = new.map_or(std::ptr::null(), std::ptr::from_ref);
    let old_ptr = old.map_or(std::ptr::null_mut(), std::ptr::from_mut);
    // SAFETY: both pointers are either null or point to valid rlimit64 values.
    let ret = unsafe { libc::syscall(libc::SYS_prlimit64, pid, resource, new_ptr, old_ptr) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Replaces the supplementary groups of the calling thread.
///
/// # Errors
///
/// Returns the OS error if `setgroups()` fails.
pub fn setgroups(groups: &[u32]) -> io::Result<()> {
    // SAFETY: groups is valid for reads of its length.
    if unsafe { libc::setgroups(groups.len(), groups.as_ptr()) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Puts the calling process into the idle I/O scheduling class.
///
/// # Errors
///
/// Returns the OS error if `ioprio_set()` fails.
pub fn ioprio_set_idle() -> io::Result<()> {
    let prio = IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT;
    // SAFETY: plain syscall with integer arguments.
    let ret = unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, prio) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Switches the calling process to `SCHED_IDLE`.
///
/// # Errors
///
/// Returns the OS error if `sched_setscheduler()` fails.
pub fn sched_idle() -> io::Result<()> {
    let param = libc::sched_param { sched_priority: 0 };
    // SAFETY: param is a valid sched_param.
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_IDLE, &raw const param) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Sets the nice value of the calling process.
///
/// # Errors
///
/// Returns the OS error if `setpriority()` fails.
pub fn set_priority(priority: i32) -> io::Result<()> {
    // SAFETY: plain libc call with integer arguments.
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Sets `PR_SET_NO_NEW_PRIVS`.
///
/// # Errors
///
/// Returns the OS error if `prctl()` fails.
pub fn set_no_new_privs() -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Sets the kernel comm name (`/proc/self/comm`) of the calling thread.
///
/// # Errors
///
/// Returns the OS error if `prctl()` fails.
pub fn set_comm(name: &CStr) -> io::Result<()> {
    // SAFETY: name is a valid NUL-terminated string; the kernel copies at most 16 bytes.
    if unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr(), 0, 0, 0) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Asks the kernel to deliver `signal` when the parent dies.
///
/// # Errors
///
/// Returns the OS error if `prctl()` fails.
pub fn set_parent_death_signal(signal: libc::c_int) -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, signal, 0, 0, 0) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Creates a new core-scheduling cookie for the calling thread group.
///
/// # Errors
///
/// Returns the OS error if `prctl()` fails (e.g. `EINVAL` on kernels
/// without `CONFIG_SCHED_CORE`).
pub fn core_sched_create() -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(PR_SCHED_CORE, PR_SCHED_CORE_CREATE, 0, PIDTYPE_TGID, 0) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Drops `capability` from the bounding set.
///
/// # Errors
///
/// Returns the OS error if `prctl()` fails.
pub fn capbset_drop(capability: u32) -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_CAPBSET_DROP, libc::c_ulong::from(capability), 0, 0, 0) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

/// One 32-bit slice of the kernel's capability sets.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CapUserData {
    /// Effective set.
    pub effective: u32,
    /// Permitted set.
    pub permitted: u32,
    /// Inheritable set.
    pub inheritable: u32,
}

/// Reads the capability sets of the calling thread.
///
/// # Errors
///
/// Returns the OS error if `capget()` fails.
pub fn capget() -> io::Result<[CapUserData; 2]> {
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];
    // SAFETY: header and data have the kernel's v3 layout.
    let ret = unsafe { libc::syscall(libc::SYS_capget, &raw mut header, data.as_mut_ptr()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(data)
    }
}

/// Replaces the capability sets of the calling thread.
///
/// # Errors
///
/// Returns the OS error if `capset()` fails.
pub fn capset(data: &[CapUserData; 2]) -> io::Result<()> {
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // SAFETY: header and data have the kernel's v3 layout.
    let ret = unsafe { libc::syscall(libc::SYS_capset, &raw mut header, data.as_ptr()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Clones the mount at `fd` into a detached mount tree.
///
/// # Errors
///
/// Returns the OS error if `open_tree()` fails.
pub fn open_tree_clone(fd: BorrowedFd<'_>, recursive: bool) -> io::Result<OwnedFd> {
    let mut flags = OPEN_TREE_CLONE | libc::O_CLOEXEC as libc::c_uint | libc::AT_EMPTY_PATH as libc::c_uint;
    if recursive {
        flags |= libc::AT_RECURSIVE as libc::c_uint;
    }
    // SAFETY: the empty path is a valid C string; fd is a live descriptor.
    let ret = unsafe { libc::syscall(libc::SYS_open_tree, fd.as_raw_fd(), c"".as_ptr(), flags) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_possible_truncation)]
    // SAFETY: the kernel returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

/// Attaches the detached mount tree `tree` at `target`.
///
/// # Errors
///
/// Returns the OS error if `move_mount()` fails.
pub fn move_mount(tree: BorrowedFd<'_>, target: &CStr) -> io::Result<()> {
    // SAFETY: both paths are valid C strings; tree is a live mount fd.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_move_mount,
            tree.as_raw_fd(),
            c"".as_ptr(),
            libc::AT_FDCWD,
            target.as_ptr(),
            MOVE_MOUNT_F_EMPTY_PATH,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Creates an anonymous memory-backed file.
///
/// # Errors
///
/// Returns the OS error if `memfd_create()` fails.
pub fn memfd_create(name: &CStr) -> io::Result<OwnedFd> {
    // SAFETY: name is a valid C string.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Creates a close-on-exec pipe and returns `(read, write)`.
///
/// # Errors
///
/// Returns the OS error if `pipe2()` fails.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: fds has room for two descriptors.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2() returned two fresh descriptors we now own.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Creates a connected close-on-exec `SOCK_SEQPACKET` pair.
///
/// # Errors
///
/// Returns the OS error if `socketpair()` fails.
pub fn seqpacket_pair(nonblocking: bool) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut kind = libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC;
    if nonblocking {
        kind |= libc::SOCK_NONBLOCK;
    }
    let mut fds = [0; 2];
    // SAFETY: fds has room for two descriptors.
    if unsafe { libc::socketpair(libc::AF_LOCAL, kind, 0, fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socketpair() returned two fresh descriptors we now own.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn update_fd_flags(fd: RawFd, get: libc::c_int, set: libc::c_int, f: impl Fn(libc::c_int) -> libc::c_int) -> io::Result<()> {
    // SAFETY: fcntl on a caller-provided descriptor with integer arguments.
    let flags = unsafe { libc::fcntl(fd, get) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, set, f(flags)) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Sets or clears `O_NONBLOCK`.
///
/// # Errors
///
/// Returns the OS error if `fcntl()` fails.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    update_fd_flags(fd, libc::F_GETFL, libc::F_SETFL, |flags| {
        if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        }
    })
}

/// Clears `FD_CLOEXEC` so the descriptor survives `execve()`.
///
/// # Errors
///
/// Returns the OS error if `fcntl()` fails.
pub fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    update_fd_flags(fd, libc::F_GETFD, libc::F_SETFD, |flags| flags & !libc::FD_CLOEXEC)
}

/// Duplicates `old` onto `new`; if they are equal, only clears `FD_CLOEXEC`.
///
/// # Errors
///
/// Returns the OS error if `dup2()` or `fcntl()` fails.
pub fn checked_dup2(old: RawFd, new: RawFd) -> io::Result<()> {
    if old == new {
        return clear_cloexec(old);
    }
    // SAFETY: dup2 on caller-provided descriptors.
    if unsafe { libc::dup2(old, new) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Duplicates `fd` to a new close-on-exec descriptor at or above `min`.
///
/// # Errors
///
/// Returns the OS error if `fcntl()` fails.
pub fn dup_cloexec_above(fd: RawFd, min: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: fcntl on a caller-provided descriptor.
    let new = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) };
    if new < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// Waits up to `timeout_ms` for `fd` to become readable (or hung up).
///
/// # Errors
///
/// Returns the OS error if `poll()` fails.
pub fn poll_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: pfd is one valid pollfd.
        let ret = unsafe { libc::poll(&raw mut pfd, 1, timeout_ms) };
        if ret >= 0 {
            return Ok(ret > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// `read()` retrying on `EINTR`.
///
/// # Errors
///
/// Returns the OS error if `read()` fails.
pub fn read(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: buffer is valid for writes of its length.
        let n = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
        if n >= 0 {
            #[allow(clippy::cast_sign_loss)]
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Writes all of `data`, retrying on `EINTR` and short writes.
///
/// # Errors
///
/// Returns the OS error if `write()` fails.
pub fn write_all(fd: RawFd, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        // SAFETY: data is valid for reads of its length.
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        #[allow(clippy::cast_sign_loss)]
        let n = n as usize;
        data = data.get(n..).unwrap_or_default();
    }
    Ok(())
}

/// Sends one descriptor with a single zero byte over a Unix socket.
///
/// Uses a stack buffer for the control message, so it is usable in a
/// freshly cloned child.
///
/// # Errors
///
/// Returns the OS error if `sendmsg()` fails.
pub fn send_fd(socket: RawFd, fd: RawFd) -> io::Result<()> {
    let byte = [0u8; 1];
    let iov = libc::iovec {
        iov_base: byte.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };
    // Room for CMSG_SPACE(sizeof(int)) with cmsghdr alignment.
    let mut control = [0u64; 4];

    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = (&raw const iov).cast_mut();
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    // SAFETY: CMSG_SPACE is pure arithmetic.
    #[allow(clippy::cast_possible_truncation)]
    let space = unsafe { libc::CMSG_SPACE(size_of::<RawFd>() as u32) } as usize;
    msg.msg_controllen = space;

    // SAFETY: the control buffer is large enough for one int-sized
    // SCM_RIGHTS message; all pointers stay valid during sendmsg().
    let ret = unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        #[allow(clippy::cast_possible_truncation)]
        {
            (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as usize;
        }
        libc::CMSG_DATA(cmsg).cast::<RawFd>().write_unaligned(fd);
        libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL)
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Sets `PR_SET_KEEPCAPS` so permitted capabilities survive a switch
/// away from uid 0.
///
/// # Errors
///
/// Returns the OS error if `prctl()` fails.
pub fn set_keep_caps(keep: bool) -> io::Result<()> {
    // SAFETY: prctl with integer arguments only.
    if unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, libc::c_ulong::from(keep), 0, 0, 0) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Opens `path` relative to `dir` (or the cwd when `dir` is `None`).
///
/// # Errors
///
/// Returns the OS error if `openat()` fails.
pub fn openat(dir: Option<BorrowedFd<'_>>, path: &CStr, flags: libc::c_int, mode: libc::mode_t) -> io::Result<OwnedFd> {
    let dirfd = dir.map_or(libc::AT_FDCWD, |d| d.as_raw_fd());
    // SAFETY: path is a valid C string.
    let fd = unsafe { libc::openat(dirfd, path.as_ptr(), flags | libc::O_CLOEXEC, libc::c_uint::from(mode)) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Creates a directory relative to `dir`.
///
/// # Errors
///
/// Returns the OS error if `mkdirat()` fails (including `EEXIST`).
pub fn mkdirat(dir: Option<BorrowedFd<'_>>, path: &CStr, mode: libc::mode_t) -> io::Result<()> {
    let dirfd = dir.map_or(libc::AT_FDCWD, |d| d.as_raw_fd());
    // SAFETY: path is a valid C string.
    if unsafe { libc::mkdirat(dirfd, path.as_ptr(), mode) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Creates a symbolic link at `link_path` pointing to `target`.
///
/// # Errors
///
/// Returns the OS error if `symlink()` fails.
pub fn symlink(target: &CStr, link_path: &CStr) -> io::Result<()> {
    // SAFETY: both are valid C strings.
    if unsafe { libc::symlink(target.as_ptr(), link_path.as_ptr()) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Returns the file type bits (`S_IFMT`) of `path` relative to `dir`.
///
/// # Errors
///
/// Returns the OS error if `fstatat()` fails.
pub fn file_type_at(dir: Option<BorrowedFd<'_>>, path: &CStr) -> io::Result<libc::mode_t> {
    let dirfd = dir.map_or(libc::AT_FDCWD, |d| d.as_raw_fd());
    // SAFETY: stat is plain old data; zeroed is a valid value.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: path is a valid C string and st is writable.
    if unsafe { libc::fstatat(dirfd, path.as_ptr(), &raw mut st, 0) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(st.st_mode & libc::S_IFMT)
    }
}

/// Sets extended attribute `name` on an open (non-`O_PATH`) descriptor.
///
/// # Errors
///
/// Returns the OS error if `fsetxattr()` fails.
pub fn fsetxattr(fd: BorrowedFd<'_>, name: &CStr, value: &[u8]) -> io::Result<()> {
    // SAFETY: name is a valid C string and value is valid for reads.
    let ret = unsafe { libc::fsetxattr(fd.as_raw_fd(), name.as_ptr(), value.as_ptr().cast(), value.len(), 0) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `execve()`; only returns on failure.
pub fn execve(path: &CStr, argv: &[*const libc::c_char], envp: &[*const libc::c_char]) -> io::Error {
    // SAFETY: argv and envp are NULL-terminated arrays of valid C strings
    // kept alive by the caller.
    let _ = unsafe { libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
    io::Error::last_os_error()
}

/// `execveat(fd, "", AT_EMPTY_PATH)`; only returns on failure.
pub fn execve_fd(fd: RawFd, argv: &[*const libc::c_char], envp: &[*const libc::c_char]) -> io::Error {
    // SAFETY: argv and envp are NULL-terminated arrays of valid C strings
    // kept alive by the caller.
    let _ = unsafe {
        libc::syscall(
            libc::SYS_execveat,
            fd,
            c"".as_ptr(),
            argv.as_ptr(),
            envp.as_ptr(),
            libc::AT_EMPTY_PATH,
        )
    };
    io::Error::last_os_error()
}

/// Terminates the calling process immediately without running destructors
/// or `atexit` handlers.
pub fn exit_immediately(code: i32) -> ! {
    // SAFETY: _exit is always safe to call.
    unsafe { libc::_exit(code) }
}

/// Makes the terminal on `fd` the controlling terminal.
///
/// # Errors
///
/// Returns the OS error if the ioctl fails.
pub fn set_controlling_tty(fd: RawFd) -> io::Result<()> {
    // SAFETY: TIOCSCTTY takes an integer argument.
    if unsafe { libc::ioctl(fd, libc::TIOCSCTTY, 0) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Detaches the calling process from its controlling terminal, if any.
pub fn disconnect_tty() {
    // SAFETY: path is a valid C string.
    let fd = unsafe { libc::open(c"/dev/tty".as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC) };
    if fd >= 0 {
        // SAFETY: TIOCNOTTY takes no argument; fd is ours.
        unsafe {
            let _ = libc::ioctl(fd, libc::TIOCNOTTY);
            let _ = libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn clone_args_match_kernel_layout() {
        assert_eq!(std::mem::size_of::<CloneArgs>(), 88);
    }

    #[test]
    fn pipe_round_trip() {
        let (r, w) = pipe().expect("pipe");
        write_all(w.as_raw_fd(), b"hello").expect("write");
        drop(w);
        let mut buffer = [0u8; 16];
        let n = read(r.as_raw_fd(), &mut buffer).expect("read");
        assert_eq!(&buffer[..n], b"hello");
        assert_eq!(read(r.as_raw_fd(), &mut buffer).expect("eof"), 0);
    }

    #[test]
    fn poll_reports_hangup_as_readable() {
        let (r, w) = pipe().expect("pipe");
        assert!(!poll_readable(r.as_raw_fd(), 0).expect("poll"));
        drop(w);
        assert!(poll_readable(r.as_raw_fd(), 0).expect("poll"));
    }

    #[test]
    fn pidfd_of_self_is_not_reapable() {
        // SAFETY: getpid never fails.
        let pid = unsafe { libc::getpid() };
        let Ok(fd) = pidfd_open(pid) else {
            return;
        };
        assert!(waitid_pidfd(fd.as_fd()).is_err());
    }
}
