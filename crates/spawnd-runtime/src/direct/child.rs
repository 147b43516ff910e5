//! The child side of `clone3()`, from the first instruction to `execve()`.
//!
//! Nothing here allocates: all strings and tables were prepared by the
//! parent in a [`ChildPlan`]. A failed step is written to the error pipe
//! and the child exits with status 1.

use std::convert::Infallible;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sched::CloneFlags;
use spawnd_core::setup::{SetupContext, SetupError};
use spawnd_core::{namespace::uts, rlimit, sys, uid_gid};

use super::init;
use super::prepare::{ChildPlan, Executable, UserNamespaceMode};

/// Lowest descriptor number stdio sources are moved to before `dup2()`.
const FD_STAGING_MIN: RawFd = 10;

/// Highest signal number to reset.
const NSIG: libc::c_int = 65;

/// Pipe ends owned by the child.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildPipes {
    pub error_w: RawFd,
    /// Read end the parent wakes after writing the id maps of a cloned
    /// user namespace.
    pub map_r: Option<RawFd>,
    /// Written after `unshare(CLONE_NEWUSER)`.
    pub create_w: Option<RawFd>,
    /// Read end the parent wakes after handling the postponed namespace.
    pub wait_r: Option<RawFd>,
    /// Parent ends, closed first thing.
    pub parent_ends: [Option<RawFd>; 4],
}

/// Runs the child setup and executes the program. Never returns.
pub(crate) fn run(plan: &ChildPlan, pipes: &ChildPipes) -> ! {
    for fd in pipes.parent_ends.into_iter().flatten() {
        // SAFETY: the parent's pipe ends are copies the child does not use.
        let _ = unsafe { libc::close(fd) };
    }
    match setup(plan, pipes) {
        Ok(never) => match never {},
        Err(e) => {
            e.write_to(pipes.error_w);
            sys::exit_immediately(1)
        }
    }
}

fn wait_for_parent(fd: RawFd) -> Result<(), SetupError<'static>> {
    let mut byte = [0u8; 1];
    match sys::read(fd, &mut byte).setup("waiting for the parent")? {
        0 => Err(SetupError::message("parent aborted the spawn")),
        _ => Ok(()),
    }
}

fn restore_signals() {
    for signal in 1..NSIG {
        if signal == libc::SIGKILL || signal == libc::SIGSTOP {
            continue;
        }
        // SAFETY: resetting a disposition to SIG_DFL; invalid numbers fail harmlessly.
        let _ = unsafe { libc::signal(signal, libc::SIG_DFL) };
    }
    // SAFETY: sigset_t is plain data and sigemptyset initializes it.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        let _ = libc::sigemptyset(&raw mut set);
        let _ = libc::sigprocmask(libc::SIG_SETMASK, &raw const set, std::ptr::null_mut());
    }
}

fn set_oom_score(jailed: bool) {
    let value: &[u8] = if jailed { b"700" } else { b"500" };
    if let Ok(fd) = sys::openat(None, c"/proc/self/oom_score_adj", libc::O_WRONLY, 0) {
        let _ = sys::write_all(fd.as_raw_fd(), value);
    }
}

fn create_user_namespace(pipes: &ChildPipes) -> Result<(), SetupError<'static>> {
    nix::sched::unshare(CloneFlags::CLONE_NEWUSER).setup("unshare(CLONE_NEWUSER)")?;
    if let Some(fd) = pipes.create_w {
        sys::write_all(fd, &[0]).setup("signalling the user namespace")?;
        // SAFETY: our own pipe end; the parent waits for EOF or the byte.
        let _ = unsafe { libc::close(fd) };
    }
    if let Some(fd) = pipes.wait_r {
        wait_for_parent(fd)?;
    }
    Ok(())
}

fn spawn_init(error_w: RawFd) -> Result<(), SetupError<'static>> {
    // SAFETY: the cloned child is single-threaded.
    let pid = unsafe { libc::fork() };
    match pid {
        0 => Ok(()),
        p if p < 0 => Err(SetupError::os("fork", None, &std::io::Error::last_os_error())),
        p => init::run(p, error_w),
    }
}

fn apply_scheduling(plan: &ChildPlan) {
    if plan.sched_idle {
        let _ = sys::sched_idle();
    }
    if plan.priority != 0 {
        let _ = sys::set_priority(plan.priority);
    }
    if plan.ioprio_idle {
        let _ = sys::ioprio_set_idle();
    }
}

fn install_seccomp(plan: &ChildPlan) -> Result<(), SetupError<'static>> {
    match plan.seccomp.install() {
        Err(e) if plan.seccomp_strict => Err(SetupError::os("installing the seccomp filter", None, &e)),
        _ => Ok(()),
    }
}

fn send_return_fds(plan: &ChildPlan, stderr: Option<RawFd>) -> Result<(), SetupError<'static>> {
    if let (Some(socket), Some(fd)) = (&plan.return_stderr, stderr) {
        sys::send_fd(socket.as_raw_fd(), fd).setup("returning stderr")?;
    }
    if let Some(socket) = &plan.return_pidfd {
        // SAFETY: getpid() cannot fail.
        let pidfd = sys::pidfd_open(unsafe { libc::getpid() }).setup("pidfd_open")?;
        sys::send_fd(socket.as_raw_fd(), pidfd.as_raw_fd()).setup("returning the pidfd")?;
    }
    if let (Some(socket), Some(cgroup)) = (&plan.return_cgroup, &plan.cgroup_fd) {
        sys::send_fd(socket.as_raw_fd(), cgroup.as_raw_fd()).setup("returning the cgroup")?;
    }
    Ok(())
}

fn stage(fd: Option<RawFd>) -> Result<Option<OwnedFd>, SetupError<'static>> {
    fd.map(|fd| sys::dup_cloexec_above(fd, FD_STAGING_MIN).setup("dup"))
        .transpose()
}

/// Puts stdin, stdout, stderr and the control socket on 0 to 3.
fn install_stdio(sources: [Option<RawFd>; 4]) -> Result<(), SetupError<'static>> {
    let staged = [stage(sources[0])?, stage(sources[1])?, stage(sources[2])?, stage(sources[3])?];
    for (target, fd) in (0..).zip(&staged) {
        if let Some(fd) = fd {
            sys::checked_dup2(fd.as_raw_fd(), target).setup("dup2")?;
        }
    }
    Ok(())
}

fn exec<'a>(plan: &'a ChildPlan, error_w: RawFd) -> Result<Infallible, SetupError<'a>> {
    let argv = plan.argv.as_ptrs();
    let envp = plan.envp.as_ptrs();
    match &plan.executable {
        Executable::Function(function) => {
            // SAFETY: closing our own error pipe; success is signalled by EOF.
            let _ = unsafe { libc::close(error_w) };
            sys::exit_immediately(function())
        }
        Executable::Fd(fd) => Err(SetupError::os("execveat", None, &sys::execve_fd(fd.as_raw_fd(), argv, envp))),
        Executable::Path(path) => Err(SetupError::os("execve", Some(path), &sys::execve(path, argv, envp))),
    }
}

fn setup<'a>(plan: &'a ChildPlan, pipes: &ChildPipes) -> Result<Infallible, SetupError<'a>> {
    if let Some(fd) = pipes.map_r {
        wait_for_parent(fd)?;
    }

    restore_signals();
    if let Some(mask) = plan.umask {
        // SAFETY: umask cannot fail.
        let _ = unsafe { libc::umask(libc::mode_t::from(mask)) };
    }
    set_oom_score(plan.jailed);

    if plan.apply_ids && plan.ids_early() {
        uid_gid::apply(&plan.ids, plan.set_groups)?;
    }

    if let Some(hostname) = &plan.hostname {
        uts::set_hostname(hostname).setup_at("sethostname", hostname)?;
    }
    plan.mounts.execute()?;
    if plan.rlimits_in_child() {
        rlimit::apply(0, &plan.rlimits).setup("setrlimit")?;
    }
    if let Some(root) = &plan.chroot {
        nix::unistd::chroot(root.as_c_str()).setup_at("chroot", root)?;
        nix::unistd::chdir(c"/").setup("chdir")?;
    }

    if plan.user_namespace == UserNamespaceMode::Postponed {
        if let Some(groups) = &plan.outer_groups {
            sys::setgroups(groups).setup("setgroups")?;
        }
        create_user_namespace(pipes)?;
    }

    apply_scheduling(plan);
    if plan.session && !plan.tty {
        sys::disconnect_tty();
    }

    if plan.spawn_init {
        spawn_init(pipes.error_w)?;
    }

    if plan.jailed {
        let _ = sys::core_sched_create();
    }
    if plan.no_new_privs {
        sys::set_no_new_privs().setup("PR_SET_NO_NEW_PRIVS")?;
    }
    install_seccomp(plan)?;

    if plan.apply_ids && !plan.ids_early() {
        uid_gid::apply(&plan.ids, plan.set_groups)?;
    }

    if let Some(dir) = &plan.chdir {
        nix::unistd::chdir(dir.as_c_str()).setup_at("chdir", dir)?;
    }

    let opened_stderr = match (&plan.stderr, &plan.stderr_path) {
        (None, Some(path)) => Some(
            sys::openat(
                None,
                path,
                libc::O_CREAT | libc::O_WRONLY | libc::O_APPEND | libc::O_NOCTTY,
                0o600,
            )
            .setup_at("open", path)?,
        ),
        _ => None,
    };

    let journal = plan.journal.as_ref().map(AsRawFd::as_raw_fd);
    let stdout = plan.stdout.as_ref().map(AsRawFd::as_raw_fd).or(journal);
    let stderr = plan
        .stderr
        .as_ref()
        .or(opened_stderr.as_ref())
        .map(AsRawFd::as_raw_fd)
        .or(journal);

    send_return_fds(plan, stderr)?;

    install_stdio([
        plan.stdin.as_ref().map(AsRawFd::as_raw_fd),
        stdout,
        stderr,
        plan.control.as_ref().map(AsRawFd::as_raw_fd),
    ])?;

    if plan.session {
        nix::unistd::setsid().setup("setsid")?;
    }
    if plan.tty {
        sys::set_controlling_tty(libc::STDIN_FILENO).setup("TIOCSCTTY")?;
    }

    exec(plan, pipes.error_w)
}
