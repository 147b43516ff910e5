//! The init process of a new PID namespace.
//!
//! The first process in a PID namespace reaps orphans and takes the whole
//! namespace down when it exits. The spawner forks once more inside the
//! namespace: the child continues towards `execve()`, the original process
//! stays behind as init, forwards termination signals to it and exits
//! with its status.

use std::sync::atomic::{AtomicI32, Ordering};

use spawnd_common::constants::INIT_PROCESS_NAME;
use spawnd_core::sys;

static MAIN_PID: AtomicI32 = AtomicI32::new(0);

const FORWARDED_SIGNALS: [libc::c_int; 6] = [
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

extern "C" fn forward_signal(signal: libc::c_int) {
    let pid = MAIN_PID.load(Ordering::Relaxed);
    if pid > 0 {
        // SAFETY: kill() is async-signal-safe.
        let _ = unsafe { libc::kill(pid, signal) };
    }
}

fn install_forwarding() {
    for signal in FORWARDED_SIGNALS {
        // SAFETY: sigaction is plain data; zeroed means an empty mask and no flags.
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = forward_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        // SAFETY: the handler only touches an atomic and calls kill().
        let _ = unsafe { libc::sigaction(signal, &raw const action, std::ptr::null_mut()) };
    }
}

/// Converts the main child's wait status into init's exit code.
pub(crate) const fn exit_code(status: i32) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

/// Runs as init until `main_pid` exits. Never returns.
pub(crate) fn run(main_pid: libc::pid_t, error_pipe: libc::c_int) -> ! {
    // SAFETY: the error pipe belongs to the main child from here on.
    let _ = unsafe { libc::close(error_pipe) };
    let _ = sys::set_comm(INIT_PROCESS_NAME);

    MAIN_PID.store(main_pid, Ordering::Relaxed);
    install_forwarding();

    loop {
        let mut status = 0;
        // SAFETY: status points to a valid int.
        let pid = unsafe { libc::waitpid(-1, &raw mut status, 0) };
        if pid == main_pid {
            sys::exit_immediately(exit_code(status));
        }
        if pid < 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            sys::exit_immediately(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use spawnd_common::types::w_exitcode;

    use super::*;

    #[test]
    fn exit_code_mirrors_main_child() {
        assert_eq!(exit_code(w_exitcode(3, 0)), 3);
        assert_eq!(exit_code(w_exitcode(0, 0)), 0);
        assert_eq!(exit_code(libc::SIGTERM), 128 + libc::SIGTERM);
        assert_eq!(exit_code(libc::SIGKILL), 128 + 9);
    }
}
