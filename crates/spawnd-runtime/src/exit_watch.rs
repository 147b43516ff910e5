//! Reaping children through their pidfds.
//!
//! Every spawned child gets a local task that waits for its pidfd to turn
//! readable and collects the wait status with `waitid(P_PIDFD)`. Unlike a
//! process-wide `waitpid(-1)` loop this never steals a status another
//! part of the process is waiting for.

use std::cell::Cell;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;

use spawnd_core::sys;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;

/// A child being watched.
#[derive(Debug)]
pub struct ExitWatch {
    pidfd: Rc<AsyncFd<OwnedFd>>,
    pid: libc::pid_t,
    exited: Rc<Cell<bool>>,
    task: JoinHandle<()>,
}

impl ExitWatch {
    /// Starts watching `pidfd`; `on_exit` gets the raw wait status.
    ///
    /// Must be called from within a [`tokio::task::LocalSet`].
    ///
    /// # Errors
    ///
    /// Returns an error if the pidfd cannot be registered with the reactor.
    pub fn start(pidfd: OwnedFd, pid: libc::pid_t, on_exit: impl FnOnce(i32) + 'static) -> io::Result<Self> {
        let pidfd = Rc::new(AsyncFd::new(pidfd)?);
        let exited = Rc::new(Cell::new(false));
        let task = tokio::task::spawn_local({
            let pidfd = Rc::clone(&pidfd);
            let exited = Rc::clone(&exited);
            async move {
                match wait_exit(&pidfd).await {
                    Ok(status) => {
                        exited.set(true);
                        tracing::debug!(pid, status, "child exited");
                        on_exit(status);
                    }
                    Err(e) => tracing::error!(pid, error = %e, "waiting for child failed"),
                }
            }
        });
        Ok(Self {
            pidfd,
            pid,
            exited,
            task,
        })
    }

    /// Pid in the spawner's PID namespace.
    pub const fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Returns `true` once the exit status was collected.
    pub fn has_exited(&self) -> bool {
        self.exited.get()
    }

    /// Sends `signal` unless the child has already been reaped.
    ///
    /// # Errors
    ///
    /// Returns the OS error of `pidfd_send_signal()`.
    pub fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        sys::pidfd_send_signal(self.pidfd.get_ref().as_fd(), signal)
    }

    /// Stops watching. The child is no longer reaped by this process.
    pub fn abort(self) {
        self.task.abort();
    }
}

async fn wait_exit(pidfd: &AsyncFd<OwnedFd>) -> io::Result<i32> {
    loop {
        let mut guard = pidfd.readable().await?;
        match sys::waitid_pidfd(pidfd.get_ref().as_fd()) {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => guard.clear_ready(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use spawnd_common::types::w_exitcode;
    use tokio::sync::oneshot;

    use super::*;

    fn fork_exiting(code: i32) -> (OwnedFd, libc::pid_t) {
        // SAFETY: the child only calls _exit().
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            sys::exit_immediately(code);
        }
        assert!(pid > 0);
        (sys::pidfd_open(pid).unwrap(), pid)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reports_exit_status() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (pidfd, pid) = fork_exiting(7);
                let (tx, rx) = oneshot::channel();
                let watch = ExitWatch::start(pidfd, pid, move |status| {
                    let _ = tx.send(status);
                })
                .unwrap();
                assert_eq!(watch.pid(), pid);
                assert_eq!(rx.await.unwrap(), w_exitcode(7, 0));
                assert!(watch.has_exited());
                watch.signal(libc::SIGTERM).unwrap();
            })
            .await;
    }
}
