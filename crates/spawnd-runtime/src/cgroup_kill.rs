//! Terminating every process of a cgroup.
//!
//! The sequence is `SIGTERM` to all members, a grace period, then
//! `cgroup.kill` (or `SIGKILL` to each member on older kernels) and a
//! final grace period. The cgroup becoming unpopulated ends it early.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;

use spawnd_common::constants::{CGROUP_KILL_KILL_DELAY, CGROUP_KILL_TERM_DELAY};
use spawnd_common::error::{Result, SpawnError};
use spawnd_core::cgroup::events::{parse_populated, parse_procs};
use spawnd_core::cgroup::{CgroupState, read_file_at, write_file_at};
use tokio::sync::watch;

use crate::cgroup_watch;

/// Operations the kill sequence performs on a cgroup.
pub trait CgroupControl {
    /// Whether any process is left in the cgroup or its descendants.
    ///
    /// # Errors
    ///
    /// Returns the OS error of reading `cgroup.events`.
    fn is_populated(&self) -> io::Result<bool>;

    /// Sends `signal` to every member process.
    ///
    /// # Errors
    ///
    /// Returns the OS error of reading `cgroup.procs`.
    fn signal_all(&self, signal: libc::c_int) -> io::Result<()>;

    /// Kills every process, atomically where the kernel supports it.
    ///
    /// # Errors
    ///
    /// Returns the OS error of writing `cgroup.kill`.
    fn kill_all(&self) -> io::Result<()>;
}

/// Where the kill sequence stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillPhase {
    /// `SIGTERM` is about to be sent.
    SendTerm,
    /// Waiting for the processes to exit after `SIGTERM`.
    SendKill,
    /// Waiting for the processes to exit after `SIGKILL`.
    Timeout,
}

/// A cgroup directory below the spawner's delegated group.
#[derive(Debug)]
pub struct CgroupDirectory {
    fd: OwnedFd,
    path: PathBuf,
    supports_kill: bool,
}

impl CgroupDirectory {
    /// Opens the cgroup `relative` to the delegated group.
    ///
    /// # Errors
    ///
    /// Returns an error if cgroups are disabled or the cgroup is missing.
    pub fn open(state: &CgroupState, relative: &str) -> Result<Self> {
        Ok(Self {
            fd: state.open(relative)?,
            path: state.absolute_path(relative),
            supports_kill: state.supports_kill(),
        })
    }

    /// Absolute path of the directory.
    pub const fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl CgroupControl for CgroupDirectory {
    fn is_populated(&self) -> io::Result<bool> {
        let events = read_file_at(self.fd.as_fd(), "cgroup.events")?;
        Ok(parse_populated(&events).unwrap_or(true))
    }

    fn signal_all(&self, signal: libc::c_int) -> io::Result<()> {
        let procs = read_file_at(self.fd.as_fd(), "cgroup.procs")?;
        for pid in parse_procs(&procs) {
            // SAFETY: kill() with a pid read from cgroup.procs.
            if unsafe { libc::kill(pid, signal) } < 0 {
                tracing::debug!(pid, signal, error = %io::Error::last_os_error(), "kill failed");
            }
        }
        Ok(())
    }

    fn kill_all(&self) -> io::Result<()> {
        if self.supports_kill {
            write_file_at(self.fd.as_fd(), "cgroup.kill", b"1")
        } else {
            self.signal_all(libc::SIGKILL)
        }
    }
}

/// Resolves once `populated` reports `false`; never if its sender is gone.
async fn unpopulated(populated: &mut watch::Receiver<bool>) {
    if populated.wait_for(|p| !*p).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn failed(message: impl Into<String>) -> SpawnError {
    SpawnError::CgroupKill {
        message: message.into(),
    }
}

/// Runs the kill sequence on `control`.
///
/// `populated` carries change notifications of the `populated` flag;
/// [`cgroup_watch::populated`] provides them for a real cgroup.
///
/// # Errors
///
/// Returns [`SpawnError::CgroupKill`] if processes survive `SIGKILL` or the
/// cgroup cannot be read or signalled.
pub async fn run(control: &dyn CgroupControl, mut populated: watch::Receiver<bool>) -> Result<()> {
    // Deferred so callers can finish their own bookkeeping first.
    tokio::task::yield_now().await;

    let mut phase = KillPhase::SendTerm;
    loop {
        if !control.is_populated().map_err(|e| failed(format!("reading cgroup.events: {e}")))? {
            tracing::debug!(?phase, "cgroup is empty");
            return Ok(());
        }

        let delay = match phase {
            KillPhase::SendTerm => {
                control
                    .signal_all(libc::SIGTERM)
                    .map_err(|e| failed(format!("sending SIGTERM: {e}")))?;
                phase = KillPhase::SendKill;
                CGROUP_KILL_TERM_DELAY
            }
            KillPhase::SendKill => {
                tracing::info!("cgroup survived SIGTERM, killing");
                control
                    .kill_all()
                    .map_err(|e| failed(format!("sending SIGKILL: {e}")))?;
                phase = KillPhase::Timeout;
                CGROUP_KILL_KILL_DELAY
            }
            KillPhase::Timeout => return Err(failed("cgroup did not exit after SIGKILL")),
        };

        tokio::select! {
            () = unpopulated(&mut populated) => {
                tracing::debug!(?phase, "cgroup became empty");
                return Ok(());
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Kills everything in the cgroup `relative` to the delegated group.
///
/// Must be called from within a [`tokio::task::LocalSet`].
///
/// # Errors
///
/// Returns an error if the cgroup cannot be opened or watched, or the kill
/// sequence fails.
pub async fn kill_cgroup(state: &CgroupState, relative: &str) -> Result<()> {
    let directory = CgroupDirectory::open(state, relative)?;
    let populated = cgroup_watch::populated(directory.path())?;
    tracing::info!(cgroup = relative, "killing cgroup");
    run(&directory, populated).await
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct FakeCgroup {
        populated: Cell<bool>,
        signals: RefCell<Vec<libc::c_int>>,
        kills: Cell<u32>,
    }

    impl CgroupControl for FakeCgroup {
        fn is_populated(&self) -> io::Result<bool> {
            Ok(self.populated.get())
        }

        fn signal_all(&self, signal: libc::c_int) -> io::Result<()> {
            self.signals.borrow_mut().push(signal);
            Ok(())
        }

        fn kill_all(&self) -> io::Result<()> {
            self.kills.set(self.kills.get() + 1);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cgroup_succeeds_without_signals() {
        let cgroup = FakeCgroup::default();
        let (_tx, rx) = watch::channel(false);
        run(&cgroup, rx).await.unwrap();
        assert!(cgroup.signals.borrow().is_empty());
        assert_eq!(cgroup.kills.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn process_exiting_on_term_skips_kill() {
        let cgroup = Rc::new(FakeCgroup::default());
        cgroup.populated.set(true);
        let (tx, rx) = watch::channel(true);

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let task = tokio::task::spawn_local({
                    let cgroup = Rc::clone(&cgroup);
                    async move { run(cgroup.as_ref(), rx).await }
                });
                tokio::time::sleep(Duration::from_secs(3)).await;
                assert_eq!(*cgroup.signals.borrow(), [libc::SIGTERM]);
                cgroup.populated.set(false);
                let _ = tx.send_replace(false);
                task.await.unwrap().unwrap();
            })
            .await;
        assert_eq!(cgroup.kills.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn survivors_of_sigkill_are_an_error() {
        let cgroup = FakeCgroup::default();
        cgroup.populated.set(true);
        let (_tx, rx) = watch::channel(true);
        let started = tokio::time::Instant::now();
        let err = run(&cgroup, rx).await.unwrap_err();
        assert!(err.to_string().contains("did not exit after SIGKILL"));
        assert_eq!(*cgroup.signals.borrow(), [libc::SIGTERM]);
        assert_eq!(cgroup.kills.get(), 1);
        assert!(started.elapsed() >= CGROUP_KILL_TERM_DELAY + CGROUP_KILL_KILL_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_catches_exit_without_notification() {
        let cgroup = Rc::new(FakeCgroup::default());
        cgroup.populated.set(true);
        let (_tx, rx) = watch::channel(true);

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let task = tokio::task::spawn_local({
                    let cgroup = Rc::clone(&cgroup);
                    async move { run(cgroup.as_ref(), rx).await }
                });
                tokio::time::sleep(Duration::from_secs(1)).await;
                cgroup.populated.set(false);
                task.await.unwrap().unwrap();
            })
            .await;
        assert_eq!(cgroup.kills.get(), 0);
    }
}
