//! inotify-driven watches on cgroup control files.
//!
//! The kernel signals changes of `cgroup.events`, `memory.events.local`
//! and `pids.events` with `IN_MODIFY`. Each watch re-reads the interesting
//! value on every notification.

use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use spawnd_common::error::{Result, SpawnError};
use spawnd_core::cgroup::events::{parse_populated, parse_value};
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct InotifyFd(Inotify);

impl AsRawFd for InotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// Modification notifications for one file.
pub struct FileWatch {
    inotify: AsyncFd<InotifyFd>,
    path: PathBuf,
}

impl std::fmt::Debug for FileWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatch").field("path", &self.path).finish_non_exhaustive()
    }
}

impl FileWatch {
    /// Watches `path` for modifications.
    ///
    /// # Errors
    ///
    /// Returns an error if inotify is unavailable or `path` does not exist.
    pub fn new(path: &Path) -> Result<Self> {
        let io_err = |e: io::Error| SpawnError::Io {
            path: path.to_path_buf(),
            source: e,
        };
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).map_err(|e| io_err(e.into()))?;
        let _ = inotify
            .add_watch(path, AddWatchFlags::IN_MODIFY)
            .map_err(|e| io_err(e.into()))?;
        Ok(Self {
            inotify: AsyncFd::new(InotifyFd(inotify)).map_err(io_err)?,
            path: path.to_path_buf(),
        })
    }

    /// The watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next modification.
    ///
    /// # Errors
    ///
    /// Returns the OS error if reading the inotify queue fails.
    pub async fn changed(&self) -> io::Result<()> {
        loop {
            let mut guard = self.inotify.readable().await?;
            match guard.get_inner().0.read_events() {
                Ok(events) if !events.is_empty() => return Ok(()),
                Ok(_) | Err(nix::errno::Errno::EAGAIN) => guard.clear_ready(),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn read_value(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok().as_deref().and_then(parse_value)
}

fn read_populated(events: &Path) -> Option<bool> {
    std::fs::read_to_string(events).ok().as_deref().and_then(parse_populated)
}

/// Publishes the `populated` flag of the cgroup at `directory`.
///
/// Must be called from within a [`tokio::task::LocalSet`]. The sender side
/// lives in a local task that ends when every receiver is gone.
///
/// # Errors
///
/// Returns an error if `cgroup.events` cannot be watched.
pub fn populated(directory: &Path) -> Result<watch::Receiver<bool>> {
    let events = directory.join("cgroup.events");
    let file_watch = FileWatch::new(&events)?;
    let (tx, rx) = watch::channel(read_populated(&events).unwrap_or(true));
    drop(tokio::task::spawn_local(async move {
        loop {
            tokio::select! {
                changed = file_watch.changed() => {
                    if let Err(e) = changed {
                        tracing::warn!(path = %events.display(), error = %e, "cgroup.events watch failed");
                        return;
                    }
                }
                () = tx.closed() => return,
            }
            if let Some(value) = read_populated(&events) {
                let _ = tx.send_replace(value);
            }
        }
    }));
    Ok(rx)
}

/// Calls back with a counter whenever its events file changes.
#[derive(Debug)]
pub struct CounterWatch {
    task: JoinHandle<()>,
}

impl CounterWatch {
    fn start(
        directory: &Path,
        events_file: &str,
        value_file: &str,
        mut callback: impl FnMut(u64) + 'static,
    ) -> Result<Self> {
        let file_watch = FileWatch::new(&directory.join(events_file))?;
        let value = directory.join(value_file);
        if !value.exists() {
            return Err(SpawnError::NotFound {
                kind: "cgroup file",
                id: value.display().to_string(),
            });
        }
        let task = tokio::task::spawn_local(async move {
            loop {
                if let Err(e) = file_watch.changed().await {
                    tracing::warn!(path = %file_watch.path().display(), error = %e, "cgroup watch failed");
                    return;
                }
                if let Some(current) = read_value(&value) {
                    callback(current);
                }
            }
        });
        Ok(Self { task })
    }

    /// Watches `memory.events.local` and reports `memory.current`.
    ///
    /// # Errors
    ///
    /// Returns an error if the memory controller files are missing.
    pub fn memory(directory: &Path, callback: impl FnMut(u64) + 'static) -> Result<Self> {
        Self::start(directory, "memory.events.local", "memory.current", callback)
    }

    /// Watches `pids.events` and reports `pids.current`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pids controller files are missing.
    pub fn pids(directory: &Path, callback: impl FnMut(u64) + 'static) -> Result<Self> {
        Self::start(directory, "pids.events", "pids.current", callback)
    }
}

impl Drop for CounterWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reads `memory.max` of the cgroup at `directory`.
pub fn memory_max(directory: &Path) -> Option<u64> {
    read_value(&directory.join("memory.max"))
}
