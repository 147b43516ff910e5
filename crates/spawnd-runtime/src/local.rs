//! In-process spawning without a separate spawner.

use std::cell::RefCell;
use std::rc::Rc;

use spawnd_common::error::{Result, SpawnError};
use spawnd_core::cgroup::CgroupState;
use spawnd_core::filesystem::NamedTmpfsResolver;
use spawnd_core::prepared::PreparedChildProcess;

use crate::direct::{self, SpawnContext};
use crate::exit_watch::ExitWatch;
use crate::named_tmpfs::NamedTmpfsManager;
use crate::service::{ChildProcessHandle, ExitListener, SpawnCompletionHandler, SpawnService};

type SharedListener = Rc<RefCell<Option<Box<dyn ExitListener>>>>;

/// [`SpawnService`] running the direct spawn engine in the calling process.
///
/// Spawning blocks the calling thread for the handshake. Must be used
/// from within a [`tokio::task::LocalSet`].
#[derive(Debug, Default)]
pub struct LocalSpawnService {
    cgroup_state: CgroupState,
    named_tmpfs: Option<NamedTmpfsManager>,
}

impl LocalSpawnService {
    /// Creates a service placing cgroups below `cgroup_state`.
    pub const fn new(cgroup_state: CgroupState) -> Self {
        Self {
            cgroup_state,
            named_tmpfs: None,
        }
    }

    /// Enables named tmpfs mounts.
    #[must_use]
    pub fn with_named_tmpfs(mut self, manager: NamedTmpfsManager) -> Self {
        self.named_tmpfs = Some(manager);
        self
    }

    /// The delegated cgroup children are created in.
    pub const fn cgroup_state(&self) -> &CgroupState {
        &self.cgroup_state
    }
}

impl SpawnService for LocalSpawnService {
    fn spawn_child_process(&self, name: &str, process: PreparedChildProcess) -> Result<Box<dyn ChildProcessHandle>> {
        let ctx = SpawnContext {
            cgroup_state: &self.cgroup_state,
            named_tmpfs: self.named_tmpfs.as_ref().map(|m| m as &dyn NamedTmpfsResolver),
        };
        let child = direct::spawn_child_process(process, &ctx)?;
        tracing::info!(name, pid = child.pid, "spawned child process");

        let listener: SharedListener = Rc::new(RefCell::new(None));
        let watch = ExitWatch::start(child.pidfd, child.pid, {
            let listener = Rc::clone(&listener);
            move |status| {
                if let Some(mut listener) = listener.borrow_mut().take() {
                    listener.on_child_process_exit(status);
                }
            }
        })
        .map_err(|e| SpawnError::Os {
            operation: "registering pidfd",
            source: e,
        })?;

        Ok(Box::new(LocalChild {
            watch: Some(watch),
            listener,
        }))
    }
}

struct LocalChild {
    watch: Option<ExitWatch>,
    listener: SharedListener,
}

impl ChildProcessHandle for LocalChild {
    fn set_exit_listener(&mut self, listener: Box<dyn ExitListener>) {
        *self.listener.borrow_mut() = Some(listener);
    }

    fn set_completion_handler(&mut self, mut handler: Box<dyn SpawnCompletionHandler>) {
        // The direct engine only returns after the program started.
        handler.on_spawn_success();
    }

    fn kill(mut self: Box<Self>, signal: i32) {
        let _ = self.listener.borrow_mut().take();
        if let Some(watch) = self.watch.take() {
            if let Err(e) = watch.signal(signal) {
                tracing::warn!(pid = watch.pid(), error = %e, "failed to kill child process");
            }
        }
    }
}

impl Drop for LocalChild {
    fn drop(&mut self) {
        let _ = self.listener.borrow_mut().take();
        if let Some(watch) = self.watch.take() {
            if !watch.has_exited() {
                let _ = watch.signal(libc::SIGTERM);
            }
        }
    }
}
