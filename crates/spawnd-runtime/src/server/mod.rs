//! The privileged spawner serving [`crate::client::SpawnServerClient`]s.
//!
//! The server starts with one connected socket. Further connections are
//! introduced over existing ones with `CONNECT`; each runs as its own
//! local task. The server returns once every connection is gone.

mod connection;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use spawnd_common::config::SpawnConfig;
use spawnd_common::error::{Result, SpawnError};
use spawnd_core::cgroup::CgroupState;
use spawnd_core::filesystem::NamedTmpfsResolver;
use spawnd_core::prepared::PreparedChildProcess;
use spawnd_core::sys;
use spawnd_protocol::Response;
use tokio::sync::Notify;

use self::connection::Connection;
use crate::cgroup_watch::{self, CounterWatch};
use crate::direct::{self, SpawnContext, SpawnedChild};
use crate::named_tmpfs::NamedTmpfsManager;

/// Custom uid/gid policy of the embedding daemon.
pub trait SpawnHook {
    /// Returns `true` to accept the request without consulting the
    /// configured allow-lists, `false` to fall back to them.
    ///
    /// # Errors
    ///
    /// An error rejects the request.
    fn verify(&self, process: &PreparedChildProcess) -> Result<bool>;
}

/// Applies the uid/gid policy to a decoded request.
///
/// An empty identity becomes `default_uid_gid`; anything else must pass
/// `hook` or the allow-lists of `config`.
///
/// # Errors
///
/// Returns [`SpawnError::Rejected`] if the identity is not allowed or no
/// default exists.
pub fn resolve_uid_gid(config: &SpawnConfig, hook: Option<&dyn SpawnHook>, process: &mut PreparedChildProcess) -> Result<()> {
    if process.uid_gid.is_empty() {
        if config.default_uid_gid.is_empty() {
            return Err(SpawnError::Rejected {
                message: "no uid/gid specified".into(),
            });
        }
        process.uid_gid = config.default_uid_gid.clone();
        return Ok(());
    }

    if let Some(hook) = hook {
        if hook.verify(process)? {
            return Ok(());
        }
    }
    config.check(&process.uid_gid)
}

struct Server {
    config: SpawnConfig,
    cgroup_state: CgroupState,
    named_tmpfs: NamedTmpfsManager,
    hook: Option<Box<dyn SpawnHook>>,
    connections: RefCell<BTreeMap<u64, Rc<Connection>>>,
    next_connection: Cell<u64>,
    idle: Notify,
}

impl Server {
    fn resolve_uid_gid(&self, process: &mut PreparedChildProcess) -> Result<()> {
        resolve_uid_gid(&self.config, self.hook.as_deref(), process)
    }

    fn spawn(&self, process: PreparedChildProcess) -> Result<SpawnedChild> {
        let ctx = SpawnContext {
            cgroup_state: &self.cgroup_state,
            named_tmpfs: Some(&self.named_tmpfs as &dyn NamedTmpfsResolver),
        };
        direct::spawn_child_process(process, &ctx)
    }

    fn add_connection(self: &Rc<Self>, socket: OwnedFd) {
        if let Err(e) = sys::set_nonblocking(socket.as_raw_fd(), true) {
            tracing::error!(error = %e, "cannot use new connection");
            return;
        }
        let id = self.next_connection.get();
        self.next_connection.set(id + 1);

        let connection = match Connection::new(id, socket) {
            Ok(connection) => Rc::new(connection),
            Err(e) => {
                tracing::error!(error = %e, "cannot register new connection");
                return;
            }
        };
        if self.cgroup_state.is_enabled() {
            connection.push(Response::CgroupsAvailable);
        }
        let _ = self.connections.borrow_mut().insert(id, Rc::clone(&connection));
        tracing::debug!(connection = id, "new connection");

        let server = Rc::clone(self);
        drop(tokio::task::spawn_local(async move {
            Rc::clone(&connection).run(Rc::clone(&server)).await;
            server.remove_connection(connection.id());
        }));
    }

    fn remove_connection(&self, id: u64) {
        let empty = {
            let mut connections = self.connections.borrow_mut();
            let _ = connections.remove(&id);
            connections.is_empty()
        };
        if empty {
            self.idle.notify_one();
        }
    }

    fn broadcast(&self, response: &Response) {
        for connection in self.connections.borrow().values() {
            connection.push(response.clone());
        }
    }

    fn watch_cgroup(self: &Rc<Self>) -> Vec<CounterWatch> {
        if !self.cgroup_state.is_enabled() {
            return Vec::new();
        }
        let directory = self.cgroup_state.absolute_path("");
        let mut watches = Vec::new();

        if let Some(max) = cgroup_watch::memory_max(&directory).filter(|max| *max != u64::MAX) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let threshold = (max as f64 * self.config.memory_warning_ratio) as u64;
            let server = Rc::downgrade(self);
            match CounterWatch::memory(&directory, move |current| {
                if current < threshold {
                    return;
                }
                tracing::warn!(current, max, "spawner cgroup close to its memory limit");
                if let Some(server) = server.upgrade() {
                    server.broadcast(&Response::MemoryWarning { current, max });
                }
            }) {
                Ok(watch) => watches.push(watch),
                Err(e) => tracing::warn!(error = %e, "cannot watch memory usage"),
            }
        }

        match CounterWatch::pids(&directory, |current| tracing::info!(pids = current, "spawner pid count changed")) {
            Ok(watch) => watches.push(watch),
            Err(e) => tracing::debug!(error = %e, "cannot watch pid count"),
        }
        watches
    }
}

/// The spawner side of the protocol.
pub struct SpawnServer {
    config: SpawnConfig,
    cgroup_state: CgroupState,
    named_tmpfs: NamedTmpfsManager,
    hook: Option<Box<dyn SpawnHook>>,
}

impl std::fmt::Debug for SpawnServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnServer")
            .field("cgroup_state", &self.cgroup_state)
            .field("named_tmpfs", &self.named_tmpfs)
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

impl SpawnServer {
    /// Creates a server placing child cgroups below `cgroup_state`.
    pub fn new(config: SpawnConfig, cgroup_state: CgroupState) -> Self {
        Self {
            config,
            cgroup_state,
            named_tmpfs: NamedTmpfsManager::default(),
            hook: None,
        }
    }

    /// Installs a custom uid/gid policy.
    #[must_use]
    pub fn with_hook(mut self, hook: Box<dyn SpawnHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Uses `manager` for named tmpfs mounts.
    #[must_use]
    pub fn with_named_tmpfs(mut self, manager: NamedTmpfsManager) -> Self {
        self.named_tmpfs = manager;
        self
    }

    /// Serves `socket` and every connection introduced through it.
    ///
    /// Must be called from within a [`tokio::task::LocalSet`].
    pub async fn run(self, socket: OwnedFd) {
        let server = Rc::new(Server {
            config: self.config,
            cgroup_state: self.cgroup_state,
            named_tmpfs: self.named_tmpfs,
            hook: self.hook,
            connections: RefCell::new(BTreeMap::new()),
            next_connection: Cell::new(0),
            idle: Notify::new(),
        });

        let _watches = server.watch_cgroup();
        server.add_connection(socket);
        while !server.connections.borrow().is_empty() {
            server.idle.notified().await;
        }
        tracing::info!("all connections closed, spawner exiting");
    }
}

#[cfg(test)]
mod tests {
    use spawnd_common::types::UidGid;

    use super::*;

    struct AllowRoot;

    impl SpawnHook for AllowRoot {
        fn verify(&self, process: &PreparedChildProcess) -> Result<bool> {
            Ok(process.uid_gid.uid == Some(0))
        }
    }

    fn config() -> SpawnConfig {
        SpawnConfig {
            default_uid_gid: UidGid::new(65534, 65534),
            allowed_uids: [1000].into(),
            allowed_gids: [1000].into(),
            ..SpawnConfig::default()
        }
    }

    #[test]
    fn empty_identity_gets_the_default() {
        let mut process = PreparedChildProcess::new();
        resolve_uid_gid(&config(), None, &mut process).unwrap();
        assert_eq!(process.uid_gid, UidGid::new(65534, 65534));
    }

    #[test]
    fn missing_default_is_rejected() {
        let mut process = PreparedChildProcess::new();
        let err = resolve_uid_gid(&SpawnConfig::default(), None, &mut process).unwrap_err();
        assert!(matches!(err, SpawnError::Rejected { .. }));
    }

    #[test]
    fn allow_lists_apply_without_hook() {
        let mut process = PreparedChildProcess::new();
        process.uid_gid = UidGid::new(1000, 1000);
        resolve_uid_gid(&config(), None, &mut process).unwrap();

        process.uid_gid = UidGid::new(0, 0);
        assert!(resolve_uid_gid(&config(), None, &mut process).is_err());
    }

    #[test]
    fn hook_can_accept_or_defer() {
        let mut process = PreparedChildProcess::new();
        process.uid_gid = UidGid::new(0, 0);
        resolve_uid_gid(&config(), Some(&AllowRoot), &mut process).unwrap();

        process.uid_gid = UidGid::new(1000, 1000);
        resolve_uid_gid(&config(), Some(&AllowRoot), &mut process).unwrap();

        process.uid_gid = UidGid::new(2000, 2000);
        assert!(resolve_uid_gid(&config(), Some(&AllowRoot), &mut process).is_err());
    }
}
