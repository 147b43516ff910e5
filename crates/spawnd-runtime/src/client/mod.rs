//! Client proxy spawning through a spawner connection.
//!
//! [`SpawnServerClient`] sends `EXEC`/`KILL` requests and demultiplexes the
//! `EXEC_COMPLETE`/`EXIT` responses to the right [`ChildProcessHandle`].
//! Handles are registered under their request id right after sending, so
//! a kill issued before the spawn completes still reaches the child.
//!
//! Requests that do not fit into the socket buffer are queued in order and
//! written by a background task once the socket is writable again.
//!
//! A client cannot work without its spawner: an unexpected hangup of the
//! socket terminates the whole process.

pub mod admission;
pub mod registry;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::rc::Rc;

use spawnd_common::config::SpawnConfig;
use spawnd_common::constants::MAX_PAYLOAD;
use spawnd_common::error::{Result, SpawnError};
use spawnd_core::prepared::PreparedChildProcess;
use spawnd_core::sys;
use spawnd_protocol::{Datagram, Response, request, response, scm};
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use self::admission::Admission;
use self::registry::IdAllocator;
use crate::service::{AdmissionTicket, ChildProcessHandle, ExitListener, SpawnCompletionHandler, SpawnService};

type MemoryWarningCallback = Box<dyn FnMut(u64, u64)>;

#[derive(Default)]
struct ChildEntry {
    listener: Option<Box<dyn ExitListener>>,
    completion: Option<Box<dyn SpawnCompletionHandler>>,
    /// `EXEC_COMPLETE` arrived before a completion handler was set.
    outcome: Option<Option<String>>,
}

#[derive(Default)]
struct State {
    socket: Option<Rc<AsyncFd<OwnedFd>>>,
    ids: IdAllocator,
    children: HashMap<u32, ChildEntry>,
    admission: Admission,
    cgroups_available: bool,
    memory_warning: Option<MemoryWarningCallback>,
    shutting_down: bool,
    /// Close once `outgoing` is drained.
    closing: bool,
    /// Requests waiting for the socket to become writable.
    outgoing: VecDeque<Datagram>,
    receiver: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
}

struct Shared {
    config: SpawnConfig,
    state: RefCell<State>,
    /// Wakes the send task when `outgoing` gains an entry.
    queued: Notify,
}

/// Returns `false` if the socket buffer is full.
fn try_send(socket: BorrowedFd<'_>, datagram: &Datagram) -> Result<bool> {
    let fds: Vec<BorrowedFd<'_>> = datagram.fds.iter().map(AsFd::as_fd).collect();
    match scm::send(socket, &datagram.data, &fds) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::EPIPE) || e.raw_os_error() == Some(libc::ECONNRESET) => {
            Err(SpawnError::Disconnected)
        }
        Err(e) => Err(SpawnError::Os {
            operation: "sendmsg",
            source: e,
        }),
    }
}

impl Shared {
    fn socket(&self) -> Result<Rc<AsyncFd<OwnedFd>>> {
        self.state.borrow().socket.clone().ok_or(SpawnError::Disconnected)
    }

    /// Sends `datagram` now, or queues it behind earlier requests.
    fn send(&self, datagram: Datagram) -> Result<()> {
        let socket = self.socket()?;
        if self.state.borrow().outgoing.is_empty() && try_send(socket.get_ref().as_fd(), &datagram)? {
            return Ok(());
        }
        let mut state = self.state.borrow_mut();
        state.outgoing.push_back(datagram);
        tracing::trace!(queued = state.outgoing.len(), "spawner socket is full");
        drop(state);
        self.queued.notify_one();
        Ok(())
    }

    fn kill(&self, id: u32, signal: i32) {
        if self.state.borrow_mut().children.remove(&id).is_none() {
            return;
        }
        let sent = request::serialize_kill(&[(id, signal)]).and_then(|datagram| self.send(datagram));
        if let Err(e) = sent {
            tracing::warn!(id, signal, error = %e, "failed to send KILL");
        }
        self.finish_shutdown_if_idle();
    }

    fn finish_shutdown_if_idle(&self) {
        let idle = {
            let state = self.state.borrow();
            state.shutting_down && state.children.is_empty() && state.outgoing.is_empty()
        };
        if idle {
            self.close();
        }
    }

    /// Closes the socket, after the send task has written what is queued.
    fn close(&self) {
        let (socket, tasks) = {
            let mut state = self.state.borrow_mut();
            if !state.outgoing.is_empty() && state.sender.is_some() {
                state.closing = true;
                return;
            }
            (state.socket.take(), [state.receiver.take(), state.sender.take()])
        };
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        if socket.is_some() {
            tracing::debug!("closed spawner connection");
        }
    }

    fn on_exec_complete(&self, id: u32, error: Option<String>) {
        let (released, handler) = {
            let mut state = self.state.borrow_mut();
            let released = state.admission.on_exec_complete();
            let handler = state.children.get_mut(&id).and_then(|entry| {
                let handler = entry.completion.take();
                if handler.is_none() {
                    entry.outcome = Some(error.clone());
                }
                handler
            });
            (released, handler)
        };

        if let Some(error) = &error {
            tracing::debug!(id, error = %error, "spawn failed");
        }
        if let Some(mut handler) = handler {
            complete(handler.as_mut(), error);
        }
        if let Some(callback) = released {
            callback();
        }
    }

    fn on_exit(&self, id: u32, status: i32) {
        let entry = self.state.borrow_mut().children.remove(&id);
        if let Some(mut listener) = entry.and_then(|e| e.listener) {
            listener.on_child_process_exit(status);
        }
        self.finish_shutdown_if_idle();
    }

    fn on_memory_warning(&self, current: u64, max: u64) {
        let callback = self.state.borrow_mut().memory_warning.take();
        if let Some(mut callback) = callback {
            callback(current, max);
            let mut state = self.state.borrow_mut();
            if state.memory_warning.is_none() {
                state.memory_warning = Some(callback);
            }
        } else {
            tracing::warn!(current, max, "spawner memory warning");
        }
    }

    fn dispatch(&self, response: Response) {
        match response {
            Response::ExecComplete { id, error } => self.on_exec_complete(id, error),
            Response::Exit { id, status } => self.on_exit(id, status),
            Response::MemoryWarning { current, max } => self.on_memory_warning(current, max),
            Response::CgroupsAvailable => self.state.borrow_mut().cgroups_available = true,
        }
    }
}

fn complete(handler: &mut dyn SpawnCompletionHandler, error: Option<String>) {
    match error {
        None => handler.on_spawn_success(),
        Some(message) => handler.on_spawn_error(SpawnError::ChildSetup { message }),
    }
}

async fn receive_loop(shared: Rc<Shared>, socket: Rc<AsyncFd<OwnedFd>>) {
    let mut buffer = vec![0u8; MAX_PAYLOAD];
    loop {
        let received = match socket.readable().await {
            Ok(mut guard) => match scm::receive(socket.get_ref().as_fd(), &mut buffer) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                    continue;
                }
                other => other,
            },
            Err(e) => Err(e),
        };

        match received {
            Ok(Some(received)) => {
                let data = buffer.get(..received.len).unwrap_or_default();
                match response::parse(data) {
                    Ok(responses) => responses.into_iter().for_each(|r| shared.dispatch(r)),
                    Err(e) => tracing::error!(error = %e, "malformed response from spawner"),
                }
            }
            Ok(None) => {
                tracing::error!("spawner closed the connection");
                sys::exit_immediately(1);
            }
            Err(e) => {
                tracing::error!(error = %e, "spawner connection failed");
                sys::exit_immediately(1);
            }
        }
    }
}

async fn send_loop(shared: Rc<Shared>, socket: Rc<AsyncFd<OwnedFd>>) {
    loop {
        let (empty, closing) = {
            let state = shared.state.borrow();
            (state.outgoing.is_empty(), state.closing)
        };
        if empty {
            if closing {
                shared.close();
                return;
            }
            shared.finish_shutdown_if_idle();
            shared.queued.notified().await;
            continue;
        }
        let mut guard = match socket.writable().await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!(error = %e, "spawner connection failed");
                sys::exit_immediately(1);
            }
        };
        let sent = {
            let state = shared.state.borrow();
            let Some(datagram) = state.outgoing.front() else {
                continue;
            };
            try_send(socket.get_ref().as_fd(), datagram)
        };
        match sent {
            Ok(true) => drop(shared.state.borrow_mut().outgoing.pop_front()),
            Ok(false) => guard.clear_ready(),
            Err(e) => {
                tracing::error!(error = %e, "cannot send to the spawner");
                sys::exit_immediately(1);
            }
        }
    }
}

/// Connection to a spawner process.
///
/// Must be created and used from within a [`tokio::task::LocalSet`].
pub struct SpawnServerClient {
    shared: Rc<Shared>,
}

impl std::fmt::Debug for SpawnServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("SpawnServerClient")
            .field("connected", &state.socket.is_some())
            .field("children", &state.children.len())
            .field("admission", &state.admission)
            .finish()
    }
}

impl SpawnServerClient {
    /// Wraps a connected `SOCK_SEQPACKET` socket.
    ///
    /// `config` is used to verify uid/gid requests before they are sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be registered with the reactor.
    pub fn new(socket: OwnedFd, config: SpawnConfig) -> Result<Self> {
        sys::set_nonblocking(socket.as_raw_fd(), true).map_err(|e| SpawnError::Os {
            operation: "fcntl",
            source: e,
        })?;
        let socket = Rc::new(AsyncFd::new(socket).map_err(|e| SpawnError::Os {
            operation: "registering socket",
            source: e,
        })?);
        let shared = Rc::new(Shared {
            config,
            state: RefCell::new(State {
                socket: Some(Rc::clone(&socket)),
                ..State::default()
            }),
            queued: Notify::new(),
        });
        let receiver = tokio::task::spawn_local(receive_loop(Rc::clone(&shared), Rc::clone(&socket)));
        let sender = tokio::task::spawn_local(send_loop(Rc::clone(&shared), socket));
        let mut state = shared.state.borrow_mut();
        state.receiver = Some(receiver);
        state.sender = Some(sender);
        drop(state);
        Ok(Self { shared })
    }

    /// Creates a new connection to the same spawner, e.g. for a forked
    /// worker process, and returns its socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket pair cannot be created or sent.
    pub fn connect(&self) -> Result<OwnedFd> {
        let (local, remote) = sys::seqpacket_pair(false).map_err(|e| SpawnError::Os {
            operation: "socketpair",
            source: e,
        })?;
        self.shared.send(request::serialize_connect(remote))?;
        Ok(local)
    }

    /// Closes the connection as soon as no child is registered any more
    /// and queued requests have been written.
    pub fn close(&self) {
        self.shared.state.borrow_mut().shutting_down = true;
        self.shared.finish_shutdown_if_idle();
    }

    /// Returns `true` while the socket is open.
    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().socket.is_some()
    }

    /// Returns `true` once the spawner announced cgroup support.
    pub fn supports_cgroups(&self) -> bool {
        self.shared.state.borrow().cgroups_available
    }

    /// Sets the callback for the spawner's memory warnings
    /// (`memory.current`, `memory.max`).
    pub fn on_memory_warning(&self, callback: impl FnMut(u64, u64) + 'static) {
        self.shared.state.borrow_mut().memory_warning = Some(Box::new(callback));
    }

    /// Requests sent but not yet completed.
    pub fn pending_execs(&self) -> usize {
        self.shared.state.borrow().admission.pending()
    }

    /// Waits until a new spawn is admitted.
    ///
    /// Dropping the future before it resolves cancels the queued entry.
    pub async fn wait_admission(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let Some(ticket) = self.enqueue(Box::new(move || {
            let _ = tx.send(());
        })) else {
            return;
        };
        let _guard = CancelAdmission {
            client: self,
            ticket,
        };
        let _ = rx.await;
    }
}

struct CancelAdmission<'a> {
    client: &'a SpawnServerClient,
    ticket: AdmissionTicket,
}

impl Drop for CancelAdmission<'_> {
    fn drop(&mut self) {
        self.client.cancel_enqueue(self.ticket);
    }
}

impl Drop for SpawnServerClient {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl SpawnService for SpawnServerClient {
    fn spawn_child_process(&self, name: &str, process: PreparedChildProcess) -> Result<Box<dyn ChildProcessHandle>> {
        self.shared.config.check(&process.uid_gid)?;

        let id = {
            let mut state = self.shared.state.borrow_mut();
            let State { ids, children, .. } = &mut *state;
            ids.allocate(|id| children.contains_key(&id)).ok_or_else(|| SpawnError::Rejected {
                message: "too many child processes".into(),
            })?
        };

        let datagram = request::serialize_exec(id, name, process)?;
        self.shared.send(datagram)?;

        {
            let mut state = self.shared.state.borrow_mut();
            let _ = state.children.insert(id, ChildEntry::default());
            state.admission.on_exec_sent();
        }
        tracing::debug!(id, name, "sent spawn request");

        Ok(Box::new(ClientChild {
            id,
            shared: Rc::clone(&self.shared),
        }))
    }

    fn enqueue(&self, callback: Box<dyn FnOnce()>) -> Option<AdmissionTicket> {
        let queued = self.shared.state.borrow_mut().admission.enqueue(callback);
        match queued {
            Ok(ticket) => Some(ticket),
            Err(callback) => {
                callback();
                None
            }
        }
    }

    fn cancel_enqueue(&self, ticket: AdmissionTicket) {
        let _ = self.shared.state.borrow_mut().admission.cancel(ticket);
    }
}

struct ClientChild {
    id: u32,
    shared: Rc<Shared>,
}

impl ChildProcessHandle for ClientChild {
    fn set_exit_listener(&mut self, listener: Box<dyn ExitListener>) {
        if let Some(entry) = self.shared.state.borrow_mut().children.get_mut(&self.id) {
            entry.listener = Some(listener);
        }
    }

    fn set_completion_handler(&mut self, mut handler: Box<dyn SpawnCompletionHandler>) {
        let outcome = {
            let mut state = self.shared.state.borrow_mut();
            match state.children.get_mut(&self.id) {
                Some(entry) if entry.outcome.is_none() => {
                    entry.completion = Some(handler);
                    return;
                }
                Some(entry) => entry.outcome.take(),
                None => None,
            }
        };
        if let Some(error) = outcome {
            complete(handler.as_mut(), error);
        }
    }

    fn kill(self: Box<Self>, signal: i32) {
        self.shared.kill(self.id, signal);
    }
}

impl Drop for ClientChild {
    fn drop(&mut self) {
        self.shared.kill(self.id, libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn numbered(n: u32) -> Datagram {
        let mut data = n.to_le_bytes().to_vec();
        data.resize(4096, 0);
        Datagram { data, fds: Vec::new() }
    }

    #[tokio::test]
    async fn full_socket_queues_requests_in_order() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (local, peer) = sys::seqpacket_pair(true).unwrap();
                let client = SpawnServerClient::new(local, SpawnConfig::default()).unwrap();

                let mut sent = 0;
                while client.shared.state.borrow().outgoing.len() < 4 {
                    client.shared.send(numbered(sent)).unwrap();
                    sent += 1;
                    assert!(sent < 100_000, "the socket never filled up");
                }

                let mut buffer = vec![0u8; 8192];
                let mut expected = 0u32;
                let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
                while expected < sent {
                    match scm::receive(peer.as_fd(), &mut buffer) {
                        Ok(Some(received)) => {
                            assert_eq!(received.len, 4096);
                            assert_eq!(buffer[..4], expected.to_le_bytes());
                            expected += 1;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            assert!(tokio::time::Instant::now() < deadline, "queue stalled at {expected}");
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                        other => panic!("unexpected receive result: {other:?}"),
                    }
                }
                assert!(client.shared.state.borrow().outgoing.is_empty());
                assert!(client.is_connected());
            })
            .await;
    }

    #[tokio::test]
    async fn close_waits_for_queued_requests() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (local, peer) = sys::seqpacket_pair(true).unwrap();
                let client = SpawnServerClient::new(local, SpawnConfig::default()).unwrap();
                let mut sent = 0;
                while client.shared.state.borrow().outgoing.is_empty() {
                    client.shared.send(numbered(sent)).unwrap();
                    sent += 1;
                    assert!(sent < 100_000, "the socket never filled up");
                }
                client.close();
                assert!(client.is_connected());

                let mut buffer = vec![0u8; 8192];
                let mut received = 0;
                loop {
                    match scm::receive(peer.as_fd(), &mut buffer) {
                        Ok(Some(_)) => received += 1,
                        Ok(None) => break,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                        Err(e) => panic!("receive failed: {e}"),
                    }
                }
                assert_eq!(received, sent);
                assert!(!client.is_connected());
            })
            .await;
    }
}
