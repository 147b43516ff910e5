//! One client connection of the spawner.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;

use spawnd_common::constants::{EXIT_BATCH_SIZE, MAX_PAYLOAD};
use spawnd_common::error::{Result, SpawnError};
use spawnd_common::types::SPAWN_FAILED_STATUS;
use spawnd_core::prepared::PreparedChildProcess;
use spawnd_protocol::{MalformedRequest, Request, Response, request, response, scm};
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;

use super::Server;
use crate::exit_watch::ExitWatch;

/// Takes the next batch off `queue`: at most [`EXIT_BATCH_SIZE`] records
/// that fit into one datagram.
pub(super) fn take_batch(queue: &mut VecDeque<Response>) -> Vec<Response> {
    let mut size = 0;
    let mut batch = Vec::new();
    while batch.len() < EXIT_BATCH_SIZE {
        let Some(next) = queue.front() else { break };
        size += next.max_encoded_len();
        if size > MAX_PAYLOAD && !batch.is_empty() {
            break;
        }
        batch.extend(queue.pop_front());
    }
    batch
}

pub(super) struct Connection {
    id: u64,
    socket: AsyncFd<OwnedFd>,
    children: RefCell<HashMap<u32, ExitWatch>>,
    queue: RefCell<VecDeque<Response>>,
    wake: Notify,
}

impl Connection {
    pub(super) fn new(id: u64, socket: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            id,
            socket: AsyncFd::new(socket)?,
            children: RefCell::new(HashMap::new()),
            queue: RefCell::new(VecDeque::new()),
            wake: Notify::new(),
        })
    }

    pub(super) const fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn push(&self, response: Response) {
        self.queue.borrow_mut().push_back(response);
        self.wake.notify_one();
    }

    fn spawn_failed(&self, id: u32, error: &SpawnError) {
        self.push(Response::ExecComplete {
            id,
            error: Some(error.to_string()),
        });
        self.push(Response::Exit {
            id,
            status: SPAWN_FAILED_STATUS,
        });
    }

    /// Serves the connection until the peer hangs up.
    pub(super) async fn run(self: Rc<Self>, server: Rc<Server>) {
        let mut buffer = vec![0u8; MAX_PAYLOAD];
        loop {
            let want_write = !self.queue.borrow().is_empty();
            tokio::select! {
                readable = self.socket.readable() => {
                    let mut guard = match readable {
                        Ok(guard) => guard,
                        Err(e) => {
                            tracing::error!(connection = self.id, error = %e, "socket poll failed");
                            break;
                        }
                    };
                    match scm::receive(self.socket.get_ref().as_fd(), &mut buffer) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => guard.clear_ready(),
                        Ok(Some(received)) => {
                            let data = buffer.get(..received.len).unwrap_or_default();
                            self.handle(&server, data, received.fds);
                        }
                        Ok(None) => {
                            tracing::debug!(connection = self.id, "client hung up");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(connection = self.id, error = %e, "receive failed");
                            break;
                        }
                    }
                }
                writable = self.socket.writable(), if want_write => {
                    match writable {
                        Ok(mut guard) => {
                            if let Err(e) = self.flush_batch(&mut guard) {
                                tracing::error!(connection = self.id, error = %e, "send failed");
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(connection = self.id, error = %e, "socket poll failed");
                            break;
                        }
                    }
                }
                () = self.wake.notified(), if !want_write => {}
            }
        }
        self.hang_up();
    }

    fn flush_batch(&self, guard: &mut tokio::io::unix::AsyncFdReadyGuard<'_, OwnedFd>) -> io::Result<()> {
        let batch = take_batch(&mut self.queue.borrow_mut());
        let data = match response::serialize(&batch) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(connection = self.id, error = %e, "dropping unencodable responses");
                return Ok(());
            }
        };
        match scm::send(self.socket.get_ref().as_fd(), &data, &[]) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let mut queue = self.queue.borrow_mut();
                for response in batch.into_iter().rev() {
                    queue.push_front(response);
                }
                guard.clear_ready();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn handle(self: &Rc<Self>, server: &Rc<Server>, data: &[u8], fds: Vec<OwnedFd>) {
        match request::parse(data, fds) {
            Ok(Request::Connect(socket)) => server.add_connection(socket),
            Ok(Request::Exec { id, name, process }) => self.exec(server, id, &name, *process),
            Ok(Request::Kill(kills)) => {
                for (id, signal) in kills {
                    self.kill(id, signal);
                }
            }
            Err(MalformedRequest {
                exec_id: Some(id),
                error,
            }) => {
                tracing::warn!(connection = self.id, id, error = %error, "malformed EXEC request");
                self.spawn_failed(id, &error);
            }
            Err(MalformedRequest { exec_id: None, error }) => {
                tracing::warn!(connection = self.id, error = %error, "dropping malformed request");
            }
        }
    }

    fn exec(self: &Rc<Self>, server: &Server, id: u32, name: &str, process: PreparedChildProcess) {
        if self.children.borrow().contains_key(&id) {
            tracing::warn!(connection = self.id, id, "duplicate request id");
            self.spawn_failed(id, &SpawnError::Rejected {
                message: format!("request id {id} is already in use"),
            });
            return;
        }

        match self.try_exec(server, id, name, process) {
            Ok(watch) => {
                let _ = self.children.borrow_mut().insert(id, watch);
                self.push(Response::ExecComplete { id, error: None });
            }
            Err(e) => {
                tracing::warn!(connection = self.id, id, name, error = %e, "spawn failed");
                self.spawn_failed(id, &e);
            }
        }
    }

    fn try_exec(self: &Rc<Self>, server: &Server, id: u32, name: &str, mut process: PreparedChildProcess) -> Result<ExitWatch> {
        server.resolve_uid_gid(&mut process)?;
        let child = server.spawn(process)?;
        tracing::info!(connection = self.id, id, name, pid = child.pid, "spawned child process");

        let connection = Rc::downgrade(self);
        ExitWatch::start(child.pidfd, child.pid, move |status| {
            if let Some(connection) = connection.upgrade() {
                if connection.children.borrow_mut().remove(&id).is_some() {
                    connection.push(Response::Exit { id, status });
                }
            }
        })
        .map_err(|e| SpawnError::Os {
            operation: "registering pidfd",
            source: e,
        })
    }

    fn kill(&self, id: u32, signal: i32) {
        let Some(watch) = self.children.borrow_mut().remove(&id) else {
            tracing::debug!(connection = self.id, id, "kill for unknown child");
            return;
        };
        if let Err(e) = watch.signal(signal) {
            tracing::warn!(connection = self.id, id, pid = watch.pid(), signal, error = %e, "kill failed");
        }
        // Reaped without a report; the client forgot this id.
        drop(watch);
    }

    fn hang_up(&self) {
        let children: Vec<_> = self.children.borrow_mut().drain().collect();
        for (id, watch) in children {
            tracing::debug!(connection = self.id, id, pid = watch.pid(), "terminating orphaned child");
            let _ = watch.signal(libc::SIGTERM);
        }
        self.queue.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_bounded() {
        let mut queue: VecDeque<_> = (0..EXIT_BATCH_SIZE as u32 + 10)
            .map(|id| Response::Exit { id, status: 0 })
            .collect();
        assert_eq!(take_batch(&mut queue).len(), EXIT_BATCH_SIZE);
        assert_eq!(take_batch(&mut queue).len(), 10);
        assert!(take_batch(&mut queue).is_empty());
    }

    #[test]
    fn large_messages_split_batches() {
        let long = "x".repeat(MAX_PAYLOAD / 4);
        let mut queue: VecDeque<_> = (0..6)
            .map(|id| Response::ExecComplete {
                id,
                error: Some(long.clone()),
            })
            .collect();
        let first = take_batch(&mut queue);
        assert!(first.len() < 6);
        let encoded = response::serialize(&first).unwrap();
        assert!(encoded.len() <= MAX_PAYLOAD);
    }
}
