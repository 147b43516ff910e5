//! The abstraction callers spawn through.
//!
//! [`SpawnService`] is implemented in-process by
//! [`crate::local::LocalSpawnService`] and over the wire protocol by
//! [`crate::client::SpawnServerClient`]; callers do not care which one
//! they hold.

use spawnd_common::error::{Result, SpawnError};
use spawnd_core::prepared::PreparedChildProcess;

/// Receives the raw wait status once the child has exited.
pub trait ExitListener {
    /// Called exactly once, unless the handle was killed or dropped first.
    fn on_child_process_exit(&mut self, status: i32);
}

impl<F: FnMut(i32)> ExitListener for F {
    fn on_child_process_exit(&mut self, status: i32) {
        self(status);
    }
}

/// Learns whether the program started.
pub trait SpawnCompletionHandler {
    /// The child is running its program.
    fn on_spawn_success(&mut self);

    /// The spawn failed; an exit notification follows.
    fn on_spawn_error(&mut self, error: SpawnError);
}

/// A spawned (or still spawning) child.
///
/// Dropping a handle whose child is still registered sends `SIGTERM`.
pub trait ChildProcessHandle {
    /// Sets the listener for the exit notification.
    fn set_exit_listener(&mut self, listener: Box<dyn ExitListener>);

    /// Sets the handler for the spawn outcome.
    fn set_completion_handler(&mut self, handler: Box<dyn SpawnCompletionHandler>);

    /// Sends `signal` and forgets the child; no exit notification follows.
    fn kill(self: Box<Self>, signal: i32);
}

/// Identifies a callback waiting in an admission queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdmissionTicket(pub(crate) u64);

/// Something that can spawn child processes.
pub trait SpawnService {
    /// Spawns `process`, using `name` in log messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is refused or cannot be sent (or,
    /// for in-process services, if the spawn itself fails).
    fn spawn_child_process(&self, name: &str, process: PreparedChildProcess) -> Result<Box<dyn ChildProcessHandle>>;

    /// Runs `callback` when the service is ready for another spawn.
    ///
    /// Without back pressure the callback runs right away and `None` is
    /// returned; otherwise it is queued and the ticket can cancel it.
    fn enqueue(&self, callback: Box<dyn FnOnce()>) -> Option<AdmissionTicket> {
        callback();
        None
    }

    /// Removes a queued callback. Unknown or already fired tickets are ignored.
    fn cancel_enqueue(&self, _ticket: AdmissionTicket) {}
}

struct OneshotCompletion(Option<tokio::sync::oneshot::Sender<Result<()>>>);

impl SpawnCompletionHandler for OneshotCompletion {
    fn on_spawn_success(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn on_spawn_error(&mut self, error: SpawnError) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// Waits for the outcome of a spawn, replacing the handle's completion
/// handler.
///
/// # Errors
///
/// Returns the spawn error, or [`SpawnError::Disconnected`] if the handle
/// can no longer report an outcome.
pub async fn wait_spawn_completion(handle: &mut dyn ChildProcessHandle) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    handle.set_completion_handler(Box::new(OneshotCompletion(Some(tx))));
    rx.await.unwrap_or(Err(SpawnError::Disconnected))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    struct NullService;

    impl SpawnService for NullService {
        fn spawn_child_process(&self, _name: &str, _process: PreparedChildProcess) -> Result<Box<dyn ChildProcessHandle>> {
            Err(SpawnError::Disconnected)
        }
    }

    #[test]
    fn default_enqueue_runs_immediately() {
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        let ticket = NullService.enqueue(Box::new(move || flag.set(true)));
        assert!(ticket.is_none());
        assert!(fired.get());
    }

    #[test]
    fn closures_are_exit_listeners() {
        let seen = Rc::new(Cell::new(None));
        let sink = Rc::clone(&seen);
        let mut listener: Box<dyn ExitListener> = Box::new(move |status| sink.set(Some(status)));
        listener.on_child_process_exit(256);
        assert_eq!(seen.get(), Some(256));
    }

    struct Immediate(Option<String>);

    impl ChildProcessHandle for Immediate {
        fn set_exit_listener(&mut self, _listener: Box<dyn ExitListener>) {}

        fn set_completion_handler(&mut self, mut handler: Box<dyn SpawnCompletionHandler>) {
            match self.0.take() {
                None => handler.on_spawn_success(),
                Some(message) => handler.on_spawn_error(SpawnError::ChildSetup { message }),
            }
        }

        fn kill(self: Box<Self>, _signal: i32) {}
    }

    #[tokio::test]
    async fn completion_is_awaitable() {
        wait_spawn_completion(&mut Immediate(None)).await.unwrap();
        let err = wait_spawn_completion(&mut Immediate(Some("exec failed".into())))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exec failed"));
    }

    struct Forgetful;

    impl ChildProcessHandle for Forgetful {
        fn set_exit_listener(&mut self, _listener: Box<dyn ExitListener>) {}

        fn set_completion_handler(&mut self, _handler: Box<dyn SpawnCompletionHandler>) {}

        fn kill(self: Box<Self>, _signal: i32) {}
    }

    #[tokio::test]
    async fn dropped_handler_reports_disconnect() {
        let err = wait_spawn_completion(&mut Forgetful).await.unwrap_err();
        assert!(matches!(err, SpawnError::Disconnected));
    }
}
