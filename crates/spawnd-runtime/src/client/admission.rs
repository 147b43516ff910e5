//! Back pressure on spawn requests.
//!
//! While more than [`SPAWN_PRESSURE_THRESHOLD`] requests await their
//! `EXEC_COMPLETE`, new admission callbacks queue up and each completion
//! releases exactly one of them, in FIFO order.

use std::collections::VecDeque;

use spawnd_common::constants::SPAWN_PRESSURE_THRESHOLD;

use crate::service::AdmissionTicket;

type Callback = Box<dyn FnOnce()>;

/// Pending-exec counter plus the queue of waiting callbacks.
#[derive(Default)]
pub struct Admission {
    pending: usize,
    queue: VecDeque<(AdmissionTicket, Callback)>,
    next_ticket: u64,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("pending", &self.pending)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Admission {
    /// Returns `true` if new spawns should wait.
    pub const fn is_under_pressure(&self) -> bool {
        self.pending > SPAWN_PRESSURE_THRESHOLD
    }

    /// Requests sent but not yet completed.
    pub const fn pending(&self) -> usize {
        self.pending
    }

    /// Number of queued callbacks.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Counts a sent request.
    pub const fn on_exec_sent(&mut self) {
        self.pending += 1;
    }

    /// Counts a completed request and returns the callback it releases.
    ///
    /// The caller runs the callback after releasing any borrow of `self`.
    pub fn on_exec_complete(&mut self) -> Option<Callback> {
        self.pending = self.pending.saturating_sub(1);
        self.queue.pop_front().map(|(_, callback)| callback)
    }

    /// Queues `callback` if under pressure; otherwise hands it back to run now.
    pub fn enqueue(&mut self, callback: Callback) -> Result<AdmissionTicket, Callback> {
        if !self.is_under_pressure() {
            return Err(callback);
        }
        self.next_ticket += 1;
        let ticket = AdmissionTicket(self.next_ticket);
        self.queue.push_back((ticket, callback));
        Ok(ticket)
    }

    /// Removes the callback queued under `ticket`.
    pub fn cancel(&mut self, ticket: AdmissionTicket) -> bool {
        let before = self.queue.len();
        self.queue.retain(|(queued, _)| *queued != ticket);
        self.queue.len() != before
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn pressured() -> Admission {
        let mut admission = Admission::default();
        for _ in 0..=SPAWN_PRESSURE_THRESHOLD {
            admission.on_exec_sent();
        }
        assert!(admission.is_under_pressure());
        admission
    }

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, value: u32) -> Callback {
        let log = Rc::clone(log);
        Box::new(move || log.borrow_mut().push(value))
    }

    #[test]
    fn runs_immediately_without_pressure() {
        let mut admission = Admission::default();
        assert!(admission.enqueue(Box::new(|| {})).is_err());
        assert_eq!(admission.queued(), 0);
    }

    #[test]
    fn releases_one_callback_per_completion_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut admission = pressured();
        for value in 1..=3 {
            assert!(admission.enqueue(recorder(&log, value)).is_ok());
        }
        for _ in 0..3 {
            if let Some(callback) = admission.on_exec_complete() {
                callback();
            }
        }
        assert_eq!(*log.borrow(), [1, 2, 3]);
        assert!(admission.on_exec_complete().is_none());
    }

    #[test]
    fn cancel_removes_only_that_entry() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut admission = pressured();
        let _first = admission.enqueue(recorder(&log, 1)).ok().unwrap();
        let second = admission.enqueue(recorder(&log, 2)).ok().unwrap();
        let _third = admission.enqueue(recorder(&log, 3)).ok().unwrap();

        assert!(admission.cancel(second));
        assert!(!admission.cancel(second));
        while let Some(callback) = admission.on_exec_complete() {
            callback();
        }
        assert_eq!(*log.borrow(), [1, 3]);
    }
}
