//! Mailboxes and process result slots.
//!
//! Both live in the kernel rather than on the process so that senders and
//! joiners never have to find which scheduler currently holds the target
//! process. Each mailbox and each result slot carries its own lock; the
//! kernel-level maps have a separate one.

use std::collections::VecDeque;

use spinning_top::Spinlock;

use crate::value::Value;

/// An ordered queue of values addressed by PID. Values sent here are detached
/// from their sender and may outlive it.
#[derive(Debug, Default)]
pub struct Mailbox {
    messages: Spinlock<VecDeque<Value>>,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox::default()
    }

    pub fn send(&self, message: Value) {
        self.messages.lock().push_back(message);
    }

    /// Drain every queued message into the receiver's local queue, preserving
    /// order.
    pub fn receive(&self, into: &mut VecDeque<Value>) {
        let mut messages = self.messages.lock();
        into.extend(messages.drain(..));
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct ResultInner {
    value_returned: Option<Value>,
    exception_thrown: Option<Value>,
    done: bool,
}

/// Where a joinable process leaves its outcome: either a return value or the
/// exception that killed it. Each may be fetched exactly once.
#[derive(Debug, Default)]
pub struct ProcessResult {
    inner: Spinlock<ResultInner>,
}

impl ProcessResult {
    pub fn new() -> ProcessResult {
        ProcessResult::default()
    }

    /// Has the process stopped, for any reason?
    pub fn stopped(&self) -> bool {
        self.inner.lock().done
    }

    /// Did the process stop by throwing?
    pub fn terminated(&self) -> bool {
        let inner = self.inner.lock();
        inner.done && inner.exception_thrown.is_some()
    }

    /// Record successful completion.
    pub fn resolve(&self, value: Value) {
        let mut inner = self.inner.lock();
        inner.value_returned = Some(value);
        inner.done = true;
    }

    /// Record death by exception.
    pub fn raise(&self, exception: Value) {
        let mut inner = self.inner.lock();
        inner.exception_thrown = Some(exception);
        inner.done = true;
    }

    pub fn transfer_result(&self) -> Option<Value> {
        self.inner.lock().value_returned.take()
    }

    pub fn transfer_exception(&self) -> Option<Value> {
        self.inner.lock().exception_thrown.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_preserves_send_order() {
        let mailbox = Mailbox::new();
        mailbox.send(Value::Int(1));
        mailbox.send(Value::Int(2));
        mailbox.send(Value::Int(3));

        let mut received = VecDeque::new();
        mailbox.receive(&mut received);
        assert!(mailbox.is_empty());

        let drained: Vec<i64> = received
            .iter()
            .map(|v| match v {
                Value::Int(n) => *n,
                other => panic!("unexpected message {other:?}"),
            })
            .collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[test]
    fn result_slot_transfers_exactly_once() {
        let slot = ProcessResult::new();
        assert!(!slot.stopped());

        slot.resolve(Value::Int(55));
        assert!(slot.stopped());
        assert!(!slot.terminated());
        assert!(slot.transfer_result().is_some());
        assert!(slot.transfer_result().is_none());
    }

    #[test]
    fn raised_slot_reports_termination() {
        let slot = ProcessResult::new();
        slot.raise(Value::string("boom"));
        assert!(slot.stopped());
        assert!(slot.terminated());
        assert!(slot.transfer_exception().is_some());
    }
}
