//! The asynchronous I/O engine.
//!
//! Processes submit *interactions* (read, write, close, or the no-op empty
//! completion); dedicated I/O worker threads execute them and post results
//! keyed by request id. A request id is `(fd, per-fd counter)`, and at most
//! one interaction per fd is in flight at a time, which gives same-fd
//! submissions their FIFO guarantee while different fds complete freely.
//!
//! Cancellation is level-triggered and idempotent: a flag on the interaction
//! that the worker checks before issuing the syscall. An interaction that is
//! still queued when cancelled is dropped immediately.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace};
use spinning_top::Spinlock;

use crate::kernel::WakeSignal;
use crate::value::{fault, tags, Value};

pub use crate::value::IoRequestId;

/// Outcome of an executed interaction.
#[derive(Debug)]
pub enum InteractionResult {
    Success(Value),
    Error(Value),
    Cancelled,
}

/// A work item consumed by an I/O worker.
pub trait Interaction: Send {
    fn id(&self) -> IoRequestId;
    /// Request cancellation. Safe to call any number of times, from any
    /// thread.
    fn cancel(&self);
    /// Perform the work. Runs on an I/O worker thread.
    fn interact(&mut self) -> InteractionResult;
}

#[derive(Debug, Clone)]
struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    fn new() -> CancelFlag {
        CancelFlag(Arc::new(AtomicBool::new(false)))
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Read up to `limit` bytes from a descriptor.
pub struct IoRead {
    id: IoRequestId,
    fd: RawFd,
    limit: usize,
    cancel: CancelFlag,
}

/// Write a buffer to a descriptor.
pub struct IoWrite {
    id: IoRequestId,
    fd: RawFd,
    buffer: Vec<u8>,
    cancel: CancelFlag,
}

/// Close an owned descriptor.
pub struct IoClose {
    id: IoRequestId,
    fd: Option<OwnedFd>,
    cancel: CancelFlag,
}

/// A completion that performs no syscall. Emitted for closes of borrowed
/// descriptors, which must complete without touching the fd.
pub struct IoEmpty {
    id: IoRequestId,
    cancel: CancelFlag,
}

impl Interaction for IoRead {
    fn id(&self) -> IoRequestId {
        self.id
    }

    fn cancel(&self) {
        self.cancel.set();
    }

    fn interact(&mut self) -> InteractionResult {
        if self.cancel.is_set() {
            return InteractionResult::Cancelled;
        }
        // Borrow the descriptor as a File without taking ownership of it.
        let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(self.fd) });
        let mut buffer = vec![0u8; self.limit];
        let outcome = file.read(&mut buffer);
        if self.cancel.is_set() {
            return InteractionResult::Cancelled;
        }
        match outcome {
            Ok(n) => InteractionResult::Success(Value::string(
                String::from_utf8_lossy(&buffer[..n]).into_owned(),
            )),
            Err(e) => InteractionResult::Error(io_error(&e)),
        }
    }
}

impl Interaction for IoWrite {
    fn id(&self) -> IoRequestId {
        self.id
    }

    fn cancel(&self) {
        self.cancel.set();
    }

    fn interact(&mut self) -> InteractionResult {
        if self.cancel.is_set() {
            return InteractionResult::Cancelled;
        }
        let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(self.fd) });
        let outcome = file.write(&self.buffer).and_then(|n| {
            file.flush()?;
            Ok(n)
        });
        if self.cancel.is_set() {
            return InteractionResult::Cancelled;
        }
        match outcome {
            Ok(n) => InteractionResult::Success(Value::Int(n as i64)),
            Err(e) => InteractionResult::Error(io_error(&e)),
        }
    }
}

impl Interaction for IoClose {
    fn id(&self) -> IoRequestId {
        self.id
    }

    fn cancel(&self) {
        self.cancel.set();
    }

    fn interact(&mut self) -> InteractionResult {
        if self.cancel.is_set() {
            return InteractionResult::Cancelled;
        }
        // Dropping the OwnedFd performs the close.
        drop(self.fd.take());
        InteractionResult::Success(Value::Int(1))
    }
}

impl Interaction for IoEmpty {
    fn id(&self) -> IoRequestId {
        self.id
    }

    fn cancel(&self) {
        self.cancel.set();
    }

    fn interact(&mut self) -> InteractionResult {
        if self.cancel.is_set() {
            return InteractionResult::Cancelled;
        }
        InteractionResult::Success(Value::Void)
    }
}

fn io_error(e: &std::io::Error) -> Value {
    fault(
        tags::IO_ERROR,
        format!("{} (errno {})", e, e.raw_os_error().unwrap_or(0)),
    )
}

struct EngineQueue {
    queue: VecDeque<Box<dyn Interaction>>,
    /// Descriptors with an interaction currently executing. Used to keep
    /// per-fd FIFO order with multiple workers.
    busy: HashSet<RawFd>,
}

/// The submission/completion engine shared between processes and I/O workers.
pub struct IoEngine {
    state: Mutex<EngineQueue>,
    work_available: Condvar,
    /// Outstanding (submitted, unconsumed) requests and their cancel flags.
    requests: Spinlock<HashMap<IoRequestId, CancelFlag>>,
    results: Spinlock<HashMap<IoRequestId, InteractionResult>>,
    counters: Spinlock<HashMap<RawFd, u64>>,
    shutdown: AtomicBool,
    wake: Arc<WakeSignal>,
}

impl IoEngine {
    pub fn new(wake: Arc<WakeSignal>) -> IoEngine {
        IoEngine {
            state: Mutex::new(EngineQueue {
                queue: VecDeque::new(),
                busy: HashSet::new(),
            }),
            work_available: Condvar::new(),
            requests: Spinlock::new(HashMap::new()),
            results: Spinlock::new(HashMap::new()),
            counters: Spinlock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            wake,
        }
    }

    fn next_id(&self, fd: RawFd) -> IoRequestId {
        let mut counters = self.counters.lock();
        let counter = counters.entry(fd).or_insert(0);
        *counter += 1;
        IoRequestId {
            fd,
            counter: *counter,
        }
    }

    /// Create and submit a read interaction.
    pub fn submit_read(&self, fd: RawFd, limit: usize) -> IoRequestId {
        let id = self.next_id(fd);
        let cancel = CancelFlag::new();
        self.schedule(
            id,
            cancel.clone(),
            Box::new(IoRead {
                id,
                fd,
                limit,
                cancel,
            }),
        );
        id
    }

    /// Create and submit a write interaction.
    pub fn submit_write(&self, fd: RawFd, buffer: Vec<u8>) -> IoRequestId {
        let id = self.next_id(fd);
        let cancel = CancelFlag::new();
        self.schedule(
            id,
            cancel.clone(),
            Box::new(IoWrite {
                id,
                fd,
                buffer,
                cancel,
            }),
        );
        id
    }

    /// Create and submit a close. `fd` present means the descriptor is owned
    /// and really closed; absent means a borrowed handle, which completes
    /// through an empty interaction instead.
    pub fn submit_close(&self, raw: RawFd, fd: Option<OwnedFd>) -> IoRequestId {
        let id = self.next_id(raw);
        let cancel = CancelFlag::new();
        let interaction: Box<dyn Interaction> = match fd {
            Some(owned) => Box::new(IoClose {
                id,
                fd: Some(owned),
                cancel: cancel.clone(),
            }),
            None => Box::new(IoEmpty {
                id,
                cancel: cancel.clone(),
            }),
        };
        self.schedule(id, cancel, interaction);
        id
    }

    fn schedule(&self, id: IoRequestId, cancel: CancelFlag, interaction: Box<dyn Interaction>) {
        trace!("io: submit {id}");
        self.requests.lock().insert(id, cancel);
        let mut state = self.state.lock().expect("io queue poisoned");
        state.queue.push_back(interaction);
        drop(state);
        self.work_available.notify_one();
    }

    /// Cancel a request. If it has not started executing it is dropped from
    /// the queue right away; either way the request leaves kernel tracking.
    pub fn cancel(&self, id: IoRequestId) {
        let flag = self.requests.lock().remove(&id);
        if let Some(flag) = flag {
            flag.set();
        }
        let mut state = self.state.lock().expect("io queue poisoned");
        state.queue.retain(|interaction| interaction.id() != id);
        drop(state);
        self.results.lock().remove(&id);
        debug!("io: cancelled {id}");
    }

    /// Is a completion available for this request?
    pub fn is_complete(&self, id: IoRequestId) -> bool {
        self.results.lock().contains_key(&id)
    }

    /// Whether the engine still tracks this request in any form.
    pub fn is_tracked(&self, id: IoRequestId) -> bool {
        self.requests.lock().contains_key(&id) || self.results.lock().contains_key(&id)
    }

    /// Consume the result of a completed request.
    pub fn take_result(&self, id: IoRequestId) -> Option<InteractionResult> {
        self.results.lock().remove(&id)
    }

    fn complete(&self, id: IoRequestId, result: InteractionResult) {
        // A request cancelled while executing has already left tracking; its
        // result would never be consumed, so do not store it.
        if self.requests.lock().remove(&id).is_none() {
            return;
        }
        trace!("io: complete {id}");
        self.results.lock().insert(id, result);
        self.wake.notify();
    }

    /// Body of an I/O worker thread.
    pub fn worker_loop(&self) {
        loop {
            let mut interaction = {
                let mut state = self.state.lock().expect("io queue poisoned");
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    // Pick the first queued interaction whose fd is free, to
                    // keep per-fd submission order.
                    let slot = state
                        .queue
                        .iter()
                        .position(|work| !state.busy.contains(&work.id().fd));
                    match slot {
                        Some(index) => {
                            let work = state.queue.remove(index).expect("index is valid");
                            state.busy.insert(work.id().fd);
                            break work;
                        }
                        None => {
                            let (next, _) = self
                                .work_available
                                .wait_timeout(state, Duration::from_millis(50))
                                .expect("io queue poisoned");
                            state = next;
                        }
                    }
                }
            };

            let id = interaction.id();
            let result = interaction.interact();
            self.complete(id, result);

            let mut state = self.state.lock().expect("io queue poisoned");
            state.busy.remove(&id.fd);
            drop(state);
            self.work_available.notify_all();
        }
    }

    /// Stop the workers and cancel everything still pending.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let pending: Vec<IoRequestId> = self.requests.lock().keys().copied().collect();
        for id in pending {
            self.cancel(id);
        }
        self.work_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> IoEngine {
        IoEngine::new(Arc::new(WakeSignal::new()))
    }

    #[test]
    fn request_ids_count_per_fd() {
        let engine = engine();
        let a = engine.next_id(3);
        let b = engine.next_id(3);
        let c = engine.next_id(4);
        assert_eq!(a.fd, 3);
        assert_eq!(a.counter + 1, b.counter);
        assert_eq!(c.counter, 1);
    }

    #[test]
    fn cancelling_a_queued_request_removes_it_from_tracking() {
        let engine = engine();
        // No worker is running, so the interaction stays queued.
        let id = engine.submit_read(0, 16);
        assert!(engine.is_tracked(id));

        engine.cancel(id);
        assert!(!engine.is_tracked(id));
        assert!(engine.state.lock().unwrap().queue.is_empty());
    }

    #[test]
    fn cancel_is_idempotent() {
        let engine = engine();
        let id = engine.submit_read(0, 16);
        engine.cancel(id);
        engine.cancel(id);
        assert!(!engine.is_tracked(id));
    }

    #[test]
    fn empty_interaction_completes_with_void() {
        let mut empty = IoEmpty {
            id: IoRequestId { fd: 9, counter: 1 },
            cancel: CancelFlag::new(),
        };
        match empty.interact() {
            InteractionResult::Success(value) => assert!(value.is_void()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn cancelled_interaction_reports_cancel() {
        let cancel = CancelFlag::new();
        let mut read = IoRead {
            id: IoRequestId { fd: 9, counter: 1 },
            fd: 9,
            limit: 4,
            cancel: cancel.clone(),
        };
        cancel.set();
        assert!(matches!(read.interact(), InteractionResult::Cancelled));
    }
}
