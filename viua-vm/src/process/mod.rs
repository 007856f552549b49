//! Green processes.
//!
//! A process is a userspace task multiplexed onto the scheduler worker
//! threads. It owns its call stacks (the main one plus ephemeral stacks for
//! deferred calls in flight), its global and static register sets, and its
//! dynamically allocated memory regions. The mailbox lives in the kernel, not
//! here; messages drain into the local queue on RECEIVE.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::frame::Frame;
use crate::pid::Pid;
use crate::registers::RegisterSet;
use crate::stack::Stack;
use crate::value::{fault, tags, Addr, Value};

/// What a suspended process is waiting for. Deadlines are absolute; `None`
/// means wait forever.
#[derive(Debug, Clone, Copy)]
pub enum WaitState {
    /// RECEIVE: a message in the mailbox.
    Message { deadline: Option<Instant> },
    /// JOIN: the target process stopping.
    Join { pid: Pid, deadline: Option<Instant> },
    /// IO_WAIT: completion of a request.
    Io {
        request: crate::value::IoRequestId,
        deadline: Option<Instant>,
    },
    /// A foreign call in flight on the FFI workers.
    ForeignCall { request: u64 },
}

impl WaitState {
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            WaitState::Message { deadline } => *deadline,
            WaitState::Join { deadline, .. } => *deadline,
            WaitState::Io { deadline, .. } => *deadline,
            WaitState::ForeignCall { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum ProcessState {
    /// On some scheduler's queue, ready to run.
    Runnable,
    /// Held by a scheduler thread right now.
    Running,
    /// Waiting for a wake event; stays on the queue and is re-examined when
    /// popped.
    Suspended(WaitState),
    /// Finished normally with a return value.
    TerminatedOk(Value),
    /// Killed by an uncaught exception.
    TerminatedErr(Value),
}

impl ProcessState {
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            ProcessState::TerminatedOk(_) | ProcessState::TerminatedErr(_)
        )
    }
}

/// A memory region created by the allocation instructions. Automatic regions
/// are freed with their frame, dynamic ones with the process.
#[derive(Debug)]
pub struct MemoryRegion {
    pub bytes: Vec<u8>,
    /// Liveness token shared with pointers into the region.
    pub token: Arc<AtomicBool>,
}

impl MemoryRegion {
    pub fn new(size: usize) -> MemoryRegion {
        MemoryRegion {
            bytes: vec![0; size],
            token: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.token.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct Process {
    pid: Pid,
    /// Index 0 is the main stack; the rest are ephemeral deferred stacks.
    pub stacks: Vec<Stack>,
    pub active_stack: usize,
    /// Stack indices to resume when an ephemeral stack drains, innermost
    /// last.
    pub returns_to: Vec<usize>,
    pub state: ProcessState,
    /// Function spawned if this process dies of an uncaught exception.
    watchdog: Option<String>,
    /// Messages already drained from the kernel mailbox.
    pub message_queue: VecDeque<Value>,
    pub globals: RegisterSet,
    /// Static register sets, one per function entry.
    statics: HashMap<Addr, RegisterSet>,
    regions: HashMap<u64, MemoryRegion>,
    next_region: u64,
    /// The in-flight foreign call, if any. At most one per process.
    pub foreign_call: Option<u64>,
    /// The wait state of the instruction currently blocked, kept across
    /// wake-ups so a deadline is computed once, not per retry.
    pub wait_memo: Option<WaitState>,
}

/// Capacity of global and static register sets, created on demand.
const AMBIENT_SET_CAPACITY: usize = 256;

impl Process {
    pub fn new(pid: Pid, frame: Frame) -> Process {
        Process {
            pid,
            stacks: vec![Stack::with_frame(frame)],
            active_stack: 0,
            returns_to: Vec::new(),
            state: ProcessState::Runnable,
            watchdog: None,
            message_queue: VecDeque::new(),
            globals: RegisterSet::new(AMBIENT_SET_CAPACITY),
            statics: HashMap::new(),
            regions: HashMap::new(),
            next_region: 1,
            foreign_call: None,
            wait_memo: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn stack(&self) -> &Stack {
        &self.stacks[self.active_stack]
    }

    pub fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stacks[self.active_stack]
    }

    /// Begin running a deferred call on a fresh ephemeral stack. The owning
    /// stack must already be marked suspended with its removal pending.
    pub fn enter_deferred_stack(&mut self, frame: Frame) -> Result<(), Value> {
        let stack = Stack::with_frame(frame);
        self.returns_to.push(self.active_stack);
        self.stacks.push(stack);
        self.active_stack = self.stacks.len() - 1;
        Ok(())
    }

    /// Tear down a drained ephemeral stack and make its owner active again.
    /// Returns false when the active stack is the main one.
    pub fn leave_deferred_stack(&mut self) -> bool {
        if self.active_stack == 0 {
            return false;
        }
        // Ephemeral stacks are strictly LIFO: the active one is the newest.
        self.stacks.pop();
        self.active_stack = self
            .returns_to
            .pop()
            .expect("an ephemeral stack always records its owner");
        true
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.state, ProcessState::Suspended(_))
    }

    pub fn suspend(&mut self, wait: WaitState) {
        self.state = ProcessState::Suspended(wait);
    }

    pub fn resume(&mut self) {
        self.state = ProcessState::Runnable;
    }

    pub fn watchdog(&self) -> Option<&str> {
        self.watchdog.as_deref()
    }

    /// Register the watchdog. A process gets exactly one.
    pub fn set_watchdog(&mut self, function: String) -> Result<(), Value> {
        if self.watchdog.is_some() {
            return Err(fault(
                tags::TYPE_ERROR,
                "process already has a watchdog",
            ));
        }
        self.watchdog = Some(function);
        Ok(())
    }

    /// The static register set of a function, if it has one already.
    pub fn statics(&self, entry: Addr) -> Option<&RegisterSet> {
        self.statics.get(&entry)
    }

    /// The static register set of a function, created on first access.
    pub fn statics_for(&mut self, entry: Addr) -> &mut RegisterSet {
        self.statics
            .entry(entry)
            .or_insert_with(|| RegisterSet::new(AMBIENT_SET_CAPACITY))
    }

    /// Allocate a memory region; returns its id.
    pub fn allocate_region(&mut self, size: usize) -> u64 {
        let id = self.next_region;
        self.next_region += 1;
        self.regions.insert(id, MemoryRegion::new(size));
        id
    }

    pub fn region(&self, id: u64) -> Option<&MemoryRegion> {
        self.regions.get(&id)
    }

    pub fn region_mut(&mut self, id: u64) -> Option<&mut MemoryRegion> {
        self.regions.get_mut(&id)
    }

    /// Free a region, revoking pointers into it.
    pub fn free_region(&mut self, id: u64) {
        self.regions.remove(&id);
    }

    /// Locate a register set anywhere in this process by its id. Used to
    /// resolve register pointers, whose liveness token guarantees the set is
    /// still around when this is called.
    pub fn find_set(&self, id: u64) -> Option<SetRef<'_>> {
        if self.globals.set_id() == id {
            return Some(SetRef::Plain(&self.globals));
        }
        for set in self.statics.values() {
            if set.set_id() == id {
                return Some(SetRef::Plain(set));
            }
        }
        for stack in &self.stacks {
            if let Some(pending) = &stack.pending_frame {
                if pending.arguments.set_id() == id {
                    return Some(SetRef::Plain(&pending.arguments));
                }
            }
            for frame in &stack.frames {
                if frame.locals.set_id() == id {
                    return Some(SetRef::Plain(&frame.locals));
                }
                if frame.arguments.set_id() == id {
                    return Some(SetRef::Plain(&frame.arguments));
                }
                if let Some(captures) = &frame.captures {
                    if captures.lock().set_id() == id {
                        return Some(SetRef::Shared(Arc::clone(captures)));
                    }
                }
            }
        }
        None
    }

    /// Mutable variant of [`Process::find_set`].
    pub fn find_set_mut(&mut self, id: u64) -> Option<SetMut<'_>> {
        if self.globals.set_id() == id {
            return Some(SetMut::Plain(&mut self.globals));
        }
        for set in self.statics.values_mut() {
            if set.set_id() == id {
                return Some(SetMut::Plain(set));
            }
        }
        for stack in &mut self.stacks {
            if let Some(pending) = &mut stack.pending_frame {
                if pending.arguments.set_id() == id {
                    return Some(SetMut::Plain(&mut pending.arguments));
                }
            }
            for frame in &mut stack.frames {
                if frame.locals.set_id() == id {
                    return Some(SetMut::Plain(&mut frame.locals));
                }
                if frame.arguments.set_id() == id {
                    return Some(SetMut::Plain(&mut frame.arguments));
                }
                if let Some(captures) = &frame.captures {
                    if captures.lock().set_id() == id {
                        return Some(SetMut::Shared(Arc::clone(captures)));
                    }
                }
            }
        }
        None
    }
}

/// A register set found by id: either borrowed in place or shared through a
/// closure's capture lock.
pub enum SetRef<'a> {
    Plain(&'a RegisterSet),
    Shared(Arc<spinning_top::Spinlock<RegisterSet>>),
}

/// Mutable counterpart of [`SetRef`].
pub enum SetMut<'a> {
    Plain(&'a mut RegisterSet),
    Shared(Arc<spinning_top::Spinlock<RegisterSet>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pid::PidEmitter;
    use crate::value::Addr;

    fn test_process() -> Process {
        let frame = Frame::new(Addr::new(0, 0), None, RegisterSet::new(0));
        Process::new(PidEmitter::new().emit(), frame)
    }

    #[test]
    fn deferred_stacks_nest_and_unwind_in_order() {
        let mut proc = test_process();
        assert_eq!(proc.active_stack, 0);

        proc.enter_deferred_stack(Frame::new(Addr::new(0, 4), None, RegisterSet::new(0)))
            .unwrap();
        assert_eq!(proc.active_stack, 1);

        proc.enter_deferred_stack(Frame::new(Addr::new(0, 8), None, RegisterSet::new(0)))
            .unwrap();
        assert_eq!(proc.active_stack, 2);

        assert!(proc.leave_deferred_stack());
        assert_eq!(proc.active_stack, 1);
        assert!(proc.leave_deferred_stack());
        assert_eq!(proc.active_stack, 0);
        assert!(!proc.leave_deferred_stack());
    }

    #[test]
    fn watchdog_registers_once() {
        let mut proc = test_process();
        assert!(proc.set_watchdog("guard".into()).is_ok());
        assert!(proc.set_watchdog("other".into()).is_err());
        assert_eq!(proc.watchdog(), Some("guard"));
    }

    #[test]
    fn freed_regions_revoke_their_token() {
        let mut proc = test_process();
        let id = proc.allocate_region(16);
        let token = proc.region(id).unwrap().token.clone();
        assert!(token.load(Ordering::Acquire));
        proc.free_region(id);
        assert!(!token.load(Ordering::Acquire));
    }
}
