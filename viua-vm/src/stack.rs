//! Call stacks, try-frames, and the frame-removal state machine.
//!
//! A process owns one or more stacks: the main stack plus an ephemeral stack
//! per deferred call in flight. Removing a frame (by return, tail call, or
//! unwinding) is not atomic: the frame's deferred calls must run first, each
//! on its own ephemeral stack. The owning stack parks in
//! `SuspendedByDeferredOnFramePop` with the removal recorded in
//! `pending_removal`, and the interpreter resumes the removal when the
//! ephemeral stack drains.

use std::sync::Arc;

use spinning_top::Spinlock;

use crate::frame::{Frame, PendingFrame};
use crate::registers::RegisterSet;
use crate::value::{fault, tags, Addr, Atom, Value};

/// Frames per stack before `Stack_overflow`.
pub const MAX_FRAMES: usize = 8192;

/// Why the top frame is being removed.
#[derive(Debug)]
pub enum Removal {
    /// RETURN: pop and deliver the value to the caller's chosen register.
    Return { value: Value },
    /// TAILCALL: replace the top frame in place, keeping its return address
    /// and result register.
    Tailcall {
        entry: Addr,
        arguments: RegisterSet,
        captures: Option<Arc<Spinlock<RegisterSet>>>,
    },
    /// THROW: unwind frames until the handler's depth (or the whole stack
    /// when no handler matched).
    Unwind {
        exception: Value,
        handler: Option<Handler>,
    },
}

/// Where an unwind lands.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    /// The call-frame depth the matching try-frame is bound to; unwinding
    /// stops when this frame is on top.
    pub frame_depth: usize,
    pub block: Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Ready,
    /// Deferred calls of a frame under removal are running on an ephemeral
    /// stack; this stack resumes when they finish.
    SuspendedByDeferredOnFramePop,
}

/// A try/catch region bound to a call frame.
#[derive(Debug)]
pub struct TryFrame {
    /// Index of the call frame this try-frame protects.
    pub frame_depth: usize,
    /// Tag → handler block, in registration order.
    pub catches: Vec<(Atom, Addr)>,
    /// Where LEAVE returns to; set by ENTER.
    pub return_ip: Option<Addr>,
}

#[derive(Debug)]
pub struct Stack {
    pub ip: Addr,
    pub frames: Vec<Frame>,
    pub try_frames: Vec<TryFrame>,
    /// Prepared by FRAME, consumed by the next call-like instruction.
    pub pending_frame: Option<PendingFrame>,
    /// The exception delivered to a handler, picked up by DRAW.
    pub caught: Option<Value>,
    pub state: StackState,
    /// Set while a frame removal waits for deferred calls to finish.
    pub pending_removal: Option<Removal>,
}

impl Stack {
    /// A stack whose bottom frame is already in place.
    pub fn with_frame(frame: Frame) -> Stack {
        let ip = frame.entry;
        Stack {
            ip,
            frames: vec![frame],
            try_frames: Vec::new(),
            pending_frame: None,
            caught: None,
            state: StackState::Ready,
            pending_removal: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn back(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn back_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn push_frame(&mut self, frame: Frame) -> Result<(), Value> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(fault(
                tags::STACK_OVERFLOW,
                format!("stack exceeds {MAX_FRAMES} frames"),
            ));
        }
        self.ip = frame.entry;
        self.frames.push(frame);
        Ok(())
    }

    /// The newest try-frame, where CATCH and ENTER register themselves.
    pub fn newest_try_frame_mut(&mut self) -> Option<&mut TryFrame> {
        self.try_frames.last_mut()
    }

    /// Find the handler for an exception: try-frames newest to oldest, each
    /// catch-table in registration order.
    pub fn find_handler(&self, matches: impl Fn(&Atom) -> bool) -> Option<Handler> {
        for try_frame in self.try_frames.iter().rev() {
            for (tag, block) in &try_frame.catches {
                if matches(tag) {
                    return Some(Handler {
                        frame_depth: try_frame.frame_depth,
                        block: *block,
                    });
                }
            }
        }
        None
    }

    /// Drop try-frames bound to frames at or above `depth`; used while
    /// unwinding past their frames.
    pub fn drop_try_frames_at(&mut self, depth: usize) {
        self.try_frames.retain(|t| t.frame_depth < depth);
    }
}
