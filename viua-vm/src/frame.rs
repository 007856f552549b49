//! Activation frames.

use std::sync::Arc;

use spinning_top::Spinlock;
use viua_arch::RegisterAccess;

use crate::registers::RegisterSet;
use crate::value::Addr;

/// A function call scheduled to run when its frame is removed.
#[derive(Debug)]
pub struct DeferredCall {
    pub entry: Addr,
    pub arguments: RegisterSet,
    /// Captured set when the deferred target is a closure.
    pub captures: Option<Arc<Spinlock<RegisterSet>>>,
}

/// A frame prepared by FRAME but not yet pushed; CALL, TAILCALL, ACTOR, and
/// DEFER consume it.
#[derive(Debug)]
pub struct PendingFrame {
    pub arguments: RegisterSet,
}

/// A single activation record.
#[derive(Debug)]
pub struct Frame {
    pub entry: Addr,
    /// Where execution continues after this frame pops. The bottom frame of a
    /// stack has none.
    pub return_address: Option<Addr>,
    /// The caller's register that receives the return value.
    pub result_to: RegisterAccess,
    pub arguments: RegisterSet,
    /// Sized by the function's leading ALLOCATE_REGISTERS.
    pub locals: RegisterSet,
    /// Closure-local registers when the callee is a closure. Shared with the
    /// closure value the frame was created from.
    pub captures: Option<Arc<Spinlock<RegisterSet>>>,
    /// Deferred calls registered in this frame; drained LIFO on removal.
    pub deferred: Vec<DeferredCall>,
    /// Automatic memory regions to free when the frame is removed.
    pub auto_regions: Vec<u64>,
}

impl Frame {
    pub fn new(entry: Addr, return_address: Option<Addr>, arguments: RegisterSet) -> Frame {
        Frame {
            entry,
            return_address,
            result_to: RegisterAccess::void(),
            arguments,
            locals: RegisterSet::new(0),
            captures: None,
            deferred: Vec::new(),
            auto_regions: Vec::new(),
        }
    }
}
