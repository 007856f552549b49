//! Foreign function dispatch.
//!
//! Foreign functions run on a dedicated worker pool so a slow native call can
//! never stall a process scheduler. A process calling a foreign function
//! suspends, its prepared arguments travel to a worker inside a
//! `ForeignCall`, and the result (or thrown exception value) comes back
//! through a result map keyed by request id.
//!
//! Native modules plug in through [`register_exports`], which consumes the
//! `exports()`-shaped record array foreign modules advertise. The VM never
//! dlopens anything itself.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace};
use spinning_top::Spinlock;

use crate::kernel::{Kernel, WakeSignal};
use crate::pid::Pid;
use crate::registers::RegisterSet;
use crate::value::{fault, tags, Value};

/// Everything a foreign function receives: the caller's PID and the argument
/// registers prepared by FRAME.
pub struct ForeignCall {
    pub pid: Pid,
    pub arguments: RegisterSet,
}

/// A native function callable from bytecode. Returns the value for the
/// caller's result register, or a boxed exception value to throw in the
/// caller.
pub type ForeignFunction = fn(&Kernel, &mut ForeignCall) -> Result<Value, Value>;

/// One record of a foreign module's `exports()` table.
pub struct ExportRecord {
    pub name: &'static str,
    pub function: ForeignFunction,
}

struct ForeignRequest {
    id: u64,
    function: ForeignFunction,
    call: ForeignCall,
}

/// The request queue and function table serviced by the FFI workers.
pub struct FfiEngine {
    functions: Spinlock<HashMap<String, ForeignFunction>>,
    queue: Mutex<VecDeque<ForeignRequest>>,
    work_available: Condvar,
    results: Spinlock<HashMap<u64, Result<Value, Value>>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    wake: Arc<WakeSignal>,
}

impl FfiEngine {
    pub fn new(wake: Arc<WakeSignal>) -> FfiEngine {
        FfiEngine {
            functions: Spinlock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            results: Spinlock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            wake,
        }
    }

    pub fn register(&self, name: &str, function: ForeignFunction) {
        debug!("ffi: registering {name}");
        self.functions.lock().insert(name.to_string(), function);
    }

    pub fn is_foreign(&self, name: &str) -> bool {
        self.functions.lock().contains_key(name)
    }

    /// Queue a call. Returns the request id, or the name back if no such
    /// function is registered.
    pub fn submit(&self, name: &str, call: ForeignCall) -> Result<u64, ForeignCall> {
        let Some(function) = self.functions.lock().get(name).copied() else {
            return Err(call);
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!("ffi: submit {name} as request {id}");
        let mut queue = self.queue.lock().expect("ffi queue poisoned");
        queue.push_back(ForeignRequest { id, function, call });
        drop(queue);
        self.work_available.notify_one();
        Ok(id)
    }

    pub fn result_ready(&self, id: u64) -> bool {
        self.results.lock().contains_key(&id)
    }

    pub fn take_result(&self, id: u64) -> Option<Result<Value, Value>> {
        self.results.lock().remove(&id)
    }

    /// Body of an FFI worker thread.
    pub fn worker_loop(&self, kernel: &Kernel) {
        loop {
            let request = {
                let mut queue = self.queue.lock().expect("ffi queue poisoned");
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    match queue.pop_front() {
                        Some(request) => break request,
                        None => {
                            let (next, _) = self
                                .work_available
                                .wait_timeout(queue, Duration::from_millis(50))
                                .expect("ffi queue poisoned");
                            queue = next;
                        }
                    }
                }
            };

            let ForeignRequest {
                id,
                function,
                mut call,
            } = request;
            let outcome = function(kernel, &mut call);
            self.results.lock().insert(id, outcome);
            self.wake.notify();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.work_available.notify_all();
    }
}

/// Register a foreign module's export table.
pub fn register_exports(engine: &FfiEngine, records: &[ExportRecord]) {
    for record in records {
        engine.register(record.name, record.function);
    }
}

/// `std::io::print`: write the first argument to stdout, with a newline.
fn std_io_print(_: &Kernel, call: &mut ForeignCall) -> Result<Value, Value> {
    let value = call.arguments.take(0)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{value}")
        .map_err(|e| fault(tags::IO_ERROR, e.to_string()))?;
    Ok(Value::Void)
}

/// The built-in foreign module, always present.
pub const BUILTIN_EXPORTS: &[ExportRecord] = &[ExportRecord {
    name: "std::io::print",
    function: std_io_print,
}];
