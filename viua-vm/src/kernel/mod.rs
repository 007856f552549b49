//! The kernel: the process-wide registry shared by every scheduler.
//!
//! The kernel owns loaded modules and their function address maps, the
//! mailbox and result-slot maps, the per-scheduler run queues, the I/O and
//! FFI engines, and the counters that drive shutdown. Mailboxes live here
//! rather than on processes so senders never have to chase a process across
//! schedulers while migration is in flight.

pub mod mailbox;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use spinning_top::Spinlock;

use crate::ffi::{self, FfiEngine};
use crate::frame::Frame;
use crate::io::IoEngine;
use crate::loader::{LoadError, Module};
use crate::pid::{Pid, PidEmitter};
use crate::process::{Process, ProcessState};
use crate::registers::RegisterSet;
use crate::scheduler::{ProcessScheduler, RUN_QUEUE_SOFT_CAP};
use crate::value::{Addr, Atom, Value};

use mailbox::{Mailbox, ProcessResult};

/// A broadcast wake-up channel. Schedulers park on it when idle; message
/// sends, I/O completions, FFI completions, spawns, and deaths all notify it.
pub struct WakeSignal {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl WakeSignal {
    pub fn new() -> WakeSignal {
        WakeSignal {
            generation: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock().expect("wake signal poisoned");
        *generation += 1;
        self.cv.notify_all();
    }

    /// Park until a notification or the timeout, whichever comes first.
    pub fn wait_timeout(&self, timeout: Duration) {
        let generation = self.generation.lock().expect("wake signal poisoned");
        let _ = self
            .cv
            .wait_timeout(generation, timeout)
            .expect("wake signal poisoned");
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// VM configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub process_schedulers: usize,
    pub ffi_schedulers: usize,
    pub io_schedulers: usize,
    pub library_path: Vec<PathBuf>,
}

impl Config {
    /// Defaults: `min(NCPU, 4)` process schedulers, 2 FFI workers, 2 I/O
    /// workers. Overridable via `VIUA_PROC_SCHEDULERS`, `VIUA_FFI_SCHEDULERS`,
    /// `VIUA_IO_SCHEDULERS`, and `VIUA_LIBRARY_PATH`.
    pub fn from_env() -> Config {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let env_count = |name: &str, default: usize| {
            std::env::var(name)
                .ok()
                .and_then(|raw| raw.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default)
        };

        let library_path = std::env::var("VIUA_LIBRARY_PATH")
            .map(|raw| raw.split(':').map(PathBuf::from).collect())
            .unwrap_or_default();

        Config {
            process_schedulers: env_count("VIUA_PROC_SCHEDULERS", ncpu.min(4)),
            ffi_schedulers: env_count("VIUA_FFI_SCHEDULERS", 2),
            io_schedulers: env_count("VIUA_IO_SCHEDULERS", 2),
            library_path,
        }
    }
}

pub struct Kernel {
    config: Config,
    modules: Spinlock<Vec<Arc<Module>>>,
    loaded_names: Spinlock<HashSet<String>>,
    /// Function name → entry address, merged over all loaded modules.
    functions: Spinlock<HashMap<String, Addr>>,
    /// Exception type registry: child tag → parent tag.
    exception_types: Spinlock<HashMap<String, String>>,

    pids: PidEmitter,
    mailboxes: Spinlock<HashMap<Pid, Arc<Mailbox>>>,
    results: Spinlock<HashMap<Pid, Arc<ProcessResult>>>,
    running: AtomicUsize,
    main_pid: OnceLock<Pid>,

    /// One run queue per process scheduler. Mutated by the owning worker and
    /// by steal operations from its peers.
    run_queues: Vec<Arc<Spinlock<VecDeque<Box<Process>>>>>,
    /// Which schedulers spawned recently; the first victim candidates for
    /// work stealing.
    spawn_hints: Spinlock<VecDeque<usize>>,
    shutdown: AtomicBool,
    pub wake: Arc<WakeSignal>,

    pub io: IoEngine,
    pub ffi: FfiEngine,
}

impl Kernel {
    pub fn new(config: Config) -> Arc<Kernel> {
        let wake = Arc::new(WakeSignal::new());
        let run_queues = (0..config.process_schedulers)
            .map(|_| Arc::new(Spinlock::new(VecDeque::new())))
            .collect();

        let kernel = Kernel {
            config,
            modules: Spinlock::new(Vec::new()),
            loaded_names: Spinlock::new(HashSet::new()),
            functions: Spinlock::new(HashMap::new()),
            exception_types: Spinlock::new(HashMap::new()),
            pids: PidEmitter::new(),
            mailboxes: Spinlock::new(HashMap::new()),
            results: Spinlock::new(HashMap::new()),
            running: AtomicUsize::new(0),
            main_pid: OnceLock::new(),
            run_queues,
            spawn_hints: Spinlock::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
            wake: Arc::clone(&wake),
            io: IoEngine::new(Arc::clone(&wake)),
            ffi: FfiEngine::new(wake),
        };
        ffi::register_exports(&kernel.ffi, ffi::BUILTIN_EXPORTS);
        Arc::new(kernel)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /*
     * Modules and function addresses.
     */

    /// Register an already-parsed module and merge its function symbols.
    pub fn register_module(&self, module: Module) -> u32 {
        let mut modules = self.modules.lock();
        let id = modules.len() as u32;

        let mut functions = self.functions.lock();
        for (name, offset) in &module.functions {
            let addr = Addr::new(id, *offset);
            if functions.contains_key(name) {
                warn!("duplicate function symbol {name}, keeping the first one");
                continue;
            }
            functions.insert(name.clone(), addr);
        }

        modules.push(Arc::new(module));
        id
    }

    /// Resolve a module name via `VIUA_LIBRARY_PATH` and load it. `::` in the
    /// name maps to a path separator.
    pub fn load_module(&self, name: &str) -> Result<(), LoadError> {
        if !self.loaded_names.lock().insert(name.to_string()) {
            return Ok(());
        }

        let relative = PathBuf::from(name.replace("::", "/")).with_extension("viua");
        for directory in &self.config.library_path {
            let candidate = directory.join(&relative);
            if candidate.is_file() {
                let module = Module::load_file(&candidate)?;
                info!("loaded module {name} from {}", candidate.display());
                self.register_module(module);
                return Ok(());
            }
        }

        Err(LoadError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("module {name} not found in library path"),
        )))
    }

    pub fn module(&self, id: u32) -> Option<Arc<Module>> {
        self.modules.lock().get(id as usize).cloned()
    }

    pub fn get_entry_point_of(&self, name: &str) -> Option<Addr> {
        self.functions.lock().get(name).copied()
    }

    /*
     * Exception type registry.
     */

    pub fn register_exception_type(&self, child: &str, parent: &str) {
        self.exception_types
            .lock()
            .insert(child.to_string(), parent.to_string());
    }

    /// The flattened ancestor chain of a tag, nearest parent first.
    pub fn exception_chain_of(&self, tag: &str) -> Vec<Atom> {
        let types = self.exception_types.lock();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = tag;
        while let Some(parent) = types.get(current) {
            if !seen.insert(parent.clone()) {
                break;
            }
            chain.push(Atom::new(parent));
            current = parent;
        }
        chain
    }

    /*
     * Processes.
     */

    /// Create a process around a prepared frame and enqueue it. Disowned
    /// processes get no result slot and can never be joined.
    pub fn spawn(&self, frame: Frame, scheduler: usize, disowned: bool) -> Pid {
        let pid = self.pids.emit();
        self.mailboxes.lock().insert(pid, Arc::new(Mailbox::new()));
        if !disowned {
            self.results.lock().insert(pid, Arc::new(ProcessResult::new()));
        }

        let process = Box::new(Process::new(pid, frame));
        self.running.fetch_add(1, Ordering::AcqRel);
        self.push_to(scheduler, process);
        self.notify_about_process_spawned(scheduler);
        debug!("spawned process {pid} on scheduler {scheduler}");
        pid
    }

    /// Spawn the program's main process.
    pub fn spawn_main(&self, frame: Frame) -> Pid {
        let pid = self.spawn(frame, 0, false);
        self.main_pid.set(pid).expect("main process spawned twice");
        pid
    }

    pub fn main_pid(&self) -> Option<Pid> {
        self.main_pid.get().copied()
    }

    pub fn process_count(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Tear down a finished process: detach its mailbox, publish its result
    /// or hand it to the watchdog, and update the running counter.
    pub fn record_process_result(&self, mut process: Box<Process>, scheduler: usize) {
        let pid = process.pid();
        self.mailboxes.lock().remove(&pid);

        let state = std::mem::replace(&mut process.state, ProcessState::Runnable);
        match state {
            ProcessState::TerminatedOk(value) => {
                if let Some(slot) = self.results.lock().get(&pid) {
                    slot.resolve(value);
                }
            }
            ProcessState::TerminatedErr(exception) => {
                match process.watchdog() {
                    Some(watchdog) => {
                        let name = watchdog.to_string();
                        self.spawn_watchdog(&name, pid, exception, scheduler);
                        // The death was handled; a joiner sees a void result.
                        if let Some(slot) = self.results.lock().get(&pid) {
                            slot.resolve(Value::Void);
                        }
                    }
                    None => match self.results.lock().get(&pid) {
                        Some(slot) => slot.raise(exception),
                        None => error!("disowned process {pid} died: {exception}"),
                    },
                }
            }
            other => {
                unreachable!("recording result of a live process {pid}: {other:?}")
            }
        }

        drop(process);
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            info!("last process finished, shutting down");
            self.shutdown.store(true, Ordering::Release);
        }
        self.wake.notify();
    }

    fn spawn_watchdog(&self, name: &str, dead: Pid, exception: Value, scheduler: usize) {
        let Some(entry) = self.get_entry_point_of(name) else {
            error!("watchdog {name} of process {dead} is not a known function");
            return;
        };

        let mut arguments = RegisterSet::new(1);
        let message = Value::struct_of(
            [
                (Atom::new("cause"), exception),
                (Atom::new("pid"), Value::Uint(dead.get())),
            ]
            .into_iter()
            .collect(),
        );
        arguments
            .set(0, message)
            .expect("watchdog argument set has one slot");

        let frame = Frame::new(entry, None, arguments);
        let watchdog = self.spawn(frame, scheduler, true);
        debug!("watchdog {name} for dead process {dead} spawned as {watchdog}");
    }

    /// Remove a process's result slot, making it unjoinable.
    pub fn detach_process(&self, pid: Pid) {
        self.results.lock().remove(&pid);
    }

    pub fn is_process_joinable(&self, pid: Pid) -> bool {
        self.results.lock().contains_key(&pid)
    }

    pub fn is_process_stopped(&self, pid: Pid) -> bool {
        self.results
            .lock()
            .get(&pid)
            .map(|slot| slot.stopped())
            .unwrap_or(false)
    }

    pub fn is_process_terminated(&self, pid: Pid) -> bool {
        self.results
            .lock()
            .get(&pid)
            .map(|slot| slot.terminated())
            .unwrap_or(false)
    }

    /// Take the exception that killed a process, deleting its result slot.
    pub fn transfer_exception_of(&self, pid: Pid) -> Option<Value> {
        let slot = self.results.lock().remove(&pid)?;
        slot.transfer_exception()
    }

    /// Take a process's return value, deleting its result slot.
    pub fn transfer_result_of(&self, pid: Pid) -> Option<Value> {
        let slot = self.results.lock().remove(&pid)?;
        Some(slot.transfer_result().unwrap_or(Value::Void))
    }

    /*
     * Message passing.
     */

    /// Deliver a value to a mailbox. Messages to dead processes are dropped;
    /// the sender cannot tell, exactly as with a slow receiver.
    pub fn send(&self, pid: Pid, message: Value) {
        let mailbox = self.mailboxes.lock().get(&pid).cloned();
        match mailbox {
            Some(mailbox) => {
                mailbox.send(message);
                self.wake.notify();
            }
            None => debug!("dropping message to dead process {pid}"),
        }
    }

    /// Drain a mailbox into the receiving process's local queue.
    pub fn receive(&self, pid: Pid, into: &mut VecDeque<Value>) {
        let mailbox = self.mailboxes.lock().get(&pid).cloned();
        if let Some(mailbox) = mailbox {
            mailbox.receive(into);
        }
    }

    pub fn mailbox_len(&self, pid: Pid) -> usize {
        self.mailboxes
            .lock()
            .get(&pid)
            .map(|mailbox| mailbox.len())
            .unwrap_or(0)
    }

    /*
     * Run queues and work stealing.
     */

    pub fn scheduler_count(&self) -> usize {
        self.run_queues.len()
    }

    pub fn push_to(&self, scheduler: usize, process: Box<Process>) {
        let queue = &self.run_queues[scheduler];
        let mut queue = queue.lock();
        queue.push_back(process);
        if queue.len() > RUN_QUEUE_SOFT_CAP {
            // Over the soft cap: ask for help instead of hoarding.
            drop(queue);
            self.notify_about_process_spawned(scheduler);
        }
    }

    pub fn pop_from(&self, scheduler: usize) -> Option<Box<Process>> {
        self.run_queues[scheduler].lock().pop_front()
    }

    pub fn queue_len(&self, scheduler: usize) -> usize {
        self.run_queues[scheduler].lock().len()
    }

    pub fn notify_about_process_spawned(&self, scheduler: usize) {
        let mut hints = self.spawn_hints.lock();
        hints.push_back(scheduler);
        if hints.len() > 2 * self.run_queues.len() {
            hints.pop_front();
        }
        drop(hints);
        self.wake.notify();
    }

    /// Donate up to half of a victim's queue to an idle scheduler. The victim
    /// is the most recent spawner, falling back to the longest queue. The
    /// migration happens entirely under the victim's queue lock, so a process
    /// is never visible to two schedulers at once.
    pub fn steal_processes(&self, thief: usize) -> VecDeque<Box<Process>> {
        let victim = {
            let hints = self.spawn_hints.lock();
            hints.iter().rev().find(|id| **id != thief).copied()
        };
        let victim = victim.or_else(|| {
            (0..self.run_queues.len())
                .filter(|id| *id != thief)
                .max_by_key(|id| self.queue_len(*id))
        });

        let Some(victim) = victim else {
            return VecDeque::new();
        };

        let mut queue = self.run_queues[victim].lock();
        let len = queue.len();
        if len < 2 {
            return VecDeque::new();
        }
        let stolen = queue.split_off(len - len / 2);
        debug!(
            "scheduler {thief} stole {} processes from scheduler {victim}",
            stolen.len(),
        );
        stolen
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /*
     * Running a program.
     */

    /// Execute a loaded binary to completion: spawn the main process, start
    /// every worker pool, wait for the process count to reach zero, and
    /// return the exit code.
    pub fn run_binary(self: &Arc<Kernel>, module: Module) -> i32 {
        let entry = module
            .entry
            .or_else(|| module.functions.get("main").copied());
        let module_id = self.register_module(module);

        let Some(entry) = entry else {
            error!("binary has no entry point and no main function");
            return 1;
        };

        let frame = Frame::new(Addr::new(module_id, entry), None, RegisterSet::new(0));
        self.spawn_main(frame);

        let mut scheduler_threads = Vec::new();
        for id in 0..self.config.process_schedulers {
            let kernel = Arc::clone(self);
            let thread = std::thread::Builder::new()
                .name(format!("viua-proc-{id}"))
                .spawn(move || ProcessScheduler::new(id, kernel).run())
                .expect("spawning a scheduler thread");
            scheduler_threads.push(thread);
        }

        let mut ffi_threads = Vec::new();
        for id in 0..self.config.ffi_schedulers {
            let kernel = Arc::clone(self);
            let thread = std::thread::Builder::new()
                .name(format!("viua-ffi-{id}"))
                .spawn(move || kernel.ffi.worker_loop(&kernel))
                .expect("spawning an FFI worker");
            ffi_threads.push(thread);
        }

        let mut io_threads = Vec::new();
        for id in 0..self.config.io_schedulers {
            let kernel = Arc::clone(self);
            let thread = std::thread::Builder::new()
                .name(format!("viua-io-{id}"))
                .spawn(move || kernel.io.worker_loop())
                .expect("spawning an I/O worker");
            io_threads.push(thread);
        }

        while !self.is_shutting_down() {
            self.wake.wait_timeout(Duration::from_millis(50));
        }

        self.io.shutdown();
        self.ffi.shutdown();
        self.wake.notify();

        for thread in scheduler_threads {
            let _ = thread.join();
        }
        for thread in ffi_threads {
            let _ = thread.join();
        }
        // An I/O worker stuck in a blocking syscall cannot be joined; pending
        // work was already cancelled, so the threads are simply left behind.
        drop(io_threads);

        self.exit_code()
    }

    fn exit_code(&self) -> i32 {
        let Some(main) = self.main_pid() else {
            return 1;
        };
        if self.is_process_terminated(main) {
            if let Some(exception) = self.transfer_exception_of(main) {
                eprintln!("uncaught exception in main process: {exception}");
            }
            return 1;
        }
        0
    }
}
