//! Process schedulers: the worker threads that run green processes.
//!
//! Each scheduler owns one run queue in the kernel. The loop pops the front
//! process, runs it for a burst of [`PREEMPTION_THRESHOLD`] instructions
//! (greedy bundles excepted), and then either records its death, rotates it
//! to the back of the queue, or leaves it parked in a wait state. Suspended
//! processes stay on the queue; their wake condition is polled against the
//! kernel when they reach the front again.
//!
//! An idle scheduler steals work: the kernel donates up to half of a busy
//! peer's queue, preferring the scheduler that spawned most recently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::interpreter::{self, ExecCtx};
use crate::kernel::Kernel;
use crate::process::{Process, ProcessState, WaitState};

/// Instructions per scheduling burst.
pub const PREEMPTION_THRESHOLD: usize = 2048;

/// Soft cap on a run queue; beyond it the scheduler advertises itself as a
/// steal victim.
pub const RUN_QUEUE_SOFT_CAP: usize = 256;

/// How long an idle scheduler parks before re-checking for work.
const IDLE_WAIT: Duration = Duration::from_millis(2);

pub struct ProcessScheduler {
    id: usize,
    kernel: Arc<Kernel>,
    /// Consecutive pops that yielded nothing runnable; resets on progress.
    fruitless_rotations: usize,
}

impl ProcessScheduler {
    pub fn new(id: usize, kernel: Arc<Kernel>) -> ProcessScheduler {
        ProcessScheduler {
            id,
            kernel,
            fruitless_rotations: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The scheduler thread body.
    pub fn run(&mut self) {
        debug!("scheduler {} starting", self.id);
        loop {
            match self.kernel.pop_from(self.id) {
                Some(process) => self.schedule(process),
                None => {
                    if self.kernel.is_shutting_down() {
                        break;
                    }
                    let stolen = self.kernel.steal_processes(self.id);
                    if stolen.is_empty() {
                        self.kernel.wake.wait_timeout(IDLE_WAIT);
                    } else {
                        self.adopt(stolen);
                    }
                }
            }
        }
        debug!("scheduler {} exiting", self.id);
    }

    fn adopt(&mut self, stolen: VecDeque<Box<Process>>) {
        self.fruitless_rotations = 0;
        for process in stolen {
            self.kernel.push_to(self.id, process);
        }
    }

    fn schedule(&mut self, mut process: Box<Process>) {
        if let ProcessState::Suspended(wait) = &process.state {
            if let Some(sleep) = self.still_waiting(&process, wait) {
                // Not wakeable yet; rotate to the back of the queue. When a
                // whole pass over the queue makes no progress, park instead
                // of spinning.
                let queue_len = self.kernel.queue_len(self.id) + 1;
                self.fruitless_rotations += 1;
                self.kernel.push_to(self.id, process);
                if self.fruitless_rotations >= queue_len {
                    self.kernel.wake.wait_timeout(sleep.min(IDLE_WAIT));
                }
                return;
            }
            process.resume();
        }

        self.fruitless_rotations = 0;
        process.state = ProcessState::Running;
        let ctx = ExecCtx {
            kernel: &self.kernel,
            scheduler: self.id,
        };
        interpreter::run(&mut process, &ctx, PREEMPTION_THRESHOLD);

        match &process.state {
            ProcessState::TerminatedOk(_) | ProcessState::TerminatedErr(_) => {
                trace!("scheduler {}: process {} stopped", self.id, process.pid());
                self.kernel.record_process_result(process, self.id);
            }
            ProcessState::Running => {
                // Burst expired without suspension; preempt to the back.
                process.state = ProcessState::Runnable;
                self.kernel.push_to(self.id, process);
            }
            _ => self.kernel.push_to(self.id, process),
        }
    }

    /// Whether a wait state is still unsatisfied. Returns how long the
    /// process may keep sleeping (until its deadline) if so.
    fn still_waiting(&self, process: &Process, wait: &WaitState) -> Option<Duration> {
        let now = Instant::now();
        let deadline_passed = wait
            .deadline()
            .map(|deadline| deadline <= now)
            .unwrap_or(false);
        if deadline_passed {
            // Wake the process so the blocked instruction can fail with its
            // timeout error.
            return None;
        }

        let fulfilled = match wait {
            WaitState::Message { .. } => {
                !process.message_queue.is_empty()
                    || self.kernel.mailbox_len(process.pid()) > 0
            }
            WaitState::Join { pid, .. } => {
                self.kernel.is_process_stopped(*pid) || !self.kernel.is_process_joinable(*pid)
            }
            WaitState::Io { request, .. } => {
                self.kernel.io.is_complete(*request) || !self.kernel.io.is_tracked(*request)
            }
            WaitState::ForeignCall { request } => self.kernel.ffi.result_ready(*request),
        };
        if fulfilled {
            return None;
        }

        Some(
            wait.deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(IDLE_WAIT),
        )
    }
}
