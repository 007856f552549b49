//! The Viua virtual machine.
//!
//! Viua is a register-based VM running a concurrent actor model: programs
//! are green processes with kernel-held mailboxes, multiplexed onto a small
//! pool of scheduler threads with work stealing, with asynchronous I/O and
//! foreign calls handled by separate worker pools.
//!
//! The crate splits along the lines of the runtime:
//!
//! - [`value`], [`bits`], [`registers`]: the value model and register sets
//! - [`frame`], [`stack`]: activation frames, deferred calls, try-frames
//! - [`loader`]: the ELF64 container parsed into a [`loader::Module`]
//! - [`interpreter`]: the dispatch loop and per-opcode semantics
//! - [`process`], [`scheduler`], [`kernel`]: green processes, the worker
//!   threads that run them, and the registry that ties the VM together
//! - [`io`], [`ffi`]: the submission/completion engines
//!
//! The bytecode contract itself (instruction formats, the opcode table) lives
//! in the `viua-arch` crate, shared with external tooling.

pub mod bits;
pub mod ffi;
pub mod frame;
pub mod interpreter;
pub mod io;
pub mod kernel;
pub mod loader;
pub mod logging;
pub mod pid;
pub mod process;
pub mod registers;
pub mod scheduler;
pub mod stack;
pub mod value;

pub use kernel::{Config, Kernel};
pub use loader::Module;
pub use pid::Pid;
pub use value::Value;
