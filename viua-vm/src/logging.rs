//! Trace logging.
//!
//! All diagnostics go through the `log` macros. By default only warnings and
//! errors reach stderr; setting `VIUA_VM_TRACE_FD` enables full tracing and
//! redirects it either to an already-open file descriptor (a number) or to a
//! file created at the given path.

use std::fs::File;
use std::io::Write;
use std::mem::ManuallyDrop;
use std::os::fd::FromRawFd;
use std::sync::Mutex;

use log::{LevelFilter, Metadata, Record};

enum Sink {
    Stderr,
    /// An fd inherited from the parent process; never closed by us.
    RawFd(i32),
    File(File),
}

struct Logger {
    sink: Mutex<Sink>,
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}:{}] {}: {}\n",
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.level(),
            record.args(),
        );
        let mut sink = self.sink.lock().expect("log sink poisoned");
        let _ = match &mut *sink {
            Sink::Stderr => std::io::stderr().write_all(line.as_bytes()),
            Sink::RawFd(fd) => {
                let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(*fd) });
                file.write_all(line.as_bytes())
            }
            Sink::File(file) => file.write_all(line.as_bytes()),
        };
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger {
    sink: Mutex::new(Sink::Stderr),
};

/// Install the logger. `VIUA_VM_TRACE_FD` may name a numeric fd or a file
/// path; either enables trace-level output.
pub fn init() {
    let trace_target = std::env::var("VIUA_VM_TRACE_FD").ok();

    let (sink, level) = match trace_target {
        None => (Sink::Stderr, LevelFilter::Warn),
        Some(raw) => match raw.parse::<i32>() {
            Ok(fd) => (Sink::RawFd(fd), LevelFilter::Trace),
            Err(_) => match File::create(&raw) {
                Ok(file) => (Sink::File(file), LevelFilter::Trace),
                Err(e) => {
                    eprintln!("cannot open trace log {raw}: {e}");
                    (Sink::Stderr, LevelFilter::Trace)
                }
            },
        },
    };

    *LOGGER.sink.lock().expect("log sink poisoned") = sink;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
