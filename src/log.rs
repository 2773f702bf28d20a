use backtrace::Backtrace;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

/// Verbosity of the agent, 0..=4. Checked on every log call so it has to be
/// a plain atomic, not a field behind the writer lock.
///
/// 0 - silent, 1 - ordinary messages, 2 - state transitions and semaphore
/// traffic, 3 - per-event queue traffic, 4 - per-packet traffic.
static LEVEL: AtomicI32 = AtomicI32::new(0);

struct LogGlobals {
    // Possibly buffered
    log_file: Box<dyn Write + Send>,
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let mut f: Box<dyn Write + Send>;
        if let Ok(filename) = env::var("DITRACE_LOG_FILE") {
            f = Box::new(File::create(filename).unwrap());
        } else if let Ok(append_filename) = env::var("DITRACE_APPEND_LOG_FILE") {
            f = Box::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(append_filename)
                    .unwrap(),
            );
        } else {
            f = Box::new(io::stderr());
        }

        if let Ok(buf_size) = env::var("DITRACE_LOG_BUFFER") {
            let log_buffer_size = buf_size.parse::<usize>().unwrap();
            f = Box::new(BufWriter::with_capacity(log_buffer_size, f));
        }

        Mutex::new(LogGlobals { log_file: f })
    };
}

pub fn set_level(level: i32) {
    LEVEL.store(level, Ordering::Relaxed);
}

pub fn level() -> i32 {
    LEVEL.load(Ordering::Relaxed)
}

pub fn enabled(at: i32) -> bool {
    LEVEL.load(Ordering::Relaxed) >= at
}

/// Raise verbosity to 1 (or drop back to 0) at the client's request.
/// A level above 1 was chosen on the command line and is left alone.
pub fn set_client_logging(on: bool) {
    if level() <= 1 {
        set_level(if on { 1 } else { 0 });
    }
}

pub fn write_line(args: std::fmt::Arguments) {
    let mut l = LOG_GLOBALS.lock().unwrap();
    l.log_file.write_fmt(args).unwrap();
    l.log_file.write_all(b"\n").unwrap();
    l.log_file.flush().unwrap();
}

#[macro_export]
macro_rules! msg {
    ($($args:tt)*) => {{
        if $crate::log::enabled(1) {
            $crate::log::write_line(format_args!($($args)*));
        }
    }};
}

#[macro_export]
macro_rules! debug_msg {
    ($lvl:expr, $($args:tt)*) => {{
        if $crate::log::enabled($lvl) {
            $crate::log::write_line(format_args!($($args)*));
        }
    }};
}

#[macro_export]
macro_rules! fatal {
    ($($args:tt)+) => {{
        $crate::log::write_line(format_args!($($args)+));
        $crate::log::notifying_abort(backtrace::Backtrace::new());
    }};
}

pub fn notifying_abort(bt: Backtrace) -> ! {
    dump_agent_stack(bt);
    std::process::abort();
}

fn dump_agent_stack(bt: Backtrace) {
    write!(io::stderr(), "=== Start agent backtrace:\n").unwrap();
    write!(io::stderr(), "{:?}", bt).unwrap();
    write!(io::stderr(), "=== End agent backtrace\n").unwrap();
}
