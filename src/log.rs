//! File-backed logging.
//!
//! Everything lands in `~/.foreman/foreman.log`; the host owns the
//! terminal, so nothing is ever printed. The file is truncated on init
//! and the default threshold is INFO. Setting `FOREMAN_DEBUG=1` (or
//! passing `debug` to [`init_with_debug`]) lowers it to DEBUG.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Initialize logging with the threshold taken from the environment.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging, forcing the DEBUG threshold when `debug` is set.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("FOREMAN_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let threshold = if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    THRESHOLD.store(threshold as u8, Ordering::SeqCst);

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".foreman")) {
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("foreman.log");
        // One file per run.
        let _ = std::fs::write(&path, "");
        let _ = LOG_PATH.set(path);
    }
}

fn enabled(level: LogLevel) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

fn write_line(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        // init() was never called; stay silent.
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.label(), msg);
    }
}

pub fn log(msg: &str) {
    write_line(LogLevel::Info, msg);
}

pub fn error(msg: &str) {
    write_line(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    write_line(LogLevel::Warn, msg);
}

pub fn debug(msg: &str) {
    write_line(LogLevel::Debug, msg);
}

/// Log at INFO level.
#[macro_export]
macro_rules! flog {
    ($($arg:tt)*) => {
        $crate::log::log(&format!($($arg)*))
    };
}

/// Log at ERROR level.
#[macro_export]
macro_rules! flog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

/// Log at WARN level.
#[macro_export]
macro_rules! flog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG level; dropped unless debug mode is on.
#[macro_export]
macro_rules! flog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}
