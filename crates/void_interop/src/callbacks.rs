//! Boundary callbacks
//!
//! The host installs two function pointers at startup: one receives log lines,
//! the other receives caught errors with a fatal flag. Both are invoked
//! synchronously on the thread that hit the condition. The message pointer is
//! only valid for the duration of the call.
//!
//! Everything in the crate logs through the `log` facade; [`BoundaryLogger`]
//! forwards those records to the installed log callback.

use crate::error::{InteropError, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::RwLock;
use std::cell::Cell;
use std::ffi::{c_char, CString};

/// Log callback: `(level, message)`
pub type LogCallback = extern "C" fn(i32, *const c_char);

/// Error callback: `(message, is_fatal)`
pub type ErrorCallback = extern "C" fn(*const c_char, u8);

/// Log levels understood by the host
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Trace | Level::Debug => LogLevel::Trace,
            Level::Info => LogLevel::Info,
            Level::Warn => LogLevel::Warning,
            Level::Error => LogLevel::Error,
        }
    }
}

/// The pair of host function pointers
#[derive(Clone, Copy)]
pub struct BoundaryCallbacks {
    pub log: Option<LogCallback>,
    pub error: Option<ErrorCallback>,
}

static CALLBACKS: RwLock<Option<BoundaryCallbacks>> = RwLock::new(None);

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Install the callbacks. Fails if a pair is already installed.
pub fn install(callbacks: BoundaryCallbacks) -> Result<()> {
    let mut slot = CALLBACKS.write();
    if slot.is_some() {
        return Err(InteropError::InvalidState("boundary callbacks already installed".into()));
    }
    *slot = Some(callbacks);
    Ok(())
}

/// Remove the installed callbacks
pub fn reset() {
    *CALLBACKS.write() = None;
}

/// Whether a callback pair is installed
pub fn is_installed() -> bool {
    CALLBACKS.read().is_some()
}

fn current() -> Option<BoundaryCallbacks> {
    *CALLBACKS.read()
}

/// Run `f` unless this thread is already inside a callback
fn guarded(f: impl FnOnce()) {
    if IN_CALLBACK.with(|flag| flag.replace(true)) {
        return;
    }
    f();
    IN_CALLBACK.with(|flag| flag.set(false));
}

fn to_c_message(message: &str) -> CString {
    CString::new(message.replace('\0', "\\0")).unwrap_or_default()
}

/// Send a line to the host log callback
pub fn emit_log(level: LogLevel, message: &str) {
    let Some(callback) = current().and_then(|c| c.log) else {
        return;
    };
    guarded(|| {
        let message = to_c_message(message);
        callback(level as i32, message.as_ptr());
    });
}

/// Report an error through the host error callback
pub fn emit_error(message: &str, is_fatal: bool) {
    let Some(callback) = current().and_then(|c| c.error) else {
        return;
    };
    guarded(|| {
        let message = to_c_message(message);
        callback(message.as_ptr(), is_fatal as u8);
    });
}

/// Report a caught [`InteropError`], flagging it fatal when its kind demands
pub fn report(err: &InteropError) {
    report_with(err, err.is_fatal());
}

/// Report a caught [`InteropError`] with an explicit fatal flag
pub fn report_with(err: &InteropError, is_fatal: bool) {
    log::debug!("Reporting error across boundary (fatal: {}): {}", is_fatal, err);
    emit_error(&err.to_string(), is_fatal);
}

/// `log` backend that forwards records to the host
pub struct BoundaryLogger {
    level: LevelFilter,
}

impl BoundaryLogger {
    /// Install as the global logger. A logger that is already set is kept.
    pub fn init(level: LevelFilter) {
        let logger = Box::new(BoundaryLogger { level });
        if log::set_boxed_logger(logger).is_ok() {
            log::set_max_level(level);
        }
    }
}

impl Log for BoundaryLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        emit_log(record.level().into(), &format!("{}", record.args()));
    }

    fn flush(&self) {}
}
